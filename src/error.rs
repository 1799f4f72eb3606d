// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalogue error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Clip writer error: {0}")]
    Clip(String),

    #[error("Stream '{id}' not found")]
    StreamNotFound { id: uuid::Uuid },

    #[error("Recording {id} not found")]
    RecordingNotFound { id: i64 },
}

pub type Result<T> = std::result::Result<T, EngineError>;
