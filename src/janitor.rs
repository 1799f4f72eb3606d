// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage janitor.
//!
//! Periodically measures the recordings directory and, when over the cap,
//! evicts the oldest retained clips in batches until usage drops below 80% of
//! the cap. Also sweeps orphans: files that belong to no live recorder and no
//! retained catalogue row.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::catalogue::Catalogue;

/// Supplies the paths of clips currently being written, which the janitor
/// must never touch.
pub type LivePathsFn = Arc<dyn Fn() -> Vec<PathBuf> + Send + Sync>;

/// Eviction batch size per pass.
const EVICT_BATCH: u32 = 20;
/// Eviction stops once usage falls below this fraction of the cap.
const LOW_WATER: f64 = 0.8;
/// Orphans younger than this are left alone; their recorder may still be
/// about to insert a row.
const ORPHAN_MIN_AGE: Duration = Duration::from_secs(600);

pub struct StorageJanitor {
    recordings_dir: PathBuf,
    max_storage_bytes: u64,
    catalogue: Arc<Catalogue>,
    live_paths: LivePathsFn,
}

impl StorageJanitor {
    pub fn new(
        recordings_dir: &Path,
        max_storage_bytes: u64,
        catalogue: Arc<Catalogue>,
        live_paths: LivePathsFn,
    ) -> Self {
        StorageJanitor {
            recordings_dir: recordings_dir.to_path_buf(),
            max_storage_bytes,
            catalogue,
            live_paths,
        }
    }

    /// Run sweeps every `period` until the task is aborted.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                self.sweep_once();
            }
        })
    }

    /// One full pass: size-cap eviction, then orphan cleanup.
    pub fn sweep_once(&self) {
        let live: HashSet<PathBuf> = (self.live_paths)().into_iter().collect();

        let mut total = dir_size(&self.recordings_dir);
        if total > self.max_storage_bytes {
            info!(
                used_gb = format!("{:.2}", total as f64 / 1e9),
                cap_gb = format!("{:.2}", self.max_storage_bytes as f64 / 1e9),
                "Storage over cap, evicting oldest recordings"
            );
            let low_water = (self.max_storage_bytes as f64 * LOW_WATER) as u64;
            'evict: loop {
                let candidates = match self.catalogue.evict_candidates(EVICT_BATCH) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "Failed to query eviction candidates");
                        break;
                    }
                };
                if candidates.is_empty() {
                    break;
                }
                let mut evicted_any = false;
                for cand in candidates {
                    if live.contains(Path::new(&cand.file_path)) {
                        continue;
                    }
                    remove_quiet(Path::new(&cand.file_path));
                    if let Some(thumb) = &cand.thumbnail_path {
                        remove_quiet(Path::new(thumb));
                    }
                    if let Err(e) = self.catalogue.mark_evicted(cand.id) {
                        error!(id = cand.id, error = %e, "Failed to mark row evicted");
                        continue;
                    }
                    evicted_any = true;
                    info!(id = cand.id, path = %cand.file_path, "Evicted old recording");

                    total = dir_size(&self.recordings_dir);
                    if total < low_water {
                        break 'evict;
                    }
                }
                if !evicted_any {
                    // Every candidate in this batch was skipped; a refetch
                    // would return the same rows.
                    break;
                }
            }
        }

        self.sweep_orphans(&live);
    }

    fn db_file_name(&self) -> String {
        self.catalogue
            .db_path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "recordings.db".into())
    }

    /// Delete files with no owner: not a live clip, not referenced by a
    /// retained row, and old enough that no recorder is still about to
    /// register them.
    fn sweep_orphans(&self, live: &HashSet<PathBuf>) {
        let retained = match self.catalogue.retained_paths() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "Failed to query retained paths");
                return;
            }
        };
        let db_name = self.db_file_name();

        for path in list_files(&self.recordings_dir) {
            // The catalogue itself (and its WAL/journal siblings) lives here.
            if file_name_starts_with(&path, &db_name) {
                continue;
            }
            if live.contains(&path) || retained.contains(&path) {
                continue;
            }
            let age = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok());
            match age {
                Some(age) if age >= ORPHAN_MIN_AGE => {
                    warn!(path = %path.display(), "Removing orphaned file");
                    remove_quiet(&path);
                }
                _ => {}
            }
        }
    }
}

/// Total size in bytes of all files beneath `dir`.
pub fn dir_size(dir: &Path) -> u64 {
    list_files(dir)
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&d) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(t) if t.is_dir() => stack.push(path),
                Ok(t) if t.is_file() => files.push(path),
                _ => {}
            }
        }
    }
    files
}

fn file_name_starts_with(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with(prefix))
        .unwrap_or(false)
}

fn remove_quiet(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}
