// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Durable catalogue of finalized recordings.
//!
//! One SQLite file at `<recordings_dir>/recordings.db`. A single shared
//! connection serialized by a mutex: the recorder inserts, the janitor evicts,
//! the API reads. Rows are never deleted by eviction — `retained` flips to 0
//! and the row stays for audit; physical deletion happens only through
//! [`Catalogue::delete`].

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime, Timelike};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;

/// A persisted recording row.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogueRow {
    pub id: i64,
    pub timestamp: String,
    pub stream_id: String,
    pub stream_name: String,
    pub file_path: String,
    pub duration: f64,
    pub objects_detected: serde_json::Value,
    pub thumbnail_path: Option<String>,
    pub confidence: f64,
    pub retained: bool,
}

/// Payload for [`Catalogue::insert`].
#[derive(Debug, Clone)]
pub struct NewRecording {
    /// ISO-8601 wall time of the clip start.
    pub timestamp: String,
    pub stream_id: String,
    pub stream_name: String,
    pub file_path: String,
    pub duration: f64,
    /// JSON array of `{class, confidence, bbox}` entries.
    pub objects_detected: serde_json::Value,
    pub thumbnail_path: Option<String>,
    pub confidence: f64,
}

/// Row filters shared by list/count/alerts/stats.
#[derive(Debug, Clone, Default)]
pub struct RecordingFilter {
    pub stream_id: Option<String>,
    /// Inclusive ISO-8601 lower bound on `timestamp`.
    pub start_date: Option<String>,
    /// Inclusive ISO-8601 upper bound on `timestamp`.
    pub end_date: Option<String>,
    /// Match rows whose detection list contains this class.
    pub object_class: Option<String>,
    pub min_confidence: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Timestamp,
    Confidence,
    Duration,
}

impl SortKey {
    pub fn parse(s: &str) -> Self {
        match s {
            "confidence" => SortKey::Confidence,
            "duration" => SortKey::Duration,
            _ => SortKey::Timestamp,
        }
    }

    fn column(self) -> &'static str {
        match self {
            SortKey::Timestamp => "timestamp",
            SortKey::Confidence => "confidence",
            SortKey::Duration => "duration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("asc") { SortOrder::Asc } else { SortOrder::Desc }
    }

    fn keyword(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Paging window; `limit` is clamped to 1000.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Page { limit: 100, offset: 0 }
    }
}

impl Page {
    fn clamped(self) -> Page {
        Page { limit: self.limit.min(1000), offset: self.offset }
    }
}

/// Alert projection of a row, with per-class counts.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: i64,
    pub timestamp: String,
    pub stream_id: String,
    pub stream_name: String,
    pub confidence: f64,
    pub objects_detected: serde_json::Value,
    pub thumbnail_path: Option<String>,
    pub object_counts: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectStats {
    pub total_recordings: u32,
    pub object_counts: BTreeMap<String, u32>,
    pub object_percentages: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourBucket {
    pub hour: u32,
    pub detections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayBucket {
    pub day: &'static str,
    pub detections: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeStats {
    pub hours: Vec<HourBucket>,
    pub days: Vec<DayBucket>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub recording_count: u32,
    pub total_duration: f64,
    pub latest_recording: Option<String>,
}

/// A row eligible for janitor eviction.
#[derive(Debug, Clone)]
pub struct EvictCandidate {
    pub id: i64,
    pub file_path: String,
    pub thumbnail_path: Option<String>,
}

const DAY_NAMES: [&str; 7] =
    ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday", "Saturday", "Sunday"];

pub struct Catalogue {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Catalogue {
    /// Open (or create) the catalogue database. Schema creation is idempotent.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS recordings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp DATETIME NOT NULL,
                stream_id TEXT NOT NULL,
                stream_name TEXT NOT NULL,
                file_path TEXT NOT NULL,
                duration REAL NOT NULL,
                objects_detected TEXT NOT NULL,
                thumbnail_path TEXT,
                confidence REAL NOT NULL,
                retained BOOLEAN DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_recordings_timestamp ON recordings(timestamp);
            CREATE INDEX IF NOT EXISTS idx_recordings_stream_id ON recordings(stream_id);",
        )?;
        info!(path = %db_path.display(), "Catalogue opened");
        Ok(Catalogue {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Append a finalized recording; returns the assigned row id.
    pub fn insert(&self, rec: &NewRecording) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO recordings
             (timestamp, stream_id, stream_name, file_path, duration,
              objects_detected, thumbnail_path, confidence, retained)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
            rusqlite::params![
                rec.timestamp,
                rec.stream_id,
                rec.stream_name,
                rec.file_path,
                rec.duration,
                rec.objects_detected.to_string(),
                rec.thumbnail_path,
                rec.confidence,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Retained rows matching `filter`, sorted and paged.
    pub fn list(
        &self,
        filter: &RecordingFilter,
        sort: SortKey,
        order: SortOrder,
        page: Page,
    ) -> Result<Vec<CatalogueRow>> {
        let page = page.clamped();
        let (clause, mut params) = where_clause(filter);
        let sql = format!(
            "SELECT id, timestamp, stream_id, stream_name, file_path, duration,
                    objects_detected, thumbnail_path, confidence, retained
             FROM recordings {clause}
             ORDER BY {} {} LIMIT ? OFFSET ?",
            sort.column(),
            order.keyword(),
        );
        params.push(Value::Integer(page.limit as i64));
        params.push(Value::Integer(page.offset as i64));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), row_from_sql)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of retained rows matching `filter`.
    pub fn count(&self, filter: &RecordingFilter) -> Result<u32> {
        let (clause, params) = where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM recordings {clause}");
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(&sql, params_from_iter(params), |r| r.get(0))?;
        Ok(n as u32)
    }

    /// A retained row by id.
    pub fn get(&self, id: i64) -> Result<Option<CatalogueRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, timestamp, stream_id, stream_name, file_path, duration,
                        objects_detected, thumbnail_path, confidence, retained
                 FROM recordings WHERE id = ?1 AND retained = 1",
                [id],
                row_from_sql,
            )
            .optional()?;
        Ok(row)
    }

    /// Remove a row and its files on disk. Returns false when the id does not
    /// exist. Idempotent with respect to the files.
    pub fn delete(&self, id: i64) -> Result<bool> {
        let paths = {
            let conn = self.conn.lock();
            let paths: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT file_path, thumbnail_path FROM recordings WHERE id = ?1",
                    [id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some(paths) = paths else {
                return Ok(false);
            };
            conn.execute("DELETE FROM recordings WHERE id = ?1", [id])?;
            paths
        };

        remove_file_quiet(&paths.0);
        if let Some(thumb) = &paths.1 {
            remove_file_quiet(thumb);
        }
        info!(id, "Recording deleted");
        Ok(true)
    }

    /// Alert view over retained rows: `(total, alerts)`.
    ///
    /// When `filter.object_class` is set, the detection list inside each alert
    /// is narrowed to that class as well.
    pub fn alerts(&self, filter: &RecordingFilter, page: Page) -> Result<(u32, Vec<Alert>)> {
        let total = self.count(filter)?;
        let rows = self.list(filter, SortKey::Timestamp, SortOrder::Desc, page)?;

        let alerts = rows
            .into_iter()
            .map(|row| {
                let mut objects = detection_entries(&row.objects_detected);
                if let Some(class) = &filter.object_class {
                    objects.retain(|(c, _)| c == class);
                }
                let mut object_counts: BTreeMap<String, u32> = BTreeMap::new();
                for (class, _) in &objects {
                    *object_counts.entry(class.clone()).or_insert(0) += 1;
                }
                let objects_detected = serde_json::Value::Array(
                    objects.into_iter().map(|(_, v)| v).collect(),
                );
                Alert {
                    id: row.id,
                    timestamp: row.timestamp,
                    stream_id: row.stream_id,
                    stream_name: row.stream_name,
                    confidence: row.confidence,
                    objects_detected,
                    thumbnail_path: row.thumbnail_path,
                    object_counts,
                }
            })
            .collect();
        Ok((total, alerts))
    }

    /// Per-class recording counts. A class counts at most once per clip.
    pub fn object_stats(&self, filter: &RecordingFilter) -> Result<ObjectStats> {
        let (clause, params) = where_clause(filter);
        let sql = format!("SELECT objects_detected FROM recordings {clause}");
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let blobs = stmt
            .query_map(params_from_iter(params), |r| r.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut object_counts: BTreeMap<String, u32> = BTreeMap::new();
        let total_recordings = blobs.len() as u32;
        for blob in blobs {
            let value: serde_json::Value =
                serde_json::from_str(&blob).unwrap_or(serde_json::Value::Null);
            let seen: HashSet<String> = detection_entries(&value)
                .into_iter()
                .map(|(class, _)| class)
                .collect();
            for class in seen {
                *object_counts.entry(class).or_insert(0) += 1;
            }
        }

        let mut object_percentages = BTreeMap::new();
        if total_recordings > 0 {
            for (class, count) in &object_counts {
                let pct = *count as f64 / total_recordings as f64 * 100.0;
                object_percentages.insert(class.clone(), (pct * 100.0).round() / 100.0);
            }
        }

        Ok(ObjectStats { total_recordings, object_counts, object_percentages })
    }

    /// Detection counts bucketed by hour of day and weekday over the last
    /// `days` days (clamped to 90).
    pub fn time_stats(
        &self,
        object_class: Option<&str>,
        days: u32,
        stream_id: Option<&str>,
    ) -> Result<TimeStats> {
        let days = days.clamp(1, 90);
        let start_date = (chrono::Local::now() - chrono::Duration::days(days as i64))
            .format("%Y-%m-%d")
            .to_string();

        let mut sql =
            "SELECT timestamp, objects_detected FROM recordings
             WHERE retained = 1 AND timestamp >= ?".to_string();
        let mut params: Vec<Value> = vec![Value::Text(start_date)];
        if let Some(sid) = stream_id {
            sql.push_str(" AND stream_id = ?");
            params.push(Value::Text(sid.to_string()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut hour_counts = [0u32; 24];
        let mut day_counts = [0u32; 7];
        for (timestamp, blob) in rows {
            if let Some(class) = object_class {
                let value: serde_json::Value =
                    serde_json::from_str(&blob).unwrap_or(serde_json::Value::Null);
                let has_class =
                    detection_entries(&value).iter().any(|(c, _)| c == class);
                if !has_class {
                    continue;
                }
            }
            let Some(dt) = parse_row_timestamp(&timestamp) else {
                continue;
            };
            hour_counts[dt.hour() as usize] += 1;
            day_counts[dt.weekday().num_days_from_monday() as usize] += 1;
        }

        Ok(TimeStats {
            hours: (0..24)
                .map(|h| HourBucket { hour: h, detections: hour_counts[h as usize] })
                .collect(),
            days: (0..7)
                .map(|d| DayBucket { day: DAY_NAMES[d], detections: day_counts[d] })
                .collect(),
        })
    }

    /// Count, total duration and latest timestamp for one stream.
    pub fn stream_stats(&self, stream_id: &str) -> Result<StreamStats> {
        let conn = self.conn.lock();
        let (count, total_duration): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), SUM(duration) FROM recordings
             WHERE stream_id = ?1 AND retained = 1",
            [stream_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        let latest: Option<String> = conn
            .query_row(
                "SELECT timestamp FROM recordings
                 WHERE stream_id = ?1 AND retained = 1
                 ORDER BY timestamp DESC LIMIT 1",
                [stream_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(StreamStats {
            recording_count: count as u32,
            total_duration: total_duration.unwrap_or(0.0),
            latest_recording: latest,
        })
    }

    /// Oldest retained rows, eviction candidates for the janitor.
    pub fn evict_candidates(&self, limit: u32) -> Result<Vec<EvictCandidate>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, file_path, thumbnail_path FROM recordings
             WHERE retained = 1 ORDER BY timestamp ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |r| {
                Ok(EvictCandidate {
                    id: r.get(0)?,
                    file_path: r.get(1)?,
                    thumbnail_path: r.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Flip `retained` to 0, keeping the row for audit.
    pub fn mark_evicted(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("UPDATE recordings SET retained = 0 WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Absolute paths referenced by retained rows (clips and thumbnails),
    /// for the orphan sweep.
    pub fn retained_paths(&self) -> Result<HashSet<PathBuf>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT file_path, thumbnail_path FROM recordings WHERE retained = 1",
        )?;
        let mut paths = HashSet::new();
        let rows = stmt.query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?;
        for row in rows {
            let (file, thumb) = row?;
            paths.insert(PathBuf::from(file));
            if let Some(t) = thumb {
                paths.insert(PathBuf::from(t));
            }
        }
        Ok(paths)
    }
}

/// Build the WHERE clause shared by list/count/stats. `retained = 1` is
/// always required.
fn where_clause(filter: &RecordingFilter) -> (String, Vec<Value>) {
    let mut clause = "WHERE retained = 1".to_string();
    let mut params: Vec<Value> = Vec::new();

    if let Some(sid) = &filter.stream_id {
        clause.push_str(" AND stream_id = ?");
        params.push(Value::Text(sid.clone()));
    }
    if let Some(start) = &filter.start_date {
        clause.push_str(" AND timestamp >= ?");
        params.push(Value::Text(start.clone()));
    }
    if let Some(end) = &filter.end_date {
        clause.push_str(" AND timestamp <= ?");
        params.push(Value::Text(end.clone()));
    }
    if let Some(class) = &filter.object_class {
        // Substring probe over the serialized detection list; equivalent to a
        // JSON containment check on the "class" field.
        clause.push_str(" AND objects_detected LIKE ?");
        params.push(Value::Text(format!("%\"class\":\"{class}\"%")));
    }
    if let Some(min_conf) = filter.min_confidence {
        clause.push_str(" AND confidence >= ?");
        params.push(Value::Real(min_conf));
    }
    (clause, params)
}

fn row_from_sql(r: &rusqlite::Row<'_>) -> rusqlite::Result<CatalogueRow> {
    let objects_raw: String = r.get(6)?;
    Ok(CatalogueRow {
        id: r.get(0)?,
        timestamp: r.get(1)?,
        stream_id: r.get(2)?,
        stream_name: r.get(3)?,
        file_path: r.get(4)?,
        duration: r.get(5)?,
        objects_detected: serde_json::from_str(&objects_raw)
            .unwrap_or(serde_json::Value::Null),
        thumbnail_path: r.get(7)?,
        confidence: r.get(8)?,
        retained: r.get(9)?,
    })
}

/// Extract `(class, entry)` pairs from a stored detection list, skipping
/// entries without a class (such as the `write_error` marker).
fn detection_entries(value: &serde_json::Value) -> Vec<(String, serde_json::Value)> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|obj| {
                    obj.get("class")
                        .and_then(|c| c.as_str())
                        .map(|c| (c.to_string(), obj.clone()))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_row_timestamp(ts: &str) -> Option<NaiveDateTime> {
    let head = ts.get(..19)?;
    NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S").ok()
}

fn remove_file_quiet(path: &str) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path, error = %e, "Failed to remove file");
        }
    }
}
