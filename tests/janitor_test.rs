// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage janitor tests: size-cap eviction, live-clip protection, orphan
//! handling.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use sentinel::catalogue::{Catalogue, NewRecording};
use sentinel::janitor::{dir_size, StorageJanitor};

/// Large enough that the catalogue database (a few pages of SQLite) is noise
/// next to a clip in the eviction arithmetic.
const CLIP_BYTES: usize = 100_000;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

/// A clip file on disk plus its catalogue row. `idx` orders the timestamps.
fn seed_clip(dir: &TempDir, catalogue: &Catalogue, idx: usize) -> (i64, PathBuf) {
    let path = dir.path().join(format!("cam1_2026-03-0{}_10-00-00.mp4", idx + 1));
    std::fs::write(&path, vec![0xABu8; CLIP_BYTES]).expect("write clip");
    let id = catalogue
        .insert(&NewRecording {
            timestamp: format!("2026-03-0{}T10:00:00.000", idx + 1),
            stream_id: "cam1".into(),
            stream_name: "front-door".into(),
            file_path: path.display().to_string(),
            duration: 5.0,
            objects_detected: serde_json::json!([
                { "class": "person", "confidence": 0.8, "bbox": [0.0, 0.0, 10.0, 10.0] }
            ]),
            thumbnail_path: None,
            confidence: 0.8,
        })
        .expect("insert");
    (id, path)
}

#[test]
fn test_eviction_brings_usage_under_cap() {
    let dir = tmp_dir();
    let catalogue = Arc::new(Catalogue::open(&dir.path().join("recordings.db")).expect("open"));

    let clips: Vec<(i64, PathBuf)> =
        (0..6).map(|i| seed_clip(&dir, &catalogue, i)).collect();
    // The total covers every file beneath the directory, database included.
    assert!(dir_size(dir.path()) >= 6 * CLIP_BYTES as u64);

    // Cap below current usage; low-water is 80% of it.
    let cap = 350_000u64;
    let janitor = StorageJanitor::new(dir.path(), cap, catalogue.clone(), Arc::new(|| Vec::new()));
    janitor.sweep_once();

    assert!(dir_size(dir.path()) <= cap, "usage under the cap after one tick");

    // Oldest four evicted: files gone, rows flipped to retained=0.
    for (id, path) in &clips[..4] {
        assert!(!path.exists(), "evicted file removed: {}", path.display());
        assert!(catalogue.get(*id).expect("get").is_none(), "row {id} no longer retained");
    }
    // Newest two untouched.
    for (id, path) in &clips[4..] {
        assert!(path.exists(), "recent file kept: {}", path.display());
        assert!(catalogue.get(*id).expect("get").is_some(), "row {id} still retained");
    }
}

#[test]
fn test_eviction_skips_live_clip() {
    let dir = tmp_dir();
    let catalogue = Arc::new(Catalogue::open(&dir.path().join("recordings.db")).expect("open"));

    let clips: Vec<(i64, PathBuf)> =
        (0..4).map(|i| seed_clip(&dir, &catalogue, i)).collect();

    // Pretend the oldest clip is still being written by a recorder.
    let live = clips[0].1.clone();
    let live_fn = Arc::new(move || vec![live.clone()]);

    let cap = (2 * CLIP_BYTES) as u64;
    let janitor = StorageJanitor::new(dir.path(), cap, catalogue.clone(), live_fn);
    janitor.sweep_once();

    assert!(clips[0].1.exists(), "live clip never deleted");
    assert!(
        catalogue.get(clips[0].0).expect("get").is_some(),
        "live clip's row never evicted"
    );
    assert!(!clips[1].1.exists(), "next-oldest evicted instead");
}

#[test]
fn test_recent_orphans_and_database_are_kept() {
    let dir = tmp_dir();
    let catalogue = Arc::new(Catalogue::open(&dir.path().join("recordings.db")).expect("open"));
    seed_clip(&dir, &catalogue, 0);

    // A fresh unreferenced file: younger than the 10-minute grace period, so
    // a sweep must leave it alone.
    let orphan = dir.path().join("leftover.mp4");
    std::fs::write(&orphan, vec![0u8; 100]).expect("write orphan");

    let janitor = StorageJanitor::new(
        dir.path(),
        u64::MAX / 2,
        catalogue.clone(),
        Arc::new(|| Vec::new()),
    );
    janitor.sweep_once();

    assert!(orphan.exists(), "recent orphan kept");
    assert!(dir.path().join("recordings.db").exists(), "catalogue never swept");
}

#[test]
fn test_under_cap_sweep_changes_nothing() {
    let dir = tmp_dir();
    let catalogue = Arc::new(Catalogue::open(&dir.path().join("recordings.db")).expect("open"));
    let clips: Vec<(i64, PathBuf)> =
        (0..3).map(|i| seed_clip(&dir, &catalogue, i)).collect();

    let janitor = StorageJanitor::new(
        dir.path(),
        u64::MAX / 2,
        catalogue.clone(),
        Arc::new(|| Vec::new()),
    );
    janitor.sweep_once();

    for (id, path) in &clips {
        assert!(path.exists());
        assert!(catalogue.get(*id).expect("get").is_some());
    }
}
