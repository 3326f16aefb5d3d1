//! Minimal end-to-end demonstration: back up a directory, garbage
//! collect, then restore into a fresh directory.

use std::env;
use std::sync::Arc;

use backupcore::{
    BackupOptions, BackupOrchestrator, CancelToken, ChunkIndex, ChunkStore, ChunkerParams,
    GarbageCollector, GcCoordinator, GcOptions, MetadataStore, ProgressSink, RestoreOptions,
    RestoreOrchestrator,
};

fn main() -> backupcore::Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let source = args.next().unwrap_or_else(|| ".".to_string());
    let store_root = args.next().unwrap_or_else(|| "/tmp/backupcore-demo/store".to_string());
    let restore_root = args.next().unwrap_or_else(|| "/tmp/backupcore-demo/restore".to_string());

    let index = Arc::new(ChunkIndex::open(&std::path::PathBuf::from(&store_root).join("index.db"))?);
    let store = ChunkStore::with_index(&store_root, Arc::clone(&index))?;
    let metadata = MetadataStore::open(&std::path::PathBuf::from(&store_root).join("metadata.db"), Arc::clone(&index))?;

    let backup = BackupOrchestrator::new(&store, &metadata, ChunkerParams::default());
    let snapshot_id = backup.run(
        std::path::Path::new(&source),
        "demo-snapshot",
        Some("created by backup_restore_roundtrip".to_string()),
        &BackupOptions::default(),
        &ProgressSink::none(),
        &CancelToken::new(),
    )?;
    println!("backed up snapshot {}", snapshot_id);

    let coordinator = GcCoordinator::new();
    let gc = GarbageCollector::new(&store, &metadata, &coordinator);
    let gc_result = gc.run(&index, &GcOptions::default())?;
    println!("gc removed {} chunks ({} bytes reclaimed)", gc_result.removed, gc_result.reclaimed_bytes);

    let restore = RestoreOrchestrator::new(&store, &metadata);
    let summary = restore.run(
        snapshot_id,
        std::path::Path::new(&restore_root),
        &RestoreOptions::default(),
        &ProgressSink::none(),
        &CancelToken::new(),
    )?;
    println!("restored {} files ({} failed) into {}", summary.files_restored, summary.files_failed, restore_root);

    Ok(())
}
