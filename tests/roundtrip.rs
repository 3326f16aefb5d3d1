//! End-to-end exercise of the full backup -> GC -> restore pipeline.

use std::fs;
use std::sync::Arc;

use backupcore::{
    BackupOptions, BackupOrchestrator, CancelToken, ChunkIndex, ChunkStore, ChunkerParams,
    GarbageCollector, GcCoordinator, GcOptions, MetadataStore, PruneOptions, ProgressSink,
    RestoreOptions, RestoreOrchestrator,
};

fn harness(dir: &std::path::Path) -> (ChunkStore, MetadataStore, Arc<ChunkIndex>) {
    let index = Arc::new(ChunkIndex::open_in_memory().unwrap());
    let store = ChunkStore::with_index(dir.join("chunks"), Arc::clone(&index)).unwrap();
    let metadata = MetadataStore::open_in_memory(Arc::clone(&index)).unwrap();
    (store, metadata, index)
}

#[test]
fn full_pipeline_backup_gc_restore() {
    let work = tempfile::tempdir().unwrap();
    let (store, metadata, index) = harness(work.path());

    let source_a = tempfile::tempdir().unwrap();
    let shared_payload = vec![9u8; 500_000];
    fs::write(source_a.path().join("shared.bin"), &shared_payload).unwrap();
    fs::write(source_a.path().join("only_in_a.bin"), vec![1u8; 50_000]).unwrap();

    let params = ChunkerParams::new(4 * 1024, 16 * 1024, 64 * 1024).unwrap();
    let backup = BackupOrchestrator::new(&store, &metadata, params);

    let snap_a = backup
        .run(
            source_a.path(),
            "snap-a",
            None,
            &BackupOptions::default(),
            &ProgressSink::none(),
            &CancelToken::new(),
        )
        .unwrap();

    let source_b = tempfile::tempdir().unwrap();
    fs::write(source_b.path().join("shared.bin"), &shared_payload).unwrap();
    fs::write(source_b.path().join("only_in_b.bin"), vec![2u8; 50_000]).unwrap();

    let snap_b = backup
        .run(
            source_b.path(),
            "snap-b",
            None,
            &BackupOptions::default(),
            &ProgressSink::none(),
            &CancelToken::new(),
        )
        .unwrap();

    // Both snapshots dedup the shared payload's chunks against each other.
    let stats_before_delete = store.stats().unwrap();

    // Retention: keep only the newest snapshot.
    let snapshots: Vec<_> = metadata.list_snapshots().unwrap().into_iter().rev().collect();
    let decisions = backupcore::compute_retention(snapshots, &PruneOptions::new().keep_last(Some(1)));
    for (snapshot, keep) in &decisions {
        if !keep {
            metadata.delete_snapshot(snapshot.id).unwrap();
        }
    }
    assert!(metadata.get_snapshot(snap_a).is_err());
    assert!(metadata.get_snapshot(snap_b).is_ok());

    let coordinator = GcCoordinator::new();
    let gc = GarbageCollector::new(&store, &metadata, &coordinator);
    let gc_result = gc.run(&index, &GcOptions { grace_seconds: 0 }).unwrap();
    assert!(gc_result.removed > 0);

    let stats_after = store.stats().unwrap();
    assert!(stats_after.count < stats_before_delete.count);

    // Everything snap-b still references must survive the sweep.
    let files = metadata.files_in_snapshot(snap_b).unwrap();
    for file in &files {
        for edge in metadata.file_chunks(file.id).unwrap() {
            assert!(store.contains(&edge.chunk_fingerprint).unwrap());
        }
    }

    let restore_dir = tempfile::tempdir().unwrap();
    let restore = RestoreOrchestrator::new(&store, &metadata);
    let summary = restore
        .run(snap_b, restore_dir.path(), &RestoreOptions::default(), &ProgressSink::none(), &CancelToken::new())
        .unwrap();
    assert_eq!(summary.files_restored, 2);
    assert_eq!(summary.files_failed, 0);

    assert_eq!(fs::read(restore_dir.path().join("shared.bin")).unwrap(), shared_payload);
    assert_eq!(fs::read(restore_dir.path().join("only_in_b.bin")).unwrap(), vec![2u8; 50_000]);
}
