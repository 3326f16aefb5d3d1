//! Recreates a file tree from a committed snapshot by concatenating
//! chunks in order (C7).

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use filetime::{set_file_mtime, FileTime};
use log::{info, warn};

use crate::chunk_store::ChunkStore;
use crate::config::RestoreOptions;
use crate::error::{Error, ErrorContext, Result};
use crate::hash::StreamHasher;
use crate::metadata_store::MetadataStore;
use crate::progress::{CancelToken, ProgressSink};

pub struct RestoreOrchestrator<'a> {
    store: &'a ChunkStore,
    metadata: &'a MetadataStore,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreSummary {
    pub files_restored: u64,
    pub files_failed: u64,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(store: &'a ChunkStore, metadata: &'a MetadataStore) -> Self {
        Self { store, metadata }
    }

    /// Restore every file of `snapshot_id` under `target_root`, per §4.7.
    pub fn run(
        &self,
        snapshot_id: i64,
        target_root: &Path,
        opts: &RestoreOptions,
        progress: &ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RestoreSummary> {
        progress.started();
        let _snapshot = self.metadata.get_snapshot(snapshot_id)?;
        let files = self.metadata.files_in_snapshot(snapshot_id)?;

        let mut summary = RestoreSummary::default();

        for file in files {
            if cancel.is_cancelled() {
                progress.cancelled();
                return Err(Error::Cancelled);
            }

            progress.file_enqueued(file.path.clone());

            match self.restore_one_file(target_root, &file, opts) {
                Ok(()) => {
                    summary.files_restored += 1;
                    progress.file_completed(file.path.clone(), file.size as u64);
                }
                Err(e) => {
                    summary.files_failed += 1;
                    warn!("failed to restore {}: {}", file.path, e);
                    progress.failed(&e);
                    if !opts.continue_on_error {
                        return Err(e);
                    }
                }
            }
        }

        progress.finished(snapshot_id);
        info!("restore finished: snapshot_id={} restored={} failed={}", snapshot_id, summary.files_restored, summary.files_failed);
        Ok(summary)
    }

    fn restore_one_file(
        &self,
        target_root: &Path,
        file: &crate::metadata_store::FileRecord,
        opts: &RestoreOptions,
    ) -> Result<()> {
        let dest: PathBuf = target_root.join(&file.path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }

        if dest.exists() && !opts.overwrite_existing {
            return Err(Error::Conflict(format!("{} already exists", dest.display())));
        }

        let edges = self.metadata.file_chunks(file.id)?;

        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dest)
            .with_path(&dest)?;
        let mut hasher = StreamHasher::new();

        for (expected_order, edge) in edges.iter().enumerate() {
            if edge.order != expected_order as i64 {
                return Err(Error::Corrupt(format!(
                    "file {} has a gap in chunk ordering at position {}",
                    file.path, expected_order
                )));
            }
            let bytes = self.store.get(&edge.chunk_fingerprint)?;
            out.write_all(&bytes)?;
            hasher.update(&bytes);
        }
        out.flush()?;
        drop(out);

        let actual = hasher.finish();
        if actual != file.file_fingerprint {
            return Err(Error::IntegrityError {
                fingerprint: file.file_fingerprint.to_hex(),
                actual: actual.to_hex(),
            });
        }

        if opts.preserve_attributes {
            let mtime = FileTime::from_unix_time(file.modified_time, 0);
            set_file_mtime(&dest, mtime).with_path(&dest)?;
        }

        Ok(())
    }
}
