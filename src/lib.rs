//! Content-addressed backup core.
//!
//! A library, not a daemon: it chunks file content, deduplicates chunks
//! in a fingerprint-addressed store, records file/snapshot metadata
//! transactionally, and restores or prunes snapshots on request. It does
//! not walk the network, schedule jobs, or own a CLI - those are for a
//! caller to build on top.
//!
//! The pieces, in dependency order:
//!
//! - [`hash`] - the SHA-256 fingerprint type shared by every other module.
//! - [`chunker`] - content-defined chunking of a byte stream.
//! - [`chunk_index`] - durable fingerprint -> location/refcount mapping.
//! - [`chunk_store`] - physical chunk storage, deduplication, integrity
//!   checks.
//! - [`metadata_store`] - snapshots, files, and file-chunk edges.
//! - [`retention`] - keep-last/daily/weekly/monthly/yearly pruning policy.
//! - [`backup_orchestrator`] - walks a source tree into a new snapshot.
//! - [`restore_orchestrator`] - materializes a snapshot back to disk.
//! - [`gc`] - reclaims chunks no snapshot references any more.
//! - [`progress`] / [`config`] - the ambient plumbing the above share.

pub mod backup_orchestrator;
pub mod chunk_index;
pub mod chunk_store;
pub mod chunker;
pub mod config;
pub mod error;
pub mod gc;
pub mod hash;
pub mod metadata_store;
pub mod progress;
pub mod restore_orchestrator;
pub mod retention;

pub use backup_orchestrator::BackupOrchestrator;
pub use chunk_index::{ChunkIndex, ChunkRecord};
pub use chunk_store::{ChunkStore, ChunkStoreStats};
pub use chunker::{Chunker, ChunkerParams, ChunkSpan};
pub use config::{BackupOptions, ChunkerConfig, GcOptions, RestoreOptions, StorageConfig};
pub use error::{Error, ErrorContext, Result};
pub use gc::{GarbageCollector, GcCoordinator, GcResult};
pub use hash::{hash_buffer, Fingerprint, HashingReader, StreamHasher};
pub use metadata_store::{FileChunk, FileRecord, MetadataStats, MetadataStore, Snapshot};
pub use progress::{CancelToken, ProgressEvent, ProgressSink};
pub use restore_orchestrator::{RestoreOrchestrator, RestoreSummary};
pub use retention::{compute_retention, PruneOptions};
