//! Crate-wide error type.
//!
//! Every public operation on [`crate::store::BlockStore`] returns
//! `Result<T, BlockFsError>`.  The five variants below are the five error
//! *kinds* the store can produce; callers that care about recovering from a
//! specific failure match on the variant rather than parsing a message.

use std::io;
use std::path::PathBuf;

use crate::codec::CodecError;

/// A worker thread (shard writer or indexer) terminated abnormally.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("shard writer for {path} failed: {source}")]
    ShardIo { path: PathBuf, source: io::Error },
    #[error("index writer failed: {source}")]
    IndexIo { source: io::Error },
    #[error("codec failure in worker: {0}")]
    Codec(#[from] CodecError),
    #[error("worker channel disconnected before shutdown completed")]
    Disconnected,
}

#[derive(thiserror::Error, Debug)]
pub enum BlockFsError {
    /// Header mismatch, missing metadata key, unknown version, malformed JSON.
    #[error("format error: {0}")]
    Format(String),

    /// Misaligned coordinate or block whose shape doesn't match `get_block_size`.
    #[error("bounds error: {0}")]
    Bounds(String),

    /// Filesystem-level failure on create/open/read/write.
    #[error("I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    /// Compression or decompression failure; on read this means corruption.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A shard writer or the index writer has died; the store is poisoned
    /// for the affected shard until it is reopened.
    #[error("worker failure: {0}")]
    Worker(#[from] WorkerError),
}

impl BlockFsError {
    pub fn format<S: Into<String>>(msg: S) -> Self {
        BlockFsError::Format(msg.into())
    }

    pub fn bounds<S: Into<String>>(msg: S) -> Self {
        BlockFsError::Bounds(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BlockFsError::Io { path: path.into(), source }
    }
}

impl From<serde_json::Error> for BlockFsError {
    fn from(e: serde_json::Error) -> Self {
        BlockFsError::Format(format!("invalid metadata JSON: {e}"))
    }
}
