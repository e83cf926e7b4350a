//! Concurrent write pipeline: one dedicated shard writer thread per shard
//! (C2) feeding a single dedicated index writer thread (C3) over bounded
//! `crossbeam-channel` channels. Each is a persistent actor for the life
//! of the store, not a job pool — there is exactly one writer per shard
//! file and exactly one writer for the index file, matching the
//! single-writer-per-file invariant the on-disk format depends on.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use crate::codec::{get_codec_by_name, Codec};
use crate::entry::EntryLayout;
use crate::error::{BlockFsError, WorkerError};

/// One compressed block payload destined for a particular shard.
pub struct WriteJob {
    pub dir_offset: u64,
    pub payload: Vec<u8>,
}

/// Emitted by a shard writer once a block has actually landed on disk;
/// consumed by the index writer to publish the directory entry.
#[derive(Debug, Clone, Copy)]
pub struct Publication {
    pub dir_offset: u64,
    pub file_offset: u64,
    pub byte_count: u64,
}

/// A single-writer actor appending compressed blocks to one shard file.
pub struct ShardWriter {
    path: PathBuf,
    tx: Option<Sender<WriteJob>>,
    handle: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl ShardWriter {
    /// Open `path` for append (creating it if absent), resolve the codec
    /// up front so a bad codec name fails the caller immediately rather
    /// than poisoning the worker on its first job, and spawn the writer
    /// thread.
    pub fn spawn(
        path: impl AsRef<Path>,
        codec_name: &str,
        level: i32,
        queue_depth: usize,
        publish_tx: Sender<Publication>,
    ) -> Result<Self, BlockFsError> {
        let path = path.as_ref().to_path_buf();
        let codec = get_codec_by_name(codec_name)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| BlockFsError::io(path.clone(), e))?;
        let start_position = file
            .metadata()
            .map_err(|e| BlockFsError::io(path.clone(), e))?
            .len();

        let (tx, rx) = crossbeam_channel::bounded(queue_depth.max(1));
        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name(format!("blockfs-shard-{}", path.display()))
            .spawn(move || shard_writer_loop(file, start_position, codec, level, rx, publish_tx, thread_path))
            .map_err(|e| BlockFsError::io(path.clone(), io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        Ok(ShardWriter { path, tx: Some(tx), handle: Some(handle) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueue a block for compression and append. Blocks if the shard's
    /// inbound queue is at capacity (the backpressure point in §5).
    pub fn submit(&self, job: WriteJob) -> Result<(), BlockFsError> {
        match &self.tx {
            Some(tx) => tx
                .send(job)
                .map_err(|_| BlockFsError::Worker(WorkerError::Disconnected)),
            None => Err(BlockFsError::Worker(WorkerError::Disconnected)),
        }
    }

    /// Drop the sending half (ending the worker's receive loop) and join.
    /// Idempotent — a second call is a no-op returning `Ok(())`.
    pub fn close(&mut self) -> Result<(), BlockFsError> {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(res) => res.map_err(BlockFsError::Worker),
                Err(_) => Err(BlockFsError::Worker(WorkerError::Disconnected)),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn shard_writer_loop(
    mut file: File,
    mut position: u64,
    codec: Box<dyn Codec>,
    level: i32,
    rx: Receiver<WriteJob>,
    publish_tx: Sender<Publication>,
    path: PathBuf,
) -> Result<(), WorkerError> {
    for job in rx.iter() {
        let compressed = codec.compress(&job.payload, level)?;
        let byte_count = compressed.len() as u64;
        let file_offset = position;
        file.write_all(&compressed)
            .map_err(|e| WorkerError::ShardIo { path: path.clone(), source: e })?;
        position += byte_count;
        tracing::trace!(shard = %path.display(), dir_offset = job.dir_offset, file_offset, byte_count, "block published");
        if publish_tx
            .send(Publication { dir_offset: job.dir_offset, file_offset, byte_count })
            .is_err()
        {
            return Err(WorkerError::Disconnected);
        }
    }
    Ok(())
}

/// The single-writer actor owning the index file's directory table.
pub struct IndexWriter {
    handle: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl IndexWriter {
    /// Spawn the indexer. `publish_rx` is the receiving half of a channel
    /// whose sending half the caller clones once per shard writer — many
    /// producers, one consumer. The indexer's loop ends once every clone
    /// of the sender has been dropped, which is why the store must not
    /// retain a sender of its own past `start_workers`.
    pub fn spawn(
        index_path: impl AsRef<Path>,
        index_base: u64,
        entry_layout: EntryLayout,
        publish_rx: Receiver<Publication>,
    ) -> Result<Self, BlockFsError> {
        let index_path = index_path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .open(&index_path)
            .map_err(|e| BlockFsError::io(index_path.clone(), e))?;

        let handle = thread::Builder::new()
            .name("blockfs-indexer".to_string())
            .spawn(move || index_writer_loop(file, index_base, entry_layout, publish_rx, index_path))
            .map_err(|e| {
                BlockFsError::io(
                    "index writer thread",
                    io::Error::new(io::ErrorKind::Other, e.to_string()),
                )
            })?;

        Ok(IndexWriter { handle: Some(handle) })
    }

    /// Join the indexer thread. The caller must have already closed every
    /// shard writer (dropping their cloned senders) so the channel this
    /// indexer reads from has actually closed.
    pub fn close(&mut self) -> Result<(), BlockFsError> {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(res) => res.map_err(BlockFsError::Worker),
                Err(_) => Err(BlockFsError::Worker(WorkerError::Disconnected)),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn index_writer_loop(
    mut file: File,
    index_base: u64,
    layout: EntryLayout,
    rx: Receiver<Publication>,
    path: PathBuf,
) -> Result<(), WorkerError> {
    let entry_size = layout.entry_size();
    let mut buf = vec![0u8; entry_size];
    for publication in rx.iter() {
        buf.iter_mut().for_each(|b| *b = 0);
        layout
            .encode(&mut buf, publication.file_offset, publication.byte_count)
            .map_err(|e| {
                WorkerError::IndexIo { source: io::Error::new(io::ErrorKind::InvalidData, e.to_string()) }
            })?;
        let pos = index_base + publication.dir_offset * entry_size as u64;
        file.seek(SeekFrom::Start(pos))
            .map_err(|e| WorkerError::IndexIo { source: e })?;
        file.write_all(&buf).map_err(|e| WorkerError::IndexIo { source: e })?;
        tracing::trace!(dir_offset = publication.dir_offset, pos, "directory entry published");
    }
    file.flush().map_err(|e| WorkerError::IndexIo { source: e })?;
    let _ = path;
    Ok(())
}
