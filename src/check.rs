//! Directory table integrity scan: walks every entry and verifies it
//! obeys invariant 2 — a non-zero entry's byte range lies entirely
//! inside its shard's current file size. Scoped deliberately narrow:
//! this is not a content scanner (no decompression, no hash check) the
//! way a container-format recovery tool would be, because nothing here
//! promises payload-level checksums.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;

use crate::error::BlockFsError;
use crate::store::BlockStore;

#[derive(Debug, Clone)]
pub struct OutOfRangeEntry {
    pub dir_offset: u64,
    pub shard_index: usize,
    pub file_offset: u64,
    pub byte_count: u64,
    pub shard_file_len: u64,
}

#[derive(Debug, Default)]
pub struct CheckReport {
    pub total_entries: u64,
    pub written_entries: u64,
    pub healthy_entries: u64,
    pub out_of_range: Vec<OutOfRangeEntry>,
}

impl CheckReport {
    pub fn is_healthy(&self) -> bool {
        self.out_of_range.is_empty()
    }
}

/// Scan `store`'s whole directory table.
pub fn check(store: &BlockStore) -> Result<CheckReport, BlockFsError> {
    let descriptor = store.descriptor();
    let entry_size = descriptor.entry_layout.entry_size();
    let index_path = store.index_path();

    let index_file = File::open(index_path).map_err(|e| BlockFsError::io(index_path, e))?;
    let index_len = index_file
        .metadata()
        .map_err(|e| BlockFsError::io(index_path, e))?
        .len();

    let mut header_reader = File::open(index_path).map_err(|e| BlockFsError::io(index_path, e))?;
    let (preamble, _metadata) = crate::format::Preamble::read(&mut header_reader)?;
    let index_base = preamble.index_base as u64;

    let mut report = CheckReport::default();
    if index_len <= index_base {
        return Ok(report);
    }

    let mmap = unsafe { memmap2::Mmap::map(&index_file) }.map_err(|e| BlockFsError::io(index_path, e))?;
    let table = &mmap[index_base as usize..];
    let n_entries = table.len() as u64 / entry_size as u64;

    let mut shard_lens: HashMap<usize, u64> = HashMap::new();
    let shard_dir = index_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    report.total_entries = n_entries;
    for i in 0..n_entries {
        let start = (i * entry_size as u64) as usize;
        let entry_bytes = &table[start..start + entry_size];
        if crate::entry::EntryLayout::is_empty(entry_bytes) {
            continue;
        }
        report.written_entries += 1;

        let (file_offset, byte_count) = descriptor.entry_layout.decode(entry_bytes);
        let shard_index = descriptor.shard_for_offset(i);

        let shard_len = *shard_lens.entry(shard_index).or_insert_with(|| {
            let rel = &descriptor.block_filenames[shard_index];
            let abs = if rel.is_absolute() { rel.clone() } else { shard_dir.join(rel) };
            std::fs::metadata(&abs).map(|m| m.len()).unwrap_or(0)
        });

        if file_offset + byte_count <= shard_len {
            report.healthy_entries += 1;
        } else {
            report.out_of_range.push(OutOfRangeEntry {
                dir_offset: i,
                shard_index,
                file_offset,
                byte_count,
                shard_file_len: shard_len,
            });
        }
    }

    Ok(report)
}
