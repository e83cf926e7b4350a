//! The index file's fixed-size preamble: magic header, metadata length,
//! and the base offset of the packed directory table.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::BlockFsError;

pub const HEADER: &[u8; 8] = b"BlockFS\0";

/// Parsed preamble of an index file: where the JSON metadata starts and
/// ends, and where the packed directory table begins.
#[derive(Debug, Clone, Copy)]
pub struct Preamble {
    pub metadata_byte_length: u32,
    pub index_base: u32,
}

impl Preamble {
    pub fn metadata_offset() -> u64 {
        (HEADER.len() + 4 + 4) as u64
    }

    /// Write `"BlockFS\0"`, then `(metadata_byte_length, index_base)` as
    /// little-endian u32s, then the metadata bytes.
    pub fn write<W: Write>(w: &mut W, metadata: &[u8]) -> Result<Preamble, io::Error> {
        let metadata_byte_length = metadata.len() as u32;
        let index_base = Self::metadata_offset() as u32 + metadata_byte_length;
        w.write_all(HEADER)?;
        w.write_u32::<LittleEndian>(metadata_byte_length)?;
        w.write_u32::<LittleEndian>(index_base)?;
        w.write_all(metadata)?;
        Ok(Preamble { metadata_byte_length, index_base })
    }

    /// Read and validate the header, returning the parsed preamble and the
    /// raw metadata bytes that follow it.
    pub fn read<R: Read>(r: &mut R) -> Result<(Preamble, Vec<u8>), BlockFsError> {
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)
            .map_err(|e| BlockFsError::format(format!("failed to read index header: {e}")))?;
        if &magic != HEADER {
            return Err(BlockFsError::format("index file is missing the BlockFS header"));
        }
        let metadata_byte_length = r
            .read_u32::<LittleEndian>()
            .map_err(|e| BlockFsError::format(format!("failed to read metadata length: {e}")))?;
        let index_base = r
            .read_u32::<LittleEndian>()
            .map_err(|e| BlockFsError::format(format!("failed to read index base: {e}")))?;
        let mut metadata = vec![0u8; metadata_byte_length as usize];
        r.read_exact(&mut metadata)
            .map_err(|e| BlockFsError::format(format!("failed to read metadata body: {e}")))?;
        Ok((Preamble { metadata_byte_length, index_base }, metadata))
    }
}
