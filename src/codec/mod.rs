//! Compression codec registry.
//!
//! A block store names its codec by a short string in its JSON metadata
//! (`Compression`), not by a UUID — unlike a container format with
//! independently-versioned plugins, every codec here is either compiled in
//! or it isn't, and the name is the only identity that needs to survive a
//! round trip through the index file.
//!
//! [`RECOGNIZED_CODEC_NAMES`] lists every name this crate will *parse*
//! without error, including a few (`blosclz`, `lz4hc`, `zlib`, `snappy`)
//! carried only for metadata compatibility with stores written by other
//! tools. [`CodecId::from_name`] resolves only the names this build can
//! actually compress/decompress; callers that need the hard distinction
//! between "unknown name" and "recognized but unimplemented" should check
//! [`RECOGNIZED_CODEC_NAMES`] themselves before calling `from_name`.

use std::io;

/// Every `Compression` metadata string this crate will parse, implemented
/// or not. Used to validate metadata without falsely rejecting stores
/// written elsewhere.
pub const RECOGNIZED_CODEC_NAMES: &[&str] =
    &["none", "zstd", "lz4", "blosclz", "lz4hc", "zlib", "snappy"];

/// Runtime codec discriminant for the codecs this build actually implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Zstd,
    Lz4,
}

impl CodecId {
    /// Human-readable name — this is also the exact string stored in the
    /// `Compression` metadata field.
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Zstd => "zstd",
            CodecId::Lz4 => "lz4",
        }
    }

    /// Resolve a metadata string to an implemented codec.
    ///
    /// Returns `None` both for names this build never heard of and for
    /// names in [`RECOGNIZED_CODEC_NAMES`] that are recognized but not
    /// implemented (e.g. `blosclz`). Callers distinguish the two cases by
    /// consulting `RECOGNIZED_CODEC_NAMES` themselves.
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "none" => Some(CodecId::None),
            "zstd" => Some(CodecId::Zstd),
            "lz4" => Some(CodecId::Lz4),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("codec '{name}' is recognized but not implemented by this build")]
    Unavailable { name: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::None
    }
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId {
        CodecId::Zstd
    }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        zstd::decode_all(data).map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId {
        CodecId::Lz4
    }
    fn compress(&self, data: &[u8], _level: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

/// Resolve a `CodecId` to its implementation.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None => Box::new(NoneCodec),
        CodecId::Zstd => Box::new(ZstdCodec),
        CodecId::Lz4 => Box::new(Lz4Codec),
    }
}

/// Resolve a metadata string to a codec implementation.
///
/// Fails with `CodecError::Unavailable` both for unknown names and for
/// names that are recognized in metadata but not implemented.
pub fn get_codec_by_name(name: &str) -> Result<Box<dyn Codec>, CodecError> {
    CodecId::from_name(name)
        .map(get_codec)
        .ok_or_else(|| CodecError::Unavailable { name: name.to_string() })
}
