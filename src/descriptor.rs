//! The volume descriptor: the immutable configuration of a block store,
//! and its on-disk JSON metadata representation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::RECOGNIZED_CODEC_NAMES;
use crate::entry::EntryLayout;
use crate::error::BlockFsError;

pub const CURRENT_VERSION: &str = "1.0.0";

/// Voxel element type. Names match the canonical little-endian numeric
/// names used in the `DType` metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    #[serde(rename = "uint8")]
    U8,
    #[serde(rename = "uint16")]
    U16,
    #[serde(rename = "uint32")]
    U32,
    #[serde(rename = "uint64")]
    U64,
    #[serde(rename = "int8")]
    I8,
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "int64")]
    I64,
    #[serde(rename = "float32")]
    F32,
    #[serde(rename = "float64")]
    F64,
}

impl DType {
    /// Size of one voxel in bytes.
    pub fn byte_width(self) -> u64 {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }
}

/// A 3-D extent or block shape, ordered `(x, y, z)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent3 {
    pub x: u64,
    pub y: u64,
    pub z: u64,
}

impl Extent3 {
    pub fn new(x: u64, y: u64, z: u64) -> Self {
        Extent3 { x, y, z }
    }

    /// Number of blocks along each axis, rounding up.
    fn block_counts(&self, block: Extent3) -> Extent3 {
        Extent3::new(
            ceil_div(self.x, block.x),
            ceil_div(self.y, block.y),
            ceil_div(self.z, block.z),
        )
    }
}

fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// The immutable shape, layout, and codec configuration of a block store.
#[derive(Debug, Clone)]
pub struct VolumeDescriptor {
    pub extent: Extent3,
    pub block_shape: Extent3,
    pub dtype: DType,
    pub stride: Extent3,
    pub entry_layout: EntryLayout,
    pub block_filenames: Vec<PathBuf>,
    pub compression: String,
    pub compression_level: i32,
    pub version: String,
    /// Unrecognized JSON keys, preserved verbatim across open/close.
    pub application_metadata: BTreeMap<String, Value>,
}

impl VolumeDescriptor {
    /// Number of blocks along each axis.
    pub fn block_counts(&self) -> Extent3 {
        self.extent.block_counts(self.block_shape)
    }

    /// Total number of directory entries.
    pub fn n_blocks(&self) -> u64 {
        let c = self.block_counts();
        // The table is addressed by stride, not by a packed (i,j,k) -> linear
        // mapping, so its size is the highest reachable offset + 1.
        self.stride.x * (c.x - 1) + self.stride.y * (c.y - 1) + self.stride.z * (c.z - 1) + 1
    }

    pub fn n_shards(&self) -> usize {
        self.block_filenames.len()
    }

    /// Linear directory offset `D(i,j,k) = sx*i + sy*j + sz*k` for the
    /// block containing voxel `(x, y, z)`. Does not validate bounds.
    pub fn directory_offset(&self, x: u64, y: u64, z: u64) -> u64 {
        let i = x / self.block_shape.x;
        let j = y / self.block_shape.y;
        let k = z / self.block_shape.z;
        self.stride.x * i + self.stride.y * j + self.stride.z * k
    }

    /// Boundary-aware shape of the block at `(x, y, z)`, in `(z, y, x)`
    /// order to match the in-memory row-major convention.
    pub fn block_size_at(&self, x: u64, y: u64, z: u64) -> Result<(u64, u64, u64), BlockFsError> {
        if x >= self.extent.x || y >= self.extent.y || z >= self.extent.z {
            return Err(BlockFsError::bounds(format!(
                "coordinate ({x},{y},{z}) is outside extent ({},{},{})",
                self.extent.x, self.extent.y, self.extent.z
            )));
        }
        if x % self.block_shape.x != 0 || y % self.block_shape.y != 0 || z % self.block_shape.z != 0
        {
            return Err(BlockFsError::bounds(format!(
                "coordinate ({x},{y},{z}) is not aligned to block shape ({},{},{})",
                self.block_shape.x, self.block_shape.y, self.block_shape.z
            )));
        }
        let bz = (self.extent.z - z).min(self.block_shape.z);
        let by = (self.extent.y - y).min(self.block_shape.y);
        let bx = (self.extent.x - x).min(self.block_shape.x);
        Ok((bz, by, bx))
    }

    pub fn shard_for_offset(&self, dir_offset: u64) -> usize {
        (dir_offset % self.n_shards() as u64) as usize
    }

    /// Serialize to the JSON object written after the index file header.
    pub fn to_json(&self) -> Result<Vec<u8>, BlockFsError> {
        let mut map = serde_json::Map::new();
        map.insert("XBlockSize".into(), self.block_shape.x.into());
        map.insert("YBlockSize".into(), self.block_shape.y.into());
        map.insert("ZBlockSize".into(), self.block_shape.z.into());
        map.insert("XExtent".into(), self.extent.x.into());
        map.insert("YExtent".into(), self.extent.y.into());
        map.insert("ZExtent".into(), self.extent.z.into());
        map.insert("NOffsetBits".into(), self.entry_layout.n_offset_bits.into());
        map.insert("NSizeBits".into(), self.entry_layout.n_size_bits.into());
        map.insert("XStride".into(), self.stride.x.into());
        map.insert("YStride".into(), self.stride.y.into());
        map.insert("ZStride".into(), self.stride.z.into());
        map.insert("DType".into(), self.dtype.name().into());
        map.insert(
            "BlockFilenames".into(),
            self.block_filenames
                .iter()
                .map(|p| p.to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .into(),
        );
        map.insert("Compression".into(), self.compression.clone().into());
        map.insert("CompressionLvl".into(), self.compression_level.into());
        map.insert("Version".into(), self.version.clone().into());
        for (k, v) in &self.application_metadata {
            map.insert(k.clone(), v.clone());
        }
        serde_json::to_vec(&Value::Object(map)).map_err(BlockFsError::from)
    }

    /// Parse the JSON object following the index file header.
    pub fn from_json(bytes: &[u8]) -> Result<Self, BlockFsError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let obj = value
            .as_object()
            .ok_or_else(|| BlockFsError::format("metadata is not a JSON object"))?;

        let req_u64 = |key: &str| -> Result<u64, BlockFsError> {
            obj.get(key)
                .and_then(Value::as_u64)
                .ok_or_else(|| BlockFsError::format(format!("missing or invalid metadata key '{key}'")))
        };
        let req_i64 = |key: &str| -> Result<i64, BlockFsError> {
            obj.get(key)
                .and_then(Value::as_i64)
                .ok_or_else(|| BlockFsError::format(format!("missing or invalid metadata key '{key}'")))
        };
        let req_str = |key: &str| -> Result<String, BlockFsError> {
            obj.get(key)
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .ok_or_else(|| BlockFsError::format(format!("missing or invalid metadata key '{key}'")))
        };

        let block_shape = Extent3::new(req_u64("XBlockSize")?, req_u64("YBlockSize")?, req_u64("ZBlockSize")?);
        let extent = Extent3::new(req_u64("XExtent")?, req_u64("YExtent")?, req_u64("ZExtent")?);
        let n_offset_bits = req_u64("NOffsetBits")? as u32;
        let n_size_bits = req_u64("NSizeBits")? as u32;
        let stride = Extent3::new(req_u64("XStride")?, req_u64("YStride")?, req_u64("ZStride")?);

        let dtype_name = req_str("DType")?;
        let dtype = dtype_from_name(&dtype_name)
            .ok_or_else(|| BlockFsError::format(format!("unknown DType '{dtype_name}'")))?;

        let block_filenames: Vec<PathBuf> = obj
            .get("BlockFilenames")
            .and_then(Value::as_array)
            .ok_or_else(|| BlockFsError::format("missing or invalid metadata key 'BlockFilenames'"))?
            .iter()
            .map(|v| v.as_str().map(PathBuf::from))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| BlockFsError::format("BlockFilenames must be an array of strings"))?;
        if block_filenames.is_empty() {
            return Err(BlockFsError::format("BlockFilenames must not be empty"));
        }

        let compression = req_str("Compression")?;
        if !RECOGNIZED_CODEC_NAMES.contains(&compression.as_str()) {
            return Err(BlockFsError::format(format!(
                "unrecognized Compression codec name '{compression}'"
            )));
        }
        let compression_level = req_i64("CompressionLvl")? as i32;
        let version = req_str("Version")?;
        if version != CURRENT_VERSION {
            return Err(BlockFsError::format(format!(
                "unsupported format version '{version}', expected '{CURRENT_VERSION}'"
            )));
        }

        let known_keys = [
            "XBlockSize", "YBlockSize", "ZBlockSize", "XExtent", "YExtent", "ZExtent",
            "NOffsetBits", "NSizeBits", "XStride", "YStride", "ZStride", "DType",
            "BlockFilenames", "Compression", "CompressionLvl", "Version",
        ];
        let application_metadata = obj
            .iter()
            .filter(|(k, _)| !known_keys.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(VolumeDescriptor {
            extent,
            block_shape,
            dtype,
            stride,
            entry_layout: EntryLayout::new(n_offset_bits, n_size_bits),
            block_filenames,
            compression,
            compression_level,
            version,
            application_metadata,
        })
    }
}

fn dtype_from_name(s: &str) -> Option<DType> {
    Some(match s {
        "uint8" => DType::U8,
        "uint16" => DType::U16,
        "uint32" => DType::U32,
        "uint64" => DType::U64,
        "int8" => DType::I8,
        "int16" => DType::I16,
        "int32" => DType::I32,
        "int64" => DType::I64,
        "float32" => DType::F32,
        "float64" => DType::F64,
        _ => return None,
    })
}

/// Builder for a fresh [`VolumeDescriptor`]: collects the knobs a `create`
/// call needs before any bytes are written.
pub struct VolumeDescriptorBuilder {
    extent: Extent3,
    block_shape: Extent3,
    dtype: DType,
    stride: Option<Extent3>,
    block_filenames: Vec<PathBuf>,
    compression: String,
    compression_level: i32,
}

impl VolumeDescriptorBuilder {
    pub fn new(extent: Extent3, block_shape: Extent3, dtype: DType, n_shards: usize) -> Self {
        let block_filenames = (0..n_shards.max(1))
            .map(|i| PathBuf::from(format!("shard.{i}")))
            .collect();
        VolumeDescriptorBuilder {
            extent,
            block_shape,
            dtype,
            stride: None,
            block_filenames,
            compression: "zstd".to_string(),
            compression_level: 3,
        }
    }

    pub fn stride(mut self, stride: Extent3) -> Self {
        self.stride = Some(stride);
        self
    }

    pub fn block_filenames(mut self, filenames: Vec<PathBuf>) -> Self {
        self.block_filenames = filenames;
        self
    }

    pub fn compression(mut self, name: impl Into<String>, level: i32) -> Self {
        self.compression = name.into();
        self.compression_level = level;
        self
    }

    pub fn build(self) -> Result<VolumeDescriptor, BlockFsError> {
        if self.block_shape.x == 0 || self.block_shape.y == 0 || self.block_shape.z == 0 {
            return Err(BlockFsError::bounds("block shape must be non-zero on every axis"));
        }
        if self.block_filenames.is_empty() {
            return Err(BlockFsError::bounds("a store needs at least one shard file"));
        }
        if !RECOGNIZED_CODEC_NAMES.contains(&self.compression.as_str()) {
            return Err(BlockFsError::format(format!(
                "unrecognized Compression codec name '{}'",
                self.compression
            )));
        }

        let counts = self.extent.block_counts(self.block_shape);
        let stride = self.stride.unwrap_or_else(|| {
            let sx = 1;
            let sy = sx * counts.x;
            let sz = sy * counts.y;
            Extent3::new(sx, sy, sz)
        });

        let max_offset = stride.x * (counts.x.saturating_sub(1))
            + stride.y * (counts.y.saturating_sub(1))
            + stride.z * (counts.z.saturating_sub(1));
        let raw_block_bytes =
            self.block_shape.x * self.block_shape.y * self.block_shape.z * self.dtype.byte_width();
        let max_size = raw_block_bytes + 16;
        let entry_layout = EntryLayout::derive(max_offset, max_size);

        Ok(VolumeDescriptor {
            extent: self.extent,
            block_shape: self.block_shape,
            dtype: self.dtype,
            stride,
            entry_layout,
            block_filenames: self.block_filenames,
            compression: self.compression,
            compression_level: self.compression_level,
            version: CURRENT_VERSION.to_string(),
            application_metadata: BTreeMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_descriptor() -> VolumeDescriptor {
        VolumeDescriptorBuilder::new(Extent3::new(1024, 1024, 1024), Extent3::new(64, 64, 64), DType::U16, 1)
            .build()
            .unwrap()
    }

    #[test]
    fn default_strides_are_x_minor() {
        let d = small_descriptor();
        assert_eq!(d.stride.x, 1);
        assert_eq!(d.stride.y, 16); // ceil(1024/64)
        assert_eq!(d.stride.z, 16 * 16);
    }

    #[test]
    fn directory_offset_is_bijective_on_small_grid() {
        let d = VolumeDescriptorBuilder::new(Extent3::new(128, 128, 128), Extent3::new(64, 64, 64), DType::U8, 1)
            .build()
            .unwrap();
        let mut seen = std::collections::HashSet::new();
        for k in [0u64, 64] {
            for j in [0u64, 64] {
                for i in [0u64, 64] {
                    let off = d.directory_offset(i, j, k);
                    assert!(seen.insert(off), "offset {off} collided");
                    assert!(off < d.n_blocks());
                }
            }
        }
    }

    #[test]
    fn boundary_block_size() {
        let d = VolumeDescriptorBuilder::new(Extent3::new(100, 100, 100), Extent3::new(64, 64, 64), DType::U8, 1)
            .build()
            .unwrap();
        assert_eq!(d.block_size_at(0, 0, 0).unwrap(), (64, 64, 64));
        assert_eq!(d.block_size_at(64, 64, 64).unwrap(), (36, 36, 36));
    }

    #[test]
    fn misaligned_coordinate_is_rejected() {
        let d = small_descriptor();
        assert!(d.block_size_at(1, 0, 0).is_err());
    }

    #[test]
    fn json_roundtrip_preserves_application_metadata() {
        let mut d = small_descriptor();
        d.application_metadata.insert("Note".into(), Value::String("hand-annotated".into()));
        let bytes = d.to_json().unwrap();
        let parsed = VolumeDescriptor::from_json(&bytes).unwrap();
        assert_eq!(parsed.extent, d.extent);
        assert_eq!(parsed.stride, d.stride);
        assert_eq!(
            parsed.application_metadata.get("Note").and_then(Value::as_str),
            Some("hand-annotated")
        );
    }

    #[test]
    fn unrecognized_codec_name_is_rejected() {
        let err = VolumeDescriptorBuilder::new(Extent3::new(64, 64, 64), Extent3::new(64, 64, 64), DType::U8, 1)
            .compression("made-up", 0)
            .build();
        assert!(err.is_err());
    }
}
