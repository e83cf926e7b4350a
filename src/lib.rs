//! # blockfs — concurrent block store for dense 3-D voxel volumes
//!
//! Format guarantees (frozen for this major version):
//! - All numeric fields are little-endian; never negotiated.
//! - A directory entry packs `(file_offset, byte_count)` into
//!   `ceil((n_offset_bits + n_size_bits) / 8)` bytes; all-zero means
//!   "never written" (see [`entry`]).
//! - The index file's header, metadata length, and index base are fixed
//!   32-bit fields at the start of the file (see [`format`]).
//! - Each shard file has exactly one writer for the lifetime of a store's
//!   workers; readers tolerate a shard's index entries still being
//!   published concurrently.
//! - A block's directory offset, and therefore its shard, is a pure
//!   function of its coordinate and the store's strides — never
//!   renegotiated after `create`.

pub mod check;
pub mod codec;
pub mod descriptor;
pub mod entry;
pub mod error;
pub mod format;
pub mod store;
pub mod worker;

// Flat re-exports for the most common types.
pub use descriptor::{DType, Extent3, VolumeDescriptor, VolumeDescriptorBuilder};
pub use error::{BlockFsError, WorkerError};
pub use store::BlockStore;
