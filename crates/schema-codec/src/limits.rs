//! Protocol constants and limits.

/// Slot reserved for the main block.
pub const MAIN_SLOT: u8 = 0;

/// Highest slot a separate property can be assigned.
pub const MAX_SEPARATE_SLOT: u8 = 250;

/// Pseudo slot addressing the node id in filters and sorts.
pub const ID_SLOT: u8 = 255;

/// Maximum length of a type's main block.
pub const MAX_MAIN_LEN: usize = u16::MAX as usize;

/// Strings and binaries with a declared maximum up to this size live in
/// the main block.
pub const MAX_FIXED_STRING: usize = 60;

/// Maximum declared `max_bytes` of a separate string or binary.
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

/// Maximum byte size of a vector property.
pub const MAX_VECTOR_BYTES: usize = 64 * 1024;

/// Maximum number of enum values (one byte, 0 reserved for unset).
pub const MAX_ENUM_VALUES: usize = 255;

/// Maximum number of types in one schema.
pub const MAX_TYPES: usize = u16::MAX as usize - 1;

/// Width of one SIMD comparison vector used by batched equality.
pub const VECTOR_WIDTH: usize = 16;

/// Default capacity of a write buffer.
pub const DEFAULT_MAX_BUFFER: usize = 16 * 1024 * 1024;

/// String payloads above this size are compressed by default.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 256;

/// Default zstd level for compressed string payloads.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Maximum decompressed size accepted by the decoder.
pub const MAX_DECOMPRESSED_LEN: usize = MAX_FIELD_LEN;
