//! Binary encoding and decoding.
//!
//! - Primitive readers and writers with reserve/patch slots
//! - Per-type value codec for main blocks and separate payloads
//! - Opcode tables for the write, query and result protocols

pub mod ops;
pub mod primitives;
pub mod value;

pub use primitives::{Reader, Slot, Writer};
pub use value::Compression;
