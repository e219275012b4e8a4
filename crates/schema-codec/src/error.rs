//! Error types for schema compilation, writes, query building and decoding.
//!
//! Each stage has its own error type so callers can tell compile-time
//! failures (never sent to the engine) apart from runtime ones.

use thiserror::Error;

use crate::model::{PendingId, Value};
use crate::schema::PropType;

/// Error while compiling a schema declaration into layouts.
///
/// Any of these rejects the whole schema.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("type {type_name:?} declares property {path:?} more than once")]
    DuplicatePath { type_name: String, path: String },

    #[error("type {type_name:?} is declared more than once")]
    DuplicateType { type_name: String },

    #[error("property {type_name}.{path} references unknown type {target:?}")]
    UnknownReferenceTarget {
        type_name: String,
        path: String,
        target: String,
    },

    #[error("property {type_name}.{path}: inverse {inverse:?} on {target:?} is not a reference back to {type_name:?}")]
    InvalidInverse {
        type_name: String,
        path: String,
        target: String,
        inverse: String,
    },

    #[error("property {type_name}.{path} length {len} exceeds maximum {max}")]
    FieldTooLarge {
        type_name: String,
        path: String,
        len: usize,
        max: usize,
    },

    #[error("type {type_name:?} main block length {len} exceeds maximum {max}")]
    MainBlockTooLarge {
        type_name: String,
        len: usize,
        max: usize,
    },

    #[error("type {type_name:?} has {count} separate properties (maximum {max})")]
    TooManySeparateProps {
        type_name: String,
        count: usize,
        max: usize,
    },

    #[error("schema declares {count} types (maximum {max})")]
    TooManyTypes { count: usize, max: usize },

    #[error("enum {type_name}.{path} must declare between 1 and {max} values (got {count})")]
    InvalidEnum {
        type_name: String,
        path: String,
        count: usize,
        max: usize,
    },

    #[error("unknown locale {code:?}")]
    UnknownLocale { code: String },

    #[error("property {type_name}.{path} has an invalid default: {message}")]
    InvalidDefault {
        type_name: String,
        path: String,
        message: String,
    },

    #[error("property {type_name}.{path}: {message}")]
    InvalidProperty {
        type_name: String,
        path: String,
        message: &'static str,
    },
}

/// The write buffer cannot take the next field.
///
/// Recoverable: flush the buffer and re-issue the same operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("write buffer full: need {needed} bytes, {available} available")]
pub struct RangeExceeded {
    pub needed: usize,
    pub available: usize,
}

/// Error from a single write call.
///
/// Aborts only that call; instructions buffered by earlier calls stay valid.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModifyError {
    #[error("invalid value for {property}: {message}")]
    Invalid {
        property: String,
        value: Value,
        message: String,
    },

    #[error("unknown property {property:?} on type {type_name:?}")]
    UnknownProperty { type_name: String, property: String },

    #[error("unknown type {type_name:?}")]
    UnknownType { type_name: String },

    #[error("no active node for a field write")]
    NoActiveNode,

    #[error("record needs {needed} bytes but the write buffer holds at most {max}")]
    RecordTooLarge { needed: usize, max: usize },

    #[error("edges of {property} reference a node whose batch has not been acknowledged")]
    UnresolvedEdgeReference { property: String },

    #[error("unknown pending id {0:?}")]
    UnknownPending(PendingId),

    #[error("no batch {0} is awaiting acknowledgment")]
    UnknownBatch(u64),

    #[error(transparent)]
    Pending(#[from] PendingResolutionError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    RangeExceeded(#[from] RangeExceeded),
}

/// Error returned by the storage engine for a batch or query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("engine error: {message}")]
pub struct EngineError {
    pub message: String,
}

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<DecodeError> for EngineError {
    fn from(e: DecodeError) -> Self {
        Self::new(e.to_string())
    }
}

/// A pending id could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PendingResolutionError {
    /// The batch that created the node failed.
    #[error("batch {seq} failed: {error}")]
    Engine { seq: u64, error: EngineError },

    /// A node this one referenced failed to resolve.
    #[error("dependency {dependency:?} failed: {cause}")]
    Dependency {
        dependency: PendingId,
        cause: Box<PendingResolutionError>,
    },
}

/// Error while compiling a query. Never reaches the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryBuildError {
    #[error("unknown type {type_name:?}")]
    UnknownType { type_name: String },

    #[error("unknown field {field:?} on type {type_name:?}")]
    UnknownField { type_name: String, field: String },

    #[error("operator {operator} is not supported on {field} ({prop_type:?})")]
    UnsupportedOperator {
        field: String,
        operator: &'static str,
        prop_type: PropType,
    },

    #[error("invalid filter value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("unknown locale {code:?}")]
    UnknownLocale { code: String },

    #[error("{0}")]
    Invalid(&'static str),
}

/// Protocol error while decoding a result buffer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input while reading {context}")]
    UnexpectedEof { context: &'static str },

    #[error("{context} length {len} runs past the record boundary ({remaining} left)")]
    RecordOverrun {
        context: &'static str,
        len: usize,
        remaining: usize,
    },

    #[error("invalid opcode {opcode:#04x} in {context}")]
    InvalidOpcode { opcode: u8, context: &'static str },

    #[error("unknown slot {slot} for type {type_name:?}")]
    UnknownSlot { type_name: String, slot: u8 },

    #[error("invalid type tag {tag}")]
    InvalidTypeTag { tag: u8 },

    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("{field} length {len} exceeds maximum {max}")]
    LengthExceedsLimit {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("zstd decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("decompressed size {actual} doesn't match declared {declared}")]
    UncompressedSizeMismatch { declared: usize, actual: usize },

    #[error("malformed encoding: {context}")]
    MalformedEncoding { context: &'static str },
}
