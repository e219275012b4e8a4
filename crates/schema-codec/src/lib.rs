//! Schema-driven binary codec and query compiler for a block-oriented node store.
//!
//! A declarative schema is compiled into byte layouts: each type gets a
//! fixed-size main block for its fixed-width properties and a numbered slot
//! per variable-length property. Writes are encoded into instruction
//! batches for a storage engine, queries are compiled into compact filter
//! and include descriptors, and result buffers are decoded back into
//! records.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use schema_codec::{
//!     compile, Engine, MemoryEngine, Modifier, ModifyOptions, PropDecl, Query, Record,
//!     SchemaDecl, SchemaOptions, TypeDecl, Value,
//! };
//!
//! let schema = compile(
//!     &SchemaDecl::new().type_decl(
//!         "user",
//!         TypeDecl::new()
//!             .prop("name", PropDecl::string())
//!             .prop("age", PropDecl::uint8()),
//!     ),
//!     &SchemaOptions::default(),
//! )
//! .unwrap();
//! let schema = Arc::new(schema);
//!
//! let mut engine = MemoryEngine::new(Arc::clone(&schema));
//! let mut modifier = Modifier::new(Arc::clone(&schema), ModifyOptions::default()).unwrap();
//! let bo = modifier
//!     .create("user", &Record::new().with("name", "bo").with("age", 28))
//!     .unwrap();
//! modifier.flush_with(&mut engine).unwrap();
//! let id = modifier.resolve(bo).unwrap().unwrap();
//!
//! let query = Query::node("user", id).compile(&schema).unwrap();
//! let result = query.decode(&engine.query(query.bytes()).unwrap()).unwrap();
//! let record = result.into_records().unwrap().remove(0);
//! assert_eq!(record.get("age"), Some(&Value::Int(28)));
//! ```
//!
//! # Modules
//!
//! - [`schema`]: Declarations, layout compilation and locales
//! - [`modify`]: Write encoding, pending ids and batch acknowledgment
//! - [`query`]: Filter, include and aggregate compilation
//! - [`decode`]: Result buffer decoding
//! - [`engine`]: The engine boundary and an in-memory engine
//! - [`codec`]: Wire primitives and value encodings
//! - [`validate`]: Value validation against property definitions
//! - [`error`]: Error types
//! - [`limits`]: Protocol constants and limits
//!
//! # Wire Format
//!
//! All integers are little-endian. Variable-length payloads are prefixed
//! with a `u32` length, and string payloads carry a one-byte compression
//! flag (none or zstd).

pub mod codec;
pub mod decode;
pub mod engine;
pub mod error;
pub mod limits;
pub mod model;
pub mod modify;
pub mod query;
pub mod schema;
pub mod validate;

// Re-export commonly used types at crate root
pub use decode::{decode_result, QueryResult};
pub use engine::{Engine, MemoryEngine};
pub use error::{
    DecodeError, EngineError, ModifyError, PendingResolutionError, QueryBuildError, RangeExceeded,
    SchemaError,
};
pub use model::{NodeId, NodeRef, PendingId, Record, RefValue, RefsUpdate, TypeId, Value};
pub use modify::{Batch, Modifier, ModifyOptions, PendingStatus};
pub use query::{
    Aggregate, AggregateKind, CompiledQuery, Filter, GroupBy, Include, Operator, Order, Query,
    Sort, SubQuery,
};
pub use schema::{
    compile, PropDecl, PropType, SchemaDecl, SchemaLayout, SchemaOptions, TypeDecl, TypeLayout,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
