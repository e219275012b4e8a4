//! Data model types.
//!
//! - Values (dynamically typed property instances)
//! - Records (structured field maps)
//! - Node handles (real ids and pending creates)

pub mod record;
pub mod value;

pub use record::Record;
pub use value::{NodeId, NodeRef, PendingId, RefValue, RefsUpdate, TypeId, Value};
