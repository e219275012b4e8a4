//! The storage engine boundary.
//!
//! The codec never stores anything itself: write batches and query
//! descriptors go to an [`Engine`], and its answers come back as bytes.
//! [`MemoryEngine`] is the in-process reference implementation.

pub mod memory;

use crate::error::EngineError;
use crate::model::NodeId;

pub use memory::MemoryEngine;

/// A store that executes write batches and query descriptors.
pub trait Engine {
    /// Applies one batch atomically and returns the ids of its created
    /// nodes, in `CREATE_NODE` order.
    fn apply(&mut self, batch: &[u8]) -> Result<Vec<NodeId>, EngineError>;

    /// Executes a compiled query and returns the result buffer.
    fn query(&self, query: &[u8]) -> Result<Vec<u8>, EngineError>;
}

impl<E: Engine + ?Sized> Engine for &mut E {
    fn apply(&mut self, batch: &[u8]) -> Result<Vec<NodeId>, EngineError> {
        (**self).apply(batch)
    }

    fn query(&self, query: &[u8]) -> Result<Vec<u8>, EngineError> {
        (**self).query(query)
    }
}
