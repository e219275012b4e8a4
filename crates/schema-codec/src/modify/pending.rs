//! Registry of pending creates and the obligations that wait on them.
//!
//! A pending node moves `Open` (its create sits in the open buffer) to
//! `Sealed` (its batch was drained) to `Resolved` or `Failed` (the batch
//! was acknowledged). References to a sealed node are written as deferred
//! placeholders; each placeholder leaves an [`Obligation`] here that is
//! settled when the target resolves or fails.

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::error::{ModifyError, PendingResolutionError};
use crate::model::{NodeId, NodeRef, PendingId, Record, RefValue, RefsUpdate, TypeId, Value};
use crate::modify::encoder::ResolveRefs;

/// Wire form of a reference target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTarget {
    Id(NodeId),
    /// Batch-local index of a create in the same batch.
    Tmp(u32),
    /// Created in an earlier batch that has not been acknowledged.
    Deferred(PendingId),
}

/// Resolution state of a pending id, as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingStatus {
    /// The create is still in the open buffer.
    Buffered,
    /// The create was drained in batch `seq` and awaits acknowledgment.
    InFlight { seq: u64 },
    Resolved(NodeId),
    Failed(PendingResolutionError),
}

/// A write addressed to a node whose create is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedOp {
    Update(Record),
    Delete,
    Increment {
        field: String,
        by: Value,
        decrement: bool,
    },
}

/// A deferred reference written by the current call.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub target: PendingId,
    pub prop: String,
    pub many: bool,
    pub edges: Record,
    /// Position of the item's flag byte in the open buffer.
    pub pos: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The placeholder is still in the open buffer and can be patched.
    Open { pos: usize },
    /// The placeholder left with a sealed batch; a follow-up write is needed.
    Flushed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Obligation {
    pub target: PendingId,
    pub owner: NodeRef,
    pub type_id: TypeId,
    pub prop: String,
    pub many: bool,
    pub edges: Record,
    pub placement: Placement,
}

impl Obligation {
    /// The update that sets this reference once the target id is known.
    pub fn follow_up(&self, id: NodeId) -> Record {
        let item = RefValue::with_edges(id, self.edges.clone());
        let value = if self.many {
            Value::Refs(RefsUpdate::add([item]))
        } else {
            Value::Ref(item)
        };
        Record::new().with(self.prop.clone(), value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Open { tmp: u32 },
    Sealed { seq: u64 },
    Resolved(NodeId),
    Failed(PendingResolutionError),
}

#[derive(Debug, Clone)]
struct Entry {
    type_id: TypeId,
    state: State,
    queue: Vec<QueuedOp>,
}

#[derive(Debug, Default)]
pub struct PendingRegistry {
    next_id: u64,
    entries: FxHashMap<PendingId, Entry>,
    /// Creates in the open buffer, in tmp order.
    open: Vec<PendingId>,
    inflight: FxHashMap<u64, Vec<PendingId>>,
    obligations: Vec<Obligation>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch-local index the next create will get.
    pub fn next_tmp(&self) -> u32 {
        self.open.len() as u32
    }

    /// Registers a create that was written to the open buffer.
    pub fn register_create(&mut self, type_id: TypeId) -> PendingId {
        self.next_id += 1;
        let id = PendingId(self.next_id);
        let tmp = self.next_tmp();
        self.entries.insert(
            id,
            Entry {
                type_id,
                state: State::Open { tmp },
                queue: Vec::new(),
            },
        );
        self.open.push(id);
        id
    }

    pub fn type_of(&self, id: PendingId) -> Option<TypeId> {
        self.entries.get(&id).map(|e| e.type_id)
    }

    /// Resolves a node reference to its wire form.
    pub fn wire_target(&self, target: NodeRef) -> Result<WireTarget, ModifyError> {
        let id = match target {
            NodeRef::Id(id) => return Ok(WireTarget::Id(id)),
            NodeRef::Pending(id) => id,
        };
        let entry = self.entries.get(&id).ok_or(ModifyError::UnknownPending(id))?;
        match &entry.state {
            State::Open { tmp } => Ok(WireTarget::Tmp(*tmp)),
            State::Sealed { .. } => Ok(WireTarget::Deferred(id)),
            State::Resolved(node) => Ok(WireTarget::Id(*node)),
            State::Failed(error) => Err(ModifyError::Pending(error.clone())),
        }
    }

    pub fn add_obligation(&mut self, owner: NodeRef, type_id: TypeId, placeholder: Placeholder) {
        self.obligations.push(Obligation {
            target: placeholder.target,
            owner,
            type_id,
            prop: placeholder.prop,
            many: placeholder.many,
            edges: placeholder.edges,
            placement: Placement::Open {
                pos: placeholder.pos,
            },
        });
    }

    pub fn queue(&mut self, id: PendingId, op: QueuedOp) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.queue.push(op);
        }
    }

    /// Moves the open batch in flight as batch `seq`.
    pub fn seal(&mut self, seq: u64) -> usize {
        let creates = std::mem::take(&mut self.open);
        for id in &creates {
            if let Some(entry) = self.entries.get_mut(id) {
                if matches!(entry.state, State::Open { .. }) {
                    entry.state = State::Sealed { seq };
                }
            }
        }
        for obligation in &mut self.obligations {
            obligation.placement = Placement::Flushed;
        }
        let count = creates.len();
        self.inflight.insert(seq, creates);
        count
    }

    pub fn take_inflight(&mut self, seq: u64) -> Option<Vec<PendingId>> {
        self.inflight.remove(&seq)
    }

    /// Records an engine-assigned id. Returns false if the id already
    /// failed through a dependency.
    pub fn mark_resolved(&mut self, id: PendingId, node: NodeId) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) if matches!(entry.state, State::Sealed { .. }) => {
                entry.state = State::Resolved(node);
                true
            }
            _ => false,
        }
    }

    pub fn take_queue(&mut self, id: PendingId) -> Vec<QueuedOp> {
        self.entries
            .get_mut(&id)
            .map(|e| std::mem::take(&mut e.queue))
            .unwrap_or_default()
    }

    /// Removes and returns the obligations waiting on `target`.
    pub fn take_obligations(&mut self, target: PendingId) -> Vec<Obligation> {
        let (taken, kept) = std::mem::take(&mut self.obligations)
            .into_iter()
            .partition(|o| o.target == target);
        self.obligations = kept;
        taken
    }

    /// Fails a pending id and, transitively, every pending node that holds
    /// a deferred reference to it.
    pub fn fail(&mut self, root: PendingId, error: PendingResolutionError) {
        let mut work = vec![(root, error)];
        while let Some((id, error)) = work.pop() {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if matches!(entry.state, State::Resolved(_) | State::Failed(_)) {
                continue;
            }
            entry.state = State::Failed(error.clone());
            entry.queue.clear();

            self.obligations.retain(|o| o.owner != NodeRef::Pending(id));
            for obligation in self.take_obligations(id) {
                match obligation.owner {
                    NodeRef::Pending(owner) => work.push((
                        owner,
                        PendingResolutionError::Dependency {
                            dependency: id,
                            cause: Box::new(error.clone()),
                        },
                    )),
                    NodeRef::Id(owner) => warn!(
                        owner,
                        prop = %obligation.prop,
                        "dropping reference to a failed create"
                    ),
                }
            }
        }
    }

    pub fn status(&self, id: PendingId) -> Result<PendingStatus, ModifyError> {
        let entry = self.entries.get(&id).ok_or(ModifyError::UnknownPending(id))?;
        Ok(match &entry.state {
            State::Open { .. } => PendingStatus::Buffered,
            State::Sealed { seq } => PendingStatus::InFlight { seq: *seq },
            State::Resolved(node) => PendingStatus::Resolved(*node),
            State::Failed(error) => PendingStatus::Failed(error.clone()),
        })
    }

    /// Number of deferred references still waiting on a target.
    pub fn outstanding(&self) -> usize {
        self.obligations.len()
    }
}

impl ResolveRefs for PendingRegistry {
    fn wire_target(&self, target: NodeRef) -> Result<WireTarget, ModifyError> {
        PendingRegistry::wire_target(self, target)
    }

    fn pending_type(&self, target: NodeRef) -> Option<TypeId> {
        match target {
            NodeRef::Pending(id) => self.type_of(id),
            NodeRef::Id(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn placeholder(target: PendingId) -> Placeholder {
        Placeholder {
            target,
            prop: "friend".into(),
            many: false,
            edges: Record::new(),
            pos: 0,
        }
    }

    #[test]
    fn test_lifecycle() {
        let mut registry = PendingRegistry::new();
        let a = registry.register_create(1);
        assert_eq!(registry.wire_target(a.into()).unwrap(), WireTarget::Tmp(0));
        assert_eq!(registry.status(a).unwrap(), PendingStatus::Buffered);

        assert_eq!(registry.seal(1), 1);
        assert_eq!(registry.wire_target(a.into()).unwrap(), WireTarget::Deferred(a));
        assert_eq!(registry.status(a).unwrap(), PendingStatus::InFlight { seq: 1 });

        let b = registry.register_create(1);
        assert_eq!(registry.wire_target(b.into()).unwrap(), WireTarget::Tmp(0));

        assert_eq!(registry.take_inflight(1), Some(vec![a]));
        assert!(registry.mark_resolved(a, 42));
        assert_eq!(registry.wire_target(a.into()).unwrap(), WireTarget::Id(42));
    }

    #[test]
    fn test_failure_propagates_through_chain() {
        let mut registry = PendingRegistry::new();
        let c = registry.register_create(1);
        registry.seal(1);
        let b = registry.register_create(1);
        registry.add_obligation(b.into(), 1, placeholder(c));
        registry.seal(2);
        let a = registry.register_create(1);
        registry.add_obligation(a.into(), 1, placeholder(b));

        let error = PendingResolutionError::Engine {
            seq: 1,
            error: EngineError::new("disk full"),
        };
        registry.fail(c, error.clone());

        assert_eq!(registry.status(c).unwrap(), PendingStatus::Failed(error.clone()));
        let PendingStatus::Failed(PendingResolutionError::Dependency { dependency, cause }) =
            registry.status(a).unwrap()
        else {
            panic!("a should fail through b");
        };
        assert_eq!(dependency, b);
        assert!(matches!(
            *cause,
            PendingResolutionError::Dependency { dependency, .. } if dependency == c
        ));
        assert_eq!(registry.outstanding(), 0);
    }

    #[test]
    fn test_seal_flushes_placements() {
        let mut registry = PendingRegistry::new();
        let target = registry.register_create(1);
        registry.seal(1);
        registry.add_obligation(NodeRef::Id(7), 1, placeholder(target));
        registry.seal(2);
        let obligations = registry.take_obligations(target);
        assert_eq!(obligations.len(), 1);
        assert_eq!(obligations[0].placement, Placement::Flushed);
    }
}
