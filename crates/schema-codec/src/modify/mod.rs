//! Write path: records to engine instruction batches.
//!
//! A [`Modifier`] appends instructions to an open buffer. [`Modifier::drain`]
//! seals it into a [`Batch`]; the caller applies the batch with the engine
//! and reports the outcome through [`Modifier::acknowledge`], which resolves
//! the pending ids created in that batch. [`Modifier::flush_with`] runs the
//! whole loop against an [`Engine`].

pub mod buffer;
pub mod encoder;
pub mod options;
pub mod pending;

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::codec::Compression;
use crate::engine::Engine;
use crate::error::{EngineError, ModifyError, PendingResolutionError, SchemaError};
use crate::model::{NodeId, NodeRef, PendingId, Record, TypeId, Value};
use crate::schema::{SchemaLayout, TypeLayout, NO_LOCALE};

use encoder::{collect_fields, Context, Encoder, NodeTarget};
use pending::{Placement, PendingRegistry, QueuedOp, WireTarget};

pub use options::ModifyOptions;
pub use pending::PendingStatus;

/// A sealed instruction buffer, ready for the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Sequence number, starting at 1. Pass it back to `acknowledge`.
    pub seq: u64,
    pub bytes: Vec<u8>,
    /// Number of `CREATE_NODE` instructions; the engine returns that many ids.
    pub creates: usize,
}

/// Outcome of one encoding attempt against a target node.
enum Written<T> {
    Done(T),
    /// The target's create is in flight; the op must wait for it.
    Deferred(PendingId),
}

/// Encodes writes for one schema.
#[derive(Debug)]
pub struct Modifier {
    schema: Arc<SchemaLayout>,
    options: ModifyOptions,
    encoder: Encoder,
    registry: PendingRegistry,
    outbox: VecDeque<Batch>,
    next_seq: u64,
    locale: u8,
}

impl Modifier {
    /// Creates a modifier. Fails if the configured text locale is not
    /// enabled in the schema.
    pub fn new(schema: Arc<SchemaLayout>, options: ModifyOptions) -> Result<Self, SchemaError> {
        let locale = match &options.locale {
            Some(code) => schema
                .locale(code)
                .map(|l| l.id)
                .ok_or_else(|| SchemaError::UnknownLocale { code: code.clone() })?,
            None => schema.locales().first().map_or(NO_LOCALE, |l| l.id),
        };
        Ok(Self {
            encoder: Encoder::new(options.max_buffer_len),
            schema,
            options,
            registry: PendingRegistry::new(),
            outbox: VecDeque::new(),
            next_seq: 1,
            locale,
        })
    }

    pub fn schema(&self) -> &Arc<SchemaLayout> {
        &self.schema
    }

    pub fn options(&self) -> &ModifyOptions {
        &self.options
    }

    /// Bytes in the open buffer.
    pub fn buffered_len(&self) -> usize {
        self.encoder.len()
    }

    /// Sealed batches waiting to be drained.
    pub fn queued_batches(&self) -> usize {
        self.outbox.len()
    }

    /// Deferred references that still wait on a target.
    pub fn outstanding(&self) -> usize {
        self.registry.outstanding()
    }

    fn layout(&self, type_name: &str) -> Result<TypeId, ModifyError> {
        self.schema
            .type_by_name(type_name)
            .map(|t| t.id)
            .ok_or_else(|| ModifyError::UnknownType {
                type_name: type_name.to_string(),
            })
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Creates a node and returns its pending id.
    pub fn create(&mut self, type_name: &str, record: &Record) -> Result<PendingId, ModifyError> {
        let type_id = self.layout(type_name)?;
        let schema = Arc::clone(&self.schema);
        let layout = type_layout(&schema, type_id)?;
        let fields = collect_fields(layout, record, self.options.unsafe_mode, true)?;
        let settings = self.settings();

        let placeholders = self.run(|encoder, registry| {
            let ctx = settings.context(registry);
            encoder.create_node(type_id, registry.next_tmp())?;
            let mut placeholders = Vec::new();
            encoder.write_create(layout, &fields, &ctx, &mut placeholders)?;
            Ok(placeholders)
        })?;

        let id = self.registry.register_create(type_id);
        for placeholder in placeholders {
            self.registry.add_obligation(id.into(), type_id, placeholder);
        }
        trace!(?id, type_name, "create buffered");
        Ok(id)
    }

    /// Updates fields of an existing or pending node.
    ///
    /// `Null` values delete the field.
    pub fn update(
        &mut self,
        type_name: &str,
        target: impl Into<NodeRef>,
        record: &Record,
    ) -> Result<(), ModifyError> {
        let type_id = self.layout(type_name)?;
        self.update_node(type_id, target.into(), record)
    }

    /// Deletes a node.
    pub fn delete(
        &mut self,
        type_name: &str,
        target: impl Into<NodeRef>,
    ) -> Result<(), ModifyError> {
        let type_id = self.layout(type_name)?;
        self.delete_node(type_id, target.into())
    }

    /// Adds `by` to a numeric field without reading it.
    pub fn increment(
        &mut self,
        type_name: &str,
        target: impl Into<NodeRef>,
        field: &str,
        by: impl Into<Value>,
    ) -> Result<(), ModifyError> {
        let type_id = self.layout(type_name)?;
        self.increment_node(type_id, target.into(), field, &by.into(), false)
    }

    /// Subtracts `by` from a numeric field without reading it.
    pub fn decrement(
        &mut self,
        type_name: &str,
        target: impl Into<NodeRef>,
        field: &str,
        by: impl Into<Value>,
    ) -> Result<(), ModifyError> {
        let type_id = self.layout(type_name)?;
        self.increment_node(type_id, target.into(), field, &by.into(), true)
    }

    fn update_node(
        &mut self,
        type_id: TypeId,
        target: NodeRef,
        record: &Record,
    ) -> Result<(), ModifyError> {
        let schema = Arc::clone(&self.schema);
        let layout = type_layout(&schema, type_id)?;
        let fields = collect_fields(layout, record, self.options.unsafe_mode, false)?;
        let settings = self.settings();

        let written = self.run(|encoder, registry| {
            let Some(node) = node_target(registry, target)? else {
                return pending_of(target).map(Written::Deferred);
            };
            let ctx = settings.context(registry);
            encoder.select_node(type_id, node)?;
            let mut placeholders = Vec::new();
            encoder.write_update(layout, &fields, &ctx, &mut placeholders)?;
            Ok(Written::Done(placeholders))
        })?;

        match written {
            Written::Done(placeholders) => {
                for placeholder in placeholders {
                    self.registry.add_obligation(target, type_id, placeholder);
                }
            }
            Written::Deferred(id) => {
                trace!(?id, "update queued behind in-flight create");
                self.registry.queue(id, QueuedOp::Update(record.clone()));
            }
        }
        Ok(())
    }

    fn delete_node(&mut self, type_id: TypeId, target: NodeRef) -> Result<(), ModifyError> {
        let written = self.run(|encoder, registry| {
            let Some(node) = node_target(registry, target)? else {
                return pending_of(target).map(Written::Deferred);
            };
            encoder.select_node(type_id, node)?;
            encoder.write_delete()?;
            Ok(Written::Done(()))
        })?;
        if let Written::Deferred(id) = written {
            self.registry.queue(id, QueuedOp::Delete);
        }
        Ok(())
    }

    fn increment_node(
        &mut self,
        type_id: TypeId,
        target: NodeRef,
        field: &str,
        by: &Value,
        decrement: bool,
    ) -> Result<(), ModifyError> {
        let schema = Arc::clone(&self.schema);
        let layout = type_layout(&schema, type_id)?;
        let prop = layout.prop(field).ok_or_else(|| ModifyError::UnknownProperty {
            type_name: layout.name.clone(),
            property: field.to_string(),
        })?;
        if !prop.is_main() || !prop.prop_type.is_numeric() || by.as_f64().is_none() {
            return Err(ModifyError::Invalid {
                property: prop.name.clone(),
                value: by.clone(),
                message: "increment needs a numeric main field and a numeric amount".to_string(),
            });
        }

        let written = self.run(|encoder, registry| {
            let Some(node) = node_target(registry, target)? else {
                return pending_of(target).map(Written::Deferred);
            };
            encoder.select_node(type_id, node)?;
            encoder.write_increment(prop, by, decrement)?;
            Ok(Written::Done(()))
        })?;
        if let Written::Deferred(id) = written {
            self.registry.queue(
                id,
                QueuedOp::Increment {
                    field: field.to_string(),
                    by: by.clone(),
                    decrement,
                },
            );
        }
        Ok(())
    }

    /// Runs one encoding attempt, re-running it on a fresh buffer if it
    /// does not fit.
    ///
    /// `op` must not have side effects outside the encoder: it can run
    /// twice, and a failed attempt is rolled back.
    fn run<T>(
        &mut self,
        op: impl Fn(&mut Encoder, &PendingRegistry) -> Result<T, ModifyError>,
    ) -> Result<T, ModifyError> {
        let checkpoint = self.encoder.checkpoint();
        let overflow = match op(&mut self.encoder, &self.registry) {
            Ok(value) => return Ok(value),
            Err(ModifyError::RangeExceeded(overflow)) => overflow,
            Err(e) => {
                self.encoder.rollback(checkpoint);
                return Err(e);
            }
        };
        self.encoder.rollback(checkpoint);
        if self.encoder.is_empty() {
            return Err(self.too_large(overflow.needed));
        }

        debug!(
            needed = overflow.needed,
            buffered = self.encoder.len(),
            "write buffer full, sealing batch"
        );
        self.seal();

        let checkpoint = self.encoder.checkpoint();
        match op(&mut self.encoder, &self.registry) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.encoder.rollback(checkpoint);
                match e {
                    ModifyError::RangeExceeded(overflow) => Err(self.too_large(overflow.needed)),
                    e => Err(e),
                }
            }
        }
    }

    fn too_large(&self, needed: usize) -> ModifyError {
        ModifyError::RecordTooLarge {
            needed,
            max: self.encoder.max(),
        }
    }

    fn settings(&self) -> Settings {
        Settings {
            compression: self.options.compression(),
            locale: self.locale,
            unsafe_mode: self.options.unsafe_mode,
        }
    }

    // =========================================================================
    // BATCHES
    // =========================================================================

    /// Seals the open buffer into the outbox. No-op when it is empty.
    fn seal(&mut self) {
        if self.encoder.is_empty() {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let bytes = self.encoder.seal();
        let creates = self.registry.seal(seq);
        debug!(seq, len = bytes.len(), creates, "sealed batch");
        self.outbox.push_back(Batch {
            seq,
            bytes,
            creates,
        });
    }

    /// Seals the open buffer and returns every batch not yet handed out,
    /// oldest first.
    pub fn drain(&mut self) -> Vec<Batch> {
        self.seal();
        self.outbox.drain(..).collect()
    }

    /// Reports the engine's outcome for batch `seq`.
    ///
    /// On success the engine returns one id per create, in submission
    /// order; on failure every pending id of the batch fails, along with
    /// everything that waits on them. Follow-up writes for references
    /// that can now be settled are buffered for the next drain.
    pub fn acknowledge(
        &mut self,
        seq: u64,
        result: Result<Vec<NodeId>, EngineError>,
    ) -> Result<(), ModifyError> {
        let creates = self
            .registry
            .take_inflight(seq)
            .ok_or(ModifyError::UnknownBatch(seq))?;

        let ids = match result {
            Ok(ids) if ids.len() == creates.len() => ids,
            Ok(ids) => {
                let error = EngineError::new(format!(
                    "batch {} returned {} ids for {} creates",
                    seq,
                    ids.len(),
                    creates.len()
                ));
                self.fail_batch(seq, &creates, error.clone());
                return Err(error.into());
            }
            Err(error) => {
                self.fail_batch(seq, &creates, error);
                return Ok(());
            }
        };

        debug!(seq, creates = creates.len(), "batch acknowledged");
        let mut resolved = Vec::with_capacity(creates.len());
        for (&pending, &node) in creates.iter().zip(&ids) {
            if self.registry.mark_resolved(pending, node) {
                resolved.push((pending, node));
            } else {
                warn!(?pending, node, "engine created a node that already failed");
            }
        }

        let mut first_error = None;
        for (pending, node) in resolved {
            if let Err(e) = self.settle(pending, node) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn fail_batch(&mut self, seq: u64, creates: &[PendingId], error: EngineError) {
        warn!(seq, %error, creates = creates.len(), "batch failed");
        for &pending in creates {
            self.registry.fail(
                pending,
                PendingResolutionError::Engine {
                    seq,
                    error: error.clone(),
                },
            );
        }
    }

    /// Replays queued ops and settles references once `pending` has an id.
    fn settle(&mut self, pending: PendingId, node: NodeId) -> Result<(), ModifyError> {
        let type_id = self
            .registry
            .type_of(pending)
            .ok_or(ModifyError::UnknownPending(pending))?;
        let mut first_error = None;
        let mut keep = |result: Result<(), ModifyError>| {
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        };

        for op in self.registry.take_queue(pending) {
            let target = NodeRef::Id(node);
            keep(match op {
                QueuedOp::Update(record) => self.update_node(type_id, target, &record),
                QueuedOp::Delete => self.delete_node(type_id, target),
                QueuedOp::Increment {
                    field,
                    by,
                    decrement,
                } => self.increment_node(type_id, target, &field, &by, decrement),
            });
        }

        for obligation in self.registry.take_obligations(pending) {
            match obligation.placement {
                Placement::Open { pos } => self.encoder.patch_placeholder(pos, node),
                Placement::Flushed => {
                    let record = obligation.follow_up(node);
                    keep(self.update_node(obligation.type_id, obligation.owner, &record));
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Drains and applies batches until nothing is left, including the
    /// follow-up writes produced by acknowledgments.
    ///
    /// Returns the first error seen; later batches are still applied.
    pub fn flush_with<E: Engine + ?Sized>(&mut self, engine: &mut E) -> Result<(), ModifyError> {
        let mut first_error = None;
        loop {
            let batches = self.drain();
            if batches.is_empty() {
                break;
            }
            for batch in batches {
                let result = engine.apply(&batch.bytes);
                if let Err(error) = &result {
                    first_error.get_or_insert(ModifyError::Engine(error.clone()));
                }
                if let Err(e) = self.acknowledge(batch.seq, result) {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // =========================================================================
    // PENDING IDS
    // =========================================================================

    pub fn status(&self, id: PendingId) -> Result<PendingStatus, ModifyError> {
        self.registry.status(id)
    }

    /// The engine id of a pending create: `None` while it is unacknowledged,
    /// an error if it failed.
    pub fn resolve(&self, id: PendingId) -> Result<Option<NodeId>, ModifyError> {
        match self.registry.status(id)? {
            PendingStatus::Resolved(node) => Ok(Some(node)),
            PendingStatus::Failed(error) => Err(error.into()),
            PendingStatus::Buffered | PendingStatus::InFlight { .. } => Ok(None),
        }
    }
}

/// Per-call encoding settings, copied into each attempt.
#[derive(Debug, Clone, Copy)]
struct Settings {
    compression: Option<Compression>,
    locale: u8,
    unsafe_mode: bool,
}

impl Settings {
    fn context<'a>(&self, registry: &'a PendingRegistry) -> Context<'a> {
        Context {
            refs: registry,
            compression: self.compression,
            locale: self.locale,
            unsafe_mode: self.unsafe_mode,
            edge_of_deferred: None,
        }
    }
}

fn type_layout(schema: &SchemaLayout, type_id: TypeId) -> Result<&TypeLayout, ModifyError> {
    schema
        .type_by_id(type_id)
        .ok_or_else(|| ModifyError::UnknownType {
            type_name: type_id.to_string(),
        })
}

/// Where the cursor must point to write to `target`; `None` when its
/// create is in flight.
fn node_target(
    registry: &PendingRegistry,
    target: NodeRef,
) -> Result<Option<NodeTarget>, ModifyError> {
    Ok(match registry.wire_target(target)? {
        WireTarget::Id(id) => Some(NodeTarget::Id(id)),
        WireTarget::Tmp(tmp) => Some(NodeTarget::Tmp(tmp)),
        WireTarget::Deferred(_) => None,
    })
}

fn pending_of(target: NodeRef) -> Result<PendingId, ModifyError> {
    match target {
        NodeRef::Pending(id) => Ok(id),
        NodeRef::Id(_) => Err(ModifyError::NoActiveNode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ops::modify as op;
    use crate::model::RefValue;
    use crate::schema::{compile, PropDecl, SchemaDecl, SchemaOptions, TypeDecl};

    fn schema() -> Arc<SchemaLayout> {
        Arc::new(
            compile(
                &SchemaDecl::new().locale("en").type_decl(
                    "user",
                    TypeDecl::new()
                        .prop("name", PropDecl::string())
                        .prop("age", PropDecl::uint8())
                        .prop("bestFriend", PropDecl::reference("user")),
                ),
                &SchemaOptions::default(),
            )
            .unwrap(),
        )
    }

    fn modifier(max: usize) -> Modifier {
        Modifier::new(schema(), ModifyOptions::with_max_buffer_len(max)).unwrap()
    }

    #[test]
    fn test_same_batch_reference_uses_tmp() {
        let mut m = modifier(1024);
        let ann = m.create("user", &Record::new().with("name", "ann")).unwrap();
        m.create("user", &Record::new().with("bestFriend", ann)).unwrap();

        let batches = m.drain();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].creates, 2);
        assert_eq!(m.status(ann).unwrap(), PendingStatus::InFlight { seq: 1 });

        // the REF_SET item of the second create points at tmp 0
        let bytes = &batches[0].bytes;
        let at = bytes
            .iter()
            .rposition(|&b| b == op::REF_SET)
            .unwrap();
        assert_eq!(&bytes[at + 1..at + 6], &[op::REF_TMP, 0, 0, 0, 0]);
    }

    #[test]
    fn test_deferred_reference_patched_in_open_buffer() {
        let mut m = modifier(1024);
        let ann = m.create("user", &Record::new().with("name", "ann")).unwrap();
        let first = m.drain();
        let bo = m.create("user", &Record::new().with("bestFriend", ann)).unwrap();
        assert_eq!(m.outstanding(), 1);

        m.acknowledge(first[0].seq, Ok(vec![10])).unwrap();
        assert_eq!(m.resolve(ann).unwrap(), Some(10));
        assert_eq!(m.outstanding(), 0);

        let second = m.drain();
        assert_eq!(second.len(), 1);
        let bytes = &second[0].bytes;
        let at = bytes.iter().rposition(|&b| b == op::REF_SET).unwrap();
        assert_eq!(&bytes[at + 1..at + 6], &[0, 10, 0, 0, 0]);
        m.acknowledge(second[0].seq, Ok(vec![11])).unwrap();
        assert_eq!(m.resolve(bo).unwrap(), Some(11));
    }

    #[test]
    fn test_deferred_reference_gets_follow_up() {
        let mut m = modifier(1024);
        let ann = m.create("user", &Record::new().with("name", "ann")).unwrap();
        let first = m.drain();
        m.create(
            "user",
            &Record::new().with("bestFriend", RefValue::new(ann)),
        )
        .unwrap();
        let second = m.drain();

        m.acknowledge(second[0].seq, Ok(vec![21])).unwrap();
        assert!(m.drain().is_empty());
        m.acknowledge(first[0].seq, Ok(vec![20])).unwrap();

        let follow_up = m.drain();
        assert_eq!(follow_up.len(), 1);
        assert_eq!(follow_up[0].creates, 0);
        let bytes = &follow_up[0].bytes;
        assert_eq!(bytes[3], op::SWITCH_NODE);
        assert_eq!(&bytes[4..8], &21u32.to_le_bytes());
        let at = bytes.iter().rposition(|&b| b == op::REF_SET).unwrap();
        assert_eq!(&bytes[at + 1..at + 6], &[0, 20, 0, 0, 0]);
    }

    #[test]
    fn test_update_of_inflight_node_is_queued() {
        let mut m = modifier(1024);
        let ann = m.create("user", &Record::new().with("name", "ann")).unwrap();
        let first = m.drain();
        m.update("user", ann, &Record::new().with("age", 31i64)).unwrap();
        assert_eq!(m.buffered_len(), 0);

        let err = m.update("user", ann, &Record::new().with("age", 300i64));
        assert!(matches!(err, Err(ModifyError::Invalid { .. })));

        m.acknowledge(first[0].seq, Ok(vec![4])).unwrap();
        let replay = m.drain();
        assert_eq!(replay.len(), 1);
        assert!(replay[0].bytes.contains(&op::MAIN_PARTIAL));
    }

    #[test]
    fn test_overflow_seals_and_retries() {
        let mut m = modifier(48);
        let a = m.create("user", &Record::new().with("name", "a".repeat(20))).unwrap();
        let b = m.create("user", &Record::new().with("name", "b".repeat(20))).unwrap();
        assert_eq!(m.queued_batches(), 1);
        assert_eq!(m.status(a).unwrap(), PendingStatus::InFlight { seq: 1 });
        assert_eq!(m.status(b).unwrap(), PendingStatus::Buffered);

        let too_big = m.create("user", &Record::new().with("name", "c".repeat(100)));
        assert!(matches!(too_big, Err(ModifyError::RecordTooLarge { max: 48, .. })));
        // b's buffer was sealed before the retry; nothing of c was written
        assert_eq!(m.status(b).unwrap(), PendingStatus::InFlight { seq: 2 });
        assert_eq!(m.buffered_len(), 0);
        assert_eq!(m.drain().len(), 2);
    }

    #[test]
    fn test_retried_record_matches_fresh_encoding() {
        let first = Record::new().with("name", "a".repeat(20));
        let record = Record::new().with("name", "b".repeat(20)).with("age", 7i64);
        let alone = |r: &Record| {
            let mut m = modifier(1024);
            m.create("user", r).unwrap();
            m.drain().remove(0).bytes
        };
        let expected = alone(&record);

        let mut m = modifier(48);
        m.create("user", &first).unwrap();
        m.create("user", &record).unwrap();
        let batches = m.drain();
        assert_eq!(batches.len(), 2);

        // the sealed batch holds the first record and nothing else
        assert_eq!(batches[0].bytes, alone(&first));
        assert_eq!(batches[0].creates, 1);

        // the retry reproduces the field instructions byte for byte
        let retried = &batches[1].bytes;
        let field = expected
            .iter()
            .position(|&b| b == op::SWITCH_FIELD)
            .unwrap();
        assert_eq!(retried.get(field), Some(&op::SWITCH_FIELD));
        assert_eq!(&retried[field..], &expected[field..]);
        assert_eq!(retried, &expected);
    }

    #[test]
    fn test_failed_batch_fails_pending() {
        let mut m = modifier(1024);
        let ann = m.create("user", &Record::new().with("name", "ann")).unwrap();
        let first = m.drain();
        let bo = m.create("user", &Record::new().with("bestFriend", ann)).unwrap();
        let second = m.drain();

        m.acknowledge(first[0].seq, Err(EngineError::new("disk full"))).unwrap();
        assert!(matches!(m.resolve(ann), Err(ModifyError::Pending(_))));
        assert!(matches!(
            m.status(bo).unwrap(),
            PendingStatus::Failed(PendingResolutionError::Dependency { .. })
        ));
        assert!(matches!(
            m.update("user", bo, &Record::new().with("age", 1i64)),
            Err(ModifyError::Pending(_))
        ));
        assert_eq!(m.acknowledge(second[0].seq, Ok(vec![3])), Ok(()));
        assert_eq!(m.acknowledge(99, Ok(vec![])), Err(ModifyError::UnknownBatch(99)));
    }

    #[test]
    fn test_unknown_locale_option() {
        let result = Modifier::new(schema(), ModifyOptions::new().locale("fr"));
        assert!(matches!(result, Err(SchemaError::UnknownLocale { .. })));
    }
}
