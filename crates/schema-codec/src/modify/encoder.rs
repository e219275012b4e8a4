//! Instruction encoder with an explicit cursor.
//!
//! The cursor remembers which type, node and separate field the engine
//! will apply the next instruction to, so selectors are only emitted when
//! the target changes. Every instruction (selector included) is assembled
//! off-buffer and appended whole.

use std::collections::BTreeMap;

use crate::codec::ops::modify as op;
use crate::codec::primitives::Writer;
use crate::codec::value::{write_int, write_main_value, write_separate_value, write_text_payload};
use crate::codec::Compression;
use crate::error::ModifyError;
use crate::model::{NodeId, NodeRef, PendingId, Record, RefValue, TypeId, Value};
use crate::modify::buffer::WriteBuffer;
use crate::modify::pending::{Placeholder, WireTarget};
use crate::schema::locale::{locale_id, NO_LOCALE};
use crate::schema::{PathNode, PropType, PropertyDef, TypeLayout};
use crate::validate::{validate_builtin, validate_value};

static NULL: Value = Value::Null;

/// Node addressed by the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTarget {
    Id(NodeId),
    Tmp(u32),
    /// The implicit node of an edge sub-block.
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    Idle,
    Main {
        type_id: TypeId,
        node: NodeTarget,
    },
    Separate {
        type_id: TypeId,
        node: NodeTarget,
        slot: u8,
    },
}

impl Cursor {
    fn node(&self) -> Option<(TypeId, NodeTarget)> {
        match *self {
            Cursor::Idle => None,
            Cursor::Main { type_id, node } | Cursor::Separate { type_id, node, .. } => {
                Some((type_id, node))
            }
        }
    }

    fn type_id(&self) -> Option<TypeId> {
        self.node().map(|(type_id, _)| type_id)
    }
}

/// Resolves reference targets while encoding.
pub trait ResolveRefs {
    fn wire_target(&self, target: NodeRef) -> Result<WireTarget, ModifyError>;

    /// Type of a pending node, if known.
    fn pending_type(&self, target: NodeRef) -> Option<TypeId>;
}

/// Settings shared by every field of one call.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub refs: &'a dyn ResolveRefs,
    pub compression: Option<Compression>,
    /// Locale for text written as a plain string.
    pub locale: u8,
    pub unsafe_mode: bool,
    /// Inside an edge sub-block: whether the enclosing reference is deferred.
    pub edge_of_deferred: Option<bool>,
}

/// A validated field of the current call.
#[derive(Debug, Clone, Copy)]
pub struct Field<'a> {
    index: usize,
    pub prop: &'a PropertyDef,
    pub value: &'a Value,
}

/// Saved encoder state for rolling back a failed call.
#[derive(Debug, Clone, Copy)]
pub struct Checkpoint {
    len: usize,
    cursor: Cursor,
}

#[derive(Debug)]
pub struct Encoder {
    buffer: WriteBuffer,
    cursor: Cursor,
}

impl Encoder {
    pub fn new(max: usize) -> Self {
        Self {
            buffer: WriteBuffer::new(max),
            cursor: Cursor::Idle,
        }
    }

    fn for_edges() -> Self {
        Self {
            buffer: WriteBuffer::unbounded(),
            cursor: Cursor::Main {
                type_id: 0,
                node: NodeTarget::Edge,
            },
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max(&self) -> usize {
        self.buffer.max()
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.buffer.len(),
            cursor: self.cursor,
        }
    }

    pub fn rollback(&mut self, checkpoint: Checkpoint) {
        self.buffer.truncate(checkpoint.len);
        self.cursor = checkpoint.cursor;
    }

    /// Takes the buffered instructions and resets the cursor.
    pub fn seal(&mut self) -> Vec<u8> {
        self.cursor = Cursor::Idle;
        self.buffer.take()
    }

    /// Settles a deferred placeholder that is still in this buffer.
    pub fn patch_placeholder(&mut self, pos: usize, id: NodeId) {
        let flags = self.buffer.as_bytes()[pos] & !op::REF_DEFERRED;
        self.buffer.patch_byte(pos, flags);
        self.buffer.patch_u32(pos + 1, id);
    }

    pub fn bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }

    fn emit(&mut self, w: &Writer) -> Result<usize, ModifyError> {
        Ok(self.buffer.append(w.as_bytes())?)
    }

    fn active_node(&self) -> Result<(TypeId, NodeTarget), ModifyError> {
        self.cursor.node().ok_or(ModifyError::NoActiveNode)
    }

    fn type_switch(&self, w: &mut Writer, type_id: TypeId) {
        if self.cursor.type_id() != Some(type_id) {
            w.write_byte(op::SWITCH_TYPE);
            w.write_u16(type_id);
        }
    }

    /// Emits `CREATE_NODE` and points the cursor at the new node.
    pub fn create_node(&mut self, type_id: TypeId, tmp: u32) -> Result<(), ModifyError> {
        let mut w = Writer::with_capacity(8);
        self.type_switch(&mut w, type_id);
        w.write_byte(op::CREATE_NODE);
        w.write_u32(tmp);
        self.emit(&w)?;
        self.cursor = Cursor::Main {
            type_id,
            node: NodeTarget::Tmp(tmp),
        };
        Ok(())
    }

    /// Points the cursor at an existing node, emitting selectors as needed.
    pub fn select_node(&mut self, type_id: TypeId, node: NodeTarget) -> Result<(), ModifyError> {
        if self.cursor.node() == Some((type_id, node)) {
            return Ok(());
        }
        let mut w = Writer::with_capacity(8);
        self.type_switch(&mut w, type_id);
        match node {
            NodeTarget::Id(id) => {
                w.write_byte(op::SWITCH_NODE);
                w.write_u32(id);
            }
            NodeTarget::Tmp(tmp) => {
                w.write_byte(op::SWITCH_NODE_TMP);
                w.write_u32(tmp);
            }
            NodeTarget::Edge => return Err(ModifyError::NoActiveNode),
        }
        self.emit(&w)?;
        self.cursor = Cursor::Main { type_id, node };
        Ok(())
    }

    /// Emits a node-level instruction (main block, counters, delete).
    fn node_instr(&mut self, body: &Writer) -> Result<usize, ModifyError> {
        self.active_node()?;
        self.emit(body)
    }

    /// Emits a field instruction, preceded by `SWITCH_FIELD` when the
    /// cursor is on another field. Returns the position of the body.
    fn field_instr(&mut self, prop: &PropertyDef, body: &Writer) -> Result<usize, ModifyError> {
        let (type_id, node) = self.active_node()?;
        let slot = prop.slot().ok_or(ModifyError::NoActiveNode)?;
        let mut w = Writer::with_capacity(body.len() + 3);
        let on_field = matches!(self.cursor, Cursor::Separate { slot: s, .. } if s == slot);
        if !on_field {
            w.write_byte(op::SWITCH_FIELD);
            w.write_byte(slot);
            w.write_byte(prop.prop_type as u8);
        }
        let offset = w.len();
        w.write_bytes(body.as_bytes());
        let start = self.emit(&w)?;
        self.cursor = Cursor::Separate {
            type_id,
            node,
            slot,
        };
        Ok(start + offset)
    }

    // =========================================================================
    // RECORDS
    // =========================================================================

    /// Writes every field of a node that was just created.
    pub fn write_create(
        &mut self,
        layout: &TypeLayout,
        fields: &[Field<'_>],
        ctx: &Context<'_>,
        placeholders: &mut Vec<Placeholder>,
    ) -> Result<(), ModifyError> {
        if layout.main_len > 0 {
            let mut block = layout.main_defaults.clone();
            for f in fields.iter().filter(|f| f.prop.is_main() && !f.value.is_null()) {
                write_main_field(&mut block, f)?;
            }
            let mut w = Writer::with_capacity(block.len() + 5);
            w.write_byte(op::MAIN_FULL);
            w.write_sized(&block);
            self.node_instr(&w)?;
        }
        for f in fields.iter().filter(|f| !f.prop.is_main()) {
            self.write_separate(f.prop, f.value, ctx, true, placeholders)?;
        }
        Ok(())
    }

    /// Writes changed fields of an existing node.
    pub fn write_update(
        &mut self,
        layout: &TypeLayout,
        fields: &[Field<'_>],
        ctx: &Context<'_>,
        placeholders: &mut Vec<Placeholder>,
    ) -> Result<(), ModifyError> {
        for f in fields {
            let Some(offset) = f.prop.offset() else {
                self.write_separate(f.prop, f.value, ctx, false, placeholders)?;
                continue;
            };
            let start = offset as usize;
            let mut bytes = layout.main_defaults[start..start + f.prop.len].to_vec();
            if !f.value.is_null() {
                write_main_field(&mut bytes, f)?;
            }
            let mut w = Writer::with_capacity(bytes.len() + 7);
            w.write_byte(op::MAIN_PARTIAL);
            w.write_u32(offset);
            w.write_u16(bytes.len() as u16);
            w.write_bytes(&bytes);
            self.node_instr(&w)?;
        }
        Ok(())
    }

    pub fn write_delete(&mut self) -> Result<(), ModifyError> {
        let mut w = Writer::with_capacity(1);
        w.write_byte(op::DELETE_NODE);
        self.node_instr(&w)?;
        self.cursor = Cursor::Idle;
        Ok(())
    }

    /// Emits a counter delta on a numeric main field.
    pub fn write_increment(
        &mut self,
        prop: &PropertyDef,
        by: &Value,
        decrement: bool,
    ) -> Result<(), ModifyError> {
        let offset = prop
            .offset()
            .filter(|_| prop.prop_type.is_numeric())
            .ok_or_else(|| invalid(prop, by, "increment needs a numeric main field"))?;

        let mut delta = vec![0u8; prop.len];
        if prop.prop_type == PropType::Number {
            let v = by.as_f64().ok_or_else(|| invalid(prop, by, "expected number"))?;
            delta.copy_from_slice(&v.to_le_bytes());
        } else {
            let v = by.as_int().ok_or_else(|| invalid(prop, by, "expected integer"))?;
            write_int(&mut delta, v);
        }

        let mut w = Writer::with_capacity(delta.len() + 6);
        w.write_byte(if decrement { op::DECREMENT } else { op::INCREMENT });
        w.write_byte(prop.prop_type as u8);
        w.write_u32(offset);
        w.write_bytes(&delta);
        self.node_instr(&w)?;
        Ok(())
    }

    // =========================================================================
    // SEPARATE FIELDS
    // =========================================================================

    fn write_separate(
        &mut self,
        prop: &PropertyDef,
        value: &Value,
        ctx: &Context<'_>,
        create: bool,
        placeholders: &mut Vec<Placeholder>,
    ) -> Result<(), ModifyError> {
        let mut body = Writer::new();
        match (prop.prop_type, value) {
            (_, Value::Null) => {
                if create {
                    return Ok(());
                }
                body.write_byte(op::DELETE_FIELD);
                self.field_instr(prop, &body)?;
            }
            (PropType::Text, Value::String(s)) => {
                if ctx.locale == NO_LOCALE {
                    return Err(invalid(prop, value, "no locale enabled for text"));
                }
                update_field(&mut body, |w| write_text_payload(w, ctx.locale, s, ctx.compression));
                self.field_instr(prop, &body)?;
            }
            (PropType::Text, Value::Text(map)) => {
                for (code, s) in map {
                    let locale = locale_id(code)
                        .ok_or_else(|| invalid(prop, value, "unknown locale"))?;
                    let mut body = Writer::new();
                    if s.is_empty() {
                        if create {
                            continue;
                        }
                        body.write_byte(op::DELETE_TEXT);
                        body.write_byte(locale);
                    } else {
                        update_field(&mut body, |w| write_text_payload(w, locale, s, ctx.compression));
                    }
                    self.field_instr(prop, &body)?;
                }
            }
            (PropType::Reference, _) => {
                let r = as_ref_value(prop, value)?;
                let (item, deferred) = ref_item(prop, &r, ctx)?;
                body.write_byte(op::REF_SET);
                body.write_bytes(item.as_bytes());
                let start = self.field_instr(prop, &body)?;
                if let Some(target) = deferred {
                    placeholders.push(Placeholder {
                        target,
                        prop: prop.name.clone(),
                        many: false,
                        edges: r.edges,
                        pos: start + 1,
                    });
                }
            }
            (PropType::References, Value::List(items)) => {
                let refs = items
                    .iter()
                    .map(|item| as_ref_value(prop, item))
                    .collect::<Result<Vec<_>, _>>()?;
                self.write_refs(prop, op::REFS_SET, &refs, ctx, placeholders)?;
            }
            (PropType::References, Value::Refs(update)) => {
                if let Some(set) = &update.set {
                    self.write_refs(prop, op::REFS_SET, set, ctx, placeholders)?;
                }
                if !update.add.is_empty() {
                    self.write_refs(prop, op::REFS_ADD, &update.add, ctx, placeholders)?;
                }
                if !update.delete.is_empty() {
                    self.write_refs_delete(prop, value, &update.delete, ctx)?;
                }
            }
            _ => {
                let mut payload = Writer::new();
                write_separate_value(&mut payload, prop, value, ctx.compression)
                    .map_err(|message| invalid(prop, value, &message))?;
                body.write_byte(op::UPDATE_FIELD);
                body.write_sized(payload.as_bytes());
                self.field_instr(prop, &body)?;
            }
        }
        Ok(())
    }

    fn write_refs(
        &mut self,
        prop: &PropertyDef,
        opcode: u8,
        refs: &[RefValue],
        ctx: &Context<'_>,
        placeholders: &mut Vec<Placeholder>,
    ) -> Result<(), ModifyError> {
        let mut body = Writer::new();
        body.write_byte(opcode);
        body.write_u32(refs.len() as u32);
        let mut deferred = Vec::new();
        for r in refs {
            let offset = body.len();
            let (item, target) = ref_item(prop, r, ctx)?;
            body.write_bytes(item.as_bytes());
            if let Some(target) = target {
                deferred.push((offset, target, r.edges.clone()));
            }
        }
        let start = self.field_instr(prop, &body)?;
        for (offset, target, edges) in deferred {
            placeholders.push(Placeholder {
                target,
                prop: prop.name.clone(),
                many: true,
                edges,
                pos: start + offset,
            });
        }
        Ok(())
    }

    fn write_refs_delete(
        &mut self,
        prop: &PropertyDef,
        value: &Value,
        targets: &[NodeRef],
        ctx: &Context<'_>,
    ) -> Result<(), ModifyError> {
        let mut body = Writer::new();
        body.write_byte(op::REFS_DELETE);
        body.write_u32(targets.len() as u32);
        for target in targets {
            let (flags, id) = match ctx.refs.wire_target(*target)? {
                WireTarget::Id(id) => (0, id),
                WireTarget::Tmp(tmp) => (op::REF_TMP, tmp),
                WireTarget::Deferred(_) => {
                    return Err(invalid(
                        prop,
                        value,
                        "cannot remove a reference to an unacknowledged node",
                    ));
                }
            };
            body.write_byte(flags);
            body.write_u32(id);
        }
        self.field_instr(prop, &body)?;
        Ok(())
    }
}

fn invalid(prop: &PropertyDef, value: &Value, message: &str) -> ModifyError {
    ModifyError::Invalid {
        property: prop.name.clone(),
        value: value.clone(),
        message: message.to_string(),
    }
}

fn write_main_field(block: &mut [u8], f: &Field<'_>) -> Result<(), ModifyError> {
    let Some(offset) = f.prop.offset() else {
        return Ok(());
    };
    let start = offset as usize;
    let dst = block
        .get_mut(start..start + f.prop.len)
        .ok_or_else(|| invalid(f.prop, f.value, "offset outside the main block"))?;
    write_main_value(dst, f.prop, f.value).map_err(|message| invalid(f.prop, f.value, &message))
}

fn update_field(body: &mut Writer, payload: impl FnOnce(&mut Writer)) {
    let mut w = Writer::new();
    payload(&mut w);
    body.write_byte(op::UPDATE_FIELD);
    body.write_sized(w.as_bytes());
}

fn as_ref_value(prop: &PropertyDef, value: &Value) -> Result<RefValue, ModifyError> {
    match value {
        Value::Ref(r) => Ok(r.clone()),
        Value::Int(id) => u32::try_from(*id)
            .map(RefValue::new)
            .map_err(|_| invalid(prop, value, "not a valid node id")),
        _ => Err(invalid(prop, value, "expected a reference")),
    }
}

/// Builds one `[flags][u32 target]([u32 len][edges])?` reference item.
///
/// Returns the pending target when the item is a deferred placeholder.
fn ref_item(
    prop: &PropertyDef,
    r: &RefValue,
    ctx: &Context<'_>,
) -> Result<(Writer, Option<PendingId>), ModifyError> {
    let target = ctx.refs.wire_target(r.target)?;
    if let (Some(pending), Some(expected)) = (ctx.refs.pending_type(r.target), &prop.target) {
        if pending != expected.type_id {
            return Err(invalid(
                prop,
                &Value::Ref(r.clone()),
                "target node has a different type",
            ));
        }
    }
    if let Some(outer_deferred) = ctx.edge_of_deferred {
        let unresolved = match target {
            WireTarget::Deferred(_) => true,
            WireTarget::Tmp(_) => outer_deferred,
            WireTarget::Id(_) => false,
        };
        if unresolved {
            return Err(ModifyError::UnresolvedEdgeReference {
                property: prop.name.clone(),
            });
        }
    }

    let (mut flags, id, deferred) = match target {
        WireTarget::Id(id) => (0, id, None),
        WireTarget::Tmp(tmp) => (op::REF_TMP, tmp, None),
        WireTarget::Deferred(pending) => (op::REF_DEFERRED, 0, Some(pending)),
    };

    let mut item = Writer::new();
    let edges = match &prop.edges {
        Some(layout) if !r.edges.is_empty() => {
            Some(encode_edges(layout, &r.edges, ctx, deferred.is_some())?)
        }
        None if !r.edges.is_empty() && !ctx.unsafe_mode => {
            let property = r.edges.iter().next().map(|(k, _)| k.clone()).unwrap_or_default();
            return Err(ModifyError::UnknownProperty {
                type_name: prop.name.clone(),
                property,
            });
        }
        _ => None,
    };
    if edges.is_some() {
        flags |= op::REF_EDGES;
    }
    item.write_byte(flags);
    item.write_u32(id);
    if let Some(edges) = edges {
        item.write_sized(&edges);
    }
    Ok((item, deferred))
}

/// Encodes the edge record of a reference as a field-level sub-block.
fn encode_edges(
    layout: &TypeLayout,
    edges: &Record,
    ctx: &Context<'_>,
    outer_deferred: bool,
) -> Result<Vec<u8>, ModifyError> {
    let edges: Record = edges
        .iter()
        .map(|(k, v)| (k.trim_start_matches('$').to_string(), v.clone()))
        .collect();
    let fields = collect_fields(layout, &edges, ctx.unsafe_mode, true)?;
    let edge_ctx = Context {
        edge_of_deferred: Some(outer_deferred),
        ..*ctx
    };
    let mut encoder = Encoder::for_edges();
    let mut placeholders = Vec::new();
    encoder.write_create(layout, &fields, &edge_ctx, &mut placeholders)?;
    Ok(encoder.buffer.into_bytes())
}

// =============================================================================
// FIELD COLLECTION
// =============================================================================

/// Maps a record onto a layout's properties and validates every value.
///
/// Nested objects and dotted keys both address nested paths. On create,
/// separate properties with a default are added when absent. The result is
/// in layout order (main by offset, then separate by slot).
pub fn collect_fields<'a>(
    layout: &'a TypeLayout,
    record: &'a Record,
    unsafe_mode: bool,
    create: bool,
) -> Result<Vec<Field<'a>>, ModifyError> {
    let mut fields = Vec::new();
    for (key, value) in record.iter() {
        let segments: Vec<&str> = key.split('.').collect();
        walk(layout, &layout.tree, "", &segments, value, unsafe_mode, &mut fields)?;
    }

    if create {
        for (index, prop) in layout.props.iter().enumerate() {
            if prop.is_main() {
                continue;
            }
            if let Some(default) = &prop.default {
                if !fields.iter().any(|f| f.index == index) {
                    fields.push(Field {
                        index,
                        prop,
                        value: default,
                    });
                }
            }
        }
    }

    // Stable: a later duplicate of the same path keeps its relative order.
    fields.sort_by_key(|f| f.index);

    for f in &fields {
        let checked = if unsafe_mode {
            validate_builtin(f.prop, f.value)
        } else {
            validate_value(f.prop, f.value)
        };
        checked.map_err(|message| invalid(f.prop, f.value, &message))?;
    }
    Ok(fields)
}

fn walk<'a>(
    layout: &'a TypeLayout,
    tree: &'a BTreeMap<String, PathNode>,
    prefix: &str,
    segments: &[&str],
    value: &'a Value,
    unsafe_mode: bool,
    out: &mut Vec<Field<'a>>,
) -> Result<(), ModifyError> {
    let Some((head, rest)) = segments.split_first() else {
        return Ok(());
    };
    let path = if prefix.is_empty() {
        head.to_string()
    } else {
        format!("{}.{}", prefix, head)
    };
    match tree.get(*head) {
        Some(PathNode::Leaf(index)) if rest.is_empty() => {
            out.push(Field {
                index: *index,
                prop: &layout.props[*index],
                value,
            });
            Ok(())
        }
        Some(PathNode::Branch(children)) if !rest.is_empty() => {
            walk(layout, children, &path, rest, value, unsafe_mode, out)
        }
        Some(PathNode::Branch(children)) => match value {
            Value::Object(inner) => {
                for (key, v) in inner.iter() {
                    let segments: Vec<&str> = key.split('.').collect();
                    walk(layout, children, &path, &segments, v, unsafe_mode, out)?;
                }
                Ok(())
            }
            Value::Null => {
                push_leaves(layout, children, out);
                Ok(())
            }
            _ => Err(ModifyError::Invalid {
                property: path,
                value: value.clone(),
                message: "expected an object".to_string(),
            }),
        },
        _ if unsafe_mode => Ok(()),
        _ => {
            let mut property = path;
            for segment in rest {
                property.push('.');
                property.push_str(segment);
            }
            Err(ModifyError::UnknownProperty {
                type_name: layout.name.clone(),
                property,
            })
        }
    }
}

/// Clears every leaf under a branch.
fn push_leaves<'a>(
    layout: &'a TypeLayout,
    tree: &'a BTreeMap<String, PathNode>,
    out: &mut Vec<Field<'a>>,
) {
    for node in tree.values() {
        match node {
            PathNode::Leaf(index) => out.push(Field {
                index: *index,
                prop: &layout.props[*index],
                value: &NULL,
            }),
            PathNode::Branch(children) => push_leaves(layout, children, out),
        }
    }
}
