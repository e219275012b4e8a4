//! In-memory reference engine.
//!
//! Executes write batches and query descriptors over plain maps. Batches
//! are applied to a copy of the store and committed only if every
//! instruction succeeds. Reciprocal references are kept in sync, edge
//! payloads are shared by both sides of a relation, and deferred reference
//! placeholders are skipped (their follow-up writes arrive later).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::codec::ops::{
    aggregate as agg_op, compression, filter as filter_op, include as include_op,
    modify as modify_op, query as query_op, result as result_op,
};
use crate::codec::primitives::{Reader, Writer};
use crate::codec::value::{
    read_cardinality_hashes, read_string_payload, read_text_payload, write_int,
};
use crate::engine::Engine;
use crate::error::{DecodeError, EngineError};
use crate::limits::{ID_SLOT, MAIN_SLOT};
use crate::model::{NodeId, TypeId};
use crate::schema::{PropType, PropertyDef, SchemaLayout, TypeLayout};

fn fail(message: impl Into<String>) -> EngineError {
    EngineError::new(message)
}

// =============================================================================
// STORE
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Stored {
    /// String, alias and binary content, or raw vector bytes.
    Bytes(Vec<u8>),
    Text(BTreeMap<u8, String>),
    Sketch(BTreeSet<u64>),
    Ref(Link),
    Refs(Vec<Link>),
}

#[derive(Debug, Clone, PartialEq)]
struct Link {
    id: NodeId,
    edges: Option<Node>,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Node {
    main: Vec<u8>,
    fields: BTreeMap<u8, Stored>,
}

impl Node {
    fn new(layout: &TypeLayout) -> Self {
        Self {
            main: layout.main_defaults.clone(),
            fields: BTreeMap::new(),
        }
    }

    fn links(&self, slot: u8) -> &[Link] {
        match self.fields.get(&slot) {
            Some(Stored::Ref(link)) => std::slice::from_ref(link),
            Some(Stored::Refs(links)) => links,
            _ => &[],
        }
    }

    fn put_link(&mut self, prop: &PropertyDef, slot: u8, link: Link) {
        if prop.prop_type == PropType::Reference {
            let edges = match (link.edges, self.fields.remove(&slot)) {
                (Some(edges), _) => Some(edges),
                (None, Some(Stored::Ref(old))) if old.id == link.id => old.edges,
                (None, _) => None,
            };
            self.fields.insert(slot, Stored::Ref(Link { id: link.id, edges }));
            return;
        }
        let entry = self
            .fields
            .entry(slot)
            .or_insert_with(|| Stored::Refs(Vec::new()));
        if let Stored::Refs(links) = entry {
            match links.iter_mut().find(|l| l.id == link.id) {
                Some(existing) => {
                    if link.edges.is_some() {
                        existing.edges = link.edges;
                    }
                }
                None => links.push(link),
            }
        }
    }

    fn remove_link(&mut self, slot: u8, target: NodeId) {
        let now_empty = match self.fields.get_mut(&slot) {
            Some(Stored::Ref(link)) => link.id == target,
            Some(Stored::Refs(links)) => {
                links.retain(|l| l.id != target);
                links.is_empty()
            }
            _ => false,
        };
        if now_empty {
            self.fields.remove(&slot);
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Table {
    last_id: NodeId,
    nodes: BTreeMap<NodeId, Node>,
}

/// An [`Engine`] that keeps every node in memory.
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    schema: Arc<SchemaLayout>,
    tables: FxHashMap<TypeId, Table>,
    fail_next: Option<String>,
}

impl MemoryEngine {
    pub fn new(schema: Arc<SchemaLayout>) -> Self {
        Self {
            schema,
            tables: FxHashMap::default(),
            fail_next: None,
        }
    }

    pub fn schema(&self) -> &Arc<SchemaLayout> {
        &self.schema
    }

    /// Makes the next [`Engine::apply`] fail with `message` and leave the
    /// store untouched.
    pub fn fail_next(&mut self, message: impl Into<String>) {
        self.fail_next = Some(message.into());
    }

    /// Number of live nodes of a type.
    pub fn count(&self, type_name: &str) -> usize {
        self.schema
            .type_by_name(type_name)
            .and_then(|layout| self.tables.get(&layout.id))
            .map_or(0, |table| table.nodes.len())
    }

    pub fn contains(&self, type_name: &str, id: NodeId) -> bool {
        self.schema
            .type_by_name(type_name)
            .is_some_and(|layout| self.node(layout.id, id).is_some())
    }

    fn layout(&self, type_id: TypeId) -> Result<&TypeLayout, EngineError> {
        self.schema
            .type_by_id(type_id)
            .ok_or_else(|| fail(format!("unknown type {}", type_id)))
    }

    fn node(&self, type_id: TypeId, id: NodeId) -> Option<&Node> {
        self.tables.get(&type_id)?.nodes.get(&id)
    }
}

impl Engine for MemoryEngine {
    fn apply(&mut self, batch: &[u8]) -> Result<Vec<NodeId>, EngineError> {
        if let Some(message) = self.fail_next.take() {
            warn!(%message, "injected batch failure");
            return Err(fail(message));
        }
        let mut tables = self.tables.clone();
        let mut applier = Applier {
            schema: &self.schema,
            tables: &mut tables,
            created: Vec::new(),
            type_id: None,
            node: None,
            field: None,
        };
        applier.run(batch)?;
        let created: Vec<NodeId> = applier.created.iter().map(|&(_, id)| id).collect();
        self.tables = tables;
        debug!(len = batch.len(), created = created.len(), "applied batch");
        Ok(created)
    }

    fn query(&self, query: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut r = Reader::new(query);
        let kind = r.read_byte("query kind")?;
        let type_id = r.read_u16("query type")?;
        let layout = self.layout(type_id)?;
        let (ids, range) = match kind {
            query_op::TARGET_ID => (vec![r.read_u32("node id")?], None),
            query_op::TARGET_IDS => {
                let n = r.read_u32("id count")?;
                let ids = (0..n)
                    .map(|_| r.read_u32("node id"))
                    .collect::<Result<Vec<_>, _>>()?;
                (ids, None)
            }
            query_op::TARGET_SCAN | query_op::TARGET_AGGREGATE => {
                let range = read_range(&mut r)?;
                let ids = self
                    .tables
                    .get(&type_id)
                    .map(|t| t.nodes.keys().copied().collect())
                    .unwrap_or_default();
                (ids, Some(range))
            }
            opcode => {
                return Err(DecodeError::InvalidOpcode {
                    opcode,
                    context: "query kind",
                }
                .into());
            }
        };
        let sort = SortSpec::read(&mut r)?;
        let filter = r.read_sized("filter")?;
        let include = r.read_sized("include")?;
        let aggregate = r.read_sized("aggregate")?;

        let mut hits = Vec::new();
        for id in ids {
            let Some(node) = self.node(type_id, id) else {
                continue;
            };
            let hit = Hit {
                id,
                node,
                edge: None,
            };
            if self.matches(&hit.subject(layout, None), filter)? {
                hits.push(hit);
            }
        }
        let total = hits.len();
        let hits = self.order(sort.as_ref(), range, hits);

        let out = if kind == query_op::TARGET_AGGREGATE {
            self.aggregate(&hits, aggregate)?
        } else {
            let mut w = Writer::new();
            w.write_u32(total as u32);
            for hit in &hits {
                self.write_record(&mut w, layout, hit, None, include)?;
            }
            w.into_bytes()
        };
        debug!(type_id, total, returned = hits.len(), "executed query");
        Ok(out)
    }
}

// =============================================================================
// BATCHES
// =============================================================================

struct Applier<'a> {
    schema: &'a SchemaLayout,
    tables: &'a mut FxHashMap<TypeId, Table>,
    created: Vec<(TypeId, NodeId)>,
    type_id: Option<TypeId>,
    node: Option<NodeId>,
    /// Property index of the selected field.
    field: Option<usize>,
}

impl<'a> Applier<'a> {
    fn layout(&self, type_id: TypeId) -> Result<&'a TypeLayout, EngineError> {
        self.schema
            .type_by_id(type_id)
            .ok_or_else(|| fail(format!("unknown type {}", type_id)))
    }

    fn node_mut(&mut self, type_id: TypeId, id: NodeId) -> Result<&mut Node, EngineError> {
        self.tables
            .get_mut(&type_id)
            .and_then(|t| t.nodes.get_mut(&id))
            .ok_or_else(|| fail(format!("node {} of type {} does not exist", id, type_id)))
    }

    fn exists(&self, type_id: TypeId, id: NodeId) -> bool {
        self.tables
            .get(&type_id)
            .is_some_and(|t| t.nodes.contains_key(&id))
    }

    fn current(&self) -> Result<(TypeId, NodeId), EngineError> {
        self.type_id
            .zip(self.node)
            .ok_or_else(|| fail("no node selected"))
    }

    fn current_field(&self) -> Result<(TypeId, NodeId, &'a PropertyDef, usize), EngineError> {
        let (type_id, id) = self.current()?;
        let index = self.field.ok_or_else(|| fail("no field selected"))?;
        Ok((type_id, id, &self.layout(type_id)?.props[index], index))
    }

    fn created_id(&self, tmp: u32, type_id: TypeId) -> Result<NodeId, EngineError> {
        match self.created.get(tmp as usize) {
            Some(&(t, id)) if t == type_id => Ok(id),
            Some(_) => Err(fail(format!("tmp id {} has another type", tmp))),
            None => Err(fail(format!("tmp id {} was not created in this batch", tmp))),
        }
    }

    fn run(&mut self, batch: &[u8]) -> Result<(), EngineError> {
        let mut r = Reader::new(batch);
        while !r.is_empty() {
            let opcode = r.read_byte("opcode")?;
            match opcode {
                modify_op::SWITCH_TYPE => {
                    let type_id = r.read_u16("type id")?;
                    self.layout(type_id)?;
                    self.type_id = Some(type_id);
                    self.node = None;
                    self.field = None;
                }
                modify_op::SWITCH_NODE | modify_op::SWITCH_NODE_TMP => {
                    let raw = r.read_u32("node id")?;
                    let type_id = self.type_id.ok_or_else(|| fail("node selected before type"))?;
                    let id = if opcode == modify_op::SWITCH_NODE_TMP {
                        self.created_id(raw, type_id)?
                    } else {
                        raw
                    };
                    self.node_mut(type_id, id)?;
                    self.node = Some(id);
                    self.field = None;
                }
                modify_op::CREATE_NODE => {
                    let tmp = r.read_u32("tmp id")?;
                    let type_id = self.type_id.ok_or_else(|| fail("create before type"))?;
                    if tmp as usize != self.created.len() {
                        return Err(fail(format!("tmp id {} out of order", tmp)));
                    }
                    let layout = self.layout(type_id)?;
                    let table = self.tables.entry(type_id).or_default();
                    table.last_id += 1;
                    let id = table.last_id;
                    table.nodes.insert(id, Node::new(layout));
                    self.created.push((type_id, id));
                    self.node = Some(id);
                    self.field = None;
                }
                modify_op::SWITCH_FIELD => {
                    let slot = r.read_byte("field slot")?;
                    let tag = r.read_byte("field type")?;
                    let (type_id, _) = self.current()?;
                    self.field = Some(field_index(self.layout(type_id)?, slot, tag)?);
                }
                modify_op::MAIN_FULL => {
                    let bytes = r.read_sized("main block")?;
                    let (type_id, id) = self.current()?;
                    if bytes.len() != self.layout(type_id)?.main_len {
                        return Err(fail("main block has the wrong length"));
                    }
                    self.node_mut(type_id, id)?.main = bytes.to_vec();
                }
                modify_op::MAIN_PARTIAL => {
                    let offset = r.read_u32("main offset")? as usize;
                    let len = r.read_u16("main length")? as usize;
                    let bytes = r.read_bytes(len, "main bytes")?;
                    let (type_id, id) = self.current()?;
                    write_main(&mut self.node_mut(type_id, id)?.main, offset, bytes)?;
                }
                modify_op::INCREMENT | modify_op::DECREMENT => {
                    let tag = r.read_byte("counter type")?;
                    let offset = r.read_u32("counter offset")? as usize;
                    let prop_type = PropType::from_u8(tag)
                        .filter(|t| t.is_numeric())
                        .ok_or(DecodeError::InvalidTypeTag { tag })?;
                    let width = prop_type.fixed_width().unwrap_or(0);
                    let delta = r.read_bytes(width, "counter delta")?;
                    let (type_id, id) = self.current()?;
                    let field = self
                        .node_mut(type_id, id)?
                        .main
                        .get_mut(offset..offset + width)
                        .ok_or_else(|| fail("counter outside the main block"))?;
                    apply_delta(field, prop_type, delta, opcode == modify_op::DECREMENT);
                }
                modify_op::DELETE_NODE => {
                    let (type_id, id) = self.current()?;
                    self.delete_node(type_id, id)?;
                    self.node = None;
                    self.field = None;
                }
                modify_op::UPDATE_FIELD => {
                    let payload = r.read_sized("field payload")?;
                    let (type_id, id, prop, _) = self.current_field()?;
                    let slot = prop.slot().unwrap_or(MAIN_SLOT);
                    let node = self.node_mut(type_id, id)?;
                    let existing = node.fields.remove(&slot);
                    node.fields.insert(slot, stored_payload(prop, payload, existing)?);
                }
                modify_op::DELETE_FIELD => {
                    let (type_id, id, prop, index) = self.current_field()?;
                    let slot = prop.slot().unwrap_or(MAIN_SLOT);
                    if prop.prop_type.is_reference() {
                        let targets: Vec<NodeId> =
                            self.node_mut(type_id, id)?.links(slot).iter().map(|l| l.id).collect();
                        for target in targets {
                            self.disconnect(type_id, id, index, target)?;
                        }
                    } else {
                        self.node_mut(type_id, id)?.fields.remove(&slot);
                    }
                }
                modify_op::DELETE_TEXT => {
                    let locale = r.read_byte("text locale")?;
                    let (type_id, id, prop, _) = self.current_field()?;
                    delete_text(self.node_mut(type_id, id)?, prop, locale);
                }
                modify_op::REF_SET => {
                    let (type_id, id, prop, index) = self.current_field()?;
                    expect_type(prop, PropType::Reference)?;
                    if let Some(link) = self.read_item(&mut r, prop)? {
                        self.connect(type_id, id, index, link)?;
                    }
                }
                modify_op::REFS_SET | modify_op::REFS_ADD => {
                    let (type_id, id, prop, index) = self.current_field()?;
                    expect_type(prop, PropType::References)?;
                    let n = r.read_u32("reference count")?;
                    let mut links = Vec::new();
                    for _ in 0..n {
                        links.extend(self.read_item(&mut r, prop)?);
                    }
                    if opcode == modify_op::REFS_SET {
                        let slot = prop.slot().unwrap_or(MAIN_SLOT);
                        let old: Vec<NodeId> =
                            self.node_mut(type_id, id)?.links(slot).iter().map(|l| l.id).collect();
                        for target in old.into_iter().filter(|t| !links.iter().any(|l| l.id == *t)) {
                            self.disconnect(type_id, id, index, target)?;
                        }
                    }
                    for link in links {
                        self.connect(type_id, id, index, link)?;
                    }
                }
                modify_op::REFS_DELETE => {
                    let (type_id, id, prop, index) = self.current_field()?;
                    expect_type(prop, PropType::References)?;
                    let n = r.read_u32("reference count")?;
                    for _ in 0..n {
                        let flags = r.read_byte("reference flags")?;
                        let raw = r.read_u32("reference target")?;
                        let target = self.target_id(prop, flags, raw)?;
                        self.disconnect(type_id, id, index, target)?;
                    }
                }
                opcode => {
                    return Err(DecodeError::InvalidOpcode {
                        opcode,
                        context: "write batch",
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    fn target_id(&self, prop: &PropertyDef, flags: u8, raw: u32) -> Result<NodeId, EngineError> {
        let target_type = prop
            .target
            .as_ref()
            .map(|t| t.type_id)
            .ok_or_else(|| fail(format!("{} is not a reference", prop.name)))?;
        let id = if flags & modify_op::REF_TMP != 0 {
            self.created_id(raw, target_type)?
        } else {
            raw
        };
        if !self.exists(target_type, id) {
            return Err(fail(format!("{} references missing node {}", prop.name, id)));
        }
        Ok(id)
    }

    /// Reads one reference item. Deferred placeholders yield `None`.
    fn read_item(
        &self,
        r: &mut Reader<'_>,
        prop: &PropertyDef,
    ) -> Result<Option<Link>, EngineError> {
        let flags = r.read_byte("reference flags")?;
        let raw = r.read_u32("reference target")?;
        let edges = if flags & modify_op::REF_EDGES != 0 {
            Some(r.read_sized("reference edges")?)
        } else {
            None
        };
        if flags & modify_op::REF_DEFERRED != 0 {
            return Ok(None);
        }
        let id = self.target_id(prop, flags, raw)?;
        let edges = match (edges, prop.edges.as_deref()) {
            (Some(bytes), Some(layout)) => Some(self.edge_node(layout, bytes)?),
            (Some(_), None) => return Err(fail(format!("{} has no edge properties", prop.name))),
            (None, _) => None,
        };
        Ok(Some(Link { id, edges }))
    }

    /// Builds the edge payload of a reference from its sub-block.
    fn edge_node(&self, layout: &TypeLayout, bytes: &[u8]) -> Result<Node, EngineError> {
        let mut node = Node::new(layout);
        let mut field: Option<&PropertyDef> = None;
        let mut r = Reader::new(bytes);
        while !r.is_empty() {
            let opcode = r.read_byte("edge opcode")?;
            if opcode == modify_op::SWITCH_FIELD {
                let slot = r.read_byte("field slot")?;
                let tag = r.read_byte("field type")?;
                field = Some(&layout.props[field_index(layout, slot, tag)?]);
                continue;
            }
            if opcode == modify_op::MAIN_FULL {
                let main = r.read_sized("edge main block")?;
                if main.len() != layout.main_len {
                    return Err(fail("edge main block has the wrong length"));
                }
                node.main = main.to_vec();
                continue;
            }
            let prop = field.ok_or_else(|| fail("no edge field selected"))?;
            let slot = prop.slot().unwrap_or(MAIN_SLOT);
            match opcode {
                modify_op::UPDATE_FIELD => {
                    let payload = r.read_sized("edge payload")?;
                    let existing = node.fields.remove(&slot);
                    node.fields.insert(slot, stored_payload(prop, payload, existing)?);
                }
                modify_op::REF_SET => {
                    if let Some(link) = self.read_item(&mut r, prop)? {
                        node.put_link(prop, slot, link);
                    }
                }
                modify_op::REFS_SET | modify_op::REFS_ADD => {
                    let n = r.read_u32("reference count")?;
                    for _ in 0..n {
                        if let Some(link) = self.read_item(&mut r, prop)? {
                            node.put_link(prop, slot, link);
                        }
                    }
                }
                opcode => {
                    return Err(DecodeError::InvalidOpcode {
                        opcode,
                        context: "edge block",
                    }
                    .into());
                }
            }
        }
        Ok(node)
    }

    /// Reciprocal property of a reference: (target type, property index).
    fn inverse_of(&self, prop: &PropertyDef) -> Result<Option<(TypeId, usize)>, EngineError> {
        let Some(target) = &prop.target else {
            return Ok(None);
        };
        let Some(name) = &target.inverse else {
            return Ok(None);
        };
        let index = self
            .layout(target.type_id)?
            .prop_index(name)
            .ok_or_else(|| fail(format!("missing inverse {}", name)))?;
        Ok(Some((target.type_id, index)))
    }

    /// Links `id.prop` to `link.id`, and the inverse side back.
    fn connect(
        &mut self,
        type_id: TypeId,
        id: NodeId,
        index: usize,
        link: Link,
    ) -> Result<(), EngineError> {
        let prop = &self.layout(type_id)?.props[index];
        let slot = prop.slot().unwrap_or(MAIN_SLOT);
        if prop.prop_type == PropType::Reference {
            let old = self.node_mut(type_id, id)?.links(slot).first().map(|l| l.id);
            if let Some(old) = old.filter(|&old| old != link.id) {
                self.disconnect(type_id, id, index, old)?;
            }
        }
        let target = link.id;
        let edges = link.edges.clone();
        self.node_mut(type_id, id)?.put_link(prop, slot, link);

        let Some((inverse_type, inverse_index)) = self.inverse_of(prop)? else {
            return Ok(());
        };
        let inverse = &self.layout(inverse_type)?.props[inverse_index];
        let inverse_slot = inverse.slot().unwrap_or(MAIN_SLOT);
        if inverse.prop_type == PropType::Reference {
            let old = self
                .node_mut(inverse_type, target)?
                .links(inverse_slot)
                .first()
                .map(|l| l.id);
            if let Some(old) = old.filter(|&old| old != id) {
                self.disconnect(inverse_type, target, inverse_index, old)?;
            }
        }
        self.node_mut(inverse_type, target)?
            .put_link(inverse, inverse_slot, Link { id, edges });
        Ok(())
    }

    /// Removes the link between `id.prop` and `target` on both sides.
    fn disconnect(
        &mut self,
        type_id: TypeId,
        id: NodeId,
        index: usize,
        target: NodeId,
    ) -> Result<(), EngineError> {
        let prop = &self.layout(type_id)?.props[index];
        self.node_mut(type_id, id)?
            .remove_link(prop.slot().unwrap_or(MAIN_SLOT), target);
        if let Some((inverse_type, inverse_index)) = self.inverse_of(prop)? {
            let slot = self.layout(inverse_type)?.props[inverse_index]
                .slot()
                .unwrap_or(MAIN_SLOT);
            if let Ok(node) = self.node_mut(inverse_type, target) {
                node.remove_link(slot, id);
            }
        }
        Ok(())
    }

    fn delete_node(&mut self, type_id: TypeId, id: NodeId) -> Result<(), EngineError> {
        let layout = self.layout(type_id)?;
        for (index, prop) in layout.props.iter().enumerate() {
            if !prop.prop_type.is_reference() {
                continue;
            }
            let slot = prop.slot().unwrap_or(MAIN_SLOT);
            let targets: Vec<NodeId> = self
                .node_mut(type_id, id)?
                .links(slot)
                .iter()
                .map(|l| l.id)
                .collect();
            for target in targets {
                self.disconnect(type_id, id, index, target)?;
            }
        }
        if let Some(table) = self.tables.get_mut(&type_id) {
            table.nodes.remove(&id);
        }
        Ok(())
    }
}

fn field_index(layout: &TypeLayout, slot: u8, tag: u8) -> Result<usize, EngineError> {
    let prop = layout
        .prop_by_slot(slot)
        .ok_or_else(|| DecodeError::UnknownSlot {
            type_name: layout.name.clone(),
            slot,
        })?;
    if prop.prop_type as u8 != tag {
        return Err(DecodeError::InvalidTypeTag { tag }.into());
    }
    layout
        .prop_index(&prop.name)
        .ok_or_else(|| fail(format!("slot {} has no property", slot)))
}

fn expect_type(prop: &PropertyDef, expected: PropType) -> Result<(), EngineError> {
    if prop.prop_type == expected {
        Ok(())
    } else {
        Err(fail(format!("{} is not {:?}", prop.name, expected)))
    }
}

fn write_main(main: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), EngineError> {
    main.get_mut(offset..offset + bytes.len())
        .ok_or_else(|| fail("partial write outside the main block"))?
        .copy_from_slice(bytes);
    Ok(())
}

fn stored_payload(
    prop: &PropertyDef,
    payload: &[u8],
    existing: Option<Stored>,
) -> Result<Stored, EngineError> {
    let stored = match prop.prop_type {
        PropType::String | PropType::Alias | PropType::Binary => Stored::Bytes(read_string_payload(payload)?),
        PropType::Vector | PropType::ColVec => {
            if payload.len() != prop.len {
                return Err(fail(format!("{} expects {} vector bytes", prop.name, prop.len)));
            }
            Stored::Bytes(payload.to_vec())
        }
        PropType::Text => {
            let (locale, s) = read_text_payload(payload)?;
            let mut map = match existing {
                Some(Stored::Text(map)) => map,
                _ => BTreeMap::new(),
            };
            map.insert(locale, s);
            Stored::Text(map)
        }
        PropType::Cardinality => {
            let mut sketch = match existing {
                Some(Stored::Sketch(sketch)) => sketch,
                _ => BTreeSet::new(),
            };
            sketch.extend(read_cardinality_hashes(payload)?);
            Stored::Sketch(sketch)
        }
        t => return Err(fail(format!("{:?} has no separate payload", t))),
    };
    Ok(stored)
}

fn delete_text(node: &mut Node, prop: &PropertyDef, locale: u8) {
    let slot = prop.slot().unwrap_or(MAIN_SLOT);
    let now_empty = match node.fields.get_mut(&slot) {
        Some(Stored::Text(map)) => {
            map.remove(&locale);
            map.is_empty()
        }
        _ => false,
    };
    if now_empty {
        node.fields.remove(&slot);
    }
}

// =============================================================================
// NUMBERS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i128),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    fn compare(self, other: Num) -> Option<Ordering> {
        match (self, other) {
            (Num::Int(a), Num::Int(b)) => Some(a.cmp(&b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

/// Reads a little-endian integer of any width up to 8 bytes.
fn read_int(bytes: &[u8], signed: bool) -> i128 {
    let n = bytes.len().min(8);
    let negative = signed && n > 0 && bytes[n - 1] & 0x80 != 0;
    let mut buf = if negative { [0xFF; 8] } else { [0; 8] };
    buf[..n].copy_from_slice(&bytes[..n]);
    if signed {
        i64::from_le_bytes(buf) as i128
    } else {
        u64::from_le_bytes(buf) as i128
    }
}

fn numeric(bytes: &[u8], prop_type: PropType) -> Option<Num> {
    match prop_type {
        PropType::Number => Some(Num::Float(f64::from_le_bytes(bytes.try_into().ok()?))),
        PropType::Reference => Some(Num::Int(read_int(bytes, false))),
        t if t.is_integer() => Some(Num::Int(read_int(bytes, t.is_signed()))),
        _ => None,
    }
}

/// Adds (or subtracts) a delta in place, saturating at the type's range.
fn apply_delta(field: &mut [u8], prop_type: PropType, delta: &[u8], decrement: bool) {
    if prop_type == PropType::Number {
        let (Ok(current), Ok(delta)) = (<[u8; 8]>::try_from(&*field), <[u8; 8]>::try_from(delta)) else {
            return;
        };
        let (v, d) = (f64::from_le_bytes(current), f64::from_le_bytes(delta));
        let next = if decrement { v - d } else { v + d };
        field.copy_from_slice(&next.to_le_bytes());
        return;
    }
    let signed = prop_type.is_signed();
    let (v, d) = (read_int(field, signed), read_int(delta, signed));
    let next = if decrement { v - d } else { v + d };
    let (lo, hi) = prop_type.int_range().unwrap_or((i64::MIN, i64::MAX));
    write_int(field, next.clamp(lo as i128, hi as i128) as i64);
}

/// Content of a fixed `[len][bytes][pad]` main string.
fn fixed_content(bytes: &[u8]) -> &[u8] {
    match bytes.split_first() {
        Some((&len, rest)) => &rest[..(len as usize).min(rest.len())],
        None => bytes,
    }
}

// =============================================================================
// FILTERS
// =============================================================================

/// A node being matched: its layout and, inside a reference scope, the
/// edge payload it was reached through.
struct Subject<'n> {
    layout: &'n TypeLayout,
    id: NodeId,
    node: &'n Node,
    edge: Option<(&'n TypeLayout, &'n Node)>,
}

#[derive(Debug, Clone, Copy)]
struct Hit<'n> {
    id: NodeId,
    node: &'n Node,
    edge: Option<&'n Node>,
}

impl<'n> Hit<'n> {
    fn subject(&self, layout: &'n TypeLayout, edges: Option<&'n TypeLayout>) -> Subject<'n> {
        Subject {
            layout,
            id: self.id,
            node: self.node,
            edge: edges.zip(self.edge),
        }
    }
}

struct Condition<'q> {
    code: u8,
    slot: u8,
    prop_type: PropType,
    start: usize,
    width: usize,
    locale: u8,
    operand: &'q [u8],
}

impl<'q> Condition<'q> {
    fn read(r: &mut Reader<'q>) -> Result<Self, EngineError> {
        let code = r.read_byte("condition op")?;
        let slot = r.read_byte("condition slot")?;
        let tag = r.read_byte("condition type")?;
        let prop_type = PropType::from_u8(tag).ok_or(DecodeError::InvalidTypeTag { tag })?;
        Ok(Self {
            code,
            slot,
            prop_type,
            start: r.read_u32("condition start")? as usize,
            width: r.read_u16("condition width")? as usize,
            locale: r.read_byte("condition locale")?,
            operand: r.read_sized("condition operand")?,
        })
    }

    fn unsupported(&self) -> EngineError {
        fail(format!(
            "filter op {} does not apply to {:?}",
            self.code & !filter_op::NEGATE,
            self.prop_type
        ))
    }

    fn fixed(&self, op: u8, bytes: &[u8]) -> Result<bool, EngineError> {
        let ordering = || {
            numeric(bytes, self.prop_type)
                .zip(numeric(self.operand, self.prop_type))
                .and_then(|(v, o)| v.compare(o))
        };
        Ok(match op {
            filter_op::EQUAL => bytes == self.operand,
            filter_op::EQUAL_BATCH_SMALL | filter_op::EQUAL_BATCH_LARGE => {
                !bytes.is_empty() && self.operand.chunks_exact(bytes.len()).any(|c| c == bytes)
            }
            filter_op::GREATER => ordering() == Some(Ordering::Greater),
            filter_op::GREATER_EQ => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
            filter_op::LESS => ordering() == Some(Ordering::Less),
            filter_op::LESS_EQ => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
            filter_op::RANGE => self.in_range(bytes)?,
            _ => return Err(self.unsupported()),
        })
    }

    /// RANGE operand: `min` then `max - min`.
    fn in_range(&self, bytes: &[u8]) -> Result<bool, EngineError> {
        let w = bytes.len();
        let (min, diff) = (self.operand.get(..w), self.operand.get(w..));
        let (Some(min), Some(diff)) = (min, diff) else {
            return Err(fail("short range operand"));
        };
        if self.prop_type == PropType::Number {
            let (Some(Num::Float(v)), Some(Num::Float(lo)), Some(Num::Float(d))) = (
                numeric(bytes, PropType::Number),
                numeric(min, PropType::Number),
                numeric(diff, PropType::Number),
            ) else {
                return Err(fail("malformed number range"));
            };
            return Ok(lo <= v && v <= lo + d);
        }
        let signed = self.prop_type.is_signed();
        let delta = read_int(bytes, signed) - read_int(min, signed);
        Ok(delta >= 0 && delta <= read_int(diff, false))
    }

    fn content(&self, op: u8, candidates: &[&[u8]]) -> Result<bool, EngineError> {
        match op {
            filter_op::EQUAL_ANY => {
                let mut r = Reader::new(self.operand);
                let n = r.read_u32("value count")?;
                for _ in 0..n {
                    let wanted = r.read_sized("value")?;
                    if candidates.contains(&wanted) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            filter_op::INCLUDES => Ok(candidates.iter().any(|c| contains(c, self.operand))),
            _ => Err(self.unsupported()),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

impl MemoryEngine {
    fn matches(&self, subject: &Subject<'_>, block: &[u8]) -> Result<bool, EngineError> {
        self.eval(subject, block, 0, block.len())
    }

    /// Evaluates the items in `block[start..end]`. OR jumps are relative to
    /// the start of `block`.
    fn eval(
        &self,
        s: &Subject<'_>,
        block: &[u8],
        start: usize,
        end: usize,
    ) -> Result<bool, EngineError> {
        let items = block
            .get(start..end)
            .ok_or_else(|| fail("filter jump out of range"))?;
        let mut r = Reader::new(items);
        while !r.is_empty() {
            let at = start + r.position();
            match r.read_byte("filter item")? {
                filter_op::COND => {
                    let cond = Condition::read(&mut r)?;
                    if !self.condition(s, &cond)? {
                        return Ok(false);
                    }
                }
                filter_op::OR => {
                    let jump = r.read_u32("or jump")? as usize;
                    let right = r.read_u32("or right size")? as usize;
                    let left_start = at + filter_op::OR_HEADER;
                    if jump < left_start {
                        return Err(fail("or jump points backwards"));
                    }
                    let hit = self.eval(s, block, left_start, jump)?
                        || self.eval(s, block, jump, jump + right)?;
                    if !hit {
                        return Ok(false);
                    }
                    r.read_bytes(jump + right - left_start, "or items")?;
                }
                code @ (filter_op::REF | filter_op::REFS) => {
                    let slot = r.read_byte("reference slot")?;
                    r.read_u16("reference type")?;
                    let body = r.read_sized("reference block")?;
                    let single = code == filter_op::REF;
                    if !self.any_link(s, slot, single, body)? {
                        return Ok(false);
                    }
                }
                filter_op::EDGE => {
                    let body = r.read_sized("edge block")?;
                    let Some((layout, node)) = s.edge else {
                        return Ok(false);
                    };
                    let edge = Subject {
                        layout,
                        id: 0,
                        node,
                        edge: None,
                    };
                    if !self.matches(&edge, body)? {
                        return Ok(false);
                    }
                }
                opcode => {
                    return Err(DecodeError::InvalidOpcode {
                        opcode,
                        context: "filter block",
                    }
                    .into());
                }
            }
        }
        Ok(true)
    }

    fn any_link(
        &self,
        s: &Subject<'_>,
        slot: u8,
        single: bool,
        body: &[u8],
    ) -> Result<bool, EngineError> {
        let prop = s.layout.prop_by_slot(slot).ok_or_else(|| DecodeError::UnknownSlot {
            type_name: s.layout.name.clone(),
            slot,
        })?;
        let target_type = prop
            .target
            .as_ref()
            .map(|t| t.type_id)
            .ok_or_else(|| fail(format!("{} is not a reference", prop.name)))?;
        let target_layout = self.layout(target_type)?;
        let links = s.node.links(slot);
        let links = if single { &links[..links.len().min(1)] } else { links };
        for link in links {
            let Some(node) = self.node(target_type, link.id) else {
                continue;
            };
            let hit = Hit {
                id: link.id,
                node,
                edge: link.edges.as_ref(),
            };
            if self.matches(&hit.subject(target_layout, prop.edges.as_deref()), body)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn condition(&self, s: &Subject<'_>, cond: &Condition<'_>) -> Result<bool, EngineError> {
        let negate = cond.code & filter_op::NEGATE != 0;
        let op = cond.code & !filter_op::NEGATE;
        let hit = match cond.slot {
            ID_SLOT => cond.fixed(op, &s.id.to_le_bytes())?,
            MAIN_SLOT => {
                let bytes = s
                    .node
                    .main
                    .get(cond.start..cond.start + cond.width)
                    .ok_or_else(|| fail("condition outside the main block"))?;
                if matches!(cond.prop_type, PropType::String | PropType::Binary) {
                    cond.content(op, &[fixed_content(bytes)])?
                } else {
                    cond.fixed(op, bytes)?
                }
            }
            slot => self.separate(s.node.fields.get(&slot), op, cond)?,
        };
        Ok(hit != negate)
    }

    fn separate(
        &self,
        field: Option<&Stored>,
        op: u8,
        cond: &Condition<'_>,
    ) -> Result<bool, EngineError> {
        if op == filter_op::EXISTS {
            return Ok(match field {
                None => false,
                Some(Stored::Refs(links)) => !links.is_empty(),
                Some(Stored::Text(map)) if cond.locale != 0 => map.contains_key(&cond.locale),
                Some(Stored::Text(map)) => !map.is_empty(),
                Some(_) => true,
            });
        }
        match field {
            None => Ok(false),
            Some(Stored::Ref(link)) => cond.fixed(op, &link.id.to_le_bytes()),
            Some(Stored::Refs(links)) if op == filter_op::INCLUDES => Ok(cond
                .operand
                .chunks_exact(4)
                .any(|c| links.iter().any(|l| l.id.to_le_bytes() == c))),
            Some(Stored::Bytes(bytes)) => cond.content(op, &[bytes.as_slice()]),
            Some(Stored::Text(map)) => {
                let texts: Vec<&[u8]> = if cond.locale != 0 {
                    map.get(&cond.locale).map(|s| s.as_bytes()).into_iter().collect()
                } else {
                    map.values().map(|s| s.as_bytes()).collect()
                };
                cond.content(op, &texts)
            }
            Some(_) => Err(cond.unsupported()),
        }
    }
}

// =============================================================================
// SORT AND RANGE
// =============================================================================

fn read_range(r: &mut Reader<'_>) -> Result<(usize, usize), EngineError> {
    let offset = r.read_u32("range offset")? as usize;
    let limit = r.read_u32("range limit")? as usize;
    Ok((offset, limit))
}

struct SortSpec {
    desc: bool,
    slot: u8,
    prop_type: PropType,
    start: usize,
    len: usize,
    locale: u8,
}

impl SortSpec {
    fn read(r: &mut Reader<'_>) -> Result<Option<Self>, EngineError> {
        if r.read_byte("sort flag")? == 0 {
            return Ok(None);
        }
        let desc = r.read_byte("sort order")? == query_op::ORDER_DESC;
        let slot = r.read_byte("sort slot")?;
        let tag = r.read_byte("sort type")?;
        Ok(Some(Self {
            desc,
            slot,
            prop_type: PropType::from_u8(tag).ok_or(DecodeError::InvalidTypeTag { tag })?,
            start: r.read_u32("sort start")? as usize,
            len: r.read_u16("sort len")? as usize,
            locale: r.read_byte("sort locale")?,
        }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SortKey {
    Missing,
    Num(Num),
    Bytes(Vec<u8>),
}

fn compare_keys(a: &SortKey, b: &SortKey) -> Ordering {
    match (a, b) {
        (SortKey::Missing, SortKey::Missing) => Ordering::Equal,
        (SortKey::Missing, _) => Ordering::Less,
        (_, SortKey::Missing) => Ordering::Greater,
        (SortKey::Num(x), SortKey::Num(y)) => x.compare(*y).unwrap_or(Ordering::Equal),
        (SortKey::Bytes(x), SortKey::Bytes(y)) => x.cmp(y),
        (SortKey::Num(_), SortKey::Bytes(_)) => Ordering::Less,
        (SortKey::Bytes(_), SortKey::Num(_)) => Ordering::Greater,
    }
}

impl MemoryEngine {
    /// `[locale, fallback...]`, or empty for "any locale".
    fn locale_chain(&self, locale: u8) -> Vec<u8> {
        if locale == 0 {
            return Vec::new();
        }
        let mut chain = vec![locale];
        if let Some(l) = self.schema.locale_by_id(locale) {
            chain.extend(&l.fallback);
        }
        chain
    }

    fn sort_key(&self, spec: &SortSpec, hit: &Hit<'_>) -> SortKey {
        match spec.slot {
            ID_SLOT => SortKey::Num(Num::Int(hit.id as i128)),
            MAIN_SLOT => {
                let Some(bytes) = hit.node.main.get(spec.start..spec.start + spec.len) else {
                    return SortKey::Missing;
                };
                match spec.prop_type {
                    PropType::String | PropType::Binary => SortKey::Bytes(fixed_content(bytes).to_vec()),
                    t => numeric(bytes, t).map_or_else(|| SortKey::Bytes(bytes.to_vec()), SortKey::Num),
                }
            }
            slot => match hit.node.fields.get(&slot) {
                Some(Stored::Bytes(bytes)) => SortKey::Bytes(bytes.clone()),
                Some(Stored::Text(map)) => self
                    .locale_chain(spec.locale)
                    .iter()
                    .find_map(|l| map.get(l))
                    .or_else(|| map.values().next())
                    .map_or(SortKey::Missing, |s| SortKey::Bytes(s.as_bytes().to_vec())),
                _ => SortKey::Missing,
            },
        }
    }

    /// Sorts (ties by id) and applies the range.
    fn order<'n>(
        &self,
        sort: Option<&SortSpec>,
        range: Option<(usize, usize)>,
        hits: Vec<Hit<'n>>,
    ) -> Vec<Hit<'n>> {
        let mut hits = hits;
        if let Some(spec) = sort {
            let mut keyed: Vec<(SortKey, Hit<'n>)> =
                hits.into_iter().map(|h| (self.sort_key(spec, &h), h)).collect();
            keyed.sort_by(|(ka, a), (kb, b)| {
                let ord = compare_keys(ka, kb);
                let ord = if spec.desc { ord.reverse() } else { ord };
                ord.then(a.id.cmp(&b.id))
            });
            hits = keyed.into_iter().map(|(_, h)| h).collect();
        }
        match range {
            Some((offset, limit)) => hits.into_iter().skip(offset).take(limit).collect(),
            None => hits,
        }
    }
}

// =============================================================================
// RESULTS
// =============================================================================

impl MemoryEngine {
    /// Writes `[u32 id][u32 size] instr* END`.
    fn write_record(
        &self,
        w: &mut Writer,
        layout: &TypeLayout,
        hit: &Hit<'_>,
        edges: Option<&TypeLayout>,
        include: &[u8],
    ) -> Result<(), EngineError> {
        w.write_u32(hit.id);
        let size = w.open_sized();
        let edge = edges.zip(hit.edge);
        self.write_body(w, layout, hit.node, edge, include)?;
        w.close_sized(size);
        Ok(())
    }

    fn write_body(
        &self,
        w: &mut Writer,
        layout: &TypeLayout,
        node: &Node,
        edge: Option<(&TypeLayout, &Node)>,
        include: &[u8],
    ) -> Result<(), EngineError> {
        let mut r = Reader::new(include);
        while !r.is_empty() {
            match r.read_byte("include item")? {
                include_op::MAIN => {
                    let n = r.read_u16("main ranges")?;
                    w.write_byte(result_op::MAIN);
                    if n == 0 {
                        w.write_sized(&node.main);
                        continue;
                    }
                    let mut bytes = Vec::new();
                    for _ in 0..n {
                        let start = r.read_u32("main start")? as usize;
                        let len = r.read_u16("main len")? as usize;
                        let slice = node
                            .main
                            .get(start..start + len)
                            .ok_or_else(|| fail("include outside the main block"))?;
                        bytes.extend_from_slice(slice);
                    }
                    w.write_sized(&bytes);
                }
                include_op::FIELD => {
                    let slot = r.read_byte("field slot")?;
                    r.read_byte("field type")?;
                    let locale = r.read_byte("field locale")?;
                    self.write_field(w, layout, node, slot, locale)?;
                }
                code @ (include_op::REF | include_op::REFS) => {
                    let slot = r.read_byte("reference slot")?;
                    r.read_u16("reference type")?;
                    let range = read_range(&mut r)?;
                    let sort = SortSpec::read(&mut r)?;
                    let filter = r.read_sized("reference filter")?;
                    let nested = r.read_sized("reference include")?;
                    let many = code == include_op::REFS;
                    self.write_refs(
                        w,
                        layout,
                        node,
                        slot,
                        many,
                        (range, sort.as_ref()),
                        filter,
                        nested,
                    )?;
                }
                include_op::EDGE => {
                    let nested = r.read_sized("edge include")?;
                    if let Some((edge_layout, edge_node)) = edge {
                        w.write_byte(result_op::EDGE);
                        let size = w.open_sized();
                        self.write_body(w, edge_layout, edge_node, None, nested)?;
                        w.close_sized(size);
                    }
                }
                include_op::COUNT => {
                    let slot = r.read_byte("count slot")?;
                    w.write_byte(result_op::AGG);
                    w.write_byte(slot);
                    w.write_byte(agg_op::COUNT);
                    w.write_u64(node.links(slot).len() as u64);
                }
                opcode => {
                    return Err(DecodeError::InvalidOpcode {
                        opcode,
                        context: "include descriptor",
                    }
                    .into());
                }
            }
        }
        w.write_byte(result_op::END);
        Ok(())
    }

    fn write_field(
        &self,
        w: &mut Writer,
        layout: &TypeLayout,
        node: &Node,
        slot: u8,
        locale: u8,
    ) -> Result<(), EngineError> {
        let prop = layout.prop_by_slot(slot).ok_or_else(|| DecodeError::UnknownSlot {
            type_name: layout.name.clone(),
            slot,
        })?;
        let mut emit = |payload: &[u8]| {
            w.write_byte(result_op::FIELD);
            w.write_byte(slot);
            w.write_sized(payload);
        };
        match node.fields.get(&slot) {
            None | Some(Stored::Ref(_) | Stored::Refs(_)) => {}
            Some(Stored::Bytes(bytes)) => {
                if matches!(prop.prop_type, PropType::Vector | PropType::ColVec) {
                    emit(bytes);
                } else {
                    let mut payload = Vec::with_capacity(bytes.len() + 1);
                    payload.push(compression::NONE);
                    payload.extend_from_slice(bytes);
                    emit(&payload);
                }
            }
            Some(Stored::Text(map)) => {
                let chain = self.locale_chain(locale);
                let locales: Vec<u8> = if chain.is_empty() {
                    map.keys().copied().collect()
                } else {
                    chain.into_iter().filter(|l| map.contains_key(l)).collect()
                };
                for l in locales {
                    if let Some(s) = map.get(&l) {
                        let mut payload = Vec::with_capacity(s.len() + 2);
                        payload.push(l);
                        payload.push(compression::NONE);
                        payload.extend_from_slice(s.as_bytes());
                        emit(&payload);
                    }
                }
            }
            Some(Stored::Sketch(sketch)) => emit(&(sketch.len() as u32).to_le_bytes()),
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_refs(
        &self,
        w: &mut Writer,
        layout: &TypeLayout,
        node: &Node,
        slot: u8,
        many: bool,
        (range, sort): ((usize, usize), Option<&SortSpec>),
        filter: &[u8],
        include: &[u8],
    ) -> Result<(), EngineError> {
        let prop = layout.prop_by_slot(slot).ok_or_else(|| DecodeError::UnknownSlot {
            type_name: layout.name.clone(),
            slot,
        })?;
        let target_type = prop
            .target
            .as_ref()
            .map(|t| t.type_id)
            .ok_or_else(|| fail(format!("{} is not a reference", prop.name)))?;
        let target_layout = self.layout(target_type)?;
        let edges = prop.edges.as_deref();

        let mut hits = Vec::new();
        for link in node.links(slot) {
            let Some(target) = self.node(target_type, link.id) else {
                continue;
            };
            let hit = Hit {
                id: link.id,
                node: target,
                edge: link.edges.as_ref(),
            };
            if self.matches(&hit.subject(target_layout, edges), filter)? {
                hits.push(hit);
            }
        }
        let hits = self.order(sort, Some(range), hits);

        if !many {
            if let Some(hit) = hits.first() {
                w.write_byte(result_op::REF);
                w.write_byte(slot);
                let size = w.open_sized();
                self.write_record(w, target_layout, hit, edges, include)?;
                w.close_sized(size);
            }
            return Ok(());
        }
        w.write_byte(result_op::REFS);
        w.write_byte(slot);
        let size = w.open_sized();
        w.write_u32(hits.len() as u32);
        for hit in &hits {
            self.write_record(w, target_layout, hit, edges, include)?;
        }
        w.close_sized(size);
        Ok(())
    }
}

// =============================================================================
// AGGREGATES
// =============================================================================

struct FieldSpec {
    slot: u8,
    prop_type: Option<PropType>,
    start: usize,
    len: usize,
}

impl FieldSpec {
    fn read(r: &mut Reader<'_>) -> Result<Self, EngineError> {
        Ok(Self {
            slot: r.read_byte("aggregate slot")?,
            prop_type: PropType::from_u8(r.read_byte("aggregate type")?),
            start: r.read_u32("aggregate start")? as usize,
            len: r.read_u16("aggregate len")? as usize,
        })
    }

    fn main<'n>(&self, node: &'n Node) -> Option<&'n [u8]> {
        node.main.get(self.start..self.start + self.len)
    }

    fn number(&self, node: &Node) -> Option<f64> {
        numeric(self.main(node)?, self.prop_type?).map(Num::as_f64)
    }
}

impl MemoryEngine {
    fn group_key(&self, group: &FieldSpec, bucket: u64, hit: &Hit<'_>) -> Option<Vec<u8>> {
        if group.slot != MAIN_SLOT {
            return match hit.node.fields.get(&group.slot) {
                Some(Stored::Bytes(bytes)) => Some(bytes.clone()),
                _ => None,
            };
        }
        let bytes = group.main(hit.node)?;
        if bucket == 0 {
            return Some(bytes.to_vec());
        }
        match numeric(bytes, group.prop_type?)? {
            Num::Int(v) => {
                let b = bucket as i128;
                let start = (v.div_euclid(b) * b).clamp(i64::MIN as i128, i64::MAX as i128) as i64;
                Some(start.to_le_bytes().to_vec())
            }
            Num::Float(f) => {
                let b = bucket as f64;
                Some(((f / b).floor() * b).to_le_bytes().to_vec())
            }
        }
    }

    fn aggregate(&self, hits: &[Hit<'_>], descriptor: &[u8]) -> Result<Vec<u8>, EngineError> {
        let mut r = Reader::new(descriptor);
        let group = match r.read_byte("group flag")? {
            0 => None,
            1 => {
                let field = FieldSpec::read(&mut r)?;
                Some((field, r.read_u64("bucket width")?))
            }
            _ => {
                return Err(DecodeError::MalformedEncoding {
                    context: "group flag",
                }
                .into());
            }
        };
        let n = r.read_u16("aggregate count")? as usize;
        let mut specs = Vec::with_capacity(n);
        for _ in 0..n {
            let kind = r.read_byte("aggregate kind")?;
            let field = FieldSpec::read(&mut r)?;
            let result = r.read_u16("aggregate result")? as usize;
            if result >= n {
                return Err(fail("aggregate result index out of range"));
            }
            specs.push((kind, field, result));
        }

        let mut groups: BTreeMap<Vec<u8>, Vec<&Hit<'_>>> = BTreeMap::new();
        match &group {
            None => {
                groups.insert(Vec::new(), hits.iter().collect());
            }
            Some((field, bucket)) => {
                for hit in hits {
                    if let Some(key) = self.group_key(field, *bucket, hit) {
                        groups.entry(key).or_default().push(hit);
                    }
                }
            }
        }

        let mut w = Writer::new();
        w.write_u32(groups.len() as u32);
        for (key, members) in &groups {
            w.write_sized(key);
            let mut values = vec![0u64; n];
            for (kind, field, result) in &specs {
                values[*result] = compute(*kind, field, members)?;
            }
            for v in values {
                w.write_u64(v);
            }
        }
        Ok(w.into_bytes())
    }
}

/// One aggregate over a group. Counts are integers; the rest are `f64`
/// bits, NaN when the group has no values.
fn compute(kind: u8, field: &FieldSpec, members: &[&Hit<'_>]) -> Result<u64, EngineError> {
    let numbers = || members.iter().filter_map(|h| field.number(h.node));
    let float = |v: Option<f64>| v.unwrap_or(f64::NAN).to_bits();
    Ok(match kind {
        agg_op::COUNT if field.prop_type.is_none() || field.slot == MAIN_SLOT => members.len() as u64,
        agg_op::COUNT => members
            .iter()
            .filter(|h| h.node.fields.contains_key(&field.slot))
            .count() as u64,
        agg_op::SUM => numbers().sum::<f64>().to_bits(),
        agg_op::AVG => {
            let (sum, n) = numbers().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
            float((n > 0).then(|| sum / n as f64))
        }
        agg_op::MIN => float(numbers().reduce(f64::min)),
        agg_op::MAX => float(numbers().reduce(f64::max)),
        agg_op::CARDINALITY => {
            if field.slot == MAIN_SLOT {
                let distinct: FxHashSet<&[u8]> =
                    members.iter().filter_map(|h| field.main(h.node)).collect();
                return Ok(distinct.len() as u64);
            }
            let mut hashes: FxHashSet<u64> = FxHashSet::default();
            let mut contents: FxHashSet<&[u8]> = FxHashSet::default();
            for h in members {
                match h.node.fields.get(&field.slot) {
                    Some(Stored::Sketch(sketch)) => hashes.extend(sketch),
                    Some(Stored::Bytes(bytes)) => {
                        contents.insert(bytes);
                    }
                    _ => {}
                }
            }
            (hashes.len() + contents.len()) as u64
        }
        kind => {
            return Err(DecodeError::InvalidOpcode {
                opcode: kind,
                context: "aggregate kind",
            }
            .into());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{compile, PropDecl, SchemaDecl, SchemaOptions, TypeDecl};

    fn engine() -> MemoryEngine {
        let schema = compile(
            &SchemaDecl::new().type_decl(
                "user",
                TypeDecl::new()
                    .prop("age", PropDecl::uint8())
                    .prop("score", PropDecl::int16())
                    .prop("friends", PropDecl::references("user")),
            ),
            &SchemaOptions::default(),
        )
        .unwrap();
        MemoryEngine::new(Arc::new(schema))
    }

    fn create(w: &mut Writer, tmp: u32, age: u8) {
        w.write_byte(modify_op::CREATE_NODE);
        w.write_u32(tmp);
        w.write_byte(modify_op::MAIN_FULL);
        w.write_sized(&[0, 0, age]);
    }

    #[test]
    fn test_read_int_sign_extension() {
        assert_eq!(read_int(&[0xFF], true), -1);
        assert_eq!(read_int(&[0xFF], false), 255);
        assert_eq!(read_int(&[0x00, 0x80], true), i16::MIN as i128);
    }

    #[test]
    fn test_counter_saturates() {
        let mut field = [250u8];
        apply_delta(&mut field, PropType::Uint8, &[10], false);
        assert_eq!(field, [255]);
        apply_delta(&mut field, PropType::Uint8, &[255], true);
        apply_delta(&mut field, PropType::Uint8, &[1], true);
        assert_eq!(field, [0]);
    }

    #[test]
    fn test_failed_batch_leaves_store_untouched() {
        let mut engine = engine();
        let mut w = Writer::new();
        w.write_byte(modify_op::SWITCH_TYPE);
        w.write_u16(1);
        create(&mut w, 0, 30);
        w.write_byte(modify_op::SWITCH_NODE);
        w.write_u32(99);
        assert!(engine.apply(w.as_bytes()).is_err());
        assert_eq!(engine.count("user"), 0);

        engine.fail_next("disk full");
        let err = engine.apply(&[]).unwrap_err();
        assert_eq!(err.message, "disk full");
        assert_eq!(engine.apply(&[]).unwrap(), Vec::<NodeId>::new());
    }

    #[test]
    fn test_inverse_references_stay_in_sync() {
        let mut engine = engine();
        let layout = engine.schema().type_by_name("user").unwrap().clone();
        let friends = layout.prop("friends").unwrap();
        let inverse = layout
            .prop(friends.target.as_ref().unwrap().inverse.as_deref().unwrap())
            .unwrap()
            .slot()
            .unwrap();

        let mut w = Writer::new();
        w.write_byte(modify_op::SWITCH_TYPE);
        w.write_u16(1);
        create(&mut w, 0, 1);
        create(&mut w, 1, 2);
        w.write_byte(modify_op::SWITCH_FIELD);
        w.write_byte(friends.slot().unwrap());
        w.write_byte(PropType::References as u8);
        w.write_byte(modify_op::REFS_SET);
        w.write_u32(1);
        w.write_byte(modify_op::REF_TMP);
        w.write_u32(0);
        let ids = engine.apply(w.as_bytes()).unwrap();
        assert_eq!(ids, vec![1, 2]);

        let first = engine.node(1, 1).unwrap();
        assert_eq!(first.links(inverse).len(), 1);
        assert_eq!(first.links(inverse)[0].id, 2);

        let mut w = Writer::new();
        w.write_byte(modify_op::SWITCH_TYPE);
        w.write_u16(1);
        w.write_byte(modify_op::SWITCH_NODE);
        w.write_u32(1);
        w.write_byte(modify_op::DELETE_NODE);
        engine.apply(w.as_bytes()).unwrap();
        assert!(engine.node(1, 2).unwrap().links(friends.slot().unwrap()).is_empty());
    }
}
