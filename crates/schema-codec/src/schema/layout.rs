//! Layout compilation: declarations to byte layouts.
//!
//! Every type gets a fixed-size main block for its fixed-width properties
//! and a slot number per variable-length ("separate") property. Both are
//! derived from sorted orders, so reordering a declaration never moves a
//! property.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::codec::value::write_main_value;
use crate::error::SchemaError;
use crate::limits::{
    MAX_ENUM_VALUES, MAX_FIELD_LEN, MAX_FIXED_STRING, MAX_MAIN_LEN, MAX_SEPARATE_SLOT, MAX_TYPES,
    MAX_VECTOR_BYTES,
};
use crate::model::{TypeId, Value};
use crate::schema::decl::{CustomValidator, PropDecl, PropKind, SchemaDecl};
use crate::schema::locale::{locale_id, Locale};
use crate::schema::PropType;
use crate::validate::validate_value;

// =============================================================================
// COMPILED LAYOUT
// =============================================================================

/// Where a property's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Fixed offset inside the main block.
    Main { offset: u32 },
    /// Own slot, variable length.
    Separate { slot: u8 },
}

/// Resolved target of a reference property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefTarget {
    pub type_name: String,
    pub type_id: TypeId,
    /// Reciprocal property on the target type. `None` for edge references.
    pub inverse: Option<String>,
}

/// A compiled leaf property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    pub path: Vec<String>,
    /// Dotted path.
    pub name: String,
    pub prop_type: PropType,
    pub location: Location,
    /// Width in the main block, or the fixed payload size of a vector.
    pub len: usize,
    pub max_bytes: Option<usize>,
    pub dims: Option<usize>,
    pub enum_values: Vec<String>,
    pub target: Option<RefTarget>,
    /// Layout of the properties stored on the reference itself.
    pub edges: Option<Arc<TypeLayout>>,
    pub default: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub validator: Option<CustomValidator>,
    /// Locale ids accepted by a text property.
    pub locales: Vec<u8>,
}

impl PropertyDef {
    pub fn is_main(&self) -> bool {
        matches!(self.location, Location::Main { .. })
    }

    pub fn offset(&self) -> Option<u32> {
        match self.location {
            Location::Main { offset } => Some(offset),
            Location::Separate { .. } => None,
        }
    }

    pub fn slot(&self) -> Option<u8> {
        match self.location {
            Location::Main { .. } => None,
            Location::Separate { slot } => Some(slot),
        }
    }

    /// Position of an enum label on the wire (index + 1).
    pub fn enum_index(&self, label: &str) -> Option<u8> {
        self.enum_values
            .iter()
            .position(|v| v == label)
            .map(|i| (i + 1) as u8)
    }
}

/// Prefix tree over property paths, used to walk nested records.
#[derive(Debug, Clone, PartialEq)]
pub enum PathNode {
    /// Index into [`TypeLayout::props`].
    Leaf(usize),
    Branch(BTreeMap<String, PathNode>),
}

/// Compiled layout of one type (or of the edge payload of a relation).
#[derive(Debug, Clone, PartialEq)]
pub struct TypeLayout {
    pub name: String,
    /// 0 for edge layouts.
    pub id: TypeId,
    pub main_len: usize,
    /// Main props in offset order, then separate props in slot order.
    pub props: Vec<PropertyDef>,
    pub tree: BTreeMap<String, PathNode>,
    /// Main block with every default applied; zero elsewhere.
    pub main_defaults: Vec<u8>,
    index: FxHashMap<String, usize>,
    by_slot: FxHashMap<u8, usize>,
}

impl TypeLayout {
    /// Looks up a property by dotted path.
    pub fn prop(&self, path: &str) -> Option<&PropertyDef> {
        self.index.get(path).map(|&i| &self.props[i])
    }

    pub fn prop_index(&self, path: &str) -> Option<usize> {
        self.index.get(path).copied()
    }

    pub fn prop_by_slot(&self, slot: u8) -> Option<&PropertyDef> {
        self.by_slot.get(&slot).map(|&i| &self.props[i])
    }

    pub fn main_props(&self) -> impl Iterator<Item = &PropertyDef> {
        self.props.iter().filter(|p| p.is_main())
    }

    pub fn separate_props(&self) -> impl Iterator<Item = &PropertyDef> {
        self.props.iter().filter(|p| !p.is_main())
    }

    /// Finds the property matching the longest prefix of `segments`.
    ///
    /// Returns the property and the number of segments it consumed.
    pub fn longest_prop(&self, segments: &[&str]) -> Option<(&PropertyDef, usize)> {
        (1..=segments.len()).rev().find_map(|n| {
            self.prop(&segments[..n].join("."))
                .map(|prop| (prop, n))
        })
    }

    pub fn is_edge(&self) -> bool {
        self.id == 0
    }
}

/// A compiled schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaLayout {
    types: Vec<TypeLayout>,
    by_name: FxHashMap<String, TypeId>,
    locales: Vec<Locale>,
    hash: [u8; 32],
}

impl SchemaLayout {
    pub fn type_by_name(&self, name: &str) -> Option<&TypeLayout> {
        self.by_name.get(name).and_then(|&id| self.type_by_id(id))
    }

    pub fn type_by_id(&self, id: TypeId) -> Option<&TypeLayout> {
        if id == 0 {
            return None;
        }
        self.types.get(id as usize - 1)
    }

    /// Types in id order.
    pub fn types(&self) -> &[TypeLayout] {
        &self.types
    }

    pub fn locales(&self) -> &[Locale] {
        &self.locales
    }

    pub fn locale(&self, code: &str) -> Option<&Locale> {
        self.locales.iter().find(|l| l.code == code)
    }

    pub fn locale_by_id(&self, id: u8) -> Option<&Locale> {
        self.locales.iter().find(|l| l.id == id)
    }

    /// SHA-256 fingerprint of the compiled layout.
    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }
}

// =============================================================================
// OPTIONS
// =============================================================================

/// Options for [`compile`].
#[derive(Debug, Clone, Copy)]
pub struct SchemaOptions {
    /// Orders separate properties before slot assignment: lower first,
    /// ties broken by path. Must be a pure function of the property.
    pub slot_priority: fn(&PropertyDef) -> i32,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            slot_priority: default_slot_priority,
        }
    }
}

impl SchemaOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot_priority(slot_priority: fn(&PropertyDef) -> i32) -> Self {
        Self { slot_priority }
    }
}

/// Default separate-property ordering.
///
/// Defaulted strings first, then defaulted text, then references; aliases
/// and columnar vectors last.
pub fn default_slot_priority(prop: &PropertyDef) -> i32 {
    let defaulted = prop.default.is_some();
    match prop.prop_type {
        PropType::String | PropType::Binary if defaulted => -600,
        PropType::Text if defaulted => -400,
        PropType::Reference | PropType::References => -300,
        PropType::Alias | PropType::ColVec => 300,
        _ => 0,
    }
}

// =============================================================================
// COMPILATION
// =============================================================================

/// A declared leaf, flattened to its full path.
#[derive(Debug, Clone)]
struct FlatProp {
    path: Vec<String>,
    prop_type: PropType,
    decl: PropDecl,
}

impl FlatProp {
    fn name(&self) -> String {
        self.path.join(".")
    }
}

/// Key of a relation: both ends, in sorted order.
type RelationKey = ((String, String), (String, String));

/// Compiles a schema declaration into layouts.
///
/// The whole schema is rejected on the first error.
pub fn compile(decl: &SchemaDecl, options: &SchemaOptions) -> Result<SchemaLayout, SchemaError> {
    let locales = compile_locales(decl)?;
    let locale_ids: Vec<u8> = locales.iter().map(|l| l.id).collect();

    if decl.types.len() > MAX_TYPES {
        return Err(SchemaError::TooManyTypes {
            count: decl.types.len(),
            max: MAX_TYPES,
        });
    }

    let mut flat: BTreeMap<String, Vec<FlatProp>> = BTreeMap::new();
    for (type_name, type_decl) in &decl.types {
        if flat.contains_key(type_name) {
            return Err(SchemaError::DuplicateType {
                type_name: type_name.clone(),
            });
        }
        let mut props = Vec::new();
        flatten(type_name, &[], &type_decl.props, &mut props)?;
        flat.insert(type_name.clone(), props);
    }

    // Ids follow name order so declaration order is irrelevant.
    let type_ids: FxHashMap<String, TypeId> = flat
        .keys()
        .enumerate()
        .map(|(i, name)| (name.clone(), (i + 1) as TypeId))
        .collect();

    resolve_inverses(&mut flat)?;

    let mut ctx = Compiler {
        type_ids: &type_ids,
        locale_ids: &locale_ids,
        options,
        edges: FxHashMap::default(),
    };

    let mut types = Vec::with_capacity(flat.len());
    for (type_name, props) in &flat {
        for prop in props {
            check_paths(type_name, props, prop)?;
        }
        let id = type_ids[type_name];
        types.push(ctx.compile_type(type_name, id, props, true)?);
    }

    let by_name = types.iter().map(|t| (t.name.clone(), t.id)).collect();
    let hash = fingerprint(&types, &locales);

    debug!(types = types.len(), locales = locales.len(), "compiled schema");

    Ok(SchemaLayout {
        types,
        by_name,
        locales,
        hash,
    })
}

fn compile_locales(decl: &SchemaDecl) -> Result<Vec<Locale>, SchemaError> {
    let lookup = |code: &str| {
        locale_id(code).ok_or_else(|| SchemaError::UnknownLocale {
            code: code.to_string(),
        })
    };

    let declared: FxHashSet<&str> = decl.locales.iter().map(|l| l.code.as_str()).collect();
    let mut locales = Vec::with_capacity(decl.locales.len());
    for l in &decl.locales {
        let id = lookup(&l.code)?;
        let mut fallback = Vec::with_capacity(l.fallback.len());
        for code in &l.fallback {
            if !declared.contains(code.as_str()) {
                return Err(SchemaError::UnknownLocale { code: code.clone() });
            }
            fallback.push(lookup(code)?);
        }
        locales.push(Locale {
            code: l.code.clone(),
            id,
            fallback,
            required: l.required,
        });
    }
    locales.sort_by_key(|l| l.id);
    locales.dedup_by_key(|l| l.id);
    Ok(locales)
}

/// Flattens nested objects and dotted names into leaf paths.
fn flatten(
    type_name: &str,
    prefix: &[String],
    props: &[(String, PropDecl)],
    out: &mut Vec<FlatProp>,
) -> Result<(), SchemaError> {
    for (name, decl) in props {
        let mut path = prefix.to_vec();
        path.extend(name.split('.').map(str::to_string));
        if path.iter().any(|s| s.is_empty() || s.starts_with('$') || s == "id") {
            return Err(SchemaError::InvalidProperty {
                type_name: type_name.to_string(),
                path: path.join("."),
                message: "property names must be non-empty and may not be `id` or start with `$`",
            });
        }
        match &decl.kind {
            PropKind::Object(children) => flatten(type_name, &path, children, out)?,
            PropKind::Leaf(prop_type) => out.push(FlatProp {
                path,
                prop_type: *prop_type,
                decl: decl.clone(),
            }),
        }
    }
    Ok(())
}

/// Rejects a path that is declared twice or that is a prefix of another.
fn check_paths(type_name: &str, props: &[FlatProp], prop: &FlatProp) -> Result<(), SchemaError> {
    let conflicts = props
        .iter()
        .filter(|other| {
            let n = prop.path.len().min(other.path.len());
            prop.path[..n] == other.path[..n]
        })
        .count();
    if conflicts > 1 {
        return Err(SchemaError::DuplicatePath {
            type_name: type_name.to_string(),
            path: prop.name(),
        });
    }
    Ok(())
}

/// Links every reference to its reciprocal, synthesizing missing ones.
fn resolve_inverses(flat: &mut BTreeMap<String, Vec<FlatProp>>) -> Result<(), SchemaError> {
    let mut refs = Vec::new();
    for (type_name, props) in flat.iter() {
        for prop in props {
            if !prop.prop_type.is_reference() {
                continue;
            }
            let Some(target) = prop.decl.reference.clone() else {
                return Err(SchemaError::InvalidProperty {
                    type_name: type_name.clone(),
                    path: prop.name(),
                    message: "reference property without a target type",
                });
            };
            if !flat.contains_key(&target) {
                return Err(SchemaError::UnknownReferenceTarget {
                    type_name: type_name.clone(),
                    path: prop.name(),
                    target,
                });
            }
            refs.push((type_name.clone(), prop.name(), target, prop.decl.inverse.clone()));
        }
    }

    let mut synthesized: Vec<(String, FlatProp)> = Vec::new();
    for (source, path, target, inverse) in refs {
        let target_props = &flat[&target];
        let inverse_name = match inverse {
            Some(inverse) => {
                match target_props.iter().find(|p| p.name() == inverse) {
                    Some(existing) => {
                        let points_back = existing.prop_type.is_reference()
                            && existing.decl.reference.as_deref() == Some(source.as_str())
                            && existing.decl.inverse.as_deref().is_none_or(|i| i == path);
                        if !points_back {
                            return Err(SchemaError::InvalidInverse {
                                type_name: source,
                                path,
                                target,
                                inverse,
                            });
                        }
                    }
                    None => synthesized.push((
                        target.clone(),
                        inverse_prop(&inverse, &source, &path, flat),
                    )),
                }
                inverse
            }
            None => {
                let declared_back = target_props.iter().find(|p| {
                    p.prop_type.is_reference()
                        && p.decl.reference.as_deref() == Some(source.as_str())
                        && p.decl.inverse.as_deref() == Some(path.as_str())
                });
                match declared_back {
                    Some(back) => back.name(),
                    None => {
                        let name = format!("_{}_{}", source, path.replace('.', "_"));
                        synthesized.push((
                            target.clone(),
                            inverse_prop(&name, &source, &path, flat),
                        ));
                        name
                    }
                }
            }
        };
        if let Some(prop) = flat
            .get_mut(&source)
            .and_then(|props| props.iter_mut().find(|p| p.name() == path))
        {
            prop.decl.inverse = Some(inverse_name);
        }
    }

    for (type_name, prop) in synthesized {
        let props = flat.entry(type_name).or_default();
        if !props.iter().any(|p| p.path == prop.path) {
            props.push(prop);
        }
    }

    share_edge_declarations(flat);
    Ok(())
}

fn inverse_prop(
    name: &str,
    source: &str,
    source_path: &str,
    flat: &BTreeMap<String, Vec<FlatProp>>,
) -> FlatProp {
    let edges = flat
        .get(source)
        .and_then(|props| props.iter().find(|p| p.name() == source_path))
        .map(|p| p.decl.edges.clone())
        .unwrap_or_default();
    let mut decl = PropDecl::references(source).inverse(source_path);
    decl.edges = edges;
    FlatProp {
        path: name.split('.').map(str::to_string).collect(),
        prop_type: PropType::References,
        decl,
    }
}

/// Copies edge declarations onto the side of a relation that lacks them.
fn share_edge_declarations(flat: &mut BTreeMap<String, Vec<FlatProp>>) {
    let mut updates = Vec::new();
    for props in flat.values() {
        for prop in props {
            let (Some(target), Some(inverse)) = (&prop.decl.reference, &prop.decl.inverse) else {
                continue;
            };
            if prop.decl.edges.is_empty() {
                continue;
            }
            let other_empty = flat.get(target).is_some_and(|ps| {
                ps.iter()
                    .any(|p| &p.name() == inverse && p.decl.edges.is_empty())
            });
            if other_empty {
                updates.push((target.clone(), inverse.clone(), prop.decl.edges.clone()));
            }
        }
    }
    for (type_name, path, edges) in updates {
        if let Some(prop) = flat
            .get_mut(&type_name)
            .and_then(|ps| ps.iter_mut().find(|p| p.name() == path))
        {
            prop.decl.edges = edges;
        }
    }
}

struct Compiler<'a> {
    type_ids: &'a FxHashMap<String, TypeId>,
    locale_ids: &'a [u8],
    options: &'a SchemaOptions,
    edges: FxHashMap<RelationKey, Arc<TypeLayout>>,
}

impl Compiler<'_> {
    fn compile_type(
        &mut self,
        type_name: &str,
        id: TypeId,
        flat: &[FlatProp],
        allow_edges: bool,
    ) -> Result<TypeLayout, SchemaError> {
        let mut main = Vec::new();
        let mut separate = Vec::new();
        for prop in flat {
            let def = self.compile_prop(type_name, prop, allow_edges)?;
            if def.is_main() {
                main.push(def);
            } else {
                separate.push(def);
            }
        }

        main.sort_by(|a, b| b.len.cmp(&a.len).then_with(|| a.name.cmp(&b.name)));
        let mut offset = 0usize;
        for def in &mut main {
            def.location = Location::Main {
                offset: offset as u32,
            };
            offset += def.len;
        }
        if offset > MAX_MAIN_LEN {
            return Err(SchemaError::MainBlockTooLarge {
                type_name: type_name.to_string(),
                len: offset,
                max: MAX_MAIN_LEN,
            });
        }

        if separate.len() > MAX_SEPARATE_SLOT as usize {
            return Err(SchemaError::TooManySeparateProps {
                type_name: type_name.to_string(),
                count: separate.len(),
                max: MAX_SEPARATE_SLOT as usize,
            });
        }
        let priority = self.options.slot_priority;
        separate.sort_by(|a, b| {
            priority(a)
                .cmp(&priority(b))
                .then_with(|| a.name.cmp(&b.name))
        });
        for (i, def) in separate.iter_mut().enumerate() {
            def.location = Location::Separate {
                slot: (i + 1) as u8,
            };
        }

        let mut main_defaults = vec![0u8; offset];
        for def in &main {
            if let (Some(default), Some(offset)) = (&def.default, def.offset()) {
                let start = offset as usize;
                write_main_value(&mut main_defaults[start..start + def.len], def, default).map_err(
                    |message| SchemaError::InvalidDefault {
                        type_name: type_name.to_string(),
                        path: def.name.clone(),
                        message,
                    },
                )?;
            }
        }

        let props: Vec<PropertyDef> = main.into_iter().chain(separate).collect();
        let mut index = FxHashMap::default();
        let mut by_slot = FxHashMap::default();
        let mut tree = BTreeMap::new();
        for (i, def) in props.iter().enumerate() {
            index.insert(def.name.clone(), i);
            if let Some(slot) = def.slot() {
                by_slot.insert(slot, i);
            }
            insert_tree(&mut tree, &def.path, i);
        }

        debug!(
            type_name,
            id,
            main_len = offset,
            separate = by_slot.len(),
            "compiled type layout"
        );

        Ok(TypeLayout {
            name: type_name.to_string(),
            id,
            main_len: offset,
            props,
            tree,
            main_defaults,
            index,
            by_slot,
        })
    }

    fn compile_prop(
        &mut self,
        type_name: &str,
        prop: &FlatProp,
        allow_edges: bool,
    ) -> Result<PropertyDef, SchemaError> {
        let name = prop.name();
        let decl = &prop.decl;
        let invalid = |message: &'static str| SchemaError::InvalidProperty {
            type_name: type_name.to_string(),
            path: name.clone(),
            message,
        };
        let too_large = |len: usize, max: usize| SchemaError::FieldTooLarge {
            type_name: type_name.to_string(),
            path: name.clone(),
            len,
            max,
        };

        let prop_type = prop.prop_type;
        let mut len = 0;
        let mut main = false;
        match prop_type {
            PropType::Enum => {
                let count = decl.enum_values.len();
                if count == 0 || count > MAX_ENUM_VALUES {
                    return Err(SchemaError::InvalidEnum {
                        type_name: type_name.to_string(),
                        path: name.clone(),
                        count,
                        max: MAX_ENUM_VALUES,
                    });
                }
                len = 1;
                main = true;
            }
            PropType::Vector | PropType::ColVec => {
                let dims = decl.dims.ok_or_else(|| invalid("vector without dimensions"))?;
                if dims == 0 {
                    return Err(invalid("vector without dimensions"));
                }
                len = dims * 4;
                if len > MAX_VECTOR_BYTES {
                    return Err(too_large(len, MAX_VECTOR_BYTES));
                }
            }
            PropType::String | PropType::Binary | PropType::Text | PropType::Alias => {
                if let Some(max) = decl.max_bytes {
                    if max > MAX_FIELD_LEN {
                        return Err(too_large(max, MAX_FIELD_LEN));
                    }
                    if !prop_type.always_separate() && max <= MAX_FIXED_STRING {
                        len = max + 1;
                        main = true;
                    }
                }
            }
            PropType::Reference | PropType::References | PropType::Cardinality => {}
            _ => {
                len = prop_type.fixed_width().ok_or_else(|| invalid("unsupported type"))?;
                main = true;
            }
        }

        if let (Some(min), Some(max)) = (decl.min, decl.max) {
            if min > max {
                return Err(invalid("min is greater than max"));
            }
        }
        if !decl.edges.is_empty() && !prop_type.is_reference() {
            return Err(invalid("only references can declare edges"));
        }

        let target = match &decl.reference {
            Some(target) if prop_type.is_reference() => {
                let type_id = *self
                    .type_ids
                    .get(target)
                    .ok_or_else(|| SchemaError::UnknownReferenceTarget {
                        type_name: type_name.to_string(),
                        path: name.clone(),
                        target: target.clone(),
                    })?;
                Some(RefTarget {
                    type_name: target.clone(),
                    type_id,
                    inverse: if allow_edges { decl.inverse.clone() } else { None },
                })
            }
            _ if prop_type.is_reference() => return Err(invalid("reference without a target type")),
            _ => None,
        };

        let edges = if decl.edges.is_empty() {
            None
        } else if !allow_edges {
            return Err(invalid("edge properties cannot declare edges"));
        } else {
            Some(self.edge_layout(type_name, &name, target.as_ref(), &decl.edges)?)
        };

        let locales = if prop_type == PropType::Text {
            self.locale_ids.to_vec()
        } else {
            Vec::new()
        };

        let def = PropertyDef {
            path: prop.path.clone(),
            name: name.clone(),
            prop_type,
            location: if main {
                Location::Main { offset: 0 }
            } else {
                Location::Separate { slot: 0 }
            },
            len,
            max_bytes: decl.max_bytes,
            dims: decl.dims,
            enum_values: decl.enum_values.clone(),
            target,
            edges,
            default: decl.default.clone(),
            min: decl.min,
            max: decl.max,
            validator: decl.validator.clone(),
            locales,
        };

        if let Some(default) = &def.default {
            if prop_type.is_reference() {
                return Err(SchemaError::InvalidDefault {
                    type_name: type_name.to_string(),
                    path: name,
                    message: "references cannot have defaults".to_string(),
                });
            }
            validate_value(&def, default).map_err(|message| SchemaError::InvalidDefault {
                type_name: type_name.to_string(),
                path: name.clone(),
                message,
            })?;
        }

        Ok(def)
    }

    /// Compiles (or reuses) the edge layout shared by both ends of a relation.
    fn edge_layout(
        &mut self,
        type_name: &str,
        path: &str,
        target: Option<&RefTarget>,
        edges: &[(String, PropDecl)],
    ) -> Result<Arc<TypeLayout>, SchemaError> {
        let here = (type_name.to_string(), path.to_string());
        let there = target
            .map(|t| (t.type_name.clone(), t.inverse.clone().unwrap_or_default()))
            .unwrap_or_default();
        let key = if here <= there {
            (here, there)
        } else {
            (there, here)
        };
        if let Some(layout) = self.edges.get(&key) {
            return Ok(layout.clone());
        }

        let edge_name = format!("{}.{}", key.0.0, key.0.1);
        let mut flat = Vec::new();
        flatten(&edge_name, &[], edges, &mut flat)?;
        for prop in &flat {
            check_paths(&edge_name, &flat, prop)?;
        }
        let layout = Arc::new(self.compile_type(&edge_name, 0, &flat, false)?);
        self.edges.insert(key, layout.clone());
        Ok(layout)
    }
}

fn insert_tree(tree: &mut BTreeMap<String, PathNode>, path: &[String], index: usize) {
    match path {
        [] => {}
        [leaf] => {
            tree.insert(leaf.clone(), PathNode::Leaf(index));
        }
        [head, rest @ ..] => {
            let node = tree
                .entry(head.clone())
                .or_insert_with(|| PathNode::Branch(BTreeMap::new()));
            if let PathNode::Branch(children) = node {
                insert_tree(children, rest, index);
            }
        }
    }
}

// =============================================================================
// FINGERPRINT
// =============================================================================

fn fingerprint(types: &[TypeLayout], locales: &[Locale]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for locale in locales {
        hasher.update([locale.id]);
        hasher.update(&locale.fallback);
    }
    for layout in types {
        hash_layout(&mut hasher, layout);
    }
    hasher.finalize().into()
}

fn hash_layout(hasher: &mut Sha256, layout: &TypeLayout) {
    hasher.update(layout.id.to_le_bytes());
    hash_str(hasher, &layout.name);
    hasher.update((layout.main_len as u32).to_le_bytes());
    for prop in &layout.props {
        hash_str(hasher, &prop.name);
        hasher.update([prop.prop_type as u8]);
        match prop.location {
            Location::Main { offset } => {
                hasher.update([0]);
                hasher.update(offset.to_le_bytes());
            }
            Location::Separate { slot } => hasher.update([1, slot]),
        }
        hasher.update((prop.len as u32).to_le_bytes());
        for value in &prop.enum_values {
            hash_str(hasher, value);
        }
        if let Some(target) = &prop.target {
            hasher.update(target.type_id.to_le_bytes());
        }
        if let Some(edges) = &prop.edges {
            hash_layout(hasher, edges);
        }
    }
}

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u32).to_le_bytes());
    hasher.update(s.as_bytes());
}
