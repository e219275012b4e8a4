//! Include descriptors and the read plan that mirrors them.
//!
//! The engine answers an include descriptor with exactly the instructions
//! it asked for; the [`ReadPlan`] built alongside lets the decoder walk
//! those instructions without consulting the query again.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::codec::ops::include as op;
use crate::codec::primitives::Writer;
use crate::error::QueryBuildError;
use crate::model::TypeId;
use crate::query::filter::{terms, write_block, Scope};
use crate::query::{write_range, write_sort, SubQuery};
use crate::schema::{PathNode, PropType, PropertyDef, SchemaLayout, TypeLayout};

/// Layout a plan decodes against.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LayoutRef {
    Type(TypeId),
    Edge(Arc<TypeLayout>),
}

impl LayoutRef {
    pub(crate) fn resolve<'a>(&'a self, schema: &'a SchemaLayout) -> Option<&'a TypeLayout> {
        match self {
            LayoutRef::Type(id) => schema.type_by_id(*id),
            LayoutRef::Edge(layout) => Some(layout),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MainPlan {
    None,
    All,
    /// Main props by index, in offset order.
    Props(Vec<usize>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RefPlan {
    pub slot: u8,
    pub prop: usize,
    pub many: bool,
    pub plan: ReadPlan,
}

/// Decoder-side mirror of an include descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPlan {
    pub(crate) layout: LayoutRef,
    pub(crate) main: MainPlan,
    /// Separate non-reference props by index, in slot order.
    pub(crate) fields: Vec<usize>,
    pub(crate) refs: Vec<RefPlan>,
    pub(crate) edges: Option<Box<ReadPlan>>,
    /// Reference-collection props whose size is requested.
    pub(crate) counts: Vec<usize>,
    /// Requested text locale; `None` decodes every locale.
    pub(crate) locale: Option<u8>,
}

// =============================================================================
// BUILDING
// =============================================================================

struct RefEntry<'a> {
    prop: &'a PropertyDef,
    index: usize,
    plan: PlanBuilder<'a>,
    sub: Option<&'a SubQuery>,
}

/// Collects include paths for one scope.
pub(crate) struct PlanBuilder<'a> {
    schema: &'a SchemaLayout,
    layout: &'a TypeLayout,
    layout_ref: LayoutRef,
    edge_layout: Option<&'a Arc<TypeLayout>>,
    locale: Option<u8>,
    main: BTreeSet<usize>,
    fields: BTreeSet<usize>,
    refs: BTreeMap<u8, RefEntry<'a>>,
    edges: Option<Box<PlanBuilder<'a>>>,
    counts: BTreeSet<usize>,
}

impl<'a> PlanBuilder<'a> {
    pub(crate) fn new(
        schema: &'a SchemaLayout,
        layout: &'a TypeLayout,
        layout_ref: LayoutRef,
        edge_layout: Option<&'a Arc<TypeLayout>>,
        locale: Option<u8>,
    ) -> Self {
        Self {
            schema,
            layout,
            layout_ref,
            edge_layout,
            locale,
            main: BTreeSet::new(),
            fields: BTreeSet::new(),
            refs: BTreeMap::new(),
            edges: None,
            counts: BTreeSet::new(),
        }
    }

    fn unknown(&self, path: &[String]) -> QueryBuildError {
        QueryBuildError::UnknownField {
            type_name: self.layout.name.clone(),
            field: path.join("."),
        }
    }

    fn is_empty(&self) -> bool {
        self.main.is_empty()
            && self.fields.is_empty()
            && self.refs.is_empty()
            && self.edges.is_none()
            && self.counts.is_empty()
    }

    fn add_prop(&mut self, index: usize) {
        let prop = &self.layout.props[index];
        if prop.is_main() {
            self.main.insert(index);
        } else if !prop.prop_type.is_reference() {
            self.fields.insert(index);
        }
    }

    fn ref_entry(&mut self, index: usize) -> Result<&mut RefEntry<'a>, QueryBuildError> {
        let layout = self.layout;
        let prop = &layout.props[index];
        let slot = prop.slot().ok_or_else(|| self.unknown(&prop.path))?;
        let target = prop
            .target
            .as_ref()
            .and_then(|t| self.schema.type_by_id(t.type_id))
            .ok_or_else(|| self.unknown(&prop.path))?;
        let (schema, locale) = (self.schema, self.locale);
        Ok(self.refs.entry(slot).or_insert_with(|| RefEntry {
            prop,
            index,
            plan: PlanBuilder::new(
                schema,
                target,
                LayoutRef::Type(target.id),
                prop.edges.as_ref(),
                locale,
            ),
            sub: None,
        }))
    }

    fn edge_builder(&mut self, path: &[String]) -> Result<&mut PlanBuilder<'a>, QueryBuildError> {
        let layout = self.edge_layout.ok_or_else(|| self.unknown(path))?;
        let schema = self.schema;
        let locale = self.locale;
        let edges = self.edges.get_or_insert_with(|| {
            Box::new(PlanBuilder::new(
                schema,
                layout,
                LayoutRef::Edge(Arc::clone(layout)),
                None,
                locale,
            ))
        });
        Ok(&mut **edges)
    }

    /// Adds one include path, optionally with a nested query for the
    /// reference it ends at.
    pub(crate) fn add(
        &mut self,
        path: &[String],
        sub: Option<&'a SubQuery>,
    ) -> Result<(), QueryBuildError> {
        let Some(first) = path.first() else {
            return Err(self.unknown(path));
        };
        if first == "*" && path.len() == 1 {
            for index in 0..self.layout.props.len() {
                self.add_prop(index);
            }
            return Ok(());
        }
        if let Some(edge) = first.strip_prefix('$') {
            let mut rest = path.to_vec();
            rest[0] = edge.to_string();
            return self.edge_builder(path)?.add(&rest, sub);
        }
        if first == "id" && path.len() == 1 {
            return Ok(());
        }

        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        let Some((prop, n)) = self.layout.longest_prop(&segments) else {
            return self.add_branch(path);
        };
        let index = self
            .layout
            .prop_index(&prop.name)
            .ok_or_else(|| self.unknown(path))?;
        if !prop.prop_type.is_reference() {
            if n < path.len() {
                return Err(self.unknown(path));
            }
            self.add_prop(index);
            return Ok(());
        }

        let entry = self.ref_entry(index)?;
        if n < path.len() {
            return entry.plan.add(&path[n..], sub);
        }
        if let Some(sub) = sub {
            entry.sub = Some(sub);
            for include in &sub.includes {
                let nested: Vec<String> = include.path.split('.').map(str::to_string).collect();
                entry.plan.add(&nested, include.sub.as_ref())?;
            }
        }
        Ok(())
    }

    /// Includes every leaf under an object path.
    fn add_branch(&mut self, path: &[String]) -> Result<(), QueryBuildError> {
        let layout = self.layout;
        let mut tree = &layout.tree;
        let mut node = None;
        for segment in path {
            match tree.get(segment) {
                Some(PathNode::Branch(children)) => {
                    tree = children;
                    node = Some(children);
                }
                _ => return Err(self.unknown(path)),
            }
        }
        let children = node.ok_or_else(|| self.unknown(path))?;
        let mut leaves = Vec::new();
        collect_leaves(children, &mut leaves);
        for index in leaves {
            let prop = &layout.props[index];
            if prop.prop_type.is_reference() {
                self.ref_entry(index)?;
            } else {
                self.add_prop(index);
            }
        }
        Ok(())
    }

    /// Requests the size of a reference collection.
    pub(crate) fn add_count(&mut self, path: &[String]) -> Result<(), QueryBuildError> {
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        let (prop, n) = self
            .layout
            .longest_prop(&segments)
            .ok_or_else(|| self.unknown(path))?;
        let index = self
            .layout
            .prop_index(&prop.name)
            .ok_or_else(|| self.unknown(path))?;
        if n < path.len() && prop.prop_type.is_reference() {
            return self.ref_entry(index)?.plan.add_count(&path[n..]);
        }
        if n < path.len() || prop.prop_type != PropType::References {
            return Err(QueryBuildError::UnsupportedOperator {
                field: prop.name.clone(),
                operator: "count",
                prop_type: prop.prop_type,
            });
        }
        self.counts.insert(index);
        Ok(())
    }

    /// Writes the include descriptor body and returns the matching plan.
    pub(crate) fn finish(self, w: &mut Writer) -> Result<ReadPlan, QueryBuildError> {
        let layout = self.layout;
        let main = if self.is_empty() && !layout.is_edge() {
            MainPlan::All
        } else if self.main.is_empty() {
            MainPlan::None
        } else {
            // offset order
            let mut props: Vec<usize> = self.main.iter().copied().collect();
            props.sort_by_key(|&i| layout.props[i].offset());
            MainPlan::Props(props)
        };

        match &main {
            MainPlan::None => {}
            MainPlan::All => {
                w.write_byte(op::MAIN);
                w.write_u16(0);
            }
            MainPlan::Props(props) => {
                w.write_byte(op::MAIN);
                w.write_u16(props.len() as u16);
                for &i in props {
                    let prop = &layout.props[i];
                    w.write_u32(prop.offset().unwrap_or(0));
                    w.write_u16(prop.len as u16);
                }
            }
        }

        let mut fields: Vec<usize> = self.fields.iter().copied().collect();
        fields.sort_by_key(|&i| layout.props[i].slot());
        for &i in &fields {
            let prop = &layout.props[i];
            w.write_byte(op::FIELD);
            w.write_byte(prop.slot().unwrap_or(0));
            w.write_byte(prop.prop_type as u8);
            w.write_byte(self.locale.unwrap_or(0));
        }

        let mut refs = Vec::with_capacity(self.refs.len());
        for (slot, entry) in self.refs {
            let many = entry.prop.prop_type == PropType::References;
            let target_layout = entry.plan.layout;
            w.write_byte(if many { op::REFS } else { op::REF });
            w.write_byte(slot);
            w.write_u16(target_layout.id);
            let sub = entry.sub;
            write_range(w, sub.and_then(|s| s.range));
            write_sort(
                w,
                target_layout,
                sub.and_then(|s| s.sort.as_ref()),
                self.locale.unwrap_or(0),
            )?;

            let mut filter = Writer::new();
            if let Some(f) = sub.and_then(|s| s.filter.as_ref()) {
                let scope = Scope {
                    schema: self.schema,
                    layout: target_layout,
                    edges: entry.prop.edges.as_deref(),
                    locale: self.locale.unwrap_or(0),
                };
                write_block(&mut filter, scope, &terms(f))?;
            }
            w.write_sized(filter.as_bytes());

            let mut include = Writer::new();
            let plan = entry.plan.finish(&mut include)?;
            w.write_sized(include.as_bytes());
            refs.push(RefPlan {
                slot,
                prop: entry.index,
                many,
                plan,
            });
        }

        let edges = match self.edges {
            Some(edges) => {
                let mut include = Writer::new();
                let plan = edges.finish(&mut include)?;
                w.write_byte(op::EDGE);
                w.write_sized(include.as_bytes());
                Some(Box::new(plan))
            }
            None => None,
        };

        let counts: Vec<usize> = self.counts.into_iter().collect();
        for &i in &counts {
            w.write_byte(op::COUNT);
            w.write_byte(layout.props[i].slot().unwrap_or(0));
        }

        Ok(ReadPlan {
            layout: self.layout_ref,
            main,
            fields,
            refs,
            edges,
            counts,
            locale: self.locale,
        })
    }
}

fn collect_leaves(tree: &BTreeMap<String, PathNode>, out: &mut Vec<usize>) {
    for node in tree.values() {
        match node {
            PathNode::Leaf(index) => out.push(*index),
            PathNode::Branch(children) => collect_leaves(children, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Reader;
    use crate::schema::{compile, PropDecl, SchemaDecl, SchemaOptions, TypeDecl};

    fn schema() -> SchemaLayout {
        compile(
            &SchemaDecl::new().locale("en").type_decl(
                "user",
                TypeDecl::new()
                    .prop("name", PropDecl::string())
                    .prop("age", PropDecl::uint8())
                    .prop(
                        "address",
                        PropDecl::object(vec![
                            ("city".into(), PropDecl::string()),
                            ("zip".into(), PropDecl::uint32()),
                        ]),
                    )
                    .prop("bestFriend", PropDecl::reference("user")),
            ),
            &SchemaOptions::default(),
        )
        .unwrap()
    }

    fn plan(schema: &SchemaLayout, paths: &[&str]) -> (ReadPlan, Vec<u8>) {
        let user = schema.type_by_name("user").unwrap();
        let mut builder = PlanBuilder::new(schema, user, LayoutRef::Type(user.id), None, None);
        for p in paths {
            let path: Vec<String> = p.split('.').map(str::to_string).collect();
            builder.add(&path, None).unwrap();
        }
        let mut w = Writer::new();
        let plan = builder.finish(&mut w).unwrap();
        (plan, w.into_bytes())
    }

    #[test]
    fn test_empty_include_reads_main() {
        let schema = schema();
        let (plan, bytes) = plan(&schema, &[]);
        assert_eq!(plan.main, MainPlan::All);
        assert_eq!(bytes, vec![op::MAIN, 0, 0]);
    }

    #[test]
    fn test_branch_include() {
        let schema = schema();
        let (plan, _) = plan(&schema, &["address"]);
        let user = schema.type_by_name("user").unwrap();
        let zip = user.prop_index("address.zip").unwrap();
        let city = user.prop_index("address.city").unwrap();
        assert_eq!(plan.main, MainPlan::Props(vec![zip]));
        assert_eq!(plan.fields, vec![city]);
    }

    #[test]
    fn test_reference_include() {
        let schema = schema();
        let (plan, bytes) = plan(&schema, &["name", "bestFriend.name"]);
        assert_eq!(plan.main, MainPlan::None);
        assert_eq!(plan.refs.len(), 1);
        assert!(!plan.refs[0].many);
        assert_eq!(plan.refs[0].plan.main, MainPlan::None);
        assert_eq!(plan.refs[0].plan.fields.len(), 1);

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_byte("item").unwrap(), op::FIELD);
        r.read_bytes(3, "field").unwrap();
        assert_eq!(r.read_byte("item").unwrap(), op::REF);
    }

    #[test]
    fn test_unknown_include() {
        let schema = schema();
        let user = schema.type_by_name("user").unwrap();
        let mut builder = PlanBuilder::new(&schema, user, LayoutRef::Type(user.id), None, None);
        let err = builder.add(&["address".into(), "street".into()], None);
        assert!(matches!(err, Err(QueryBuildError::UnknownField { .. })));
        let err = builder.add(&["$since".into()], None);
        assert!(matches!(err, Err(QueryBuildError::UnknownField { .. })));
    }
}
