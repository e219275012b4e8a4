//! Filter compilation to engine byte-code.
//!
//! A filter block is a flat list of items that must all hold. Siblings are
//! grouped per scope: plain conditions first (ordered by slot and start),
//! then one nested block per reference property, then the edge block, then
//! OR items. An OR item carries a jump to its right-hand items, relative
//! to the start of the enclosing block, and the size of those items.

use std::collections::BTreeMap;

use crate::codec::ops::filter as op;
use crate::codec::primitives::Writer;
use crate::codec::value::write_main_value;
use crate::error::QueryBuildError;
use crate::limits::{ID_SLOT, MAIN_SLOT, VECTOR_WIDTH};
use crate::model::{NodeRef, Value};
use crate::schema::{PropType, PropertyDef, SchemaLayout, TypeLayout};
use crate::validate::validate_builtin;

/// Comparison applied by a filter condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Equal to the value, or to any value of a list.
    Equal,
    NotEqual,
    Greater,
    GreaterEq,
    Less,
    LessEq,
    /// Inclusive range; the value is a two-element list `[min, max]`.
    Between,
    /// Substring for strings and text, membership for reference lists.
    Includes,
    NotIncludes,
    Exists,
    NotExists,
}

impl Operator {
    pub fn name(self) -> &'static str {
        match self {
            Operator::Equal => "=",
            Operator::NotEqual => "!=",
            Operator::Greater => ">",
            Operator::GreaterEq => ">=",
            Operator::Less => "<",
            Operator::LessEq => "<=",
            Operator::Between => "between",
            Operator::Includes => "includes",
            Operator::NotIncludes => "!includes",
            Operator::Exists => "exists",
            Operator::NotExists => "!exists",
        }
    }

    fn negated(self) -> bool {
        matches!(
            self,
            Operator::NotEqual | Operator::NotIncludes | Operator::NotExists
        )
    }
}

/// A logical filter over a type's fields.
///
/// Field paths are dotted; a reference property followed by more segments
/// filters on the referenced node, `$name` after a reference addresses an
/// edge property, and `id` is the node id.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Condition {
        field: String,
        operator: Operator,
        value: Value,
    },
    And(Vec<Filter>),
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Filter::Condition {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Equal, value)
    }

    /// Equal to any of `values`.
    pub fn any_of<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        Self::new(field, Operator::Equal, Value::List(values))
    }

    pub fn between(field: impl Into<String>, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Self::new(
            field,
            Operator::Between,
            Value::List(vec![min.into(), max.into()]),
        )
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self::new(field, Operator::Exists, Value::Null)
    }

    pub fn all(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut items) => {
                items.push(other);
                Filter::And(items)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    /// `self or other`. Chains fold to the right: `a.or(b).or(c)` is
    /// `a or (b or c)`.
    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(left, right) => Filter::Or(left, Box::new(right.or(other))),
            first => Filter::Or(Box::new(first), Box::new(other)),
        }
    }
}

// =============================================================================
// BATCHED EQUALITY
// =============================================================================

/// Values of `width` bytes that fit one comparison vector.
pub fn lanes(width: usize) -> usize {
    (VECTOR_WIDTH / width.max(1)).max(1)
}

/// Chooses the equality opcode for `values` (each exactly `width` bytes)
/// and builds its operand.
///
/// One value compares directly. Up to one vector of values is packed into
/// a single vector; more values take as many vectors as needed. Unused
/// lanes repeat the first value.
pub fn equality_operand(values: &[Vec<u8>], width: usize) -> (u8, Vec<u8>) {
    let Some(first) = values.first() else {
        return (op::EQUAL_ANY, 0u32.to_le_bytes().to_vec());
    };
    if values.len() == 1 {
        return (op::EQUAL, first.clone());
    }
    let lanes = lanes(width);
    let vectors = values.len().div_ceil(lanes);
    let mut operand = Vec::with_capacity(vectors * lanes * width);
    for i in 0..vectors * lanes {
        operand.extend_from_slice(values.get(i).unwrap_or(first));
    }
    let code = if vectors == 1 {
        op::EQUAL_BATCH_SMALL
    } else {
        op::EQUAL_BATCH_LARGE
    };
    (code, operand)
}

// =============================================================================
// COMPILATION
// =============================================================================

/// Layouts visible while compiling one block.
#[derive(Clone, Copy)]
pub(crate) struct Scope<'a> {
    pub schema: &'a SchemaLayout,
    pub layout: &'a TypeLayout,
    /// Edge layout of the reference this block was entered through.
    pub edges: Option<&'a TypeLayout>,
    pub locale: u8,
}

/// A filter with AND groups flattened.
#[derive(Debug, Clone)]
pub(crate) enum Term {
    Leaf {
        path: Vec<String>,
        operator: Operator,
        value: Value,
    },
    Or(Vec<Term>, Vec<Term>),
}

pub(crate) fn terms(filter: &Filter) -> Vec<Term> {
    let mut out = Vec::new();
    flatten(filter, &mut out);
    out
}

fn flatten(filter: &Filter, out: &mut Vec<Term>) {
    match filter {
        Filter::Condition {
            field,
            operator,
            value,
        } => out.push(Term::Leaf {
            path: field.split('.').map(str::to_string).collect(),
            operator: *operator,
            value: value.clone(),
        }),
        Filter::And(items) => items.iter().for_each(|f| flatten(f, out)),
        Filter::Or(left, right) => out.push(Term::Or(terms(left), terms(right))),
    }
}

/// Field addressed by a condition.
struct Target<'a> {
    name: String,
    slot: u8,
    prop_type: PropType,
    start: u32,
    width: u16,
    prop: Option<&'a PropertyDef>,
}

impl<'a> Target<'a> {
    fn prop(prop: &'a PropertyDef) -> Self {
        let width = match prop.prop_type {
            PropType::Reference => 4,
            _ if prop.is_main() => prop.len as u16,
            _ => 0,
        };
        Self {
            name: prop.name.clone(),
            slot: prop.slot().unwrap_or(MAIN_SLOT),
            prop_type: prop.prop_type,
            start: prop.offset().unwrap_or(0),
            width,
            prop: Some(prop),
        }
    }

    fn id() -> Self {
        Self {
            name: "id".to_string(),
            slot: ID_SLOT,
            prop_type: PropType::Uint32,
            start: 0,
            width: 4,
            prop: None,
        }
    }

    fn is_separate(&self) -> bool {
        self.slot != MAIN_SLOT && self.slot != ID_SLOT
    }

    fn invalid(&self, message: impl Into<String>) -> QueryBuildError {
        QueryBuildError::InvalidValue {
            field: self.name.clone(),
            message: message.into(),
        }
    }
}

enum Resolved<'a> {
    Cond(Target<'a>),
    Nested(&'a PropertyDef, Vec<String>),
    Edge(Vec<String>),
}

fn unknown(layout: &TypeLayout, path: &[String]) -> QueryBuildError {
    QueryBuildError::UnknownField {
        type_name: layout.name.clone(),
        field: path.join("."),
    }
}

fn resolve<'a>(scope: &Scope<'a>, path: &[String]) -> Result<Resolved<'a>, QueryBuildError> {
    let layout = scope.layout;
    let Some(first) = path.first() else {
        return Err(unknown(layout, path));
    };
    if let Some(edge) = first.strip_prefix('$') {
        if scope.edges.is_none() {
            return Err(unknown(layout, path));
        }
        let mut rest = path.to_vec();
        rest[0] = edge.to_string();
        return Ok(Resolved::Edge(rest));
    }
    if path.len() == 1 && first == "id" && !layout.is_edge() {
        return Ok(Resolved::Cond(Target::id()));
    }
    let segments: Vec<&str> = path.iter().map(String::as_str).collect();
    let (prop, n) = layout
        .longest_prop(&segments)
        .ok_or_else(|| unknown(layout, path))?;
    if n == path.len() {
        Ok(Resolved::Cond(Target::prop(prop)))
    } else if prop.prop_type.is_reference() {
        Ok(Resolved::Nested(prop, path[n..].to_vec()))
    } else {
        Err(unknown(layout, path))
    }
}

/// Writes the items of one block into `w`, whose position 0 is the start
/// of the block.
pub(crate) fn write_block(
    w: &mut Writer,
    scope: Scope<'_>,
    terms: &[Term],
) -> Result<(), QueryBuildError> {
    let mut conds: Vec<(u8, u32, Writer)> = Vec::new();
    let mut nested: BTreeMap<u8, (&PropertyDef, Vec<Term>)> = BTreeMap::new();
    let mut edges = Vec::new();
    let mut ors = Vec::new();

    for term in terms {
        let Term::Leaf {
            path,
            operator,
            value,
        } = term
        else {
            ors.push(term);
            continue;
        };
        let leaf = |path: Vec<String>| Term::Leaf {
            path,
            operator: *operator,
            value: value.clone(),
        };
        match resolve(&scope, path)? {
            Resolved::Cond(target) => {
                let mut item = Writer::new();
                write_condition(&mut item, &target, *operator, value, scope.locale)?;
                conds.push((target.slot, target.start, item));
            }
            Resolved::Nested(prop, rest) => {
                let slot = prop.slot().unwrap_or(MAIN_SLOT);
                nested.entry(slot).or_insert_with(|| (prop, Vec::new())).1.push(leaf(rest));
            }
            Resolved::Edge(rest) => edges.push(leaf(rest)),
        }
    }

    conds.sort_by_key(|(slot, start, _)| (*slot, *start));
    for (_, _, item) in &conds {
        w.write_bytes(item.as_bytes());
    }

    for (slot, (prop, terms)) in nested {
        let target = prop
            .target
            .as_ref()
            .and_then(|t| scope.schema.type_by_id(t.type_id))
            .ok_or_else(|| unknown(scope.layout, &prop.path))?;
        let inner = Scope {
            schema: scope.schema,
            layout: target,
            edges: prop.edges.as_deref(),
            locale: scope.locale,
        };
        let mut body = Writer::new();
        write_block(&mut body, inner, &terms)?;
        w.write_byte(if prop.prop_type == PropType::Reference {
            op::REF
        } else {
            op::REFS
        });
        w.write_byte(slot);
        w.write_u16(target.id);
        w.write_sized(body.as_bytes());
    }

    if let (Some(layout), false) = (scope.edges, edges.is_empty()) {
        let inner = Scope {
            schema: scope.schema,
            layout,
            edges: None,
            locale: scope.locale,
        };
        let mut body = Writer::new();
        write_block(&mut body, inner, &edges)?;
        w.write_byte(op::EDGE);
        w.write_sized(body.as_bytes());
    }

    for term in ors {
        if let Term::Or(left, right) = term {
            w.write_byte(op::OR);
            let jump = w.reserve::<4>();
            let right_size = w.reserve::<4>();
            write_block(w, scope, left)?;
            let right_start = w.len();
            w.patch_u32(jump, right_start as u32);
            write_block(w, scope, right)?;
            w.patch_u32(right_size, (w.len() - right_start) as u32);
        }
    }
    Ok(())
}

fn check_supported(target: &Target<'_>, operator: Operator) -> Result<(), QueryBuildError> {
    let t = target.prop_type;
    let supported = match operator {
        Operator::Equal | Operator::NotEqual => !matches!(
            t,
            PropType::Vector | PropType::ColVec | PropType::Cardinality | PropType::References
        ),
        Operator::Greater
        | Operator::GreaterEq
        | Operator::Less
        | Operator::LessEq
        | Operator::Between => t.is_numeric(),
        Operator::Includes | Operator::NotIncludes => matches!(
            t,
            PropType::String
                | PropType::Alias
                | PropType::Text
                | PropType::Binary
                | PropType::References
        ),
        Operator::Exists | Operator::NotExists => target.is_separate(),
    };
    if supported {
        Ok(())
    } else {
        Err(QueryBuildError::UnsupportedOperator {
            field: target.name.clone(),
            operator: operator.name(),
            prop_type: t,
        })
    }
}

fn write_condition(
    w: &mut Writer,
    target: &Target<'_>,
    operator: Operator,
    value: &Value,
    locale: u8,
) -> Result<(), QueryBuildError> {
    check_supported(target, operator)?;
    let (code, operand) = match operator {
        Operator::Equal | Operator::NotEqual => equality(target, value)?,
        Operator::Greater => (op::GREATER, fixed_bytes(target, value)?),
        Operator::GreaterEq => (op::GREATER_EQ, fixed_bytes(target, value)?),
        Operator::Less => (op::LESS, fixed_bytes(target, value)?),
        Operator::LessEq => (op::LESS_EQ, fixed_bytes(target, value)?),
        Operator::Between => (op::RANGE, range_operand(target, value)?),
        Operator::Includes | Operator::NotIncludes => (op::INCLUDES, includes_operand(target, value)?),
        Operator::Exists | Operator::NotExists => (op::EXISTS, Vec::new()),
    };
    let code = if operator.negated() { code | op::NEGATE } else { code };

    w.write_byte(op::COND);
    w.write_byte(code);
    w.write_byte(target.slot);
    w.write_byte(target.prop_type as u8);
    w.write_u32(target.start);
    w.write_u16(target.width);
    w.write_byte(if target.prop_type == PropType::Text { locale } else { 0 });
    w.write_sized(&operand);
    Ok(())
}

fn values(value: &Value) -> &[Value] {
    match value {
        Value::List(items) => items,
        single => std::slice::from_ref(single),
    }
}

fn equality(target: &Target<'_>, value: &Value) -> Result<(u8, Vec<u8>), QueryBuildError> {
    let values = values(value);
    if values.is_empty() {
        return Err(target.invalid("no values to compare"));
    }
    if matches!(
        target.prop_type,
        PropType::String | PropType::Alias | PropType::Text | PropType::Binary
    ) {
        let mut operand = Writer::new();
        operand.write_u32(values.len() as u32);
        for v in values {
            operand.write_sized(&content_bytes(target, v)?);
        }
        return Ok((op::EQUAL_ANY, operand.into_bytes()));
    }
    let encoded = values
        .iter()
        .map(|v| fixed_bytes(target, v))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(equality_operand(&encoded, target.width as usize))
}

/// Raw content of a string-like value, as the engine compares it.
fn content_bytes(target: &Target<'_>, value: &Value) -> Result<Vec<u8>, QueryBuildError> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Binary(b) => Ok(b.clone()),
        other => Err(target.invalid(format!("expected string, got {}", other.kind()))),
    }
}

fn node_id(target: &Target<'_>, value: &Value) -> Result<u32, QueryBuildError> {
    let id = match value {
        Value::Ref(r) => match r.target {
            NodeRef::Id(id) => return Ok(id),
            NodeRef::Pending(_) => return Err(target.invalid("pending ids cannot be queried")),
        },
        other => other.as_int(),
    };
    id.and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| target.invalid("not a valid node id"))
}

/// Encodes a value in the field's stored width.
fn fixed_bytes(target: &Target<'_>, value: &Value) -> Result<Vec<u8>, QueryBuildError> {
    let prop = match target.prop {
        Some(prop) if prop.prop_type != PropType::Reference => prop,
        _ => return Ok(node_id(target, value)?.to_le_bytes().to_vec()),
    };
    validate_builtin(prop, value).map_err(|message| target.invalid(message))?;
    let mut out = vec![0u8; prop.len];
    write_main_value(&mut out, prop, value).map_err(|message| target.invalid(message))?;
    Ok(out)
}

fn range_operand(target: &Target<'_>, value: &Value) -> Result<Vec<u8>, QueryBuildError> {
    let [min, max] = values(value) else {
        return Err(target.invalid("between needs [min, max]"));
    };
    let min_bytes = fixed_bytes(target, min)?;
    let mut operand = min_bytes.clone();
    if target.prop_type == PropType::Number {
        let (lo, hi) = min.as_f64().zip(max.as_f64()).ok_or_else(|| target.invalid("expected numbers"))?;
        if hi < lo {
            return Err(target.invalid("max is below min"));
        }
        operand.extend_from_slice(&(hi - lo).to_le_bytes());
        return Ok(operand);
    }
    let (lo, hi) = min.as_int().zip(max.as_int()).ok_or_else(|| target.invalid("expected integers"))?;
    if hi < lo {
        return Err(target.invalid("max is below min"));
    }
    fixed_bytes(target, max)?;
    let diff = (hi as i128 - lo as i128) as u64;
    operand.extend_from_slice(&diff.to_le_bytes()[..min_bytes.len()]);
    Ok(operand)
}

fn includes_operand(target: &Target<'_>, value: &Value) -> Result<Vec<u8>, QueryBuildError> {
    if target.prop_type == PropType::References {
        let mut operand = Vec::new();
        for v in values(value) {
            operand.extend_from_slice(&node_id(target, v)?.to_le_bytes());
        }
        return Ok(operand);
    }
    content_bytes(target, value)
}

/// Compiles a filter for `type_name` into a block body.
///
/// `locale` scopes text conditions to one locale; `None` matches any.
pub fn compile_filter(
    schema: &SchemaLayout,
    type_name: &str,
    filter: &Filter,
    locale: Option<&str>,
) -> Result<Vec<u8>, QueryBuildError> {
    let layout = schema
        .type_by_name(type_name)
        .ok_or_else(|| QueryBuildError::UnknownType {
            type_name: type_name.to_string(),
        })?;
    let scope = Scope {
        schema,
        layout,
        edges: None,
        locale: super::locale_of(schema, locale)?,
    };
    let mut w = Writer::new();
    write_block(&mut w, scope, &terms(filter))?;
    Ok(w.into_bytes())
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
                    .prop("score", PropDecl::number())
                    .prop("friends", PropDecl::references("user"))
                    .prop("status", PropDecl::enumeration(["active", "idle"])),
            ),
            &SchemaOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_equality_batching_choice() {
        let one = vec![vec![1u8, 0]];
        assert_eq!(equality_operand(&one, 2).0, op::EQUAL);

        let eight: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i, 0]).collect();
        let (code, operand) = equality_operand(&eight, 2);
        assert_eq!(code, op::EQUAL_BATCH_SMALL);
        assert_eq!(operand.len(), VECTOR_WIDTH);

        let nine: Vec<Vec<u8>> = (0..9u8).map(|i| vec![i, 0]).collect();
        let (code, operand) = equality_operand(&nine, 2);
        assert_eq!(code, op::EQUAL_BATCH_LARGE);
        assert_eq!(operand.len(), 2 * VECTOR_WIDTH);
        // padding repeats the first value
        assert_eq!(&operand[18..20], &[0, 0]);
    }

    #[test]
    fn test_condition_layout() {
        let schema = schema();
        let bytes = compile_filter(&schema, "user", &Filter::eq("age", 30i64), None).unwrap();
        let age = schema.type_by_name("user").unwrap().prop("age").unwrap();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_byte("item").unwrap(), op::COND);
        assert_eq!(r.read_byte("op").unwrap(), op::EQUAL);
        assert_eq!(r.read_byte("slot").unwrap(), MAIN_SLOT);
        assert_eq!(r.read_byte("type").unwrap(), PropType::Uint8 as u8);
        assert_eq!(r.read_u32("start").unwrap(), age.offset().unwrap());
        assert_eq!(r.read_u16("width").unwrap(), 1);
        assert_eq!(r.read_byte("locale").unwrap(), 0);
        assert_eq!(r.read_sized("operand").unwrap(), &[30]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_conditions_sorted_by_slot_and_start() {
        let schema = schema();
        let filter = Filter::eq("name", "ann")
            .and(Filter::eq("age", 3i64))
            .and(Filter::new("score", Operator::Greater, 1.5));
        let bytes = compile_filter(&schema, "user", &filter, None).unwrap();

        let mut r = Reader::new(&bytes);
        let mut keys = Vec::new();
        while !r.is_empty() {
            r.read_byte("item").unwrap();
            r.read_byte("op").unwrap();
            let slot = r.read_byte("slot").unwrap();
            r.read_byte("type").unwrap();
            let start = r.read_u32("start").unwrap();
            r.read_bytes(3, "rest").unwrap();
            r.read_sized("operand").unwrap();
            keys.push((slot, start));
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 3);
    }

    /// `[OR][u32 jump][u32 right size]` ahead of the left branch.
    const OR_HEADER: usize = 9;
    /// COND item around a one-byte operand.
    const U8_COND: usize = 16;

    fn or_header(bytes: &[u8], at: usize) -> (usize, usize) {
        let mut r = Reader::new(&bytes[at..]);
        assert_eq!(r.read_byte("item").unwrap(), op::OR);
        let jump = r.read_u32("jump").unwrap() as usize;
        let size = r.read_u32("right size").unwrap() as usize;
        (jump, size)
    }

    #[test]
    fn test_or_jump_points_at_right_branch() {
        let schema = schema();
        let filter = Filter::eq("age", 1i64).or(
            Filter::eq("status", "idle").and(Filter::new("score", Operator::Greater, 1.5)),
        );
        let bytes = compile_filter(&schema, "user", &filter, None).unwrap();

        let (jump, size) = or_header(&bytes, 0);
        assert_eq!(jump, OR_HEADER + U8_COND);
        assert_eq!(bytes[OR_HEADER], op::COND);
        assert_eq!(bytes[jump], op::COND);
        assert_eq!(jump + size, bytes.len());

        // the right branch is exactly the two AND-ed conditions
        let mut r = Reader::new(&bytes[jump..]);
        for _ in 0..2 {
            assert_eq!(r.read_byte("item").unwrap(), op::COND);
            r.read_bytes(10, "cond header").unwrap();
            r.read_sized("operand").unwrap();
        }
        assert!(r.is_empty());
    }

    #[test]
    fn test_chained_or_nests_to_the_right() {
        let schema = schema();
        let filter = Filter::eq("age", 1i64)
            .or(Filter::eq("age", 2i64))
            .or(Filter::eq("age", 3i64));
        let bytes = compile_filter(&schema, "user", &filter, None).unwrap();
        assert_eq!(bytes.len(), 2 * OR_HEADER + 3 * U8_COND);

        let (outer_jump, outer_size) = or_header(&bytes, 0);
        assert_eq!(outer_jump, OR_HEADER + U8_COND);
        assert_eq!(outer_jump + outer_size, bytes.len());

        // jumps stay relative to the start of the whole block
        let (inner_jump, inner_size) = or_header(&bytes, outer_jump);
        assert_eq!(inner_jump, outer_jump + OR_HEADER + U8_COND);
        assert_eq!(bytes[outer_jump + OR_HEADER], op::COND);
        assert_eq!(bytes[inner_jump], op::COND);
        assert_eq!(bytes[inner_jump + U8_COND - 1], 3);
        assert_eq!(inner_jump + inner_size, bytes.len());
    }

    #[test]
    fn test_range_operand() {
        let schema = schema();
        let bytes = compile_filter(&schema, "user", &Filter::between("age", 10i64, 20i64), None).unwrap();
        assert_eq!(bytes[1], op::RANGE);
        assert_eq!(&bytes[bytes.len() - 2..], &[10, 10]);
    }

    #[test]
    fn test_build_errors() {
        let schema = schema();
        assert!(matches!(
            compile_filter(&schema, "user", &Filter::eq("nope", 1i64), None),
            Err(QueryBuildError::UnknownField { .. })
        ));
        assert!(matches!(
            compile_filter(&schema, "user", &Filter::new("name", Operator::Greater, 1i64), None),
            Err(QueryBuildError::UnsupportedOperator { .. })
        ));
        assert!(matches!(
            compile_filter(&schema, "user", &Filter::eq("status", "gone"), None),
            Err(QueryBuildError::InvalidValue { .. })
        ));
        assert!(matches!(
            compile_filter(&schema, "user", &Filter::exists("age"), None),
            Err(QueryBuildError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn test_reference_scope() {
        let schema = schema();
        let filter = Filter::eq("friends.age", 3i64).and(Filter::eq("friends.name", "bo"));
        let bytes = compile_filter(&schema, "user", &filter, None).unwrap();
        let friends = schema.type_by_name("user").unwrap().prop("friends").unwrap();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.read_byte("item").unwrap(), op::REFS);
        assert_eq!(r.read_byte("slot").unwrap(), friends.slot().unwrap());
        assert_eq!(r.read_u16("type").unwrap(), 1);
        let body = r.read_sized("body").unwrap();
        assert!(r.is_empty());
        assert_eq!(body[0], op::COND);
    }
}
