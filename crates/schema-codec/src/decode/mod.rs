//! Result decoding.
//!
//! The decoder walks the engine's result buffer with the [`ReadPlan`] of the
//! query that produced it. Framing errors (the header or a record size that
//! runs past the buffer) fail the whole decode; anything wrong inside a
//! record fails only that record.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::codec::ops::result as op;
use crate::codec::primitives::Reader;
use crate::codec::value::{read_main_value, read_separate_value, read_text_payload};
use crate::error::DecodeError;
use crate::model::{Record, Value};
use crate::query::aggregate::{AggregateKind, AggregatePlan};
use crate::query::include::{MainPlan, ReadPlan};
use crate::schema::{locale_code, PropType, PropertyDef, SchemaLayout, TypeLayout};

/// Decoded answer to a record query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Matching nodes before the range was applied.
    pub total: u32,
    /// One entry per returned node, in engine order.
    pub records: Vec<Result<Record, DecodeError>>,
}

impl QueryResult {
    /// All records, or the first record error.
    pub fn into_records(self) -> Result<Vec<Record>, DecodeError> {
        self.records.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Decodes `[u32 total] record*`.
pub fn decode_result(
    schema: &SchemaLayout,
    plan: &ReadPlan,
    bytes: &[u8],
) -> Result<QueryResult, DecodeError> {
    let mut r = Reader::new(bytes);
    let total = r.read_u32("result total")?;
    let mut records = Vec::new();
    while !r.is_empty() {
        let id = r.read_u32("record id")?;
        let body = r.read_sized("record")?;
        let record = decode_node(schema, plan, id, body);
        if let Err(e) = &record {
            trace!(id, error = %e, "record failed to decode");
        }
        records.push(record);
    }
    Ok(QueryResult { total, records })
}

fn decode_node(
    schema: &SchemaLayout,
    plan: &ReadPlan,
    id: u32,
    body: &[u8],
) -> Result<Record, DecodeError> {
    let mut record = decode_instructions(schema, plan, body)?;
    record.insert("id", Value::Int(id as i64));
    Ok(record)
}

/// Decodes a nested `[u32 id][u32 size] body` record.
fn decode_nested(
    schema: &SchemaLayout,
    plan: &ReadPlan,
    r: &mut Reader<'_>,
) -> Result<Record, DecodeError> {
    let id = r.read_u32("nested record id")?;
    let body = r.read_sized("nested record")?;
    decode_node(schema, plan, id, body)
}

fn layout_of<'a>(
    schema: &'a SchemaLayout,
    plan: &'a ReadPlan,
) -> Result<&'a TypeLayout, DecodeError> {
    plan.layout
        .resolve(schema)
        .ok_or(DecodeError::MalformedEncoding {
            context: "plan type is not in the schema",
        })
}

fn unknown_slot(layout: &TypeLayout, slot: u8) -> DecodeError {
    DecodeError::UnknownSlot {
        type_name: layout.name.clone(),
        slot,
    }
}

/// Decodes `instr* END` against a plan.
fn decode_instructions(
    schema: &SchemaLayout,
    plan: &ReadPlan,
    body: &[u8],
) -> Result<Record, DecodeError> {
    let layout = layout_of(schema, plan)?;
    let mut record = Record::new();
    let mut texts: BTreeMap<usize, BTreeMap<u8, String>> = BTreeMap::new();
    let mut r = Reader::new(body);

    loop {
        match r.read_byte("result instruction")? {
            op::END => break,
            op::MAIN => {
                let bytes = r.read_sized("main block")?;
                decode_main(layout, &plan.main, bytes, &mut record)?;
            }
            op::FIELD => {
                let slot = r.read_byte("field slot")?;
                let payload = r.read_sized("field payload")?;
                let prop = layout.prop_by_slot(slot).ok_or_else(|| unknown_slot(layout, slot))?;
                if prop.prop_type == PropType::Text {
                    let (locale, s) = read_text_payload(payload)?;
                    let index = layout.prop_index(&prop.name).unwrap_or_default();
                    texts.entry(index).or_default().insert(locale, s);
                } else {
                    record.insert_path(&prop.path, read_separate_value(prop, payload)?);
                }
            }
            code @ (op::REF | op::REFS) => {
                let slot = r.read_byte("reference slot")?;
                let mut inner = Reader::new(r.read_sized("reference")?);
                let entry = plan
                    .refs
                    .iter()
                    .find(|e| e.slot == slot)
                    .ok_or_else(|| unknown_slot(layout, slot))?;
                let prop = &layout.props[entry.prop];
                let value = if code == op::REF {
                    Value::Object(decode_nested(schema, &entry.plan, &mut inner)?)
                } else {
                    let n = inner.read_u32("reference count")?;
                    let items = (0..n)
                        .map(|_| decode_nested(schema, &entry.plan, &mut inner).map(Value::Object))
                        .collect::<Result<Vec<_>, _>>()?;
                    Value::List(items)
                };
                if !inner.is_empty() {
                    return Err(DecodeError::MalformedEncoding {
                        context: "bytes after reference records",
                    });
                }
                record.insert_path(&prop.path, value);
            }
            op::EDGE => {
                let body = r.read_sized("edge")?;
                let edges = plan.edges.as_deref().ok_or(DecodeError::MalformedEncoding {
                    context: "unrequested edge block",
                })?;
                for (key, value) in decode_instructions(schema, edges, body)? {
                    record.insert(format!("${}", key), value);
                }
            }
            op::AGG => {
                let slot = r.read_byte("count slot")?;
                let kind = r.read_byte("count kind")?;
                let value = r.read_u64("count value")?;
                if AggregateKind::from_code(kind) != Some(AggregateKind::Count) {
                    return Err(DecodeError::InvalidOpcode {
                        opcode: kind,
                        context: "reference count",
                    });
                }
                let prop = layout.prop_by_slot(slot).ok_or_else(|| unknown_slot(layout, slot))?;
                record.insert(count_key(prop), Value::Int(value as i64));
            }
            opcode => {
                return Err(DecodeError::InvalidOpcode {
                    opcode,
                    context: "result record",
                });
            }
        }
    }
    if !r.is_empty() {
        return Err(DecodeError::MalformedEncoding {
            context: "bytes after END",
        });
    }

    for (index, values) in texts {
        let prop = &layout.props[index];
        record.insert_path(&prop.path, text_value(schema, plan.locale, values)?);
    }
    fill_missing(schema, layout, plan, &mut record)?;
    Ok(record)
}

fn count_key(prop: &PropertyDef) -> String {
    format!("count({})", prop.name)
}

fn decode_main(
    layout: &TypeLayout,
    plan: &MainPlan,
    bytes: &[u8],
    record: &mut Record,
) -> Result<(), DecodeError> {
    match plan {
        MainPlan::None => Err(DecodeError::MalformedEncoding {
            context: "unrequested main block",
        }),
        MainPlan::All => {
            if bytes.len() != layout.main_len {
                return Err(DecodeError::RecordOverrun {
                    context: "main block",
                    len: layout.main_len,
                    remaining: bytes.len(),
                });
            }
            for prop in layout.main_props() {
                let start = prop.offset().unwrap_or(0) as usize;
                let value = read_main_value(prop, &bytes[start..start + prop.len])?;
                record.insert_path(&prop.path, value);
            }
            Ok(())
        }
        MainPlan::Props(props) => {
            let mut r = Reader::new(bytes);
            for &index in props {
                let prop = &layout.props[index];
                let value = read_main_value(prop, r.read_bytes(prop.len, "main value")?)?;
                record.insert_path(&prop.path, value);
            }
            if !r.is_empty() {
                return Err(DecodeError::MalformedEncoding {
                    context: "main block longer than requested",
                });
            }
            Ok(())
        }
    }
}

/// Picks the requested locale (or its first available fallback), or
/// returns every locale when none was requested.
fn text_value(
    schema: &SchemaLayout,
    requested: Option<u8>,
    values: BTreeMap<u8, String>,
) -> Result<Value, DecodeError> {
    let Some(locale) = requested else {
        let mut map = BTreeMap::new();
        for (id, s) in values {
            let code = locale_code(id).ok_or(DecodeError::MalformedEncoding {
                context: "text locale",
            })?;
            map.insert(code.to_string(), s);
        }
        return Ok(Value::Text(map));
    };
    let fallback = schema
        .locale_by_id(locale)
        .map(|l| l.fallback.as_slice())
        .unwrap_or_default();
    Ok(std::iter::once(&locale)
        .chain(fallback)
        .find_map(|id| values.get(id))
        .map_or(Value::Null, |s| Value::String(s.clone())))
}

/// Included fields the engine did not send decode as `Null`.
fn fill_missing(
    schema: &SchemaLayout,
    layout: &TypeLayout,
    plan: &ReadPlan,
    record: &mut Record,
) -> Result<(), DecodeError> {
    let main: Vec<usize> = match &plan.main {
        MainPlan::None => Vec::new(),
        MainPlan::All => (0..layout.props.len()).filter(|&i| layout.props[i].is_main()).collect(),
        MainPlan::Props(props) => props.clone(),
    };
    let refs = plan.refs.iter().map(|e| e.prop);
    for index in main.into_iter().chain(plan.fields.iter().copied()).chain(refs) {
        let path = &layout.props[index].path;
        if !record.contains_path(path) {
            record.insert_path(path, Value::Null);
        }
    }
    for &index in &plan.counts {
        let key = count_key(&layout.props[index]);
        if record.get(&key).is_none() {
            record.insert(key, Value::Int(0));
        }
    }
    if let Some(edges) = plan.edges.as_deref() {
        let edge_layout = layout_of(schema, edges)?;
        let mut empty = Record::new();
        fill_missing(schema, edge_layout, edges, &mut empty)?;
        for (key, value) in empty {
            let key = format!("${}", key);
            if record.get(&key).is_none() {
                record.insert(key, value);
            }
        }
    }
    Ok(())
}

// =============================================================================
// AGGREGATES
// =============================================================================

/// Decodes `[u32 groups]([u32 key len][key][u64 or f64 per aggregate])*`.
///
/// Without grouping the result is the single group's record; with grouping
/// each group's record sits under its key label.
pub(crate) fn decode_aggregates(
    schema: &SchemaLayout,
    plan: &AggregatePlan,
    bytes: &[u8],
) -> Result<Record, DecodeError> {
    let mut r = Reader::new(bytes);
    let groups = r.read_u32("aggregate groups")?;
    let group_prop = match &plan.group {
        Some(group) => {
            let layout = schema
                .type_by_id(group.type_id)
                .ok_or(DecodeError::MalformedEncoding {
                    context: "group type is not in the schema",
                })?;
            Some((&layout.props[group.prop], group.bucket))
        }
        None => None,
    };

    let mut out = Record::new();
    let mut seen: FxHashMap<String, usize> = FxHashMap::default();
    for _ in 0..groups {
        let key = r.read_sized("group key")?;
        let mut values = Record::new();
        for item in &plan.items {
            let raw = r.read_u64("aggregate value")?;
            let value = if item.kind.is_count() {
                Value::Int(raw as i64)
            } else {
                let f = f64::from_bits(raw);
                if f.is_nan() { Value::Null } else { Value::Float(f) }
            };
            if item.path.is_empty() {
                values.insert("count", value);
            } else {
                let mut path = item.path.clone();
                path.push(item.kind.name().to_string());
                values.insert_path(&path, value);
            }
        }
        match group_prop {
            None => return Ok(values),
            Some((prop, bucket)) => {
                let label = group_label(prop, bucket, key)?;
                *seen.entry(label.clone()).or_default() += 1;
                out.insert(label, Value::Object(values));
            }
        }
    }
    if !r.is_empty() {
        return Err(DecodeError::MalformedEncoding {
            context: "bytes after aggregate groups",
        });
    }
    if seen.values().any(|&n| n > 1) {
        return Err(DecodeError::MalformedEncoding {
            context: "duplicate group key",
        });
    }
    Ok(out)
}

fn group_label(prop: &PropertyDef, bucket: u64, key: &[u8]) -> Result<String, DecodeError> {
    let value = if bucket > 0 {
        let raw: [u8; 8] = key.try_into().map_err(|_| DecodeError::MalformedEncoding {
            context: "bucket key",
        })?;
        if prop.prop_type == PropType::Number {
            Value::Float(f64::from_le_bytes(raw))
        } else {
            Value::Int(i64::from_le_bytes(raw))
        }
    } else if prop.is_main() {
        read_main_value(prop, key)?
    } else {
        Value::String(String::from_utf8(key.to_vec()).map_err(|_| DecodeError::InvalidUtf8 {
            field: "group key",
        })?)
    };
    Ok(match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s,
        _ => {
            return Err(DecodeError::MalformedEncoding {
                context: "group key type",
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::primitives::Writer;
    use crate::query::include::{LayoutRef, PlanBuilder};
    use crate::schema::{compile, PropDecl, SchemaDecl, SchemaOptions, TypeDecl};

    fn schema() -> SchemaLayout {
        compile(
            &SchemaDecl::new()
                .locale("en")
                .locale_with_fallback("nl", ["en"])
                .type_decl(
                    "user",
                    TypeDecl::new()
                        .prop("name", PropDecl::string())
                        .prop("age", PropDecl::uint8())
                        .prop("bio", PropDecl::text()),
                ),
            &SchemaOptions::default(),
        )
        .unwrap()
    }

    fn plan(schema: &SchemaLayout, paths: &[&str], locale: Option<u8>) -> ReadPlan {
        let user = schema.type_by_name("user").unwrap();
        let mut builder = PlanBuilder::new(schema, user, LayoutRef::Type(user.id), None, locale);
        for p in paths {
            builder.add(&[p.to_string()], None).unwrap();
        }
        builder.finish(&mut Writer::new()).unwrap()
    }

    fn record(w: &mut Writer, id: u32, body: &[u8]) {
        w.write_u32(id);
        w.write_sized(body);
    }

    #[test]
    fn test_absent_fields_are_null() {
        let schema = schema();
        let plan = plan(&schema, &["age", "name"], None);
        let mut body = Writer::new();
        body.write_byte(op::MAIN);
        body.write_sized(&[28]);
        body.write_byte(op::END);

        let mut w = Writer::new();
        w.write_u32(1);
        record(&mut w, 3, body.as_bytes());

        let result = decode_result(&schema, &plan, w.as_bytes()).unwrap();
        assert_eq!(result.total, 1);
        let rec = result.into_records().unwrap().remove(0);
        assert_eq!(rec.get("id"), Some(&Value::Int(3)));
        assert_eq!(rec.get("age"), Some(&Value::Int(28)));
        assert_eq!(rec.get("name"), Some(&Value::Null));
    }

    #[test]
    fn test_record_error_is_isolated() {
        let schema = schema();
        let plan = plan(&schema, &["age"], None);
        let mut w = Writer::new();
        w.write_u32(2);
        record(&mut w, 1, &[0x7E, op::END]);
        record(&mut w, 2, &[op::MAIN, 1, 0, 0, 0, 9, op::END]);

        let result = decode_result(&schema, &plan, w.as_bytes()).unwrap();
        assert!(matches!(
            result.records[0],
            Err(DecodeError::InvalidOpcode { opcode: 0x7E, .. })
        ));
        assert_eq!(
            result.records[1].as_ref().unwrap().get("age"),
            Some(&Value::Int(9))
        );
    }

    #[test]
    fn test_framing_error_fails_decode() {
        let schema = schema();
        let plan = plan(&schema, &["age"], None);
        let mut w = Writer::new();
        w.write_u32(1);
        w.write_u32(1);
        w.write_u32(100);
        w.write_byte(op::END);
        assert!(matches!(
            decode_result(&schema, &plan, w.as_bytes()),
            Err(DecodeError::RecordOverrun { .. })
        ));
        assert!(matches!(
            decode_result(&schema, &plan, &[1, 0]),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_text_fallback() {
        let schema = schema();
        let nl = schema.locale("nl").unwrap().id;
        let en = schema.locale("en").unwrap().id;
        let bio = schema.type_by_name("user").unwrap().prop("bio").unwrap();

        let mut body = Writer::new();
        body.write_byte(op::FIELD);
        body.write_byte(bio.slot().unwrap());
        let mut payload = Writer::new();
        crate::codec::value::write_text_payload(&mut payload, en, "hello", None);
        body.write_sized(payload.as_bytes());
        body.write_byte(op::END);

        let mut w = Writer::new();
        w.write_u32(1);
        record(&mut w, 1, body.as_bytes());

        let localized = plan(&schema, &["bio"], Some(nl));
        let rec = decode_result(&schema, &localized, w.as_bytes())
            .unwrap()
            .into_records()
            .unwrap()
            .remove(0);
        assert_eq!(rec.get("bio"), Some(&Value::from("hello")));

        let all = plan(&schema, &["bio"], None);
        let rec = decode_result(&schema, &all, w.as_bytes())
            .unwrap()
            .into_records()
            .unwrap()
            .remove(0);
        assert!(matches!(rec.get("bio"), Some(Value::Text(map)) if map["en"] == "hello"));
    }
}
