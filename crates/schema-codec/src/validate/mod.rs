//! Value validation against compiled properties.
//!
//! Checks run before any byte is written: the declared type first, then
//! declared bounds (`min`, `max`, `max_bytes`, enum labels, vector
//! dimensions), then the property's custom validator if it has one.
//! Edge properties of a reference are validated when the edge record
//! itself is encoded.

use crate::model::{NodeRef, RefValue, Value};
use crate::schema::locale::locale_id;
use crate::schema::{PropType, PropertyDef};

/// Validates a single value for a property.
///
/// `Null` is always accepted; its meaning (skip or delete) is up to the
/// caller.
pub fn validate_value(prop: &PropertyDef, value: &Value) -> Result<(), String> {
    validate_builtin(prop, value)?;
    match &prop.validator {
        Some(validator) if !value.is_null() => validator.check(value),
        _ => Ok(()),
    }
}

/// Runs the type and bound checks only, skipping any custom validator.
pub fn validate_builtin(prop: &PropertyDef, value: &Value) -> Result<(), String> {
    if value.is_null() {
        return Ok(());
    }
    match prop.prop_type {
        PropType::Timestamp
        | PropType::Int8
        | PropType::Uint8
        | PropType::Int16
        | PropType::Uint16
        | PropType::Int32
        | PropType::Uint32 => validate_integer(prop, value)?,
        PropType::Number => validate_number(prop, value)?,
        PropType::Boolean => expect(matches!(value, Value::Bool(_)), "boolean", value)?,
        PropType::Enum => validate_enum(prop, value)?,
        PropType::String | PropType::Alias => match value {
            Value::String(s) => check_max_bytes(prop, s.len())?,
            _ => return Err(mismatch("string", value)),
        },
        PropType::Binary => match value {
            Value::Binary(b) => check_max_bytes(prop, b.len())?,
            _ => return Err(mismatch("binary", value)),
        },
        PropType::Text => validate_text(prop, value)?,
        PropType::Cardinality => validate_cardinality(value)?,
        PropType::Vector | PropType::ColVec => validate_vector(prop, value)?,
        PropType::Reference => match value {
            Value::Ref(r) => validate_ref(r)?,
            Value::Int(id) => validate_node_id(*id)?,
            _ => return Err(mismatch("reference", value)),
        },
        PropType::References => validate_references(value)?,
    }
    Ok(())
}

fn mismatch(expected: &str, value: &Value) -> String {
    format!("expected {}, got {}", expected, value.kind())
}

fn expect(ok: bool, expected: &str, value: &Value) -> Result<(), String> {
    if ok { Ok(()) } else { Err(mismatch(expected, value)) }
}

fn check_bounds(prop: &PropertyDef, v: f64) -> Result<(), String> {
    if let Some(min) = prop.min {
        if v < min {
            return Err(format!("{} is below minimum {}", v, min));
        }
    }
    if let Some(max) = prop.max {
        if v > max {
            return Err(format!("{} is above maximum {}", v, max));
        }
    }
    Ok(())
}

fn validate_integer(prop: &PropertyDef, value: &Value) -> Result<(), String> {
    let v = value.as_int().ok_or_else(|| mismatch("integer", value))?;
    if let Some((lo, hi)) = prop.prop_type.int_range() {
        if v < lo || v > hi {
            return Err(format!("{} is out of range {}..={}", v, lo, hi));
        }
    }
    check_bounds(prop, v as f64)
}

fn validate_number(prop: &PropertyDef, value: &Value) -> Result<(), String> {
    let v = value.as_f64().ok_or_else(|| mismatch("number", value))?;
    if v.is_nan() {
        return Err("NaN is not allowed".to_string());
    }
    check_bounds(prop, v)
}

fn validate_enum(prop: &PropertyDef, value: &Value) -> Result<(), String> {
    let label = value.as_str().ok_or_else(|| mismatch("enum label", value))?;
    if prop.enum_index(label).is_none() {
        return Err(format!("{:?} is not one of {:?}", label, prop.enum_values));
    }
    Ok(())
}

fn check_max_bytes(prop: &PropertyDef, len: usize) -> Result<(), String> {
    match prop.max_bytes {
        Some(max) if len > max => Err(format!("length {} exceeds max_bytes {}", len, max)),
        _ => Ok(()),
    }
}

fn validate_text(prop: &PropertyDef, value: &Value) -> Result<(), String> {
    match value {
        Value::String(s) => check_max_bytes(prop, s.len()),
        Value::Text(map) => {
            for (code, s) in map {
                let known = locale_id(code).is_some_and(|id| prop.locales.contains(&id));
                if !known {
                    return Err(format!("locale {:?} is not enabled", code));
                }
                check_max_bytes(prop, s.len())?;
            }
            Ok(())
        }
        _ => Err(mismatch("text", value)),
    }
}

fn validate_cardinality(value: &Value) -> Result<(), String> {
    match value {
        Value::String(_) | Value::Binary(_) => Ok(()),
        Value::List(items) => items.iter().try_for_each(|item| match item {
            Value::String(_) | Value::Binary(_) => Ok(()),
            other => Err(mismatch("string or binary", other)),
        }),
        _ => Err(mismatch("string, binary or list", value)),
    }
}

fn validate_vector(prop: &PropertyDef, value: &Value) -> Result<(), String> {
    let Value::Vector(v) = value else {
        return Err(mismatch("vector", value));
    };
    let dims = prop.dims.unwrap_or_default();
    if v.len() != dims {
        return Err(format!("expected {} dimensions, got {}", dims, v.len()));
    }
    if v.iter().any(|f| !f.is_finite()) {
        return Err("vector values must be finite".to_string());
    }
    Ok(())
}

fn validate_node_id(id: i64) -> Result<(), String> {
    if id <= 0 || id > u32::MAX as i64 {
        return Err(format!("{} is not a valid node id", id));
    }
    Ok(())
}

fn validate_ref(r: &RefValue) -> Result<(), String> {
    match r.target {
        NodeRef::Id(0) => Err("0 is not a valid node id".to_string()),
        _ => Ok(()),
    }
}

fn validate_ref_item(item: &Value) -> Result<(), String> {
    match item {
        Value::Ref(r) => validate_ref(r),
        Value::Int(id) => validate_node_id(*id),
        other => Err(mismatch("reference", other)),
    }
}

fn validate_references(value: &Value) -> Result<(), String> {
    match value {
        Value::Refs(update) => {
            for r in update.set.iter().flatten().chain(&update.add) {
                validate_ref(r)?;
            }
            for target in &update.delete {
                if *target == NodeRef::Id(0) {
                    return Err("0 is not a valid node id".to_string());
                }
            }
            Ok(())
        }
        Value::List(items) => items.iter().try_for_each(validate_ref_item),
        _ => Err(mismatch("references", value)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::schema::{compile, CustomValidator, PropDecl, SchemaDecl, SchemaOptions, TypeDecl};

    fn prop(decl: PropDecl) -> PropertyDef {
        let schema = compile(
            &SchemaDecl::new()
                .locale("en")
                .type_decl("t", TypeDecl::new().prop("p", decl)),
            &SchemaOptions::default(),
        )
        .unwrap();
        schema.type_by_name("t").unwrap().prop("p").unwrap().clone()
    }

    #[test]
    fn test_integer_ranges() {
        let p = prop(PropDecl::uint8());
        assert!(validate_value(&p, &Value::Int(255)).is_ok());
        assert!(validate_value(&p, &Value::Int(256)).is_err());
        assert!(validate_value(&p, &Value::Int(-1)).is_err());
        assert!(validate_value(&p, &Value::Float(3.0)).is_ok());
        assert!(validate_value(&p, &Value::from("3")).is_err());

        let bounded = prop(PropDecl::int16().min(-10.0).max(10.0));
        assert!(validate_value(&bounded, &Value::Int(-10)).is_ok());
        assert!(validate_value(&bounded, &Value::Int(11)).is_err());
    }

    #[test]
    fn test_number_rejects_nan() {
        let p = prop(PropDecl::number());
        assert!(validate_value(&p, &Value::Float(1.5)).is_ok());
        assert!(validate_value(&p, &Value::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_strings_and_enums() {
        let s = prop(PropDecl::string().max_bytes(3));
        assert!(validate_value(&s, &Value::from("abc")).is_ok());
        assert!(validate_value(&s, &Value::from("abcd")).is_err());

        let e = prop(PropDecl::enumeration(["a", "b"]));
        assert!(validate_value(&e, &Value::from("b")).is_ok());
        assert!(validate_value(&e, &Value::from("c")).is_err());
    }

    #[test]
    fn test_text_locales() {
        let t = prop(PropDecl::text());
        let mut map = BTreeMap::new();
        map.insert("en".to_string(), "hi".to_string());
        assert!(validate_value(&t, &Value::Text(map.clone())).is_ok());
        map.insert("fr".to_string(), "salut".to_string());
        assert!(validate_value(&t, &Value::Text(map)).is_err());
    }

    #[test]
    fn test_vector_dimensions() {
        let v = prop(PropDecl::vector(3));
        assert!(validate_value(&v, &Value::Vector(vec![1.0, 2.0, 3.0])).is_ok());
        assert!(validate_value(&v, &Value::Vector(vec![1.0])).is_err());
        assert!(validate_value(&v, &Value::Vector(vec![1.0, f32::NAN, 0.0])).is_err());
    }

    #[test]
    fn test_custom_validator_runs_last() {
        let even = CustomValidator::new(|v| match v.as_int() {
            Some(n) if n % 2 == 0 => Ok(()),
            _ => Err("must be even".to_string()),
        });
        let p = prop(PropDecl::uint32().validator(even));
        assert!(validate_value(&p, &Value::Int(4)).is_ok());
        assert_eq!(validate_value(&p, &Value::Int(5)), Err("must be even".to_string()));
        assert!(validate_value(&p, &Value::from("x")).unwrap_err().contains("expected integer"));
        assert!(validate_builtin(&p, &Value::Int(5)).is_ok());
    }
}
