//! Per-type value encoding/decoding.
//!
//! Main-block values occupy exactly the property's width. Separate values
//! are self-contained payloads; their length is carried by the enclosing
//! instruction.

use std::hash::Hasher;
use std::io::Read;

use rustc_hash::FxHasher;

use crate::codec::ops::compression;
use crate::codec::primitives::{Reader, Writer};
use crate::error::DecodeError;
use crate::limits::MAX_DECOMPRESSED_LEN;
use crate::model::Value;
use crate::schema::locale::locale_code;
use crate::schema::{PropType, PropertyDef};

/// Compression settings for string payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    /// Payloads strictly larger than this are compressed.
    pub threshold: usize,
    pub level: i32,
}

// =============================================================================
// DECODING
// =============================================================================

/// Decodes a main-block value. `src` is exactly the property's width.
pub fn read_main_value(prop: &PropertyDef, src: &[u8]) -> Result<Value, DecodeError> {
    if src.len() != prop.len {
        return Err(DecodeError::MalformedEncoding {
            context: "main value width",
        });
    }
    let value = match prop.prop_type {
        PropType::Timestamp => Value::Int(i64::from_le_bytes(array(src)?)),
        PropType::Number => Value::Float(f64::from_le_bytes(array(src)?)),
        PropType::Int8 => Value::Int(src[0] as i8 as i64),
        PropType::Uint8 => Value::Int(src[0] as i64),
        PropType::Int16 => Value::Int(i16::from_le_bytes(array(src)?) as i64),
        PropType::Uint16 => Value::Int(u16::from_le_bytes(array(src)?) as i64),
        PropType::Int32 => Value::Int(i32::from_le_bytes(array(src)?) as i64),
        PropType::Uint32 => Value::Int(u32::from_le_bytes(array(src)?) as i64),
        PropType::Boolean => match src[0] {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => {
                return Err(DecodeError::MalformedEncoding {
                    context: "boolean byte",
                });
            }
        },
        PropType::Enum => match src[0] {
            0 => Value::Null,
            i => prop
                .enum_values
                .get(i as usize - 1)
                .map(|label| Value::String(label.clone()))
                .ok_or(DecodeError::MalformedEncoding {
                    context: "enum index",
                })?,
        },
        PropType::String | PropType::Binary => {
            let len = src[0] as usize;
            if len + 1 > src.len() {
                return Err(DecodeError::LengthExceedsLimit {
                    field: "fixed string",
                    len,
                    max: src.len() - 1,
                });
            }
            let bytes = &src[1..1 + len];
            if prop.prop_type == PropType::String {
                Value::String(utf8(bytes.to_vec(), "fixed string")?)
            } else {
                Value::Binary(bytes.to_vec())
            }
        }
        _ => {
            return Err(DecodeError::MalformedEncoding {
                context: "type has no main representation",
            });
        }
    };
    Ok(value)
}

fn array<const N: usize>(src: &[u8]) -> Result<[u8; N], DecodeError> {
    src.try_into().map_err(|_| DecodeError::MalformedEncoding {
        context: "fixed width value",
    })
}

fn utf8(bytes: Vec<u8>, field: &'static str) -> Result<String, DecodeError> {
    String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { field })
}

/// Decodes a `[u8 compression][u32 raw len if compressed][bytes]` payload.
pub fn read_string_payload(payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut reader = Reader::new(payload);
    match reader.read_byte("compression flag")? {
        compression::NONE => Ok(reader.remaining().to_vec()),
        compression::ZSTD => {
            let declared = reader.read_u32("uncompressed size")? as usize;
            decompress_zstd(reader.remaining(), declared)
        }
        _ => Err(DecodeError::MalformedEncoding {
            context: "compression flag",
        }),
    }
}

fn decompress_zstd(compressed: &[u8], declared: usize) -> Result<Vec<u8>, DecodeError> {
    if declared > MAX_DECOMPRESSED_LEN {
        return Err(DecodeError::LengthExceedsLimit {
            field: "uncompressed size",
            len: declared,
            max: MAX_DECOMPRESSED_LEN,
        });
    }

    let decoder = zstd::Decoder::new(compressed)
        .map_err(|e| DecodeError::DecompressionFailed(e.to_string()))?;

    // One extra byte so an oversized stream is detected without
    // inflating it completely.
    let mut decompressed = Vec::with_capacity(declared);
    decoder
        .take(declared as u64 + 1)
        .read_to_end(&mut decompressed)
        .map_err(|e| DecodeError::DecompressionFailed(e.to_string()))?;

    if decompressed.len() != declared {
        return Err(DecodeError::UncompressedSizeMismatch {
            declared,
            actual: decompressed.len(),
        });
    }
    Ok(decompressed)
}

/// Decodes a text payload into its locale id and string.
pub fn read_text_payload(payload: &[u8]) -> Result<(u8, String), DecodeError> {
    let (&locale, rest) = payload
        .split_first()
        .ok_or(DecodeError::UnexpectedEof { context: "text locale" })?;
    let s = utf8(read_string_payload(rest)?, "text")?;
    Ok((locale, s))
}

/// Decodes the `[u32 n][u64 hash]*` payload written for cardinality props.
pub fn read_cardinality_hashes(payload: &[u8]) -> Result<Vec<u64>, DecodeError> {
    let mut reader = Reader::new(payload);
    let n = reader.read_u32("cardinality count")? as usize;
    if n * 8 != reader.remaining_len() {
        return Err(DecodeError::RecordOverrun {
            context: "cardinality hashes",
            len: n * 8,
            remaining: reader.remaining_len(),
        });
    }
    (0..n).map(|_| reader.read_u64("cardinality hash")).collect()
}

fn read_vector(payload: &[u8]) -> Result<Vec<f32>, DecodeError> {
    if payload.len() % 4 != 0 {
        return Err(DecodeError::MalformedEncoding {
            context: "vector length",
        });
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Decodes a separate value as it appears in a result buffer.
///
/// Text comes back as a one-entry locale map; the caller merges locales.
pub fn read_separate_value(prop: &PropertyDef, payload: &[u8]) -> Result<Value, DecodeError> {
    match prop.prop_type {
        PropType::String | PropType::Alias => {
            Ok(Value::String(utf8(read_string_payload(payload)?, "string")?))
        }
        PropType::Binary => Ok(Value::Binary(read_string_payload(payload)?)),
        PropType::Text => {
            let (locale, s) = read_text_payload(payload)?;
            let code = locale_code(locale).ok_or(DecodeError::MalformedEncoding {
                context: "text locale",
            })?;
            Ok(Value::Text([(code.to_string(), s)].into_iter().collect()))
        }
        PropType::Cardinality => {
            let mut reader = Reader::new(payload);
            Ok(Value::Int(reader.read_u32("cardinality estimate")? as i64))
        }
        PropType::Vector | PropType::ColVec => Ok(Value::Vector(read_vector(payload)?)),
        _ => Err(DecodeError::MalformedEncoding {
            context: "type has no separate payload",
        }),
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Encodes a main-block value into `dst`, which is exactly the property's
/// width. Expects a validated value.
pub fn write_main_value(dst: &mut [u8], prop: &PropertyDef, value: &Value) -> Result<(), String> {
    if dst.len() != prop.len {
        return Err(format!("main slice of {} bytes for width {}", dst.len(), prop.len));
    }
    match prop.prop_type {
        PropType::Number => {
            let v = value.as_f64().ok_or("expected number")?;
            dst.copy_from_slice(&v.to_le_bytes());
        }
        PropType::Boolean => match value {
            Value::Bool(b) => dst[0] = *b as u8,
            _ => return Err("expected boolean".to_string()),
        },
        PropType::Enum => {
            let label = value.as_str().ok_or("expected enum label")?;
            dst[0] = prop
                .enum_index(label)
                .ok_or_else(|| format!("unknown enum label {:?}", label))?;
        }
        PropType::String | PropType::Binary => {
            let bytes = match value {
                Value::String(s) => s.as_bytes(),
                Value::Binary(b) => b.as_slice(),
                _ => return Err("expected string or binary".to_string()),
            };
            if bytes.len() >= dst.len() {
                return Err(format!("length {} exceeds {}", bytes.len(), dst.len() - 1));
            }
            dst.fill(0);
            dst[0] = bytes.len() as u8;
            dst[1..1 + bytes.len()].copy_from_slice(bytes);
        }
        t if t.is_integer() => {
            let v = value.as_int().ok_or("expected integer")?;
            write_int(dst, v);
        }
        t => return Err(format!("{:?} has no main representation", t)),
    }
    Ok(())
}

/// Writes the low `dst.len()` bytes of a two's complement integer.
pub fn write_int(dst: &mut [u8], v: i64) {
    let bytes = v.to_le_bytes();
    let n = dst.len().min(8);
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// Writes a string payload, compressing it when it is large enough and
/// compression actually saves space.
pub fn write_string_payload(writer: &mut Writer, bytes: &[u8], settings: Option<Compression>) {
    if let Some(settings) = settings.filter(|s| bytes.len() > s.threshold) {
        if let Ok(compressed) = zstd::encode_all(bytes, settings.level) {
            if compressed.len() + 4 < bytes.len() {
                writer.write_byte(compression::ZSTD);
                writer.write_u32(bytes.len() as u32);
                writer.write_bytes(&compressed);
                return;
            }
        }
    }
    writer.write_byte(compression::NONE);
    writer.write_bytes(bytes);
}

/// Writes a text payload for one locale.
pub fn write_text_payload(writer: &mut Writer, locale: u8, s: &str, settings: Option<Compression>) {
    writer.write_byte(locale);
    write_string_payload(writer, s.as_bytes(), settings);
}

/// Hashes one cardinality input.
pub fn cardinality_hash(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Collects the hashes of a cardinality value (single item or list).
pub fn cardinality_hashes(value: &Value) -> Vec<u64> {
    let item = |v: &Value| match v {
        Value::String(s) => Some(cardinality_hash(s.as_bytes())),
        Value::Binary(b) => Some(cardinality_hash(b)),
        _ => None,
    };
    match value {
        Value::List(items) => items.iter().filter_map(item).collect(),
        other => item(other).into_iter().collect(),
    }
}

/// Encodes a separate value (everything except text and references).
///
/// Expects a validated value.
pub fn write_separate_value(
    writer: &mut Writer,
    prop: &PropertyDef,
    value: &Value,
    settings: Option<Compression>,
) -> Result<(), String> {
    match (prop.prop_type, value) {
        (PropType::String | PropType::Alias, Value::String(s)) => {
            write_string_payload(writer, s.as_bytes(), settings);
        }
        (PropType::Binary, Value::Binary(b)) => write_string_payload(writer, b, None),
        (PropType::Cardinality, v) => {
            let hashes = cardinality_hashes(v);
            writer.write_u32(hashes.len() as u32);
            for h in hashes {
                writer.write_u64(h);
            }
        }
        (PropType::Vector | PropType::ColVec, Value::Vector(v)) => {
            for f in v {
                writer.write_bytes(&f.to_le_bytes());
            }
        }
        (t, v) => return Err(format!("cannot encode {} as separate {:?}", v.kind(), t)),
    }
    Ok(())
}
