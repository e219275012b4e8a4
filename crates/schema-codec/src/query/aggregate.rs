//! Aggregate descriptors.

use crate::codec::ops::aggregate as op;
use crate::codec::primitives::Writer;
use crate::error::QueryBuildError;
use crate::limits::MAIN_SLOT;
use crate::model::TypeId;
use crate::schema::{PropType, PropertyDef, TypeLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Distinct values (or the union of a cardinality field's sketches).
    Cardinality,
}

impl AggregateKind {
    pub fn name(self) -> &'static str {
        match self {
            AggregateKind::Count => "count",
            AggregateKind::Sum => "sum",
            AggregateKind::Avg => "avg",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::Cardinality => "cardinality",
        }
    }

    pub fn code(self) -> u8 {
        match self {
            AggregateKind::Count => op::COUNT,
            AggregateKind::Sum => op::SUM,
            AggregateKind::Avg => op::AVG,
            AggregateKind::Min => op::MIN,
            AggregateKind::Max => op::MAX,
            AggregateKind::Cardinality => op::CARDINALITY,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            op::COUNT => Some(AggregateKind::Count),
            op::SUM => Some(AggregateKind::Sum),
            op::AVG => Some(AggregateKind::Avg),
            op::MIN => Some(AggregateKind::Min),
            op::MAX => Some(AggregateKind::Max),
            op::CARDINALITY => Some(AggregateKind::Cardinality),
            _ => None,
        }
    }

    /// Whether the result is an integer count rather than a float.
    pub fn is_count(self) -> bool {
        matches!(self, AggregateKind::Count | AggregateKind::Cardinality)
    }
}

/// One requested aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub kind: AggregateKind,
    /// `None` only for a plain count.
    pub field: Option<String>,
}

impl Aggregate {
    pub fn count() -> Self {
        Self {
            kind: AggregateKind::Count,
            field: None,
        }
    }

    fn of(kind: AggregateKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: Some(field.into()),
        }
    }

    pub fn sum(field: impl Into<String>) -> Self {
        Self::of(AggregateKind::Sum, field)
    }

    pub fn avg(field: impl Into<String>) -> Self {
        Self::of(AggregateKind::Avg, field)
    }

    pub fn min(field: impl Into<String>) -> Self {
        Self::of(AggregateKind::Min, field)
    }

    pub fn max(field: impl Into<String>) -> Self {
        Self::of(AggregateKind::Max, field)
    }

    pub fn cardinality(field: impl Into<String>) -> Self {
        Self::of(AggregateKind::Cardinality, field)
    }
}

/// Grouping of aggregate results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBy {
    pub field: String,
    /// Bucket width for numeric fields; 0 groups on the value itself.
    pub bucket: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AggregateItem {
    pub kind: AggregateKind,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct GroupPlan {
    pub type_id: TypeId,
    pub prop: usize,
    pub bucket: u64,
}

/// Decoder-side mirror of an aggregate descriptor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AggregatePlan {
    pub items: Vec<AggregateItem>,
    pub group: Option<GroupPlan>,
}

fn unsupported(prop: &PropertyDef, operator: &'static str) -> QueryBuildError {
    QueryBuildError::UnsupportedOperator {
        field: prop.name.clone(),
        operator,
        prop_type: prop.prop_type,
    }
}

fn field_header(w: &mut Writer, prop: &PropertyDef) {
    w.write_byte(prop.slot().unwrap_or(MAIN_SLOT));
    w.write_byte(prop.prop_type as u8);
    w.write_u32(prop.offset().unwrap_or(0));
    w.write_u16(if prop.is_main() { prop.len as u16 } else { 0 });
}

fn lookup<'a>(
    layout: &'a TypeLayout,
    field: &str,
) -> Result<(usize, &'a PropertyDef), QueryBuildError> {
    layout
        .prop_index(field)
        .map(|i| (i, &layout.props[i]))
        .ok_or_else(|| QueryBuildError::UnknownField {
            type_name: layout.name.clone(),
            field: field.to_string(),
        })
}

/// Writes the aggregate descriptor body.
pub(crate) fn write_aggregates(
    w: &mut Writer,
    layout: &TypeLayout,
    aggregates: &[Aggregate],
    group: Option<&GroupBy>,
) -> Result<AggregatePlan, QueryBuildError> {
    let group = match group {
        None => {
            w.write_byte(0);
            None
        }
        Some(g) => {
            let (index, prop) = lookup(layout, &g.field)?;
            let direct = matches!(
                prop.prop_type,
                PropType::Enum | PropType::Boolean | PropType::String | PropType::Alias
            ) || prop.prop_type.is_integer();
            let ok = if g.bucket > 0 {
                prop.is_main() && prop.prop_type.is_numeric()
            } else {
                direct && (prop.is_main() || !prop.prop_type.is_integer())
            };
            if !ok {
                return Err(unsupported(prop, "group by"));
            }
            w.write_byte(1);
            field_header(w, prop);
            w.write_u64(g.bucket);
            Some(GroupPlan {
                type_id: layout.id,
                prop: index,
                bucket: g.bucket,
            })
        }
    };

    w.write_u16(aggregates.len() as u16);
    let mut items = Vec::with_capacity(aggregates.len());
    for (result, agg) in aggregates.iter().enumerate() {
        w.write_byte(agg.kind.code());
        let path = match (&agg.field, agg.kind) {
            (None, AggregateKind::Count) => {
                w.write_byte(MAIN_SLOT);
                w.write_byte(0);
                w.write_u32(0);
                w.write_u16(0);
                Vec::new()
            }
            (None, _) => return Err(QueryBuildError::Invalid("aggregate needs a field")),
            (Some(field), kind) => {
                let (_, prop) = lookup(layout, field)?;
                let ok = match kind {
                    AggregateKind::Count => true,
                    AggregateKind::Sum
                    | AggregateKind::Avg
                    | AggregateKind::Min
                    | AggregateKind::Max => prop.is_main() && prop.prop_type.is_numeric(),
                    AggregateKind::Cardinality => {
                        prop.is_main()
                            || matches!(
                                prop.prop_type,
                                PropType::Cardinality | PropType::String | PropType::Alias
                            )
                    }
                };
                if !ok {
                    return Err(unsupported(prop, kind.name()));
                }
                field_header(w, prop);
                prop.path.clone()
            }
        };
        w.write_u16(result as u16);
        items.push(AggregateItem {
            kind: agg.kind,
            path,
        });
    }
    Ok(AggregatePlan { items, group })
}
