//! Read path: query descriptors for the engine.
//!
//! A [`Query`] names a type, a target (one id, several ids, or a scan), and
//! optionally a filter, includes, sort, range and aggregates. Compiling it
//! against a schema produces the engine bytes together with the plan the
//! decoder needs to read the answer.

pub mod aggregate;
pub mod filter;
pub mod include;

use std::sync::Arc;

use tracing::debug;

use crate::codec::ops::query as op;
use crate::codec::primitives::Writer;
use crate::decode::{decode_aggregates, decode_result, QueryResult};
use crate::error::{DecodeError, QueryBuildError};
use crate::limits::{ID_SLOT, MAIN_SLOT};
use crate::model::{NodeId, Record};
use crate::schema::{PropType, SchemaLayout, TypeLayout, NO_LOCALE};

use aggregate::{write_aggregates, AggregatePlan};
use filter::{terms, write_block, Scope};
use include::{LayoutRef, PlanBuilder};

pub use aggregate::{Aggregate, AggregateKind, GroupBy};
pub use filter::{compile_filter, Filter, Operator};
pub use include::ReadPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub field: String,
    pub order: Order,
}

/// One include path, with an optional nested query for the reference it
/// ends at.
#[derive(Debug, Clone, PartialEq)]
pub struct Include {
    pub(crate) path: String,
    pub(crate) sub: Option<SubQuery>,
}

/// Filter, sort, range and includes applied to a referenced node set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubQuery {
    pub(crate) includes: Vec<Include>,
    pub(crate) filter: Option<Filter>,
    pub(crate) sort: Option<Sort>,
    pub(crate) range: Option<(u32, u32)>,
}

impl SubQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.includes.push(Include {
            path: path.into(),
            sub: None,
        });
        self
    }

    pub fn include_with(mut self, path: impl Into<String>, sub: SubQuery) -> Self {
        self.includes.push(Include {
            path: path.into(),
            sub: Some(sub),
        });
        self
    }

    /// Adds a filter; repeated calls are combined with AND.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(filter),
            None => filter,
        });
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: Order) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            order,
        });
        self
    }

    pub fn range(mut self, offset: u32, limit: u32) -> Self {
        self.range = Some((offset, limit));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Id(NodeId),
    Ids(Vec<NodeId>),
    Scan,
}

/// A query under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    type_name: String,
    target: Target,
    body: SubQuery,
    counts: Vec<String>,
    locale: Option<String>,
    aggregates: Vec<Aggregate>,
    group: Option<GroupBy>,
}

impl Query {
    fn with_target(type_name: impl Into<String>, target: Target) -> Self {
        Self {
            type_name: type_name.into(),
            target,
            body: SubQuery::default(),
            counts: Vec::new(),
            locale: None,
            aggregates: Vec::new(),
            group: None,
        }
    }

    /// Reads one node by id.
    pub fn node(type_name: impl Into<String>, id: NodeId) -> Self {
        Self::with_target(type_name, Target::Id(id))
    }

    /// Reads several nodes by id, in the given order.
    pub fn nodes(type_name: impl Into<String>, ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self::with_target(type_name, Target::Ids(ids.into_iter().collect()))
    }

    /// Reads every node of a type that passes the filter.
    pub fn scan(type_name: impl Into<String>) -> Self {
        Self::with_target(type_name, Target::Scan)
    }

    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.body = self.body.include(path);
        self
    }

    pub fn include_with(mut self, path: impl Into<String>, sub: SubQuery) -> Self {
        self.body = self.body.include_with(path, sub);
        self
    }

    /// Requests the size of a reference collection, decoded as
    /// `count(<path>)`.
    pub fn include_count(mut self, path: impl Into<String>) -> Self {
        self.counts.push(path.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.body = self.body.filter(filter);
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: Order) -> Self {
        self.body = self.body.sort(field, order);
        self
    }

    pub fn range(mut self, offset: u32, limit: u32) -> Self {
        self.body = self.body.range(offset, limit);
        self
    }

    /// Reads text in one locale (walking its fallbacks) instead of all.
    pub fn locale(mut self, code: impl Into<String>) -> Self {
        self.locale = Some(code.into());
        self
    }

    pub fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregates.push(aggregate);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group = Some(GroupBy {
            field: field.into(),
            bucket: 0,
        });
        self
    }

    /// Groups numeric values into buckets of `width`.
    pub fn group_by_bucket(mut self, field: impl Into<String>, width: u64) -> Self {
        self.group = Some(GroupBy {
            field: field.into(),
            bucket: width,
        });
        self
    }

    fn is_aggregate(&self) -> bool {
        !self.aggregates.is_empty() || self.group.is_some()
    }

    /// Compiles the query into engine bytes.
    pub fn compile(&self, schema: &Arc<SchemaLayout>) -> Result<CompiledQuery, QueryBuildError> {
        let layout = schema
            .type_by_name(&self.type_name)
            .ok_or_else(|| QueryBuildError::UnknownType {
                type_name: self.type_name.clone(),
            })?;
        let requested = match &self.locale {
            Some(code) => Some(locale_of(schema, Some(code))?),
            None => None,
        };
        let locale = requested.unwrap_or(NO_LOCALE);
        let aggregate = self.is_aggregate();

        let mut w = Writer::new();
        match (&self.target, aggregate) {
            (Target::Scan, true) => {
                w.write_byte(op::TARGET_AGGREGATE);
                w.write_u16(layout.id);
                write_range(&mut w, self.body.range);
            }
            (_, true) => return Err(QueryBuildError::Invalid("aggregates need a scan query")),
            (Target::Scan, false) => {
                w.write_byte(op::TARGET_SCAN);
                w.write_u16(layout.id);
                write_range(&mut w, self.body.range);
            }
            (_, false) if self.body.range.is_some() => {
                return Err(QueryBuildError::Invalid("range needs a scan query"));
            }
            (Target::Id(id), false) => {
                w.write_byte(op::TARGET_ID);
                w.write_u16(layout.id);
                w.write_u32(*id);
            }
            (Target::Ids(ids), false) => {
                w.write_byte(op::TARGET_IDS);
                w.write_u16(layout.id);
                w.write_u32(ids.len() as u32);
                for id in ids {
                    w.write_u32(*id);
                }
            }
        }

        write_sort(&mut w, layout, self.body.sort.as_ref(), locale)?;

        let mut filter = Writer::new();
        if let Some(f) = &self.body.filter {
            let scope = Scope {
                schema,
                layout,
                edges: None,
                locale,
            };
            write_block(&mut filter, scope, &terms(f))?;
        }
        w.write_sized(filter.as_bytes());

        let output = if aggregate {
            w.write_u32(0);
            let mut body = Writer::new();
            let plan = write_aggregates(&mut body, layout, &self.aggregates, self.group.as_ref())?;
            w.write_sized(body.as_bytes());
            Output::Aggregates(plan)
        } else {
            let mut builder = PlanBuilder::new(schema, layout, LayoutRef::Type(layout.id), None, requested);
            for include in &self.body.includes {
                builder.add(&split(&include.path), include.sub.as_ref())?;
            }
            for path in &self.counts {
                builder.add_count(&split(path))?;
            }
            let mut body = Writer::new();
            let plan = builder.finish(&mut body)?;
            w.write_sized(body.as_bytes());
            w.write_u32(0);
            Output::Records(plan)
        };

        debug!(
            type_name = %self.type_name,
            len = w.len(),
            aggregate,
            "compiled query"
        );
        Ok(CompiledQuery {
            schema: Arc::clone(schema),
            bytes: w.into_bytes(),
            output,
        })
    }
}

fn split(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Output {
    Records(ReadPlan),
    Aggregates(AggregatePlan),
}

/// Engine bytes of a query plus what is needed to decode its result.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    schema: Arc<SchemaLayout>,
    bytes: Vec<u8>,
    output: Output,
}

impl CompiledQuery {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.output, Output::Aggregates(_))
    }

    /// The read plan of a record query.
    pub fn plan(&self) -> Option<&ReadPlan> {
        match &self.output {
            Output::Records(plan) => Some(plan),
            Output::Aggregates(_) => None,
        }
    }

    /// Decodes the engine's answer to a record query.
    pub fn decode(&self, result: &[u8]) -> Result<QueryResult, DecodeError> {
        match &self.output {
            Output::Records(plan) => decode_result(&self.schema, plan, result),
            Output::Aggregates(_) => Err(DecodeError::MalformedEncoding {
                context: "aggregate result decoded as records",
            }),
        }
    }

    /// Decodes the engine's answer to an aggregate query.
    pub fn decode_aggregates(&self, result: &[u8]) -> Result<Record, DecodeError> {
        match &self.output {
            Output::Aggregates(plan) => decode_aggregates(&self.schema, plan, result),
            Output::Records(_) => Err(DecodeError::MalformedEncoding {
                context: "record result decoded as aggregates",
            }),
        }
    }
}

/// Wire id of an optional locale code; `NO_LOCALE` when absent.
pub(crate) fn locale_of(schema: &SchemaLayout, code: Option<&str>) -> Result<u8, QueryBuildError> {
    match code {
        None => Ok(NO_LOCALE),
        Some(code) => schema
            .locale(code)
            .map(|l| l.id)
            .ok_or_else(|| QueryBuildError::UnknownLocale {
                code: code.to_string(),
            }),
    }
}

/// `[u32 offset][u32 limit]`; no range reads everything.
pub(crate) fn write_range(w: &mut Writer, range: Option<(u32, u32)>) {
    let (offset, limit) = range.unwrap_or((0, u32::MAX));
    w.write_u32(offset);
    w.write_u32(limit);
}

/// `[0]` or `[1][order][slot][type][u32 start][u16 len][locale]`.
pub(crate) fn write_sort(
    w: &mut Writer,
    layout: &TypeLayout,
    sort: Option<&Sort>,
    locale: u8,
) -> Result<(), QueryBuildError> {
    let Some(sort) = sort else {
        w.write_byte(0);
        return Ok(());
    };
    let (slot, prop_type, start, len) = if sort.field == "id" && !layout.is_edge() {
        (ID_SLOT, PropType::Uint32, 0, 4)
    } else {
        let prop = layout
            .prop(&sort.field)
            .ok_or_else(|| QueryBuildError::UnknownField {
                type_name: layout.name.clone(),
                field: sort.field.clone(),
            })?;
        if matches!(
            prop.prop_type,
            PropType::Reference
                | PropType::References
                | PropType::Vector
                | PropType::ColVec
                | PropType::Cardinality
        ) {
            return Err(QueryBuildError::UnsupportedOperator {
                field: prop.name.clone(),
                operator: "sort",
                prop_type: prop.prop_type,
            });
        }
        match prop.offset() {
            Some(offset) => (MAIN_SLOT, prop.prop_type, offset, prop.len as u16),
            None => (prop.slot().unwrap_or(MAIN_SLOT), prop.prop_type, 0, 0),
        }
    };
    w.write_byte(1);
    w.write_byte(match sort.order {
        Order::Asc => op::ORDER_ASC,
        Order::Desc => op::ORDER_DESC,
    });
    w.write_byte(slot);
    w.write_byte(prop_type as u8);
    w.write_u32(start);
    w.write_u16(len);
    w.write_byte(if prop_type == PropType::Text { locale } else { 0 });
    Ok(())
}
