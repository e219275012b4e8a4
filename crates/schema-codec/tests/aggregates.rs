//! Aggregate and group-by queries against the in-memory engine.

use std::sync::Arc;

use schema_codec::{
    compile, Aggregate, Engine, Filter, MemoryEngine, Modifier, ModifyOptions, Operator, PropDecl,
    Query, QueryBuildError, Record, SchemaDecl, SchemaLayout, SchemaOptions, TypeDecl, Value,
};

fn setup() -> (Arc<SchemaLayout>, MemoryEngine) {
    let decl = SchemaDecl::new().type_decl(
        "order",
        TypeDecl::new()
            .prop("amount", PropDecl::uint32())
            .prop("price", PropDecl::number())
            .prop("status", PropDecl::enumeration(["open", "paid"]))
            .prop("region", PropDecl::string())
            .prop("visitors", PropDecl::cardinality()),
    );
    let schema = Arc::new(compile(&decl, &SchemaOptions::default()).unwrap());
    let mut engine = MemoryEngine::new(Arc::clone(&schema));
    let mut modifier = Modifier::new(Arc::clone(&schema), ModifyOptions::default()).unwrap();
    let rows = [
        (5u32, 1.5, "open", "north"),
        (15, 2.5, "paid", "north"),
        (25, 3.0, "paid", "south"),
        (35, 4.0, "open", "south"),
        (45, 9.0, "paid", "south"),
    ];
    for (amount, price, status, region) in rows {
        modifier
            .create(
                "order",
                &Record::new()
                    .with("amount", amount)
                    .with("price", price)
                    .with("status", status)
                    .with("region", region),
            )
            .unwrap();
    }
    modifier.flush_with(&mut engine).unwrap();
    (schema, engine)
}

fn run(schema: &Arc<SchemaLayout>, engine: &MemoryEngine, query: Query) -> Record {
    let compiled = query.compile(schema).unwrap();
    assert!(compiled.is_aggregate());
    compiled
        .decode_aggregates(&engine.query(compiled.bytes()).unwrap())
        .unwrap()
}

#[test]
fn test_ungrouped_aggregates() {
    let (schema, engine) = setup();
    let record = run(
        &schema,
        &engine,
        Query::scan("order")
            .aggregate(Aggregate::count())
            .aggregate(Aggregate::sum("amount"))
            .aggregate(Aggregate::avg("price"))
            .aggregate(Aggregate::max("amount"))
            .aggregate(Aggregate::cardinality("region")),
    );
    assert_eq!(record.get("count"), Some(&Value::Int(5)));
    assert_eq!(record.get_path("amount.sum"), Some(&Value::Float(125.0)));
    assert_eq!(record.get_path("price.avg"), Some(&Value::Float(4.0)));
    assert_eq!(record.get_path("amount.max"), Some(&Value::Float(45.0)));
    assert_eq!(record.get_path("region.cardinality"), Some(&Value::Int(2)));
}

#[test]
fn test_filtered_empty_aggregate() {
    let (schema, engine) = setup();
    let record = run(
        &schema,
        &engine,
        Query::scan("order")
            .filter(Filter::new("amount", Operator::Greater, 1000))
            .aggregate(Aggregate::count())
            .aggregate(Aggregate::min("price")),
    );
    assert_eq!(record.get("count"), Some(&Value::Int(0)));
    assert_eq!(record.get_path("price.min"), Some(&Value::Null));
}

#[test]
fn test_group_by_enum_and_string() {
    let (schema, engine) = setup();
    let by_status = run(
        &schema,
        &engine,
        Query::scan("order")
            .aggregate(Aggregate::count())
            .aggregate(Aggregate::sum("amount"))
            .group_by("status"),
    );
    let paid = by_status.get("paid").and_then(Value::as_record).unwrap();
    assert_eq!(paid.get("count"), Some(&Value::Int(3)));
    assert_eq!(paid.get_path("amount.sum"), Some(&Value::Float(85.0)));
    let open = by_status.get("open").and_then(Value::as_record).unwrap();
    assert_eq!(open.get("count"), Some(&Value::Int(2)));

    let by_region = run(
        &schema,
        &engine,
        Query::scan("order")
            .aggregate(Aggregate::count())
            .group_by("region"),
    );
    let south = by_region.get("south").and_then(Value::as_record).unwrap();
    assert_eq!(south.get("count"), Some(&Value::Int(3)));
}

#[test]
fn test_group_by_bucket() {
    let (schema, engine) = setup();
    let record = run(
        &schema,
        &engine,
        Query::scan("order")
            .aggregate(Aggregate::count())
            .group_by_bucket("amount", 20),
    );
    let count = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_record)
            .and_then(|r| r.get("count"))
            .cloned()
    };
    assert_eq!(count("0"), Some(Value::Int(2)));
    assert_eq!(count("20"), Some(Value::Int(2)));
    assert_eq!(count("40"), Some(Value::Int(1)));
    assert_eq!(record.len(), 3);
}

#[test]
fn test_aggregate_needs_scan() {
    let (schema, _) = setup();
    let err = Query::node("order", 1)
        .aggregate(Aggregate::count())
        .compile(&schema)
        .unwrap_err();
    assert_eq!(err, QueryBuildError::Invalid("aggregates need a scan query"));
}

#[test]
fn test_decoders_follow_the_compiled_query() {
    let (schema, engine) = setup();
    let aggregate = Query::scan("order")
        .aggregate(Aggregate::count())
        .compile(&schema)
        .unwrap();
    let bytes = engine.query(aggregate.bytes()).unwrap();
    assert!(aggregate.decode(&bytes).is_err());
    let record = aggregate.decode_aggregates(&bytes).unwrap();
    assert_eq!(record.get("count"), Some(&Value::Int(5)));

    let records = Query::scan("order").compile(&schema).unwrap();
    assert!(!records.is_aggregate());
    let bytes = engine.query(records.bytes()).unwrap();
    assert!(records.decode_aggregates(&bytes).is_err());
    assert_eq!(records.decode(&bytes).unwrap().total, 5);
}
