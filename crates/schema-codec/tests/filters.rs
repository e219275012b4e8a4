//! Filter byte-code evaluated by the in-memory engine.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use schema_codec::{
    compile, Engine, Filter, MemoryEngine, Modifier, ModifyOptions, NodeId, Operator, PropDecl,
    Query, Record, RefValue, RefsUpdate, SchemaDecl, SchemaLayout, SchemaOptions, TypeDecl, Value,
};

fn schema() -> Arc<SchemaLayout> {
    let decl = SchemaDecl::new().locale("en").locale("de").type_decl(
        "item",
        TypeDecl::new()
            .prop("a", PropDecl::uint32())
            .prop("b", PropDecl::uint8())
            .prop("c", PropDecl::int16())
            .prop("label", PropDecl::string())
            .prop("code", PropDecl::string().max_bytes(8))
            .prop("title", PropDecl::text())
            .prop("owner", PropDecl::reference("item"))
            .prop("tags", PropDecl::references("item")),
    );
    Arc::new(compile(&decl, &SchemaOptions::default()).unwrap())
}

struct Fixture {
    schema: Arc<SchemaLayout>,
    engine: MemoryEngine,
    ids: Vec<NodeId>,
}

impl Fixture {
    fn new(records: Vec<Record>) -> Self {
        let schema = schema();
        let mut engine = MemoryEngine::new(Arc::clone(&schema));
        let mut modifier = Modifier::new(Arc::clone(&schema), ModifyOptions::default()).unwrap();
        let pending: Vec<_> = records
            .iter()
            .map(|r| modifier.create("item", r).unwrap())
            .collect();
        modifier.flush_with(&mut engine).unwrap();
        let ids = pending
            .into_iter()
            .map(|p| modifier.resolve(p).unwrap().unwrap())
            .collect();
        Self { schema, engine, ids }
    }

    fn matching(&self, filter: Filter) -> BTreeSet<NodeId> {
        let compiled = Query::scan("item")
            .filter(filter)
            .compile(&self.schema)
            .unwrap();
        let result = compiled
            .decode(&self.engine.query(compiled.bytes()).unwrap())
            .unwrap();
        result
            .into_records()
            .unwrap()
            .iter()
            .map(|r| r.get("id").and_then(Value::as_int).unwrap() as NodeId)
            .collect()
    }

    fn select(&self, indexes: &[usize]) -> BTreeSet<NodeId> {
        indexes.iter().map(|&i| self.ids[i]).collect()
    }
}

fn abc(a: u32, b: u32, c: i32) -> Record {
    Record::new().with("a", a).with("b", b).with("c", c)
}

#[test]
fn test_or_with_nested_and() {
    let fixture = Fixture::new(vec![
        abc(1, 0, 0),
        abc(0, 2, 3),
        abc(0, 2, 0),
        abc(0, 0, 3),
        abc(1, 2, 3),
    ]);
    let filter = Filter::eq("a", 1).or(Filter::eq("b", 2).and(Filter::eq("c", 3)));
    assert_eq!(fixture.matching(filter), fixture.select(&[0, 1, 4]));

    let chained = Filter::eq("a", 1)
        .or(Filter::eq("b", 2))
        .or(Filter::eq("c", 3));
    assert_eq!(fixture.matching(chained), fixture.select(&[0, 1, 2, 3, 4]));

    let scoped = Filter::eq("c", 3).and(Filter::eq("a", 1).or(Filter::eq("b", 2)));
    assert_eq!(fixture.matching(scoped), fixture.select(&[1, 4]));
}

#[test]
fn test_comparisons_and_negation() {
    let fixture = Fixture::new(vec![abc(5, 1, -10), abc(10, 2, 0), abc(15, 3, 10)]);
    assert_eq!(
        fixture.matching(Filter::new("a", Operator::Greater, 5)),
        fixture.select(&[1, 2])
    );
    assert_eq!(
        fixture.matching(Filter::new("c", Operator::LessEq, 0)),
        fixture.select(&[0, 1])
    );
    assert_eq!(
        fixture.matching(Filter::between("c", -5, 10)),
        fixture.select(&[1, 2])
    );
    assert_eq!(
        fixture.matching(Filter::new("b", Operator::NotEqual, 2)),
        fixture.select(&[0, 2])
    );
    assert_eq!(
        fixture.matching(Filter::new("id", Operator::Equal, fixture.ids[1])),
        fixture.select(&[1])
    );
}

#[test]
fn test_strings_and_text() {
    let title = |en: &str, de: &str| {
        Value::Text(
            [("en".to_string(), en.to_string()), ("de".to_string(), de.to_string())]
                .into_iter()
                .collect(),
        )
    };
    let fixture = Fixture::new(vec![
        Record::new()
            .with("label", "red apple")
            .with("code", "AB")
            .with("title", title("house", "Haus")),
        Record::new()
            .with("label", "green pear")
            .with("code", "CD")
            .with("title", title("mouse", "Maus")),
        Record::new().with("code", "AB"),
    ]);
    assert_eq!(
        fixture.matching(Filter::new("label", Operator::Includes, "apple")),
        fixture.select(&[0])
    );
    assert_eq!(
        fixture.matching(Filter::any_of("label", ["green pear", "blue plum"])),
        fixture.select(&[1])
    );
    assert_eq!(
        fixture.matching(Filter::eq("code", "AB")),
        fixture.select(&[0, 2])
    );
    assert_eq!(
        fixture.matching(Filter::exists("label")),
        fixture.select(&[0, 1])
    );
    assert_eq!(
        fixture.matching(Filter::new("label", Operator::NotExists, Value::Null)),
        fixture.select(&[2])
    );
    assert_eq!(
        fixture.matching(Filter::new("title", Operator::Includes, "aus")),
        fixture.select(&[0, 1])
    );

    let compiled = Query::scan("item")
        .filter(Filter::eq("title", "Maus"))
        .locale("en")
        .compile(&fixture.schema)
        .unwrap();
    let result = compiled
        .decode(&fixture.engine.query(compiled.bytes()).unwrap())
        .unwrap();
    assert_eq!(result.total, 0);
}

#[test]
fn test_reference_filters() {
    let schema = schema();
    let mut engine = MemoryEngine::new(Arc::clone(&schema));
    let mut modifier = Modifier::new(Arc::clone(&schema), ModifyOptions::default()).unwrap();
    let root = modifier
        .create("item", &Record::new().with("label", "root"))
        .unwrap();
    let other = modifier
        .create("item", &Record::new().with("label", "other"))
        .unwrap();
    let child = modifier
        .create(
            "item",
            &Record::new()
                .with("label", "child")
                .with("owner", root)
                .with("tags", RefsUpdate::set([RefValue::new(other)])),
        )
        .unwrap();
    modifier.flush_with(&mut engine).unwrap();
    let resolve = |p| modifier.resolve(p).unwrap().unwrap();
    let fixture = Fixture {
        ids: vec![resolve(root), resolve(other), resolve(child)],
        schema,
        engine,
    };

    assert_eq!(
        fixture.matching(Filter::eq("owner.label", "root")),
        fixture.select(&[2])
    );
    assert_eq!(
        fixture.matching(Filter::eq("tags.label", "other")),
        fixture.select(&[2])
    );
    assert_eq!(
        fixture.matching(Filter::new("tags", Operator::Includes, fixture.ids[1])),
        fixture.select(&[2])
    );
    assert_eq!(
        fixture.matching(Filter::eq("owner", fixture.ids[0])),
        fixture.select(&[2])
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn batched_equality_matches_membership(
        stored in prop::collection::vec(0u32..64, 1..24),
        wanted in prop::collection::vec(0u32..64, 1..40),
    ) {
        let fixture = Fixture::new(stored.iter().map(|&a| abc(a, a % 8, 0)).collect());
        let expect = |hit: &dyn Fn(u32) -> bool| -> BTreeSet<NodeId> {
            stored
                .iter()
                .enumerate()
                .filter(|&(_, &a)| hit(a))
                .map(|(i, _)| fixture.ids[i])
                .collect()
        };

        // u32 lanes: four values per vector
        let wide = expect(&|a| wanted.contains(&a));
        prop_assert_eq!(fixture.matching(Filter::any_of("a", wanted.clone())), wide);

        // u8 lanes: sixteen values per vector
        let narrow: Vec<u32> = wanted.iter().map(|a| a % 8).collect();
        let expected = expect(&|a| narrow.contains(&(a % 8)));
        prop_assert_eq!(fixture.matching(Filter::any_of("b", narrow.clone())), expected);
    }
}
