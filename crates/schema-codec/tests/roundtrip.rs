//! Write then read through the in-memory engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use schema_codec::{
    compile, Engine, MemoryEngine, Modifier, ModifyOptions, NodeId, NodeRef, PendingId, PropDecl,
    Query, Record, RefValue, RefsUpdate, SchemaDecl, SchemaLayout, SchemaOptions, SubQuery,
    TypeDecl, Value,
};

fn schema() -> Arc<SchemaLayout> {
    let decl = SchemaDecl::new()
        .locale("en")
        .locale_with_fallback("nl", ["en"])
        .type_decl(
            "user",
            TypeDecl::new()
                .prop("name", PropDecl::string())
                .prop("age", PropDecl::uint8())
                .prop("score", PropDecl::int32())
                .prop("rating", PropDecl::number())
                .prop("active", PropDecl::boolean())
                .prop("tier", PropDecl::enumeration(["free", "pro"]))
                .prop("bio", PropDecl::text())
                .prop("avatar", PropDecl::binary())
                .prop("bestFriend", PropDecl::reference("user"))
                .prop(
                    "friends",
                    PropDecl::references("user").edge("since", PropDecl::uint16()),
                )
                .prop(
                    "address",
                    PropDecl::object(vec![
                        ("city".to_string(), PropDecl::string()),
                        ("zip".to_string(), PropDecl::uint32()),
                    ]),
                ),
        );
    Arc::new(compile(&decl, &SchemaOptions::default()).unwrap())
}

fn setup() -> (Arc<SchemaLayout>, MemoryEngine, Modifier) {
    let schema = schema();
    let engine = MemoryEngine::new(Arc::clone(&schema));
    let modifier = Modifier::new(Arc::clone(&schema), ModifyOptions::default()).unwrap();
    (schema, engine, modifier)
}

fn resolve(modifier: &Modifier, id: PendingId) -> NodeId {
    modifier.resolve(id).unwrap().unwrap()
}

fn read(engine: &MemoryEngine, schema: &Arc<SchemaLayout>, query: Query) -> Vec<Record> {
    let compiled = query.compile(schema).unwrap();
    let bytes = engine.query(compiled.bytes()).unwrap();
    compiled.decode(&bytes).unwrap().into_records().unwrap()
}

#[test]
fn test_best_friend_scenario() {
    let (schema, mut engine, mut modifier) = setup();
    let ann = modifier
        .create("user", &Record::new().with("name", "ann"))
        .unwrap();
    let bo = modifier
        .create(
            "user",
            &Record::new()
                .with("name", "bo")
                .with("age", 28)
                .with("bestFriend", ann),
        )
        .unwrap();
    modifier.flush_with(&mut engine).unwrap();

    let records = read(
        &engine,
        &schema,
        Query::node("user", resolve(&modifier, bo))
            .include("name")
            .include("age")
            .include("bestFriend.name"),
    );
    assert_eq!(records.len(), 1);
    let bo = &records[0];
    assert_eq!(bo.get("name"), Some(&Value::String("bo".into())));
    assert_eq!(bo.get("age"), Some(&Value::Int(28)));
    assert_eq!(
        bo.get_path("bestFriend.name"),
        Some(&Value::String("ann".into()))
    );
    assert_eq!(
        bo.get_path("bestFriend.id"),
        Some(&Value::Int(resolve(&modifier, ann) as i64))
    );
}

#[test]
fn test_every_property_kind_roundtrips() {
    let (schema, mut engine, mut modifier) = setup();
    let bio: BTreeMap<String, String> = [
        ("en".to_string(), "hello".to_string()),
        ("nl".to_string(), "hallo".to_string()),
    ]
    .into_iter()
    .collect();
    let id = modifier
        .create(
            "user",
            &Record::new()
                .with("name", "cy")
                .with("age", 41)
                .with("score", -1200)
                .with("rating", 4.5)
                .with("active", true)
                .with("tier", "pro")
                .with("bio", Value::Text(bio.clone()))
                .with("avatar", vec![0u8, 1, 2, 255])
                .with(
                    "address",
                    Record::new().with("city", "Utrecht").with("zip", 3511u32),
                ),
        )
        .unwrap();
    modifier.flush_with(&mut engine).unwrap();

    let records = read(
        &engine,
        &schema,
        Query::node("user", resolve(&modifier, id)).include("*"),
    );
    let user = &records[0];
    assert_eq!(user.get("name"), Some(&Value::String("cy".into())));
    assert_eq!(user.get("age"), Some(&Value::Int(41)));
    assert_eq!(user.get("score"), Some(&Value::Int(-1200)));
    assert_eq!(user.get("rating"), Some(&Value::Float(4.5)));
    assert_eq!(user.get("active"), Some(&Value::Bool(true)));
    assert_eq!(user.get("tier"), Some(&Value::String("pro".into())));
    assert_eq!(user.get("bio"), Some(&Value::Text(bio)));
    assert_eq!(user.get("avatar"), Some(&Value::Binary(vec![0, 1, 2, 255])));
    assert_eq!(
        user.get_path("address.city"),
        Some(&Value::String("Utrecht".into()))
    );
    assert_eq!(user.get_path("address.zip"), Some(&Value::Int(3511)));
}

#[test]
fn test_requested_locale_falls_back() {
    let (schema, mut engine, mut modifier) = setup();
    let en_only: BTreeMap<String, String> =
        [("en".to_string(), "hello".to_string())].into_iter().collect();
    let id = modifier
        .create("user", &Record::new().with("bio", Value::Text(en_only)))
        .unwrap();
    modifier.flush_with(&mut engine).unwrap();
    let id = resolve(&modifier, id);

    let records = read(
        &engine,
        &schema,
        Query::node("user", id).include("bio").locale("nl"),
    );
    assert_eq!(records[0].get("bio"), Some(&Value::String("hello".into())));
}

#[test]
fn test_update_increment_and_delete() {
    let (schema, mut engine, mut modifier) = setup();
    let id = modifier
        .create("user", &Record::new().with("name", "dee").with("age", 250))
        .unwrap();
    modifier.flush_with(&mut engine).unwrap();
    let id = resolve(&modifier, id);

    modifier.increment("user", id, "age", 10).unwrap();
    modifier.decrement("user", id, "score", 5).unwrap();
    modifier
        .update("user", id, &Record::new().with("name", Value::Null))
        .unwrap();
    modifier.flush_with(&mut engine).unwrap();

    let records = read(
        &engine,
        &schema,
        Query::node("user", id).include("name").include("age").include("score"),
    );
    assert_eq!(records[0].get("name"), Some(&Value::Null));
    assert_eq!(records[0].get("age"), Some(&Value::Int(255)));
    assert_eq!(records[0].get("score"), Some(&Value::Int(-5)));

    modifier.delete("user", id).unwrap();
    modifier.flush_with(&mut engine).unwrap();
    assert!(!engine.contains("user", id));
    assert!(read(&engine, &schema, Query::node("user", id)).is_empty());
}

#[test]
fn test_reference_collections_edges_and_counts() {
    let (schema, mut engine, mut modifier) = setup();
    let a = modifier.create("user", &Record::new().with("name", "a")).unwrap();
    let b = modifier.create("user", &Record::new().with("name", "b")).unwrap();
    let c = modifier
        .create(
            "user",
            &Record::new().with("name", "c").with(
                "friends",
                RefsUpdate::set([
                    RefValue::with_edges(a, Record::new().with("since", 2019)),
                    RefValue::new(b),
                ]),
            ),
        )
        .unwrap();
    modifier.flush_with(&mut engine).unwrap();
    let (a, b, c) = (
        resolve(&modifier, a),
        resolve(&modifier, b),
        resolve(&modifier, c),
    );

    let records = read(
        &engine,
        &schema,
        Query::node("user", c)
            .include_with(
                "friends",
                SubQuery::new().include("name").include("$since"),
            )
            .include_count("friends"),
    );
    let c_record = &records[0];
    assert_eq!(c_record.get("count(friends)"), Some(&Value::Int(2)));
    let Some(Value::List(friends)) = c_record.get("friends") else {
        panic!("friends missing: {:?}", c_record);
    };
    assert_eq!(friends.len(), 2);
    let first = friends[0].as_record().unwrap();
    assert_eq!(first.get("id"), Some(&Value::Int(a as i64)));
    assert_eq!(first.get("$since"), Some(&Value::Int(2019)));
    let second = friends[1].as_record().unwrap();
    assert_eq!(second.get("id"), Some(&Value::Int(b as i64)));
    assert_eq!(second.get("$since"), Some(&Value::Null));

    modifier
        .update(
            "user",
            c,
            &Record::new().with("friends", RefsUpdate::delete([NodeRef::Id(a)])),
        )
        .unwrap();
    modifier.flush_with(&mut engine).unwrap();
    let records = read(&engine, &schema, Query::node("user", c).include_count("friends"));
    assert_eq!(records[0].get("count(friends)"), Some(&Value::Int(1)));
}

#[test]
fn test_scan_sort_and_range() {
    let (schema, mut engine, mut modifier) = setup();
    for (name, age) in [("e", 30), ("f", 10), ("g", 20), ("h", 40)] {
        modifier
            .create("user", &Record::new().with("name", name).with("age", age))
            .unwrap();
    }
    modifier.flush_with(&mut engine).unwrap();

    let compiled = Query::scan("user")
        .include("name")
        .sort("age", schema_codec::Order::Desc)
        .range(1, 2)
        .compile(&schema)
        .unwrap();
    let result = compiled
        .decode(&engine.query(compiled.bytes()).unwrap())
        .unwrap();
    assert_eq!(result.total, 4);
    let names: Vec<_> = result
        .into_records()
        .unwrap()
        .iter()
        .map(|r| r.get("name").cloned())
        .collect();
    assert_eq!(
        names,
        vec![Some(Value::String("e".into())), Some(Value::String("g".into()))]
    );
}

#[test]
fn test_layout_ignores_declaration_order() {
    let forward = SchemaDecl::new().type_decl(
        "item",
        TypeDecl::new()
            .prop("a", PropDecl::uint8())
            .prop("b", PropDecl::uint32())
            .prop("c", PropDecl::string()),
    );
    let backward = SchemaDecl::new().type_decl(
        "item",
        TypeDecl::new()
            .prop("c", PropDecl::string())
            .prop("b", PropDecl::uint32())
            .prop("a", PropDecl::uint8()),
    );
    let options = SchemaOptions::default();
    let forward = compile(&forward, &options).unwrap();
    let backward = compile(&backward, &options).unwrap();
    assert_eq!(forward.hash(), backward.hash());
    let (f, b) = (
        forward.type_by_name("item").unwrap(),
        backward.type_by_name("item").unwrap(),
    );
    for name in ["a", "b", "c"] {
        assert_eq!(f.prop(name).unwrap().location, b.prop(name).unwrap().location);
    }
}

fn user_decl() -> TypeDecl {
    TypeDecl::new()
        .prop("name", PropDecl::string())
        .prop("nick", PropDecl::alias())
        .prop("bio", PropDecl::text())
        .prop("motto", PropDecl::text().default_value("hi"))
        .prop("handle", PropDecl::string().default_value("anon"))
        .prop("age", PropDecl::uint8())
        .prop("score", PropDecl::int32())
        .prop("rating", PropDecl::number())
        .prop("code", PropDecl::string().max_bytes(6))
        .prop("avatar", PropDecl::binary())
        .prop("embedding", PropDecl::colvec(4))
        .prop("best", PropDecl::reference("user"))
        .prop(
            "friends",
            PropDecl::references("user")
                .edge("since", PropDecl::uint16())
                .edge("note", PropDecl::string())
                .edge("weight", PropDecl::number()),
        )
        .prop(
            "address",
            PropDecl::object(vec![
                ("city".to_string(), PropDecl::string()),
                ("zip".to_string(), PropDecl::uint32()),
            ]),
        )
}

fn post_decl() -> TypeDecl {
    TypeDecl::new()
        .prop("title", PropDecl::string())
        .prop("views", PropDecl::uint32())
        .prop("author", PropDecl::reference("user").inverse("posts"))
}

fn reversed(decl: TypeDecl) -> TypeDecl {
    TypeDecl {
        props: decl.props.into_iter().rev().collect(),
    }
}

fn assert_same_layout(left: &schema_codec::TypeLayout, right: &schema_codec::TypeLayout) {
    assert_eq!(left.id, right.id);
    assert_eq!(left.main_len, right.main_len);
    assert_eq!(left.props.len(), right.props.len());
    for prop in &left.props {
        let other = right.prop(&prop.name).unwrap();
        assert_eq!(prop.location, other.location, "{}", prop.name);
        assert_eq!(prop.prop_type, other.prop_type, "{}", prop.name);
        assert_eq!(prop.len, other.len, "{}", prop.name);
        match (&prop.edges, &other.edges) {
            (Some(a), Some(b)) => assert_same_layout(a, b),
            (None, None) => {}
            _ => panic!("edges differ on {}", prop.name),
        }
    }
}

#[test]
fn test_layout_stable_across_type_and_property_order() {
    let forward = SchemaDecl::new()
        .locale("en")
        .type_decl("post", post_decl())
        .type_decl("user", user_decl());
    let backward = SchemaDecl::new()
        .locale("en")
        .type_decl("user", reversed(user_decl()))
        .type_decl("post", reversed(post_decl()));
    let options = SchemaOptions::default();
    let forward = compile(&forward, &options).unwrap();
    let backward = compile(&backward, &options).unwrap();
    assert_eq!(forward.hash(), backward.hash());

    for name in ["user", "post"] {
        let (f, b) = (
            forward.type_by_name(name).unwrap(),
            backward.type_by_name(name).unwrap(),
        );
        assert_same_layout(f, b);
    }

    let user = forward.type_by_name("user").unwrap();
    for synthesized in ["_user_best", "_user_friends", "posts"] {
        assert!(user.prop(synthesized).is_some(), "{}", synthesized);
    }
    assert!(user.prop("_user_friends").unwrap().edges.is_some());

    // defaulted strings, then defaulted text, then references; aliases and
    // columnar vectors last
    let slot = |name: &str| user.prop(name).unwrap().slot().unwrap();
    assert!(slot("handle") < slot("motto"));
    assert!(slot("motto") < slot("best"));
    assert!(slot("best") < slot("name"));
    assert!(slot("name") < slot("nick"));
    assert!(slot("bio") < slot("embedding"));
}
