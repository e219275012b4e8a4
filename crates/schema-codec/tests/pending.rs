//! Pending ids across batches: forward references, acknowledgment order,
//! failures and buffer overflow.

use std::sync::Arc;

use schema_codec::{
    compile, Engine, MemoryEngine, Modifier, ModifyError, ModifyOptions, PendingResolutionError,
    PendingStatus, PropDecl, Query, Record, SchemaDecl, SchemaLayout, SchemaOptions, TypeDecl,
    Value,
};

fn schema() -> Arc<SchemaLayout> {
    let decl = SchemaDecl::new().type_decl(
        "step",
        TypeDecl::new()
            .prop("name", PropDecl::string())
            .prop("prev", PropDecl::reference("step")),
    );
    Arc::new(compile(&decl, &SchemaOptions::default()).unwrap())
}

#[test]
fn test_forward_chain_with_reversed_acks() {
    let schema = schema();
    let mut engine = MemoryEngine::new(Arc::clone(&schema));
    let mut modifier = Modifier::new(Arc::clone(&schema), ModifyOptions::default()).unwrap();

    // Each create lands in its own batch, so every `prev` is deferred.
    let mut ids = Vec::new();
    let mut batches = Vec::new();
    for i in 0..12 {
        let mut record = Record::new().with("name", format!("s{}", i));
        if let Some(&prev) = ids.last() {
            record.insert("prev", prev);
        }
        ids.push(modifier.create("step", &record).unwrap());
        batches.extend(modifier.drain());
    }
    assert_eq!(batches.len(), 12);
    assert!(modifier.outstanding() > 0);

    let results: Vec<_> = batches
        .iter()
        .map(|batch| (batch.seq, engine.apply(&batch.bytes)))
        .collect();
    for (seq, result) in results.into_iter().rev() {
        modifier.acknowledge(seq, result).unwrap();
    }
    modifier.flush_with(&mut engine).unwrap();
    assert_eq!(modifier.outstanding(), 0);

    for (i, pair) in ids.windows(2).enumerate() {
        let node = modifier.resolve(pair[1]).unwrap().unwrap();
        let compiled = Query::node("step", node)
            .include("prev.name")
            .compile(&schema)
            .unwrap();
        let record = compiled
            .decode(&engine.query(compiled.bytes()).unwrap())
            .unwrap()
            .into_records()
            .unwrap()
            .remove(0);
        assert_eq!(
            record.get_path("prev.name"),
            Some(&Value::String(format!("s{}", i)))
        );
    }
}

#[test]
fn test_failed_batch_fails_dependents() {
    let schema = schema();
    let mut engine = MemoryEngine::new(Arc::clone(&schema));
    let mut modifier = Modifier::new(Arc::clone(&schema), ModifyOptions::default()).unwrap();

    let first = modifier
        .create("step", &Record::new().with("name", "first"))
        .unwrap();
    let first_batch = modifier.drain().remove(0);
    let second = modifier
        .create("step", &Record::new().with("name", "second").with("prev", first))
        .unwrap();
    let second_batch = modifier.drain().remove(0);
    assert_eq!(
        modifier.status(first).unwrap(),
        PendingStatus::InFlight {
            seq: first_batch.seq
        }
    );

    engine.fail_next("disk full");
    let result = engine.apply(&first_batch.bytes);
    assert!(result.is_err());
    modifier.acknowledge(first_batch.seq, result).unwrap();

    let second_result = engine.apply(&second_batch.bytes);
    modifier
        .acknowledge(second_batch.seq, second_result)
        .unwrap();

    match modifier.status(first).unwrap() {
        PendingStatus::Failed(PendingResolutionError::Engine { seq, error }) => {
            assert_eq!(seq, first_batch.seq);
            assert_eq!(error.message, "disk full");
        }
        other => panic!("unexpected status {:?}", other),
    }
    match modifier.resolve(second) {
        Err(ModifyError::Pending(PendingResolutionError::Dependency { dependency, .. })) => {
            assert_eq!(dependency, first);
        }
        other => panic!("unexpected resolution {:?}", other),
    }
    assert_eq!(engine.count("step"), 1);
}

#[test]
fn test_overflow_splits_into_batches() {
    let schema = schema();
    let mut engine = MemoryEngine::new(Arc::clone(&schema));
    let options = ModifyOptions {
        max_buffer_len: 96,
        ..ModifyOptions::uncompressed()
    };
    let mut modifier = Modifier::new(Arc::clone(&schema), options).unwrap();

    let ids: Vec<_> = (0..40)
        .map(|i| {
            modifier
                .create("step", &Record::new().with("name", format!("node-{}", i)))
                .unwrap()
        })
        .collect();
    assert!(modifier.queued_batches() > 1);
    modifier.flush_with(&mut engine).unwrap();
    assert_eq!(engine.count("step"), 40);
    for id in ids {
        assert!(modifier.resolve(id).unwrap().is_some());
    }

    let err = modifier
        .create("step", &Record::new().with("name", "x".repeat(500)))
        .unwrap_err();
    assert!(matches!(err, ModifyError::RecordTooLarge { .. }));
    assert_eq!(modifier.buffered_len(), 0);
}
