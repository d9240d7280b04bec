//! Streaming consumption and unsubscribe behavior.

use std::time::Duration;

use conduit_core::{ClientConfig, ClientError, Handle};
use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::common::{Emit, ScriptedEngine, context, context_on, context_with, runtime};

const SUBSCRIBE: &str = "net.subscribe_collection";
const UNSUBSCRIBE: &str = "net.unsubscribe";

fn subscription_with_updates(engine: &ScriptedEngine, updates: u64) {
    engine.on(SUBSCRIBE, move |_| {
        let mut emits = vec![Emit::success(json!({ "handle": 42 }))];
        emits.extend((0..updates).map(|n| Emit::custom(100, json!({ "result": { "seq": n } }))));
        emits.push(Emit::nop().finished());
        emits
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscription_yields_every_update_in_order() {
    let engine = ScriptedEngine::new();
    subscription_with_updates(&engine, 3);
    let ctx = context(&engine);

    let stream = ctx
        .subscribe(SUBSCRIBE, &json!({ "collection": "messages" }), UNSUBSCRIBE)
        .unwrap();
    let items: Vec<Value> = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .unwrap()
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(
        items,
        vec![
            json!({ "handle": 42 }),
            json!({ "result": { "seq": 0 } }),
            json!({ "result": { "seq": 1 } }),
            json!({ "result": { "seq": 2 } }),
        ]
    );
    assert_eq!(ctx.correlator().outstanding(), 0);
    // Finished on its own: nothing to unsubscribe.
    assert!(engine.calls_to(UNSUBSCRIBE).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_subscription_unsubscribes() {
    let engine = ScriptedEngine::new();
    engine.on(SUBSCRIBE, |_| vec![Emit::success(json!({ "handle": 42 }))]);
    let ctx = context(&engine);

    let mut stream = ctx.subscribe(SUBSCRIBE, &json!({}), UNSUBSCRIBE).unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first["handle"], 42);
    assert_eq!(stream.handle(), Some(Handle::new(42)));
    let id = stream.id();

    drop(stream);

    let calls = engine.calls_to(UNSUBSCRIBE);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params, json!({ "handle": 42 }));
    assert!(!ctx.correlator().contains(id));

    // The engine may still be mid-flight; those events go nowhere.
    engine.emit(ctx.id(), id, &Emit::custom(100, json!({ "late": true })));
    assert_eq!(ctx.correlator().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscription_dropped_before_polling_unsubscribes() {
    let engine = ScriptedEngine::new();
    let ctx = context(&engine);

    let stream = ctx.subscribe(SUBSCRIBE, &json!({}), UNSUBSCRIBE).unwrap();
    let id = stream.id();
    engine.emit(ctx.id(), id, &Emit::success(json!({ "handle": 10 })));
    drop(stream);

    let calls = engine.calls_to(UNSUBSCRIBE);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params, json!({ "handle": 10 }));
    assert!(!ctx.correlator().contains(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn explicit_unsubscribe_waits_for_the_engine() {
    let engine = ScriptedEngine::new();
    engine.on(SUBSCRIBE, |_| vec![Emit::success(json!({ "handle": 7 }))]);
    engine.on(UNSUBSCRIBE, |_| vec![Emit::success(json!({})).finished()]);
    let ctx = context(&engine);

    let mut stream = ctx.subscribe(SUBSCRIBE, &json!({}), UNSUBSCRIBE).unwrap();
    stream.next().await.unwrap().unwrap();

    tokio::time::timeout(Duration::from_secs(5), stream.unsubscribe())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(engine.calls_to(UNSUBSCRIBE).len(), 1);
    assert_eq!(ctx.correlator().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribe_on_drop_can_be_disabled() {
    let engine = ScriptedEngine::new();
    engine.on(SUBSCRIBE, |_| vec![Emit::success(json!({ "handle": 9 }))]);
    let config = ClientConfig::from_toml_str("[streams]\nunsubscribe_on_drop = false\n").unwrap();
    let ctx = context_with(&engine, &config);

    let mut stream = ctx.subscribe(SUBSCRIBE, &json!({}), UNSUBSCRIBE).unwrap();
    stream.next().await.unwrap().unwrap();
    drop(stream);

    assert!(engine.calls_to(UNSUBSCRIBE).is_empty());
    assert_eq!(ctx.correlator().outstanding(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_error_ends_the_stream() {
    let engine = ScriptedEngine::new();
    engine.on(SUBSCRIBE, |_| {
        vec![
            Emit::success(json!({ "handle": 3 })),
            Emit::custom(100, json!({ "seq": 0 })),
            Emit::error(601, "subscription broken"),
            Emit::custom(100, json!({ "seq": 1 })),
        ]
    });
    let ctx = context(&engine);

    let items: Vec<Result<Value, ClientError>> = ctx
        .subscribe(SUBSCRIBE, &json!({}), UNSUBSCRIBE)
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 3);
    let err = items[2].as_ref().unwrap_err();
    assert_eq!(err.engine().unwrap().code, 601);
    assert!(engine.calls_to(UNSUBSCRIBE).is_empty());
}

#[test]
fn blocking_iteration_without_async_code() {
    let rt = runtime();
    let engine = ScriptedEngine::new();
    subscription_with_updates(&engine, 2);
    let ctx = context_on(&engine, &rt);

    let items: Vec<Value> = ctx
        .subscribe(SUBSCRIBE, &json!({}), UNSUBSCRIBE)
        .unwrap()
        .blocking()
        .map(Result::unwrap)
        .collect();

    assert_eq!(items.len(), 3);
    assert_eq!(items[2], json!({ "result": { "seq": 1 } }));
}
