//! Context creation and teardown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use conduit_core::{
    ClientConfig, ClientError, ContextGuard, EngineBinding, LifecycleError, ResponseKind,
};
use serde_json::json;

use crate::common::{Emit, ScriptedEngine, context, context_on, runtime};

#[test]
fn destroy_wakes_a_blocked_caller() {
    let rt = runtime();
    let engine = ScriptedEngine::new();
    let ctx = context_on(&engine, &rt);

    let caller = {
        let ctx = ctx.clone();
        std::thread::spawn(move || ctx.call_sync("net.wait_for_collection", &json!({})))
    };
    engine.wait_for_calls("net.wait_for_collection", 1, Duration::from_secs(5));

    ctx.destroy().unwrap();

    let err = caller.join().unwrap().unwrap_err();
    assert!(matches!(
        err,
        ClientError::Lifecycle(LifecycleError::ContextDestroyed(id)) if id == ctx.id()
    ));
}

#[tokio::test]
async fn contexts_are_isolated() -> anyhow::Result<()> {
    let engine = ScriptedEngine::new();
    engine.on("client.version", |_| {
        vec![Emit::success(json!({ "version": "1.0.0" })).finished()]
    });
    let first = context(&engine);
    let second = context(&engine);
    assert_ne!(first.id(), second.id());

    first.destroy()?;

    let version = second
        .call("client.version", &json!({}))
        .await
        .context("second context should still answer")?;
    assert_eq!(version["version"], "1.0.0");
    assert!(first.call("client.version", &json!({})).await.is_err());
    assert_eq!(engine.destroyed_contexts(), vec![first.id()]);
    Ok(())
}

#[tokio::test]
async fn guard_scopes_the_context() {
    let engine = ScriptedEngine::new();
    {
        let ctx = ContextGuard::new(context(&engine));
        let pending = ctx.call_async("net.query", &json!({})).unwrap();
        assert_eq!(ctx.correlator().outstanding(), 1);
        drop(pending);
    }
    assert_eq!(engine.live_contexts(), 0);
    assert_eq!(engine.destroyed_contexts().len(), 1);
}

#[tokio::test]
async fn config_file_drives_creation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("conduit.toml");
    std::fs::write(
        &path,
        "[engine]\nreject = true\n\n[workers]\nmax_concurrent_handlers = 1\n",
    )?;
    let config = ClientConfig::load(&path)?;
    let engine = ScriptedEngine::new();

    let err = conduit_core::Context::create(Arc::clone(&engine) as Arc<dyn EngineBinding>, &config)
        .unwrap_err();

    assert!(matches!(err, ClientError::Boundary(_)));
    assert_eq!(engine.live_contexts(), 0);
    Ok(())
}

#[tokio::test]
async fn destroyed_context_drops_engine_events() {
    let engine = ScriptedEngine::new();
    let ctx = context(&engine);
    let pending = ctx.call_async("net.query", &json!({})).unwrap();
    let id = pending.id();
    ctx.destroy().unwrap();

    // Engine still holding on to the old handler must not resurrect anything.
    ctx.correlator()
        .on_event(conduit_core::ResponseEvent::new(
            id,
            ResponseKind::Success,
            conduit_core::Payload::Json(json!({})),
            true,
        ));

    assert_eq!(ctx.correlator().outstanding(), 0);
    assert!(pending.result().await.unwrap_err().is_lifecycle());
}
