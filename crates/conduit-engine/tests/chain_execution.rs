//! Staged chain execution: ordering, isolation, selection and skipping.

mod common;

use std::time::Duration;

use common::{engine, engine_with, id, settings, unpinned};
use conduit_engine::{ASYNC_TASKS_KEY, ChainOptions, EngineError, EngineSettings, SkipReason};
use conduit_events::EventBus;
use conduit_plugins::{ExecutionContext, HybridMode, PluginStatus, UnitKind};
use conduit_tasks::TaskStatus;
use conduit_test::MockUnit;
use serde_json::json;

#[tokio::test]
async fn test_inline_units_run_by_priority_and_async_units_are_dispatched() {
    let engine = engine();
    let low = MockUnit::sync("low").with_priority(5).returning(json!("low"));
    let high = MockUnit::sync("high").with_priority(10).returning(json!("high"));
    let background = MockUnit::background("bg").returning(json!("later"));
    // Registration order deliberately differs from priority order.
    engine.register_unit(low.shared()).await.unwrap();
    engine.register_unit(high.shared()).await.unwrap();
    engine.register_unit(background.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!("hi"));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    assert!(outcome.overall_success);
    let order: Vec<&str> = outcome.per_unit_results.iter().map(|(u, _)| u.as_str()).collect();
    assert_eq!(order, ["high", "low"]);
    assert_eq!(outcome.async_tasks.len(), 1);

    let task_id = outcome.task_for(&id("bg")).unwrap();
    let task = engine.tracker().status(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.correlation_id, ctx.request_id.to_string());

    assert_eq!(ctx.output, Some(json!({"high": "high", "low": "low"})));
    assert_eq!(
        outcome.metadata[ASYNC_TASKS_KEY],
        json!({"bg": task_id.to_string()})
    );
    assert_eq!(outcome.metadata["requestId"], json!(ctx.request_id.to_string()));
}

#[tokio::test]
async fn test_equal_priority_keeps_registration_order() {
    let engine = engine();
    for name in ["first", "second", "third"] {
        engine
            .register_unit(MockUnit::sync(name).shared())
            .await
            .unwrap();
    }

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    let order: Vec<&str> = outcome.per_unit_results.iter().map(|(u, _)| u.as_str()).collect();
    assert_eq!(order, ["first", "second", "third"]);
}

#[tokio::test]
async fn test_preprocessors_run_before_inline_units_regardless_of_priority() {
    let engine = engine();
    let pre = MockUnit::preprocessor("normalize")
        .writes_chain_state("lang", json!("en"))
        .rewrites_input(json!("normalized"));
    let sync = MockUnit::sync("reply").with_priority(100);
    engine.register_unit(sync.shared()).await.unwrap();
    engine.register_unit(pre.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!("  RAW  "));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    let order: Vec<&str> = outcome.per_unit_results.iter().map(|(u, _)| u.as_str()).collect();
    assert_eq!(order, ["normalize", "reply"]);

    let seen = &sync.calls()[0];
    assert_eq!(seen.input, json!("normalized"));
    assert_eq!(seen.chain_state.get("lang"), Some(&json!("en")));
    assert_eq!(ctx.chain_state.get("lang"), Some(&json!("en")));
}

#[tokio::test]
async fn test_chain_state_writes_are_seen_in_order() {
    let engine = engine();
    let first = MockUnit::preprocessor("a")
        .with_priority(2)
        .writes_chain_state("step", json!(1));
    let second = MockUnit::preprocessor("b")
        .with_priority(1)
        .writes_chain_state("step", json!(2));
    engine.register_unit(first.shared()).await.unwrap();
    engine.register_unit(second.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    assert!(first.calls()[0].chain_state.is_empty());
    assert_eq!(second.calls()[0].chain_state.get("step"), Some(&json!(1)));
    assert_eq!(ctx.chain_state.get("step"), Some(&json!(2)));
}

#[tokio::test]
async fn test_failing_unit_does_not_stop_the_chain() {
    let engine = engine();
    let units = [
        MockUnit::sync("one").with_priority(50).returning(json!(1)),
        MockUnit::sync("two").with_priority(40).returning(json!(2)),
        MockUnit::sync("broken").with_priority(30).failing("bad input"),
        MockUnit::sync("four").with_priority(20).returning(json!(4)),
        MockUnit::sync("five").with_priority(10).returning(json!(5)),
    ];
    for unit in &units {
        engine.register_unit(unit.shared()).await.unwrap();
    }

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    assert!(!outcome.overall_success);
    let order: Vec<_> = outcome
        .per_unit_results
        .iter()
        .map(|(id, _)| id.to_string())
        .collect();
    assert_eq!(order, ["one", "two", "broken", "four", "five"]);

    let broken = outcome.result_for(&id("broken")).unwrap();
    assert!(!broken.success);
    assert!(broken.error.as_deref().unwrap().contains("bad input"));
    for name in ["one", "two", "four", "five"] {
        let result = outcome.result_for(&id(name)).unwrap();
        assert!(result.success, "{name} should have succeeded");
        assert!(result.error.is_none());
    }
    assert!(units.iter().all(|u| u.call_count() == 1));
    assert_eq!(ctx.output, Some(json!({"one": 1, "two": 2, "four": 4, "five": 5})));
}

#[tokio::test(start_paused = true)]
async fn test_panics_and_hangs_become_failures() {
    let engine = engine_with(EngineSettings {
        unit_timeout: Duration::from_millis(100),
        ..settings()
    });
    engine
        .register_unit(MockUnit::sync("panics").with_priority(3).panicking("kaboom").shared())
        .await
        .unwrap();
    engine
        .register_unit(MockUnit::sync("hangs").with_priority(2).hanging().shared())
        .await
        .unwrap();
    engine
        .register_unit(MockUnit::sync("ok").with_priority(1).shared())
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    let panicked = outcome.result_for(&id("panics")).unwrap();
    assert!(panicked.error.as_deref().unwrap().contains("kaboom"));
    let hung = outcome.result_for(&id("hangs")).unwrap();
    assert!(hung.error.as_deref().unwrap().contains("timed out"));
    assert!(outcome.result_for(&id("ok")).unwrap().success);
}

#[tokio::test]
async fn test_failed_unit_changes_are_rolled_back() {
    let engine = engine();
    engine
        .register_unit(
            MockUnit::sync("partial")
                .writes_chain_state("half-done", json!(true))
                .rewrites_input(json!("clobbered"))
                .failing("gave up")
                .shared(),
        )
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!("original"));
    engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    assert_eq!(ctx.input, json!("original"));
    assert!(ctx.chain_state.is_empty());
    assert!(ctx.output.is_none());
}

#[tokio::test]
async fn test_execution_error_pins_status_when_configured() {
    let engine = engine();
    let unit = MockUnit::sync("fragile").failing("nope");
    engine.register_unit(unit.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    assert!(matches!(
        engine.registry().status(&id("fragile")),
        Some(PluginStatus::Error(_))
    ));

    // An errored unit is no longer selected.
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    assert!(outcome.per_unit_results.is_empty());
    assert_eq!(unit.call_count(), 1);
}

#[tokio::test]
async fn test_execution_error_leaves_status_when_unpinned() {
    let engine = engine_with(unpinned());
    let unit = MockUnit::sync("fragile").failing("nope");
    engine.register_unit(unit.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    assert_eq!(engine.registry().status(&id("fragile")), Some(PluginStatus::Active));
    assert_eq!(unit.call_count(), 2);
}

#[tokio::test]
async fn test_fail_fast_skips_the_rest() {
    let engine = engine();
    engine
        .register_unit(MockUnit::sync("first").with_priority(10).failing("stop").shared())
        .await
        .unwrap();
    let second = MockUnit::sync("second");
    let background = MockUnit::background("bg");
    engine.register_unit(second.shared()).await.unwrap();
    engine.register_unit(background.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine
        .run_chain(&mut ctx, ChainOptions::default().fail_fast())
        .await
        .unwrap();

    assert!(!outcome.overall_success);
    assert_eq!(outcome.per_unit_results.len(), 1);
    assert!(outcome.async_tasks.is_empty());
    assert_eq!(outcome.skip_reason(&id("second")), Some(&SkipReason::FailFast));
    assert_eq!(outcome.skip_reason(&id("bg")), Some(&SkipReason::FailFast));
    assert_eq!(second.call_count(), 0);
    assert!(engine.tracker().is_empty());
}

#[tokio::test]
async fn test_units_with_unmet_dependencies_are_skipped() {
    let engine = engine();
    engine
        .register_unit(MockUnit::sync("off").disabled().shared())
        .await
        .unwrap();
    let orphan = MockUnit::sync("orphan").with_dependency("missing");
    let needs_off = MockUnit::sync("needs-off").with_dependency("off");
    let satisfied = MockUnit::sync("satisfied").with_dependency("base");
    engine.register_unit(orphan.shared()).await.unwrap();
    engine.register_unit(needs_off.shared()).await.unwrap();
    engine.register_unit(satisfied.shared()).await.unwrap();
    engine
        .register_unit(MockUnit::sync("base").shared())
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    assert_eq!(
        outcome.skip_reason(&id("orphan")),
        Some(&SkipReason::UnmetDependencies(vec![id("missing")]))
    );
    assert_eq!(
        outcome.skip_reason(&id("needs-off")),
        Some(&SkipReason::UnmetDependencies(vec![id("off")]))
    );
    assert_eq!(orphan.call_count(), 0);
    assert_eq!(needs_off.call_count(), 0);
    assert_eq!(satisfied.call_count(), 1);
    // Skipped units do not count as failures.
    assert!(outcome.overall_success);
}

#[tokio::test]
async fn test_target_kinds_restrict_selection() {
    let engine = engine();
    let pre = MockUnit::preprocessor("pre");
    let sync = MockUnit::sync("sync");
    let background = MockUnit::background("bg");
    engine.register_unit(pre.shared()).await.unwrap();
    engine.register_unit(sync.shared()).await.unwrap();
    engine.register_unit(background.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine
        .run_chain(&mut ctx, ChainOptions::only([UnitKind::Synchronous]))
        .await
        .unwrap();

    assert_eq!(outcome.per_unit_results.len(), 1);
    assert!(outcome.async_tasks.is_empty());
    assert_eq!(pre.call_count(), 0);
    assert_eq!(sync.call_count(), 1);
}

#[tokio::test]
async fn test_empty_target_kinds_is_rejected() {
    let engine = engine();
    let mut ctx = ExecutionContext::new(json!(null));
    let err = engine
        .run_chain(&mut ctx, ChainOptions::only(Vec::<UnitKind>::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTargetKinds));
}

#[tokio::test]
async fn test_services_and_static_units_are_never_executed() {
    let engine = engine();
    let service = MockUnit::service("svc");
    let fixed = MockUnit::new("static", UnitKind::Static);
    let inline = MockUnit::hybrid("hybrid-sync", HybridMode::Sync);
    let deferred = MockUnit::hybrid("hybrid-async", HybridMode::Async);
    for unit in [&service, &fixed, &inline, &deferred] {
        engine.register_unit(unit.shared()).await.unwrap();
    }

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    assert_eq!(service.call_count(), 0);
    assert_eq!(fixed.call_count(), 0);
    assert_eq!(inline.call_count(), 1);
    assert!(outcome.result_for(&id("hybrid-sync")).is_some());
    assert!(outcome.task_for(&id("hybrid-async")).is_some());
    // Services are still brought up.
    assert_eq!(service.lifecycle(), ["init", "start"]);
}

#[tokio::test]
async fn test_chain_completed_event_is_published() {
    let bus = EventBus::new();
    let mut events = bus.subscribe_types(&["chain_completed"]);
    let engine = conduit_engine::PluginExecutionEngine::builder()
        .with_settings(settings())
        .with_events(bus)
        .build();
    engine
        .register_unit(MockUnit::sync("one").shared())
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();

    let received = events.drain();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].metadata().correlation_id.as_deref(),
        Some(ctx.request_id.to_string().as_str())
    );
}
