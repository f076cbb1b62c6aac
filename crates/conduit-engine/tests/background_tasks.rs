//! Background dispatch through the task tracker.

mod common;

use std::time::Duration;

use common::{engine, id, settings};
use conduit_engine::{ChainOptions, PluginExecutionEngine, unit_tool_name};
use conduit_plugins::ExecutionContext;
use conduit_tasks::{TaskConfig, TaskStatus};
use conduit_test::{MockTool, MockUnit};
use serde_json::{Map, json};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_dispatched_unit_completes_with_its_output() {
    let engine = engine();
    let unit = MockUnit::background("summarize").returning(json!({"summary": "short"}));
    engine.register_unit(unit.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!("long text")).with_user("u1");
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    let task_id = outcome.task_for(&id("summarize")).unwrap();

    let task = engine.tracker().await_completion(task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!({"summary": "short"})));
    assert_eq!(task.tool_name, unit_tool_name(&id("summarize")));
    assert!(task.started_at.is_some());
    assert!(task.completed_at >= task.started_at);

    // The unit saw the context as it was at dispatch time.
    assert_eq!(unit.calls()[0].input, json!("long text"));
}

#[tokio::test]
async fn test_background_units_see_inline_changes() {
    let engine = engine();
    engine
        .register_unit(
            MockUnit::preprocessor("tag")
                .writes_chain_state("tagged", json!(true))
                .shared(),
        )
        .await
        .unwrap();
    let background = MockUnit::background("after");
    engine.register_unit(background.shared()).await.unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    let task_id = outcome.task_for(&id("after")).unwrap();
    engine.tracker().await_completion(task_id, WAIT).await.unwrap();

    assert_eq!(background.calls()[0].chain_state.get("tagged"), Some(&json!(true)));
}

#[tokio::test]
async fn test_tasks_of_one_run_share_the_request_correlation() {
    let engine = engine();
    engine
        .register_unit(MockUnit::background("one").shared())
        .await
        .unwrap();
    engine
        .register_unit(MockUnit::background("two").shared())
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    assert_eq!(outcome.async_tasks.len(), 2);

    let correlation = ctx.request_id.to_string();
    let finished = engine
        .tracker()
        .await_correlation(&correlation, WAIT)
        .await
        .unwrap();
    assert_eq!(finished.len(), 2);
    assert!(finished.iter().all(|t| t.status == TaskStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_slow_background_unit_times_out() {
    let engine = PluginExecutionEngine::builder()
        .with_settings(settings())
        .with_task_default_timeout(Some(Duration::from_millis(50)))
        .build();
    engine
        .register_unit(MockUnit::background("slow").hanging().shared())
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    let task_id = outcome.task_for(&id("slow")).unwrap();

    let task = engine.tracker().await_completion(task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::TimedOut);
    assert!(task.error.is_some());
    assert_eq!(task.timeout_ms, Some(50));
}

#[tokio::test]
async fn test_background_failure_fails_the_task_only() {
    let engine = engine();
    engine
        .register_unit(MockUnit::background("bad").failing("exploded").shared())
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    assert!(outcome.overall_success);

    let task_id = outcome.task_for(&id("bad")).unwrap();
    let task = engine.tracker().await_completion(task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("exploded"));
}

#[tokio::test]
async fn test_sweep_removes_only_finished_tasks() {
    let engine = engine();
    engine
        .register_unit(MockUnit::background("quick").shared())
        .await
        .unwrap();
    engine
        .register_unit(MockUnit::background("stuck").hanging().shared())
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    let quick = outcome.task_for(&id("quick")).unwrap();
    let stuck = outcome.task_for(&id("stuck")).unwrap();
    engine.tracker().await_completion(quick, WAIT).await.unwrap();

    assert_eq!(engine.tracker().sweep(Duration::ZERO), 1);
    assert!(engine.tracker().status(quick).is_none());
    assert!(engine.tracker().status(stuck).is_some());
    assert_eq!(engine.stats().pending_async_tasks, 1);

    let report = engine.shutdown(Duration::from_millis(20)).await;
    assert_eq!(report.tasks.cancelled, 1);
}

#[tokio::test]
async fn test_cancel_marks_running_task_failed() {
    let engine = engine();
    engine
        .register_unit(MockUnit::background("stuck").hanging().shared())
        .await
        .unwrap();

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    let task_id = outcome.task_for(&id("stuck")).unwrap();

    assert!(engine.tracker().cancel(task_id));
    assert!(!engine.tracker().cancel(task_id));
    let task = engine.tracker().status(task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_unit_registered_on_the_registry_is_still_dispatched() {
    let engine = engine();
    let unit = MockUnit::background("direct").returning(json!("done"));
    engine.registry().register(unit.shared()).await.unwrap();
    let tool = unit_tool_name(&id("direct"));
    assert!(!engine.tracker().tools().contains(&tool));

    let mut ctx = ExecutionContext::new(json!(null));
    let outcome = engine.run_chain(&mut ctx, ChainOptions::default()).await.unwrap();
    assert!(outcome.skip_reason(&id("direct")).is_none());
    assert!(engine.tracker().tools().contains(&tool));

    let task_id = outcome.task_for(&id("direct")).unwrap();
    let task = engine.tracker().await_completion(task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result, Some(json!("done")));
    assert_eq!(unit.call_count(), 1);
}

#[tokio::test]
async fn test_unregister_removes_dispatch_tool() {
    let engine = engine();
    engine
        .register_unit(MockUnit::background("temp").shared())
        .await
        .unwrap();
    let tool = unit_tool_name(&id("temp"));
    assert!(engine.tracker().tools().contains(&tool));

    assert!(engine.unregister_unit(&id("temp")).await);
    assert!(!engine.tracker().tools().contains(&tool));
    assert!(!engine.unregister_unit(&id("temp")).await);
}

#[tokio::test]
async fn test_custom_tools_run_beside_units() {
    let engine = engine();
    let tool = MockTool::new("lookup").returning(json!({"found": true}));
    engine.tracker().tools().register(tool.shared()).unwrap();

    let task_id = engine
        .tracker()
        .call_async(
            "lookup",
            json!({"q": "rust"}),
            Map::new(),
            TaskConfig::default().with_correlation_id("req-1"),
        )
        .unwrap();
    let task = engine.tracker().await_completion(task_id, WAIT).await.unwrap();

    assert_eq!(task.result, Some(json!({"found": true})));
    assert_eq!(tool.calls(), [json!({"q": "rust"})]);
    assert_eq!(engine.tracker().tasks_by_correlation("req-1").len(), 1);
}
