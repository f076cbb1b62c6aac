//! Mock units, tools and counter stores.
//!
//! Mocks share their recorded state through `Arc`s, so a test can keep a
//! clone for assertions after handing another clone to the engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use conduit_plugins::{
    ChainState, Contribution, ExecutionContext, HealthStatus, HybridMode, PluginUnit,
    UnitDescriptor, UnitError, UnitId, UnitKind, UnitResult,
};
use conduit_resilience::{CounterStore, MemoryCounterStore, StoreError, WindowCount};
use conduit_tasks::{TaskTool, ToolContext, ToolError, ToolResult};
use serde_json::{Map, Value};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What a mock does when executed.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    /// Succeed with this output.
    Return(Option<Value>),
    /// Fail with an execution error.
    Fail(String),
    /// Panic with this message.
    Panic(String),
    /// Never finish.
    Hang,
    /// Sleep, then succeed with this output.
    Sleep(Duration, Option<Value>),
}

/// What a mock unit saw when it was invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    /// Input at invocation.
    pub input: Value,
    /// Chain state at invocation.
    pub chain_state: ChainState,
}

#[derive(Debug, Default)]
struct UnitState {
    script: Mutex<VecDeque<MockOutcome>>,
    calls: Mutex<Vec<MockCall>>,
    lifecycle: Mutex<Vec<&'static str>>,
    unhealthy: Mutex<Option<String>>,
}

/// Scriptable [`PluginUnit`].
#[derive(Debug, Clone)]
pub struct MockUnit {
    descriptor: UnitDescriptor,
    default: MockOutcome,
    init_error: Option<String>,
    chain_writes: Vec<(String, Value)>,
    input_rewrite: Option<Value>,
    state: Arc<UnitState>,
}

impl MockUnit {
    /// Unit of any kind that returns `null`.
    #[must_use]
    pub fn new(id: &'static str, kind: UnitKind) -> Self {
        Self {
            descriptor: UnitDescriptor::new(UnitId::from_static(id), id, kind),
            default: MockOutcome::Return(None),
            init_error: None,
            chain_writes: Vec::new(),
            input_rewrite: None,
            state: Arc::new(UnitState::default()),
        }
    }

    /// Synchronous unit.
    #[must_use]
    pub fn sync(id: &'static str) -> Self {
        Self::new(id, UnitKind::Synchronous)
    }

    /// Message preprocessor.
    #[must_use]
    pub fn preprocessor(id: &'static str) -> Self {
        Self::new(id, UnitKind::MessagePreprocessor)
    }

    /// Asynchronous unit.
    #[must_use]
    pub fn background(id: &'static str) -> Self {
        Self::new(id, UnitKind::Asynchronous)
    }

    /// Service unit.
    #[must_use]
    pub fn service(id: &'static str) -> Self {
        Self::new(id, UnitKind::Service)
    }

    /// Hybrid service in `mode`.
    #[must_use]
    pub fn hybrid(id: &'static str, mode: HybridMode) -> Self {
        let mut unit = Self::new(id, UnitKind::HybridService);
        unit.descriptor = unit.descriptor.with_hybrid_mode(mode);
        unit
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.descriptor = self.descriptor.with_priority(priority);
        self
    }

    /// Declare a dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: &'static str) -> Self {
        self.descriptor = self.descriptor.with_dependency(UnitId::from_static(id));
        self
    }

    /// Declare a contribution.
    #[must_use]
    pub fn with_contribution(mut self, contribution: Contribution) -> Self {
        self.descriptor = self.descriptor.with_contribution(contribution);
        self
    }

    /// Register disabled.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.descriptor = self.descriptor.disabled();
        self
    }

    /// Succeed with `value` by default.
    #[must_use]
    pub fn returning(mut self, value: Value) -> Self {
        self.default = MockOutcome::Return(Some(value));
        self
    }

    /// Fail with `message` by default.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.default = MockOutcome::Fail(message.into());
        self
    }

    /// Panic by default.
    #[must_use]
    pub fn panicking(mut self, message: impl Into<String>) -> Self {
        self.default = MockOutcome::Panic(message.into());
        self
    }

    /// Never finish by default.
    #[must_use]
    pub fn hanging(mut self) -> Self {
        self.default = MockOutcome::Hang;
        self
    }

    /// Sleep for `delay`, then return `value`, by default.
    #[must_use]
    pub fn sleeping(mut self, delay: Duration, value: Value) -> Self {
        self.default = MockOutcome::Sleep(delay, Some(value));
        self
    }

    /// Queue an outcome used before the default.
    #[must_use]
    pub fn then(self, outcome: MockOutcome) -> Self {
        lock(&self.state.script).push_back(outcome);
        self
    }

    /// Write `key = value` into the chain state on every invocation.
    #[must_use]
    pub fn writes_chain_state(mut self, key: impl Into<String>, value: Value) -> Self {
        self.chain_writes.push((key.into(), value));
        self
    }

    /// Replace the context input on every invocation.
    #[must_use]
    pub fn rewrites_input(mut self, input: Value) -> Self {
        self.input_rewrite = Some(input);
        self
    }

    /// Fail `init` with `message`.
    #[must_use]
    pub fn failing_init(mut self, message: impl Into<String>) -> Self {
        self.init_error = Some(message.into());
        self
    }

    /// Report unhealthy with `message`, or healthy with `None`.
    pub fn set_unhealthy(&self, message: Option<&str>) {
        *lock(&self.state.unhealthy) = message.map(ToString::to_string);
    }

    /// A shared clone, ready for registration.
    #[must_use]
    pub fn shared(&self) -> Arc<dyn PluginUnit> {
        Arc::new(self.clone())
    }

    /// The unit's id.
    #[must_use]
    pub fn id(&self) -> &UnitId {
        &self.descriptor.id
    }

    /// Every invocation so far.
    #[must_use]
    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.state.calls).clone()
    }

    /// Number of invocations.
    #[must_use]
    pub fn call_count(&self) -> usize {
        lock(&self.state.calls).len()
    }

    /// Lifecycle hooks called so far (`init`, `start`, `stop`, `shutdown`,
    /// `reconfigure`).
    #[must_use]
    pub fn lifecycle(&self) -> Vec<&'static str> {
        lock(&self.state.lifecycle).clone()
    }

    fn hook(&self, name: &'static str) {
        lock(&self.state.lifecycle).push(name);
    }

    fn next_outcome(&self) -> MockOutcome {
        lock(&self.state.script)
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl PluginUnit for MockUnit {
    fn descriptor(&self) -> &UnitDescriptor {
        &self.descriptor
    }

    async fn init(&self) -> UnitResult<()> {
        self.hook("init");
        match &self.init_error {
            Some(message) => Err(UnitError::Init(message.clone())),
            None => Ok(()),
        }
    }

    async fn shutdown(&self) -> UnitResult<()> {
        self.hook("shutdown");
        Ok(())
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> UnitResult<Option<Value>> {
        lock(&self.state.calls).push(MockCall {
            input: ctx.input.clone(),
            chain_state: ctx.chain_state.clone(),
        });
        for (key, value) in &self.chain_writes {
            ctx.chain_state.insert(key.clone(), value.clone());
        }
        if let Some(input) = &self.input_rewrite {
            ctx.input = input.clone();
        }

        match self.next_outcome() {
            MockOutcome::Return(value) => Ok(value),
            MockOutcome::Fail(message) => Err(UnitError::Execution(message)),
            MockOutcome::Panic(message) => panic!("{message}"),
            MockOutcome::Hang => {
                std::future::pending::<()>().await;
                Ok(None)
            },
            MockOutcome::Sleep(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            },
        }
    }

    async fn start_service(&self) -> UnitResult<()> {
        self.hook("start");
        Ok(())
    }

    async fn stop_service(&self) -> UnitResult<()> {
        self.hook("stop");
        Ok(())
    }

    async fn health(&self) -> UnitResult<HealthStatus> {
        Ok(match lock(&self.state.unhealthy).as_ref() {
            Some(message) => HealthStatus::unhealthy(message.clone()),
            None => HealthStatus::healthy(),
        })
    }

    async fn reconfigure(&self, _settings: &Map<String, Value>) -> UnitResult<()> {
        self.hook("reconfigure");
        Ok(())
    }
}

/// Scriptable [`TaskTool`].
#[derive(Debug, Clone)]
pub struct MockTool {
    name: String,
    outcome: Result<Value, String>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<Value>>>,
}

impl MockTool {
    /// Tool that echoes its input.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: Ok(Value::Null),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Return `value` instead of the input.
    #[must_use]
    pub fn returning(mut self, value: Value) -> Self {
        self.outcome = Ok(value);
        self
    }

    /// Fail with `message`.
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.outcome = Err(message.into());
        self
    }

    /// Sleep before answering. Honours cancellation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Inputs received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Value> {
        lock(&self.calls).clone()
    }

    /// A shared clone, ready for a tool table.
    #[must_use]
    pub fn shared(&self) -> Arc<dyn TaskTool> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl TaskTool for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "mock tool"
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> ToolResult {
        lock(&self.calls).push(input.clone());
        if let Some(delay) = self.delay {
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = ctx.cancellation.cancelled() => return Err(ToolError::Cancelled),
            }
        }
        match &self.outcome {
            Ok(Value::Null) => Ok(input),
            Ok(value) => Ok(value.clone()),
            Err(message) => Err(ToolError::Execution(message.clone())),
        }
    }
}

/// [`CounterStore`] that can be switched into failure at runtime.
#[derive(Debug, Default)]
pub struct FlakyCounterStore {
    inner: MemoryCounterStore,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FlakyCounterStore {
    /// Healthy store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail (`true`) or succeed (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Calls received, failed or not.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for FlakyCounterStore {
    async fn hit_sliding_window(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        max: u32,
    ) -> Result<WindowCount, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("flaky store is down".into()));
        }
        self.inner
            .hit_sliding_window(key, now_ms, window_ms, max)
            .await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}
