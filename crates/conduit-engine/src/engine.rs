//! The plugin execution engine.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use conduit_config::Config;
use conduit_events::{ConduitEvent, EventBus, EventMetadata};
use conduit_plugins::{
    ExecutionContext, LoaderOptions, PluginRegistry, PluginStatus, PluginUnit, RegisteredUnit,
    SandboxedLoader, UnitId, UnitKind,
};
use conduit_resilience::{
    CircuitBreaker, CircuitBreakerConfig, CounterStore, MemoryCounterStore, RateLimitDecision,
    RateLimitPolicy, RateLimiter, RetryConfig,
};
use conduit_tasks::{AsyncTaskTracker, TaskConfig, TaskError, TasksResult, ToolTable};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::chain::{ASYNC_TASKS_KEY, AggregateResult, ChainOptions, SkipReason};
use crate::config_bridge;
use crate::error::{EngineError, EngineResult};
use crate::invoke::{Invoker, UNIT_TOOL_PREFIX, UnitTool, unit_tool_name};
use crate::report::{EngineStats, HealthReport, ShutdownReport};

const EVENT_SOURCE: &str = "engine";

/// Runtime settings of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Limit for one unit invocation.
    pub unit_timeout: Duration,
    /// Limit for one health probe.
    pub health_timeout: Duration,
    /// Pin a unit to `Error` when an execution fails.
    pub pin_status_on_error: bool,
    /// Suggested grace period for [`PluginExecutionEngine::shutdown`].
    pub shutdown_grace: Duration,
    /// Policy used by [`PluginExecutionEngine::check_rate_limit`].
    pub rate_limit: RateLimitPolicy,
    /// Backoff settings offered to callers that retry failed runs.
    pub retry: RetryConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            unit_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(2),
            pin_status_on_error: true,
            shutdown_grace: Duration::from_secs(5),
            rate_limit: RateLimitPolicy::per_minute(100),
            retry: RetryConfig::new(3, Duration::from_secs(1), Duration::from_secs(30), 2.0)
                .with_jitter(0.1),
        }
    }
}

/// Builder for [`PluginExecutionEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    settings: EngineSettings,
    breaker: CircuitBreakerConfig,
    events: Option<EventBus>,
    tools: Option<Arc<ToolTable>>,
    task_default_timeout: Option<Duration>,
    counter_store: Option<Arc<dyn CounterStore>>,
    rate_limit_sweep: Option<Duration>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("settings", &self.settings)
            .field("breaker", &self.breaker)
            .field("events", &self.events.is_some())
            .field("task_default_timeout", &self.task_default_timeout)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Replace the engine settings.
    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the breaker thresholds.
    #[must_use]
    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Publish events from every component to `bus`.
    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Use `tools` for background dispatch instead of the built-in table.
    #[must_use]
    pub fn with_tools(mut self, tools: Arc<ToolTable>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Default timeout for background tasks.
    #[must_use]
    pub fn with_task_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_default_timeout = timeout;
        self
    }

    /// Shared counter store for rate limiting.
    #[must_use]
    pub fn with_counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    /// Sweep interval of the local rate-limit fallback.
    #[must_use]
    pub fn with_rate_limit_sweep_interval(mut self, interval: Duration) -> Self {
        self.rate_limit_sweep = Some(interval);
        self
    }

    /// Wire up the engine.
    #[must_use]
    pub fn build(self) -> PluginExecutionEngine {
        let mut registry = PluginRegistry::new();
        let tools = self
            .tools
            .unwrap_or_else(|| Arc::new(ToolTable::with_builtins()));
        let mut tracker =
            AsyncTaskTracker::new(tools).with_default_timeout(self.task_default_timeout);
        if let Some(bus) = &self.events {
            registry = registry.with_events(bus.clone());
            tracker = tracker.with_events(bus.clone());
        }

        let store = self
            .counter_store
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::new()));
        let mut rate_limiter = RateLimiter::new(store);
        if let Some(interval) = self.rate_limit_sweep {
            rate_limiter = rate_limiter.with_sweep_interval(interval);
        }

        let registry = Arc::new(registry);
        let breaker = Arc::new(CircuitBreaker::new(self.breaker));
        let invoker = Arc::new(Invoker {
            registry: Arc::clone(&registry),
            breaker: Arc::clone(&breaker),
            timeout: self.settings.unit_timeout,
            pin_status_on_error: self.settings.pin_status_on_error,
        });

        PluginExecutionEngine {
            registry,
            tracker: Arc::new(tracker),
            breaker,
            rate_limiter: Arc::new(rate_limiter),
            invoker,
            events: self.events,
            settings: self.settings,
            last_health: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }
}

/// Runs registered units in stages: preprocessors, then inline units, then
/// background dispatch.
///
/// The engine owns the registry and the task tracker. Construct one at
/// startup and tear it down with [`shutdown`](Self::shutdown).
pub struct PluginExecutionEngine {
    registry: Arc<PluginRegistry>,
    tracker: Arc<AsyncTaskTracker>,
    breaker: Arc<CircuitBreaker>,
    rate_limiter: Arc<RateLimiter>,
    invoker: Arc<Invoker>,
    events: Option<EventBus>,
    settings: EngineSettings,
    last_health: Mutex<HashMap<UnitId, bool>>,
    shutting_down: AtomicBool,
}

impl fmt::Debug for PluginExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginExecutionEngine")
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .field("settings", &self.settings)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl Default for PluginExecutionEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PluginExecutionEngine {
    /// Engine with default settings and the built-in tools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Engine configured from every section of `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .with_settings(config_bridge::engine_settings(config))
            .with_breaker_config(config_bridge::breaker_config(&config.circuit_breaker))
            .with_events(EventBus::with_capacity(config.events.channel_capacity))
            .with_task_default_timeout(config_bridge::task_default_timeout(&config.tasks))
            .with_rate_limit_sweep_interval(Duration::from_millis(
                config.rate_limit.sweep_interval_ms,
            ))
            .build()
    }

    /// The unit registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// The background task tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<AsyncTaskTracker> {
        &self.tracker
    }

    /// The circuit breaker guarding unit invocations.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// The event bus, if one was attached.
    #[must_use]
    pub fn events(&self) -> Option<&EventBus> {
        self.events.as_ref()
    }

    /// Runtime settings.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Whether [`shutdown`](Self::shutdown) has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    /// Keep the `unit:<id>` tool in step with a unit's stage.
    fn sync_unit_tool(&self, id: &UnitId, background: bool) -> EngineResult<()> {
        if background {
            self.install_unit_tool(id)?;
        } else {
            self.tracker.tools().unregister(&unit_tool_name(id));
        }
        Ok(())
    }

    /// Install the `unit:<id>` tool unless it is already present. Losing a
    /// registration race to another installer is not an error.
    fn install_unit_tool(&self, id: &UnitId) -> TasksResult<()> {
        let tools = self.tracker.tools();
        if tools.contains(&unit_tool_name(id)) {
            return Ok(());
        }
        match tools.register(Arc::new(UnitTool::new(id.clone(), Arc::clone(&self.invoker)))) {
            Ok(()) | Err(TaskError::DuplicateTool(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Register a unit and, for background units, its dispatch tool.
    ///
    /// # Errors
    ///
    /// [`EngineError::ShuttingDown`] after shutdown, otherwise the
    /// registry's own errors.
    pub async fn register_unit(&self, unit: Arc<dyn PluginUnit>) -> EngineResult<PluginStatus> {
        self.ensure_running()?;
        let id = unit.descriptor().id.clone();
        let background = unit.descriptor().runs_in_background();
        let status = self.registry.register(unit).await?;
        self.sync_unit_tool(&id, background)?;
        Ok(status)
    }

    /// Like [`register_unit`](Self::register_unit), vetting `source` with
    /// `loader` first.
    ///
    /// # Errors
    ///
    /// Same as [`register_unit`](Self::register_unit).
    pub async fn register_unit_checked(
        &self,
        unit: Arc<dyn PluginUnit>,
        loader: &dyn SandboxedLoader,
        source: &str,
        options: &LoaderOptions,
    ) -> EngineResult<PluginStatus> {
        self.ensure_running()?;
        let id = unit.descriptor().id.clone();
        let background = unit.descriptor().runs_in_background();
        let status = self
            .registry
            .register_checked(unit, loader, source, options)
            .await?;
        self.sync_unit_tool(&id, background)?;
        Ok(status)
    }

    /// Unregister a unit and drop its dispatch tool.
    pub async fn unregister_unit(&self, id: &UnitId) -> bool {
        self.tracker.tools().unregister(&unit_tool_name(id));
        self.last_health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.registry.unregister(id).await
    }

    /// Select the runnable units for a run, in execution order, recording
    /// units with unmet dependencies as skipped.
    fn select(
        &self,
        options: &ChainOptions,
        skipped: &mut Vec<(UnitId, SkipReason)>,
    ) -> Vec<RegisteredUnit> {
        let units = self.registry.list_units();
        let runnable: HashSet<&UnitId> = units
            .iter()
            .filter(|u| u.is_runnable())
            .map(RegisteredUnit::id)
            .collect();

        let mut selected: Vec<RegisteredUnit> = Vec::new();
        for unit in &units {
            if !unit.is_runnable() || !options.includes(unit.descriptor.kind) {
                continue;
            }
            let missing: Vec<UnitId> = unit
                .descriptor
                .dependencies
                .iter()
                .filter(|dep| !runnable.contains(dep))
                .cloned()
                .collect();
            if missing.is_empty() {
                selected.push(unit.clone());
            } else {
                debug!(
                    unit_id = %unit.id(),
                    missing = ?missing,
                    "Skipping unit with unmet dependencies"
                );
                skipped.push((unit.id().clone(), SkipReason::UnmetDependencies(missing)));
            }
        }

        selected.sort_by(|a, b| {
            b.descriptor
                .priority
                .cmp(&a.descriptor.priority)
                .then(a.sequence.cmp(&b.sequence))
        });
        selected
    }

    /// Run every eligible unit against `ctx`.
    ///
    /// Preprocessors run first, one at a time, and their changes to the
    /// input and chain state are visible to every later unit. Inline units
    /// run next, in the same priority order; every one is attempted unless
    /// the run is fail-fast. Background units are then dispatched to the
    /// task tracker with the request id as correlation id, and the run
    /// returns without waiting for them.
    ///
    /// # Errors
    ///
    /// Only for misuse: [`EngineError::InvalidTargetKinds`] for an empty
    /// kind list and [`EngineError::ShuttingDown`] after shutdown. Unit
    /// failures are reported in the result.
    pub async fn run_chain(
        &self,
        ctx: &mut ExecutionContext,
        options: ChainOptions,
    ) -> EngineResult<AggregateResult> {
        self.ensure_running()?;
        if options.target_kinds.as_ref().is_some_and(Vec::is_empty) {
            return Err(EngineError::InvalidTargetKinds);
        }

        let start = Instant::now();
        let mut skipped = Vec::new();
        let selected = self.select(&options, &mut skipped);

        let (inline, background): (Vec<_>, Vec<_>) = selected
            .into_iter()
            .filter(|u| {
                u.descriptor.kind == UnitKind::MessagePreprocessor
                    || u.descriptor.runs_inline()
                    || u.descriptor.runs_in_background()
            })
            .partition(|u| !u.descriptor.runs_in_background());
        // Preprocessors before inline units; the sort keeps priority order
        // within each stage.
        let (preprocessors, sync_units): (Vec<_>, Vec<_>) = inline
            .into_iter()
            .partition(|u| u.descriptor.kind == UnitKind::MessagePreprocessor);

        let mut per_unit_results = Vec::new();
        let mut overall_success = true;
        let mut aborted = false;

        for unit in preprocessors.into_iter().chain(sync_units) {
            let id = unit.id().clone();
            if aborted {
                skipped.push((id, SkipReason::FailFast));
                continue;
            }
            let result = self.invoker.invoke(Arc::clone(&unit.unit), ctx).await;
            if !result.success {
                overall_success = false;
                aborted = options.fail_fast;
            }
            per_unit_results.push((id, result));
        }

        let mut async_tasks = Vec::new();
        if aborted {
            skipped.extend(background.into_iter().map(|u| (u.id().clone(), SkipReason::FailFast)));
        } else if !background.is_empty() {
            let snapshot = ctx.snapshot();
            let correlation_id = ctx.request_id.to_string();
            for unit in background {
                let id = unit.id().clone();
                // Units registered straight on the registry have no tool yet.
                let dispatched = self.install_unit_tool(&id).and_then(|()| {
                    self.tracker.call_async(
                        &unit_tool_name(&id),
                        snapshot.clone(),
                        Map::new(),
                        TaskConfig::default().with_correlation_id(correlation_id.clone()),
                    )
                });
                match dispatched {
                    Ok(task_id) => async_tasks.push((id, task_id)),
                    Err(e) => {
                        warn!(unit_id = %id, error = %e, "Background dispatch failed");
                        skipped.push((id, SkipReason::DispatchFailed(e.to_string())));
                    },
                }
            }
        }

        let mut metadata = Map::new();
        metadata.insert("requestId".to_string(), Value::String(ctx.request_id.to_string()));
        metadata.insert(
            ASYNC_TASKS_KEY.to_string(),
            Value::Object(
                async_tasks
                    .iter()
                    .map(|(unit, task)| (unit.to_string(), Value::String(task.to_string())))
                    .collect(),
            ),
        );

        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Some(bus) = &self.events {
            bus.publish(ConduitEvent::ChainCompleted {
                metadata: EventMetadata::new(EVENT_SOURCE)
                    .with_correlation_id(ctx.request_id.to_string()),
                request_id: ctx.request_id,
                overall_success,
                units_run: per_unit_results.len(),
                async_dispatched: async_tasks.len(),
                duration_ms,
            });
        }
        info!(
            request_id = %ctx.request_id,
            units_run = per_unit_results.len(),
            async_dispatched = async_tasks.len(),
            skipped = skipped.len(),
            success = overall_success,
            duration_ms,
            "Chain run finished"
        );

        Ok(AggregateResult {
            overall_success,
            per_unit_results,
            async_tasks,
            skipped,
            metadata,
        })
    }

    /// Probe every service unit. Probe errors, panics and timeouts count as
    /// unhealthy; a change from the last known verdict publishes a
    /// `PluginHealthChanged` event.
    pub async fn health_check(&self) -> Vec<HealthReport> {
        let timeout = self.settings.health_timeout;
        let probes = self
            .registry
            .list_units()
            .into_iter()
            .filter(|u| u.descriptor.kind.is_service())
            .map(|u| {
                let id = u.id().clone();
                let unit = Arc::clone(&u.unit);
                let probe = tokio::spawn(async move {
                    match tokio::time::timeout(timeout, unit.health()).await {
                        Ok(Ok(health)) => (health.healthy, health.message),
                        Ok(Err(e)) => (false, Some(e.to_string())),
                        Err(_) => (
                            false,
                            Some(format!(
                                "health check timed out after {}ms",
                                timeout.as_millis()
                            )),
                        ),
                    }
                });
                async move {
                    let (healthy, message) = probe
                        .await
                        .unwrap_or_else(|e| (false, Some(format!("health check panicked: {e}"))));
                    HealthReport {
                        unit_id: id,
                        healthy,
                        message,
                    }
                }
            });
        let reports = futures::future::join_all(probes).await;

        let changed: Vec<&HealthReport> = {
            let mut last = self.last_health.lock().unwrap_or_else(PoisonError::into_inner);
            reports
                .iter()
                .filter(|r| last.insert(r.unit_id.clone(), r.healthy) != Some(r.healthy))
                .collect()
        };
        for report in changed {
            if report.healthy {
                info!(unit_id = %report.unit_id, "Unit healthy");
            } else {
                warn!(unit_id = %report.unit_id, message = ?report.message, "Unit unhealthy");
            }
            if let Some(bus) = &self.events {
                bus.publish(ConduitEvent::PluginHealthChanged {
                    metadata: EventMetadata::new(EVENT_SOURCE),
                    unit_id: report.unit_id.to_string(),
                    healthy: report.healthy,
                    message: report.message.clone(),
                });
            }
        }
        reports
    }

    /// Unit counts by kind and status, plus unfinished background tasks.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let units = self.registry.list_units();
        let mut stats = EngineStats {
            total_units: units.len(),
            pending_async_tasks: self.tracker.active_count(),
            ..EngineStats::default()
        };
        for unit in &units {
            let kind = stats.by_kind.entry(unit.descriptor.kind).or_insert(0);
            *kind = kind.saturating_add(1);
            let status = stats
                .by_status
                .entry(unit.status.label().to_string())
                .or_insert(0);
            *status = status.saturating_add(1);
        }
        stats
    }

    /// Count a request against `key` under the configured policy.
    pub async fn check_rate_limit(&self, key: &str) -> RateLimitDecision {
        self.rate_limiter
            .check_limit(key, self.settings.rate_limit)
            .await
    }

    /// Stop accepting runs, drain background tasks for up to `grace`
    /// (cancelling the rest), then unregister every unit.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Engine shutdown already in progress");
        }
        info!(grace_ms = grace.as_millis(), "Engine shutting down");

        let tasks = self.tracker.shutdown(grace).await;
        for name in self.tracker.tools().names() {
            if name.starts_with(UNIT_TOOL_PREFIX) {
                self.tracker.tools().unregister(&name);
            }
        }
        let units_unregistered = self.registry.shutdown_all().await;
        self.last_health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        ShutdownReport {
            tasks,
            units_unregistered,
        }
    }
}
