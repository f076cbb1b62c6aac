//! Plugin registry.
//!
//! Owns every registered unit, its observed status and its per-unit
//! context. Unit hooks always run on `Arc` clones with no registry lock
//! held, so a slow or failing unit never blocks readers or other units.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use conduit_events::{ConduitEvent, EventBus, EventMetadata};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::contribution::{Contribution, ContributionType};
use crate::error::{PluginError, PluginResult};
use crate::loader::{LoadOutcome, LoaderOptions, SandboxedLoader};
use crate::unit::{PluginStatus, PluginUnit, UnitDescriptor, UnitId, UnitKind};

const EVENT_SOURCE: &str = "registry";

/// Context key under which [`PluginRegistry::register_checked`] stores the
/// loader manifest.
pub const MANIFEST_CONTEXT_KEY: &str = "manifest";

struct Entry {
    unit: Arc<dyn PluginUnit>,
    descriptor: UnitDescriptor,
    status: PluginStatus,
    seq: u64,
    context: Map<String, Value>,
}

impl Entry {
    fn snapshot(&self) -> RegisteredUnit {
        RegisteredUnit {
            unit: Arc::clone(&self.unit),
            descriptor: self.descriptor.clone(),
            status: self.status.clone(),
            sequence: self.seq,
        }
    }
}

/// Point-in-time view of one registered unit.
///
/// `descriptor` is the registry's copy: it carries the current `enabled`
/// flag and the latest reconfigured `config`.
#[derive(Debug, Clone)]
pub struct RegisteredUnit {
    /// The unit.
    pub unit: Arc<dyn PluginUnit>,
    /// Current descriptor.
    pub descriptor: UnitDescriptor,
    /// Observed status.
    pub status: PluginStatus,
    /// Registration sequence number. Breaks priority ties.
    pub sequence: u64,
}

impl RegisteredUnit {
    /// Unit id.
    #[must_use]
    pub fn id(&self) -> &UnitId {
        &self.descriptor.id
    }

    /// Whether the unit may be selected for execution.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.descriptor.enabled && self.status.is_active()
    }
}

/// Registry of plugin units.
pub struct PluginRegistry {
    entries: RwLock<HashMap<UnitId, Entry>>,
    next_seq: AtomicU64,
    events: Option<EventBus>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.read();
        let mut ids: Vec<(u64, &UnitId)> = entries
            .values()
            .map(|e| (e.seq, &e.descriptor.id))
            .collect();
        ids.sort();
        f.debug_struct("PluginRegistry")
            .field("units", &ids.into_iter().map(|(_, id)| id).collect::<Vec<_>>())
            .field("events", &self.events.is_some())
            .finish()
    }
}

impl PluginRegistry {
    /// Create an empty registry with no event bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            events: None,
        }
    }

    /// Publish lifecycle events to `bus`.
    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<UnitId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<UnitId, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConduitEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    fn emit_status(&self, id: &UnitId, status: &PluginStatus) {
        let error = match status {
            PluginStatus::Error(msg) => Some(msg.clone()),
            _ => None,
        };
        self.emit(ConduitEvent::PluginStatusChanged {
            metadata: EventMetadata::new(EVENT_SOURCE),
            unit_id: id.to_string(),
            status: status.label().to_string(),
            error,
        });
    }

    /// Set the status of `id` if the entry still belongs to registration
    /// `seq`. Returns whether it was applied.
    fn set_status(&self, id: &UnitId, seq: u64, status: PluginStatus) -> bool {
        let applied = {
            let mut entries = self.write();
            match entries.get_mut(id) {
                Some(entry) if entry.seq == seq => {
                    entry.status = status.clone();
                    true
                },
                _ => false,
            }
        };
        if applied {
            self.emit_status(id, &status);
        } else {
            debug!(unit_id = %id, "Status update dropped; unit was replaced or removed");
        }
        applied
    }

    fn validate(descriptor: &UnitDescriptor) -> PluginResult<()> {
        if descriptor.dependencies.contains(&descriptor.id) {
            return Err(PluginError::InvalidDescriptor {
                unit_id: descriptor.id.clone(),
                message: "unit depends on itself".to_string(),
            });
        }
        Ok(())
    }

    /// Insert a fresh entry for `unit`, replacing any existing one.
    /// Returns the new sequence number and the replaced unit.
    fn insert_entry(
        &self,
        unit: &Arc<dyn PluginUnit>,
        status: PluginStatus,
        context: Map<String, Value>,
    ) -> PluginResult<(u64, Option<Arc<dyn PluginUnit>>)> {
        let descriptor = unit.descriptor().clone();
        let id = descriptor.id.clone();
        let kind = descriptor.kind;

        let (seq, replaced) = {
            let mut entries = self.write();
            if let Some(existing) = entries.get(&id)
                && matches!(existing.status, PluginStatus::Loading | PluginStatus::Unloading)
            {
                return Err(PluginError::InProgress(id));
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let replaced = entries.insert(
                id.clone(),
                Entry {
                    unit: Arc::clone(unit),
                    descriptor,
                    status: status.clone(),
                    seq,
                    context,
                },
            );
            (seq, replaced.map(|e| e.unit))
        };

        self.emit(ConduitEvent::PluginRegistered {
            metadata: EventMetadata::new(EVENT_SOURCE),
            unit_id: id.to_string(),
            kind: kind.to_string(),
        });
        self.emit_status(&id, &status);
        Ok((seq, replaced))
    }

    /// Stop and shut down a unit. Failures are logged, never propagated.
    async fn teardown(unit: &Arc<dyn PluginUnit>) {
        let descriptor = unit.descriptor();
        if descriptor.kind.is_service()
            && let Err(e) = unit.stop_service().await
        {
            error!(unit_id = %descriptor.id, error = %e, "Service stop failed");
        }
        if let Err(e) = unit.shutdown().await {
            error!(unit_id = %descriptor.id, error = %e, "Unit shutdown failed");
        }
    }

    /// Run `init` and, for service kinds, `start_service`, then compute the
    /// resulting status from the registry's current `enabled` intent.
    async fn bring_up(&self, id: &UnitId, seq: u64, unit: &Arc<dyn PluginUnit>) -> PluginStatus {
        let start = Instant::now();
        let enabled = self
            .read()
            .get(id)
            .map_or(unit.descriptor().enabled, |e| e.descriptor.enabled);

        let mut outcome = unit.init().await.map_err(|e| e.to_string());
        if outcome.is_ok() && enabled && unit.descriptor().kind.is_service() {
            outcome = unit.start_service().await.map_err(|e| e.to_string());
        }

        let status = match outcome {
            Ok(()) => {
                let enabled = self.read().get(id).map_or(enabled, |e| e.descriptor.enabled);
                if enabled {
                    PluginStatus::Active
                } else {
                    PluginStatus::Disabled
                }
            },
            Err(msg) => {
                error!(unit_id = %id, error = %msg, "Unit initialization failed");
                PluginStatus::Error(msg)
            },
        };

        self.set_status(id, seq, status.clone());
        info!(
            unit_id = %id,
            status = status.label(),
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Unit registered"
        );
        status
    }

    async fn register_with_context(
        &self,
        unit: Arc<dyn PluginUnit>,
        context: Map<String, Value>,
    ) -> PluginResult<PluginStatus> {
        Self::validate(unit.descriptor())?;
        let id = unit.descriptor().id.clone();

        let (seq, replaced) = self.insert_entry(&unit, PluginStatus::Loading, context)?;
        if let Some(old) = replaced {
            warn!(
                unit_id = %id,
                "Overwriting registered unit; shutting down the previous instance"
            );
            Self::teardown(&old).await;
        }

        Ok(self.bring_up(&id, seq, &unit).await)
    }

    /// Register a unit, initializing it.
    ///
    /// An existing unit with the same id is replaced and shut down. A failed
    /// `init` (or service start) does not fail the call: the unit stays
    /// registered with [`PluginStatus::Error`], which is returned.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidDescriptor`] for an inconsistent
    /// descriptor and [`PluginError::InProgress`] if the id is still loading
    /// or unloading.
    pub async fn register(&self, unit: Arc<dyn PluginUnit>) -> PluginResult<PluginStatus> {
        self.register_with_context(unit, Map::new()).await
    }

    /// Vet `source` with `loader` before registering `unit`.
    ///
    /// When the load fails or exceeds `options.timeout`, the unit is
    /// registered in [`PluginStatus::Error`] with the loader's message and
    /// its `init` is never called. On success the loader manifest is kept in
    /// the unit's context under [`MANIFEST_CONTEXT_KEY`].
    ///
    /// # Errors
    ///
    /// Same as [`register`](Self::register).
    pub async fn register_checked(
        &self,
        unit: Arc<dyn PluginUnit>,
        loader: &dyn SandboxedLoader,
        source: &str,
        options: &LoaderOptions,
    ) -> PluginResult<PluginStatus> {
        Self::validate(unit.descriptor())?;
        let id = unit.descriptor().id.clone();

        let load = tokio::time::timeout(options.timeout, loader.load(source, options));
        let outcome = match load.await {
            Ok(outcome) => outcome,
            Err(_) => LoadOutcome::failed(
                format!("loader timed out after {}ms", options.timeout.as_millis()),
                u64::try_from(options.timeout.as_millis()).unwrap_or(u64::MAX),
            ),
        };
        debug!(
            unit_id = %id,
            success = outcome.success,
            load_ms = outcome.execution_time_ms,
            "Sandboxed load finished"
        );

        let mut context = Map::new();
        if let Some(manifest) = outcome.manifest {
            context.insert(MANIFEST_CONTEXT_KEY.to_string(), manifest);
        }

        if outcome.success {
            return self.register_with_context(unit, context).await;
        }

        let message = outcome
            .error
            .unwrap_or_else(|| "sandboxed load failed".to_string());
        warn!(unit_id = %id, error = %message, "Sandboxed load rejected unit");
        let status = PluginStatus::Error(message);
        let (_, replaced) = self.insert_entry(&unit, status.clone(), context)?;
        if let Some(old) = replaced {
            warn!(
                unit_id = %id,
                "Overwriting registered unit; shutting down the previous instance"
            );
            Self::teardown(&old).await;
        }
        Ok(status)
    }

    /// Remove a unit, stopping its service and shutting it down first.
    ///
    /// Returns `false` (and logs a warning) if no such unit is registered.
    pub async fn unregister(&self, id: &UnitId) -> bool {
        let (unit, seq) = {
            let mut entries = self.write();
            let Some(entry) = entries.get_mut(id) else {
                warn!(unit_id = %id, "Unregister requested for unknown unit");
                return false;
            };
            if entry.status == PluginStatus::Unloading {
                return false;
            }
            entry.status = PluginStatus::Unloading;
            (Arc::clone(&entry.unit), entry.seq)
        };
        self.emit_status(id, &PluginStatus::Unloading);

        Self::teardown(&unit).await;

        let removed = {
            let mut entries = self.write();
            if entries.get(id).is_some_and(|e| e.seq == seq) {
                entries.remove(id);
                true
            } else {
                false
            }
        };
        if removed {
            self.emit(ConduitEvent::PluginUnregistered {
                metadata: EventMetadata::new(EVENT_SOURCE),
                unit_id: id.to_string(),
            });
            info!(unit_id = %id, "Unit unregistered");
        }
        removed
    }

    /// Unregister every unit, newest first. Returns how many were removed.
    pub async fn shutdown_all(&self) -> usize {
        let mut ids: Vec<(u64, UnitId)> = self
            .read()
            .values()
            .map(|e| (e.seq, e.descriptor.id.clone()))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = 0usize;
        for (_, id) in ids {
            if self.unregister(&id).await {
                removed = removed.saturating_add(1);
            }
        }
        info!(removed, "Registry shut down");
        removed
    }

    /// The unit registered under `id`.
    #[must_use]
    pub fn get_unit(&self, id: &UnitId) -> Option<Arc<dyn PluginUnit>> {
        self.read().get(id).map(|e| Arc::clone(&e.unit))
    }

    /// Snapshot of one unit.
    #[must_use]
    pub fn get(&self, id: &UnitId) -> Option<RegisteredUnit> {
        self.read().get(id).map(Entry::snapshot)
    }

    /// Observed status of `id`.
    #[must_use]
    pub fn status(&self, id: &UnitId) -> Option<PluginStatus> {
        self.read().get(id).map(|e| e.status.clone())
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &UnitId) -> bool {
        self.read().contains_key(id)
    }

    /// Number of registered units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Every unit, in registration order.
    #[must_use]
    pub fn list_units(&self) -> Vec<RegisteredUnit> {
        let mut units: Vec<RegisteredUnit> = self.read().values().map(Entry::snapshot).collect();
        units.sort_by_key(|u| u.sequence);
        units
    }

    /// Units of one kind, in registration order.
    #[must_use]
    pub fn list_by_kind(&self, kind: UnitKind) -> Vec<RegisteredUnit> {
        self.list_units()
            .into_iter()
            .filter(|u| u.descriptor.kind == kind)
            .collect()
    }

    /// Every declared contribution of `contribution_type`, with its unit.
    #[must_use]
    pub fn list_by_contribution(
        &self,
        contribution_type: ContributionType,
    ) -> Vec<(UnitId, Contribution)> {
        Self::contributions_of(self.list_units(), contribution_type)
    }

    /// Tool contributions of units that are currently active.
    #[must_use]
    pub fn list_tools_from_active(&self) -> Vec<(UnitId, Contribution)> {
        let active = self
            .list_units()
            .into_iter()
            .filter(RegisteredUnit::is_runnable)
            .collect();
        Self::contributions_of(active, ContributionType::Tool)
    }

    fn contributions_of(
        units: Vec<RegisteredUnit>,
        contribution_type: ContributionType,
    ) -> Vec<(UnitId, Contribution)> {
        units
            .into_iter()
            .flat_map(|u| {
                let id = u.descriptor.id;
                u.descriptor
                    .contributions
                    .into_iter()
                    .filter(move |c| c.contribution_type == contribution_type)
                    .map(move |c| (id.clone(), c))
            })
            .collect()
    }

    /// Per-unit context, such as the loader manifest.
    #[must_use]
    pub fn unit_context(&self, id: &UnitId) -> Option<Map<String, Value>> {
        self.read().get(id).map(|e| e.context.clone())
    }

    /// Offer new settings to a unit. When the unit accepts them they replace
    /// the descriptor's `config`.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for an unknown id, [`PluginError::Unit`]
    /// if the unit rejects the settings.
    pub async fn reconfigure(&self, id: &UnitId, settings: Map<String, Value>) -> PluginResult<()> {
        let (unit, seq) = {
            let entries = self.read();
            let entry = entries.get(id).ok_or_else(|| PluginError::NotFound(id.clone()))?;
            (Arc::clone(&entry.unit), entry.seq)
        };

        unit.reconfigure(&settings)
            .await
            .map_err(|source| PluginError::Unit {
                unit_id: id.clone(),
                source,
            })?;

        let mut entries = self.write();
        if let Some(entry) = entries.get_mut(id)
            && entry.seq == seq
        {
            entry.descriptor.config = settings;
        }
        drop(entries);
        info!(unit_id = %id, "Unit reconfigured");
        Ok(())
    }

    /// Change the user's `enabled` intent.
    ///
    /// Disabling an active unit stops its service and moves it to
    /// [`PluginStatus::Disabled`]; enabling a disabled unit starts it again.
    /// A unit in `Error` keeps its status; only the intent is recorded.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for an unknown id.
    pub async fn set_enabled(&self, id: &UnitId, enabled: bool) -> PluginResult<PluginStatus> {
        let (unit, seq, previous) = {
            let mut entries = self.write();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| PluginError::NotFound(id.clone()))?;
            entry.descriptor.enabled = enabled;
            (Arc::clone(&entry.unit), entry.seq, entry.status.clone())
        };
        let is_service = unit.descriptor().kind.is_service();

        let next = if !enabled && previous.is_active() {
            if is_service && let Err(e) = unit.stop_service().await {
                error!(unit_id = %id, error = %e, "Service stop failed");
            }
            PluginStatus::Disabled
        } else if enabled && previous == PluginStatus::Disabled {
            let started = if is_service {
                unit.start_service().await
            } else {
                Ok(())
            };
            match started {
                Ok(()) => PluginStatus::Active,
                Err(e) => {
                    error!(unit_id = %id, error = %e, "Service start failed");
                    PluginStatus::Error(e.to_string())
                },
            }
        } else {
            return Ok(previous);
        };

        self.set_status(id, seq, next.clone());
        info!(unit_id = %id, enabled, status = next.label(), "Unit enablement changed");
        Ok(next)
    }

    /// Re-run initialization, typically to clear a pinned `Error`.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] for an unknown id, [`PluginError::InProgress`]
    /// while the unit is loading or unloading.
    pub async fn reset(&self, id: &UnitId) -> PluginResult<PluginStatus> {
        let (unit, seq, previous) = {
            let mut entries = self.write();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| PluginError::NotFound(id.clone()))?;
            if matches!(entry.status, PluginStatus::Loading | PluginStatus::Unloading) {
                return Err(PluginError::InProgress(id.clone()));
            }
            let previous = std::mem::replace(&mut entry.status, PluginStatus::Loading);
            (Arc::clone(&entry.unit), entry.seq, previous)
        };
        self.emit_status(id, &PluginStatus::Loading);

        if previous.is_active()
            && unit.descriptor().kind.is_service()
            && let Err(e) = unit.stop_service().await
        {
            warn!(unit_id = %id, error = %e, "Service stop before reset failed");
        }

        Ok(self.bring_up(id, seq, &unit).await)
    }

    /// Pin a unit to `Error` after a failed execution. Returns whether the
    /// unit was found.
    pub fn mark_error(&self, id: &UnitId, message: impl Into<String>) -> bool {
        let seq = {
            let entries = self.read();
            match entries.get(id) {
                Some(entry) if entry.status != PluginStatus::Unloading => entry.seq,
                _ => return false,
            }
        };
        let message = message.into();
        warn!(unit_id = %id, error = %message, "Unit pinned to error status");
        self.set_status(id, seq, PluginStatus::Error(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::error::{UnitError, UnitResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Calls {
        init: AtomicUsize,
        shutdown: AtomicUsize,
        log: Mutex<Vec<&'static str>>,
    }

    impl Calls {
        fn push(&self, call: &'static str) {
            self.log.lock().unwrap().push(call);
        }

        fn log(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    struct TestUnit {
        descriptor: UnitDescriptor,
        fail_init_times: AtomicUsize,
        reject_config: bool,
        calls: Arc<Calls>,
    }

    impl TestUnit {
        fn new(id: &'static str, kind: UnitKind) -> Self {
            Self {
                descriptor: UnitDescriptor::new(UnitId::from_static(id), id, kind),
                fail_init_times: AtomicUsize::new(0),
                reject_config: false,
                calls: Arc::new(Calls::default()),
            }
        }

        fn failing_init(self, times: usize) -> Self {
            self.fail_init_times.store(times, Ordering::SeqCst);
            self
        }

        fn map(mut self, f: impl FnOnce(UnitDescriptor) -> UnitDescriptor) -> Self {
            self.descriptor = f(self.descriptor);
            self
        }
    }

    #[async_trait]
    impl PluginUnit for TestUnit {
        fn descriptor(&self) -> &UnitDescriptor {
            &self.descriptor
        }

        async fn init(&self) -> UnitResult<()> {
            self.calls.init.fetch_add(1, Ordering::SeqCst);
            self.calls.push("init");
            let remaining = self.fail_init_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_init_times
                    .store(remaining.saturating_sub(1), Ordering::SeqCst);
                return Err(UnitError::Init("no backend".into()));
            }
            Ok(())
        }

        async fn shutdown(&self) -> UnitResult<()> {
            self.calls.shutdown.fetch_add(1, Ordering::SeqCst);
            self.calls.push("shutdown");
            Ok(())
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> UnitResult<Option<Value>> {
            Ok(None)
        }

        async fn start_service(&self) -> UnitResult<()> {
            self.calls.push("start");
            Ok(())
        }

        async fn stop_service(&self) -> UnitResult<()> {
            self.calls.push("stop");
            Ok(())
        }

        async fn reconfigure(&self, _settings: &Map<String, Value>) -> UnitResult<()> {
            if self.reject_config {
                return Err(UnitError::Config("nope".into()));
            }
            Ok(())
        }
    }

    struct FixedLoader(LoadOutcome, Duration);

    #[async_trait]
    impl SandboxedLoader for FixedLoader {
        async fn load(&self, _source: &str, _options: &LoaderOptions) -> LoadOutcome {
            tokio::time::sleep(self.1).await;
            self.0.clone()
        }
    }

    fn id(s: &'static str) -> UnitId {
        UnitId::from_static(s)
    }

    #[tokio::test]
    async fn test_register_activates_unit() {
        let registry = PluginRegistry::new();
        let status = registry
            .register(Arc::new(TestUnit::new("a", UnitKind::Synchronous)))
            .await
            .unwrap();
        assert_eq!(status, PluginStatus::Active);
        assert_eq!(registry.status(&id("a")), Some(PluginStatus::Active));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_unit_initializes_but_stays_disabled() {
        let registry = PluginRegistry::new();
        let unit = TestUnit::new("d", UnitKind::Service).map(UnitDescriptor::disabled);
        let calls = Arc::clone(&unit.calls);

        let status = registry.register(Arc::new(unit)).await.unwrap();
        assert_eq!(status, PluginStatus::Disabled);
        assert_eq!(calls.log(), ["init"]);
    }

    #[tokio::test]
    async fn test_failed_init_is_isolated() {
        let registry = PluginRegistry::new();
        let status = registry
            .register(Arc::new(TestUnit::new("bad", UnitKind::Synchronous).failing_init(1)))
            .await
            .unwrap();
        assert!(matches!(status, PluginStatus::Error(ref m) if m.contains("no backend")));

        let status = registry
            .register(Arc::new(TestUnit::new("good", UnitKind::Synchronous)))
            .await
            .unwrap();
        assert_eq!(status, PluginStatus::Active);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_self_dependency_is_rejected() {
        let registry = PluginRegistry::new();
        let unit =
            TestUnit::new("loop", UnitKind::Synchronous).map(|d| d.with_dependency(id("loop")));
        let err = registry.register(Arc::new(unit)).await.unwrap_err();
        assert!(matches!(err, PluginError::InvalidDescriptor { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_shuts_down_previous_instance() {
        let registry = PluginRegistry::new();
        let first = TestUnit::new("svc", UnitKind::Service);
        let first_calls = Arc::clone(&first.calls);
        registry.register(Arc::new(first)).await.unwrap();
        let first_seq = registry.get(&id("svc")).unwrap().sequence;

        registry
            .register(Arc::new(TestUnit::new("svc", UnitKind::Service)))
            .await
            .unwrap();

        assert_eq!(first_calls.log(), ["init", "start", "stop", "shutdown"]);
        assert!(registry.get(&id("svc")).unwrap().sequence > first_seq);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_stops_then_shuts_down() {
        let registry = PluginRegistry::new();
        let unit = TestUnit::new("svc", UnitKind::HybridService);
        let calls = Arc::clone(&unit.calls);
        registry.register(Arc::new(unit)).await.unwrap();

        assert!(registry.unregister(&id("svc")).await);
        assert_eq!(calls.log(), ["init", "start", "stop", "shutdown"]);
        assert!(registry.status(&id("svc")).is_none());
        assert!(registry.unit_context(&id("svc")).is_none());

        assert!(!registry.unregister(&id("svc")).await);
    }

    #[tokio::test]
    async fn test_listing_follows_registration_order() {
        let registry = PluginRegistry::new();
        for (name, kind) in [
            ("c", UnitKind::Synchronous),
            ("a", UnitKind::Asynchronous),
            ("b", UnitKind::Synchronous),
        ] {
            registry.register(Arc::new(TestUnit::new(name, kind))).await.unwrap();
        }

        let ids: Vec<_> = registry.list_units().iter().map(|u| u.id().to_string()).collect();
        assert_eq!(ids, ["c", "a", "b"]);

        let sync: Vec<_> = registry
            .list_by_kind(UnitKind::Synchronous)
            .iter()
            .map(|u| u.id().to_string())
            .collect();
        assert_eq!(sync, ["c", "b"]);
    }

    #[tokio::test]
    async fn test_contribution_queries() {
        let registry = PluginRegistry::new();
        let tools = TestUnit::new("tools", UnitKind::Static).map(|d| {
            d.with_contribution(Contribution::tool("search", "Search", json!({})))
                .with_contribution(Contribution::new(
                    ContributionType::Command,
                    "reindex",
                    "",
                    Value::Null,
                ))
        });
        let broken = TestUnit::new("broken", UnitKind::Static)
            .failing_init(1)
            .map(|d| d.with_contribution(Contribution::tool("lookup", "Lookup", json!({}))));
        registry.register(Arc::new(tools)).await.unwrap();
        registry.register(Arc::new(broken)).await.unwrap();

        let all_tools = registry.list_by_contribution(ContributionType::Tool);
        assert_eq!(all_tools.len(), 2);
        assert_eq!(all_tools[0].0, id("tools"));

        let active_tools = registry.list_tools_from_active();
        assert_eq!(active_tools.len(), 1);
        assert_eq!(active_tools[0].1.name, "search");

        let commands = registry.list_by_contribution(ContributionType::Command);
        assert_eq!(commands[0].1.name, "reindex");
    }

    #[tokio::test]
    async fn test_set_enabled_moves_between_disabled_and_active() {
        let registry = PluginRegistry::new();
        let unit = TestUnit::new("svc", UnitKind::Service);
        let calls = Arc::clone(&unit.calls);
        registry.register(Arc::new(unit)).await.unwrap();

        let status = registry.set_enabled(&id("svc"), false).await.unwrap();
        assert_eq!(status, PluginStatus::Disabled);
        assert!(!registry.get(&id("svc")).unwrap().descriptor.enabled);

        let status = registry.set_enabled(&id("svc"), true).await.unwrap();
        assert_eq!(status, PluginStatus::Active);
        assert_eq!(calls.log(), ["init", "start", "stop", "start"]);

        assert!(matches!(
            registry.set_enabled(&id("nope"), true).await,
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_and_mark_error() {
        let registry = PluginRegistry::new();
        let unit = TestUnit::new("flaky", UnitKind::Synchronous).failing_init(1);
        let calls = Arc::clone(&unit.calls);
        registry.register(Arc::new(unit)).await.unwrap();
        assert!(matches!(registry.status(&id("flaky")), Some(PluginStatus::Error(_))));

        let status = registry.reset(&id("flaky")).await.unwrap();
        assert_eq!(status, PluginStatus::Active);
        assert_eq!(calls.init.load(Ordering::SeqCst), 2);

        assert!(registry.mark_error(&id("flaky"), "execution blew up"));
        assert_eq!(
            registry.status(&id("flaky")),
            Some(PluginStatus::Error("execution blew up".into()))
        );
        assert!(!registry.mark_error(&id("ghost"), "x"));
    }

    #[tokio::test]
    async fn test_reconfigure_replaces_config_only_when_accepted() {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(TestUnit::new("ok", UnitKind::Synchronous)))
            .await
            .unwrap();
        let mut picky = TestUnit::new("picky", UnitKind::Synchronous)
            .map(|d| d.with_config("mode", json!("fast")));
        picky.reject_config = true;
        registry.register(Arc::new(picky)).await.unwrap();

        let mut settings = Map::new();
        settings.insert("mode".into(), json!("slow"));

        registry.reconfigure(&id("ok"), settings.clone()).await.unwrap();
        assert_eq!(registry.get(&id("ok")).unwrap().descriptor.config, settings);

        let err = registry.reconfigure(&id("picky"), settings).await.unwrap_err();
        assert!(matches!(err, PluginError::Unit { .. }));
        assert_eq!(
            registry.get(&id("picky")).unwrap().descriptor.config["mode"],
            json!("fast")
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_empties_registry() {
        let registry = PluginRegistry::new();
        let first = TestUnit::new("first", UnitKind::Synchronous);
        let calls = Arc::clone(&first.calls);
        registry.register(Arc::new(first)).await.unwrap();
        registry
            .register(Arc::new(TestUnit::new("second", UnitKind::Service)))
            .await
            .unwrap();

        assert_eq!(registry.shutdown_all().await, 2);
        assert!(registry.is_empty());
        assert_eq!(calls.shutdown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_checked_failed_load_skips_init() {
        let registry = PluginRegistry::new();
        let unit = TestUnit::new("sandboxed", UnitKind::Synchronous);
        let calls = Arc::clone(&unit.calls);
        let loader = FixedLoader(
            LoadOutcome::failed("forbidden capability: net", 3),
            Duration::ZERO,
        );

        let status = registry
            .register_checked(Arc::new(unit), &loader, "src", &LoaderOptions::default())
            .await
            .unwrap();

        assert_eq!(status, PluginStatus::Error("forbidden capability: net".into()));
        assert_eq!(calls.init.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_checked_times_out_slow_loader() {
        let registry = PluginRegistry::new();
        let loader = FixedLoader(LoadOutcome::loaded(None, 1), Duration::from_secs(60));
        let options = LoaderOptions::default().with_timeout(Duration::from_secs(1));

        let status = registry
            .register_checked(
                Arc::new(TestUnit::new("slow", UnitKind::Synchronous)),
                &loader,
                "src",
                &options,
            )
            .await
            .unwrap();
        assert!(matches!(status, PluginStatus::Error(ref m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn test_register_checked_keeps_manifest() {
        let registry = PluginRegistry::new();
        let loader = FixedLoader(
            LoadOutcome::loaded(Some(json!({"exports": ["run"]})), 2),
            Duration::ZERO,
        );

        let status = registry
            .register_checked(
                Arc::new(TestUnit::new("vetted", UnitKind::Synchronous)),
                &loader,
                "src",
                &LoaderOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(status, PluginStatus::Active);
        let context = registry.unit_context(&id("vetted")).unwrap();
        assert_eq!(context[MANIFEST_CONTEXT_KEY], json!({"exports": ["run"]}));
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let registry = PluginRegistry::new().with_events(bus);

        registry
            .register(Arc::new(TestUnit::new("evt", UnitKind::Synchronous)))
            .await
            .unwrap();
        registry.unregister(&id("evt")).await;

        let types: Vec<_> = rx.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            types,
            [
                "plugin_registered",
                "plugin_status_changed",
                "plugin_status_changed",
                "plugin_status_changed",
                "plugin_unregistered",
            ]
        );
    }
}
