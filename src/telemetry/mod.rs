//! Telemetry ports consumed by every runtime component
//!
//! This module provides:
//! - Meter, counter, and up/down-counter interfaces
//! - A no-op implementation (absent collectors must never fail a caller)
//! - An atomic in-process implementation, readable by name, used as the
//!   process default and by tests
//! - A replaceable process-wide default provider
//!
//! Only the interfaces live here; exporting to a real metrics backend is an
//! integration concern outside this crate. Log and span emission go through
//! `tracing` directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Monotonic counter port.
pub trait Counter: Send + Sync {
    /// Add `delta` to the counter.
    fn add(&self, delta: u64);

    /// Add one.
    fn inc(&self) {
        self.add(1);
    }
}

/// Up/down counter port for gauged quantities (live runners, running jobs).
pub trait UpDownCounter: Send + Sync {
    /// Add `delta`, which may be negative.
    fn add(&self, delta: i64);

    /// Add one.
    fn inc(&self) {
        self.add(1);
    }

    /// Subtract one.
    fn dec(&self) {
        self.add(-1);
    }
}

/// Meter port: a named scope that hands out instruments.
pub trait Meter: Send + Sync {
    /// A monotonic counter registered under `name` in this scope.
    fn counter(&self, name: &str) -> Arc<dyn Counter>;

    /// An up/down counter registered under `name` in this scope.
    fn up_down_counter(&self, name: &str) -> Arc<dyn UpDownCounter>;
}

/// Provider port: hands out meters per instrumentation scope.
///
/// Scopes are conventionally the call-site module path joined with the
/// component instance name.
pub trait MeterProvider: Send + Sync {
    /// The meter for `scope`, creating it if needed.
    fn meter(&self, scope: &str) -> Arc<dyn Meter>;
}

/// Meter that discards every measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMeter;

struct NoopCounter;

impl Counter for NoopCounter {
    fn add(&self, _delta: u64) {}
}

struct NoopUpDownCounter;

impl UpDownCounter for NoopUpDownCounter {
    fn add(&self, _delta: i64) {}
}

impl Meter for NoopMeter {
    fn counter(&self, _name: &str) -> Arc<dyn Counter> {
        Arc::new(NoopCounter)
    }

    fn up_down_counter(&self, _name: &str) -> Arc<dyn UpDownCounter> {
        Arc::new(NoopUpDownCounter)
    }
}

/// Provider that hands out [`NoopMeter`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMeterProvider;

impl MeterProvider for NoopMeterProvider {
    fn meter(&self, _scope: &str) -> Arc<dyn Meter> {
        Arc::new(NoopMeter)
    }
}

/// Atomic counter readable in-process.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicU64,
}

impl AtomicCounter {
    /// Current value. Relaxed read, telemetry-grade only.
    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl Counter for AtomicCounter {
    fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Atomic up/down counter readable in-process.
#[derive(Debug, Default)]
pub struct AtomicUpDownCounter {
    value: AtomicI64,
}

impl AtomicUpDownCounter {
    /// Current value. Relaxed read, telemetry-grade only.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl UpDownCounter for AtomicUpDownCounter {
    fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
}

/// In-process meter backed by atomic registries.
///
/// Instruments are created on first use and live for the life of the meter;
/// tests and stats endpoints read them back by name.
pub struct AtomicMeter {
    scope: String,
    counters: RwLock<HashMap<String, Arc<AtomicCounter>>>,
    up_down_counters: RwLock<HashMap<String, Arc<AtomicUpDownCounter>>>,
}

impl AtomicMeter {
    /// Create an empty meter for `scope`.
    pub fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            counters: RwLock::new(HashMap::new()),
            up_down_counters: RwLock::new(HashMap::new()),
        }
    }

    /// The instrumentation scope this meter was created for.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Read a counter back by name; zero if it was never created.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.value())
            .unwrap_or(0)
    }

    /// Read an up/down counter back by name; zero if it was never created.
    pub fn up_down_value(&self, name: &str) -> i64 {
        self.up_down_counters
            .read()
            .get(name)
            .map(|c| c.value())
            .unwrap_or(0)
    }

    fn typed_counter(&self, name: &str) -> Arc<AtomicCounter> {
        if let Some(existing) = self.counters.read().get(name) {
            return existing.clone();
        }
        let mut counters = self.counters.write();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicCounter::default()))
            .clone()
    }

    fn typed_up_down(&self, name: &str) -> Arc<AtomicUpDownCounter> {
        if let Some(existing) = self.up_down_counters.read().get(name) {
            return existing.clone();
        }
        let mut counters = self.up_down_counters.write();
        counters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicUpDownCounter::default()))
            .clone()
    }
}

impl std::fmt::Debug for AtomicMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicMeter")
            .field("scope", &self.scope)
            .field("counters", &self.counters.read().len())
            .field("up_down_counters", &self.up_down_counters.read().len())
            .finish()
    }
}

impl Meter for AtomicMeter {
    fn counter(&self, name: &str) -> Arc<dyn Counter> {
        self.typed_counter(name)
    }

    fn up_down_counter(&self, name: &str) -> Arc<dyn UpDownCounter> {
        self.typed_up_down(name)
    }
}

/// Provider handing out [`AtomicMeter`]s, one per scope.
#[derive(Default)]
pub struct AtomicMeterProvider {
    meters: RwLock<HashMap<String, Arc<AtomicMeter>>>,
}

impl AtomicMeterProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// The meter for `scope` if it has been created, for readback.
    pub fn get(&self, scope: &str) -> Option<Arc<AtomicMeter>> {
        self.meters.read().get(scope).cloned()
    }

    /// All scopes with a live meter.
    pub fn scopes(&self) -> Vec<String> {
        self.meters.read().keys().cloned().collect()
    }

    fn typed_meter(&self, scope: &str) -> Arc<AtomicMeter> {
        if let Some(existing) = self.meters.read().get(scope) {
            return existing.clone();
        }
        let mut meters = self.meters.write();
        meters
            .entry(scope.to_string())
            .or_insert_with(|| Arc::new(AtomicMeter::new(scope)))
            .clone()
    }
}

impl std::fmt::Debug for AtomicMeterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicMeterProvider")
            .field("meters", &self.meters.read().len())
            .finish()
    }
}

impl MeterProvider for AtomicMeterProvider {
    fn meter(&self, scope: &str) -> Arc<dyn Meter> {
        self.typed_meter(scope)
    }
}

static DEFAULT_PROVIDER: Lazy<RwLock<Arc<dyn MeterProvider>>> =
    Lazy::new(|| RwLock::new(Arc::new(AtomicMeterProvider::new())));

/// The process-wide default meter provider.
pub fn default_meter_provider() -> Arc<dyn MeterProvider> {
    DEFAULT_PROVIDER.read().clone()
}

/// Replace the process-wide default meter provider.
///
/// Intended for process initialisation, before components are constructed;
/// meters already handed out keep pointing at the previous provider.
pub fn set_default_meter_provider(provider: Arc<dyn MeterProvider>) {
    *DEFAULT_PROVIDER.write() = provider;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_meter_accepts_everything() {
        let meter = NoopMeter;
        let counter = meter.counter("jobs.total");
        counter.add(10);
        counter.inc();

        let gauge = meter.up_down_counter("jobs.running");
        gauge.inc();
        gauge.dec();
        gauge.add(-5);
    }

    #[test]
    fn test_atomic_meter_readback() {
        let meter = AtomicMeter::new("plinth::pool::test");
        let counter = meter.counter("jobs.total");
        counter.add(3);
        counter.inc();

        let gauge = meter.up_down_counter("jobs.running");
        gauge.inc();
        gauge.inc();
        gauge.dec();

        assert_eq!(meter.counter_value("jobs.total"), 4);
        assert_eq!(meter.up_down_value("jobs.running"), 1);
        assert_eq!(meter.counter_value("never.created"), 0);
    }

    #[test]
    fn test_same_instrument_is_shared() {
        let meter = AtomicMeter::new("scope");
        let a = meter.counter("hits");
        let b = meter.counter("hits");
        a.inc();
        b.inc();
        assert_eq!(meter.counter_value("hits"), 2);
    }

    #[test]
    fn test_provider_scopes() {
        let provider = AtomicMeterProvider::new();
        provider.meter("a").counter("x").inc();
        provider.meter("b").counter("x").inc();

        assert!(provider.get("a").is_some());
        assert!(provider.get("missing").is_none());
        assert_eq!(provider.scopes().len(), 2);
        assert_eq!(provider.get("a").unwrap().counter_value("x"), 1);
    }

    #[test]
    fn test_default_provider_is_atomic() {
        let provider = default_meter_provider();
        let meter = provider.meter("plinth::telemetry::default-test");
        meter.counter("touched").inc();
    }
}
