//! Event sink recording named timed events during partitioning and
//! execution, exportable as a Chrome-trace JSON document.
//!
//! The profiler is an explicit instance passed to whoever should record into
//! it; nothing here is process-global. It starts disabled, buffers up to a
//! fixed number of events once started, and warns exactly once when the
//! buffer cap is reached.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

/// Default event-buffer capacity.
pub const DEFAULT_MAX_EVENTS: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Session,
    Partition,
    Provider,
    Node,
}

impl EventCategory {
    fn as_str(self) -> &'static str {
        match self {
            EventCategory::Session => "session",
            EventCategory::Partition => "partition",
            EventCategory::Provider => "provider",
            EventCategory::Node => "node",
        }
    }
}

/// One completed timed event.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub category: EventCategory,
    pub name: String,
    /// Microseconds since profiling started.
    pub timestamp_us: u64,
    pub duration_us: u64,
    pub args: BTreeMap<String, String>,
}

struct ProfilerInner {
    origin: Instant,
    events: Vec<EventRecord>,
    overflow_warned: bool,
}

/// Bounded sink for named timed events.
pub struct Profiler {
    enabled: AtomicBool,
    max_events: usize,
    inner: Mutex<ProfilerInner>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            max_events,
            inner: Mutex::new(ProfilerInner {
                origin: Instant::now(),
                events: Vec::new(),
                overflow_warned: false,
            }),
        }
    }

    /// Starts recording. Resets the time origin; previously collected events
    /// are kept.
    pub fn start(&self) {
        let mut inner = self.inner.lock().expect("profiler mutex poisoned");
        inner.origin = Instant::now();
        self.enabled.store(true, Ordering::Release);
    }

    /// Stops recording; buffered events remain available for export.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Opens a RAII scope that records one event covering its lifetime.
    pub fn scope(&self, category: EventCategory, name: impl Into<String>) -> ProfileScope<'_> {
        ProfileScope {
            profiler: self,
            category,
            name: name.into(),
            start: Instant::now(),
            args: BTreeMap::new(),
        }
    }

    /// Records one event that started at `start` and ends now.
    pub fn record_event(
        &self,
        category: EventCategory,
        name: impl Into<String>,
        start: Instant,
        args: BTreeMap<String, String>,
    ) {
        if !self.is_enabled() {
            return;
        }
        let duration_us = start.elapsed().as_micros() as u64;
        let mut inner = self.inner.lock().expect("profiler mutex poisoned");
        let timestamp_us = start.duration_since(inner.origin).as_micros() as u64;
        if inner.events.len() >= self.max_events {
            if !inner.overflow_warned {
                warn!(
                    max_events = self.max_events,
                    "profiler event buffer full; dropping further events"
                );
                inner.overflow_warned = true;
            }
            return;
        }
        inner.events.push(EventRecord {
            category,
            name: name.into(),
            timestamp_us,
            duration_us,
            args,
        });
    }

    /// Snapshot of the buffered events.
    pub fn events(&self) -> Vec<EventRecord> {
        self.inner
            .lock()
            .expect("profiler mutex poisoned")
            .events
            .clone()
    }

    /// Serializes the buffered events as a Chrome-trace document (complete
    /// `X`-phase events, microsecond timestamps).
    pub fn export_chrome_trace(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct ChromeTraceEvent<'a> {
            cat: &'a str,
            pid: u32,
            tid: u64,
            dur: u64,
            ts: u64,
            ph: &'a str,
            name: &'a str,
            args: &'a BTreeMap<String, String>,
        }

        let inner = self.inner.lock().expect("profiler mutex poisoned");
        let trace: Vec<ChromeTraceEvent<'_>> = inner
            .events
            .iter()
            .map(|event| ChromeTraceEvent {
                cat: event.category.as_str(),
                pid: std::process::id(),
                tid: 0,
                dur: event.duration_us,
                ts: event.timestamp_us,
                ph: "X",
                name: &event.name,
                args: &event.args,
            })
            .collect();
        serde_json::to_string_pretty(&trace)
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard recording one event when dropped.
pub struct ProfileScope<'a> {
    profiler: &'a Profiler,
    category: EventCategory,
    name: String,
    start: Instant,
    args: BTreeMap<String, String>,
}

impl ProfileScope<'_> {
    /// Attaches a string argument carried into the recorded event.
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

impl Drop for ProfileScope<'_> {
    fn drop(&mut self) {
        let name = std::mem::take(&mut self.name);
        let args = std::mem::take(&mut self.args);
        self.profiler
            .record_event(self.category, name, self.start, args);
    }
}
