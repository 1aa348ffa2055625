//! Ordered enrichment of log events
//!
//! An enricher is a named function that reads an event and returns properties
//! to add. The chain applies them in order, later results overwriting earlier
//! keys. A failing or panicking enricher is skipped for that event.

use crate::errors::EnrichmentError;
use crate::event::{ExceptionInfo, LogEvent};
use chrono::SecondsFormat;
use serde_json::{Value, json};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

pub type EnrichFn = dyn Fn(&LogEvent) -> Result<Vec<(String, Value)>, EnrichmentError> + Send + Sync;

const FAILURE_REPORT_WINDOW: Duration = Duration::from_secs(60);

pub struct Enricher {
    name: String,
    func: Box<EnrichFn>,
    failures: AtomicU64,
    // millis since the chain epoch, offset by one so zero means never reported
    last_reported: AtomicU64,
}

impl Enricher {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&LogEvent) -> Result<Vec<(String, Value)>, EnrichmentError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
            failures: AtomicU64::new(0),
            last_reported: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn apply(&self, event: &LogEvent) -> Result<Vec<(String, Value)>, EnrichmentError> {
        match catch_unwind(AssertUnwindSafe(|| (self.func)(event))) {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(EnrichmentError::Panicked(message))
            }
        }
    }

    fn record_failure(&self, error: &EnrichmentError, now_ms: u64, window: Duration) {
        let total = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        let last = self.last_reported.load(Ordering::Relaxed);
        let due = last == 0 || now_ms.saturating_sub(last) >= window.as_millis() as u64;

        if due
            && self
                .last_reported
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(
                enricher = %self.name,
                failures = total,
                "Enricher failed, continuing without it: {}",
                error
            );
        }
    }
}

impl std::fmt::Debug for Enricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enricher")
            .field("name", &self.name)
            .field("failures", &self.failures())
            .finish()
    }
}

#[derive(Debug)]
pub struct EnricherChain {
    enrichers: Vec<Enricher>,
    epoch: Instant,
    report_window: Duration,
}

impl Default for EnricherChain {
    fn default() -> Self {
        Self::new()
    }
}

impl EnricherChain {
    pub fn new() -> Self {
        Self {
            enrichers: Vec::new(),
            epoch: Instant::now(),
            report_window: FAILURE_REPORT_WINDOW,
        }
    }

    pub fn with(mut self, enricher: Enricher) -> Self {
        self.enrichers.push(enricher);
        self
    }

    pub fn push(&mut self, enricher: Enricher) {
        self.enrichers.push(enricher);
    }

    pub fn len(&self) -> usize {
        self.enrichers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enrichers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.enrichers.iter().map(Enricher::name).collect()
    }

    /// Total failures across all enrichers.
    pub fn failure_count(&self) -> u64 {
        self.enrichers.iter().map(Enricher::failures).sum()
    }

    pub fn enrich(&self, mut event: LogEvent) -> LogEvent {
        for enricher in &self.enrichers {
            match enricher.apply(&event) {
                Ok(properties) => event.properties.extend(properties),
                Err(error) => {
                    let now_ms = self.epoch.elapsed().as_millis() as u64 + 1;
                    enricher.record_failure(&error, now_ms, self.report_window);
                }
            }
        }
        event
    }
}

/// A fixed property, e.g. `Application`.
pub fn property(key: impl Into<String>, value: impl Into<Value>) -> Enricher {
    let key = key.into();
    let value = value.into();
    Enricher::new(format!("property:{}", key), move |_| Ok(vec![(key.clone(), value.clone())]))
}

/// `Environment`, read from `variable` on every call, falling back to `fallback`.
pub fn environment(variable: impl Into<String>, fallback: Option<String>) -> Enricher {
    let variable = variable.into();
    Enricher::new("environment", move |_| {
        let value = std::env::var(&variable)
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| fallback.clone())
            .ok_or_else(|| EnrichmentError::MissingContext(variable.clone()))?;
        Ok(vec![("Environment".to_string(), Value::String(value))])
    })
}

pub fn machine_name() -> Enricher {
    Enricher::new("machine_name", |_| {
        let name = hostname::get()
            .map_err(|e| EnrichmentError::Failed(format!("hostname lookup failed: {}", e)))?
            .into_string()
            .map_err(|_| EnrichmentError::Failed("hostname is not valid UTF-8".to_string()))?;
        Ok(vec![("MachineName".to_string(), Value::String(name))])
    })
}

pub fn process_id() -> Enricher {
    Enricher::new("process_id", |_| Ok(vec![("ProcessId".to_string(), json!(std::process::id()))]))
}

/// Identifies the producing thread; the chain runs on the caller of `emit`.
pub fn thread_id() -> Enricher {
    Enricher::new("thread_id", |_| {
        let thread = std::thread::current();
        let mut properties = vec![("ThreadId".to_string(), json!(format!("{:?}", thread.id())))];
        if let Some(name) = thread.name() {
            properties.push(("ThreadName".to_string(), json!(name)));
        }
        Ok(properties)
    })
}

pub fn utc_timestamp() -> Enricher {
    Enricher::new("utc_timestamp", |event| {
        Ok(vec![(
            "UtcTimestamp".to_string(),
            json!(event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        )])
    })
}

/// Flattens the attached exception into an `ExceptionDetail` object.
pub fn exception_details() -> Enricher {
    Enricher::new("exception_details", |event| {
        Ok(event
            .exception
            .as_ref()
            .map(|exception| vec![("ExceptionDetail".to_string(), exception_value(exception))])
            .unwrap_or_default())
    })
}

fn exception_value(exception: &ExceptionInfo) -> Value {
    let mut detail = json!({
        "Type": exception.type_name,
        "Message": exception.message,
    });
    if !exception.stack_frames.is_empty() {
        detail["StackTrace"] = json!(exception.stack_trace());
    }
    if let Some(inner) = &exception.inner {
        detail["InnerException"] = exception_value(inner);
    }
    detail
}
