//! Counters surfaced by the pipeline
//!
//! Every event that enters the pipeline is accounted for: per sink,
//! `dispatched == delivered + dropped + pending` at all times.

use crate::retry::CircuitState;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Why a sink gave up on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DropReason {
    /// Oldest batch evicted from a full sink queue
    QueueOverflow,
    /// Sink is marked unusable
    PermanentFailure,
    /// Backend refused the batch or document
    Rejected,
    /// Event could not be encoded for this sink
    Serialization,
    /// Still pending when the shutdown grace period ran out
    Shutdown,
}

/// Ingestion side counters.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    emitted: AtomicU64,
    filtered: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    batched: AtomicU64,
    batches_sealed: AtomicU64,
    unflushed_dropped: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_emitted(&self) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sealed(&self, events: usize) {
        self.batched.fetch_add(events as u64, Ordering::Relaxed);
        self.batches_sealed.fetch_add(1, Ordering::Relaxed);
    }

    /// Events accepted but never sealed into a batch because the batcher was
    /// abandoned at the end of the grace period.
    pub(crate) fn record_unflushed(&self, events: u64) {
        self.unflushed_dropped.fetch_add(events, Ordering::Relaxed);
    }

    pub fn snapshot(&self, enrichment_failures: u64) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            events_emitted: self.emitted.load(Ordering::Relaxed),
            events_filtered: self.filtered.load(Ordering::Relaxed),
            events_accepted: self.accepted.load(Ordering::Relaxed),
            events_rejected: self.rejected.load(Ordering::Relaxed),
            events_batched: self.batched.load(Ordering::Relaxed),
            batches_sealed: self.batches_sealed.load(Ordering::Relaxed),
            events_unflushed_dropped: self.unflushed_dropped.load(Ordering::Relaxed),
            enrichment_failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineMetricsSnapshot {
    pub events_emitted: u64,
    pub events_filtered: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub events_batched: u64,
    pub batches_sealed: u64,
    pub events_unflushed_dropped: u64,
    pub enrichment_failures: u64,
}

/// Delivery counters and state for one sink.
#[derive(Debug)]
pub struct SinkMetrics {
    name: String,
    state: AtomicU8,
    disabled: AtomicBool,
    dispatched: AtomicU64,
    delivered: AtomicU64,
    batches_delivered: AtomicU64,
    attempts: AtomicU64,
    failed_attempts: AtomicU64,
    probes: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_permanent: AtomicU64,
    dropped_rejected: AtomicU64,
    dropped_serialization: AtomicU64,
    dropped_shutdown: AtomicU64,
    batches_dropped: AtomicU64,
}

impl SinkMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Healthy.as_u8()),
            disabled: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            batches_delivered: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            probes: AtomicU64::new(0),
            dropped_overflow: AtomicU64::new(0),
            dropped_permanent: AtomicU64::new(0),
            dropped_rejected: AtomicU64::new(0),
            dropped_serialization: AtomicU64::new(0),
            dropped_shutdown: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: CircuitState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Release);
    }

    pub(crate) fn record_dispatched(&self, events: usize) {
        self.dispatched.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed_attempt(&self) {
        self.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self, events: usize) {
        self.delivered.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_delivered(&self) {
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, reason: DropReason, events: u64) {
        let counter = match reason {
            DropReason::QueueOverflow => &self.dropped_overflow,
            DropReason::PermanentFailure => &self.dropped_permanent,
            DropReason::Rejected => &self.dropped_rejected,
            DropReason::Serialization => &self.dropped_serialization,
            DropReason::Shutdown => &self.dropped_shutdown,
        };
        counter.fetch_add(events, Ordering::Relaxed);
    }

    /// Events handed to this sink that have not reached a terminal state yet.
    pub fn pending(&self) -> u64 {
        let snapshot = self.snapshot();
        snapshot
            .events_dispatched
            .saturating_sub(snapshot.events_delivered + snapshot.events_dropped())
    }

    pub fn snapshot(&self) -> SinkMetricsSnapshot {
        SinkMetricsSnapshot {
            name: self.name.clone(),
            state: self.state(),
            disabled: self.is_disabled(),
            events_dispatched: self.dispatched.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            probes: self.probes.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_permanent: self.dropped_permanent.load(Ordering::Relaxed),
            dropped_rejected: self.dropped_rejected.load(Ordering::Relaxed),
            dropped_serialization: self.dropped_serialization.load(Ordering::Relaxed),
            dropped_shutdown: self.dropped_shutdown.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkMetricsSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub disabled: bool,
    pub events_dispatched: u64,
    pub events_delivered: u64,
    pub batches_delivered: u64,
    pub attempts: u64,
    pub failed_attempts: u64,
    pub probes: u64,
    pub dropped_overflow: u64,
    pub dropped_permanent: u64,
    pub dropped_rejected: u64,
    pub dropped_serialization: u64,
    pub dropped_shutdown: u64,
    pub batches_dropped: u64,
}

impl SinkMetricsSnapshot {
    pub fn events_dropped(&self) -> u64 {
        self.dropped_overflow
            + self.dropped_permanent
            + self.dropped_rejected
            + self.dropped_serialization
            + self.dropped_shutdown
    }

    pub fn events_pending(&self) -> u64 {
        self.events_dispatched
            .saturating_sub(self.events_delivered + self.events_dropped())
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        // the two counters are loaded separately, failures can run ahead
        (self.attempts.saturating_sub(self.failed_attempts) as f64 / self.attempts as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_accounting_balances() {
        let metrics = SinkMetrics::new("remote");
        metrics.record_dispatched(10);
        metrics.record_delivered(6);
        metrics.record_dropped(DropReason::Rejected, 1);
        metrics.record_dropped(DropReason::QueueOverflow, 2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_dropped(), 3);
        assert_eq!(snapshot.events_pending(), 1);
        assert_eq!(metrics.pending(), 1);
    }

    #[test]
    fn test_state_round_trips_through_atomic() {
        let metrics = SinkMetrics::new("remote");
        assert_eq!(metrics.state(), CircuitState::Healthy);
        metrics.set_state(CircuitState::CircuitOpen);
        assert_eq!(metrics.snapshot().state, CircuitState::CircuitOpen);
    }

    #[test]
    fn test_success_rate() {
        let metrics = SinkMetrics::new("remote");
        assert_eq!(metrics.snapshot().success_rate(), 0.0);

        for _ in 0..4 {
            metrics.record_attempt();
        }
        metrics.record_failed_attempt();
        assert_eq!(metrics.snapshot().success_rate(), 75.0);
    }

    #[test]
    fn test_success_rate_with_failures_ahead_of_attempts() {
        let metrics = SinkMetrics::new("remote");
        metrics.record_attempt();
        metrics.record_failed_attempt();
        metrics.record_failed_attempt();

        assert_eq!(metrics.snapshot().success_rate(), 0.0);
    }
}
