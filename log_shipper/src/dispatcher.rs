//! Fan-out of sealed batches to per-sink workers
//!
//! Every sink owns a bounded queue and a single worker task. The worker
//! delivers batches in order, retries under the sink's [`CircuitBreaker`], and
//! parks the queue while the circuit is open. Sinks never wait on each other.

use crate::errors::SinkError;
use crate::event::LogBatch;
use crate::metrics::{DropReason, SinkMetrics, SinkMetricsSnapshot};
use crate::retry::{CircuitBreaker, CircuitState, RetryDecision, RetryPolicy};
use crate::sink::Sink;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on the up-front allocation for a sink queue.
const PREALLOCATE_LIMIT: usize = 256;

/// Bounded batch queue; when full the oldest batch is evicted.
#[derive(Debug)]
pub(crate) struct SinkQueue {
    batches: Mutex<VecDeque<Arc<LogBatch>>>,
    capacity: usize,
    notify: Notify,
}

impl SinkQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            batches: Mutex::new(VecDeque::with_capacity(capacity.min(PREALLOCATE_LIMIT))),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue and wake the worker. Returns the evicted batch, if any.
    pub(crate) fn push_back(&self, batch: Arc<LogBatch>) -> Option<Arc<LogBatch>> {
        let evicted = {
            let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if batches.len() >= self.capacity {
                batches.pop_front()
            } else {
                None
            };
            batches.push_back(batch);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Return a batch to the head of the queue. If the queue filled up in the
    /// meantime the returned batch is the oldest and is handed back as evicted.
    pub(crate) fn push_front(&self, batch: Arc<LogBatch>) -> Option<Arc<LogBatch>> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        if batches.len() >= self.capacity {
            return Some(batch);
        }
        batches.push_front(batch);
        None
    }

    pub(crate) fn pop_front(&self) -> Option<Arc<LogBatch>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<LogBatch>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn sequences(&self) -> Vec<u64> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|batch| batch.metadata.sequence)
            .collect()
    }
}

#[derive(Debug, Clone)]
struct SinkHandle {
    queue: Arc<SinkQueue>,
    metrics: Arc<SinkMetrics>,
}

/// Hands each sealed batch to every configured sink.
#[derive(Debug)]
pub struct Dispatcher {
    sinks: Vec<SinkHandle>,
}

impl Dispatcher {
    /// Spawn one worker per sink. Workers stop once `shutdown` is cancelled
    /// and their queue is empty.
    pub fn start(
        sinks: Vec<(Arc<dyn Sink>, RetryPolicy)>,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let mut handles = Vec::with_capacity(sinks.len());
        let mut tasks = Vec::with_capacity(sinks.len());

        for (sink, policy) in sinks {
            let handle = SinkHandle {
                queue: Arc::new(SinkQueue::new(queue_capacity)),
                metrics: Arc::new(SinkMetrics::new(sink.name())),
            };
            let worker = SinkWorker {
                breaker: CircuitBreaker::new(sink.name(), policy),
                sink,
                queue: Arc::clone(&handle.queue),
                metrics: Arc::clone(&handle.metrics),
                shutdown: shutdown.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
            handles.push(handle);
        }

        (Self { sinks: handles }, tasks)
    }

    pub fn dispatch(&self, batch: LogBatch) {
        if batch.is_empty() {
            return;
        }
        let batch = Arc::new(batch);

        for sink in &self.sinks {
            sink.metrics.record_dispatched(batch.len());

            if sink.metrics.is_disabled() {
                sink.metrics.record_dropped(DropReason::PermanentFailure, batch.len() as u64);
                sink.metrics.record_batch_dropped();
                continue;
            }

            if let Some(evicted) = sink.queue.push_back(Arc::clone(&batch)) {
                warn!(
                    sink = %sink.metrics.name(),
                    "Sink queue full, dropped oldest batch {} ({} events)",
                    evicted.metadata.batch_id,
                    evicted.len()
                );
                sink.metrics.record_dropped(DropReason::QueueOverflow, evicted.len() as u64);
                sink.metrics.record_batch_dropped();
            }
        }
    }

    pub fn sink_metrics(&self) -> Vec<SinkMetricsSnapshot> {
        self.sinks.iter().map(|sink| sink.metrics.snapshot()).collect()
    }

    /// Events dispatched to any sink that are neither delivered nor dropped.
    pub fn pending_events(&self) -> u64 {
        self.sinks.iter().map(|sink| sink.metrics.pending()).sum()
    }

    /// Sequence numbers of the batches waiting for `sink`, oldest first.
    pub fn queued_sequences(&self, sink: &str) -> Option<Vec<u64>> {
        self.find(sink).map(|handle| handle.queue.sequences())
    }

    /// Clear the unusable mark set by a permanent failure.
    pub fn reenable(&self, sink: &str) -> bool {
        match self.find(sink) {
            Some(handle) => {
                handle.metrics.set_disabled(false);
                info!(sink = %sink, "Sink re-enabled");
                true
            }
            None => false,
        }
    }

    /// Count everything still pending as dropped. Only call once the workers
    /// have stopped.
    pub(crate) fn abandon_pending(&self) {
        for sink in &self.sinks {
            sink.queue.drain();
            let pending = sink.metrics.pending();
            if pending > 0 {
                warn!(sink = %sink.metrics.name(), "Abandoning {} undelivered events at shutdown", pending);
                sink.metrics.record_dropped(DropReason::Shutdown, pending);
            }
        }
    }

    fn find(&self, name: &str) -> Option<&SinkHandle> {
        self.sinks.iter().find(|sink| sink.metrics.name() == name)
    }
}

enum Delivery {
    Done,
    Requeue(Arc<LogBatch>),
}

struct SinkWorker {
    sink: Arc<dyn Sink>,
    queue: Arc<SinkQueue>,
    metrics: Arc<SinkMetrics>,
    breaker: CircuitBreaker,
    shutdown: CancellationToken,
}

impl SinkWorker {
    async fn run(mut self) {
        debug!(sink = %self.sink.name(), "Sink worker started");

        loop {
            if self.breaker.state() == CircuitState::CircuitOpen {
                if !self.probe_until_closed().await {
                    break;
                }
                continue;
            }

            let Some(batch) = self.queue.pop_front() else {
                if self.shutdown.is_cancelled() {
                    break;
                }
                tokio::select! {
                    _ = self.queue.notify.notified() => {}
                    _ = self.shutdown.cancelled() => {}
                }
                continue;
            };

            if let Delivery::Requeue(batch) = self.deliver(batch).await {
                if let Some(evicted) = self.queue.push_front(batch) {
                    self.drop_batch(&evicted, DropReason::QueueOverflow);
                }
            }
        }

        for batch in self.queue.drain() {
            self.drop_batch(&batch, DropReason::Shutdown);
        }
        debug!(sink = %self.sink.name(), "Sink worker stopped");
    }

    /// One probe cycle. Returns false when shutdown interrupted it.
    async fn probe_until_closed(&mut self) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }

        tokio::select! {
            _ = sleep(self.breaker.policy().probe_interval) => {}
            _ = self.shutdown.cancelled() => return false,
        }

        self.metrics.record_probe();
        let reachable = self.sink.probe().await;
        if self.breaker.on_probe(reachable) {
            self.metrics.set_state(self.breaker.state());
            info!(
                sink = %self.sink.name(),
                "Probe succeeded, delivering {} queued batches",
                self.queue.len()
            );
        }
        true
    }

    async fn deliver(&mut self, batch: Arc<LogBatch>) -> Delivery {
        let mut current = batch;

        loop {
            if self.metrics.is_disabled() {
                self.drop_batch(&current, DropReason::PermanentFailure);
                return Delivery::Done;
            }

            self.metrics.record_attempt();
            let failure = match self.sink.send(&current).await {
                Ok(result) => {
                    self.metrics.record_delivered(result.acknowledged);
                    for (_, reason) in &result.dropped {
                        self.metrics.record_dropped(*reason, 1);
                    }

                    if result.is_success() {
                        self.breaker.on_delivered();
                        self.metrics.set_state(self.breaker.state());
                        self.metrics.record_batch_delivered();
                        return Delivery::Done;
                    }

                    current = Arc::new(current.subset(&result.retryable));
                    result
                        .error
                        .unwrap_or_else(|| format!("{} documents need another attempt", current.len()))
                }
                Err(SinkError::Permanent(reason)) => {
                    error!(sink = %self.sink.name(), "Sink marked unusable: {}", reason);
                    self.metrics.set_disabled(true);
                    self.drop_batch(&current, DropReason::PermanentFailure);
                    return Delivery::Done;
                }
                Err(SinkError::Rejected(reason)) => {
                    warn!(
                        sink = %self.sink.name(),
                        "Batch {} rejected, dropping {} events: {}",
                        current.metadata.batch_id,
                        current.len(),
                        reason
                    );
                    self.drop_batch(&current, DropReason::Rejected);
                    self.breaker.on_delivered();
                    self.metrics.set_state(self.breaker.state());
                    return Delivery::Done;
                }
                Err(SinkError::Transient(reason)) => reason,
            };

            self.metrics.record_failed_attempt();
            let decision = self.breaker.on_attempt_failed();
            self.metrics.set_state(self.breaker.state());

            if self.shutdown.is_cancelled() {
                warn!(sink = %self.sink.name(), "Shutting down, not retrying batch {}: {}", current.metadata.batch_id, failure);
                self.drop_batch(&current, DropReason::Shutdown);
                return Delivery::Done;
            }

            match decision {
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        sink = %self.sink.name(),
                        "Failed to deliver batch {} (attempt {}), retrying in {}ms: {}",
                        current.metadata.batch_id,
                        self.breaker.attempts_for_batch(),
                        delay.as_millis(),
                        failure
                    );
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            self.drop_batch(&current, DropReason::Shutdown);
                            return Delivery::Done;
                        }
                    }
                }
                RetryDecision::OpenCircuit => {
                    error!(
                        sink = %self.sink.name(),
                        "Giving up on batch {} for now, queueing until the sink recovers: {}",
                        current.metadata.batch_id,
                        failure
                    );
                    return Delivery::Requeue(current);
                }
            }
        }
    }

    fn drop_batch(&self, batch: &LogBatch, reason: DropReason) {
        self.metrics.record_dropped(reason, batch.len() as u64);
        self.metrics.record_batch_dropped();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FlushTrigger, LogEvent, LogLevel};
    use crate::sink::DispatchResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn batch(sequence: u64, events: usize) -> LogBatch {
        let events = (0..events)
            .map(|i| Arc::new(LogEvent::new(LogLevel::Information, format!("event {}", i))))
            .collect();
        LogBatch::new(events, sequence, FlushTrigger::Forced)
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            jitter: false,
            probe_interval: Duration::from_secs(60),
        }
    }

    /// Fails until `failures_left` reaches zero, or while `down` is set.
    #[derive(Default)]
    struct ScriptedSink {
        failures_left: AtomicU32,
        down: AtomicBool,
        permanent: AtomicBool,
        delivered: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Sink for ScriptedSink {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, batch: &LogBatch) -> Result<DispatchResult, SinkError> {
            if self.permanent.load(Ordering::SeqCst) {
                return Err(SinkError::Permanent("bad endpoint".to_string()));
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(SinkError::Transient("connection refused".to_string()));
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SinkError::Transient("connection reset".to_string()));
            }
            self.delivered.lock().unwrap().push(batch.metadata.sequence);
            Ok(DispatchResult::acknowledged(batch.len()))
        }

        async fn probe(&self) -> bool {
            !self.down.load(Ordering::SeqCst)
        }
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_queue_evicts_oldest() {
        let queue = SinkQueue::new(3);
        let mut evicted = Vec::new();
        for sequence in 0..5 {
            if let Some(batch) = queue.push_back(Arc::new(batch(sequence, 1))) {
                evicted.push(batch.metadata.sequence);
            }
        }

        assert_eq!(evicted, vec![0, 1]);
        assert_eq!(queue.sequences(), vec![2, 3, 4]);

        let overflow = queue.push_front(Arc::new(batch(9, 1)));
        assert_eq!(overflow.map(|b| b.metadata.sequence), Some(9));
    }

    #[test]
    fn test_huge_queue_capacity_does_not_preallocate() {
        let queue = SinkQueue::new(usize::MAX);
        assert!(queue.batches.lock().unwrap().capacity() < 2 * PREALLOCATE_LIMIT);

        assert!(queue.push_back(Arc::new(batch(0, 1))).is_none());
        assert_eq!(queue.sequences(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_delivered_and_recovers() {
        let sink = Arc::new(ScriptedSink::default());
        sink.failures_left.store(2, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        let (dispatcher, _tasks) = Dispatcher::start(vec![(sink.clone() as Arc<dyn Sink>, policy(5))], 10, shutdown.clone());

        dispatcher.dispatch(batch(0, 3));
        wait_for(|| dispatcher.pending_events() == 0).await;

        let metrics = &dispatcher.sink_metrics()[0];
        assert_eq!(metrics.failed_attempts, 2);
        assert_eq!(metrics.attempts, 3);
        assert_eq!(metrics.events_delivered, 3);
        assert_eq!(metrics.state, CircuitState::Healthy);
        assert_eq!(*sink.delivered.lock().unwrap(), vec![0]);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_keeps_most_recent_batches() {
        let sink = Arc::new(ScriptedSink::default());
        sink.down.store(true, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        let (dispatcher, _tasks) = Dispatcher::start(vec![(sink.clone() as Arc<dyn Sink>, policy(1))], 3, shutdown.clone());

        dispatcher.dispatch(batch(0, 1));
        wait_for(|| dispatcher.sink_metrics()[0].state == CircuitState::CircuitOpen).await;

        for sequence in 1..=5 {
            dispatcher.dispatch(batch(sequence, 1));
        }

        assert_eq!(dispatcher.queued_sequences("scripted"), Some(vec![3, 4, 5]));
        let metrics = &dispatcher.sink_metrics()[0];
        assert_eq!(metrics.dropped_overflow, 3);
        assert_eq!(metrics.batches_dropped, 3);
        assert_eq!(metrics.events_pending(), 3);

        sink.down.store(false, Ordering::SeqCst);
        wait_for(|| dispatcher.pending_events() == 0).await;

        assert_eq!(*sink.delivered.lock().unwrap(), vec![3, 4, 5]);
        let metrics = &dispatcher.sink_metrics()[0];
        assert_eq!(metrics.state, CircuitState::Healthy);
        assert!(metrics.probes >= 1);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_disables_sink() {
        let sink = Arc::new(ScriptedSink::default());
        sink.permanent.store(true, Ordering::SeqCst);
        let shutdown = CancellationToken::new();
        let (dispatcher, _tasks) = Dispatcher::start(vec![(sink.clone() as Arc<dyn Sink>, policy(5))], 10, shutdown.clone());

        dispatcher.dispatch(batch(0, 2));
        wait_for(|| dispatcher.pending_events() == 0).await;
        dispatcher.dispatch(batch(1, 4));

        let metrics = &dispatcher.sink_metrics()[0];
        assert!(metrics.disabled);
        assert_eq!(metrics.dropped_permanent, 6);
        assert_eq!(metrics.attempts, 1);

        sink.permanent.store(false, Ordering::SeqCst);
        assert!(dispatcher.reenable("scripted"));
        dispatcher.dispatch(batch(2, 1));
        wait_for(|| dispatcher.pending_events() == 0).await;
        assert_eq!(*sink.delivered.lock().unwrap(), vec![2]);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_sink_does_not_hold_back_others() {
        let broken = Arc::new(ScriptedSink::default());
        broken.down.store(true, Ordering::SeqCst);
        let healthy = Arc::new(ScriptedSink::default());
        let shutdown = CancellationToken::new();
        let (dispatcher, _tasks) = Dispatcher::start(
            vec![
                (broken.clone() as Arc<dyn Sink>, policy(3)),
                (healthy.clone() as Arc<dyn Sink>, policy(3)),
            ],
            10,
            shutdown.clone(),
        );

        for sequence in 0..3 {
            dispatcher.dispatch(batch(sequence, 1));
        }
        wait_for(|| healthy.delivered.lock().unwrap().len() == 3).await;

        assert_eq!(*healthy.delivered.lock().unwrap(), vec![0, 1, 2]);
        assert!(broken.delivered.lock().unwrap().is_empty());
        shutdown.cancel();
    }
}
