//! In-memory batching of sealed log events

use crate::dispatcher::Dispatcher;
use crate::event::{FlushTrigger, LogBatch, LogEvent};
use crate::metrics::PipelineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound on the up-front allocation for an open batch.
const PREALLOCATE_LIMIT: usize = 1024;

/// Open batch that seals on size or age, whichever comes first.
#[derive(Debug)]
pub struct BatchAccumulator {
    events: Vec<Arc<LogEvent>>,
    opened_at: Option<Instant>,
    max_events: usize,
    max_age: Duration,
    next_sequence: u64,
}

impl BatchAccumulator {
    pub fn new(max_events: usize, max_age: Duration) -> Self {
        Self {
            events: Vec::with_capacity(max_events.min(PREALLOCATE_LIMIT)),
            opened_at: None,
            max_events: max_events.max(1),
            max_age,
            next_sequence: 0,
        }
    }

    /// Add an event; returns the sealed batch when it reached the size limit.
    pub fn push(&mut self, event: Arc<LogEvent>, now: Instant) -> Option<LogBatch> {
        if self.events.is_empty() {
            self.opened_at = Some(now);
        }
        self.events.push(event);

        if self.events.len() >= self.max_events {
            return self.seal(FlushTrigger::Size);
        }
        None
    }

    /// When the open batch becomes due by age.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|opened| opened + self.max_age)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Seal whatever is open. An empty accumulator yields nothing.
    pub fn seal(&mut self, trigger: FlushTrigger) -> Option<LogBatch> {
        if self.events.is_empty() {
            return None;
        }

        let fresh = Vec::with_capacity(self.max_events.min(PREALLOCATE_LIMIT));
        let events = std::mem::replace(&mut self.events, fresh);
        self.opened_at = None;
        let batch = LogBatch::new(events, self.next_sequence, trigger);
        self.next_sequence += 1;
        Some(batch)
    }
}

/// Request to seal the open batch; answered once it has been handed to the dispatcher.
pub(crate) type FlushRequest = oneshot::Sender<()>;

/// Background side of the buffer: owns the accumulator and feeds the dispatcher.
pub(crate) struct Batcher {
    pub(crate) events: mpsc::Receiver<Arc<LogEvent>>,
    pub(crate) flush_requests: mpsc::Receiver<FlushRequest>,
    pub(crate) accumulator: BatchAccumulator,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) metrics: Arc<PipelineMetrics>,
    pub(crate) shutdown: CancellationToken,
}

impl Batcher {
    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.accumulator.deadline();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                received = self.events.recv() => match received {
                    Some(event) => {
                        if let Some(batch) = self.accumulator.push(event, Instant::now()) {
                            self.hand_off(batch);
                        }
                    }
                    None => break,
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(batch) = self.accumulator.seal(FlushTrigger::Age) {
                        self.hand_off(batch);
                    }
                }

                Some(request) = self.flush_requests.recv() => {
                    self.drain_pending();
                    if let Some(batch) = self.accumulator.seal(FlushTrigger::Forced) {
                        self.hand_off(batch);
                    }
                    let _ = request.send(());
                }
            }
        }

        // producers are closed by now, take whatever made it into the channel
        self.events.close();
        self.drain_pending();
        if let Some(batch) = self.accumulator.seal(FlushTrigger::Forced) {
            self.hand_off(batch);
        }
        debug!("Batcher stopped");
    }

    fn drain_pending(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let Some(batch) = self.accumulator.push(event, Instant::now()) {
                self.hand_off(batch);
            }
        }
    }

    fn hand_off(&self, batch: LogBatch) {
        debug!(
            "Sealed batch {} (#{}) with {} events, trigger {:?}",
            batch.metadata.batch_id,
            batch.metadata.sequence,
            batch.len(),
            batch.metadata.trigger
        );
        self.metrics.record_sealed(batch.len());
        self.dispatcher.dispatch(batch);
    }
}
