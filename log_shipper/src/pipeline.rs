//! Pipeline handle: the producer-facing entry point that owns the batcher,
//! the dispatcher and their background tasks.

use crate::buffer::{BatchAccumulator, Batcher, FlushRequest};
use crate::config::{Config, SinkKind};
use crate::dispatcher::Dispatcher;
use crate::enricher::{self, Enricher, EnricherChain};
use crate::errors::{Result, ShipperError};
use crate::event::{ExceptionInfo, LogEvent, LogLevel};
use crate::filter::LevelFilter;
use crate::index::IndexTemplate;
use crate::metrics::{PipelineMetrics, PipelineMetricsSnapshot, SinkMetricsSnapshot};
use crate::remote::{RemoteSink, RemoteSinkConfig};
use crate::retry::RetryPolicy;
use crate::sink::{LineSink, Sink};
use crate::transport::BasicAuth;

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const IDLE_POLL: Duration = Duration::from_millis(10);
const MIN_STATS_PERIOD: Duration = Duration::from_millis(100);

/// Anything events can be written to. The level helpers all funnel into
/// [`LogEmitter::write`].
pub trait LogEmitter {
    fn write(&self, event: LogEvent);

    fn emit(
        &self,
        level: LogLevel,
        template: &str,
        args: Vec<(String, Value)>,
        exception: Option<ExceptionInfo>,
    ) {
        let mut event = LogEvent::new(level, template).with_args(args);
        event.exception = exception;
        self.write(event);
    }

    fn trace(&self, template: &str, args: Vec<(String, Value)>) {
        self.emit(LogLevel::Trace, template, args, None);
    }

    fn debug(&self, template: &str, args: Vec<(String, Value)>) {
        self.emit(LogLevel::Debug, template, args, None);
    }

    fn information(&self, template: &str, args: Vec<(String, Value)>) {
        self.emit(LogLevel::Information, template, args, None);
    }

    fn warning(&self, template: &str, args: Vec<(String, Value)>) {
        self.emit(LogLevel::Warning, template, args, None);
    }

    fn error(&self, template: &str, args: Vec<(String, Value)>, exception: Option<ExceptionInfo>) {
        self.emit(LogLevel::Error, template, args, exception);
    }

    fn fatal(&self, template: &str, args: Vec<(String, Value)>, exception: Option<ExceptionInfo>) {
        self.emit(LogLevel::Fatal, template, args, exception);
    }
}

/// Point-in-time view of the whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub pipeline_id: String,
    pub pipeline: PipelineMetricsSnapshot,
    pub sinks: Vec<SinkMetricsSnapshot>,
}

impl PipelineStats {
    pub fn sink(&self, name: &str) -> Option<&SinkMetricsSnapshot> {
        self.sinks.iter().find(|sink| sink.name == name)
    }

    pub fn events_pending(&self) -> u64 {
        self.sinks.iter().map(SinkMetricsSnapshot::events_pending).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// False when the grace period ran out and work was abandoned
    pub completed_within_grace: bool,
    pub elapsed: Duration,
    pub stats: PipelineStats,
}

struct BackgroundTasks {
    batcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

struct PipelineInner {
    pipeline_id: String,
    filter: LevelFilter,
    enrichers: EnricherChain,
    events: mpsc::Sender<Arc<LogEvent>>,
    flush_requests: mpsc::Sender<FlushRequest>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<PipelineMetrics>,
    closed: AtomicBool,
    batcher_shutdown: CancellationToken,
    worker_shutdown: CancellationToken,
    tasks: Mutex<Option<BackgroundTasks>>,
    shutdown_grace: Duration,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        // dropped without shutdown(): stop the background tasks, best effort
        self.batcher_shutdown.cancel();
        self.worker_shutdown.cancel();
    }
}

/// Cheaply cloneable handle shared by every producer.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("pipeline_id", &self.inner.pipeline_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Pipeline {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn id(&self) -> &str {
        &self.inner.pipeline_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Logger whose events carry `source_context` unless they set their own.
    pub fn for_context(&self, source_context: impl Into<String>) -> ContextLogger {
        ContextLogger {
            pipeline: self.clone(),
            source_context: source_context.into(),
        }
    }

    /// Seal the open batch and wait until every sink has settled what it was
    /// given. Returns false if that did not happen within `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (request, done) = oneshot::channel();

        match timeout_at(deadline, self.inner.flush_requests.send(request)).await {
            Ok(Ok(())) => {
                if !matches!(timeout_at(deadline, done).await, Ok(Ok(()))) {
                    return false;
                }
            }
            // batcher already gone, nothing can be sealed any more
            Ok(Err(_)) => {}
            Err(_) => return false,
        }

        self.wait_until_settled(deadline).await
    }

    async fn wait_until_settled(&self, deadline: Instant) -> bool {
        loop {
            if self.inner.dispatcher.pending_events() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(IDLE_POLL).await;
        }
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            pipeline_id: self.inner.pipeline_id.clone(),
            pipeline: self
                .inner
                .metrics
                .snapshot(self.inner.enrichers.failure_count()),
            sinks: self.inner.dispatcher.sink_metrics(),
        }
    }

    /// Batch sequences waiting for `sink`, oldest first.
    pub fn queued_batches(&self, sink: &str) -> Option<Vec<u64>> {
        self.inner.dispatcher.queued_sequences(sink)
    }

    /// Make a sink that failed permanently eligible for delivery again.
    pub fn reenable_sink(&self, sink: &str) -> bool {
        self.inner.dispatcher.reenable(sink)
    }

    /// Log a stats line every `period` (at least 100 ms) until shutdown starts.
    pub fn spawn_stats_reporter(&self, period: Duration) -> JoinHandle<()> {
        let pipeline = self.clone();
        let stop = self.inner.batcher_shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period.max(MIN_STATS_PERIOD));
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = pipeline.stats();
                        info!(
                            "Pipeline metrics - Emitted: {}, Filtered: {}, Accepted: {}, Rejected: {}, Pending: {}",
                            stats.pipeline.events_emitted,
                            stats.pipeline.events_filtered,
                            stats.pipeline.events_accepted,
                            stats.pipeline.events_rejected,
                            stats.events_pending()
                        );
                        for sink in &stats.sinks {
                            info!(
                                sink = %sink.name,
                                "Sink metrics - State: {}, Delivered: {}, Dropped: {}, {:.1}% success rate, {} attempts",
                                sink.state,
                                sink.events_delivered,
                                sink.events_dropped(),
                                sink.success_rate(),
                                sink.attempts
                            );
                        }
                    }
                }
            }
        })
    }

    /// Stop accepting events, drain the batcher, and give the sinks until the
    /// grace period ends to deliver. Whatever is still pending then is dropped.
    #[instrument(skip(self), fields(pipeline_id = %self.inner.pipeline_id))]
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let already_closed = self.inner.closed.swap(true, Ordering::AcqRel);
        let tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(mut tasks) = tasks else {
            debug!(already_closed, "Shutdown requested again, nothing left to stop");
            return ShutdownReport {
                completed_within_grace: true,
                elapsed: started.elapsed(),
                stats: self.stats(),
            };
        };

        info!(
            "Shutting down pipeline {} with a {:?} grace period",
            self.inner.pipeline_id, self.inner.shutdown_grace
        );
        let deadline = started + self.inner.shutdown_grace;
        let mut completed = true;

        self.inner.batcher_shutdown.cancel();
        if timeout_at(deadline, &mut tasks.batcher).await.is_err() {
            tasks.batcher.abort();
            let _ = (&mut tasks.batcher).await;
            let snapshot = self.inner.metrics.snapshot(0);
            let unflushed = snapshot.events_accepted.saturating_sub(snapshot.events_batched);
            warn!("Batcher did not finish in time, dropping {} unflushed events", unflushed);
            self.inner.metrics.record_unflushed(unflushed);
            completed = false;
        }

        self.inner.worker_shutdown.cancel();
        // finished JoinHandles must not be polled again: join once, abort via AbortHandle
        let abort_handles: Vec<_> = tasks.workers.iter().map(JoinHandle::abort_handle).collect();
        let mut workers = futures::future::join_all(tasks.workers);
        if timeout_at(deadline, &mut workers).await.is_err() {
            for handle in &abort_handles {
                handle.abort();
            }
            workers.await;
            self.inner.dispatcher.abandon_pending();
            completed = false;
        }

        let report = ShutdownReport {
            completed_within_grace: completed,
            elapsed: started.elapsed(),
            stats: self.stats(),
        };

        for sink in &report.stats.sinks {
            info!(
                sink = %sink.name,
                "Final sink metrics - Delivered: {}, Dropped: {}, Attempts: {}",
                sink.events_delivered,
                sink.events_dropped(),
                sink.attempts
            );
        }
        info!(
            completed = report.completed_within_grace,
            "Pipeline shutdown complete in {:?}", report.elapsed
        );
        report
    }
}

impl LogEmitter for Pipeline {
    /// Filter, enrich and enqueue. Never blocks; a full channel rejects the event.
    fn write(&self, event: LogEvent) {
        let inner = &self.inner;
        inner.metrics.record_emitted();

        if !inner.filter.is_enabled(event.level, event.source_context.as_deref()) {
            inner.metrics.record_filtered();
            return;
        }

        if self.is_closed() {
            inner.metrics.record_rejected();
            return;
        }

        let event = inner.enrichers.enrich(event);
        match inner.events.try_send(Arc::new(event)) {
            Ok(()) => inner.metrics.record_accepted(),
            Err(mpsc::error::TrySendError::Full(_)) => {
                inner.metrics.record_rejected();
                debug!("Ingestion channel full, event rejected");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => inner.metrics.record_rejected(),
        }
    }
}

/// Logger bound to a source context, as returned by [`Pipeline::for_context`].
#[derive(Debug, Clone)]
pub struct ContextLogger {
    pipeline: Pipeline,
    source_context: String,
}

impl ContextLogger {
    pub fn source_context(&self) -> &str {
        &self.source_context
    }
}

impl LogEmitter for ContextLogger {
    fn write(&self, mut event: LogEvent) {
        if event.source_context.is_none() {
            event.source_context = Some(self.source_context.clone());
        }
        self.pipeline.write(event);
    }
}

/// Assembles a [`Pipeline`] from configuration plus programmatic sinks and enrichers.
pub struct PipelineBuilder {
    config: Config,
    configured_sinks: bool,
    sinks: Vec<(Arc<dyn Sink>, RetryPolicy)>,
    enrichers: Option<EnricherChain>,
    extra_enrichers: Vec<Enricher>,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            configured_sinks: true,
            sinks: Vec::new(),
            enrichers: None,
            extra_enrichers: Vec::new(),
        }
    }

    /// Add a sink next to the ones named in the configuration.
    pub fn sink(mut self, sink: Arc<dyn Sink>, policy: RetryPolicy) -> Self {
        self.sinks.push((sink, policy));
        self
    }

    /// Only use sinks added through [`PipelineBuilder::sink`].
    pub fn without_configured_sinks(mut self) -> Self {
        self.configured_sinks = false;
        self
    }

    /// Replace the default enricher chain.
    pub fn enrichers(mut self, chain: EnricherChain) -> Self {
        self.enrichers = Some(chain);
        self
    }

    /// Append an enricher after the default (or replaced) chain.
    pub fn enricher(mut self, enricher: Enricher) -> Self {
        self.extra_enrichers.push(enricher);
        self
    }

    /// Spawn the background tasks. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<Pipeline> {
        let config = self.config;
        if self.configured_sinks {
            config.validate().map_err(ShipperError::Config)?;
        } else {
            config.validate_pipeline().map_err(ShipperError::Config)?;
        }

        let mut sinks = Vec::new();
        if self.configured_sinks {
            for sink_config in &config.sinks {
                let sink: Arc<dyn Sink> = match &sink_config.kind {
                    SinkKind::Console => Arc::new(LineSink::console()),
                    SinkKind::Debug => Arc::new(LineSink::debug()),
                    SinkKind::Remote(remote) => Arc::new(RemoteSink::new(RemoteSinkConfig {
                        endpoint: remote.endpoint.clone(),
                        index_template: IndexTemplate::parse(&remote.index_template)?,
                        application: config.application.clone(),
                        environment: config.environment.clone(),
                        http_timeout: remote.http_timeout,
                        max_event_bytes: remote.max_event_bytes,
                        auth: remote.username.clone().map(|username| BasicAuth {
                            username,
                            password: remote.password.clone(),
                        }),
                    })?),
                };
                sinks.push((sink, sink_config.retry.clone()));
            }
        }
        sinks.extend(self.sinks);

        if sinks.is_empty() {
            return Err(ShipperError::Config("at least one sink must be configured".to_string()));
        }
        for (sink, policy) in &sinks {
            policy
                .validate()
                .map_err(|e| ShipperError::Config(format!("{} sink: {}", sink.name(), e)))?;
        }

        let mut chain = self
            .enrichers
            .unwrap_or_else(|| default_enrichers(&config));
        for extra in self.extra_enrichers {
            chain.push(extra);
        }

        let pipeline_id = Uuid::new_v4().to_string();
        let metrics = Arc::new(PipelineMetrics::new());
        let batcher_shutdown = CancellationToken::new();
        let worker_shutdown = CancellationToken::new();

        let sink_names: Vec<String> = sinks.iter().map(|(sink, _)| sink.name().to_string()).collect();
        let (dispatcher, workers) = Dispatcher::start(sinks, config.queue_capacity, worker_shutdown.clone());
        let dispatcher = Arc::new(dispatcher);

        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        let (flush_tx, flush_rx) = mpsc::channel(16);
        let batcher = Batcher {
            events: event_rx,
            flush_requests: flush_rx,
            accumulator: BatchAccumulator::new(config.batch_size, config.batch_max_age),
            dispatcher: Arc::clone(&dispatcher),
            metrics: Arc::clone(&metrics),
            shutdown: batcher_shutdown.clone(),
        };
        let batcher = tokio::spawn(batcher.run());

        info!(
            "Started pipeline {} for {} with sinks [{}] and enrichers [{}]",
            pipeline_id,
            config.application,
            sink_names.join(", "),
            chain.names().join(", ")
        );

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                pipeline_id,
                filter: LevelFilter::new(config.minimum_level, config.level_overrides.clone()),
                enrichers: chain,
                events: event_tx,
                flush_requests: flush_tx,
                dispatcher,
                metrics,
                closed: AtomicBool::new(false),
                batcher_shutdown,
                worker_shutdown,
                tasks: Mutex::new(Some(BackgroundTasks { batcher, workers })),
                shutdown_grace: config.shutdown_grace,
            }),
        })
    }
}

/// Application, environment, machine and exception detail enrichers.
pub fn default_enrichers(config: &Config) -> EnricherChain {
    EnricherChain::new()
        .with(enricher::property("Application", config.application.clone()))
        .with(enricher::environment(
            config.environment_variable.clone(),
            Some(config.environment.clone()),
        ))
        .with(enricher::machine_name())
        .with(enricher::process_id())
        .with(enricher::thread_id())
        .with(enricher::exception_details())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SinkError;
    use crate::event::{LogBatch, arg};
    use crate::sink::DispatchResult;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Acknowledges every batch after `latency`.
    struct SlowSink {
        name: &'static str,
        latency: Duration,
        events: AtomicUsize,
    }

    impl SlowSink {
        fn new(name: &'static str, latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                name,
                latency,
                events: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Sink for SlowSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, batch: &LogBatch) -> std::result::Result<DispatchResult, SinkError> {
            sleep(self.latency).await;
            self.events.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(DispatchResult::acknowledged(batch.len()))
        }
    }

    fn config() -> Config {
        Config {
            batch_size: 100,
            batch_max_age: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(2),
            ..Config::default()
        }
    }

    fn pipeline(config: Config, sinks: Vec<Arc<SlowSink>>) -> Pipeline {
        let mut builder = Pipeline::builder(config)
            .without_configured_sinks()
            .enrichers(EnricherChain::new().with(enricher::property("Application", "orders")));
        for sink in sinks {
            builder = builder.sink(sink, RetryPolicy::default());
        }
        builder.build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_delivers_open_batch() {
        let sink = SlowSink::new("memory", Duration::ZERO);
        let pipeline = pipeline(config(), vec![Arc::clone(&sink)]);

        for i in 0..5 {
            pipeline.information("Processed order {OrderId}", vec![arg("OrderId", i)]);
        }
        assert!(pipeline.flush(Duration::from_secs(1)).await);

        assert_eq!(sink.events.load(Ordering::SeqCst), 5);
        let stats = pipeline.stats();
        assert_eq!(stats.pipeline.events_accepted, 5);
        assert_eq!(stats.pipeline.batches_sealed, 1);
        assert_eq!(stats.sink("memory").unwrap().events_delivered, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_is_delivered_without_flush() {
        let sink = SlowSink::new("memory", Duration::ZERO);
        let mut config = config();
        config.batch_size = 5;
        let pipeline = pipeline(config, vec![Arc::clone(&sink)]);

        for i in 0..5 {
            pipeline.information("Processed order {OrderId}", vec![arg("OrderId", i)]);
        }
        sleep(Duration::from_millis(50)).await;

        assert_eq!(sink.events.load(Ordering::SeqCst), 5);
        assert_eq!(pipeline.stats().pipeline.batches_sealed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_batch_is_delivered_once_it_ages() {
        let sink = SlowSink::new("memory", Duration::ZERO);
        let mut config = config();
        config.batch_max_age = Duration::from_secs(1);
        let pipeline = pipeline(config, vec![Arc::clone(&sink)]);

        pipeline.information("Order placed", Vec::new());

        sleep(Duration::from_millis(900)).await;
        assert_eq!(sink.events.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.events.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.stats().sink("memory").unwrap().events_delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_reporter_accepts_zero_period() {
        let sink = SlowSink::new("memory", Duration::ZERO);
        let pipeline = pipeline(config(), vec![Arc::clone(&sink)]);

        let reporter = pipeline.spawn_stats_reporter(Duration::ZERO);
        sleep(Duration::from_secs(1)).await;
        pipeline.shutdown().await;

        reporter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_events_never_reach_sinks() {
        let sink = SlowSink::new("memory", Duration::ZERO);
        let mut config = config();
        config.minimum_level = LogLevel::Information;
        config.level_overrides = vec![("Microsoft".to_string(), LogLevel::Warning)];
        let pipeline = pipeline(config, vec![Arc::clone(&sink)]);

        pipeline.debug("Cache miss", Vec::new());
        let framework = pipeline.for_context("Microsoft.AspNetCore.Routing");
        framework.information("Request matched endpoint", Vec::new());
        framework.warning("Slow endpoint", Vec::new());
        pipeline.information("Order placed", Vec::new());

        assert!(pipeline.flush(Duration::from_secs(1)).await);
        let stats = pipeline.stats();
        assert_eq!(stats.pipeline.events_emitted, 4);
        assert_eq!(stats.pipeline.events_filtered, 2);
        assert_eq!(sink.events.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_fast_sink_and_abandons_slow_one() {
        let fast = SlowSink::new("fast", Duration::from_secs(1));
        let slow = SlowSink::new("slow", Duration::from_secs(5));
        let pipeline = pipeline(config(), vec![Arc::clone(&fast), Arc::clone(&slow)]);

        pipeline.information("Shutting down", Vec::new());
        let report = pipeline.shutdown().await;

        assert!(!report.completed_within_grace);
        assert!(report.elapsed >= Duration::from_secs(2));
        assert!(report.elapsed < Duration::from_secs(3));

        let fast_stats = report.stats.sink("fast").unwrap();
        assert_eq!(fast_stats.events_delivered, 1);
        assert_eq!(fast_stats.events_dropped(), 0);

        let slow_stats = report.stats.sink("slow").unwrap();
        assert_eq!(slow_stats.events_delivered, 0);
        assert_eq!(slow_stats.dropped_shutdown, 1);
        assert_eq!(slow_stats.events_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_joins_workers_that_finished_at_different_times() {
        let sinks = vec![
            SlowSink::new("instant", Duration::ZERO),
            SlowSink::new("fast", Duration::from_millis(500)),
            SlowSink::new("stuck", Duration::from_secs(30)),
        ];
        let pipeline = pipeline(config(), sinks.clone());

        pipeline.information("Shutting down", Vec::new());
        let report = pipeline.shutdown().await;

        assert!(!report.completed_within_grace);
        assert_eq!(sinks[0].events.load(Ordering::SeqCst), 1);
        assert_eq!(sinks[1].events.load(Ordering::SeqCst), 1);
        assert_eq!(sinks[2].events.load(Ordering::SeqCst), 0);
        assert_eq!(report.stats.sink("stuck").unwrap().dropped_shutdown, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_after_shutdown_is_rejected() {
        let sink = SlowSink::new("memory", Duration::ZERO);
        let pipeline = pipeline(config(), vec![Arc::clone(&sink)]);

        let report = pipeline.shutdown().await;
        assert!(report.completed_within_grace);

        pipeline.information("Too late", Vec::new());
        let stats = pipeline.stats();
        assert_eq!(stats.pipeline.events_rejected, 1);
        assert_eq!(stats.pipeline.events_accepted, 0);
        assert!(pipeline.shutdown().await.completed_within_grace);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_event_is_accounted_for() {
        let sink = SlowSink::new("memory", Duration::from_millis(10));
        let mut config = config();
        config.batch_size = 7;
        let pipeline = pipeline(config, vec![Arc::clone(&sink)]);

        let producers: Vec<_> = (0..4)
            .map(|producer| {
                let logger = pipeline.for_context(format!("Orders.Worker{}", producer));
                tokio::spawn(async move {
                    for i in 0..25 {
                        logger.information("Item {Index}", vec![arg("Index", i)]);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let report = pipeline.shutdown().await;
        let pipeline_stats = &report.stats.pipeline;
        assert_eq!(pipeline_stats.events_emitted, 100);
        assert_eq!(pipeline_stats.events_accepted, 100);
        assert_eq!(pipeline_stats.events_batched, 100);

        let memory = report.stats.sink("memory").unwrap();
        assert_eq!(memory.events_dispatched, 100);
        assert_eq!(memory.events_delivered + memory.events_dropped(), 100);
        assert_eq!(sink.events.load(Ordering::SeqCst) as u64, memory.events_delivered);
    }
}
