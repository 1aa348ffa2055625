//! Structured log shipping library
//!
//! Producers emit structured events through a [`Pipeline`]. Events are
//! filtered, enriched, grouped into batches and delivered to every
//! configured sink, each with its own queue, retry policy and circuit state.

pub mod config;
pub mod errors;
pub mod event;
pub mod filter;
pub mod index;
pub mod enricher;
pub mod buffer;
pub mod dispatcher;
pub mod retry;
pub mod metrics;
pub mod sink;
pub mod transport;
pub mod remote;
pub mod pipeline;

pub use config::{Config, RemoteSettings, SinkConfig, SinkKind};
pub use enricher::{Enricher, EnricherChain};
pub use errors::{EnrichmentError, Result, SerializationError, ShipperError, SinkError};
pub use event::{ExceptionInfo, LogBatch, LogEvent, LogLevel, arg};
pub use metrics::{DropReason, PipelineMetricsSnapshot, SinkMetricsSnapshot};
pub use pipeline::{ContextLogger, LogEmitter, Pipeline, PipelineBuilder, PipelineStats, ShutdownReport};
pub use retry::{CircuitState, RetryPolicy};
pub use sink::{DispatchResult, Sink};
