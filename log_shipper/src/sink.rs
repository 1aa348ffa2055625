//! Sink abstraction and the line oriented console/debug sinks

use crate::errors::SinkError;
use crate::event::{LogBatch, LogEvent};
use crate::metrics::DropReason;
use async_trait::async_trait;
use chrono::SecondsFormat;
use std::io::Write;
use std::sync::{Arc, Mutex};

/// Outcome of one delivery attempt that reached the destination.
///
/// Positions refer to `LogBatch::events` of the attempted batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchResult {
    pub acknowledged: usize,
    pub retryable: Vec<usize>,
    pub dropped: Vec<(usize, DropReason)>,
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn acknowledged(count: usize) -> Self {
        Self {
            acknowledged: count,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.retryable.is_empty()
    }
}

/// A destination for sealed batches. Each sink gets its own worker, so
/// `send` is never called concurrently for the same sink.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, batch: &LogBatch) -> Result<DispatchResult, SinkError>;

    /// Lightweight reachability check used while the circuit is open.
    async fn probe(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
    /// `[12:00:00 INF] message`
    Compact,
    /// timestamp, level, source context, message, properties and exception
    Verbose,
}

/// Writes one human readable line per event. Write errors are permanent:
/// a closed stream does not come back.
///
/// Lines are rendered on the worker, the blocking write runs on Tokio's
/// blocking pool.
pub struct LineSink {
    name: String,
    format: LineFormat,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LineSink {
    pub fn new(name: impl Into<String>, format: LineFormat, writer: Box<dyn Write + Send>) -> Self {
        Self {
            name: name.into(),
            format,
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn console() -> Self {
        Self::new("console", LineFormat::Compact, Box::new(std::io::stdout()))
    }

    pub fn debug() -> Self {
        Self::new("debug", LineFormat::Verbose, Box::new(std::io::stderr()))
    }

    async fn write_batch(&self, batch: &LogBatch) -> std::io::Result<()> {
        let mut text = String::new();
        for event in &batch.events {
            text.push_str(&render_line(event, self.format));
            text.push('\n');
        }

        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| std::io::Error::other("writer lock poisoned"))?;
            writer.write_all(text.as_bytes())?;
            writer.flush()
        })
        .await
        .map_err(std::io::Error::other)?
    }
}

#[async_trait]
impl Sink for LineSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &LogBatch) -> Result<DispatchResult, SinkError> {
        self.write_batch(batch)
            .await
            .map_err(|e| SinkError::Permanent(format!("{} stream failed: {}", self.name, e)))?;
        Ok(DispatchResult::acknowledged(batch.len()))
    }
}

pub fn render_line(event: &LogEvent, format: LineFormat) -> String {
    let message = event.render_message();
    let mut line = match format {
        LineFormat::Compact => format!(
            "[{} {}] {}",
            event.timestamp.format("%H:%M:%S"),
            event.level.short_name(),
            message
        ),
        LineFormat::Verbose => {
            let context = event.source_context.as_deref().unwrap_or("-");
            let mut properties: Vec<_> = event.flattened_fields().into_iter().collect();
            properties.sort_by(|a, b| a.0.cmp(&b.0));
            let properties: serde_json::Map<_, _> = properties.into_iter().collect();
            format!(
                "{} [{}] {}: {} {}",
                event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                event.level.short_name(),
                context,
                message,
                serde_json::Value::Object(properties)
            )
        }
    };

    if let Some(exception) = &event.exception {
        line.push_str(" | ");
        line.push_str(&exception.summary());
    }

    // one line per event, whatever the message contains
    line.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ExceptionInfo, FlushTrigger, LogLevel};
    use chrono::{TimeZone, Utc};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ClosedStream;

    impl Write for ClosedStream {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Remembers which thread performed the write.
    struct ThreadRecorder(Arc<Mutex<Option<std::thread::ThreadId>>>);

    impl Write for ThreadRecorder {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            *self.0.lock().unwrap() = Some(std::thread::current().id());
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn sample_event() -> LogEvent {
        LogEvent::new(LogLevel::Warning, "Slow request to {Path}")
            .with_arg("Path", "/weatherforecast")
            .with_timestamp(Utc.with_ymd_and_hms(2023, 3, 1, 12, 30, 5).unwrap())
            .with_source_context("WeatherApi.Controllers")
            .with_property("Environment", "Production")
    }

    #[test]
    fn test_compact_line() {
        let line = render_line(&sample_event(), LineFormat::Compact);
        assert_eq!(line, "[12:30:05 WRN] Slow request to /weatherforecast");
    }

    #[test]
    fn test_verbose_line_includes_context_and_properties() {
        let event = sample_event().with_exception(ExceptionInfo::new("TimeoutError", "took\ntoo long"));
        let line = render_line(&event, LineFormat::Verbose);
        assert_eq!(
            line,
            "2023-03-01T12:30:05.000Z [WRN] WeatherApi.Controllers: Slow request to /weatherforecast \
             {\"Environment\":\"Production\",\"Path\":\"/weatherforecast\"} | TimeoutError: took too long"
        );
    }

    #[tokio::test]
    async fn test_line_sink_writes_one_line_per_event() {
        let buffer = SharedBuffer::default();
        let sink = LineSink::new("console", LineFormat::Compact, Box::new(buffer.clone()));
        let batch = LogBatch::new(
            vec![Arc::new(sample_event()), Arc::new(sample_event())],
            0,
            FlushTrigger::Size,
        );

        let result = sink.send(&batch).await.unwrap();
        assert_eq!(result, DispatchResult::acknowledged(2));
        assert!(result.is_success());

        let written = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert_eq!(written.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_closed_stream_is_permanent() {
        let sink = LineSink::new("debug", LineFormat::Verbose, Box::new(ClosedStream));
        let batch = LogBatch::new(vec![Arc::new(sample_event())], 0, FlushTrigger::Forced);

        let error = sink.send(&batch).await.unwrap_err();
        assert!(matches!(error, SinkError::Permanent(_)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_write_runs_off_the_worker_thread() {
        let worker = std::thread::current().id();
        let writer_thread = Arc::new(Mutex::new(None));
        let sink = LineSink::new(
            "console",
            LineFormat::Compact,
            Box::new(ThreadRecorder(Arc::clone(&writer_thread))),
        );
        let batch = LogBatch::new(vec![Arc::new(sample_event())], 0, FlushTrigger::Size);

        sink.send(&batch).await.unwrap();

        let recorded = writer_thread.lock().unwrap().expect("writer was called");
        assert_ne!(recorded, worker);
    }
}
