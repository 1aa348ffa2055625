//! Log event data structures and utilities

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

/// Enrichment properties attached to an event.
pub type Properties = HashMap<String, Value>;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    /// Strict parse, used where an unknown level is a configuration mistake.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "TRACE" | "VERBOSE" | "TRC" | "VRB" => Some(LogLevel::Trace),
            "DEBUG" | "DBG" => Some(LogLevel::Debug),
            "INFO" | "INFORMATION" | "INF" => Some(LogLevel::Information),
            "WARN" | "WARNING" | "WRN" => Some(LogLevel::Warning),
            "ERROR" | "ERR" => Some(LogLevel::Error),
            "FATAL" | "CRITICAL" | "FTL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    /// Three letter form used by the line sinks.
    pub fn short_name(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRC",
            LogLevel::Debug => "DBG",
            LogLevel::Information => "INF",
            LogLevel::Warning => "WRN",
            LogLevel::Error => "ERR",
            LogLevel::Fatal => "FTL",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "Trace"),
            LogLevel::Debug => write!(f, "Debug"),
            LogLevel::Information => write!(f, "Information"),
            LogLevel::Warning => write!(f, "Warning"),
            LogLevel::Error => write!(f, "Error"),
            LogLevel::Fatal => write!(f, "Fatal"),
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        LogLevel::parse(s).unwrap_or(LogLevel::Information)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StackFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl std::fmt::Display for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{} in {}:{}", self.function, file, line),
            (Some(file), None) => write!(f, "{} in {}", self.function, file),
            _ => write!(f, "{}", self.function),
        }
    }
}

/// Structured capture of an error attached to a log call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    pub stack_frames: Vec<StackFrame>,
    pub inner: Option<Box<ExceptionInfo>>,
}

impl ExceptionInfo {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_frames: Vec::new(),
            inner: None,
        }
    }

    pub fn with_frame(mut self, function: impl Into<String>, file: Option<&str>, line: Option<u32>) -> Self {
        self.stack_frames.push(StackFrame {
            function: function.into(),
            file: file.map(str::to_string),
            line,
        });
        self
    }

    pub fn with_inner(mut self, inner: ExceptionInfo) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Capture an error and its `source()` chain. Sources are type-erased, so
    /// only the outermost error carries a concrete type name.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut info = ExceptionInfo::new(std::any::type_name::<E>(), err.to_string());

        let mut sources = Vec::new();
        let mut current = err.source();
        while let Some(source) = current {
            sources.push(ExceptionInfo::new("source", source.to_string()));
            current = source.source();
        }

        let inner = sources.into_iter().rev().fold(None, |inner: Option<ExceptionInfo>, mut next| {
            next.inner = inner.map(Box::new);
            Some(next)
        });
        info.inner = inner.map(Box::new);
        info
    }

    /// `Type: message` for this exception and every inner one, joined with ` ---> `.
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("{}: {}", self.type_name, self.message)];
        let mut inner = self.inner.as_deref();
        while let Some(exception) = inner {
            parts.push(format!("{}: {}", exception.type_name, exception.message));
            inner = exception.inner.as_deref();
        }
        parts.join(" ---> ")
    }

    pub fn stack_trace(&self) -> String {
        self.stack_frames
            .iter()
            .map(|frame| format!("   at {}", frame))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message_template: String,
    pub args: Vec<(String, Value)>,
    pub exception: Option<ExceptionInfo>,
    pub source_context: Option<String>,
    pub properties: Properties,
}

impl LogEvent {
    pub fn new(level: LogLevel, message_template: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message_template: message_template.into(),
            args: Vec::new(),
            exception: None,
            source_context: None,
            properties: Properties::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push((name.into(), value.into()));
        self
    }

    pub fn with_args(mut self, args: Vec<(String, Value)>) -> Self {
        self.args.extend(args);
        self
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }

    pub fn with_source_context(mut self, source_context: impl Into<String>) -> Self {
        self.source_context = Some(source_context.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.iter().find(|(key, _)| key == name).map(|(_, value)| value)
    }

    /// Render the message template against the bound arguments.
    pub fn render_message(&self) -> String {
        render_template(&self.message_template, &self.args)
    }

    /// Bound arguments first, then enrichment properties for keys not already bound.
    pub fn flattened_fields(&self) -> serde_json::Map<String, Value> {
        let mut fields = serde_json::Map::new();
        for (key, value) in &self.args {
            fields.insert(key.clone(), value.clone());
        }
        for (key, value) in &self.properties {
            if !fields.contains_key(key) {
                fields.insert(key.clone(), value.clone());
            }
        }
        fields
    }
}

/// Shorthand for building a bound argument.
pub fn arg(name: impl Into<String>, value: impl Into<Value>) -> (String, Value) {
    (name.into(), value.into())
}

fn template_regex() -> &'static Regex {
    static HOLE: OnceLock<Regex> = OnceLock::new();
    HOLE.get_or_init(|| {
        Regex::new(r"\{\{|\}\}|\{[@$]?([A-Za-z0-9_]+)(?:,[^:}]*)?(?::[^}]*)?\}")
            .expect("message template pattern is valid")
    })
}

/// Replace `{Name}` holes with bound argument values. Strings are inserted
/// without quotes, holes with no matching argument are left verbatim.
pub fn render_template(template: &str, args: &[(String, Value)]) -> String {
    template_regex()
        .replace_all(template, |caps: &Captures<'_>| {
            let whole = &caps[0];
            match whole {
                "{{" => "{".to_string(),
                "}}" => "}".to_string(),
                _ => {
                    let name = &caps[1];
                    match args.iter().find(|(key, _)| key == name) {
                        Some((_, Value::String(s))) => s.clone(),
                        Some((_, value)) => value.to_string(),
                        None => whole.to_string(),
                    }
                }
            }
        })
        .into_owned()
}

/// Why a batch was sealed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Age,
    Forced,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub batch_id: String,
    pub sequence: u64,
    pub sealed_at: DateTime<Utc>,
    pub trigger: FlushTrigger,
}

/// A sealed, ordered group of events. Events are shared between sinks.
#[derive(Clone, Debug)]
pub struct LogBatch {
    pub events: Vec<Arc<LogEvent>>,
    pub metadata: BatchMetadata,
}

impl LogBatch {
    pub fn new(events: Vec<Arc<LogEvent>>, sequence: u64, trigger: FlushTrigger) -> Self {
        Self {
            events,
            metadata: BatchMetadata {
                batch_id: Uuid::new_v4().to_string(),
                sequence,
                sealed_at: Utc::now(),
                trigger,
            },
        }
    }

    /// Same batch identity restricted to the given event positions, in order.
    pub fn subset(&self, positions: &[usize]) -> Self {
        Self {
            events: positions
                .iter()
                .filter_map(|&i| self.events.get(i).cloned())
                .collect(),
            metadata: self.metadata.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}
