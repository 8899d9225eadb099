//! Structured log capture and subscriber setup.
//!
//! [`LogCapture`] is a `tracing_subscriber` layer that turns every event into a
//! [`LogEntry`] on a broadcast channel, so a node can ship or inspect its own
//! protocol logs. [`init`] installs the usual `fmt` output filtered by an
//! `EnvFilter` directive, with the capture layer alongside.

use crate::error::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const DEFAULT_LOG_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::TRACE => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(name)
    }
}

/// Structured log entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub level: LogLevel,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, target: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            level,
            target: target.into(),
            message: String::new(),
            fields: BTreeMap::new(),
            error: None,
        }
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    fn add_field(&mut self, key: &str, value: serde_json::Value) {
        self.fields.insert(key.to_string(), value);
    }
}

struct FieldVisitor<'a> {
    entry: &'a mut LogEntry,
}

impl Visit for FieldVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.entry.message = rendered;
        } else {
            self.entry.add_field(field.name(), rendered.into());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.entry.message = value.to_string();
        } else {
            self.entry.add_field(field.name(), value.into());
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.entry.add_field(field.name(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.entry.add_field(field.name(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.entry.add_field(field.name(), value.into());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        if field.name() == "error" {
            self.entry.error = Some(value.to_string());
        } else {
            self.entry.add_field(field.name(), value.to_string().into());
        }
    }
}

/// Layer that broadcasts each event as a [`LogEntry`].
#[derive(Clone)]
pub struct LogCapture {
    tx: broadcast::Sender<LogEntry>,
}

impl LogCapture {
    pub fn new(buffer: usize) -> (Self, broadcast::Receiver<LogEntry>) {
        let (tx, rx) = broadcast::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}

impl<S: Subscriber> Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut entry = LogEntry::new(metadata.level().into(), metadata.target());
        event.record(&mut FieldVisitor { entry: &mut entry });
        // No receivers is fine.
        let _ = self.tx.send(entry);
    }
}

/// Installs the global subscriber: `fmt` output plus log capture, filtered by `filter`
/// (an `EnvFilter` directive such as `"a2a_core=debug"`).
pub fn init(filter: &str) -> Result<LogCapture> {
    let filter = EnvFilter::try_new(filter).map_err(|e| Error::Config(format!("Invalid log filter: {}", e)))?;
    let (capture, _) = LogCapture::new(DEFAULT_LOG_BUFFER);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(capture.clone())
        .try_init()
        .map_err(|e| Error::Config(format!("Logging already initialized: {}", e)))?;
    Ok(capture)
}
