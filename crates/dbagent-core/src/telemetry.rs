//! Structured telemetry sinks.
//!
//! The agent crate emits one [`TelemetryEvent`] per significant lifecycle
//! moment (turn start/end, tool call transition, compression, provider
//! retry) alongside `tracing` spans. `TelemetrySink` is a separate, explicit
//! subscriber interface so a caller can capture structured events (for a UI,
//! for billing) without scraping `tracing`'s text output.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use time::OffsetDateTime;

/// Severity, mirroring `tracing::Level` so sinks can filter without pulling
/// in the `tracing` crate themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured telemetry record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub level: TelemetryLevel,
    /// Dotted event name, e.g. `"turn.start"`, `"tool_call.transition"`.
    pub name: String,
    pub session_id: String,
    /// Free-form structured payload specific to `name`.
    pub fields: Value,
}

impl TelemetryEvent {
    pub fn new(level: TelemetryLevel, name: impl Into<String>, session_id: impl Into<String>, fields: Value) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            level,
            name: name.into(),
            session_id: session_id.into(),
            fields,
        }
    }
}

/// A destination for telemetry events. Implementations must not block the
/// caller for long; the agent crate calls sinks synchronously from inside
/// async code on the assumption emission is cheap, the same way `tracing`
/// events are fire-and-forget.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &TelemetryEvent);

    /// Minimum level this sink cares about; events below it are dropped
    /// before `emit` is called.
    fn min_level(&self) -> TelemetryLevel {
        TelemetryLevel::Info
    }
}

/// Writes events as single-line JSON to stdout. Useful in development and
/// as the default when no sink is configured.
pub struct StdoutSink {
    min_level: TelemetryLevel,
}

impl StdoutSink {
    pub fn new(min_level: TelemetryLevel) -> Self {
        Self { min_level }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new(TelemetryLevel::Info)
    }
}

impl TelemetrySink for StdoutSink {
    fn emit(&self, event: &TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{line}");
        }
    }

    fn min_level(&self) -> TelemetryLevel {
        self.min_level
    }
}

/// Appends newline-delimited JSON to a file, for durable session audit
/// trails, without this crate taking on a database dependency of its own.
pub struct NdjsonFileSink {
    file: Mutex<std::fs::File>,
    min_level: TelemetryLevel,
}

impl NdjsonFileSink {
    pub fn open(path: impl AsRef<Path>, min_level: TelemetryLevel) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            min_level,
        })
    }
}

impl TelemetrySink for NdjsonFileSink {
    fn emit(&self, event: &TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            if let Ok(mut file) = self.file.lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn min_level(&self) -> TelemetryLevel {
        self.min_level
    }
}

/// Fans one event out to every configured sink, dropping events a sink's
/// `min_level` excludes.
#[derive(Default)]
pub struct TelemetryHub {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl TelemetryHub {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add_sink(&mut self, sink: Box<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn emit(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            if event.level >= sink.min_level() {
                sink.emit(&event);
            }
        }
    }
}
