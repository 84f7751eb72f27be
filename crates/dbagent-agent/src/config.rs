//! Environment-level configuration: one plain struct constructed once,
//! wrapped in `Arc`, and handed to the client for the lifetime of a
//! session.

use serde::{Deserialize, Serialize};

/// Minimum severity a log line or telemetry event must reach to be
/// emitted, matching the `tracing`/`log` level names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DebugLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl Default for DebugLevel {
    fn default() -> Self {
        DebugLevel::Info
    }
}

/// Environment-sourced settings that shape one agent session, independent
/// of any one provider's wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// e.g. `"claude-opus-4"`, `"gpt-4o"`, `"gemini-2.5-pro"` — interpreted
    /// by whichever provider crate the caller wires up, not by this crate.
    pub model: String,
    pub debug_level: DebugLevel,
    pub max_session_turns: usize,
    /// Fraction of the provider's context window that triggers compression;
    /// `None` uses [`crate::chat::CompressionConfig::default`].
    pub compression_threshold_fraction: Option<f64>,
    /// BCP-47 language tag for localized tool display text, e.g. `"en"`,
    /// `"zh-CN"`. Tool implementations consult this directly; the engine
    /// itself is language-agnostic.
    pub language: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            debug_level: DebugLevel::default(),
            max_session_turns: 25,
            compression_threshold_fraction: None,
            language: "en".to_string(),
        }
    }
}

impl AgentConfig {
    /// Reads model selection, debug level, turn/compression limits, and
    /// language tag from the process environment:
    /// `DBAGENT_MODEL`, `DBAGENT_DEBUG_LEVEL`, `DBAGENT_MAX_TURNS`,
    /// `DBAGENT_COMPRESSION_THRESHOLD`, `DBAGENT_LANGUAGE`. Provider API
    /// keys are read directly by each provider crate's own config, not
    /// here, since this crate has no knowledge of which providers are in
    /// use.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(model) = std::env::var("DBAGENT_MODEL") {
            config.model = model;
        }
        if let Ok(level) = std::env::var("DBAGENT_DEBUG_LEVEL") {
            config.debug_level = match level.to_uppercase().as_str() {
                "ERROR" => DebugLevel::Error,
                "WARNING" => DebugLevel::Warning,
                "DEBUG" => DebugLevel::Debug,
                _ => DebugLevel::Info,
            };
        }
        if let Ok(max_turns) = std::env::var("DBAGENT_MAX_TURNS") {
            if let Ok(parsed) = max_turns.parse() {
                config.max_session_turns = parsed;
            }
        }
        if let Ok(threshold) = std::env::var("DBAGENT_COMPRESSION_THRESHOLD") {
            if let Ok(parsed) = threshold.parse() {
                config.compression_threshold_fraction = Some(parsed);
            }
        }
        if let Ok(language) = std::env::var("DBAGENT_LANGUAGE") {
            config.language = language;
        }
        config
    }
}
