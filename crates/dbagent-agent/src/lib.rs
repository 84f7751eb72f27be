//! Turn loop, tool scheduler, chat history, and next-speaker arbiter for the
//! conversational database agent, built on top of the pure data model in
//! `dbagent-core` and the pure risk axes in `dbagent-risk`.

pub mod arbiter;
pub mod chat;
pub mod client;
pub mod config;
pub mod registry;
pub mod scheduler;
pub mod tools;
pub mod turn;

pub use arbiter::{decide_next_speaker, NextSpeaker, NextSpeakerDecision};
pub use chat::{Chat, CompressionConfig, CompressionOutcome, RetryConfig, SimpleTokenEstimator, TokenEstimator};
pub use config::{AgentConfig, DebugLevel};
pub use client::{Client, ClientConfig, PairingStrictness};
pub use registry::{FunctionTool, ToolRegistry, ToolResult};
pub use scheduler::{SchedulerObserver, ToolCallRequest, ToolScheduler};
pub use tools::{SchemaCatalog, SchemaDiscoveryTool, SqlExecuteTool, SqlExecutor};
pub use turn::{run_turn, TurnOutcome};
