//! Shared data model and provider abstraction for the agent turn engine.
//!
//! This crate has no knowledge of any concrete LLM wire protocol and no
//! knowledge of the scheduler/chat machinery built on top of it
//! (`dbagent-agent`). It exists so the three provider crates and the
//! agent crate share one vocabulary without depending on each other.

pub mod content;
pub mod error;
pub mod events;
pub mod provider;
pub mod telemetry;
pub mod tool;
pub mod usage;

pub use content::{Content, Part, Role};
pub use error::AgentError;
pub use events::{AbortSignal, TurnEvent};
pub use provider::{ModelProvider, StreamChunk};
pub use tool::{FunctionTool, ParameterProperty, ParametersSchema, ToolCall, ToolSpec};
pub use usage::{CostSummary, ModelTotals, PricingTable, TokenStatistics, TokenUsageRecord};
