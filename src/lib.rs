//! planex - plan-execute orchestration for tool-using language models
//!
//! A model streams a plan of tool calls, the steps run in order with data
//! threaded between them through `{{stepN.output.path}}` placeholders, failed
//! steps pause for a retry, regenerate or skip decision, and the model finally
//! streams an answer grounded in the results.

pub mod config;
pub mod execution;
pub mod llm;
pub mod planning;
pub mod ui;
pub mod utils;

// Re-export commonly used types and traits
pub use config::{Config, ConfigManager, OrchestrationConfig, ProviderConfig};
pub use execution::{
    ContentProducer, DecisionHandle, LocalToolbox, PendingFailure, RecoveryDecision, ToolError, ToolFacility,
};
pub use llm::{LlmError, LlmProviderFactory, Message, ModelClient, PhaseEvent, PhaseParser};
pub use planning::{DriverState, ExecutionResult, Plan, PlanExecuteDriver, PlanStep, RunReport};
pub use ui::{DriverEvent, FailurePolicy};
pub use utils::errors::{ConfigError, PlanexError};

/// The main result type used throughout the application
pub type Result<T> = std::result::Result<T, PlanexError>;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "planex";
