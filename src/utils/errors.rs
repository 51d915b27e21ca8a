//! Error types used throughout the application

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for planex
#[derive(Error, Debug)]
pub enum PlanexError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM provider error: {0}")]
    Llm(#[from] crate::llm::LlmError),

    #[error("Tool error: {0}")]
    Tool(#[from] crate::execution::ToolError),

    #[error("Planning error: {message}")]
    Planning { message: String },

    #[error("Execution error: {message}")]
    Execution { message: String },

    #[error("Run halted at step {step_id}: {reason}")]
    Halted { step_id: String, reason: String },

    #[error("UI error: {message}")]
    Ui { message: String },

    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("File system error: {path}: {source}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Timeout error: operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML serialization/deserialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML serialization/deserialization error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Glob pattern error: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Unknown error: {message}")]
    Unknown { message: String },
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing configuration key: {key}")]
    MissingKey { key: String },

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to read configuration: {source}")]
    ReadError {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write configuration: {source}")]
    WriteError {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {source}")]
    ParseError {
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {source}")]
    SerializeError {
        #[source]
        source: toml::ser::Error,
    },
}

impl PlanexError {
    /// Create a new planning error
    pub fn planning<S: Into<String>>(message: S) -> Self {
        Self::Planning {
            message: message.into(),
        }
    }

    /// Create a new execution error
    pub fn execution<S: Into<String>>(message: S) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Create a new halted error
    pub fn halted<S1: Into<String>, S2: Into<String>>(step_id: S1, reason: S2) -> Self {
        Self::Halted {
            step_id: step_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new UI error
    pub fn ui<S: Into<String>>(message: S) -> Self {
        Self::Ui {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S1: Into<String>, S2: Into<String>>(field: S1, message: S2) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new file system error
    pub fn file_system<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// Create a new not found error
    pub fn not_found<S: Into<String>>(resource: S) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a new cancelled error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a new unknown error
    pub fn unknown<S: Into<String>>(message: S) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Whether this error was caused by the abort signal
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. }
                | Self::Llm(crate::llm::LlmError::Cancelled)
                | Self::Tool(crate::execution::ToolError::Cancelled)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Llm(_) => "llm",
            Self::Tool(_) => "tool",
            Self::Planning { .. } => "planning",
            Self::Execution { .. } => "execution",
            Self::Halted { .. } => "halted",
            Self::Ui { .. } => "ui",
            Self::Validation { .. } => "validation",
            Self::FileSystem { .. } => "filesystem",
            Self::NotFound { .. } => "notfound",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Json(_) => "json",
            Self::Yaml(_) => "yaml",
            Self::Toml(_) => "toml",
            Self::Http(_) => "http",
            Self::Regex(_) => "regex",
            Self::Io(_) => "io",
            Self::GlobPattern(_) => "glob",
            Self::Unknown { .. } => "unknown",
        }
    }
}

impl From<inquire::InquireError> for PlanexError {
    fn from(error: inquire::InquireError) -> Self {
        PlanexError::ui(format!("User input error: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_names() {
        assert_eq!(PlanexError::timeout(10).category(), "timeout");
        assert_eq!(PlanexError::halted("step1", "no decision").category(), "halted");
        assert_eq!(PlanexError::planning("no plan phase").category(), "planning");
    }

    #[test]
    fn test_cancellation_detection() {
        assert!(PlanexError::cancelled("run").is_cancelled());
        assert!(PlanexError::Tool(crate::execution::ToolError::Cancelled).is_cancelled());
        assert!(!PlanexError::halted("step1", "no decision").is_cancelled());
    }
}
