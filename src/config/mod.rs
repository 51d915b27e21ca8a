//! Configuration management for planex

use crate::execution::ExecutorConfig;
use crate::planning::SummaryLimits;
use crate::utils::errors::{ConfigError, PlanexError};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Currently active LLM provider
    pub active_provider: String,
    /// Currently active model
    pub active_model: String,
    /// Provider configurations
    pub providers: HashMap<String, ProviderConfig>,
    /// Timing and routing of plan-execute runs
    pub orchestration: OrchestrationConfig,
    /// Local toolbox settings
    pub workspace: WorkspaceConfig,
    pub logging: LoggingConfig,
}

/// Configuration for an LLM provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API key; the `<PROVIDER>_API_KEY` environment variable takes precedence
    pub api_key: Option<String>,
    /// Base URL for the provider API
    pub base_url: Option<String>,
    /// Model used when no model is given explicitly
    pub default_model: Option<String>,
}

/// Plan-execute timing heuristics and routing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Parser passes an unchanged incomplete action block survives before it is accepted
    pub action_tick_threshold: u32,
    pub tool_call_timeout_secs: u64,
    /// Bounded wait for a running tool at phase boundaries
    pub tool_wait_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub progress_tick_ms: u64,
    pub observation_max_chars: usize,
    /// Tools whose input is produced by the content producer
    pub content_tools: Vec<String>,
    pub summary: SummaryLimits,
}

/// Local toolbox configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root the file tools are confined to; the current directory when unset
    pub root: Option<PathBuf>,
    /// Whether `execute_command` is offered
    pub allow_commands: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "openrouter".to_string(),
            ProviderConfig {
                api_key: None,
                base_url: Some("https://openrouter.ai/api/v1".to_string()),
                default_model: Some("anthropic/claude-3.5-sonnet".to_string()),
            },
        );
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                api_key: None,
                base_url: Some("https://api.openai.com/v1".to_string()),
                default_model: Some("gpt-4o-mini".to_string()),
            },
        );

        Self {
            active_provider: "openrouter".to_string(),
            active_model: "anthropic/claude-3.5-sonnet".to_string(),
            providers,
            orchestration: OrchestrationConfig::default(),
            workspace: WorkspaceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            action_tick_threshold: 10,
            tool_call_timeout_secs: 60,
            tool_wait_timeout_secs: 30,
            poll_interval_ms: 100,
            progress_tick_ms: 1000,
            observation_max_chars: 500,
            content_tools: vec!["generate_content".to_string()],
            summary: SummaryLimits::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

impl OrchestrationConfig {
    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs)
    }

    pub fn tool_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_wait_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms)
    }

    /// Settings handed to the step executor
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            tool_call_timeout: self.tool_call_timeout(),
            progress_tick: self.progress_tick(),
            observation_max_chars: self.observation_max_chars,
            content_tools: self.content_tools.clone(),
        }
    }

    /// Reject zero timings, which would make waits and ticks degenerate
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("orchestration.action_tick_threshold", self.action_tick_threshold as u64),
            ("orchestration.tool_call_timeout_secs", self.tool_call_timeout_secs),
            ("orchestration.tool_wait_timeout_secs", self.tool_wait_timeout_secs),
            ("orchestration.poll_interval_ms", self.poll_interval_ms),
            ("orchestration.progress_tick_ms", self.progress_tick_ms),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(PlanexError::validation(field, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

impl WorkspaceConfig {
    /// Effective toolbox root
    pub fn root_dir(&self) -> PathBuf {
        match &self.root {
            Some(root) => root.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl Config {
    /// Get the active provider configuration
    pub fn get_active_provider_config(&self) -> Option<&ProviderConfig> {
        self.providers.get(&self.active_provider)
    }

    /// API key for a provider, environment first
    pub fn api_key_for(&self, provider_name: &str) -> Option<String> {
        let configured = self
            .providers
            .get(provider_name)
            .and_then(|p| p.api_key.as_deref());
        ApiKeyResolver::resolve_api_key(provider_name, configured)
    }

    /// Whether a provider is configured and has a key available
    pub fn is_provider_ready(&self, provider_name: &str) -> bool {
        self.providers.contains_key(provider_name) && self.api_key_for(provider_name).is_some()
    }

    /// Model to use: the active model, or the provider default when unset
    pub fn effective_model(&self) -> String {
        if !self.active_model.trim().is_empty() {
            return self.active_model.clone();
        }
        self.get_active_provider_config()
            .and_then(|p| p.default_model.clone())
            .unwrap_or_default()
    }

    /// Check if the configuration is valid
    pub fn validate(&self) -> Result<()> {
        self.get_active_provider_config().ok_or_else(|| {
            PlanexError::validation(
                "active_provider",
                format!("Provider '{}' not found in configuration", self.active_provider),
            )
        })?;

        if self.api_key_for(&self.active_provider).is_none() {
            return Err(PlanexError::validation(
                "provider.api_key",
                format!(
                    "No API key found for provider '{}'. Set {} environment variable or configure api_key in config.",
                    self.active_provider,
                    ApiKeyResolver::env_key_name(&self.active_provider)
                ),
            ));
        }

        for (name, provider) in &self.providers {
            if let Some(base_url) = &provider.base_url {
                url::Url::parse(base_url).map_err(|e| {
                    PlanexError::validation(
                        format!("providers.{}.base_url", name),
                        format!("Invalid URL '{}': {}", base_url, e),
                    )
                })?;
            }
        }

        if self.effective_model().is_empty() {
            return Err(PlanexError::validation("active_model", "No model configured"));
        }

        if let Some(root) = &self.workspace.root {
            if !root.is_dir() {
                return Err(PlanexError::validation(
                    "workspace.root",
                    format!("Workspace root does not exist: {}", root.display()),
                ));
            }
        }

        self.orchestration.validate()
    }
}

/// Configuration manager for loading, saving, and updating the config file
pub struct ConfigManager {
    config: Config,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Load from the default location, falling back to defaults when absent
    pub fn new() -> Result<Self> {
        Self::load(Self::default_config_path()?)
    }

    /// Load from an explicit path; a missing file yields the default config
    pub fn load<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let config_path = path.into();
        let config = if config_path.exists() {
            Self::load_config(&config_path)?
        } else {
            Config::default()
        };
        Ok(Self { config, config_path })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Save the current configuration to disk
    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_path, &self.config)
    }

    /// Reload configuration from disk
    pub fn reload(&mut self) -> Result<()> {
        if self.config_path.exists() {
            self.config = Self::load_config(&self.config_path)?;
        }
        Ok(())
    }

    /// Set a dotted key such as `orchestration.tool_call_timeout_secs`.
    ///
    /// The value is parsed as an integer, float or boolean when possible and
    /// kept as a string otherwise. The result must still deserialize.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut root = toml::Value::try_from(&self.config)
            .map_err(|e| ConfigError::SerializeError { source: e })?;

        let parts: Vec<&str> = key.split('.').collect();
        let Some((last, parents)) = parts.split_last() else {
            return Err(ConfigError::MissingKey { key: key.to_string() }.into());
        };

        let mut table = root
            .as_table_mut()
            .ok_or_else(|| ConfigError::MissingKey { key: key.to_string() })?;
        for part in parents {
            table = table
                .entry(part.to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()))
                .as_table_mut()
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
        }
        table.insert(last.to_string(), parse_scalar(value));

        self.config = root.try_into().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    /// `<config dir>/planex/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::FileNotFound {
            path: PathBuf::from("config directory"),
        })?;
        Ok(config_dir.join("planex").join("config.toml"))
    }

    fn load_config(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError { source: e })?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError { source: e })
            .map_err(Into::into)
    }

    fn save_config(path: &Path, config: &Config) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError { source: e })?;
            }
        }

        let content = toml::to_string_pretty(config).map_err(|e| ConfigError::SerializeError { source: e })?;
        fs::write(path, content).map_err(|e| ConfigError::WriteError { source: e })?;

        Ok(())
    }
}

fn parse_scalar(value: &str) -> toml::Value {
    if let Ok(i) = value.parse::<i64>() {
        toml::Value::Integer(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml::Value::Float(f)
    } else if let Ok(b) = value.parse::<bool>() {
        toml::Value::Boolean(b)
    } else {
        toml::Value::String(value.to_string())
    }
}

/// Centralized API key resolution logic
pub struct ApiKeyResolver;

impl ApiKeyResolver {
    /// Get API key for provider with environment variable precedence
    pub fn resolve_api_key(provider_name: &str, config_api_key: Option<&str>) -> Option<String> {
        let env_key = Self::env_key_name(provider_name);
        if let Ok(api_key) = std::env::var(&env_key) {
            if !api_key.trim().is_empty() {
                return Some(api_key);
            }
        }

        config_api_key
            .filter(|key| !key.trim().is_empty())
            .map(|key| key.to_string())
    }

    /// Get environment variable name for provider
    pub fn env_key_name(provider_name: &str) -> String {
        format!("{}_API_KEY", provider_name.to_uppercase().replace('-', "_"))
    }
}
