//! Workspace-confined local tools and the model-backed content producer

use super::{ContentProducer, ToolError, ToolFacility};
use crate::llm::{Message, ModelClient, PromptContext, PromptTemplates, StreamCollector};
use crate::planning::PlanStep;
use crate::utils::text::strip_code_fence;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Parameter of a tool as shown in the catalog
#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: &'static str,
    pub kind: &'static str,
    pub required: bool,
    pub description: &'static str,
}

/// Catalog entry for a tool
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ToolParam>,
}

impl ToolDescriptor {
    /// Parameter used when the step input is a plain string
    fn primary_param(&self) -> Option<&'static str> {
        self.params.iter().find(|p| p.required).map(|p| p.name)
    }

    fn render(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|p| {
                format!(
                    "{}{}: {}",
                    p.name,
                    if p.required { "" } else { "?" },
                    p.kind
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let mut text = format!("- {}({}): {}", self.name, params, self.description);
        for param in &self.params {
            text.push_str(&format!("\n    {}: {}", param.name, param.description));
        }
        text
    }
}

fn param(name: &'static str, kind: &'static str, required: bool, description: &'static str) -> ToolParam {
    ToolParam {
        name,
        kind,
        required,
        description,
    }
}

/// File and command tools operating inside a workspace root
pub struct LocalToolbox {
    root: PathBuf,
    allow_commands: bool,
    tools: IndexMap<&'static str, ToolDescriptor>,
}

impl LocalToolbox {
    pub fn new<P: Into<PathBuf>>(root: P, allow_commands: bool) -> Self {
        let mut tools = IndexMap::new();
        let mut register = |descriptor: ToolDescriptor| {
            tools.insert(descriptor.name, descriptor);
        };

        register(ToolDescriptor {
            name: "read_file",
            description: "Read a text file from the workspace",
            params: vec![param("path", "string", true, "File path relative to the workspace")],
        });
        register(ToolDescriptor {
            name: "write_file",
            description: "Write text to a file, creating parent directories",
            params: vec![
                param("path", "string", true, "File path relative to the workspace"),
                param("content", "string", true, "Full file content"),
            ],
        });
        register(ToolDescriptor {
            name: "list_files",
            description: "List files in a directory, optionally filtered by a glob pattern",
            params: vec![
                param("path", "string", false, "Directory to list (default \".\")"),
                param("pattern", "string", false, "Glob pattern such as \"*.rs\" or \"**/*.md\""),
                param("recursive", "boolean", false, "Descend into subdirectories"),
            ],
        });
        register(ToolDescriptor {
            name: "create_directory",
            description: "Create a directory and any missing parents",
            params: vec![param("path", "string", true, "Directory path relative to the workspace")],
        });
        register(ToolDescriptor {
            name: "delete",
            description: "Delete a file or directory",
            params: vec![param("path", "string", true, "Path relative to the workspace")],
        });
        register(ToolDescriptor {
            name: "generate_content",
            description: "Write prose, code or documentation for a later step",
            params: vec![
                param("prompt", "string", true, "What to write"),
                param("context", "string", false, "Material the content should be based on"),
            ],
        });
        if allow_commands {
            register(ToolDescriptor {
                name: "execute_command",
                description: "Run a program inside the workspace (no shell)",
                params: vec![
                    param("command", "string", true, "Program and arguments separated by spaces"),
                    param("working_dir", "string", false, "Directory relative to the workspace"),
                ],
            });
        }

        Self {
            root: workspace_root(root.into()),
            allow_commands,
            tools,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace path, rejecting anything that escapes the root
    fn resolve(&self, tool: &str, path: &str) -> Result<PathBuf, ToolError> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let normalized = normalize(&joined)
            .ok_or_else(|| ToolError::invalid_arguments(tool, format!("invalid path '{}'", path)))?;

        if !normalized.starts_with(&self.root) {
            return Err(ToolError::invalid_arguments(
                tool,
                format!("path '{}' is outside the workspace", path),
            ));
        }
        Ok(normalized)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Read a string argument; a plain string input stands for the primary parameter
    fn arg_str(&self, tool: &str, args: &Value, key: &str) -> Option<String> {
        match args {
            Value::Object(map) => match map.get(key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            },
            Value::String(s) => {
                let primary = self.tools.get(tool).and_then(|d| d.primary_param());
                (primary == Some(key)).then(|| s.clone())
            }
            _ => None,
        }
    }

    fn require_str(&self, tool: &str, args: &Value, key: &str) -> Result<String, ToolError> {
        self.arg_str(tool, args, key)
            .ok_or_else(|| ToolError::invalid_arguments(tool, format!("missing '{}' parameter", key)))
    }

    async fn read_file(&self, args: &Value) -> Result<Value, ToolError> {
        let path = self.require_str("read_file", args, "path")?;
        let full = self.resolve("read_file", &path)?;
        let content = fs::read_to_string(&full)
            .await
            .map_err(|e| ToolError::failed("read_file", format!("failed to read file '{}': {}", path, e)))?;

        Ok(json!({
            "path": path,
            "content": content,
            "size": content.len()
        }))
    }

    async fn write_file(&self, args: &Value) -> Result<Value, ToolError> {
        let path = self.require_str("write_file", args, "path")?;
        let content = match args.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => {
                return Err(ToolError::invalid_arguments("write_file", "missing 'content' parameter"))
            }
            Some(other) => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        };
        let full = self.resolve("write_file", &path)?;

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::failed("write_file", format!("failed to create directory '{}': {}", parent.display(), e))
            })?;
        }
        fs::write(&full, &content)
            .await
            .map_err(|e| ToolError::failed("write_file", format!("failed to write file '{}': {}", path, e)))?;

        Ok(json!({
            "path": path,
            "bytes_written": content.len()
        }))
    }

    async fn list_files(&self, args: &Value) -> Result<Value, ToolError> {
        let path = self.arg_str("list_files", args, "path").unwrap_or_else(|| ".".to_string());
        let pattern = self.arg_str("list_files", args, "pattern");
        let recursive = args.get("recursive").and_then(Value::as_bool).unwrap_or(false);
        let dir = self.resolve("list_files", &path)?;

        if !dir.is_dir() {
            return Err(ToolError::failed("list_files", format!("'{}' is not a directory", path)));
        }

        let mut files = match pattern {
            Some(pattern) => {
                let full_pattern = dir.join(&pattern);
                let matches = glob::glob(&full_pattern.to_string_lossy())
                    .map_err(|e| ToolError::invalid_arguments("list_files", format!("bad pattern '{}': {}", pattern, e)))?;
                matches
                    .filter_map(|entry| entry.ok())
                    .filter(|p| p.is_file() && p.starts_with(&self.root))
                    .map(|p| self.relative(&p))
                    .collect::<Vec<_>>()
            }
            None => {
                let depth = if recursive { usize::MAX } else { 1 };
                WalkDir::new(&dir)
                    .min_depth(1)
                    .max_depth(depth)
                    .into_iter()
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_type().is_file())
                    .map(|entry| self.relative(entry.path()))
                    .collect::<Vec<_>>()
            }
        };
        files.sort();

        Ok(json!({
            "path": path,
            "files": files,
            "count": files.len()
        }))
    }

    async fn create_directory(&self, args: &Value) -> Result<Value, ToolError> {
        let path = self.require_str("create_directory", args, "path")?;
        let full = self.resolve("create_directory", &path)?;
        fs::create_dir_all(&full).await.map_err(|e| {
            ToolError::failed("create_directory", format!("failed to create directory '{}': {}", path, e))
        })?;

        Ok(json!({
            "path": path,
            "created": true
        }))
    }

    async fn delete(&self, args: &Value) -> Result<Value, ToolError> {
        let path = self.require_str("delete", args, "path")?;
        let full = self.resolve("delete", &path)?;
        if full == self.root {
            return Err(ToolError::invalid_arguments("delete", "refusing to delete the workspace root"));
        }

        let result = if full.is_file() {
            fs::remove_file(&full).await
        } else if full.is_dir() {
            fs::remove_dir_all(&full).await
        } else {
            return Err(ToolError::failed("delete", format!("path does not exist: {}", path)));
        };
        result.map_err(|e| ToolError::failed("delete", format!("failed to delete '{}': {}", path, e)))?;

        Ok(json!({
            "path": path,
            "deleted": true
        }))
    }

    async fn execute_command(&self, args: &Value) -> Result<Value, ToolError> {
        if !self.allow_commands {
            return Err(ToolError::Unavailable {
                tool: "execute_command".to_string(),
                message: "command execution is disabled in the workspace configuration".to_string(),
            });
        }

        let command = self.require_str("execute_command", args, "command")?;
        let working_dir = self
            .arg_str("execute_command", args, "working_dir")
            .unwrap_or_else(|| ".".to_string());
        let cwd = self.resolve("execute_command", &working_dir)?;

        let parts: Vec<&str> = command.split_whitespace().collect();
        let Some((program, rest)) = parts.split_first() else {
            return Err(ToolError::invalid_arguments("execute_command", "empty command"));
        };

        let output = Command::new(program)
            .args(rest)
            .current_dir(&cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ToolError::failed("execute_command", format!("failed to spawn '{}': {}", program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let success = output.status.success();

        let mut result = json!({
            "command": command,
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": output.status.code(),
            "success": success
        });
        if !success {
            result["error"] = Value::String(if stderr.trim().is_empty() {
                format!("command exited with {:?}", output.status.code())
            } else {
                stderr.trim().to_string()
            });
        }
        Ok(result)
    }

    fn generate_content(&self, args: &Value) -> Result<Value, ToolError> {
        let content = self
            .arg_str("generate_content", args, "content")
            .or_else(|| self.arg_str("generate_content", args, "prompt"))
            .ok_or_else(|| ToolError::invalid_arguments("generate_content", "missing 'prompt' parameter"))?;

        Ok(json!({
            "content": content,
            "chars": content.chars().count()
        }))
    }
}

#[async_trait]
impl ToolFacility for LocalToolbox {
    fn describe_tools(&self) -> String {
        self.tools
            .values()
            .map(ToolDescriptor::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn tool_names(&self) -> Vec<String> {
        self.tools.keys().map(|name| name.to_string()).collect()
    }

    async fn execute(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        debug!("Executing local tool {} with {}", name, args);
        match name {
            "read_file" => self.read_file(&args).await,
            "write_file" => self.write_file(&args).await,
            "list_files" => self.list_files(&args).await,
            "create_directory" => self.create_directory(&args).await,
            "delete" => self.delete(&args).await,
            "execute_command" => self.execute_command(&args).await,
            "generate_content" => self.generate_content(&args),
            _ => Err(ToolError::NotFound {
                name: name.to_string(),
            }),
        }
    }
}

/// Content producer backed by the model
pub struct ModelContentProducer {
    model: Arc<dyn ModelClient>,
    query: String,
}

impl ModelContentProducer {
    pub fn new<S: Into<String>>(model: Arc<dyn ModelClient>, query: S) -> Self {
        Self {
            model,
            query: query.into(),
        }
    }

    fn request_text(input: &Value) -> String {
        match input {
            Value::String(s) => s.clone(),
            Value::Object(map) => {
                let mut parts = Vec::new();
                for key in ["prompt", "request", "instructions", "topic"] {
                    if let Some(Value::String(s)) = map.get(key) {
                        parts.push(s.clone());
                    }
                }
                if let Some(context) = map.get("context") {
                    let context = match context {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    parts.push(format!("Use this material:\n{}", context));
                }
                if parts.is_empty() {
                    input.to_string()
                } else {
                    parts.join("\n\n")
                }
            }
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl ContentProducer for ModelContentProducer {
    async fn produce(&self, step: &PlanStep, input: &Value) -> Result<Value, ToolError> {
        let context = PromptContext::new()
            .with_variable("query", self.query.as_str())
            .with_variable("reason", step.reason.as_str())
            .with_variable("request", Self::request_text(input));
        let (system, user) = PromptTemplates::content_generation()
            .fill(&context)
            .map_err(|e| ToolError::failed(&step.tool, e.to_string()))?;
        let messages = vec![Message::system(system), Message::user(user)];

        let abort = CancellationToken::new();
        let stream = self
            .model
            .stream_chat(&messages, abort.clone())
            .await
            .map_err(|e| ToolError::failed(&step.tool, format!("content generation failed: {}", e)))?;
        let text = StreamCollector::collect_stream(stream, &abort)
            .await
            .map_err(|e| ToolError::failed(&step.tool, format!("content generation failed: {}", e)))?;
        let content = strip_code_fence(&text).to_string();

        Ok(match input {
            Value::Object(map) => {
                let mut merged = map.clone();
                merged.insert("content".to_string(), Value::String(content));
                Value::Object(merged)
            }
            _ => json!({ "content": content }),
        })
    }
}

/// Lexically resolve `.` and `..`; `None` when `..` climbs past the start
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    Some(normalized)
}

/// Absolute, normalized form of the configured workspace root
fn workspace_root(root: PathBuf) -> PathBuf {
    let absolute = if root.is_absolute() {
        root
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(root),
            Err(e) => {
                warn!("Cannot resolve workspace root against the current directory: {}", e);
                root
            }
        }
    };
    normalize(&absolute).unwrap_or(absolute)
}
