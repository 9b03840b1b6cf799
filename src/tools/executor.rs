//! Manifest-declared tools executed as subprocesses
//!
//! A TOML manifest lists the tools:
//!
//! ```toml
//! [[tool]]
//! name = "open_url"
//! description = "Open a URL in the default browser"
//! command = "/usr/local/bin/open-url"
//! parameters = { type = "object", properties = { url = { type = "string" } } }
//! ```
//!
//! The call arguments are written to the command's stdin as JSON. Stdout is
//! parsed as JSON when possible, otherwise returned as `{"output": <text>}`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{ToolDeclaration, ToolExecutor};
use crate::{Error, Result};

/// Default timeout for a tool process
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default, rename = "tool")]
    tools: Vec<ManifestTool>,
}

/// One tool entry in the manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestTool {
    /// Function name
    pub name: String,
    /// Description shown to the model
    pub description: String,
    /// Program to run
    pub command: String,
    /// Fixed arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// JSON schema of the call arguments
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Per-call timeout override
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Tools loaded from a TOML manifest
#[derive(Debug, Default)]
pub struct ManifestTools {
    tools: Vec<ManifestTool>,
    base_dir: Option<PathBuf>,
}

impl ManifestTools {
    /// Load a manifest file
    ///
    /// Relative commands resolve against the manifest's directory.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or declares a
    /// tool name twice
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut tools = Self::parse(&content)?;
        tools.base_dir = path.parent().map(Path::to_path_buf);
        tracing::info!(path = %path.display(), count = tools.tools.len(), "loaded tool manifest");
        Ok(tools)
    }

    /// Parse manifest TOML
    ///
    /// # Errors
    ///
    /// Returns error on invalid TOML or duplicate tool names
    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(content)?;

        let mut seen = HashSet::new();
        for tool in &manifest.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(Error::Config(format!("duplicate tool in manifest: {}", tool.name)));
            }
        }

        Ok(Self {
            tools: manifest.tools,
            base_dir: None,
        })
    }

    /// Tools in manifest order
    #[must_use]
    pub fn tools(&self) -> &[ManifestTool] {
        &self.tools
    }

    fn resolve_command(&self, command: &str) -> PathBuf {
        let path = Path::new(command);
        match &self.base_dir {
            Some(base) if path.is_relative() && command.contains('/') => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl ToolExecutor for ManifestTools {
    async fn list_tools(&self) -> Result<Vec<ToolDeclaration>> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolDeclaration {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect())
    }

    async fn execute(&self, name: &str, args: Value) -> Result<Value> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::Tool(format!("unknown tool: {name}")))?;

        let timeout = tool
            .timeout_secs
            .map_or(DEFAULT_TOOL_TIMEOUT, Duration::from_secs);
        let command = self.resolve_command(&tool.command);

        tracing::debug!(tool = name, command = %command.display(), "executing tool");
        run_tool_process(&command, &tool.args, name, &args, timeout).await
    }
}

/// Spawn a tool process, pass arguments on stdin and collect its result
async fn run_tool_process(
    command: &Path,
    fixed_args: &[String],
    name: &str,
    args: &Value,
    timeout: Duration,
) -> Result<Value> {
    let input = serde_json::to_vec(args)?;

    let mut child = Command::new(command)
        .args(fixed_args)
        .env("BEACON_TOOL_NAME", name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            Error::Tool(format!("failed to spawn tool process {}: {e}", command.display()))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(&input)
            .await
            .map_err(|e| Error::Tool(format!("failed to write tool input: {e}")))?;
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::Tool(format!("tool timed out after {timeout:?}")))?
        .map_err(|e| Error::Tool(format!("tool process error: {e}")))?;

    if !output.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::debug!(tool = name, stderr = %stderr, "tool stderr");
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Tool(format!(
            "tool exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::json!({ "output": trimmed })))
}
