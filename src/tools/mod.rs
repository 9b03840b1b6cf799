//! Tool boundary for live sessions
//!
//! The session never interprets tools: it advertises declarations at setup and
//! forwards calls to a [`ToolExecutor`].

pub mod executor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

pub use executor::{DEFAULT_TOOL_TIMEOUT, ManifestTool, ManifestTools};

/// A function the model may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Function name
    pub name: String,
    /// What the function does, shown to the model
    pub description: String,
    /// JSON schema of the arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Executes tool calls on behalf of the model
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Declarations offered to the model at setup
    async fn list_tools(&self) -> Result<Vec<ToolDeclaration>>;

    /// Run one call; errors are reported back to the model as data
    async fn execute(&self, name: &str, args: Value) -> Result<Value>;
}

/// Executor with no tools
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    async fn list_tools(&self) -> Result<Vec<ToolDeclaration>> {
        Ok(Vec::new())
    }

    async fn execute(&self, name: &str, _args: Value) -> Result<Value> {
        Err(Error::Tool(format!("unknown tool: {name}")))
    }
}
