//! Tool service wire types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON-RPC version string sent with discovery requests.
pub const RPC_VERSION: &str = "2.0";

/// Discovery method name.
pub const TOOLS_LIST: &str = "tools/list";

/// A tool advertised by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// JSON schema for the tool's arguments.
    #[serde(
        default = "empty_object_schema",
        alias = "inputSchema",
        alias = "parameters"
    )]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// A source reference pulled from a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCitation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub url: String,
}

impl ToolCitation {
    pub fn new(title: Option<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.filter(|t| !t.trim().is_empty()),
            url: url.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a> {
    pub jsonrpc: &'a str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

/// Failure talking to the tool service. Always returned as a value.
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Tool service not configured")]
    NotConfigured,

    #[error("Invalid tool name: {tool}")]
    InvalidName { tool: String },

    #[error("Error calling tool {tool}: {message}")]
    Transport { tool: String, message: String },

    #[error("Error calling tool {tool}: HTTP {status}")]
    Status { tool: String, status: u16 },

    #[error("Error calling tool {tool}: invalid response: {message}")]
    Decode { tool: String, message: String },
}

impl ToolError {
    /// Error payload handed back to the model in place of a tool result.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({ "error": self.to_string() })
    }
}
