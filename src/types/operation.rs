use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Stdout,
    Stderr,
    Progress,
    Complete,
    Error,
}

impl MessageType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Progress => "progress",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "progress" => Some(Self::Progress),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// A compose command as sent to the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub command: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl OperationRequest {
    pub fn encoded_options(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.options)
    }

    pub fn encoded_services(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.services)
    }

    /// Rebuilds a request from the serialized columns of a queue row.
    pub fn from_encoded(command: &str, options: &str, services: &str) -> serde_json::Result<Self> {
        Ok(Self {
            command: command.to_string(),
            options: decode_list(options)?,
            services: decode_list(services)?,
        })
    }
}

fn decode_list(raw: &str) -> serde_json::Result<Vec<String>> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw)
}

/// One SSE frame relayed from the agent, forwarded verbatim to WebSocket clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub data: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl StreamMessage {
    #[must_use]
    pub fn error(data: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Error,
            data: data.into(),
            timestamp: Utc::now(),
            success: None,
            exit_code: None,
        }
    }

    #[must_use]
    pub fn complete(success: bool, exit_code: Option<i32>) -> Self {
        Self {
            message_type: MessageType::Complete,
            data: String::new(),
            timestamp: Utc::now(),
            success: Some(success),
            exit_code,
        }
    }
}

/// What a finished agent relay reports back to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationOutcome {
    pub operation_id: String,
    pub success: bool,
    pub exit_code: Option<i32>,
}
