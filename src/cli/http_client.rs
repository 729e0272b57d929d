use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::webhook::TriggerRequest;

/// Envelope every Berth response uses.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub data: Option<T>,
    pub error: Option<String>,
}

/// A failed trigger, classified by the exit code the CLI reports.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("operation failed: {0}")]
    OperationFailed(String),
    #[error("authentication failed: {0}")]
    Unauthorized(String),
    #[error("permission denied: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Internal(String),
}

impl TriggerError {
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::OperationFailed(_) => 1,
            Self::Unauthorized(_) => 2,
            Self::Forbidden(_) => 3,
            Self::Invalid(_) => 4,
            Self::Network(_) => 5,
            Self::Timeout(_) => 6,
            Self::Internal(_) => 7,
        }
    }

    fn from_status(status: StatusCode, message: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => Self::Unauthorized(message),
            StatusCode::FORBIDDEN => Self::Forbidden(message),
            StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Self::Invalid(message),
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
                Self::OperationFailed(message)
            }
            _ => Self::Internal(message),
        }
    }
}

impl From<reqwest::Error> for TriggerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Network(e.to_string())
        } else if e.is_decode() {
            Self::Internal(format!("unreadable response: {e}"))
        } else {
            Self::Network(e.to_string())
        }
    }
}

/// Unauthenticated client for the webhook trigger endpoint. The webhook
/// key travels in the body.
pub struct WebhookClient {
    client: Client,
    base_url: String,
}

impl WebhookClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TriggerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriggerError::Internal(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    #[must_use]
    pub fn trigger_url(&self, webhook_id: i64) -> String {
        format!("{}/api/v1/webhooks/{webhook_id}/trigger", self.base_url)
    }

    /// Posts the trigger and returns the `data` payload on success.
    pub fn trigger(&self, webhook_id: i64, body: &TriggerRequest) -> Result<Value, TriggerError> {
        let resp = self
            .client
            .post(self.trigger_url(webhook_id))
            .json(body)
            .send()?;
        let status = resp.status();
        let text = resp.text()?;
        let envelope: Option<ApiResponse<Value>> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let message = envelope
                .and_then(|e| e.error)
                .unwrap_or_else(|| format!("server returned {status}"));
            return Err(TriggerError::from_status(status, message));
        }

        match envelope {
            Some(ApiResponse {
                error: Some(error), ..
            }) => Err(TriggerError::OperationFailed(error)),
            Some(ApiResponse {
                data: Some(data), ..
            }) => Ok(data),
            _ => Err(TriggerError::Internal(
                "server returned an empty response".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_status() {
        let code = |status| TriggerError::from_status(status, String::new()).exit_code();
        assert_eq!(code(StatusCode::UNAUTHORIZED), 2);
        assert_eq!(code(StatusCode::FORBIDDEN), 3);
        assert_eq!(code(StatusCode::BAD_REQUEST), 4);
        assert_eq!(code(StatusCode::NOT_FOUND), 4);
        assert_eq!(code(StatusCode::SERVICE_UNAVAILABLE), 1);
        assert_eq!(code(StatusCode::INTERNAL_SERVER_ERROR), 7);
    }

    #[test]
    fn test_trigger_url() {
        let client = WebhookClient::new("http://berth.local:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.trigger_url(7),
            "http://berth.local:8080/api/v1/webhooks/7/trigger"
        );
    }
}
