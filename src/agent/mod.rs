//! HTTP client for the per-host agents.
//!
//! Every call goes to `{scheme}://{host}:{port}/api{endpoint}` with the
//! server's decrypted access token as a bearer credential. JSON calls carry
//! a request timeout; SSE streams do not and are bounded only by the
//! caller's cancellation token.

mod sse;

pub use sse::{LineBuffer, data_payload};

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::AgentConfig;
use crate::crypto::SecretBox;
use crate::error::{Error, Result};
use crate::types::Server;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentClient {
    verified: Client,
    insecure: Client,
    scheme: String,
    timeout: Duration,
    secrets: SecretBox,
}

impl AgentClient {
    pub fn new(config: &AgentConfig, secrets: SecretBox) -> Result<Self> {
        let build = |accept_invalid: bool| {
            Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .danger_accept_invalid_certs(accept_invalid)
                .user_agent(concat!("berth/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| Error::Config(format!("failed to build agent client: {e}")))
        };

        Ok(Self {
            verified: build(false)?,
            insecure: build(true)?,
            scheme: config.scheme.clone(),
            timeout: config.request_timeout(),
            secrets,
        })
    }

    #[must_use]
    pub fn secrets(&self) -> &SecretBox {
        &self.secrets
    }

    #[must_use]
    pub fn url(&self, server: &Server, endpoint: &str) -> String {
        format!(
            "{}://{}:{}/api{}",
            self.scheme, server.host, server.port, endpoint
        )
    }

    fn builder(&self, server: &Server, method: Method, endpoint: &str) -> Result<RequestBuilder> {
        let client = if server.skip_ssl_verification {
            &self.insecure
        } else {
            &self.verified
        };
        let token = self.secrets.decrypt(&server.access_token)?;
        Ok(client
            .request(method, self.url(server, endpoint))
            .bearer_auth(token))
    }

    async fn send(&self, cancel: &CancellationToken, request: RequestBuilder) -> Result<Response> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = request.send() => res.map_err(transport_error)?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AgentError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Issues a JSON request and returns the raw response once it is known
    /// to be successful.
    pub async fn request<B: Serialize + ?Sized>(
        &self,
        cancel: &CancellationToken,
        server: &Server,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        debug!(server_id = server.id, %method, endpoint, "agent request");
        let mut request = self
            .builder(server, method, endpoint)?
            .timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(cancel, request).await
    }

    pub async fn json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        server: &Server,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<T> {
        let response = self.request(cancel, server, method, endpoint, body).await?;
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = response.bytes() => res.map_err(transport_error)?,
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::AgentProtocol(format!("invalid JSON from agent: {e}")))
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        server: &Server,
        endpoint: &str,
    ) -> Result<T> {
        self.json::<(), T>(cancel, server, Method::GET, endpoint, None)
            .await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        server: &Server,
        endpoint: &str,
        body: &B,
    ) -> Result<T> {
        self.json(cancel, server, Method::POST, endpoint, Some(body))
            .await
    }

    /// `GET /health`; only a 2xx counts as healthy.
    pub async fn health(&self, cancel: &CancellationToken, server: &Server) -> Result<()> {
        self.request::<()>(cancel, server, Method::GET, "/health", None)
            .await
            .map(|_| ())
    }

    /// Opens an SSE endpoint. The returned stream yields `data:` payloads.
    pub async fn stream(
        &self,
        cancel: &CancellationToken,
        server: &Server,
        endpoint: &str,
    ) -> Result<SseStream> {
        debug!(server_id = server.id, endpoint, "agent stream");
        let request = self
            .builder(server, Method::GET, endpoint)?
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = self.send(cancel, request).await?;

        Ok(SseStream {
            body: Box::pin(response.bytes_stream()),
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
            cancel: cancel.clone(),
            done: false,
        })
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::AgentUnavailable(format!("request timed out: {e}"))
    } else {
        Error::AgentUnavailable(e.to_string())
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// An open SSE body from an agent.
pub struct SseStream {
    body: ByteStream,
    lines: LineBuffer,
    pending: VecDeque<String>,
    cancel: CancellationToken,
    done: bool,
}

impl SseStream {
    /// Next `data:` payload. `Ok(None)` means the agent closed the stream.
    /// Cancellation is observed between and during reads.
    pub async fn next_data(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            if self.done {
                return Ok(None);
            }

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                chunk = self.body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => self.pending.extend(self.lines.push(&bytes)),
                Some(Err(e)) => return Err(transport_error(e)),
                None => {
                    self.done = true;
                    self.pending.extend(self.lines.finish());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server(secrets: &SecretBox, port: u16) -> Server {
        Server {
            id: 1,
            name: "local".to_string(),
            description: None,
            host: "127.0.0.1".to_string(),
            port,
            skip_ssl_verification: false,
            access_token: secrets.encrypt("agent-token").unwrap(),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn client(scheme: &str) -> AgentClient {
        let secrets = SecretBox::from_base64(&SecretBox::generate_key()).unwrap();
        let config = AgentConfig {
            scheme: scheme.to_string(),
            request_timeout_secs: 2,
        };
        AgentClient::new(&config, secrets).unwrap()
    }

    #[test]
    fn test_url_layout() {
        let client = client("https");
        let server = server(client.secrets(), 8443);
        assert_eq!(
            client.url(&server, "/stacks/web/operations"),
            "https://127.0.0.1:8443/api/stacks/web/operations"
        );
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_unavailable() {
        let client = client("http");
        // Port 9 (discard) is never served in the test environment.
        let server = server(client.secrets(), 9);
        let err = client
            .health(&CancellationToken::new(), &server)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let client = client("http");
        let server = server(client.secrets(), 9);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client
            .get_json::<serde_json::Value>(&cancel, &server, "/stacks")
            .await;
        assert!(matches!(result, Err(Error::Cancelled) | Err(Error::AgentUnavailable(_))));
    }
}
