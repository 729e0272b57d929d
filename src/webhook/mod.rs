//! Webhooks: stored credentials that let an external system queue
//! operations on a narrow set of stacks on behalf of their owner.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentClient;
use crate::audit::{AuditWriter, CATEGORY_WEBHOOK, RequestMeta};
use crate::auth::token::{generate_webhook_key, verify_webhook_key};
use crate::error::{Error, Result};
use crate::pattern;
use crate::queue::{BatchEnqueued, Enqueued, QueueService};
use crate::rbac::{Authorizer, Principal};
use crate::store::{NewWebhook, Store};
use crate::types::permission::STACKS_MANAGE;
use crate::types::{OperationRequest, Webhook};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWebhook {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub stack_pattern: String,
    #[serde(default)]
    pub server_ids: Vec<i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Partial update; absent fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateWebhook {
    pub name: Option<String>,
    pub description: Option<String>,
    pub stack_pattern: Option<String>,
    pub server_ids: Option<Vec<i64>>,
    pub is_active: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A webhook together with its plaintext key, returned exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedWebhook {
    #[serde(flatten)]
    pub webhook: Webhook,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub api_key: String,
    pub server_id: i64,
    pub stack_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
    /// Runs as a dependency-chained batch instead of a single command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<OperationRequest>>,
}

impl TriggerRequest {
    fn into_work(self) -> Result<TriggerWork> {
        match (self.operations, self.command) {
            (Some(_), Some(_)) => Err(Error::Validation(
                "provide either command or operations, not both".into(),
            )),
            (Some(ops), None) if ops.is_empty() => {
                Err(Error::Validation("operations must not be empty".into()))
            }
            (Some(ops), None) => Ok(TriggerWork::Batch(ops)),
            (None, Some(command)) if !command.trim().is_empty() => {
                Ok(TriggerWork::Single(OperationRequest {
                    command,
                    options: self.options,
                    services: self.services,
                }))
            }
            (None, _) => Err(Error::Validation("command is required".into())),
        }
    }
}

enum TriggerWork {
    Single(OperationRequest),
    Batch(Vec<OperationRequest>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TriggerOutcome {
    Single(Enqueued),
    Batch(BatchEnqueued),
}

pub struct WebhookService {
    store: Arc<dyn Store>,
    authorizer: Authorizer,
    agent: Arc<AgentClient>,
    queue: QueueService,
    audit: AuditWriter,
    cancel: CancellationToken,
}

impl WebhookService {
    pub fn new(
        store: Arc<dyn Store>,
        authorizer: Authorizer,
        agent: Arc<AgentClient>,
        queue: QueueService,
        audit: AuditWriter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            authorizer,
            agent,
            queue,
            audit,
            cancel,
        }
    }

    /// The owner must already hold `stacks.manage` wherever the webhook points.
    fn check_reach(&self, user_id: i64, stack_pattern: &str, server_ids: &[i64]) -> Result<()> {
        validate_pattern(stack_pattern)?;
        let manage = self
            .store
            .get_permission_by_name(STACKS_MANAGE)?
            .ok_or_else(|| Error::Config("permission catalogue is not seeded".into()))?;

        if server_ids.is_empty() {
            return self
                .authorizer
                .check_scope_grant(user_id, None, stack_pattern, &manage);
        }
        for server_id in server_ids {
            if self.store.get_server(*server_id)?.is_none() {
                return Err(Error::Validation(format!("server {server_id} does not exist")));
            }
            self.authorizer
                .check_scope_grant(user_id, Some(*server_id), stack_pattern, &manage)?;
        }
        Ok(())
    }

    /// Loads a webhook the caller may manage. Other users' webhooks look
    /// missing unless the caller is an administrator.
    pub fn get(&self, user_id: i64, id: i64) -> Result<Webhook> {
        let webhook = self.store.get_webhook(id)?.ok_or(Error::NotFound)?;
        if webhook.user_id == user_id || self.authorizer.user_is_admin(user_id)? {
            Ok(webhook)
        } else {
            Err(Error::NotFound)
        }
    }

    /// Administrators see every webhook.
    pub fn list(&self, user_id: i64) -> Result<Vec<Webhook>> {
        if self.authorizer.user_is_admin(user_id)? {
            self.store.list_webhooks(None)
        } else {
            self.store.list_webhooks(Some(user_id))
        }
    }

    pub fn create(
        &self,
        user_id: i64,
        request: CreateWebhook,
        meta: &RequestMeta,
    ) -> Result<IssuedWebhook> {
        if request.name.trim().is_empty() {
            return Err(Error::Validation("name is required".into()));
        }
        self.check_reach(user_id, &request.stack_pattern, &request.server_ids)?;

        let key = generate_webhook_key()?;
        let webhook = self.store.create_webhook(
            &NewWebhook {
                user_id,
                name: request.name.trim().to_string(),
                description: request.description,
                api_key_hash: key.hash,
                key_prefix: key.prefix,
                stack_pattern: request.stack_pattern,
                expires_at: request.expires_at,
            },
            &request.server_ids,
        )?;

        self.audit.mutation(
            CATEGORY_WEBHOOK,
            "webhook_created",
            user_id,
            "webhook",
            Some(webhook.id),
            Some(&webhook.name),
            meta,
        );
        info!(webhook_id = webhook.id, user_id, "webhook created");
        Ok(IssuedWebhook {
            webhook,
            api_key: key.plaintext,
        })
    }

    pub fn update(
        &self,
        user_id: i64,
        id: i64,
        request: UpdateWebhook,
        meta: &RequestMeta,
    ) -> Result<Webhook> {
        let mut webhook = self.get(user_id, id)?;

        if let Some(name) = request.name {
            if name.trim().is_empty() {
                return Err(Error::Validation("name must not be empty".into()));
            }
            webhook.name = name.trim().to_string();
        }
        if let Some(description) = request.description {
            webhook.description = Some(description).filter(|d| !d.is_empty());
        }
        if let Some(stack_pattern) = request.stack_pattern {
            webhook.stack_pattern = stack_pattern;
        }
        if let Some(server_ids) = &request.server_ids {
            webhook.server_ids = server_ids.clone();
        }
        if let Some(is_active) = request.is_active {
            webhook.is_active = is_active;
        }
        if request.expires_at.is_some() {
            webhook.expires_at = request.expires_at;
        }
        self.check_reach(webhook.user_id, &webhook.stack_pattern, &webhook.server_ids)?;

        self.store
            .update_webhook(&webhook, request.server_ids.as_deref())?;
        self.audit.mutation(
            CATEGORY_WEBHOOK,
            "webhook_updated",
            user_id,
            "webhook",
            Some(webhook.id),
            Some(&webhook.name),
            meta,
        );
        self.get(user_id, id)
    }

    /// Issues a new key. The previous plaintext stops working immediately.
    pub fn regenerate(&self, user_id: i64, id: i64, meta: &RequestMeta) -> Result<IssuedWebhook> {
        let webhook = self.get(user_id, id)?;
        let key = generate_webhook_key()?;
        self.store
            .update_webhook_key(webhook.id, &key.hash, &key.prefix)?;

        self.audit.mutation(
            CATEGORY_WEBHOOK,
            "webhook_key_regenerated",
            user_id,
            "webhook",
            Some(webhook.id),
            Some(&webhook.name),
            meta,
        );
        Ok(IssuedWebhook {
            webhook: self.get(user_id, id)?,
            api_key: key.plaintext,
        })
    }

    pub fn delete(&self, user_id: i64, id: i64, meta: &RequestMeta) -> Result<()> {
        let webhook = self.get(user_id, id)?;
        if !self.store.delete_webhook(webhook.id)? {
            return Err(Error::NotFound);
        }
        self.audit.mutation(
            CATEGORY_WEBHOOK,
            "webhook_deleted",
            user_id,
            "webhook",
            Some(webhook.id),
            Some(&webhook.name),
            meta,
        );
        Ok(())
    }

    /// Authenticates the body's key against the webhook and queues the work.
    ///
    /// Every credential failure is reported as [`Error::Unauthorized`] so the
    /// caller cannot probe which check failed. Scope failures are 403.
    pub async fn trigger(
        &self,
        webhook_id: i64,
        request: TriggerRequest,
        meta: &RequestMeta,
    ) -> Result<TriggerOutcome> {
        let Some(webhook) = self.store.get_webhook(webhook_id)? else {
            self.audit_trigger_failure(webhook_id, None, "unknown webhook", meta);
            return Err(Error::Unauthorized);
        };

        let api_key = request.api_key.clone();
        let hash = webhook.api_key_hash.clone();
        let verified = tokio::task::spawn_blocking(move || verify_webhook_key(&api_key, &hash))
            .await
            .map_err(|e| Error::Crypto(format!("key verification task failed: {e}")))?
            .unwrap_or(false);
        if !verified {
            self.audit_trigger_failure(webhook.id, Some(webhook.user_id), "invalid key", meta);
            return Err(Error::Unauthorized);
        }

        if !webhook.is_usable_at(Utc::now()) {
            self.audit_trigger_failure(
                webhook.id,
                Some(webhook.user_id),
                "webhook inactive or expired",
                meta,
            );
            return Err(Error::Unauthorized);
        }

        let server_id = request.server_id;
        let stack = request.stack_name.trim().to_string();
        if stack.is_empty() {
            return Err(Error::Validation("stack_name is required".into()));
        }
        if !pattern::matches(&stack, &webhook.stack_pattern) {
            return Err(Error::Forbidden(format!(
                "stack {stack} is outside this webhook's pattern"
            )));
        }
        if !webhook.allows_server(server_id) {
            return Err(Error::Forbidden(format!(
                "server {server_id} is outside this webhook's scope"
            )));
        }

        let principal = Principal::Webhook {
            user_id: webhook.user_id,
            webhook_id: webhook.id,
            stack_pattern: webhook.stack_pattern.clone(),
            server_ids: webhook.server_ids.clone(),
        };
        if !self
            .authorizer
            .effective_allow(&principal, server_id, &stack, STACKS_MANAGE)?
        {
            self.audit
                .authorization_denied(&principal, server_id, &stack, STACKS_MANAGE, meta);
            return Err(Error::Forbidden(format!(
                "{STACKS_MANAGE} required on stack {stack}"
            )));
        }

        let work = request.into_work()?;

        let server = match self.store.get_server(server_id)? {
            Some(server) if server.is_active => server,
            _ => return Err(Error::NotFound),
        };
        let endpoint = format!("/stacks/{}", urlencoding::encode(&stack));
        self.agent
            .get_json::<serde_json::Value>(&self.cancel, &server, &endpoint)
            .await
            .map_err(|e| match e {
                Error::AgentError { status: 404, .. } => Error::NotFound,
                other => other,
            })?;

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.record_webhook_trigger(webhook_id, Utc::now()) {
                warn!(webhook_id, error = %e, "failed to record webhook trigger");
            }
        });

        let outcome = match work {
            TriggerWork::Single(op) => TriggerOutcome::Single(
                self.queue
                    .enqueue_one(&principal, server_id, &stack, &op, meta)
                    .await?,
            ),
            TriggerWork::Batch(ops) => TriggerOutcome::Batch(
                self.queue
                    .enqueue_batch(&principal, server_id, &stack, &ops, meta)
                    .await?,
            ),
        };
        info!(webhook_id, server_id, stack = %stack, "webhook triggered");
        Ok(outcome)
    }

    fn audit_trigger_failure(
        &self,
        webhook_id: i64,
        owner: Option<i64>,
        reason: &str,
        meta: &RequestMeta,
    ) {
        self.audit.record(crate::store::NewSecurityAudit {
            event_type: "webhook_trigger_rejected".to_string(),
            category: CATEGORY_WEBHOOK.to_string(),
            severity: crate::audit::SEVERITY_WARNING.to_string(),
            actor_user_id: owner,
            actor_ip: meta.ip.clone(),
            actor_user_agent: meta.user_agent.clone(),
            target_type: Some("webhook".to_string()),
            target_id: Some(webhook_id),
            success: false,
            failure_reason: Some(reason.to_string()),
            ..Default::default()
        });
    }
}

fn validate_pattern(stack_pattern: &str) -> Result<()> {
    if stack_pattern.trim().is_empty() {
        return Err(Error::Validation("stack_pattern is required".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(command: Option<&str>, operations: Option<Vec<OperationRequest>>) -> TriggerRequest {
        TriggerRequest {
            api_key: "wh_x".into(),
            server_id: 1,
            stack_name: "prod-web".into(),
            command: command.map(str::to_string),
            options: vec!["-d".into()],
            services: Vec::new(),
            operations,
        }
    }

    #[test]
    fn test_single_command_keeps_options() {
        match trigger(Some("up"), None).into_work().unwrap() {
            TriggerWork::Single(op) => {
                assert_eq!(op.command, "up");
                assert_eq!(op.options, vec!["-d".to_string()]);
            }
            TriggerWork::Batch(_) => panic!("expected a single operation"),
        }
    }

    #[test]
    fn test_operations_become_a_batch() {
        let ops = vec![
            OperationRequest {
                command: "pull".into(),
                ..Default::default()
            },
            OperationRequest {
                command: "up".into(),
                ..Default::default()
            },
        ];
        assert!(matches!(
            trigger(None, Some(ops)).into_work().unwrap(),
            TriggerWork::Batch(ops) if ops.len() == 2
        ));
    }

    #[test]
    fn test_trigger_body_must_name_work() {
        assert!(matches!(
            trigger(None, None).into_work(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            trigger(Some("  "), None).into_work(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            trigger(None, Some(Vec::new())).into_work(),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            trigger(Some("up"), Some(vec![OperationRequest::default()])).into_work(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_trigger_body_parses_batch_shape() {
        let raw = r#"{"api_key":"wh_abc","server_id":3,"stack_name":"prod-web",
            "operations":[{"command":"pull"},{"command":"up","options":["-d"]}]}"#;
        let parsed: TriggerRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.server_id, 3);
        assert_eq!(parsed.operations.as_ref().map(Vec::len), Some(2));
        assert!(parsed.command.is_none());
    }
}
