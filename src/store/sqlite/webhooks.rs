use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::{SqliteStore, format_datetime, parse_datetime, parse_opt_datetime};
use crate::error::{Error, Result};
use crate::store::{NewWebhook, WebhookStore};
use crate::types::Webhook;

const WEBHOOK_COLUMNS: &str = "id, user_id, name, description, api_key_hash, key_prefix, stack_pattern, is_active, expires_at, last_triggered, trigger_count, created_at, updated_at";

fn webhook_from_row(row: &Row) -> rusqlite::Result<Webhook> {
    Ok(Webhook {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        api_key_hash: row.get(4)?,
        key_prefix: row.get(5)?,
        stack_pattern: row.get(6)?,
        server_ids: Vec::new(),
        is_active: row.get(7)?,
        expires_at: parse_opt_datetime(row.get(8)?),
        last_triggered: parse_opt_datetime(row.get(9)?),
        trigger_count: row.get(10)?,
        created_at: parse_datetime(&row.get::<_, String>(11)?),
        updated_at: parse_datetime(&row.get::<_, String>(12)?),
    })
}

fn load_server_ids(conn: &Connection, webhook_id: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT server_id FROM webhook_server_scopes WHERE webhook_id = ?1 ORDER BY server_id",
    )?;
    let rows = stmt.query_map(params![webhook_id], |row| row.get(0))?;
    rows.collect()
}

fn replace_server_ids(conn: &Connection, webhook_id: i64, server_ids: &[i64]) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM webhook_server_scopes WHERE webhook_id = ?1",
        params![webhook_id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO webhook_server_scopes (webhook_id, server_id) VALUES (?1, ?2)",
    )?;
    for server_id in server_ids {
        stmt.execute(params![webhook_id, server_id])?;
    }
    Ok(())
}

impl WebhookStore for SqliteStore {
    fn create_webhook(&self, webhook: &NewWebhook, server_ids: &[i64]) -> Result<Webhook> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO webhooks (user_id, name, description, api_key_hash, key_prefix, stack_pattern, is_active, expires_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)",
            params![
                webhook.user_id,
                webhook.name,
                webhook.description,
                webhook.api_key_hash,
                webhook.key_prefix,
                webhook.stack_pattern,
                webhook.expires_at.as_ref().map(format_datetime),
                format_datetime(&now),
            ],
        )?;
        let id = tx.last_insert_rowid();
        replace_server_ids(&tx, id, server_ids)?;
        let server_ids = load_server_ids(&tx, id)?;
        tx.commit()?;

        Ok(Webhook {
            id,
            user_id: webhook.user_id,
            name: webhook.name.clone(),
            description: webhook.description.clone(),
            api_key_hash: webhook.api_key_hash.clone(),
            key_prefix: webhook.key_prefix.clone(),
            stack_pattern: webhook.stack_pattern.clone(),
            server_ids,
            is_active: true,
            expires_at: webhook.expires_at,
            last_triggered: None,
            trigger_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_webhook(&self, id: i64) -> Result<Option<Webhook>> {
        let conn = self.conn();
        let webhook = conn
            .query_row(
                &format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = ?1"),
                params![id],
                webhook_from_row,
            )
            .optional()?;

        match webhook {
            Some(mut webhook) => {
                webhook.server_ids = load_server_ids(&conn, webhook.id)?;
                Ok(Some(webhook))
            }
            None => Ok(None),
        }
    }

    fn list_webhooks(&self, user_id: Option<i64>) -> Result<Vec<Webhook>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM webhooks
             WHERE (?1 IS NULL OR user_id = ?1)
             ORDER BY created_at DESC, id DESC"
        ))?;
        let mut webhooks = stmt
            .query_map(params![user_id], webhook_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for webhook in &mut webhooks {
            webhook.server_ids = load_server_ids(&conn, webhook.id)?;
        }
        Ok(webhooks)
    }

    fn update_webhook(&self, webhook: &Webhook, server_ids: Option<&[i64]>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let rows = tx.execute(
            "UPDATE webhooks SET name = ?1, description = ?2, stack_pattern = ?3, is_active = ?4,
                expires_at = ?5, updated_at = ?6
             WHERE id = ?7",
            params![
                webhook.name,
                webhook.description,
                webhook.stack_pattern,
                webhook.is_active,
                webhook.expires_at.as_ref().map(format_datetime),
                format_datetime(&Utc::now()),
                webhook.id
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        if let Some(server_ids) = server_ids {
            replace_server_ids(&tx, webhook.id, server_ids)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn update_webhook_key(&self, id: i64, api_key_hash: &str, key_prefix: &str) -> Result<()> {
        let rows = self.conn().execute(
            "UPDATE webhooks SET api_key_hash = ?1, key_prefix = ?2, updated_at = ?3 WHERE id = ?4",
            params![api_key_hash, key_prefix, format_datetime(&Utc::now()), id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_webhook(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM webhooks WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn record_webhook_trigger(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE webhooks SET trigger_count = trigger_count + 1, last_triggered = ?1 WHERE id = ?2",
            params![format_datetime(&at), id],
        )?;
        Ok(())
    }
}
