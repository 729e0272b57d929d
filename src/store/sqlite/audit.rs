use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::{SqliteStore, format_datetime, parse_datetime};
use crate::error::{Error, Result};
use crate::store::{AuditStore, NewSecurityAudit, SecurityAuditFilter, SecurityAuditStats};
use crate::types::SecurityAuditLog;

const AUDIT_COLUMNS: &str = "id, event_type, category, severity, actor_user_id, actor_ip, actor_user_agent, target_type, target_id, target_name, success, failure_reason, metadata, server_id, stack_name, session_id, created_at";

fn audit_from_row(row: &Row) -> rusqlite::Result<SecurityAuditLog> {
    let metadata: String = row.get(12)?;
    Ok(SecurityAuditLog {
        id: row.get(0)?,
        event_type: row.get(1)?,
        category: row.get(2)?,
        severity: row.get(3)?,
        actor_user_id: row.get(4)?,
        actor_ip: row.get(5)?,
        actor_user_agent: row.get(6)?,
        target_type: row.get(7)?,
        target_id: row.get(8)?,
        target_name: row.get(9)?,
        success: row.get(10)?,
        failure_reason: row.get(11)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        server_id: row.get(13)?,
        stack_name: row.get(14)?,
        session_id: row.get(15)?,
        created_at: parse_datetime(&row.get::<_, String>(16)?),
    })
}

fn audit_filter_clause(filter: &SecurityAuditFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(event_type) = &filter.event_type {
        values.push(Box::new(event_type.clone()));
        clauses.push(format!("event_type = ?{}", values.len()));
    }
    if let Some(category) = &filter.category {
        values.push(Box::new(category.clone()));
        clauses.push(format!("category = ?{}", values.len()));
    }
    if let Some(severity) = &filter.severity {
        values.push(Box::new(severity.clone()));
        clauses.push(format!("severity = ?{}", values.len()));
    }
    if let Some(actor) = filter.actor_user_id {
        values.push(Box::new(actor));
        clauses.push(format!("actor_user_id = ?{}", values.len()));
    }
    if let Some(success) = filter.success {
        values.push(Box::new(success));
        clauses.push(format!("success = ?{}", values.len()));
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (clause, values)
}

impl AuditStore for SqliteStore {
    fn insert_security_audit(&self, event: &NewSecurityAudit) -> Result<i64> {
        let metadata = if event.metadata.is_null() {
            "{}".to_string()
        } else {
            event.metadata.to_string()
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO security_audit_logs (event_type, category, severity, actor_user_id, actor_ip, actor_user_agent,
                target_type, target_id, target_name, success, failure_reason, metadata, server_id, stack_name, session_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                event.event_type,
                event.category,
                event.severity,
                event.actor_user_id,
                event.actor_ip,
                event.actor_user_agent,
                event.target_type,
                event.target_id,
                event.target_name,
                event.success,
                event.failure_reason,
                metadata,
                event.server_id,
                event.stack_name,
                event.session_id,
                format_datetime(&Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_security_audit(&self, id: i64) -> Result<Option<SecurityAuditLog>> {
        self.conn()
            .query_row(
                &format!("SELECT {AUDIT_COLUMNS} FROM security_audit_logs WHERE id = ?1"),
                params![id],
                audit_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_security_audit(
        &self,
        filter: &SecurityAuditFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<SecurityAuditLog>, i64)> {
        let (clause, values) = audit_filter_clause(filter);
        let conn = self.conn();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM security_audit_logs {clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let offset = (page - 1) * page_size;
        let limit_idx = values.len() + 1;
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM security_audit_logs {clause}
             ORDER BY created_at DESC, id DESC LIMIT ?{limit_idx} OFFSET ?{}",
            limit_idx + 1
        );
        let mut args: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        args.push(&page_size);
        args.push(&offset);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), audit_from_row)?;
        let events = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((events, total))
    }

    fn security_audit_stats(&self) -> Result<SecurityAuditStats> {
        let conn = self.conn();
        let mut stats = SecurityAuditStats::default();

        let (total, failures): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) FROM security_audit_logs",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        stats.total = total;
        stats.failures = failures;

        let mut stmt =
            conn.prepare("SELECT category, COUNT(*) FROM security_audit_logs GROUP BY category")?;
        for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
            let (category, count) = row?;
            stats.by_category.insert(category, count);
        }

        let mut stmt =
            conn.prepare("SELECT severity, COUNT(*) FROM security_audit_logs GROUP BY severity")?;
        for row in stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))? {
            let (severity, count) = row?;
            stats.by_severity.insert(severity, count);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_store;
    use super::*;

    fn denial(stack: &str) -> NewSecurityAudit {
        NewSecurityAudit {
            event_type: "authorization_denied".to_string(),
            category: "rbac".to_string(),
            severity: "warning".to_string(),
            actor_user_id: Some(7),
            actor_ip: "10.0.0.1".to_string(),
            target_type: Some("stack".to_string()),
            target_name: Some(stack.to_string()),
            success: false,
            failure_reason: Some("missing stacks.manage".to_string()),
            metadata: serde_json::json!({ "permission": "stacks.manage" }),
            server_id: Some(1),
            stack_name: Some(stack.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_and_get() {
        let (_temp, store) = test_store();
        let id = store.insert_security_audit(&denial("web")).unwrap();
        let event = store.get_security_audit(id).unwrap().unwrap();
        assert_eq!(event.event_type, "authorization_denied");
        assert!(!event.success);
        assert_eq!(event.target_name.as_deref(), Some("web"));
        assert_eq!(event.metadata["permission"], "stacks.manage");
    }

    #[test]
    fn test_default_metadata_is_empty_object() {
        let (_temp, store) = test_store();
        let id = store
            .insert_security_audit(&NewSecurityAudit {
                event_type: "login".to_string(),
                category: "auth".to_string(),
                severity: "info".to_string(),
                success: true,
                ..Default::default()
            })
            .unwrap();
        let event = store.get_security_audit(id).unwrap().unwrap();
        assert!(event.metadata.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_list_filters_and_stats() {
        let (_temp, store) = test_store();
        store.insert_security_audit(&denial("a")).unwrap();
        store.insert_security_audit(&denial("b")).unwrap();
        store
            .insert_security_audit(&NewSecurityAudit {
                event_type: "login".to_string(),
                category: "auth".to_string(),
                severity: "info".to_string(),
                success: true,
                ..Default::default()
            })
            .unwrap();

        let filter = SecurityAuditFilter {
            success: Some(false),
            ..Default::default()
        };
        let (events, total) = store.list_security_audit(&filter, 1, 1).unwrap();
        assert_eq!(total, 2);
        assert_eq!(events.len(), 1);

        let stats = store.security_audit_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.by_category.get("rbac"), Some(&2));
        assert_eq!(stats.by_severity.get("info"), Some(&1));
    }
}
