use chrono::{DateTime, Duration, Utc};
use rusqlite::types::{ToSql, Type};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::{SqliteStore, format_datetime, parse_datetime, parse_opt_datetime};
use crate::error::{Error, Result};
use crate::store::{
    NewOperationLog, OperationLogFilter, OperationLogStats, OperationStore, OutcomeFilter,
};
use crate::types::*;

const QUEUE_COLUMNS: &str = "id, operation_id, user_id, server_id, stack_name, command, options, services, status, priority, batch_id, order_index, depends_on, webhook_id, queued_at, started_at, completed_at, error";
const LOG_COLUMNS: &str = "id, operation_id, user_id, server_id, stack_name, command, options, services, status, queued_at, start_time, end_time, last_message_at, success, exit_code, duration_ms, summary, batch_id, order_index, depends_on, webhook_id, created_at";
const MESSAGE_COLUMNS: &str = "id, operation_log_id, sequence_number, message_type, timestamp, data";

fn conversion_error(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("unknown enum value '{value}'").into(),
    )
}

fn status_at(row: &Row, idx: usize) -> rusqlite::Result<OperationStatus> {
    let raw: String = row.get(idx)?;
    OperationStatus::parse(&raw).ok_or_else(|| conversion_error(idx, &raw))
}

fn queued_operation_from_row(row: &Row) -> rusqlite::Result<QueuedOperation> {
    Ok(QueuedOperation {
        id: row.get(0)?,
        operation_id: row.get(1)?,
        user_id: row.get(2)?,
        server_id: row.get(3)?,
        stack_name: row.get(4)?,
        command: row.get(5)?,
        options: row.get(6)?,
        services: row.get(7)?,
        status: status_at(row, 8)?,
        priority: row.get(9)?,
        batch_id: row.get(10)?,
        order_index: row.get(11)?,
        depends_on: row.get(12)?,
        webhook_id: row.get(13)?,
        queued_at: parse_datetime(&row.get::<_, String>(14)?),
        started_at: parse_opt_datetime(row.get(15)?),
        completed_at: parse_opt_datetime(row.get(16)?),
        error: row.get(17)?,
    })
}

fn operation_log_from_row(row: &Row) -> rusqlite::Result<OperationLog> {
    Ok(OperationLog {
        id: row.get(0)?,
        operation_id: row.get(1)?,
        user_id: row.get(2)?,
        server_id: row.get(3)?,
        stack_name: row.get(4)?,
        command: row.get(5)?,
        options: row.get(6)?,
        services: row.get(7)?,
        status: status_at(row, 8)?,
        queued_at: parse_opt_datetime(row.get(9)?),
        start_time: parse_datetime(&row.get::<_, String>(10)?),
        end_time: parse_opt_datetime(row.get(11)?),
        last_message_at: parse_opt_datetime(row.get(12)?),
        success: row.get(13)?,
        exit_code: row.get(14)?,
        duration_ms: row.get(15)?,
        summary: row.get(16)?,
        batch_id: row.get(17)?,
        order_index: row.get(18)?,
        depends_on: row.get(19)?,
        webhook_id: row.get(20)?,
        created_at: parse_datetime(&row.get::<_, String>(21)?),
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<OperationLogMessage> {
    let raw: String = row.get(3)?;
    Ok(OperationLogMessage {
        id: row.get(0)?,
        operation_log_id: row.get(1)?,
        sequence_number: row.get(2)?,
        message_type: MessageType::parse(&raw).ok_or_else(|| conversion_error(3, &raw))?,
        timestamp: parse_datetime(&row.get::<_, String>(4)?),
        data: row.get(5)?,
    })
}

fn summarize(command: &str, success: bool, exit_code: Option<i32>) -> String {
    if success {
        format!("Operation '{command}' completed successfully")
    } else {
        match exit_code {
            Some(code) => format!("Operation '{command}' failed with exit code {code}"),
            None => format!("Operation '{command}' failed"),
        }
    }
}

/// Builds the WHERE clause and its bound values for an operation-log filter.
fn log_filter_clause(filter: &OperationLogFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    let mut bind = |clause: &str, value: Box<dyn ToSql>, clauses: &mut Vec<String>| {
        values.push(value);
        clauses.push(clause.replace('?', &format!("?{}", values.len())));
    };

    if let Some(user_id) = filter.user_id {
        bind("user_id = ?", Box::new(user_id), &mut clauses);
    }
    if let Some(server_id) = filter.server_id {
        bind("server_id = ?", Box::new(server_id), &mut clauses);
    }
    if let Some(stack) = filter.stack_name.as_deref().filter(|s| !s.is_empty()) {
        bind("stack_name LIKE ?", Box::new(format!("%{stack}%")), &mut clauses);
    }
    if let Some(command) = filter.command.as_deref().filter(|s| !s.is_empty()) {
        bind("command = ?", Box::new(command.to_string()), &mut clauses);
    }
    if let Some(days) = filter.days_back.filter(|d| *d > 0) {
        let since = Utc::now() - Duration::days(days);
        bind("start_time >= ?", Box::new(format_datetime(&since)), &mut clauses);
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        bind(
            "(stack_name LIKE ? OR command LIKE ? OR operation_id LIKE ?)",
            Box::new(format!("%{search}%")),
            &mut clauses,
        );
    }
    match filter.outcome {
        Some(OutcomeFilter::Complete) => {
            clauses.push("status IN ('completed', 'failed', 'cancelled')".to_string());
        }
        Some(OutcomeFilter::Incomplete) => {
            clauses.push("status IN ('queued', 'running')".to_string());
        }
        Some(OutcomeFilter::Failed) => clauses.push("status = 'failed'".to_string()),
        Some(OutcomeFilter::Success) => clauses.push("status = 'completed'".to_string()),
        None => {}
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (clause, values)
}

impl OperationStore for SqliteStore {
    fn create_queued_operation(&self, op: &QueuedOperation) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO queued_operations (operation_id, user_id, server_id, stack_name, command, options, services,
                status, priority, batch_id, order_index, depends_on, webhook_id, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                op.operation_id,
                op.user_id,
                op.server_id,
                op.stack_name,
                op.command,
                op.options,
                op.services,
                op.status.as_str(),
                op.priority,
                op.batch_id,
                op.order_index,
                op.depends_on,
                op.webhook_id,
                format_datetime(&op.queued_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_queued_operation(&self, operation_id: &str) -> Result<Option<QueuedOperation>> {
        self.conn()
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM queued_operations WHERE operation_id = ?1"),
                params![operation_id],
                queued_operation_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn update_queued_operation_status(
        &self,
        operation_id: &str,
        status: OperationStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let at = format_datetime(&at);
        let rows = match status {
            OperationStatus::Queued => self.conn().execute(
                "UPDATE queued_operations SET status = ?1, started_at = NULL, completed_at = NULL, error = NULL
                 WHERE operation_id = ?2",
                params![status.as_str(), operation_id],
            )?,
            OperationStatus::Running => self.conn().execute(
                "UPDATE queued_operations SET status = ?1, started_at = ?2 WHERE operation_id = ?3",
                params![status.as_str(), at, operation_id],
            )?,
            _ => self.conn().execute(
                "UPDATE queued_operations SET status = ?1, completed_at = ?2, error = ?3 WHERE operation_id = ?4",
                params![status.as_str(), at, error, operation_id],
            )?,
        };

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn list_queued_operations_by_status(
        &self,
        status: OperationStatus,
    ) -> Result<Vec<QueuedOperation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queued_operations WHERE status = ?1 ORDER BY queued_at, id"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], queued_operation_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_stack_queue(&self, server_id: i64, stack_name: &str) -> Result<Vec<QueuedOperation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM queued_operations
             WHERE server_id = ?1 AND stack_name = ?2 AND status IN ('queued', 'running')
             ORDER BY CASE status WHEN 'running' THEN 0 ELSE 1 END, queued_at, id"
        ))?;
        let rows = stmt.query_map(params![server_id, stack_name], queued_operation_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn queue_position(&self, op: &QueuedOperation) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM queued_operations
             WHERE server_id = ?1 AND stack_name = ?2 AND status = 'queued' AND id <= ?3",
            params![op.server_id, op.stack_name, op.id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn find_batch_member(
        &self,
        batch_id: &str,
        order_index: i32,
    ) -> Result<Option<QueuedOperation>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {QUEUE_COLUMNS} FROM queued_operations WHERE batch_id = ?1 AND order_index = ?2"
                ),
                params![batch_id, order_index],
                queued_operation_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn create_operation_log(&self, log: &NewOperationLog) -> Result<i64> {
        let now = format_datetime(&Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO operation_logs (operation_id, user_id, server_id, stack_name, command, options, services,
                status, queued_at, start_time, batch_id, order_index, depends_on, webhook_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                log.operation_id,
                log.user_id,
                log.server_id,
                log.stack_name,
                log.command,
                log.options,
                log.services,
                log.status.as_str(),
                log.queued_at.as_ref().map(format_datetime),
                format_datetime(&log.start_time),
                log.batch_id,
                log.order_index,
                log.depends_on,
                log.webhook_id,
                now,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::AlreadyExists
            }
            e => Error::from(e),
        })?;
        Ok(conn.last_insert_rowid())
    }

    fn get_operation_log(&self, id: i64) -> Result<Option<OperationLog>> {
        self.conn()
            .query_row(
                &format!("SELECT {LOG_COLUMNS} FROM operation_logs WHERE id = ?1"),
                params![id],
                operation_log_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_operation_log_by_operation_id(&self, operation_id: &str) -> Result<Option<OperationLog>> {
        self.conn()
            .query_row(
                &format!("SELECT {LOG_COLUMNS} FROM operation_logs WHERE operation_id = ?1"),
                params![operation_id],
                operation_log_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn append_operation_message(
        &self,
        log_id: i64,
        message_type: MessageType,
        data: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64> {
        let ts = format_datetime(&timestamp);
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let sequence: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM operation_log_messages WHERE operation_log_id = ?1",
            params![log_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO operation_log_messages (operation_log_id, sequence_number, message_type, timestamp, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![log_id, sequence, message_type.as_str(), ts, data],
        )?;
        let updated = tx.execute(
            "UPDATE operation_logs SET last_message_at = ?1
             WHERE id = ?2 AND (last_message_at IS NULL OR last_message_at < ?1)",
            params![ts, log_id],
        )?;
        if updated == 0 {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM operation_logs WHERE id = ?1)",
                params![log_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(Error::NotFound);
            }
        }

        tx.commit()?;
        Ok(sequence)
    }

    fn finalize_operation_log(
        &self,
        log_id: i64,
        status: OperationStatus,
        end_time: DateTime<Utc>,
        success: bool,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let log = self.get_operation_log(log_id)?.ok_or(Error::NotFound)?;
        let duration_ms = (end_time - log.start_time).num_milliseconds().max(0);
        let summary = summarize(&log.command, success, exit_code);

        self.conn().execute(
            "UPDATE operation_logs
             SET status = ?1, end_time = ?2, success = ?3, exit_code = ?4, duration_ms = ?5, summary = ?6
             WHERE id = ?7",
            params![
                status.as_str(),
                format_datetime(&end_time),
                success,
                exit_code,
                duration_ms,
                summary,
                log_id
            ],
        )?;
        Ok(())
    }

    fn list_operation_logs(
        &self,
        filter: &OperationLogFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<OperationLog>, i64)> {
        let (clause, values) = log_filter_clause(filter);
        let conn = self.conn();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM operation_logs {clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let limit_idx = values.len() + 1;
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM operation_logs {clause}
             ORDER BY created_at DESC, id DESC LIMIT ?{limit_idx} OFFSET ?{}",
            limit_idx + 1
        );
        let mut args: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
        let offset = (page - 1) * page_size;
        args.push(&page_size);
        args.push(&offset);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), operation_log_from_row)?;
        let logs = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok((logs, total))
    }

    fn list_operation_messages(&self, log_id: i64) -> Result<Vec<OperationLogMessage>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM operation_log_messages
             WHERE operation_log_id = ?1 ORDER BY sequence_number"
        ))?;
        let rows = stmt.query_map(params![log_id], message_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn running_operation_logs(
        &self,
        user_id: Option<i64>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OperationLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM operation_logs
             WHERE status IN ('queued', 'running')
               AND COALESCE(last_message_at, start_time) >= ?1
               AND (?2 IS NULL OR user_id = ?2)
             ORDER BY start_time DESC"
        ))?;
        let rows = stmt.query_map(
            params![format_datetime(&cutoff), user_id],
            operation_log_from_row,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn stale_operation_logs(&self, cutoff: DateTime<Utc>) -> Result<Vec<OperationLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM operation_logs
             WHERE status IN ('queued', 'running')
               AND COALESCE(last_message_at, start_time) < ?1
             ORDER BY start_time"
        ))?;
        let rows = stmt.query_map(params![format_datetime(&cutoff)], operation_log_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn operation_log_stats(&self, user_id: Option<i64>) -> Result<OperationLogStats> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM operation_logs
             WHERE (?1 IS NULL OR user_id = ?1)
             GROUP BY status",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut stats = OperationLogStats::default();
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            match OperationStatus::parse(&status) {
                Some(OperationStatus::Completed) => stats.completed += count,
                Some(OperationStatus::Failed) => stats.failed += count,
                Some(OperationStatus::Cancelled) => stats.cancelled += count,
                Some(OperationStatus::Running) => stats.running += count,
                Some(OperationStatus::Queued) => stats.queued += count,
                None => {}
            }
        }
        Ok(stats)
    }
}
