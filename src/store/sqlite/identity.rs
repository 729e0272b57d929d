use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::{SqliteStore, format_datetime, parse_datetime, parse_opt_datetime, placeholders};
use crate::error::{Error, Result};
use crate::store::{IdentityStore, NewApiKey, NewApiKeyScope, NewServer};
use crate::types::permission::PermissionDef;
use crate::types::*;

const USER_COLUMNS: &str = "id, username, email, password_hash, created_at, updated_at";
const ROLE_COLUMNS: &str = "id, name, description, is_admin, created_at";
const PERMISSION_COLUMNS: &str = "id, name, resource, action, description, is_api_key_only";
const SERVER_COLUMNS: &str = "id, name, description, host, port, skip_ssl_verification, access_token, is_active, created_at, updated_at";
const SESSION_COLUMNS: &str =
    "id, user_id, access_hash, refresh_hash, access_expires_at, refresh_expires_at, created_at";
const API_KEY_COLUMNS: &str =
    "id, user_id, name, key_hash, key_prefix, is_active, expires_at, last_used_at, created_at";

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn role_from_row(row: &Row) -> rusqlite::Result<Role> {
    Ok(Role {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        is_admin: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

fn permission_from_row(row: &Row) -> rusqlite::Result<Permission> {
    Ok(Permission {
        id: row.get(0)?,
        name: row.get(1)?,
        resource: row.get(2)?,
        action: row.get(3)?,
        description: row.get(4)?,
        is_api_key_only: row.get(5)?,
    })
}

fn server_from_row(row: &Row) -> rusqlite::Result<Server> {
    Ok(Server {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        host: row.get(3)?,
        port: row.get(4)?,
        skip_ssl_verification: row.get(5)?,
        access_token: row.get(6)?,
        is_active: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
    })
}

fn stack_permission_from_row(row: &Row) -> rusqlite::Result<StackPermission> {
    Ok(StackPermission {
        id: row.get(0)?,
        server_id: row.get(1)?,
        role_id: row.get(2)?,
        permission_id: row.get(3)?,
        permission_name: row.get(4)?,
        stack_pattern: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        access_hash: row.get(2)?,
        refresh_hash: row.get(3)?,
        access_expires_at: parse_datetime(&row.get::<_, String>(4)?),
        refresh_expires_at: parse_datetime(&row.get::<_, String>(5)?),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn api_key_from_row(row: &Row) -> rusqlite::Result<ApiKey> {
    Ok(ApiKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        key_hash: row.get(3)?,
        key_prefix: row.get(4)?,
        is_active: row.get(5)?,
        expires_at: parse_opt_datetime(row.get(6)?),
        last_used_at: parse_opt_datetime(row.get(7)?),
        created_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn api_key_scope_from_row(row: &Row) -> rusqlite::Result<ApiKeyScope> {
    Ok(ApiKeyScope {
        id: row.get(0)?,
        api_key_id: row.get(1)?,
        server_id: row.get(2)?,
        stack_pattern: row.get(3)?,
        permission_id: row.get(4)?,
        permission_name: row.get(5)?,
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

const STACK_PERMISSION_SELECT: &str = "SELECT s.id, s.server_id, s.role_id, s.permission_id, p.name, s.stack_pattern, s.created_at
     FROM server_role_stack_permissions s
     JOIN permissions p ON p.id = s.permission_id";

const SCOPE_SELECT: &str = "SELECT s.id, s.api_key_id, s.server_id, s.stack_pattern, s.permission_id, p.name, s.created_at
     FROM api_key_scopes s
     JOIN permissions p ON p.id = s.permission_id";

fn insert_api_key(conn: &Connection, key: &NewApiKey) -> Result<ApiKey> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO api_keys (user_id, name, key_hash, key_prefix, is_active, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
        params![
            key.user_id,
            key.name,
            key.key_hash,
            key.key_prefix,
            key.expires_at.as_ref().map(format_datetime),
            format_datetime(&now),
        ],
    )
    .map_err(map_unique_violation)?;

    Ok(ApiKey {
        id: conn.last_insert_rowid(),
        user_id: key.user_id,
        name: key.name.clone(),
        key_hash: key.key_hash.clone(),
        key_prefix: key.key_prefix.clone(),
        is_active: true,
        expires_at: key.expires_at,
        last_used_at: None,
        created_at: now,
    })
}

fn insert_api_key_scope(
    conn: &Connection,
    api_key_id: i64,
    server_id: Option<i64>,
    stack_pattern: &str,
    permission_id: i64,
) -> Result<ApiKeyScope> {
    conn.execute(
        "INSERT INTO api_key_scopes (api_key_id, server_id, stack_pattern, permission_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![api_key_id, server_id, stack_pattern, permission_id, format_datetime(&Utc::now())],
    )?;
    let id = conn.last_insert_rowid();

    conn.query_row(
        &format!("{SCOPE_SELECT} WHERE s.id = ?1"),
        params![id],
        api_key_scope_from_row,
    )
    .map_err(Error::from)
}

fn map_unique_violation(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::AlreadyExists
        }
        e => Error::from(e),
    }
}

impl IdentityStore for SqliteStore {
    // User operations

    fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<User> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users (username, email, password_hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![username, email, password_hash, format_datetime(&now)],
        )
        .map_err(map_unique_violation)?;

        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                user_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY id"))?;
        let rows = stmt.query_map([], user_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_user(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM users WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Role operations

    fn create_role(&self, name: &str, description: Option<&str>, is_admin: bool) -> Result<Role> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO roles (name, description, is_admin, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, description, is_admin, format_datetime(&now)],
        )
        .map_err(map_unique_violation)?;

        Ok(Role {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            description: description.map(str::to_string),
            is_admin,
            created_at: now,
        })
    }

    fn get_role(&self, id: i64) -> Result<Option<Role>> {
        self.conn()
            .query_row(
                &format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = ?1"),
                params![id],
                role_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        self.conn()
            .query_row(
                &format!("SELECT {ROLE_COLUMNS} FROM roles WHERE name = ?1"),
                params![name],
                role_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_roles(&self) -> Result<Vec<Role>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY name"))?;
        let rows = stmt.query_map([], role_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_role(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM roles WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn assign_role(&self, user_id: i64, role_id: i64) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)",
            params![user_id, role_id],
        )?;
        Ok(())
    }

    fn remove_role(&self, user_id: i64, role_id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM user_roles WHERE user_id = ?1 AND role_id = ?2",
            params![user_id, role_id],
        )?;
        Ok(rows > 0)
    }

    fn list_user_roles(&self, user_id: i64) -> Result<Vec<Role>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT r.id, r.name, r.description, r.is_admin, r.created_at
             FROM roles r
             JOIN user_roles ur ON ur.role_id = r.id
             WHERE ur.user_id = ?1
             ORDER BY r.name",
        )?;
        let rows = stmt.query_map(params![user_id], role_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Permission catalogue

    fn upsert_permission(&self, def: &PermissionDef) -> Result<()> {
        self.conn().execute(
            "INSERT INTO permissions (name, resource, action, description, is_api_key_only)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO UPDATE SET
                resource = excluded.resource,
                action = excluded.action,
                description = excluded.description,
                is_api_key_only = excluded.is_api_key_only",
            params![
                def.name,
                def.resource(),
                def.action(),
                def.description,
                def.api_key_only
            ],
        )?;
        Ok(())
    }

    fn get_permission(&self, id: i64) -> Result<Option<Permission>> {
        self.conn()
            .query_row(
                &format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE id = ?1"),
                params![id],
                permission_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_permission_by_name(&self, name: &str) -> Result<Option<Permission>> {
        self.conn()
            .query_row(
                &format!("SELECT {PERMISSION_COLUMNS} FROM permissions WHERE name = ?1"),
                params![name],
                permission_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_permissions(&self) -> Result<Vec<Permission>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {PERMISSION_COLUMNS} FROM permissions ORDER BY name"))?;
        let rows = stmt.query_map([], permission_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Server operations

    fn create_server(&self, server: &NewServer) -> Result<Server> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO servers (name, description, host, port, skip_ssl_verification, access_token, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                server.name,
                server.description,
                server.host,
                server.port,
                server.skip_ssl_verification,
                server.access_token,
                server.is_active,
                format_datetime(&now),
            ],
        )
        .map_err(map_unique_violation)?;

        Ok(Server {
            id: conn.last_insert_rowid(),
            name: server.name.clone(),
            description: server.description.clone(),
            host: server.host.clone(),
            port: server.port,
            skip_ssl_verification: server.skip_ssl_verification,
            access_token: server.access_token.clone(),
            is_active: server.is_active,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_server(&self, id: i64) -> Result<Option<Server>> {
        self.conn()
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1"),
                params![id],
                server_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_servers(&self) -> Result<Vec<Server>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {SERVER_COLUMNS} FROM servers ORDER BY name"))?;
        let rows = stmt.query_map([], server_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_active_server_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM servers WHERE is_active = 1 ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn update_server(&self, server: &Server) -> Result<()> {
        let rows = self
            .conn()
            .execute(
                "UPDATE servers SET name = ?1, description = ?2, host = ?3, port = ?4,
                    skip_ssl_verification = ?5, access_token = ?6, is_active = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    server.name,
                    server.description,
                    server.host,
                    server.port,
                    server.skip_ssl_verification,
                    server.access_token,
                    server.is_active,
                    format_datetime(&Utc::now()),
                    server.id
                ],
            )
            .map_err(map_unique_violation)?;

        if rows == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    fn delete_server(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM servers WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // Role stack grants

    fn create_stack_permission(
        &self,
        server_id: i64,
        role_id: i64,
        permission_id: i64,
        stack_pattern: &str,
    ) -> Result<StackPermission> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO server_role_stack_permissions (server_id, role_id, permission_id, stack_pattern, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![server_id, role_id, permission_id, stack_pattern, format_datetime(&now)],
        )
        .map_err(map_unique_violation)?;
        let id = conn.last_insert_rowid();

        conn.query_row(
            &format!("{STACK_PERMISSION_SELECT} WHERE s.id = ?1"),
            params![id],
            stack_permission_from_row,
        )
        .map_err(Error::from)
    }

    fn list_role_stack_permissions(&self, role_id: i64) -> Result<Vec<StackPermission>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{STACK_PERMISSION_SELECT} WHERE s.role_id = ?1 ORDER BY s.server_id, s.stack_pattern, p.name"
        ))?;
        let rows = stmt.query_map(params![role_id], stack_permission_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_stack_permission(&self, role_id: i64, id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM server_role_stack_permissions WHERE id = ?1 AND role_id = ?2",
            params![id, role_id],
        )?;
        Ok(rows > 0)
    }

    fn list_stack_permissions_for_roles(
        &self,
        server_id: i64,
        role_ids: &[i64],
    ) -> Result<Vec<StackPermission>> {
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "{STACK_PERMISSION_SELECT} WHERE s.server_id = ?1 AND s.role_id IN ({}) ORDER BY s.id",
            placeholders(2, role_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let args = std::iter::once(server_id).chain(role_ids.iter().copied());
        let rows = stmt.query_map(params_from_iter(args), stack_permission_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn list_server_ids_for_roles(&self, role_ids: &[i64]) -> Result<Vec<i64>> {
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT DISTINCT s.server_id
             FROM server_role_stack_permissions s
             JOIN servers sv ON sv.id = s.server_id
             WHERE sv.is_active = 1 AND s.role_id IN ({})
             ORDER BY s.server_id",
            placeholders(1, role_ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(role_ids.iter()), |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    // Sessions

    fn create_session(
        &self,
        user_id: i64,
        access_hash: &str,
        refresh_hash: &str,
        access_expires_at: DateTime<Utc>,
        refresh_expires_at: DateTime<Utc>,
    ) -> Result<Session> {
        let now = Utc::now();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sessions (user_id, access_hash, refresh_hash, access_expires_at, refresh_expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id,
                access_hash,
                refresh_hash,
                format_datetime(&access_expires_at),
                format_datetime(&refresh_expires_at),
                format_datetime(&now),
            ],
        )?;

        Ok(Session {
            id: conn.last_insert_rowid(),
            user_id,
            access_hash: access_hash.to_string(),
            refresh_hash: refresh_hash.to_string(),
            access_expires_at,
            refresh_expires_at,
            created_at: now,
        })
    }

    fn get_session_by_access_hash(&self, hash: &str) -> Result<Option<Session>> {
        self.conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE access_hash = ?1"),
                params![hash],
                session_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_session_by_refresh_hash(&self, hash: &str) -> Result<Option<Session>> {
        self.conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE refresh_hash = ?1"),
                params![hash],
                session_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn delete_session(&self, id: i64) -> Result<bool> {
        let rows = self
            .conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = self.conn().execute(
            "DELETE FROM sessions WHERE refresh_expires_at < ?1",
            params![format_datetime(&now)],
        )?;
        Ok(rows)
    }

    // API keys

    fn create_api_key(&self, key: &NewApiKey) -> Result<ApiKey> {
        insert_api_key(&self.conn(), key)
    }

    fn create_api_key_with_scopes(
        &self,
        key: &NewApiKey,
        scopes: &[NewApiKeyScope],
    ) -> Result<(ApiKey, Vec<ApiKeyScope>)> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let created = insert_api_key(&tx, key)?;
        let scopes = scopes
            .iter()
            .map(|scope| {
                insert_api_key_scope(
                    &tx,
                    created.id,
                    scope.server_id,
                    &scope.stack_pattern,
                    scope.permission_id,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok((created, scopes))
    }

    fn get_api_key(&self, id: i64) -> Result<Option<ApiKey>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE id = ?1 AND deleted_at IS NULL"
                ),
                params![id],
                api_key_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn get_api_key_by_hash(&self, hash: &str) -> Result<Option<ApiKey>> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {API_KEY_COLUMNS} FROM api_keys WHERE key_hash = ?1 AND deleted_at IS NULL"
                ),
                params![hash],
                api_key_from_row,
            )
            .optional()
            .map_err(Error::from)
    }

    fn list_user_api_keys(&self, user_id: i64) -> Result<Vec<ApiKey>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {API_KEY_COLUMNS} FROM api_keys
             WHERE user_id = ?1 AND deleted_at IS NULL
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], api_key_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn touch_api_key(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let at = format_datetime(&at);
        self.conn().execute(
            "UPDATE api_keys SET last_used_at = ?1
             WHERE id = ?2 AND (last_used_at IS NULL OR last_used_at < ?1)",
            params![at, id],
        )?;
        Ok(())
    }

    fn soft_delete_api_key(&self, id: i64, at: DateTime<Utc>) -> Result<bool> {
        let rows = self.conn().execute(
            "UPDATE api_keys
             SET key_hash = key_hash || '-deleted-' || ?1, is_active = 0, deleted_at = ?2
             WHERE id = ?3 AND deleted_at IS NULL",
            params![at.timestamp(), format_datetime(&at), id],
        )?;
        Ok(rows > 0)
    }

    fn create_api_key_scope(
        &self,
        api_key_id: i64,
        server_id: Option<i64>,
        stack_pattern: &str,
        permission_id: i64,
    ) -> Result<ApiKeyScope> {
        insert_api_key_scope(&self.conn(), api_key_id, server_id, stack_pattern, permission_id)
    }

    fn list_api_key_scopes(&self, api_key_id: i64) -> Result<Vec<ApiKeyScope>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SCOPE_SELECT} WHERE s.api_key_id = ?1 ORDER BY s.id"))?;
        let rows = stmt.query_map(params![api_key_id], api_key_scope_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn delete_api_key_scope(&self, api_key_id: i64, scope_id: i64) -> Result<bool> {
        let rows = self.conn().execute(
            "DELETE FROM api_key_scopes WHERE id = ?1 AND api_key_id = ?2",
            params![scope_id, api_key_id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::test_store;
    use super::*;
    use crate::types::permission::{STACKS_MANAGE, STACKS_READ};

    fn new_server(name: &str) -> NewServer {
        NewServer {
            name: name.to_string(),
            description: None,
            host: "agent.local".to_string(),
            port: 8443,
            skip_ssl_verification: true,
            access_token: "sealed".to_string(),
            is_active: true,
        }
    }

    #[test]
    fn test_user_and_roles() {
        let (_temp, store) = test_store();
        let user = store.create_user("alice", "alice@example.com", "hash").unwrap();
        let role = store.create_role("operators", Some("ops"), false).unwrap();

        store.assign_role(user.id, role.id).unwrap();
        store.assign_role(user.id, role.id).unwrap();

        let roles = store.list_user_roles(user.id).unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "operators");

        assert!(matches!(
            store.create_user("alice", "other@example.com", "hash"),
            Err(Error::AlreadyExists)
        ));
        assert!(store.remove_role(user.id, role.id).unwrap());
        assert!(store.list_user_roles(user.id).unwrap().is_empty());
    }

    #[test]
    fn test_stack_permissions_cascade_on_role_delete() {
        let (_temp, store) = test_store();
        let server = store.create_server(&new_server("web-1")).unwrap();
        let role = store.create_role("devs", None, false).unwrap();
        let perm = store.get_permission_by_name(STACKS_READ).unwrap().unwrap();

        let grant = store
            .create_stack_permission(server.id, role.id, perm.id, "prod-*")
            .unwrap();
        assert_eq!(grant.permission_name, STACKS_READ);

        let rows = store
            .list_stack_permissions_for_roles(server.id, &[role.id])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(store.list_server_ids_for_roles(&[role.id]).unwrap(), vec![server.id]);

        store.delete_role(role.id).unwrap();
        assert!(
            store
                .list_stack_permissions_for_roles(server.id, &[role.id])
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_inactive_servers_are_not_reachable_through_roles() {
        let (_temp, store) = test_store();
        let mut server = store.create_server(&new_server("web-1")).unwrap();
        let role = store.create_role("devs", None, false).unwrap();
        let perm = store.get_permission_by_name(STACKS_MANAGE).unwrap().unwrap();
        store
            .create_stack_permission(server.id, role.id, perm.id, "*")
            .unwrap();

        server.is_active = false;
        store.update_server(&server).unwrap();
        assert!(store.list_server_ids_for_roles(&[role.id]).unwrap().is_empty());
        assert!(store.list_active_server_ids().unwrap().is_empty());
    }

    #[test]
    fn test_api_key_with_scopes_is_atomic() {
        let (_temp, store) = test_store();
        let user = store.create_user("carol", "carol@example.com", "hash").unwrap();
        let read = store.get_permission_by_name(STACKS_READ).unwrap().unwrap();
        let key = NewApiKey {
            user_id: user.id,
            name: "deploy".to_string(),
            key_hash: "h1".to_string(),
            key_prefix: "brth_h1h1h1h1".to_string(),
            expires_at: None,
        };

        let bad_scopes = [
            NewApiKeyScope {
                server_id: None,
                stack_pattern: "*".to_string(),
                permission_id: read.id,
            },
            NewApiKeyScope {
                server_id: None,
                stack_pattern: "*".to_string(),
                permission_id: 9_999,
            },
        ];
        assert!(store.create_api_key_with_scopes(&key, &bad_scopes).is_err());
        assert!(store.get_api_key_by_hash("h1").unwrap().is_none());
        assert!(store.list_user_api_keys(user.id).unwrap().is_empty());

        let (created, scopes) = store
            .create_api_key_with_scopes(&key, &bad_scopes[..1])
            .unwrap();
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].permission_name, STACKS_READ);
        assert_eq!(store.list_api_key_scopes(created.id).unwrap().len(), 1);
    }

    #[test]
    fn test_api_key_soft_delete_rewrites_hash() {
        let (_temp, store) = test_store();
        let user = store.create_user("bob", "bob@example.com", "hash").unwrap();
        let key = store
            .create_api_key(&NewApiKey {
                user_id: user.id,
                name: "ci".to_string(),
                key_hash: "abc123".to_string(),
                key_prefix: "brth_abcdefgh".to_string(),
                expires_at: None,
            })
            .unwrap();

        assert!(store.get_api_key_by_hash("abc123").unwrap().is_some());
        assert!(store.soft_delete_api_key(key.id, Utc::now()).unwrap());
        assert!(store.get_api_key_by_hash("abc123").unwrap().is_none());
        assert!(store.get_api_key(key.id).unwrap().is_none());

        let stored: String = store
            .conn()
            .query_row("SELECT key_hash FROM api_keys WHERE id = ?1", params![key.id], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(stored.starts_with("abc123-deleted-"));
    }

    #[test]
    fn test_touch_api_key_is_monotonic() {
        let (_temp, store) = test_store();
        let user = store.create_user("carol", "carol@example.com", "hash").unwrap();
        let key = store
            .create_api_key(&NewApiKey {
                user_id: user.id,
                name: "ci".to_string(),
                key_hash: "h".to_string(),
                key_prefix: "brth_h".to_string(),
                expires_at: None,
            })
            .unwrap();

        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(10);
        store.touch_api_key(key.id, later).unwrap();
        store.touch_api_key(key.id, earlier).unwrap();

        let fetched = store.get_api_key(key.id).unwrap().unwrap();
        assert_eq!(
            fetched.last_used_at.unwrap().timestamp_micros(),
            later.timestamp_micros()
        );
    }

    #[test]
    fn test_api_key_scopes() {
        let (_temp, store) = test_store();
        let user = store.create_user("dave", "dave@example.com", "hash").unwrap();
        let server = store.create_server(&new_server("web-1")).unwrap();
        let key = store
            .create_api_key(&NewApiKey {
                user_id: user.id,
                name: "deploy".to_string(),
                key_hash: "k".to_string(),
                key_prefix: "brth_k".to_string(),
                expires_at: None,
            })
            .unwrap();
        let perm = store.get_permission_by_name(STACKS_MANAGE).unwrap().unwrap();

        let scoped = store
            .create_api_key_scope(key.id, Some(server.id), "prod-*", perm.id)
            .unwrap();
        let global = store.create_api_key_scope(key.id, None, "*", perm.id).unwrap();
        assert_eq!(scoped.permission_name, STACKS_MANAGE);
        assert_eq!(global.server_id, None);

        assert_eq!(store.list_api_key_scopes(key.id).unwrap().len(), 2);
        assert!(store.delete_api_key_scope(key.id, scoped.id).unwrap());
        assert!(!store.delete_api_key_scope(key.id + 1, global.id).unwrap());

        store.delete_server(server.id).unwrap();
        assert_eq!(store.list_api_key_scopes(key.id).unwrap().len(), 1);
    }

    #[test]
    fn test_sessions() {
        let (_temp, store) = test_store();
        let user = store.create_user("erin", "erin@example.com", "hash").unwrap();
        let now = Utc::now();
        let session = store
            .create_session(
                user.id,
                "access",
                "refresh",
                now + chrono::Duration::minutes(15),
                now - chrono::Duration::seconds(1),
            )
            .unwrap();

        assert_eq!(
            store.get_session_by_access_hash("access").unwrap().unwrap().id,
            session.id
        );
        assert_eq!(store.delete_expired_sessions(now).unwrap(), 1);
        assert!(store.get_session_by_refresh_hash("refresh").unwrap().is_none());
    }
}
