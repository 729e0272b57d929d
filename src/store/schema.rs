pub const SCHEMA: &str = r#"
-- Users authenticate with a password; authority comes from their roles
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Roles; is_admin short-circuits every authorization check
CREATE TABLE IF NOT EXISTS roles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    is_admin INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_roles (
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
    PRIMARY KEY (user_id, role_id)
);

-- Permission catalogue (resource.action)
CREATE TABLE IF NOT EXISTS permissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    resource TEXT NOT NULL,
    action TEXT NOT NULL,
    description TEXT,
    is_api_key_only INTEGER NOT NULL DEFAULT 0
);

-- Remote agents
CREATE TABLE IF NOT EXISTS servers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    host TEXT NOT NULL,
    port INTEGER NOT NULL,
    skip_ssl_verification INTEGER NOT NULL DEFAULT 1,
    access_token TEXT NOT NULL,  -- AES-GCM sealed, base64
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- The atomic grant: role holds permission on stacks matching pattern on server
CREATE TABLE IF NOT EXISTS server_role_stack_permissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    server_id INTEGER NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
    role_id INTEGER NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
    permission_id INTEGER NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
    stack_pattern TEXT NOT NULL DEFAULT '*',
    created_at TEXT NOT NULL,
    UNIQUE(server_id, role_id, permission_id, stack_pattern)
);

-- Login sessions (opaque bearer tokens, stored hashed)
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    access_hash TEXT NOT NULL UNIQUE,
    refresh_hash TEXT NOT NULL UNIQUE,
    access_expires_at TEXT NOT NULL,
    refresh_expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- API keys: sha256 of the plaintext; soft delete rewrites the hash
CREATE TABLE IF NOT EXISTS api_keys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    key_hash TEXT NOT NULL UNIQUE,
    key_prefix TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    last_used_at TEXT,
    created_at TEXT NOT NULL,
    deleted_at TEXT
);

-- Scopes narrow an API key; NULL server_id means any server
CREATE TABLE IF NOT EXISTS api_key_scopes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    api_key_id INTEGER NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
    server_id INTEGER REFERENCES servers(id) ON DELETE CASCADE,
    stack_pattern TEXT NOT NULL DEFAULT '*',
    permission_id INTEGER NOT NULL REFERENCES permissions(id) ON DELETE CASCADE,
    created_at TEXT NOT NULL
);

-- Webhooks: slow-hashed key, one stack pattern, optional server allow-list
CREATE TABLE IF NOT EXISTS webhooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    api_key_hash TEXT NOT NULL,
    key_prefix TEXT NOT NULL,
    stack_pattern TEXT NOT NULL DEFAULT '*',
    is_active INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    last_triggered TEXT,
    trigger_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS webhook_server_scopes (
    webhook_id INTEGER NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
    server_id INTEGER NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
    PRIMARY KEY (webhook_id, server_id)
);

-- Live queue rows (queued/running); terminal rows are kept for auditing
CREATE TABLE IF NOT EXISTS queued_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_id TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL,
    server_id INTEGER NOT NULL,
    stack_name TEXT NOT NULL,
    command TEXT NOT NULL,
    options TEXT NOT NULL DEFAULT '[]',
    services TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'queued',
    priority INTEGER NOT NULL DEFAULT 0,
    batch_id TEXT,
    order_index INTEGER NOT NULL DEFAULT 0,
    depends_on TEXT,
    webhook_id INTEGER,
    queued_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    error TEXT
);

-- One header per issued operation
CREATE TABLE IF NOT EXISTS operation_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_id TEXT NOT NULL UNIQUE,
    user_id INTEGER NOT NULL,
    server_id INTEGER NOT NULL,
    stack_name TEXT NOT NULL,
    command TEXT NOT NULL,
    options TEXT NOT NULL DEFAULT '[]',
    services TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    queued_at TEXT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    last_message_at TEXT,
    success INTEGER,
    exit_code INTEGER,
    duration_ms INTEGER,
    summary TEXT,
    batch_id TEXT,
    order_index INTEGER NOT NULL DEFAULT 0,
    depends_on TEXT,
    webhook_id INTEGER,
    created_at TEXT NOT NULL
);

-- Append-only message stream; sequence numbers are dense per header
CREATE TABLE IF NOT EXISTS operation_log_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_log_id INTEGER NOT NULL REFERENCES operation_logs(id) ON DELETE CASCADE,
    sequence_number INTEGER NOT NULL,
    message_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    data TEXT NOT NULL DEFAULT '',
    UNIQUE(operation_log_id, sequence_number)
);

-- Append-only security audit trail
CREATE TABLE IF NOT EXISTS security_audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    category TEXT NOT NULL,
    severity TEXT NOT NULL,
    actor_user_id INTEGER,
    actor_ip TEXT NOT NULL DEFAULT '',
    actor_user_agent TEXT NOT NULL DEFAULT '',
    target_type TEXT,
    target_id INTEGER,
    target_name TEXT,
    success INTEGER NOT NULL,
    failure_reason TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    server_id INTEGER,
    stack_name TEXT,
    session_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_srsp_server_role ON server_role_stack_permissions(server_id, role_id);
CREATE INDEX IF NOT EXISTS idx_user_roles_user ON user_roles(user_id);
CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);
CREATE INDEX IF NOT EXISTS idx_api_key_scopes_key ON api_key_scopes(api_key_id);
CREATE INDEX IF NOT EXISTS idx_webhooks_user ON webhooks(user_id);
CREATE INDEX IF NOT EXISTS idx_queue_stack ON queued_operations(server_id, stack_name, status);
CREATE INDEX IF NOT EXISTS idx_queue_status ON queued_operations(status, queued_at);
CREATE INDEX IF NOT EXISTS idx_queue_batch ON queued_operations(batch_id, order_index);
CREATE INDEX IF NOT EXISTS idx_operation_logs_user ON operation_logs(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_operation_logs_status ON operation_logs(status);
CREATE INDEX IF NOT EXISTS idx_audit_created ON security_audit_logs(created_at);
"#;
