//! Canonical permission names.
//!
//! Permissions are `resource.action` strings. Role grants attach them to
//! `(server, stack pattern)` pairs; API-key scopes narrow them further.
//! Entries flagged `api_key_only` can only ever appear on API-key scopes.

pub const STACKS_READ: &str = "stacks.read";
pub const STACKS_MANAGE: &str = "stacks.manage";
pub const FILES_READ: &str = "files.read";
pub const FILES_WRITE: &str = "files.write";
pub const LOGS_READ: &str = "logs.read";
pub const MAINTENANCE_READ: &str = "docker.maintenance.read";
pub const MAINTENANCE_WRITE: &str = "docker.maintenance.write";

pub const ADMIN_USERS: &str = "admin.users";
pub const ADMIN_ROLES: &str = "admin.roles";
pub const ADMIN_SERVERS: &str = "admin.servers";
pub const ADMIN_AUDIT: &str = "admin.audit";

#[derive(Debug, Clone, Copy)]
pub struct PermissionDef {
    pub name: &'static str,
    pub description: &'static str,
    pub api_key_only: bool,
}

impl PermissionDef {
    #[must_use]
    pub fn resource(&self) -> &'static str {
        self.name.rsplit_once('.').map_or(self.name, |(r, _)| r)
    }

    #[must_use]
    pub fn action(&self) -> &'static str {
        self.name.rsplit_once('.').map_or("", |(_, a)| a)
    }
}

pub const CATALOGUE: &[PermissionDef] = &[
    PermissionDef {
        name: STACKS_READ,
        description: "View stacks and their status",
        api_key_only: false,
    },
    PermissionDef {
        name: STACKS_MANAGE,
        description: "Run compose operations against stacks",
        api_key_only: false,
    },
    PermissionDef {
        name: FILES_READ,
        description: "Browse and read stack files",
        api_key_only: false,
    },
    PermissionDef {
        name: FILES_WRITE,
        description: "Create, modify and delete stack files",
        api_key_only: false,
    },
    PermissionDef {
        name: LOGS_READ,
        description: "Read stack and container logs",
        api_key_only: false,
    },
    PermissionDef {
        name: MAINTENANCE_READ,
        description: "View docker disk usage and resources",
        api_key_only: false,
    },
    PermissionDef {
        name: MAINTENANCE_WRITE,
        description: "Prune docker resources",
        api_key_only: false,
    },
    PermissionDef {
        name: ADMIN_USERS,
        description: "Manage users through an API key",
        api_key_only: true,
    },
    PermissionDef {
        name: ADMIN_ROLES,
        description: "Manage roles and grants through an API key",
        api_key_only: true,
    },
    PermissionDef {
        name: ADMIN_SERVERS,
        description: "Manage servers through an API key",
        api_key_only: true,
    },
    PermissionDef {
        name: ADMIN_AUDIT,
        description: "Read the security audit log through an API key",
        api_key_only: true,
    },
];

#[must_use]
pub fn lookup(name: &str) -> Option<&'static PermissionDef> {
    CATALOGUE.iter().find(|def| def.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_and_action_split_on_last_dot() {
        let def = lookup(MAINTENANCE_WRITE).unwrap();
        assert_eq!(def.resource(), "docker.maintenance");
        assert_eq!(def.action(), "write");
    }

    #[test]
    fn test_admin_permissions_are_api_key_only() {
        for def in CATALOGUE {
            assert_eq!(def.name.starts_with("admin."), def.api_key_only, "{}", def.name);
        }
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(lookup("stacks.destroy").is_none());
    }
}
