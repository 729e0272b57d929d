//! Stack-level authorization.
//!
//! A user's authority comes from role grants: `(server, role, permission,
//! stack pattern)` rows. Admin roles bypass the grant table. API keys and
//! webhooks never add authority of their own; they only narrow what their
//! owning user already holds.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::pattern;
use crate::store::Store;
use crate::types::permission::{self, STACKS_MANAGE};
use crate::types::{ApiKey, ApiKeyScope, Permission};

/// The authenticated entity behind a request.
#[derive(Debug, Clone)]
pub enum Principal {
    /// Interactive login.
    Session { user_id: i64, session_id: i64 },
    ApiKey {
        user_id: i64,
        key: ApiKey,
        scopes: Vec<ApiKeyScope>,
    },
    Webhook {
        user_id: i64,
        webhook_id: i64,
        stack_pattern: String,
        /// Empty means every server the owner can reach.
        server_ids: Vec<i64>,
    },
}

impl Principal {
    #[must_use]
    pub fn user_id(&self) -> i64 {
        match self {
            Self::Session { user_id, .. }
            | Self::ApiKey { user_id, .. }
            | Self::Webhook { user_id, .. } => *user_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::ApiKey { .. } => "api_key",
            Self::Webhook { .. } => "webhook",
        }
    }

    #[must_use]
    pub fn webhook_id(&self) -> Option<i64> {
        match self {
            Self::Webhook { webhook_id, .. } => Some(*webhook_id),
            _ => None,
        }
    }

    /// Whether the credential's own narrowing rules allow `perm` on the stack.
    /// Says nothing about the owning user.
    fn credential_allows(&self, server_id: i64, stack: &str, perm: &str) -> bool {
        match self {
            Self::Session { .. } => true,
            Self::ApiKey { key, scopes, .. } => {
                key.is_usable_at(Utc::now())
                    && scopes.iter().any(|scope| {
                        scope.server_id.is_none_or(|id| id == server_id)
                            && pattern::matches(stack, &scope.stack_pattern)
                            && scope.permission_name == perm
                    })
            }
            Self::Webhook {
                stack_pattern,
                server_ids,
                ..
            } => {
                perm == STACKS_MANAGE
                    && pattern::matches(stack, stack_pattern)
                    && (server_ids.is_empty() || server_ids.contains(&server_id))
            }
        }
    }

    fn credential_reaches_server(&self, server_id: i64) -> bool {
        match self {
            Self::Session { .. } => true,
            Self::ApiKey { key, scopes, .. } => {
                key.is_usable_at(Utc::now())
                    && scopes
                        .iter()
                        .filter(|s| !s.permission_name.starts_with("admin."))
                        .any(|s| s.server_id.is_none_or(|id| id == server_id))
            }
            Self::Webhook { server_ids, .. } => {
                server_ids.is_empty() || server_ids.contains(&server_id)
            }
        }
    }
}

/// Resolves authorization questions against the store.
#[derive(Clone)]
pub struct Authorizer {
    store: Arc<dyn Store>,
}

impl Authorizer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Returns whether the user is admin, and the ids of all their roles.
    fn roles_of(&self, user_id: i64) -> Result<(bool, Vec<i64>)> {
        let roles = self.store.list_user_roles(user_id)?;
        let is_admin = roles.iter().any(|r| r.is_admin);
        Ok((is_admin, roles.into_iter().map(|r| r.id).collect()))
    }

    pub fn user_is_admin(&self, user_id: i64) -> Result<bool> {
        Ok(self.roles_of(user_id)?.0)
    }

    pub fn user_has_stack_permission(
        &self,
        user_id: i64,
        server_id: i64,
        stack: &str,
        perm: &str,
    ) -> Result<bool> {
        let (is_admin, role_ids) = self.roles_of(user_id)?;
        if is_admin {
            return Ok(true);
        }

        let grants = self
            .store
            .list_stack_permissions_for_roles(server_id, &role_ids)?;
        Ok(grants
            .iter()
            .any(|g| g.permission_name == perm && pattern::matches(stack, &g.stack_pattern)))
    }

    /// True when any grant exists for the user's roles on the server.
    pub fn user_has_server_access(&self, user_id: i64, server_id: i64) -> Result<bool> {
        Ok(self.accessible_server_ids(user_id)?.contains(&server_id))
    }

    /// Admins see every active server.
    pub fn accessible_server_ids(&self, user_id: i64) -> Result<Vec<i64>> {
        let (is_admin, role_ids) = self.roles_of(user_id)?;
        if is_admin {
            return self.store.list_active_server_ids();
        }
        self.store.list_server_ids_for_roles(&role_ids)
    }

    /// All permission names the user holds on the stack.
    pub fn user_stack_permissions(
        &self,
        user_id: i64,
        server_id: i64,
        stack: &str,
    ) -> Result<Vec<String>> {
        let (is_admin, role_ids) = self.roles_of(user_id)?;
        if is_admin {
            return Ok(permission::CATALOGUE
                .iter()
                .filter(|p| !p.api_key_only)
                .map(|p| p.name.to_string())
                .collect());
        }

        let names: BTreeSet<String> = self
            .store
            .list_stack_permissions_for_roles(server_id, &role_ids)?
            .into_iter()
            .filter(|g| pattern::matches(stack, &g.stack_pattern))
            .map(|g| g.permission_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    /// The user predicate narrowed by the principal's credential.
    pub fn effective_allow(
        &self,
        principal: &Principal,
        server_id: i64,
        stack: &str,
        perm: &str,
    ) -> Result<bool> {
        if !principal.credential_allows(server_id, stack, perm) {
            return Ok(false);
        }
        self.user_has_stack_permission(principal.user_id(), server_id, stack, perm)
    }

    pub fn effective_stack_permissions(
        &self,
        principal: &Principal,
        server_id: i64,
        stack: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .user_stack_permissions(principal.user_id(), server_id, stack)?
            .into_iter()
            .filter(|perm| principal.credential_allows(server_id, stack, perm))
            .collect())
    }

    pub fn effective_server_ids(&self, principal: &Principal) -> Result<Vec<i64>> {
        Ok(self
            .accessible_server_ids(principal.user_id())?
            .into_iter()
            .filter(|id| principal.credential_reaches_server(*id))
            .collect())
    }

    pub fn principal_reaches_server(&self, principal: &Principal, server_id: i64) -> Result<bool> {
        Ok(principal.credential_reaches_server(server_id)
            && self.user_has_server_access(principal.user_id(), server_id)?)
    }

    /// Checks that `user_id` may attach a scope for `permission` to one of
    /// their API keys. Admin permissions need an admin; everything else needs
    /// the user to already hold the permission where the scope points.
    pub fn check_scope_grant(
        &self,
        user_id: i64,
        server_id: Option<i64>,
        stack_pattern: &str,
        permission: &Permission,
    ) -> Result<()> {
        if permission.is_admin_permission() {
            if self.user_is_admin(user_id)? {
                return Ok(());
            }
            return Err(Error::Forbidden(format!(
                "only administrators can grant {}",
                permission.name
            )));
        }

        let held = match server_id {
            Some(server_id) => {
                self.user_has_stack_permission(user_id, server_id, stack_pattern, &permission.name)?
            }
            None => {
                let mut held = false;
                for server_id in self.accessible_server_ids(user_id)? {
                    if self.user_has_stack_permission(
                        user_id,
                        server_id,
                        stack_pattern,
                        &permission.name,
                    )? {
                        held = true;
                        break;
                    }
                }
                held
            }
        };

        if held {
            Ok(())
        } else {
            Err(Error::Forbidden(format!(
                "you do not hold {} on stacks matching '{}'",
                permission.name, stack_pattern
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing;
    use crate::store::{IdentityStore, NewApiKey};
    use crate::types::permission::{ADMIN_USERS, FILES_READ, STACKS_READ};

    fn api_key_principal(
        store: &dyn Store,
        user_id: i64,
        scopes: &[(Option<i64>, &str, &str)],
    ) -> Principal {
        let key = store
            .create_api_key(&NewApiKey {
                user_id,
                name: "k".to_string(),
                key_hash: format!("hash-{user_id}-{}", scopes.len()),
                key_prefix: "brth_xxxxxxxx".to_string(),
                expires_at: None,
            })
            .unwrap();
        for (server_id, pattern, perm) in scopes {
            let perm = store.get_permission_by_name(perm).unwrap().unwrap();
            store
                .create_api_key_scope(key.id, *server_id, pattern, perm.id)
                .unwrap();
        }
        Principal::ApiKey {
            user_id,
            scopes: store.list_api_key_scopes(key.id).unwrap(),
            key,
        }
    }

    fn session(user_id: i64) -> Principal {
        Principal::Session {
            user_id,
            session_id: 0,
        }
    }

    #[test]
    fn test_grant_pattern_controls_stack_access() {
        let (_temp, store) = testing::store();
        let server = testing::server(&*store, "web-1");
        let (user, role) = testing::user_with_role(&*store, "dev", false);
        testing::grant(&*store, role.id, server.id, STACKS_MANAGE, "prod-*-us-*");

        let authz = Authorizer::new(store.clone());
        assert!(
            authz
                .user_has_stack_permission(user.id, server.id, "prod-web-us-east", STACKS_MANAGE)
                .unwrap()
        );
        assert!(
            !authz
                .user_has_stack_permission(user.id, server.id, "dev-web-us-east", STACKS_MANAGE)
                .unwrap()
        );
        assert!(
            !authz
                .user_has_stack_permission(user.id, server.id, "prod-web-us-east", STACKS_READ)
                .unwrap()
        );
        assert!(
            !authz
                .user_has_stack_permission(user.id, server.id + 1, "prod-web-us-east", STACKS_MANAGE)
                .unwrap()
        );
    }

    #[test]
    fn test_admin_session_is_always_allowed() {
        let (_temp, store) = testing::store();
        let server = testing::server(&*store, "web-1");
        let (admin, _) = testing::user_with_role(&*store, "root", true);

        let authz = Authorizer::new(store.clone());
        for perm in [STACKS_MANAGE, STACKS_READ, FILES_READ] {
            assert!(
                authz
                    .effective_allow(&session(admin.id), server.id, "anything", perm)
                    .unwrap()
            );
        }
        assert_eq!(authz.accessible_server_ids(admin.id).unwrap(), vec![server.id]);
        assert!(
            authz
                .user_stack_permissions(admin.id, server.id, "x")
                .unwrap()
                .contains(&STACKS_MANAGE.to_string())
        );
    }

    #[test]
    fn test_api_key_scope_mismatch_denies() {
        let (_temp, store) = testing::store();
        let one = testing::server(&*store, "one");
        let two = testing::server(&*store, "two");
        let (user, role) = testing::user_with_role(&*store, "u", false);
        testing::grant(&*store, role.id, one.id, STACKS_MANAGE, "*");

        let authz = Authorizer::new(store.clone());
        let key = api_key_principal(&*store, user.id, &[(Some(two.id), "*", STACKS_READ)]);

        assert!(
            authz
                .effective_allow(&session(user.id), one.id, "test-stack", STACKS_MANAGE)
                .unwrap()
        );
        assert!(
            !authz
                .effective_allow(&key, one.id, "test-stack", STACKS_MANAGE)
                .unwrap()
        );
    }

    #[test]
    fn test_api_key_cannot_widen_user_grants() {
        let (_temp, store) = testing::store();
        let server = testing::server(&*store, "one");
        let (user, role) = testing::user_with_role(&*store, "u", false);
        testing::grant(&*store, role.id, server.id, STACKS_READ, "app-*");

        let authz = Authorizer::new(store.clone());
        let key = api_key_principal(
            &*store,
            user.id,
            &[(None, "*", STACKS_READ), (None, "*", STACKS_MANAGE)],
        );

        for stack in ["app-web", "db", "app-"] {
            for perm in [STACKS_READ, STACKS_MANAGE] {
                let via_key = authz.effective_allow(&key, server.id, stack, perm).unwrap();
                let direct = authz
                    .user_has_stack_permission(user.id, server.id, stack, perm)
                    .unwrap();
                assert!(!via_key || direct, "{stack} {perm}");
            }
        }
        assert!(authz.effective_allow(&key, server.id, "app-web", STACKS_READ).unwrap());
    }

    #[test]
    fn test_inactive_or_expired_key_denies() {
        let (_temp, store) = testing::store();
        let server = testing::server(&*store, "one");
        let (admin, _) = testing::user_with_role(&*store, "root", true);
        let authz = Authorizer::new(store.clone());

        let mut key = api_key_principal(&*store, admin.id, &[(None, "*", STACKS_MANAGE)]);
        assert!(authz.effective_allow(&key, server.id, "s", STACKS_MANAGE).unwrap());

        if let Principal::ApiKey { key, .. } = &mut key {
            key.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
        assert!(!authz.effective_allow(&key, server.id, "s", STACKS_MANAGE).unwrap());
    }

    #[test]
    fn test_webhook_principal_rules() {
        let (_temp, store) = testing::store();
        let one = testing::server(&*store, "one");
        let two = testing::server(&*store, "two");
        let (user, role) = testing::user_with_role(&*store, "hooker", false);
        testing::grant(&*store, role.id, one.id, STACKS_MANAGE, "*");
        testing::grant(&*store, role.id, two.id, STACKS_MANAGE, "*");

        let authz = Authorizer::new(store.clone());
        let hook = Principal::Webhook {
            user_id: user.id,
            webhook_id: 1,
            stack_pattern: "prod-*".to_string(),
            server_ids: vec![one.id],
        };

        assert!(authz.effective_allow(&hook, one.id, "prod-web", STACKS_MANAGE).unwrap());
        assert!(!authz.effective_allow(&hook, two.id, "prod-web", STACKS_MANAGE).unwrap());
        assert!(!authz.effective_allow(&hook, one.id, "dev-web", STACKS_MANAGE).unwrap());
        assert!(!authz.effective_allow(&hook, one.id, "prod-web", STACKS_READ).unwrap());
        assert_eq!(authz.effective_server_ids(&hook).unwrap(), vec![one.id]);
    }

    #[test]
    fn test_scope_grants_follow_holder_permissions() {
        let (_temp, store) = testing::store();
        let server = testing::server(&*store, "one");
        let (user, role) = testing::user_with_role(&*store, "u", false);
        let (admin, _) = testing::user_with_role(&*store, "root", true);
        testing::grant(&*store, role.id, server.id, STACKS_MANAGE, "prod-*");

        let authz = Authorizer::new(store.clone());
        let manage = store.get_permission_by_name(STACKS_MANAGE).unwrap().unwrap();
        let admin_users = store.get_permission_by_name(ADMIN_USERS).unwrap().unwrap();

        assert!(authz.check_scope_grant(user.id, Some(server.id), "prod-web", &manage).is_ok());
        assert!(authz.check_scope_grant(user.id, None, "prod-api", &manage).is_ok());
        assert!(matches!(
            authz.check_scope_grant(user.id, Some(server.id), "*", &manage),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            authz.check_scope_grant(user.id, None, "*", &admin_users),
            Err(Error::Forbidden(_))
        ));
        assert!(authz.check_scope_grant(admin.id, None, "*", &admin_users).is_ok());
    }

    #[test]
    fn test_server_access_and_effective_servers() {
        let (_temp, store) = testing::store();
        let one = testing::server(&*store, "one");
        let two = testing::server(&*store, "two");
        let (user, role) = testing::user_with_role(&*store, "u", false);
        testing::grant(&*store, role.id, one.id, STACKS_READ, "*");
        testing::grant(&*store, role.id, two.id, STACKS_READ, "*");

        let authz = Authorizer::new(store.clone());
        assert!(authz.user_has_server_access(user.id, one.id).unwrap());
        let key = api_key_principal(&*store, user.id, &[(Some(two.id), "*", STACKS_READ)]);
        assert_eq!(authz.effective_server_ids(&key).unwrap(), vec![two.id]);
        assert!(!authz.principal_reaches_server(&key, one.id).unwrap());
        assert_eq!(
            authz.effective_stack_permissions(&key, two.id, "web").unwrap(),
            vec![STACKS_READ.to_string()]
        );
    }
}
