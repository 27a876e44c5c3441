//! Permission resolver.
//!
//! Answers "may user U access host H with intent X" from ownership, direct
//! grants, and role grants. Owners are always allowed. Shared principals
//! never modify host auth configuration even with a write grant; handlers
//! enforce that with the `is_owner` flag advertised here.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::db::schemas::{GrantLevel, PrincipalKind};
use crate::db::HotStore;
use crate::types::{HostId, Result, UserId};

/// Access intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Read,
    Write,
}

/// Where an allowed non-owner access came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum GrantSource {
    /// Direct grant to the user; carries the grant id
    Direct(String),
    /// Grant to a role the user holds; carries the grant id
    Role(String),
}

/// Resolution outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Access {
    pub allowed: bool,
    pub is_owner: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_source: Option<GrantSource>,
}

impl Access {
    fn denied() -> Self {
        Self {
            allowed: false,
            is_owner: false,
            grant_source: None,
        }
    }

    fn owner() -> Self {
        Self {
            allowed: true,
            is_owner: true,
            grant_source: None,
        }
    }

    fn granted(source: GrantSource) -> Self {
        Self {
            allowed: true,
            is_owner: false,
            grant_source: Some(source),
        }
    }
}

/// Resolves host access questions against the grant tables.
pub struct PermissionResolver {
    store: Arc<HotStore>,
}

impl PermissionResolver {
    pub fn new(store: Arc<HotStore>) -> Self {
        Self { store }
    }

    /// Resolve `(user, host, intent)`. A missing host resolves to denied
    /// rather than an error so callers can collapse not-found and
    /// forbidden into one response.
    pub async fn resolve(&self, user_id: &UserId, host_id: &HostId, intent: Intent) -> Result<Access> {
        let tables = self.store.read().await;

        let Some(host) = tables.host(host_id) else {
            return Ok(Access::denied());
        };

        if &host.owner_id == user_id {
            return Ok(Access::owner());
        }

        let required = match intent {
            Intent::Read => GrantLevel::Read,
            Intent::Write => GrantLevel::Write,
        };
        let now = Utc::now();
        let roles = tables.role_ids_for_user(user_id);

        let mut best: Option<GrantSource> = None;
        for grant in tables.grants_for_host(host_id) {
            if !grant.is_active_at(now) || grant.level < required {
                continue;
            }
            match grant.principal_kind {
                PrincipalKind::User if &grant.principal_id == user_id => {
                    // Direct grants win over role grants.
                    best = Some(GrantSource::Direct(grant.id.clone()));
                    break;
                }
                PrincipalKind::Role if roles.contains(&grant.principal_id) => {
                    best.get_or_insert(GrantSource::Role(grant.id.clone()));
                }
                _ => {}
            }
        }

        Ok(match best {
            Some(source) => Access::granted(source),
            None => Access::denied(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schemas::{GrantRow, HostRow, RoleRow, UserRow};
    use chrono::Duration;

    struct Fixture {
        store: Arc<HotStore>,
        owner: UserId,
        other: UserId,
        host: HostId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(HotStore::in_memory());
        let (owner, other, host);
        {
            let mut tables = store.write().await;
            let owner_row = UserRow::new("owner".into(), "$argon2id$stub".into());
            owner = owner_row.id.clone();
            tables.insert_user(owner_row).unwrap();

            let other_row = UserRow::new("other".into(), "$argon2id$stub".into());
            other = other_row.id.clone();
            tables.insert_user(other_row).unwrap();

            let host_row = HostRow::new(owner.clone(), "h1".into(), "10.0.0.1".into());
            host = host_row.id.clone();
            tables.insert_host(host_row).unwrap();
        }
        Fixture {
            store,
            owner,
            other,
            host,
        }
    }

    #[tokio::test]
    async fn test_owner_always_allowed() {
        let f = fixture().await;
        let resolver = PermissionResolver::new(f.store.clone());

        for intent in [Intent::Read, Intent::Write] {
            let access = resolver.resolve(&f.owner, &f.host, intent).await.unwrap();
            assert!(access.allowed);
            assert!(access.is_owner);
            assert!(access.grant_source.is_none());
        }
    }

    #[tokio::test]
    async fn test_non_owner_denied_without_grant() {
        let f = fixture().await;
        let resolver = PermissionResolver::new(f.store.clone());
        let access = resolver.resolve(&f.other, &f.host, Intent::Read).await.unwrap();
        assert!(!access.allowed);
    }

    #[tokio::test]
    async fn test_direct_grant_allows_read_not_write() {
        let f = fixture().await;
        {
            let mut tables = f.store.write().await;
            tables.insert_grant(GrantRow::new(
                f.host.clone(),
                PrincipalKind::User,
                f.other.clone(),
                GrantLevel::Read,
                None,
            ));
        }
        let resolver = PermissionResolver::new(f.store.clone());

        let read = resolver.resolve(&f.other, &f.host, Intent::Read).await.unwrap();
        assert!(read.allowed);
        assert!(!read.is_owner);
        assert!(matches!(read.grant_source, Some(GrantSource::Direct(_))));

        let write = resolver.resolve(&f.other, &f.host, Intent::Write).await.unwrap();
        assert!(!write.allowed);
    }

    #[tokio::test]
    async fn test_write_grant_allows_both_intents() {
        let f = fixture().await;
        {
            let mut tables = f.store.write().await;
            tables.insert_grant(GrantRow::new(
                f.host.clone(),
                PrincipalKind::User,
                f.other.clone(),
                GrantLevel::Write,
                None,
            ));
        }
        let resolver = PermissionResolver::new(f.store.clone());

        assert!(resolver.resolve(&f.other, &f.host, Intent::Read).await.unwrap().allowed);
        assert!(resolver.resolve(&f.other, &f.host, Intent::Write).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_role_grant() {
        let f = fixture().await;
        {
            let mut tables = f.store.write().await;
            let role = RoleRow::new("ops".into());
            let role_id = role.id.clone();
            tables.insert_role(role);
            tables.assign_role(f.other.clone(), role_id.clone());
            tables.insert_grant(GrantRow::new(
                f.host.clone(),
                PrincipalKind::Role,
                role_id,
                GrantLevel::Read,
                None,
            ));
        }
        let resolver = PermissionResolver::new(f.store.clone());

        let access = resolver.resolve(&f.other, &f.host, Intent::Read).await.unwrap();
        assert!(access.allowed);
        assert!(matches!(access.grant_source, Some(GrantSource::Role(_))));
    }

    #[tokio::test]
    async fn test_expired_grant_denied() {
        let f = fixture().await;
        {
            let mut tables = f.store.write().await;
            tables.insert_grant(GrantRow::new(
                f.host.clone(),
                PrincipalKind::User,
                f.other.clone(),
                GrantLevel::Read,
                Some(Utc::now() - Duration::seconds(1)),
            ));
        }
        let resolver = PermissionResolver::new(f.store.clone());
        assert!(!resolver.resolve(&f.other, &f.host, Intent::Read).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unknown_host_denied() {
        let f = fixture().await;
        let resolver = PermissionResolver::new(f.store.clone());
        let access = resolver
            .resolve(&f.other, &"no-such-host".to_string(), Intent::Read)
            .await
            .unwrap();
        assert!(!access.allowed);
    }
}
