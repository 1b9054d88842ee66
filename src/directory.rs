//! Actor and organization directory
//!
//! The host application owns members and tenants. The core only needs to
//! know, per request, who the actor is, what role they hold, which
//! subscription tier their organization is on, and any custom budget.

use crate::ids::{ActorId, OrgId};
use crate::store::StoreResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Member role inside an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Manager,
    Member,
}

impl Role {
    /// Owners and admins may see salary, payroll, and loan data
    pub fn is_elevated(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Member => "member",
        }
    }

    pub const ALL: [Role; 4] = [Role::Owner, Role::Admin, Role::Manager, Role::Member];
}

/// Subscription tier, which selects default quota sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Plus,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Plus => "plus",
        }
    }
}

/// An authenticated member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub org: OrgId,
    pub role: Role,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrgId,
    pub name: String,
    #[serde(default)]
    pub tier: SubscriptionTier,
    /// Custom monthly token budget; overrides every tier and deployment default
    #[serde(default)]
    pub monthly_token_budget: Option<u64>,
    /// Days a new conversation is kept; 0 keeps it forever
    #[serde(default)]
    pub chat_retention_days: u32,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn actor(&self, id: &ActorId) -> StoreResult<Option<Actor>>;

    async fn organization(&self, id: &OrgId) -> StoreResult<Option<Organization>>;

    async fn organizations(&self) -> StoreResult<Vec<Organization>>;

    /// Members allowed to receive administrative notifications
    async fn org_admins(&self, org: &OrgId) -> StoreResult<Vec<Actor>>;
}

/// Directory seeded once from configuration
#[derive(Debug, Default)]
pub struct StaticDirectory {
    organizations: HashMap<OrgId, Organization>,
    actors: HashMap<ActorId, Actor>,
}

impl StaticDirectory {
    pub fn new(organizations: Vec<Organization>, actors: Vec<Actor>) -> Self {
        Self {
            organizations: organizations
                .into_iter()
                .map(|o| (o.id.clone(), o))
                .collect(),
            actors: actors.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn actor(&self, id: &ActorId) -> StoreResult<Option<Actor>> {
        Ok(self.actors.get(id).cloned())
    }

    async fn organization(&self, id: &OrgId) -> StoreResult<Option<Organization>> {
        Ok(self.organizations.get(id).cloned())
    }

    async fn organizations(&self) -> StoreResult<Vec<Organization>> {
        let mut orgs: Vec<Organization> = self.organizations.values().cloned().collect();
        orgs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(orgs)
    }

    async fn org_admins(&self, org: &OrgId) -> StoreResult<Vec<Actor>> {
        let mut admins: Vec<Actor> = self
            .actors
            .values()
            .filter(|a| &a.org == org && a.role.is_elevated())
            .cloned()
            .collect();
        admins.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(admins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(id: &str, org: &str, role: Role) -> Actor {
        Actor {
            id: ActorId::from(id),
            org: OrgId::from(org),
            role,
            display_name: None,
        }
    }

    #[test]
    fn test_elevated_roles() {
        assert!(Role::Owner.is_elevated());
        assert!(Role::Admin.is_elevated());
        assert!(!Role::Manager.is_elevated());
        assert!(!Role::Member.is_elevated());
    }

    #[tokio::test]
    async fn test_org_admins_only_lists_elevated_members_of_that_org() {
        let directory = StaticDirectory::new(
            vec![],
            vec![
                actor("a", "acme", Role::Owner),
                actor("b", "acme", Role::Member),
                actor("c", "acme", Role::Admin),
                actor("d", "other", Role::Admin),
            ],
        );
        let admins = directory.org_admins(&OrgId::from("acme")).await.unwrap();
        let ids: Vec<&str> = admins.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_organization_defaults_from_toml() {
        let org: Organization = toml::from_str(
            r#"
id = "acme"
name = "Acme Ltd"
"#,
        )
        .unwrap();
        assert_eq!(org.tier, SubscriptionTier::Free);
        assert_eq!(org.monthly_token_budget, None);
        assert_eq!(org.chat_retention_days, 0);
    }
}
