//! Role-based capability gate over the function catalog
//!
//! Disallowed functions are never offered to the model, and
//! [`PermissionFilter::authorize`] re-checks every call the model makes
//! before it is executed.

mod catalog;

pub use catalog::{Domain, FunctionCatalog, FunctionDef};

use crate::directory::Role;
use crate::error::{AppError, AppResult};
use crate::provider::ToolDefinition;
use std::collections::{HashMap, HashSet};

/// Role to domain allow-list
#[derive(Debug, Clone, PartialEq)]
pub struct RoleDomains {
    allowed: HashMap<Role, HashSet<Domain>>,
}

impl Default for RoleDomains {
    fn default() -> Self {
        let everything: HashSet<Domain> = Domain::ALL.into_iter().collect();
        let manager: HashSet<Domain> = Domain::ALL
            .into_iter()
            .filter(|d| *d != Domain::Payroll)
            .collect();
        let member: HashSet<Domain> = [
            Domain::Leave,
            Domain::Assets,
            Domain::Documents,
            Domain::Organization,
        ]
        .into_iter()
        .collect();

        Self {
            allowed: HashMap::from([
                (Role::Owner, everything.clone()),
                (Role::Admin, everything),
                (Role::Manager, manager),
                (Role::Member, member),
            ]),
        }
    }
}

impl RoleDomains {
    /// Replace the allow-list of selected roles; other roles keep their defaults
    pub fn with_overrides(overrides: HashMap<Role, Vec<Domain>>) -> Self {
        let mut domains = Self::default();
        for (role, list) in overrides {
            domains.allowed.insert(role, list.into_iter().collect());
        }
        domains
    }

    pub fn allows(&self, role: Role, domain: Domain) -> bool {
        self.allowed
            .get(&role)
            .is_some_and(|domains| domains.contains(&domain))
    }
}

#[derive(Debug, Clone)]
pub struct PermissionFilter {
    catalog: FunctionCatalog,
    role_domains: RoleDomains,
}

impl Default for PermissionFilter {
    fn default() -> Self {
        Self::new(FunctionCatalog::builtin(), RoleDomains::default())
    }
}

impl PermissionFilter {
    pub fn new(catalog: FunctionCatalog, role_domains: RoleDomains) -> Self {
        Self {
            catalog,
            role_domains,
        }
    }

    pub fn catalog(&self) -> &FunctionCatalog {
        &self.catalog
    }

    /// Unknown names are never accessible; admin and domain gates must both pass
    pub fn can_access_function(&self, name: &str, role: Role) -> bool {
        let Some(function) = self.catalog.get(name) else {
            return false;
        };
        if function.requires_admin && !role.is_elevated() {
            return false;
        }
        match function.requires_domain {
            Some(domain) => self.role_domains.allows(role, domain),
            None => true,
        }
    }

    /// Names of the functions `role` may call, in catalog order
    pub fn accessible_functions(&self, role: Role) -> Vec<String> {
        self.catalog
            .iter()
            .filter(|f| self.can_access_function(&f.name, role))
            .map(|f| f.name.clone())
            .collect()
    }

    /// Tool definitions to offer the model for `role`
    pub fn tools_for(&self, role: Role) -> Vec<ToolDefinition> {
        self.catalog
            .iter()
            .filter(|f| self.can_access_function(&f.name, role))
            .map(FunctionDef::to_tool)
            .collect()
    }

    /// Execution-time re-check of a model-requested call
    pub fn authorize(&self, name: &str, role: Role) -> AppResult<()> {
        if self.can_access_function(name, role) {
            Ok(())
        } else {
            Err(AppError::PermissionDenied(format!(
                "function '{}' is not available to role '{}'",
                name,
                role.as_str()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_function_is_denied() {
        let filter = PermissionFilter::default();
        assert!(!filter.can_access_function("drop_all_tables", Role::Owner));
    }

    #[test]
    fn test_admin_only_functions_require_elevated_role() {
        let filter = PermissionFilter::default();
        assert!(filter.can_access_function("get_employee_salary", Role::Owner));
        assert!(filter.can_access_function("get_employee_salary", Role::Admin));
        assert!(!filter.can_access_function("get_employee_salary", Role::Manager));
        assert!(!filter.can_access_function("get_employee_salary", Role::Member));
    }

    #[test]
    fn test_domain_gate_applies_to_non_admin_functions() {
        let filter = PermissionFilter::default();
        assert!(filter.can_access_function("search_employees", Role::Manager));
        assert!(!filter.can_access_function("search_employees", Role::Member));
        assert!(filter.can_access_function("get_leave_balance", Role::Member));
    }

    #[test]
    fn test_both_gates_must_pass() {
        let overrides = HashMap::from([(Role::Admin, vec![Domain::Hr])]);
        let filter = PermissionFilter::new(
            FunctionCatalog::builtin(),
            RoleDomains::with_overrides(overrides),
        );
        // elevated, but payroll is no longer in the admin allow-list
        assert!(!filter.can_access_function("get_employee_salary", Role::Admin));
        assert!(filter.can_access_function("get_employee_salary", Role::Owner));
    }

    #[test]
    fn test_member_catalog_never_contains_admin_functions() {
        let filter = PermissionFilter::default();
        for role in [Role::Manager, Role::Member] {
            for tool in filter.tools_for(role) {
                let def = filter.catalog().get(&tool.function.name).unwrap();
                assert!(!def.requires_admin, "{} leaked to {:?}", def.name, role);
            }
        }
    }

    #[test]
    fn test_accessible_functions_matches_tools() {
        let filter = PermissionFilter::default();
        for role in Role::ALL {
            let names = filter.accessible_functions(role);
            let tools: Vec<String> = filter
                .tools_for(role)
                .into_iter()
                .map(|t| t.function.name)
                .collect();
            assert_eq!(names, tools);
        }
        assert_eq!(filter.accessible_functions(Role::Owner).len(), 16);
    }

    #[test]
    fn test_authorize_returns_permission_denied() {
        let filter = PermissionFilter::default();
        assert!(filter.authorize("get_payroll_summary", Role::Admin).is_ok());
        assert!(matches!(
            filter.authorize("get_payroll_summary", Role::Member),
            Err(AppError::PermissionDenied(_))
        ));
    }
}
