//! Function catalog
//!
//! Every operation the assistant can offer to the model, with its JSON schema
//! and access requirements. The catalog is static per deployment: the builtin
//! one describes the host application's read-only lookups, and a deployment
//! may replace it with a TOML file.

use crate::error::{AppError, AppResult};
use crate::provider::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;

/// Business data area a function reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Hr,
    Payroll,
    Leave,
    Assets,
    Subscriptions,
    Purchasing,
    Documents,
    Organization,
}

impl Domain {
    pub const ALL: [Domain; 8] = [
        Domain::Hr,
        Domain::Payroll,
        Domain::Leave,
        Domain::Assets,
        Domain::Subscriptions,
        Domain::Purchasing,
        Domain::Documents,
        Domain::Organization,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    #[serde(default = "default_parameters")]
    pub parameters: Value,
    #[serde(default)]
    pub requires_admin: bool,
    #[serde(default)]
    pub requires_domain: Option<Domain>,
}

fn default_parameters() -> Value {
    json!({"type": "object", "properties": {}})
}

impl FunctionDef {
    pub fn to_tool(&self) -> ToolDefinition {
        ToolDefinition::function(&self.name, &self.description, self.parameters.clone())
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    functions: Vec<FunctionDef>,
}

/// Ordered function catalog with name lookup
#[derive(Debug, Clone)]
pub struct FunctionCatalog {
    functions: Vec<FunctionDef>,
    index: HashMap<String, usize>,
}

impl FunctionCatalog {
    pub fn new(functions: Vec<FunctionDef>) -> AppResult<Self> {
        let mut index = HashMap::with_capacity(functions.len());
        for (i, function) in functions.iter().enumerate() {
            if function.name.trim().is_empty() {
                return Err(AppError::Config("function name cannot be empty".to_string()));
            }
            if !function.parameters.is_object() {
                return Err(AppError::Config(format!(
                    "function '{}' parameters must be a JSON schema object",
                    function.name
                )));
            }
            if index.insert(function.name.clone(), i).is_some() {
                return Err(AppError::Config(format!(
                    "duplicate function name '{}'",
                    function.name
                )));
            }
        }
        Ok(Self { functions, index })
    }

    pub fn from_toml_str(source: &str) -> AppResult<Self> {
        let file: CatalogFile = toml::from_str(source)
            .map_err(|e| AppError::Config(format!("invalid function catalog: {}", e)))?;
        Self::new(file.functions)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path_display = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            }
        })?;
        Self::from_toml_str(&content).map_err(|e| AppError::ConfigValidationFailed {
            path: path_display,
            reason: e.to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDef> {
        self.index.get(name).map(|&i| &self.functions[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.iter()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Read-only lookups exposed by the host application
    pub fn builtin() -> Self {
        let query = |description: &str| {
            json!({
                "type": "object",
                "properties": {"query": {"type": "string", "description": description}},
            })
        };
        let by_id = |field: &str, description: &str| {
            json!({
                "type": "object",
                "properties": {field: {"type": "string", "description": description}},
                "required": [field],
            })
        };
        let within_days = json!({
            "type": "object",
            "properties": {"days": {"type": "integer", "minimum": 1, "maximum": 365, "default": 30}},
        });
        let status = |values: &[&str]| {
            json!({
                "type": "object",
                "properties": {"status": {"type": "string", "enum": values}},
            })
        };
        let def = |name: &str,
                   description: &str,
                   parameters: Value,
                   requires_admin: bool,
                   requires_domain: Domain| FunctionDef {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
            requires_admin,
            requires_domain: Some(requires_domain),
        };

        let functions = vec![
            def(
                "get_organization_overview",
                "Headcount, asset, and subscription totals for the organization",
                default_parameters(),
                false,
                Domain::Organization,
            ),
            def(
                "search_employees",
                "Search employees by name, email, department, or job title",
                query("Free-text search term"),
                false,
                Domain::Hr,
            ),
            def(
                "get_employee_details",
                "Profile, department, and manager of one employee",
                by_id("employee_id", "Employee identifier"),
                false,
                Domain::Hr,
            ),
            def(
                "get_employee_count",
                "Number of employees, optionally grouped by department",
                json!({
                    "type": "object",
                    "properties": {"group_by": {"type": "string", "enum": ["department", "status"]}},
                }),
                false,
                Domain::Hr,
            ),
            def(
                "get_employee_salary",
                "Current salary structure of one employee",
                by_id("employee_id", "Employee identifier"),
                true,
                Domain::Payroll,
            ),
            def(
                "get_payroll_summary",
                "Payroll totals for a month",
                json!({
                    "type": "object",
                    "properties": {"month": {"type": "string", "description": "YYYY-MM"}},
                }),
                true,
                Domain::Payroll,
            ),
            def(
                "get_employee_loans",
                "Active loans and remaining balances",
                json!({
                    "type": "object",
                    "properties": {"employee_id": {"type": "string"}},
                }),
                true,
                Domain::Payroll,
            ),
            def(
                "get_leave_balance",
                "Remaining leave days per leave type for one employee",
                by_id("employee_id", "Employee identifier"),
                false,
                Domain::Leave,
            ),
            def(
                "get_leave_requests",
                "Leave requests filtered by status",
                status(&["pending", "approved", "rejected"]),
                false,
                Domain::Leave,
            ),
            def(
                "search_assets",
                "Search assets by name, tag, category, or assignee",
                query("Free-text search term"),
                false,
                Domain::Assets,
            ),
            def(
                "get_asset_details",
                "Details and assignment history of one asset",
                by_id("asset_id", "Asset identifier"),
                false,
                Domain::Assets,
            ),
            def(
                "get_subscriptions",
                "Software subscriptions with cost and status",
                status(&["active", "cancelled", "expired"]),
                false,
                Domain::Subscriptions,
            ),
            def(
                "get_upcoming_renewals",
                "Subscriptions renewing within a number of days",
                within_days.clone(),
                false,
                Domain::Subscriptions,
            ),
            def(
                "get_purchase_requests",
                "Purchase requests filtered by status",
                status(&["pending", "approved", "rejected", "completed"]),
                false,
                Domain::Purchasing,
            ),
            def(
                "search_documents",
                "Search company documents by title or type",
                query("Free-text search term"),
                false,
                Domain::Documents,
            ),
            def(
                "get_expiring_documents",
                "Documents expiring within a number of days",
                within_days,
                false,
                Domain::Documents,
            ),
        ];

        Self::new(functions).expect("builtin function catalog must be valid")
    }
}

impl Default for FunctionCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
