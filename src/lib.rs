//! aigate - Governed AI assistant core for multi-tenant business applications
//!
//! This library gates, meters, audits, and drives a conversational
//! tool-calling loop against an external LLM provider on behalf of many
//! tenants sharing a cost budget.
//!
//! Request flow: [`limits`] (admission, zero cost) → [`sanitizer`]
//! (hard block or flag) → [`permissions`] (tool catalog) → [`chat`]
//! (LLM + tools) → [`audit`]. [`budget`] alerts run periodically from
//! [`maintenance`].

pub mod assistant;
pub mod audit;
pub mod budget;
pub mod chat;
pub mod cli;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod limits;
pub mod maintenance;
pub mod metrics;
pub mod middleware;
pub mod notify;
pub mod permissions;
pub mod provider;
pub mod sanitizer;
pub mod store;
pub mod telemetry;
pub mod tools;
