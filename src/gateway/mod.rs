//! Gateway HTTP boundary
//!
//! Requests are authenticated ([`auth`]), authorized against the role matrix
//! and routed to per-domain adapters ([`domain`]). Sensitive tool calls go
//! through the confirmation core; prompt text goes through the defense
//! pipeline.

pub mod auth;
pub mod domain;
mod router;
mod server;

pub use domain::{DomainRegistry, DomainService, HttpDomainService, ToolInvoker, ToolResponse};
pub use router::{AppState, create_router};
pub use server::Gateway;
