//! HITL Gateway Library
//!
//! Security core of a gateway that lets an LLM assistant call business tools
//! on behalf of a signed-in user.
//!
//! # Features
//!
//! - **Identity**: OIDC access token validation against a cached JWKS, and
//!   RFC 8693 token exchange for automation identities
//! - **Authorization**: per-domain read/write role matrix with a guarded
//!   superuser bypass
//! - **Human-in-the-loop**: sensitive actions become pending confirmations that
//!   run at most once, only for the proposer, only before they expire
//! - **Prompt defense**: PII redaction, per-session randomized delimiters and
//!   output scanning for leakage
//! - **Audit**: structured security events forwarded without blocking requests

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod confirmation;
pub mod defense;
pub mod error;
pub mod failsafe;
pub mod gateway;
pub mod identity;
pub mod policy;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
