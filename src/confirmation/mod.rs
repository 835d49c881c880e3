//! Human-in-the-loop confirmation of sensitive actions.
//!
//! A domain service that wants to perform a sensitive write first
//! [proposes](ConfirmationMachine::propose) it. The proposal is stored as a
//! [`PendingConfirmation`] in a [`ConfirmationStore`] and its id is handed to
//! the user. Only the proposing principal can later
//! [confirm](ConfirmationMachine::confirm) or reject it, and a confirmed action
//! reaches its [`ActionExecutor`] at most once.

mod executor;
mod machine;
mod record;
#[cfg(feature = "redis")]
mod redis_store;
mod store;

use std::sync::Arc;

pub use executor::ActionExecutor;
pub use machine::ConfirmationMachine;
pub use record::{ActionProposal, ConfirmationOutcome, ConfirmationStatus, PendingConfirmation};
#[cfg(feature = "redis")]
pub use redis_store::RedisConfirmationStore;
pub use store::{
    ConfirmationStore, InMemoryConfirmationStore, generate_confirmation_id, spawn_reaper,
    storage_key,
};

use crate::config::{ConfirmationBackend, ConfirmationConfig};
use crate::Result;

/// Build the configured store backend.
///
/// The in-memory backend gets a reaper that stops when `shutdown` fires.
///
/// # Errors
///
/// Returns `Error::Config` if the Redis backend is selected without the
/// `redis` feature, or the connection error if Redis is unreachable.
pub async fn store_from_config(
    config: &ConfirmationConfig,
    shutdown: tokio::sync::broadcast::Receiver<()>,
) -> Result<Arc<dyn ConfirmationStore>> {
    match config.backend {
        ConfirmationBackend::Memory => {
            let store: Arc<dyn ConfirmationStore> = Arc::new(InMemoryConfirmationStore::new());
            spawn_reaper(Arc::clone(&store), config.reaper_interval, shutdown);
            Ok(store)
        }
        #[cfg(feature = "redis")]
        ConfirmationBackend::Redis => {
            drop(shutdown);
            Ok(Arc::new(RedisConfirmationStore::connect(&config.redis_url).await?))
        }
        #[cfg(not(feature = "redis"))]
        ConfirmationBackend::Redis => {
            drop(shutdown);
            Err(crate::Error::Config(
                "confirmation.backend is 'redis' but the redis feature is disabled".into(),
            ))
        }
    }
}
