//! Domain action executors.

use serde_json::Value;

use crate::identity::Principal;

/// Performs a confirmed action for one domain service.
///
/// Called at most once per confirmation, after the pending record has already
/// been consumed. Failures are reported as-is; the caller is told the action
/// was attempted and nothing is retried.
#[async_trait::async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute `action` with `payload` on behalf of `principal`.
    async fn execute(
        &self,
        principal: &Principal,
        action: &str,
        payload: &Value,
    ) -> anyhow::Result<Value>;
}
