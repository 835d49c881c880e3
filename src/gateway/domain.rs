//! Per-domain service adapters.
//!
//! Every business domain is a thin [`DomainService`] over the shared
//! confirmation core: it knows its storage prefix, its tool table and how to
//! reach the backing service. Sensitive tools are never invoked directly; they
//! become a pending confirmation and run only once the proposer approves.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::confirmation::{
    ActionExecutor, ActionProposal, ConfirmationMachine, ConfirmationOutcome, PendingConfirmation,
};
use crate::config::{DomainServiceConfig, ToolConfig};
use crate::identity::Principal;
use crate::{Error, Result};

/// Header carrying the caller's subject to domain services.
pub const SUBJECT_HEADER: &str = "x-principal-subject";
/// Header carrying the caller's username to domain services.
pub const USERNAME_HEADER: &str = "x-principal-username";
/// Header carrying the caller's comma-separated roles to domain services.
pub const ROLES_HEADER: &str = "x-principal-roles";

/// Runs a non-sensitive tool against a domain service.
#[async_trait::async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` with `arguments` for `principal`.
    async fn invoke(
        &self,
        principal: &Principal,
        tool: &str,
        arguments: &Value,
    ) -> anyhow::Result<Value>;
}

/// Result of a tool call routed through the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResponse {
    /// The tool ran.
    Completed(Value),
    /// The tool is sensitive; the action waits for confirmation.
    PendingConfirmation(PendingConfirmation),
}

/// One business domain behind the gateway.
pub struct DomainService {
    domain: String,
    key_prefix: String,
    tools: HashMap<String, ToolConfig>,
    machine: ConfirmationMachine,
    invoker: Arc<dyn ToolInvoker>,
    executor: Arc<dyn ActionExecutor>,
}

impl DomainService {
    /// Create a domain adapter with explicit collaborators.
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        config: &DomainServiceConfig,
        machine: ConfirmationMachine,
        invoker: Arc<dyn ToolInvoker>,
        executor: Arc<dyn ActionExecutor>,
    ) -> Self {
        Self {
            domain: domain.into(),
            key_prefix: config.service_key_prefix.clone(),
            tools: config
                .tools
                .iter()
                .map(|t| (t.name.clone(), t.clone()))
                .collect(),
            machine,
            invoker,
            executor,
        }
    }

    /// Create a domain adapter that talks HTTP to `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the base URL is invalid.
    pub fn from_config(
        domain: impl Into<String>,
        config: &DomainServiceConfig,
        machine: ConfirmationMachine,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Arc::new(HttpDomainService::new(&config.base_url, timeout)?);
        Ok(Self::new(domain, config, machine, http.clone(), http))
    }

    /// Domain name.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Storage namespace for this domain's confirmations.
    #[must_use]
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Look up a configured tool.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownTool` if the tool is not configured.
    pub fn tool(&self, name: &str) -> Result<&ToolConfig> {
        self.tools
            .get(name)
            .ok_or_else(|| Error::UnknownTool(format!("{}/{name}", self.domain)))
    }

    /// Route a tool call: invoke it, or propose it when it is sensitive.
    ///
    /// Authorization must already have been checked by the caller.
    ///
    /// # Errors
    ///
    /// `UnknownTool`, any confirmation store error for sensitive tools, or
    /// `Internal` when the domain service call fails.
    pub async fn call_tool(
        &self,
        principal: &Principal,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolResponse> {
        let tool = self.tool(tool_name)?;

        if tool.sensitive {
            let summary = render_summary(tool, &arguments);
            let proposal = ActionProposal::new(tool_name, summary, arguments);
            let pending = self
                .machine
                .propose(principal, &self.key_prefix, proposal)
                .await?;
            return Ok(ToolResponse::PendingConfirmation(pending));
        }

        debug!(domain = %self.domain, tool = tool_name, "Invoking tool");
        self.invoker
            .invoke(principal, tool_name, &arguments)
            .await
            .map(ToolResponse::Completed)
            .map_err(|e| {
                warn!(domain = %self.domain, tool = tool_name, error = %e, "Tool call failed");
                Error::Internal(format!("{}/{tool_name} failed: {e:#}", self.domain))
            })
    }

    /// Decide one of this domain's pending confirmations.
    ///
    /// # Errors
    ///
    /// See [`ConfirmationMachine::confirm`].
    pub async fn confirm(
        &self,
        principal: &Principal,
        confirmation_id: &str,
        approve: bool,
    ) -> Result<ConfirmationOutcome> {
        self.machine
            .confirm(
                principal,
                &self.key_prefix,
                confirmation_id,
                approve,
                self.executor.as_ref(),
            )
            .await
    }
}

/// Fill `{field}` placeholders in the tool's summary from top-level arguments.
fn render_summary(tool: &ToolConfig, arguments: &Value) -> String {
    let Some(template) = tool.summary.as_deref() else {
        return format!("Run '{}'", tool.name);
    };
    let Some(fields) = arguments.as_object() else {
        return template.to_string();
    };
    fields.iter().fold(template.to_string(), |acc, (key, value)| {
        let rendered = match value {
            Value::String(s) => s.clone(),
            v => v.to_string(),
        };
        acc.replace(&format!("{{{key}}}"), &rendered)
    })
}

/// All configured domains.
#[derive(Default)]
pub struct DomainRegistry {
    services: BTreeMap<String, Arc<DomainService>>,
}

impl DomainRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a domain service under its name.
    pub fn register(&mut self, service: DomainService) {
        info!(
            domain = %service.domain,
            prefix = %service.key_prefix,
            tools = service.tools.len(),
            "Registered domain service"
        );
        self.services
            .insert(service.domain.clone(), Arc::new(service));
    }

    /// Look up a domain.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDomain` if it is not registered.
    pub fn get(&self, domain: &str) -> Result<Arc<DomainService>> {
        self.services
            .get(domain)
            .cloned()
            .ok_or_else(|| Error::UnknownDomain(domain.to_string()))
    }

    /// Number of registered domains.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no domain is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Domain service reached over HTTP.
///
/// Tools are `POST {base_url}/tools/{tool}`; confirmed actions are
/// `POST {base_url}/actions/{action}`. The caller's identity travels in the
/// `x-principal-*` headers.
pub struct HttpDomainService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDomainService {
    /// Create a client for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid URL or `Error::Http` if the
    /// client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        url::Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid domain base_url '{base_url}': {e}")))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, principal: &Principal, path: &str, body: &Value) -> anyhow::Result<Value> {
        let url = format!("{}/{path}", self.base_url);
        let roles = principal.roles.iter().cloned().collect::<Vec<_>>().join(",");

        let mut request = self
            .http
            .post(&url)
            .header(SUBJECT_HEADER, &principal.subject)
            .header(ROLES_HEADER, roles)
            .json(body);
        if let Some(username) = &principal.username {
            request = request.header(USERNAME_HEADER, username);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("{url} returned HTTP {status}");
        }

        let bytes = response.bytes().await.context("reading response body")?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).context("response is not JSON")
    }
}

#[async_trait::async_trait]
impl ToolInvoker for HttpDomainService {
    async fn invoke(
        &self,
        principal: &Principal,
        tool: &str,
        arguments: &Value,
    ) -> anyhow::Result<Value> {
        self.post(principal, &format!("tools/{tool}"), arguments).await
    }
}

#[async_trait::async_trait]
impl ActionExecutor for HttpDomainService {
    async fn execute(
        &self,
        principal: &Principal,
        action: &str,
        payload: &Value,
    ) -> anyhow::Result<Value> {
        self.post(principal, &format!("actions/{action}"), payload)
            .await
    }
}
