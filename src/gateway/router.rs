//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, error, info};

use super::auth::authenticate;
use super::domain::{DomainRegistry, ToolResponse};
use crate::audit::{AuditEvent, AuditSink};
use crate::config::ServerConfig;
use crate::defense::PromptDefense;
use crate::identity::{Principal, TokenValidator};
use crate::policy::{AccessLevel, Decision, RolePolicyEngine};
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// Access token validator
    pub validator: Arc<TokenValidator>,
    /// Domain role policy
    pub policy: Arc<RolePolicyEngine>,
    /// Configured domain services
    pub domains: Arc<DomainRegistry>,
    /// Prompt defense pipeline
    pub defense: Arc<PromptDefense>,
    /// Audit sink
    pub audit: AuditSink,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), error = %self, "Request failed");
        } else {
            debug!(code = self.code(), error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        }));
        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = format!("Bearer error=\"invalid_token\", error_code=\"{}\"", self.code());
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let protected = Router::new()
        .route("/v1/tools/{domain}/{tool}", post(tool_handler))
        .route("/v1/domains/{domain}/confirm", post(confirm_handler))
        .route("/v1/prompt/prepare", post(prepare_handler))
        .route("/v1/prompt/scan", post(scan_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            authenticate,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(CatchPanicLayer::new())
                .layer(RequestBodyLimitLayer::new(server.max_body_size))
                .layer(TimeoutLayer::new(server.request_timeout)),
        )
        .with_state(state)
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "domains": state.domains.len(),
    }))
}

/// Check access and audit refusals.
fn authorize(
    state: &AppState,
    principal: &Principal,
    domain: &str,
    access: AccessLevel,
) -> Result<()> {
    if state.policy.bypass_refused(principal) {
        state
            .audit
            .record(AuditEvent::superuser_refused(principal, domain));
    }
    let decision = state.policy.decide(principal, domain, access);
    if decision.is_allowed() {
        return Ok(());
    }

    let reason = match decision {
        Decision::UnknownDomain => "unknown_domain",
        Decision::SuperuserRefused => "superuser_refused",
        _ => "no_matching_role",
    };
    state.audit.record(AuditEvent::authz_denied(
        principal,
        domain,
        &access.to_string(),
        reason,
    ));
    Err(Error::InsufficientPermissions {
        domain: domain.to_string(),
        access: access.to_string(),
    })
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(v)| v)
        .map_err(|rejection| Error::InvalidRequest(rejection.body_text()))
}

/// Scope a caller-chosen session id to the principal, so one user can never
/// address another user's delimiter set.
fn scoped_session(principal: &Principal, session_id: &str) -> Result<String> {
    if session_id.trim().is_empty() {
        return Err(Error::InvalidRequest("sessionId must not be empty".into()));
    }
    Ok(format!("{}:{session_id}", principal.subject))
}

/// Tool call handler
async fn tool_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((domain, tool)): Path<(String, String)>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    let arguments = json_body(body)?;
    let service = state.domains.get(&domain)?;
    // Callers without any access to the domain must not learn its tool names.
    let access = match service.tool(&tool) {
        Ok(config) => config.access,
        Err(unknown) => {
            authorize(&state, &principal, &domain, AccessLevel::Read)?;
            return Err(unknown);
        }
    };
    authorize(&state, &principal, &domain, access)?;

    match service.call_tool(&principal, &tool, arguments).await? {
        ToolResponse::Completed(result) => Ok(Json(json!({
            "status": "completed",
            "result": result,
        }))
        .into_response()),
        ToolResponse::PendingConfirmation(pending) => {
            info!(
                domain = %domain,
                tool = %tool,
                subject = %principal.subject,
                "Sensitive tool call awaiting confirmation"
            );
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "pending_confirmation",
                    "confirmationId": pending.confirmation_id,
                    "expiresAt": pending.expires_at,
                    "summary": pending.summary,
                })),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    confirmation_id: String,
    approve: bool,
}

/// Confirmation handler
async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(domain): Path<String>,
    body: std::result::Result<Json<ConfirmRequest>, JsonRejection>,
) -> Result<Response> {
    let request = json_body(body)?;
    let service = state.domains.get(&domain)?;
    authorize(&state, &principal, &domain, AccessLevel::Write)?;

    let outcome = service
        .confirm(&principal, &request.confirmation_id, request.approve)
        .await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrepareRequest {
    session_id: String,
    text: String,
}

/// Outbound prompt preparation handler
async fn prepare_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    body: std::result::Result<Json<PrepareRequest>, JsonRejection>,
) -> Result<Response> {
    let request = json_body(body)?;
    let session = scoped_session(&principal, &request.session_id)?;
    let prepared = state.defense.prepare(&session, &request.text);
    Ok(Json(prepared).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScanRequest {
    session_id: String,
    text: String,
    #[serde(default)]
    strict: Option<bool>,
}

/// Inbound (model output) scan handler
async fn scan_handler(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    body: std::result::Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Response> {
    let request = json_body(body)?;
    let session = scoped_session(&principal, &request.session_id)?;
    let strict = request
        .strict
        .unwrap_or_else(|| state.defense.strict_default());
    let result = state.defense.scan_inbound(&session, &request.text, strict)?;
    Ok(Json(result).into_response())
}
