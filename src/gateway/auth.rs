//! Authentication middleware
//!
//! Every protected route passes through [`authenticate`]: the bearer token is
//! validated and the resulting [`Principal`] is injected into the request
//! extensions for downstream handlers. Failures never reach a handler.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use super::router::AppState;
use crate::Error;
use crate::audit::AuditEvent;
use crate::identity::Principal;

/// Extract the bearer token from an `Authorization` header value.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Authentication middleware
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    let Some(token) = token else {
        warn!(path = %path, "Missing bearer token");
        let err = Error::TokenMalformed("missing bearer token".into());
        state.audit.record(AuditEvent::auth_failure(err.code()));
        return err.into_response();
    };

    match state.validator.validate(token).await {
        Ok(principal) => {
            debug!(subject = %principal.subject, path = %path, "Authenticated request");
            state.audit.record(AuditEvent::auth_success(&principal));
            request.extensions_mut().insert::<Principal>(principal);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, code = e.code(), error = %e, "Token rejected");
            state.audit.record(AuditEvent::auth_failure(e.code()));
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("BEARER  abc "), Some("abc"));
    }

    #[test]
    fn other_schemes_and_empty_tokens_are_ignored() {
        assert_eq!(bearer_token("Basic dXNlcjpwYXNz"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Bearer"), None);
    }
}
