//! Identity: access-token validation and service impersonation.
//!
//! - [`TokenValidator`] turns a raw bearer JWT into a request-scoped
//!   [`Principal`]. Signing keys come from a [`KeySource`]; in production that
//!   is the identity provider's JWKS endpoint ([`JwksKeySource`]).
//! - [`TokenExchangeClient`] obtains an impersonation token for a named
//!   subject (RFC 8693). It is for trusted automation and service-to-service
//!   callers only and is never reachable from an end-user request path.
//!
//! A `Principal` is created per request and passed explicitly to every
//! component that needs it; nothing in this crate stores "the current user"
//! in shared or thread-local state.

pub mod exchange;
pub mod keys;
pub mod principal;
pub mod validator;

pub use exchange::{ServiceCredential, TokenExchangeClient};
pub use keys::{JwksKeySource, KeySource, StaticKeySource};
pub use principal::Principal;
pub use validator::TokenValidator;
