// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Caller identity.
//
// Credential verification and workspace discovery are handled elsewhere; the
// gateway only needs the resolved record. The default resolver maps the
// caller's bearer key onto identities declared in config.

use std::collections::HashMap;
use std::fmt;

use axum::http::HeaderMap;

use crate::error::{AuthFailure, GatewayError};

/// Everything the gateway needs to act on behalf of one upstream account.
///
/// Immutable for the lifetime of a request and shared by every concurrent
/// request presenting the same key.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: String,
    pub bus_credential: String,
    pub bus_client_id: String,
    pub control_plane_token: String,
}

impl Identity {
    /// Bus channel this identity's frames are published on.
    pub fn channel(&self) -> String {
        format!("{}:{}", self.account_id, self.bus_client_id)
    }
}

// Secrets stay out of logs and panic messages.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("account_id", &self.account_id)
            .field("bus_client_id", &self.bus_client_id)
            .finish_non_exhaustive()
    }
}

/// Resolves the inbound request's credentials into an `Identity`.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Result<Identity, GatewayError>;
}

/// Resolver backed by the `identities` table from config.
pub struct StaticIdentityResolver {
    identities: HashMap<String, Identity>,
}

impl StaticIdentityResolver {
    pub fn new(identities: HashMap<String, Identity>) -> Self {
        Self { identities }
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn resolve(&self, headers: &HeaderMap) -> Result<Identity, GatewayError> {
        let key = bearer_token(headers).ok_or(GatewayError::Authentication(AuthFailure::Missing))?;
        self.identities
            .get(key)
            .cloned()
            .ok_or(GatewayError::Authentication(AuthFailure::Rejected))
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn identity(account: &str) -> Identity {
        Identity {
            account_id: account.to_string(),
            bus_credential: "secret-bus".to_string(),
            bus_client_id: "client-1".to_string(),
            control_plane_token: "secret-cp".to_string(),
        }
    }

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(value).unwrap());
        headers
    }

    fn resolver() -> StaticIdentityResolver {
        let mut identities = HashMap::new();
        identities.insert("sk-good".to_string(), identity("acct-1"));
        StaticIdentityResolver::new(identities)
    }

    #[test]
    fn known_key_resolves() {
        let resolved = resolver().resolve(&headers_with_auth("Bearer sk-good")).unwrap();
        assert_eq!(resolved.account_id, "acct-1");
    }

    #[test]
    fn scheme_is_case_insensitive() {
        assert!(resolver().resolve(&headers_with_auth("bearer sk-good")).is_ok());
    }

    #[test]
    fn missing_header_is_missing_credential() {
        let err = resolver().resolve(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(AuthFailure::Missing)));
    }

    #[test]
    fn non_bearer_scheme_is_missing_credential() {
        let err = resolver().resolve(&headers_with_auth("Basic abc")).unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(AuthFailure::Missing)));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = resolver().resolve(&headers_with_auth("Bearer sk-bad")).unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(AuthFailure::Rejected)));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let rendered = format!("{:?}", identity("acct-1"));
        assert!(rendered.contains("acct-1"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn channel_combines_account_and_client() {
        assert_eq!(identity("acct-9").channel(), "acct-9:client-1");
    }
}
