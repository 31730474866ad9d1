//! Caller identity.
//!
//! The identity provider is external; this module defines the seam ([`IdentityService`]) and
//! a static bearer-token implementation used by the bundled server and by tests.

use crate::error::IdentityError;
use async_trait::async_trait;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use std::collections::HashMap;
use std::fmt;

/// Opaque identifier of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Principal {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Principal {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Resolves the caller of a request.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Unique name of this provider, for logs.
    fn name(&self) -> &'static str;

    /// Resolve the principal behind `headers`.
    ///
    /// Return [`IdentityError::Unauthenticated`] when the caller is simply not signed in, and
    /// [`IdentityError::Unavailable`] when the provider itself could not answer.
    async fn current_principal(&self, headers: &HeaderMap) -> Result<Principal, IdentityError>;
}

/// Maps `Authorization: Bearer <token>` to a fixed principal.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenIdentity {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: impl Into<Principal>) -> Self {
        self.tokens.insert(token.into(), principal.into());
        self
    }

    pub fn from_pairs<I, T, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, P)>,
        T: Into<String>,
        P: Into<Principal>,
    {
        pairs.into_iter().fold(Self::new(), |acc, (t, p)| acc.with_token(t, p))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Extract the bearer token from an `Authorization` header, if any.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[async_trait]
impl IdentityService for StaticTokenIdentity {
    fn name(&self) -> &'static str {
        "static-token"
    }

    async fn current_principal(&self, headers: &HeaderMap) -> Result<Principal, IdentityError> {
        let token = bearer_token(headers)
            .ok_or_else(|| IdentityError::Unauthenticated("missing bearer token".into()))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| IdentityError::Unauthenticated("unknown bearer token".into()))
    }
}
