//! Identity validation.
//!
//! Token issuance lives elsewhere; the core only asks "who is this token?".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::time::now_millis;

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub device_id: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl Identity {
    /// Create a non-admin identity.
    #[must_use]
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            is_admin: false,
        }
    }

    /// Grant the admin role.
    #[must_use]
    pub fn admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingToken,

    #[error("Invalid credential")]
    InvalidToken,

    #[error("Credential expired")]
    Expired,
}

impl AuthError {
    /// Taxonomy kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Unauthenticated
    }
}

/// Resolves a bearer credential to an identity.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    /// Validate a token.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`] for empty, unknown or expired tokens.
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Clone)]
struct Grant {
    identity: Identity,
    expires_at: Option<u64>,
}

/// Validator backed by a fixed token table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenValidator {
    grants: HashMap<String, Grant>,
}

impl StaticTokenValidator {
    /// Create an empty validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `identity`.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity, None);
        self
    }

    /// Accept `token` as `identity` until `expires_at` (ms since epoch), if given.
    pub fn insert(&mut self, token: impl Into<String>, identity: Identity, expires_at: Option<u64>) {
        self.grants.insert(
            token.into(),
            Grant {
                identity,
                expires_at,
            },
        );
    }

    /// Number of known tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.grants.len()
    }

    /// Whether no tokens are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

#[async_trait]
impl IdentityValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let grant = self.grants.get(token).ok_or(AuthError::InvalidToken)?;
        if grant.expires_at.is_some_and(|at| at <= now_millis()) {
            return Err(AuthError::Expired);
        }
        Ok(grant.identity.clone())
    }
}
