//! Resolving bearer tokens to end users.
//!
//! Real deployments verify OAuth tokens; that logic lives behind
//! [IdentityVerifier]. The [StaticTokenVerifier] maps a fixed set of tokens to
//! users, for local clusters and tests.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
}

/// An authenticated end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError>;
}

/// A token, and who holds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    grants: Vec<TokenGrant>,
}

impl StaticTokenVerifier {
    pub fn new(grants: Vec<TokenGrant>) -> Self {
        Self { grants }
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::MissingToken);
        }
        // Compare against every grant, so timing says nothing about which matched.
        let mut found = None;
        for grant in &self.grants {
            if bool::from(grant.token.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(grant);
            }
        }
        found
            .map(|g| Identity {
                user_id: g.user_id.clone(),
                email: g.email.clone(),
            })
            .ok_or(IdentityError::InvalidToken)
    }
}
