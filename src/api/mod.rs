//! The public HTTP surface of the custody service.
//!
//! Every response uses one envelope: `{"success": true, "data": ...}` on
//! success, and `{"success": false, "code": ..., "msg": ...}` on failure,
//! where `code` is one of the [ErrorCode] strings.
use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::error;

use crate::{
    error::{CustodyError, ErrorCode},
    health::NodeHealthRegistry,
    identity::{Identity, IdentityError, IdentityVerifier},
    session::SessionStateMachine,
    wallet::WalletService,
};

mod admin;
mod keyshare;
mod tss;

/// Everything the handlers share.
pub struct AppState {
    pub sessions: SessionStateMachine,
    pub wallets: WalletService,
    pub registry: NodeHealthRegistry,
    pub identity: Arc<dyn IdentityVerifier>,
    pub admin_token: String,
}

pub type SharedState = Arc<AppState>;

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::InvalidTssSession
            | ErrorCode::InvalidTssStage
            | ErrorCode::InvalidTssTriplesResult
            | ErrorCode::InvalidTssPresignResult
            | ErrorCode::InvalidTssSignResult
            | ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::WalletNotFound => StatusCode::NOT_FOUND,
            ErrorCode::WalletAlreadyExists => StatusCode::CONFLICT,
            ErrorCode::KeyShareMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::InsufficientShares
            | ErrorCode::NodesBelowThreshold
            | ErrorCode::SignupNotReady
            | ErrorCode::ReshareNotReady => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CustodyError {
    fn into_response(self) -> Response {
        let code = self.code();
        if code == ErrorCode::UnknownError {
            error!(error = %self, "request failed");
        }
        let body = Json(json!({
            "success": false,
            "code": code.as_str(),
            "msg": self.public_message(),
        }));
        (code.http_status(), body).into_response()
    }
}

/// A successful response, wrapped in the envelope.
pub struct Success<T>(pub T);

impl<T: Serialize> IntoResponse for Success<T> {
    fn into_response(self) -> Response {
        Json(json!({ "success": true, "data": self.0 })).into_response()
    }
}

pub type ApiResult<T> = Result<Success<T>, CustodyError>;

fn bearer(parts: &Parts) -> Result<String, IdentityError> {
    let token = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();
    if token.is_empty() {
        return Err(IdentityError::MissingToken);
    }
    Ok(token.to_string())
}

/// An end user, authenticated by their bearer token.
///
/// The raw token is kept, since the custodian nodes authenticate the same
/// user with it.
pub struct Caller {
    pub identity: Identity,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<SharedState> for Caller {
    type Rejection = CustodyError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer(parts)?;
        let identity = state.identity.verify(&token).await?;
        Ok(Caller { identity, token })
    }
}

/// An operator, holding the admin token.
pub struct Admin;

#[async_trait]
impl FromRequestParts<SharedState> for Admin {
    type Rejection = CustodyError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer(parts)?;
        if state.admin_token.is_empty()
            || !bool::from(token.as_bytes().ct_eq(state.admin_token.as_bytes()))
        {
            return Err(CustodyError::Unauthorized("not an admin token".to_string()));
        }
        Ok(Admin)
    }
}

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);
    Router::new()
        .merge(tss::routes())
        .merge(keyshare::routes())
        .merge(admin::routes())
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
