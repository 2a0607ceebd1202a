use axum::{
    extract::{rejection::JsonRejection, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use super::{tss::body, ApiResult, Caller, SharedState, Success};
use crate::{
    compat::CurveType,
    health::ClusterReadiness,
    reshare::ReshareOutcome,
    wallet::{CurveRequest, SigninResponse, SignupRequest, SignupResponse},
};

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/keyshare/v1/signup", post(signup))
        .route("/keyshare/v1/signin", post(signin))
        .route("/keyshare/v1/reshare", post(reshare))
        .route("/keyshare/v1/status", get(status))
}

async fn signup(
    State(state): State<SharedState>,
    caller: Caller,
    payload: Result<Json<SignupRequest>, JsonRejection>,
) -> ApiResult<SignupResponse> {
    let request = body(payload)?;
    let response = state
        .wallets
        .signup(&caller.identity, &caller.token, request)
        .await?;
    Ok(Success(response))
}

async fn signin(
    State(state): State<SharedState>,
    caller: Caller,
    payload: Result<Json<CurveRequest>, JsonRejection>,
) -> ApiResult<SigninResponse> {
    let request = body(payload)?;
    let response = state
        .wallets
        .signin(&caller.identity, &caller.token, request.curve_type)
        .await?;
    Ok(Success(response))
}

async fn reshare(
    State(state): State<SharedState>,
    caller: Caller,
    payload: Result<Json<CurveRequest>, JsonRejection>,
) -> ApiResult<ReshareOutcome> {
    let request = body(payload)?;
    let outcome = state
        .wallets
        .reshare(&caller.identity, &caller.token, request.curve_type)
        .await?;
    Ok(Success(outcome))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    curve_type: Option<CurveType>,
}

/// Cluster readiness, plus the caller's wallet signals if a curve is given.
async fn status(
    State(state): State<SharedState>,
    caller: Caller,
    Query(query): Query<StatusQuery>,
) -> ApiResult<ClusterReadiness> {
    let wallet_id = match query.curve_type {
        Some(curve_type) => state
            .wallets
            .wallet_for(&caller.identity, curve_type)
            .await?
            .map(|w| w.wallet_id),
        None => None,
    };
    Ok(Success(state.registry.readiness(wallet_id).await?))
}
