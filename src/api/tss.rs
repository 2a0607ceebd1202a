use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::{get, post},
    Json, Router,
};

use super::{ApiResult, Caller, SharedState, Success};
use crate::{
    error::CustodyError,
    model::SessionId,
    session::{SessionView, StepReply, StepRequest},
    stage::StageType,
};

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/tss/v1/triples/step/:n", post(triples))
        .route("/tss/v1/presign/step/:n", post(presign))
        .route("/tss/v1/sign/step/:n", post(sign))
        .route("/tss/v1/session/:id", get(session))
        .route("/tss/v1/session/:id/abort", post(abort))
}

/// Unwrap a JSON body, reporting a bad one in the usual envelope.
pub(super) fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, CustodyError> {
    payload
        .map(|Json(t)| t)
        .map_err(|e| CustodyError::InvalidRequest(e.body_text()))
}

async fn step(
    state: SharedState,
    stage: StageType,
    n: String,
    caller: Caller,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> ApiResult<StepReply> {
    let n: u8 = n
        .parse()
        .map_err(|_| CustodyError::InvalidStage(format!("{stage} has no step {n}")))?;
    let request = body(payload)?;
    let reply = state
        .sessions
        .step(&caller.identity, stage, n, request)
        .await?;
    Ok(Success(reply))
}

async fn triples(
    State(state): State<SharedState>,
    Path(n): Path<String>,
    caller: Caller,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> ApiResult<StepReply> {
    step(state, StageType::Triples, n, caller, payload).await
}

async fn presign(
    State(state): State<SharedState>,
    Path(n): Path<String>,
    caller: Caller,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> ApiResult<StepReply> {
    step(state, StageType::Presign, n, caller, payload).await
}

async fn sign(
    State(state): State<SharedState>,
    Path(n): Path<String>,
    caller: Caller,
    payload: Result<Json<StepRequest>, JsonRejection>,
) -> ApiResult<StepReply> {
    step(state, StageType::Sign, n, caller, payload).await
}

async fn session(
    State(state): State<SharedState>,
    Path(id): Path<SessionId>,
    caller: Caller,
) -> ApiResult<SessionView> {
    Ok(Success(
        state.sessions.session_status(&caller.identity, id).await?,
    ))
}

async fn abort(
    State(state): State<SharedState>,
    Path(id): Path<SessionId>,
    caller: Caller,
) -> ApiResult<SessionId> {
    state.sessions.abort_session(&caller.identity, id).await?;
    Ok(Success(id))
}
