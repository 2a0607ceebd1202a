use axum::{
    extract::{rejection::JsonRejection, Path, State},
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use super::{tss::body, Admin, ApiResult, SharedState, Success};
use crate::model::{NodeId, NodeStatus, WalletId};

pub(super) fn routes() -> Router<SharedState> {
    Router::new()
        .route("/admin/v1/nodes/:id/activate", post(activate))
        .route("/admin/v1/nodes/:id/deactivate", post(deactivate))
        .route("/admin/v1/threshold", post(threshold))
        .route(
            "/admin/v1/wallets/:wallet_id/nodes/:node_id/data-loss",
            post(data_loss),
        )
}

#[derive(Debug, Serialize)]
struct NodeChange {
    node_id: NodeId,
    status: NodeStatus,
}

async fn set_status(state: &SharedState, id: String, status: NodeStatus) -> ApiResult<NodeChange> {
    let node_id = NodeId(id);
    state.registry.set_node_status(&node_id, status).await?;
    Ok(Success(NodeChange { node_id, status }))
}

async fn activate(
    State(state): State<SharedState>,
    _: Admin,
    Path(id): Path<String>,
) -> ApiResult<NodeChange> {
    set_status(&state, id, NodeStatus::Active).await
}

async fn deactivate(
    State(state): State<SharedState>,
    _: Admin,
    Path(id): Path<String>,
) -> ApiResult<NodeChange> {
    set_status(&state, id, NodeStatus::Inactive).await
}

#[derive(Debug, Serialize, Deserialize)]
struct Threshold {
    threshold: usize,
}

async fn threshold(
    State(state): State<SharedState>,
    _: Admin,
    payload: Result<Json<Threshold>, JsonRejection>,
) -> ApiResult<Threshold> {
    let Threshold { threshold } = body(payload)?;
    state.registry.set_threshold(threshold).await?;
    Ok(Success(Threshold { threshold }))
}

async fn data_loss(
    State(state): State<SharedState>,
    _: Admin,
    Path((wallet_id, node_id)): Path<(WalletId, String)>,
) -> ApiResult<WalletId> {
    state
        .wallets
        .mark_data_loss(wallet_id, &NodeId(node_id))
        .await?;
    Ok(Success(wallet_id))
}
