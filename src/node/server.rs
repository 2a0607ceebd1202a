//! A custodian node, keeping shares in memory.
//!
//! This is enough to run a local cluster, and to test the custody service
//! against real HTTP.
use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use super::{NodeStatusBody, ShareBody, ShareQuery, StoreShareBody};

#[derive(Debug, Default, Clone)]
pub struct NodeState {
    shares: Arc<RwLock<HashMap<Vec<u8>, Vec<u8>>>>,
}

impl NodeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn share_count(&self) -> usize {
        self.shares.read().len()
    }
}

#[derive(Debug)]
enum NodeError {
    Unauthorized,
    BadPublicKey,
    NotFound,
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            NodeError::Unauthorized => (StatusCode::UNAUTHORIZED, "missing bearer token"),
            NodeError::BadPublicKey => (StatusCode::BAD_REQUEST, "public_key must be hex"),
            NodeError::NotFound => (StatusCode::NOT_FOUND, "share not found"),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

fn require_token(headers: &HeaderMap) -> Result<(), NodeError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or_default();
    if token.is_empty() {
        return Err(NodeError::Unauthorized);
    }
    Ok(())
}

fn public_key(query: &ShareQuery) -> Result<Vec<u8>, NodeError> {
    let s = query.public_key.trim();
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|_| NodeError::BadPublicKey)
}

async fn store_share(
    State(state): State<NodeState>,
    headers: HeaderMap,
    Json(body): Json<StoreShareBody>,
) -> Result<StatusCode, NodeError> {
    require_token(&headers)?;
    debug!(public_key = %hex::encode(&body.public_key), "storing share");
    state.shares.write().insert(body.public_key, body.share);
    Ok(StatusCode::CREATED)
}

async fn fetch_share(
    State(state): State<NodeState>,
    headers: HeaderMap,
    Query(query): Query<ShareQuery>,
) -> Result<Json<ShareBody>, NodeError> {
    require_token(&headers)?;
    let public_key = public_key(&query)?;
    let share = state
        .shares
        .read()
        .get(&public_key)
        .cloned()
        .ok_or(NodeError::NotFound)?;
    Ok(Json(ShareBody { share }))
}

async fn delete_share(
    State(state): State<NodeState>,
    headers: HeaderMap,
    Query(query): Query<ShareQuery>,
) -> Result<StatusCode, NodeError> {
    require_token(&headers)?;
    let public_key = public_key(&query)?;
    match state.shares.write().remove(&public_key) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(NodeError::NotFound),
    }
}

async fn status(State(state): State<NodeState>) -> Json<NodeStatusBody> {
    Json(NodeStatusBody {
        status: "ok".to_string(),
        shares: state.share_count(),
    })
}

pub fn router(state: NodeState) -> Router {
    Router::new()
        .route(
            "/share",
            post(store_share).get(fetch_share).delete(delete_share),
        )
        .route("/status", get(status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve a node until the process is told to stop.
pub async fn serve(listener: tokio::net::TcpListener, state: NodeState) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "custodian node listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(crate::shutdown_signal())
        .await
}

#[cfg(test)]
mod test {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, "Bearer user-token")
            .header("content-type", "application/json");
        match body {
            Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_store_fetch_delete() {
        let state = NodeState::new();
        let app = router(state.clone());

        let body = serde_json::to_value(StoreShareBody {
            public_key: vec![2, 3],
            share: vec![9, 9, 9],
        })
        .unwrap();
        let res = app
            .clone()
            .oneshot(request("POST", "/share", Some(body)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        assert_eq!(state.share_count(), 1);

        let res = app
            .clone()
            .oneshot(request("GET", "/share?public_key=0203", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let res = app
            .clone()
            .oneshot(request("DELETE", "/share?public_key=0203", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = app
            .oneshot(request("GET", "/share?public_key=0203", None))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_share_routes_need_a_token() {
        let app = router(NodeState::new());
        let req = Request::builder()
            .uri("/share?public_key=00")
            .body(Body::empty())
            .unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder().uri("/status").body(Body::empty()).unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
