//! Talking to custodian nodes, and being one.
//!
//! A custodian node stores one opaque, sealed share per public key:
//!
//! - `POST /share` stores (or replaces) a share;
//! - `GET /share?public_key=..` returns it, or `404` if the node has none;
//! - `DELETE /share?public_key=..` removes it;
//! - `GET /status` answers as long as the node is up.
//!
//! Every share route carries the end user's bearer token.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::KeyShareNode;

pub mod http;
pub mod server;

pub use http::HttpNodeRpc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeRpcError {
    /// The node has no share for this public key.
    #[error("share not found")]
    NotFound,
    #[error("rejected with status {status}: {msg}")]
    Rejected { status: u16, msg: String },
    #[error("timed out")]
    Timeout,
    #[error("transport failure: {0}")]
    Transport(String),
}

/// The body of `POST /share`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreShareBody {
    #[serde(with = "crate::serde::hex_bytes")]
    pub public_key: Vec<u8>,
    #[serde(with = "crate::serde::base64_bytes")]
    pub share: Vec<u8>,
}

/// The body returned by `GET /share`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareBody {
    #[serde(with = "crate::serde::base64_bytes")]
    pub share: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareQuery {
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusBody {
    pub status: String,
    pub shares: usize,
}

/// A client for the custodian node API.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn store_share(
        &self,
        node: &KeyShareNode,
        token: &str,
        public_key: &[u8],
        share: &[u8],
    ) -> Result<(), NodeRpcError>;

    async fn fetch_share(
        &self,
        node: &KeyShareNode,
        token: &str,
        public_key: &[u8],
    ) -> Result<Vec<u8>, NodeRpcError>;

    async fn delete_share(
        &self,
        node: &KeyShareNode,
        token: &str,
        public_key: &[u8],
    ) -> Result<(), NodeRpcError>;

    async fn status(&self, node: &KeyShareNode) -> Result<(), NodeRpcError>;
}
