//! The persisted records of the custody service.
use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    compat::CurveType,
    crypto::Commitment,
    engine::StageState,
    stage::{StageStatus, StageType},
};

/// Identifies a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(pub Uuid);

impl WalletId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WalletId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a signing or keygen ceremony.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a custodian node, as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletStatus {
    Active,
    Inactive,
    NotRegistered,
    UnrecoverableDataLoss,
}

/// A user's wallet on one curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: WalletId,
    pub user_id: String,
    pub curve_type: CurveType,
    #[serde(with = "crate::serde::hex_bytes")]
    pub public_key: Vec<u8>,
    pub status: WalletStatus,
    /// The custody threshold in force when this wallet was created.
    pub sss_threshold: usize,
    /// The newest share generation handed out to custodian nodes.
    pub share_generation: u64,
    /// The server's share of the two party signing key, sealed at rest.
    #[serde(with = "crate::serde::hex_bytes")]
    pub enc_tss_share: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Active,
    Inactive,
}

/// A custodian node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShareNode {
    pub node_id: NodeId,
    pub node_name: String,
    pub server_url: String,
    pub status: NodeStatus,
}

impl KeyShareNode {
    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// One entry of the append-only health check log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KsNodeHealthCheck {
    pub node_id: NodeId,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
}

/// Process wide custody parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShareNodeMeta {
    pub sss_threshold: usize,
}

/// The status of one wallet's share on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletNodeStatus {
    Active,
    UnrecoverableDataLoss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletKsNodeStatus {
    pub wallet_id: WalletId,
    pub node_id: NodeId,
    pub status: WalletNodeStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    InProgress,
    Completed,
    Failed,
}

/// A signing ceremony, bound to one wallet for its whole life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TssSession {
    pub session_id: SessionId,
    pub wallet_id: WalletId,
    pub customer_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the last executed step of a stage received and answered.
///
/// A retry carrying the same messages is answered from here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReceipt {
    pub step: u8,
    pub request: Commitment,
    pub response: StepResponse,
}

/// The messages a step hands back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResponse {
    pub msgs: Vec<u8>,
    /// The terminal output of the stage, if this step finished it.
    pub output: Option<Vec<u8>>,
}

/// One protocol phase of a session.
#[derive(Debug, Clone)]
pub struct TssStage {
    pub session_id: SessionId,
    pub stage_type: StageType,
    pub stage_status: StageStatus,
    pub stage_data: StageState,
    pub receipt: StepReceipt,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
