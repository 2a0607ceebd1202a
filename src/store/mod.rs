//! Durable storage for wallets, custodian nodes, and signing sessions.
//!
//! The traits here are what the services program against; [memory::MemoryStore]
//! is the in-process implementation the binary and the tests use.
use async_trait::async_trait;
use thiserror::Error;

use crate::{
    compat::CurveType,
    engine::StageState,
    model::{
        KeyShareNode, KeyShareNodeMeta, KsNodeHealthCheck, NodeId, NodeStatus, SessionId,
        SessionState, StepReceipt, TssSession, TssStage, Wallet, WalletId, WalletKsNodeStatus,
        WalletNodeStatus, WalletStatus,
    },
    stage::{StageStatus, StageType},
};

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness constraint or compare-and-set failed.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Insert a new wallet, failing if the user already has one on that curve.
    async fn insert_wallet(&self, wallet: Wallet) -> Result<(), StoreError>;

    async fn wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>, StoreError>;

    async fn wallet_for_user(
        &self,
        user_id: &str,
        curve_type: CurveType,
    ) -> Result<Option<Wallet>, StoreError>;

    async fn set_wallet_status(
        &self,
        wallet_id: WalletId,
        status: WalletStatus,
    ) -> Result<(), StoreError>;

    /// Reserve the next share generation of a wallet, returning it.
    ///
    /// A generation is never handed out twice, even if the split using it fails.
    async fn next_share_generation(&self, wallet_id: WalletId) -> Result<u64, StoreError>;

    /// The per node statuses recorded for a wallet.
    ///
    /// Nodes without a record are implicitly [WalletNodeStatus::Active].
    async fn wallet_node_statuses(
        &self,
        wallet_id: WalletId,
    ) -> Result<Vec<WalletKsNodeStatus>, StoreError>;

    async fn set_wallet_node_status(
        &self,
        wallet_id: WalletId,
        node_id: &NodeId,
        status: WalletNodeStatus,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// All configured nodes, sorted by id.
    async fn nodes(&self) -> Result<Vec<KeyShareNode>, StoreError>;

    async fn upsert_node(&self, node: KeyShareNode) -> Result<(), StoreError>;

    async fn set_node_status(&self, node_id: &NodeId, status: NodeStatus)
        -> Result<(), StoreError>;

    async fn meta(&self) -> Result<KeyShareNodeMeta, StoreError>;

    async fn set_meta(&self, meta: KeyShareNodeMeta) -> Result<(), StoreError>;

    async fn append_health_check(&self, check: KsNodeHealthCheck) -> Result<(), StoreError>;

    /// The most recent health check of every node that has one.
    async fn latest_health_checks(&self) -> Result<Vec<KsNodeHealthCheck>, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: TssSession) -> Result<(), StoreError>;

    async fn session(&self, session_id: SessionId) -> Result<Option<TssSession>, StoreError>;

    /// Move a session from one state to another.
    ///
    /// Fails with a conflict if the session is not in the expected state.
    async fn transition_session(
        &self,
        session_id: SessionId,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), StoreError>;

    async fn stage(
        &self,
        session_id: SessionId,
        stage_type: StageType,
    ) -> Result<Option<TssStage>, StoreError>;

    /// All stages of a session, in protocol order.
    async fn stages(&self, session_id: SessionId) -> Result<Vec<TssStage>, StoreError>;

    /// Insert a new stage, failing with a conflict if one of that type exists.
    async fn insert_stage(&self, stage: TssStage) -> Result<(), StoreError>;

    /// Advance a stage, if and only if it is still at `expected`.
    async fn advance_stage(
        &self,
        session_id: SessionId,
        stage_type: StageType,
        expected: StageStatus,
        status: StageStatus,
        data: StageState,
        receipt: StepReceipt,
    ) -> Result<(), StoreError>;
}

/// Everything the custody service persists.
pub trait Store: WalletStore + NodeStore + SessionStore {}

impl<T: WalletStore + NodeStore + SessionStore> Store for T {}
