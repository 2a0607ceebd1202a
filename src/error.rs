//! Error types surfaced at the service boundary.
//!
//! Each layer has its own error type; they all fold into [CustodyError],
//! which maps onto the closed set of [ErrorCode]s clients branch on.
use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cipher::CipherError,
    engine::EngineError,
    identity::IdentityError,
    model::NodeId,
    node::NodeRpcError,
    sss::SharingError,
    stage::StageType,
    store::StoreError,
};

/// The codes a client can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Unauthorized,
    InvalidTssSession,
    InvalidTssStage,
    InvalidTssTriplesResult,
    InvalidTssPresignResult,
    InvalidTssSignResult,
    WalletNotFound,
    InsufficientShares,
    NodesBelowThreshold,
    SignupNotReady,
    ReshareNotReady,
    WalletAlreadyExists,
    KeyShareMismatch,
    InvalidRequest,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::InvalidTssSession => "INVALID_TSS_SESSION",
            ErrorCode::InvalidTssStage => "INVALID_TSS_STAGE",
            ErrorCode::InvalidTssTriplesResult => "INVALID_TSS_TRIPLES_RESULT",
            ErrorCode::InvalidTssPresignResult => "INVALID_TSS_PRESIGN_RESULT",
            ErrorCode::InvalidTssSignResult => "INVALID_TSS_SIGN_RESULT",
            ErrorCode::WalletNotFound => "WALLET_NOT_FOUND",
            ErrorCode::InsufficientShares => "INSUFFICIENT_SHARES",
            ErrorCode::NodesBelowThreshold => "NODES_BELOW_THRESHOLD",
            ErrorCode::SignupNotReady => "SIGNUP_NOT_READY",
            ErrorCode::ReshareNotReady => "RESHARE_NOT_READY",
            ErrorCode::WalletAlreadyExists => "WALLET_ALREADY_EXISTS",
            ErrorCode::KeyShareMismatch => "KEY_SHARE_MISMATCH",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// The code reported when the engine rejects a step of some stage.
    pub fn invalid_result(stage: StageType) -> Self {
        match stage {
            StageType::Triples => ErrorCode::InvalidTssTriplesResult,
            StageType::Presign => ErrorCode::InvalidTssPresignResult,
            StageType::Sign => ErrorCode::InvalidTssSignResult,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error from one of the custody or session services.
#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid tss session: {0}")]
    InvalidSession(String),
    #[error("invalid tss stage: {0}")]
    InvalidStage(String),
    #[error("{stage} result rejected: {reason}")]
    InvalidResult { stage: StageType, reason: String },
    #[error("wallet not found on nodes {nodes:?}")]
    WalletNotFound { nodes: Vec<NodeId> },
    #[error("insufficient shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },
    #[error("active nodes below threshold: {active} active, threshold {threshold}")]
    NodesBelowThreshold { active: usize, threshold: usize },
    #[error("signup not ready: inactive nodes {inactive:?}")]
    SignupNotReady { inactive: Vec<NodeId> },
    #[error("reshare not ready: {0}")]
    ReshareNotReady(String),
    #[error("wallet already exists: {0}")]
    WalletAlreadyExists(String),
    #[error("reconstructed key share does not match the public key")]
    KeyShareMismatch,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("node {node} failed: {source}")]
    Node {
        node: NodeId,
        #[source]
        source: NodeRpcError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Sharing(#[from] SharingError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl CustodyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CustodyError::Unauthorized(_) => ErrorCode::Unauthorized,
            CustodyError::InvalidSession(_) => ErrorCode::InvalidTssSession,
            CustodyError::InvalidStage(_) => ErrorCode::InvalidTssStage,
            CustodyError::InvalidResult { stage, .. } => ErrorCode::invalid_result(*stage),
            CustodyError::WalletNotFound { .. } => ErrorCode::WalletNotFound,
            CustodyError::InsufficientShares { .. } => ErrorCode::InsufficientShares,
            CustodyError::NodesBelowThreshold { .. } => ErrorCode::NodesBelowThreshold,
            CustodyError::SignupNotReady { .. } => ErrorCode::SignupNotReady,
            CustodyError::ReshareNotReady(_) => ErrorCode::ReshareNotReady,
            CustodyError::WalletAlreadyExists(_) => ErrorCode::WalletAlreadyExists,
            CustodyError::KeyShareMismatch => ErrorCode::KeyShareMismatch,
            CustodyError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            CustodyError::Node { .. }
            | CustodyError::Store(_)
            | CustodyError::Engine(_)
            | CustodyError::Sharing(_)
            | CustodyError::Cipher(_)
            | CustodyError::Internal(_) => ErrorCode::UnknownError,
        }
    }

    /// The message shown to clients.
    ///
    /// Errors without a dedicated code never leak their details.
    pub fn public_message(&self) -> String {
        match self.code() {
            ErrorCode::UnknownError => "internal error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<IdentityError> for CustodyError {
    fn from(e: IdentityError) -> Self {
        CustodyError::Unauthorized(e.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_code_strings_match_serde() {
        for code in [
            ErrorCode::Unauthorized,
            ErrorCode::InvalidTssSession,
            ErrorCode::InvalidTssPresignResult,
            ErrorCode::WalletNotFound,
            ErrorCode::InsufficientShares,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_internal_errors_are_opaque() {
        let e = CustodyError::Internal("db password is hunter2".to_string());
        assert_eq!(e.code(), ErrorCode::UnknownError);
        assert_eq!(e.public_message(), "internal error");

        let e = CustodyError::InsufficientShares { got: 1, need: 2 };
        assert_eq!(e.code(), ErrorCode::InsufficientShares);
        assert!(e.public_message().contains("got 1"));
    }

    #[test]
    fn test_engine_rejection_codes_per_stage() {
        let e = CustodyError::InvalidResult {
            stage: StageType::Presign,
            reason: "malformed presign_big_r".to_string(),
        };
        assert_eq!(e.code(), ErrorCode::InvalidTssPresignResult);
        assert_eq!(
            ErrorCode::invalid_result(StageType::Triples),
            ErrorCode::InvalidTssTriplesResult
        );
    }
}
