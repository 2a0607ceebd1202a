//! Replacing lost custodian shares without changing the public key.
//!
//! A reshare reconstructs the key component from the nodes that still hold
//! their share, checks it against the wallet's public key, and splits it anew
//! across every configured node, under a fresh generation.
//!
//! A node keeps one share per public key, so a new share replaces the old
//! one. A reshare that fails part way puts back what every node held before,
//! and a retry starts over from reconstruction. For that, the state of every
//! node must be known up front: a node that could not be read blocks the
//! reshare before anything is written.
use std::{sync::Arc, time::Duration};

use k256::Secp256k1;
use serde::Serialize;
use tracing::{info, instrument};

use crate::{
    cipher::ShareCipher,
    cluster::ClusterConfig,
    compat::{CurveType, CustodyCurve, Ed25519},
    distributor::{KeyShareDistributor, OnFailure},
    error::CustodyError,
    health::{ensure_quorum_possible, ClusterReadiness},
    model::{NodeId, Wallet, WalletId, WalletNodeStatus, WalletStatus},
    node::NodeRpc,
    reconstructor::ThresholdReconstructor,
    store::Store,
    wallet::verify_component,
};

/// The result of a successful reshare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReshareOutcome {
    pub wallet_id: WalletId,
    pub generation: u64,
    /// The nodes which got a share back.
    pub restored_nodes: Vec<NodeId>,
}

pub struct ReshareCoordinator {
    store: Arc<dyn Store>,
    cipher: ShareCipher,
    distributor: KeyShareDistributor,
    reconstructor: ThresholdReconstructor,
}

impl ReshareCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        rpc: Arc<dyn NodeRpc>,
        cipher: ShareCipher,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            distributor: KeyShareDistributor::new(rpc.clone(), cipher.clone(), timeout),
            reconstructor: ThresholdReconstructor::new(rpc, cipher.clone(), timeout),
            cipher,
        }
    }

    /// The nodes recorded as having lost this wallet's share.
    pub async fn lost_nodes(&self, wallet_id: WalletId) -> Result<Vec<NodeId>, CustodyError> {
        Ok(self
            .store
            .wallet_node_statuses(wallet_id)
            .await?
            .into_iter()
            .filter(|s| s.status == WalletNodeStatus::UnrecoverableDataLoss)
            .map(|s| s.node_id)
            .collect())
    }

    #[instrument(skip_all, fields(wallet_id = %wallet.wallet_id))]
    pub async fn reshare(
        &self,
        wallet: &Wallet,
        token: &str,
    ) -> Result<ReshareOutcome, CustodyError> {
        let cluster = ClusterConfig::load(self.store.as_ref()).await?;
        ensure_quorum_possible(&cluster)?;

        let statuses = self.store.wallet_node_statuses(wallet.wallet_id).await?;
        let checks = self.store.latest_health_checks().await?;
        let readiness = ClusterReadiness::derive(&cluster, &checks, &statuses);
        if !readiness.needs_reshare {
            return Err(CustodyError::ReshareNotReady(
                "no active node has lost this wallet's share".to_string(),
            ));
        }
        if !readiness.reshare_ready {
            return Err(CustodyError::ReshareNotReady(format!(
                "inactive nodes: {:?}",
                cluster.inactive_ids()
            )));
        }

        let lost = self.lost_nodes(wallet.wallet_id).await?;
        let generation = match wallet.curve_type {
            CurveType::Secp256k1 => {
                self.reshare_on::<Secp256k1>(wallet, &cluster, &lost, token)
                    .await?
            }
            CurveType::Ed25519 => self.reshare_on::<Ed25519>(wallet, &cluster, &lost, token).await?,
        };

        for node_id in &lost {
            self.store
                .set_wallet_node_status(wallet.wallet_id, node_id, WalletNodeStatus::Active)
                .await?;
        }
        if wallet.status == WalletStatus::UnrecoverableDataLoss {
            self.store
                .set_wallet_status(wallet.wallet_id, WalletStatus::Active)
                .await?;
        }
        info!(generation, restored = ?lost, "reshare complete");

        Ok(ReshareOutcome {
            wallet_id: wallet.wallet_id,
            generation,
            restored_nodes: lost,
        })
    }

    async fn reshare_on<C: CustodyCurve>(
        &self,
        wallet: &Wallet,
        cluster: &ClusterConfig,
        lost: &[NodeId],
        token: &str,
    ) -> Result<u64, CustodyError> {
        let reconstruction = self
            .reconstructor
            .reconstruct::<C>(
                &wallet.public_key,
                token,
                cluster,
                wallet.sss_threshold,
                lost,
            )
            .await?;
        verify_component::<C>(&self.cipher, wallet, &reconstruction.secret)?;

        let unknown: Vec<&NodeId> = cluster
            .nodes
            .iter()
            .map(|n| &n.node_id)
            .filter(|id| {
                !lost.contains(id)
                    && !reconstruction.not_found.contains(id)
                    && !reconstruction.sealed.iter().any(|(held, _)| held == *id)
            })
            .collect();
        if !unknown.is_empty() {
            return Err(CustodyError::ReshareNotReady(format!(
                "could not read the current share of {unknown:?}"
            )));
        }

        let generation = self.store.next_share_generation(wallet.wallet_id).await?;
        self.distributor
            .distribute::<C>(
                &wallet.public_key,
                &reconstruction.secret,
                cluster,
                wallet.sss_threshold,
                generation,
                token,
                OnFailure::Restore(&reconstruction.sealed),
            )
            .await?;
        Ok(generation)
    }
}
