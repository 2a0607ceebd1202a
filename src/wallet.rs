//! Wallet signup, sign-in, and the custody policy around them.
//!
//! A wallet's key is the sum of two scalars: the key component `x_c`, split
//! across the custodian nodes, and the server's own TSS share `x_s`, sealed on
//! the wallet record. The public key is `(x_c + x_s) * G`, which is what lets
//! a reconstruction be checked before anything is built on top of it.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use elliptic_curve::ff::Field;
use k256::Secp256k1;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};

use crate::{
    cipher::ShareCipher,
    cluster::ClusterConfig,
    compat::{random_nonzero, scalar_from_bytes, scalar_to_bytes, CurveType, CustodyCurve, Ed25519},
    distributor::{KeyShareDistributor, OnFailure},
    error::CustodyError,
    health::ensure_quorum_possible,
    identity::Identity,
    model::{NodeId, Wallet, WalletId, WalletNodeStatus, WalletStatus},
    node::NodeRpc,
    reconstructor::ThresholdReconstructor,
    reshare::{ReshareCoordinator, ReshareOutcome},
    store::{Store, StoreError},
};

#[derive(Debug, Clone, Deserialize)]
pub struct SignupRequest {
    pub curve_type: CurveType,
    /// A key component chosen by the client, as hex. The server picks one
    /// if this is absent.
    #[serde(default)]
    pub key_component: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignupResponse {
    pub wallet_id: WalletId,
    pub curve_type: CurveType,
    pub public_key: String,
    /// The key component, if the server generated it.
    pub key_component: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurveRequest {
    pub curve_type: CurveType,
}

#[derive(Debug, Clone, Serialize)]
pub struct SigninResponse {
    pub wallet_id: WalletId,
    pub public_key: String,
    pub key_component: String,
    pub generation: u64,
    /// Nodes found to have lost their share during this sign-in.
    pub lost_nodes: Vec<NodeId>,
    pub reshared: bool,
}

/// Open the server's TSS share of a wallet.
pub(crate) fn server_share<C: CustodyCurve>(
    cipher: &ShareCipher,
    wallet: &Wallet,
) -> Result<C::Scalar, CustodyError> {
    let bytes = cipher.open(&wallet.enc_tss_share, &wallet.public_key)?;
    scalar_from_bytes::<C::Scalar>(&bytes)
        .ok_or_else(|| CustodyError::Internal("server share is not a scalar".to_string()))
}

/// Check a reconstructed key component against the wallet's public key.
pub(crate) fn verify_component<C: CustodyCurve>(
    cipher: &ShareCipher,
    wallet: &Wallet,
    component: &C::Scalar,
) -> Result<(), CustodyError> {
    let x_s = server_share::<C>(cipher, wallet)?;
    let public_key = C::public_key(&(*component + x_s));
    if !bool::from(public_key.as_slice().ct_eq(&wallet.public_key)) {
        return Err(CustodyError::KeyShareMismatch);
    }
    Ok(())
}

fn parse_component<C: CustodyCurve>(hex_str: &str) -> Result<C::Scalar, CustodyError> {
    let s = hex_str.trim();
    let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))
        .map_err(|_| CustodyError::InvalidRequest("key_component must be hex".to_string()))?;
    let x = scalar_from_bytes::<C::Scalar>(&bytes).ok_or_else(|| {
        CustodyError::InvalidRequest(format!("key_component is not a {} scalar", C::CURVE_TYPE))
    })?;
    if bool::from(x.is_zero()) {
        return Err(CustodyError::InvalidRequest(
            "key_component must be non-zero".to_string(),
        ));
    }
    Ok(x)
}

pub struct WalletService {
    store: Arc<dyn Store>,
    cipher: ShareCipher,
    distributor: KeyShareDistributor,
    reconstructor: ThresholdReconstructor,
    reshare: ReshareCoordinator,
    auto_reshare: bool,
}

impl WalletService {
    pub fn new(
        store: Arc<dyn Store>,
        rpc: Arc<dyn NodeRpc>,
        cipher: ShareCipher,
        timeout: Duration,
        auto_reshare: bool,
    ) -> Self {
        Self {
            distributor: KeyShareDistributor::new(rpc.clone(), cipher.clone(), timeout),
            reconstructor: ThresholdReconstructor::new(rpc.clone(), cipher.clone(), timeout),
            reshare: ReshareCoordinator::new(store.clone(), rpc, cipher.clone(), timeout),
            store,
            cipher,
            auto_reshare,
        }
    }

    /// The caller's wallet on some curve.
    pub async fn wallet_for(
        &self,
        identity: &Identity,
        curve_type: CurveType,
    ) -> Result<Option<Wallet>, CustodyError> {
        Ok(self
            .store
            .wallet_for_user(&identity.user_id, curve_type)
            .await?)
    }

    async fn require_wallet(
        &self,
        identity: &Identity,
        curve_type: CurveType,
    ) -> Result<Wallet, CustodyError> {
        self.wallet_for(identity, curve_type)
            .await?
            .ok_or(CustodyError::WalletNotFound { nodes: Vec::new() })
    }

    #[instrument(skip_all, fields(user_id = %identity.user_id, curve = %request.curve_type))]
    pub async fn signup(
        &self,
        identity: &Identity,
        token: &str,
        request: SignupRequest,
    ) -> Result<SignupResponse, CustodyError> {
        if self.wallet_for(identity, request.curve_type).await?.is_some() {
            return Err(CustodyError::WalletAlreadyExists(format!(
                "{} already has a {} wallet",
                identity.user_id, request.curve_type
            )));
        }

        let cluster = ClusterConfig::load(self.store.as_ref()).await?;
        ensure_quorum_possible(&cluster)?;
        let inactive = cluster.inactive_ids();
        if !inactive.is_empty() || cluster.node_count() == 0 {
            return Err(CustodyError::SignupNotReady { inactive });
        }

        let component = request.key_component.as_deref();
        match request.curve_type {
            CurveType::Secp256k1 => {
                self.signup_on::<Secp256k1>(identity, token, &cluster, component)
                    .await
            }
            CurveType::Ed25519 => {
                self.signup_on::<Ed25519>(identity, token, &cluster, component)
                    .await
            }
        }
    }

    async fn signup_on<C: CustodyCurve>(
        &self,
        identity: &Identity,
        token: &str,
        cluster: &ClusterConfig,
        component: Option<&str>,
    ) -> Result<SignupResponse, CustodyError> {
        let (x_c, generated) = match component {
            Some(s) => (parse_component::<C>(s)?, false),
            None => (random_nonzero::<C::Scalar>(&mut OsRng), true),
        };
        let x_s = random_nonzero::<C::Scalar>(&mut OsRng);
        let public_key = C::public_key(&(x_c + x_s));

        self.distributor
            .distribute::<C>(
                &public_key,
                &x_c,
                cluster,
                cluster.threshold,
                0,
                token,
                OnFailure::Rollback,
            )
            .await?;

        let now = Utc::now();
        let wallet = Wallet {
            wallet_id: WalletId::new(),
            user_id: identity.user_id.clone(),
            curve_type: C::CURVE_TYPE,
            public_key: public_key.clone(),
            status: WalletStatus::Active,
            sss_threshold: cluster.threshold,
            share_generation: 0,
            enc_tss_share: self.cipher.seal(&scalar_to_bytes(&x_s), &public_key),
            created_at: now,
            updated_at: now,
        };
        let wallet_id = wallet.wallet_id;
        self.store.insert_wallet(wallet).await.map_err(|e| match e {
            StoreError::Conflict(msg) => CustodyError::WalletAlreadyExists(msg),
            e => e.into(),
        })?;
        info!(wallet_id = %wallet_id, "wallet created");

        Ok(SignupResponse {
            wallet_id,
            curve_type: C::CURVE_TYPE,
            public_key: hex::encode(&public_key),
            key_component: generated.then(|| hex::encode(scalar_to_bytes(&x_c))),
        })
    }

    #[instrument(skip_all, fields(user_id = %identity.user_id, curve = %curve_type))]
    pub async fn signin(
        &self,
        identity: &Identity,
        token: &str,
        curve_type: CurveType,
    ) -> Result<SigninResponse, CustodyError> {
        let wallet = self.require_wallet(identity, curve_type).await?;
        let cluster = ClusterConfig::load(self.store.as_ref()).await?;

        let lost = self.reshare.lost_nodes(wallet.wallet_id).await?;
        if wallet.status == WalletStatus::UnrecoverableDataLoss {
            return Err(CustodyError::InsufficientShares {
                got: cluster.node_count().saturating_sub(lost.len()),
                need: wallet.sss_threshold,
            });
        }
        ensure_quorum_possible(&cluster)?;

        let (component, generation, not_found) = match curve_type {
            CurveType::Secp256k1 => {
                self.signin_on::<Secp256k1>(&wallet, token, &cluster, &lost)
                    .await?
            }
            CurveType::Ed25519 => {
                self.signin_on::<Ed25519>(&wallet, token, &cluster, &lost)
                    .await?
            }
        };

        let mut reshared = false;
        if !not_found.is_empty() {
            self.record_data_loss(&wallet, &cluster, &not_found).await?;
            if self.auto_reshare {
                match self.reshare.reshare(&wallet, token).await {
                    Ok(outcome) => reshared = !outcome.restored_nodes.is_empty(),
                    Err(e) => warn!(error = %e, "automatic reshare failed"),
                }
            }
        }

        Ok(SigninResponse {
            wallet_id: wallet.wallet_id,
            public_key: hex::encode(&wallet.public_key),
            key_component: hex::encode(component),
            generation,
            lost_nodes: not_found,
            reshared,
        })
    }

    /// Reconstruct and check a wallet's key component.
    ///
    /// Returns the component's encoding, its generation, and the nodes which
    /// answered without a share.
    async fn signin_on<C: CustodyCurve>(
        &self,
        wallet: &Wallet,
        token: &str,
        cluster: &ClusterConfig,
        lost: &[NodeId],
    ) -> Result<(Vec<u8>, u64, Vec<NodeId>), CustodyError> {
        let result = self
            .reconstructor
            .reconstruct::<C>(&wallet.public_key, token, cluster, wallet.sss_threshold, lost)
            .await;
        let reconstruction = match result {
            Ok(r) => r,
            Err(CustodyError::WalletNotFound { nodes }) => {
                self.record_data_loss(wallet, cluster, &nodes).await?;
                return Err(CustodyError::WalletNotFound { nodes });
            }
            Err(e) => return Err(e),
        };
        verify_component::<C>(&self.cipher, wallet, &reconstruction.secret)?;
        Ok((
            scalar_to_bytes(&reconstruction.secret),
            reconstruction.generation,
            reconstruction.not_found,
        ))
    }

    pub async fn reshare(
        &self,
        identity: &Identity,
        token: &str,
        curve_type: CurveType,
    ) -> Result<ReshareOutcome, CustodyError> {
        let wallet = self.require_wallet(identity, curve_type).await?;
        self.reshare.reshare(&wallet, token).await
    }

    /// Record, on an operator's word, that a node lost a wallet's share.
    pub async fn mark_data_loss(
        &self,
        wallet_id: WalletId,
        node_id: &NodeId,
    ) -> Result<(), CustodyError> {
        let wallet = self
            .store
            .wallet(wallet_id)
            .await?
            .ok_or_else(|| CustodyError::InvalidRequest(format!("unknown wallet {wallet_id}")))?;
        let cluster = ClusterConfig::load(self.store.as_ref()).await?;
        if !cluster.nodes.iter().any(|n| &n.node_id == node_id) {
            return Err(CustodyError::InvalidRequest(format!(
                "unknown node {node_id}"
            )));
        }
        self.record_data_loss(&wallet, &cluster, std::slice::from_ref(node_id))
            .await
    }

    /// Mark nodes as having lost a wallet's share.
    ///
    /// Once too few nodes are left to reach the wallet's threshold, the wallet
    /// itself is marked as unrecoverable.
    async fn record_data_loss(
        &self,
        wallet: &Wallet,
        cluster: &ClusterConfig,
        nodes: &[NodeId],
    ) -> Result<(), CustodyError> {
        for node_id in nodes {
            warn!(wallet_id = %wallet.wallet_id, node_id = %node_id, "node lost its share");
            self.store
                .set_wallet_node_status(
                    wallet.wallet_id,
                    node_id,
                    WalletNodeStatus::UnrecoverableDataLoss,
                )
                .await?;
        }

        let lost = self.reshare.lost_nodes(wallet.wallet_id).await?;
        let lost_configured = cluster
            .nodes
            .iter()
            .filter(|n| lost.contains(&n.node_id))
            .count();
        if cluster.node_count().saturating_sub(lost_configured) < wallet.sss_threshold {
            warn!(wallet_id = %wallet.wallet_id, "wallet is unrecoverable");
            self.store
                .set_wallet_status(wallet.wallet_id, WalletStatus::UnrecoverableDataLoss)
                .await?;
        }
        Ok(())
    }
}
