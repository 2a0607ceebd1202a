//! Gathering shares back from custodian nodes.
use std::{sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    cipher::ShareCipher,
    cluster::ClusterConfig,
    compat::CustodyCurve,
    error::CustodyError,
    fanout::{classify, fan_out, Quorum, ShareOutcome},
    model::NodeId,
    node::{NodeRpc, NodeRpcError},
    sss::combine,
};

/// A reconstructed key component.
#[derive(Debug, Clone)]
pub struct Reconstruction<F> {
    pub secret: F,
    /// The share generation the secret was combined from.
    pub generation: u64,
    /// Nodes which answered that they hold no share.
    pub not_found: Vec<NodeId>,
    /// The bytes every node answered with, whether or not they opened.
    pub sealed: Vec<(NodeId, Vec<u8>)>,
}

pub struct ThresholdReconstructor {
    rpc: Arc<dyn NodeRpc>,
    cipher: ShareCipher,
    timeout: Duration,
}

impl ThresholdReconstructor {
    pub fn new(rpc: Arc<dyn NodeRpc>, cipher: ShareCipher, timeout: Duration) -> Self {
        Self {
            rpc,
            cipher,
            timeout,
        }
    }

    /// Ask every active node outside `exclude` for its share, and combine.
    pub async fn reconstruct<C: CustodyCurve>(
        &self,
        public_key: &[u8],
        token: &str,
        cluster: &ClusterConfig,
        threshold: usize,
        exclude: &[NodeId],
    ) -> Result<Reconstruction<C::Scalar>, CustodyError> {
        let nodes = cluster.active_except(exclude);
        let rpc = self.rpc.as_ref();
        let outcomes = fan_out(&nodes, self.timeout, |node| {
            rpc.fetch_share(node, token, public_key)
        })
        .await;

        let mut sealed_shares = Vec::new();
        let mut shares = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let share = match outcome.result {
                Ok(sealed) => {
                    let share = match self.cipher.open_share(&sealed, public_key) {
                        Ok(share) => ShareOutcome::Share(share),
                        Err(e) => {
                            warn!(node_id = %outcome.node_id, error = %e, "node returned a bad share");
                            ShareOutcome::Failed
                        }
                    };
                    sealed_shares.push((outcome.node_id.clone(), sealed));
                    share
                }
                Err(NodeRpcError::NotFound) => ShareOutcome::NotFound,
                Err(e) => {
                    warn!(node_id = %outcome.node_id, error = %e, "could not fetch share");
                    ShareOutcome::Failed
                }
            };
            shares.push((outcome.node_id, share));
        }

        match classify(shares, threshold) {
            Quorum::Reached {
                generation,
                shares,
                not_found,
            } => {
                let secret = combine::<C>(&shares, threshold)?;
                if !not_found.is_empty() {
                    info!(?not_found, "quorum reached, but some nodes lost their share");
                }
                debug!(generation, "key component reconstructed");
                Ok(Reconstruction {
                    secret,
                    generation,
                    not_found,
                    sealed: sealed_shares,
                })
            }
            Quorum::WalletNotFound { nodes } => Err(CustodyError::WalletNotFound { nodes }),
            Quorum::Insufficient { got, need } => {
                Err(CustodyError::InsufficientShares { got, need })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use elliptic_curve::ff::Field;
    use k256::{Scalar, Secp256k1};
    use rand_core::OsRng;

    use super::*;
    use crate::{
        distributor::{KeyShareDistributor, OnFailure},
        model::{KeyShareNode, NodeStatus},
        node::testing::FakeNodes,
    };

    fn cluster(n: usize, threshold: usize) -> ClusterConfig {
        ClusterConfig {
            threshold,
            nodes: (1..=n)
                .map(|i| KeyShareNode {
                    node_id: NodeId(format!("ks-{i}")),
                    node_name: format!("node {i}"),
                    server_url: String::new(),
                    status: NodeStatus::Active,
                })
                .collect(),
        }
    }

    async fn setup(secret: &Scalar) -> (Arc<FakeNodes>, ThresholdReconstructor, Vec<u8>) {
        let nodes = Arc::new(FakeNodes::new());
        let cipher = ShareCipher::new([3u8; 32]);
        let timeout = Duration::from_secs(1);
        let pk = Secp256k1::public_key(secret);
        KeyShareDistributor::new(nodes.clone(), cipher.clone(), timeout)
            .distribute::<Secp256k1>(&pk, secret, &cluster(3, 2), 2, 0, "t", OnFailure::Rollback)
            .await
            .unwrap();
        let reconstructor = ThresholdReconstructor::new(nodes.clone(), cipher, timeout);
        (nodes, reconstructor, pk)
    }

    #[tokio::test]
    async fn test_reconstruct_with_a_node_down() {
        let secret = Scalar::random(&mut OsRng);
        let (nodes, reconstructor, pk) = setup(&secret).await;
        nodes.set_down("ks-1", true);
        let got = reconstructor
            .reconstruct::<Secp256k1>(&pk, "t", &cluster(3, 2), 2, &[])
            .await
            .unwrap();
        assert_eq!(got.secret, secret);
        assert!(got.not_found.is_empty());
    }

    #[tokio::test]
    async fn test_lost_share_is_reported() {
        let secret = Scalar::random(&mut OsRng);
        let (nodes, reconstructor, pk) = setup(&secret).await;
        nodes.wipe("ks-2", &pk);
        let got = reconstructor
            .reconstruct::<Secp256k1>(&pk, "t", &cluster(3, 2), 2, &[])
            .await
            .unwrap();
        assert_eq!(got.secret, secret);
        assert_eq!(got.not_found, vec![NodeId::from("ks-2")]);

        nodes.wipe("ks-3", &pk);
        let err = reconstructor
            .reconstruct::<Secp256k1>(&pk, "t", &cluster(3, 2), 2, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CustodyError::WalletNotFound { ref nodes } if nodes.len() == 2));
    }

    #[tokio::test]
    async fn test_unreachable_nodes_are_insufficient() {
        let secret = Scalar::random(&mut OsRng);
        let (nodes, reconstructor, pk) = setup(&secret).await;
        nodes.set_down("ks-1", true);
        nodes.set_down("ks-2", true);
        let err = reconstructor
            .reconstruct::<Secp256k1>(&pk, "t", &cluster(3, 2), 2, &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CustodyError::InsufficientShares { got: 1, need: 2 }
        ));
    }

    #[tokio::test]
    async fn test_excluded_nodes_are_not_asked() {
        let secret = Scalar::random(&mut OsRng);
        let (nodes, reconstructor, pk) = setup(&secret).await;
        let before = nodes.calls();
        let got = reconstructor
            .reconstruct::<Secp256k1>(&pk, "t", &cluster(3, 2), 2, &["ks-3".into()])
            .await
            .unwrap();
        assert_eq!(got.secret, secret);
        assert_eq!(nodes.calls() - before, 2);
    }
}
