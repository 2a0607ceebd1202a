//! Splitting a key component and handing one share to every custodian node.
use std::{collections::HashMap, sync::Arc, time::Duration};

use rand_core::OsRng;
use tracing::{info, warn};

use crate::{
    cipher::ShareCipher,
    cluster::ClusterConfig,
    compat::CustodyCurve,
    error::CustodyError,
    fanout::fan_out,
    model::{KeyShareNode, NodeId},
    node::NodeRpc,
    sss::split,
};

/// How to undo a distribution that some node did not acknowledge.
///
/// A node stores one share per public key, so a new share replaces the old
/// one. Undoing therefore touches every node, since a node which timed out
/// may still have written its share.
#[derive(Debug, Clone, Copy)]
pub enum OnFailure<'a> {
    /// Delete whatever was stored.
    ///
    /// Used when nothing else references the public key yet.
    Rollback,
    /// Put back the sealed share each node held before, deleting the share
    /// of nodes which held none.
    Restore(&'a [(NodeId, Vec<u8>)]),
}

impl<'a> OnFailure<'a> {
    fn prior(&self, node: &NodeId) -> Option<&'a [u8]> {
        match *self {
            OnFailure::Rollback => None,
            OnFailure::Restore(prior) => prior
                .iter()
                .find(|(id, _)| id == node)
                .map(|(_, share)| share.as_slice()),
        }
    }
}

pub struct KeyShareDistributor {
    rpc: Arc<dyn NodeRpc>,
    cipher: ShareCipher,
    timeout: Duration,
}

impl KeyShareDistributor {
    pub fn new(rpc: Arc<dyn NodeRpc>, cipher: ShareCipher, timeout: Duration) -> Self {
        Self {
            rpc,
            cipher,
            timeout,
        }
    }

    /// Split `component` across every node of the cluster.
    ///
    /// This succeeds only if every node acknowledges its share.
    #[allow(clippy::too_many_arguments)]
    pub async fn distribute<C: CustodyCurve>(
        &self,
        public_key: &[u8],
        component: &C::Scalar,
        cluster: &ClusterConfig,
        threshold: usize,
        generation: u64,
        token: &str,
        on_failure: OnFailure<'_>,
    ) -> Result<(), CustodyError> {
        let shares = split::<C>(
            &mut OsRng,
            component,
            threshold,
            cluster.node_count(),
            generation,
        )?;
        let sealed: HashMap<&NodeId, Vec<u8>> = cluster
            .nodes
            .iter()
            .zip(&shares)
            .map(|(node, share)| (&node.node_id, self.cipher.seal_share(share, public_key)))
            .collect();

        let rpc = self.rpc.as_ref();
        let outcomes = fan_out(&cluster.nodes, self.timeout, |node| {
            let share = sealed.get(&node.node_id).cloned().unwrap_or_default();
            async move { rpc.store_share(node, token, public_key, &share).await }
        })
        .await;

        let mut stored = Vec::new();
        let mut first_failure = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(()) => stored.push(outcome.node_id),
                Err(e) => {
                    warn!(node_id = %outcome.node_id, error = %e, "node did not take its share");
                    if first_failure.is_none() {
                        first_failure = Some((outcome.node_id, e));
                    }
                }
            }
        }

        let Some((node, source)) = first_failure else {
            info!(
                public_key = %hex::encode(public_key),
                generation,
                nodes = stored.len(),
                "shares distributed"
            );
            return Ok(());
        };

        self.undo(&cluster.nodes, public_key, token, on_failure)
            .await;
        Err(CustodyError::Node { node, source })
    }

    async fn undo(
        &self,
        nodes: &[KeyShareNode],
        public_key: &[u8],
        token: &str,
        on_failure: OnFailure<'_>,
    ) {
        let rpc = self.rpc.as_ref();
        let outcomes = fan_out(nodes, self.timeout, |node| async move {
            match on_failure.prior(&node.node_id) {
                Some(share) => rpc.store_share(node, token, public_key, share).await,
                None => rpc.delete_share(node, token, public_key).await,
            }
        })
        .await;
        for outcome in outcomes {
            if let Err(e) = outcome.result {
                warn!(node_id = %outcome.node_id, error = %e, "could not undo share");
            }
        }
    }
}
