//! Concurrent calls to custodian nodes, and what to make of their answers.
use std::{future::Future, time::Duration};

use futures::future::join_all;
use tokio::time::timeout;

use crate::{
    model::{KeyShareNode, NodeId},
    node::NodeRpcError,
    sss::{select_generation, KeyShare},
};

/// The answer of one node.
#[derive(Debug, Clone)]
pub struct NodeOutcome<T> {
    pub node_id: NodeId,
    pub result: Result<T, NodeRpcError>,
}

/// Call every node at once, waiting for all of them.
///
/// Each call is bounded by `limit`, so a stuck node shows up as
/// [NodeRpcError::Timeout] instead of holding up the others.
pub async fn fan_out<'a, T, F, Fut>(
    nodes: &'a [KeyShareNode],
    limit: Duration,
    call: F,
) -> Vec<NodeOutcome<T>>
where
    F: Fn(&'a KeyShareNode) -> Fut,
    Fut: Future<Output = Result<T, NodeRpcError>>,
{
    join_all(nodes.iter().map(|node| {
        let fut = call(node);
        async move {
            let result = match timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(NodeRpcError::Timeout),
            };
            NodeOutcome {
                node_id: node.node_id.clone(),
                result,
            }
        }
    }))
    .await
}

/// What a node contributed to a reconstruction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    Share(KeyShare),
    NotFound,
    Failed,
}

/// The verdict on a reconstruction attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Quorum {
    /// Enough shares of one generation arrived.
    ///
    /// `not_found` lists nodes that answered without a share, which is a
    /// targeted signal that they lost data.
    Reached {
        generation: u64,
        shares: Vec<KeyShare>,
        not_found: Vec<NodeId>,
    },
    /// Too few shares, and some nodes said they have none.
    WalletNotFound { nodes: Vec<NodeId> },
    /// Too few shares, with no node claiming to have lost one.
    Insufficient { got: usize, need: usize },
}

/// Classify what came back from the nodes.
pub fn classify(outcomes: Vec<(NodeId, ShareOutcome)>, threshold: usize) -> Quorum {
    let mut shares = Vec::new();
    let mut not_found = Vec::new();
    for (node_id, outcome) in outcomes {
        match outcome {
            ShareOutcome::Share(share) => shares.push(share),
            ShareOutcome::NotFound => not_found.push(node_id),
            ShareOutcome::Failed => {}
        }
    }

    // The largest set of shares that could be combined together.
    let got = {
        let mut counts = std::collections::BTreeMap::<u64, usize>::new();
        for share in &shares {
            *counts.entry(share.generation).or_default() += 1;
        }
        counts.into_values().max().unwrap_or(0)
    };

    if let Some((generation, shares)) = select_generation(shares, threshold) {
        return Quorum::Reached {
            generation,
            shares,
            not_found,
        };
    }
    if !not_found.is_empty() {
        return Quorum::WalletNotFound { nodes: not_found };
    }
    Quorum::Insufficient {
        got,
        need: threshold,
    }
}
