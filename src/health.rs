//! Node activation, health checks, and the readiness signals derived from them.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    cluster::ClusterConfig,
    error::CustodyError,
    fanout::fan_out,
    model::{
        HealthStatus, KeyShareNodeMeta, KsNodeHealthCheck, NodeId, NodeStatus, WalletId,
        WalletKsNodeStatus, WalletNodeStatus,
    },
    node::NodeRpc,
    store::{Store, StoreError},
};

/// Aggregate readiness of the custodian cluster, optionally for one wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterReadiness {
    pub threshold: usize,
    pub total_nodes: usize,
    pub active_nodes: usize,
    /// Every configured node is active.
    pub signup_ready: bool,
    /// Fewer nodes are active than the threshold; nothing can proceed.
    pub active_nodes_below_threshold: bool,
    /// The wallet has an active node which lost its share.
    pub needs_reshare: bool,
    pub reshare_reasons: Vec<String>,
    pub reshare_ready: bool,
    /// Nodes whose latest health check failed.
    pub unhealthy_nodes: Vec<NodeId>,
}

impl ClusterReadiness {
    pub fn derive(
        cluster: &ClusterConfig,
        latest_checks: &[KsNodeHealthCheck],
        wallet_nodes: &[WalletKsNodeStatus],
    ) -> Self {
        let active_nodes = cluster.active_count();
        let signup_ready = active_nodes == cluster.node_count() && cluster.node_count() > 0;

        let reshare_reasons: Vec<String> = wallet_nodes
            .iter()
            .filter(|s| s.status == WalletNodeStatus::UnrecoverableDataLoss)
            .filter(|s| {
                cluster
                    .nodes
                    .iter()
                    .any(|n| n.node_id == s.node_id && n.is_active())
            })
            .map(|s| format!("node {} lost its share", s.node_id))
            .collect();
        let needs_reshare = !reshare_reasons.is_empty();

        let unhealthy_nodes = latest_checks
            .iter()
            .filter(|c| c.status == HealthStatus::Unhealthy)
            .map(|c| c.node_id.clone())
            .collect();

        Self {
            threshold: cluster.threshold,
            total_nodes: cluster.node_count(),
            active_nodes,
            signup_ready,
            active_nodes_below_threshold: active_nodes < cluster.threshold,
            needs_reshare,
            reshare_reasons,
            reshare_ready: needs_reshare && signup_ready,
            unhealthy_nodes,
        }
    }
}

/// Refuse to go on if too few nodes are active to ever reach the threshold.
///
/// This runs before any node is contacted.
pub fn ensure_quorum_possible(cluster: &ClusterConfig) -> Result<(), CustodyError> {
    let active = cluster.active_count();
    if active < cluster.threshold {
        return Err(CustodyError::NodesBelowThreshold {
            active,
            threshold: cluster.threshold,
        });
    }
    Ok(())
}

/// The operator's view of the custodian nodes.
#[derive(Clone)]
pub struct NodeHealthRegistry {
    store: Arc<dyn Store>,
}

impl NodeHealthRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn cluster(&self) -> Result<ClusterConfig, StoreError> {
        ClusterConfig::load(self.store.as_ref()).await
    }

    pub async fn readiness(
        &self,
        wallet_id: Option<WalletId>,
    ) -> Result<ClusterReadiness, StoreError> {
        let cluster = self.cluster().await?;
        let checks = self.store.latest_health_checks().await?;
        let wallet_nodes = match wallet_id {
            Some(id) => self.store.wallet_node_statuses(id).await?,
            None => Vec::new(),
        };
        Ok(ClusterReadiness::derive(&cluster, &checks, &wallet_nodes))
    }

    pub async fn set_node_status(
        &self,
        node_id: &NodeId,
        status: NodeStatus,
    ) -> Result<(), CustodyError> {
        self.store
            .set_node_status(node_id, status)
            .await
            .map_err(|e| match e {
                StoreError::NotFound(_) => {
                    CustodyError::InvalidRequest(format!("unknown node {node_id}"))
                }
                e => e.into(),
            })?;
        info!(node_id = %node_id, ?status, "node status changed");
        Ok(())
    }

    /// Change the threshold used for new wallets.
    pub async fn set_threshold(&self, threshold: usize) -> Result<(), CustodyError> {
        let nodes = self.store.nodes().await?.len();
        if threshold < 1 || threshold > nodes {
            return Err(CustodyError::InvalidRequest(format!(
                "threshold must be between 1 and {nodes}"
            )));
        }
        self.store
            .set_meta(KeyShareNodeMeta {
                sss_threshold: threshold,
            })
            .await?;
        info!(threshold, "custody threshold changed");
        Ok(())
    }
}

/// Polls every node's status on a fixed interval.
pub struct HealthMonitor {
    store: Arc<dyn Store>,
    rpc: Arc<dyn NodeRpc>,
    timeout: Duration,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn Store>, rpc: Arc<dyn NodeRpc>, timeout: Duration) -> Self {
        Self {
            store,
            rpc,
            timeout,
        }
    }

    /// Check every configured node once, logging the results.
    pub async fn check_all(&self) -> Result<(), StoreError> {
        let nodes = self.store.nodes().await?;
        let rpc = self.rpc.as_ref();
        let outcomes = fan_out(&nodes, self.timeout, |node| rpc.status(node)).await;
        let timestamp = Utc::now();
        for outcome in outcomes {
            let status = match &outcome.result {
                Ok(()) => HealthStatus::Healthy,
                Err(e) => {
                    warn!(node_id = %outcome.node_id, error = %e, "node health check failed");
                    HealthStatus::Unhealthy
                }
            };
            self.store
                .append_health_check(KsNodeHealthCheck {
                    node_id: outcome.node_id,
                    status,
                    timestamp,
                })
                .await?;
        }
        debug!(nodes = nodes.len(), "health checks recorded");
        Ok(())
    }

    pub fn spawn(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = self.check_all().await {
                    warn!(error = %e, "could not record health checks");
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        model::KeyShareNode,
        node::testing::FakeNodes,
        store::{MemoryStore, NodeStore},
    };

    fn cluster(threshold: usize, statuses: &[NodeStatus]) -> ClusterConfig {
        ClusterConfig {
            threshold,
            nodes: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| KeyShareNode {
                    node_id: NodeId(format!("ks-{}", i + 1)),
                    node_name: format!("node {}", i + 1),
                    server_url: String::new(),
                    status: *status,
                })
                .collect(),
        }
    }

    fn lost(node: &str) -> WalletKsNodeStatus {
        WalletKsNodeStatus {
            wallet_id: WalletId::new(),
            node_id: node.into(),
            status: WalletNodeStatus::UnrecoverableDataLoss,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_below_threshold() {
        use NodeStatus::{Active, Inactive};
        let c = cluster(2, &[Active, Inactive, Inactive]);
        let r = ClusterReadiness::derive(&c, &[], &[]);
        assert!(r.active_nodes_below_threshold);
        assert!(!r.signup_ready);
        assert!(ensure_quorum_possible(&c).is_err());

        let c = cluster(2, &[Active, Active, Inactive]);
        let r = ClusterReadiness::derive(&c, &[], &[]);
        assert!(!r.active_nodes_below_threshold);
        assert!(!r.signup_ready);
        assert!(ensure_quorum_possible(&c).is_ok());
    }

    #[test]
    fn test_reshare_signals() {
        use NodeStatus::{Active, Inactive};
        let c = cluster(2, &[Active, Active, Active]);
        let r = ClusterReadiness::derive(&c, &[], &[lost("ks-2")]);
        assert!(r.needs_reshare && r.reshare_ready);
        assert_eq!(r.reshare_reasons.len(), 1);

        // Data loss on an inactive node is not actionable yet.
        let c = cluster(2, &[Active, Inactive, Active]);
        let r = ClusterReadiness::derive(&c, &[], &[lost("ks-2")]);
        assert!(!r.needs_reshare && !r.reshare_ready);

        // Another node down blocks the reshare.
        let c = cluster(2, &[Active, Active, Inactive]);
        let r = ClusterReadiness::derive(&c, &[], &[lost("ks-2")]);
        assert!(r.needs_reshare && !r.reshare_ready);
    }

    #[tokio::test]
    async fn test_monitor_records_unhealthy_nodes() {
        let store = Arc::new(MemoryStore::new(KeyShareNodeMeta { sss_threshold: 2 }));
        for node in cluster(2, &[NodeStatus::Active; 3]).nodes {
            store.upsert_node(node).await.unwrap();
        }
        let nodes = Arc::new(FakeNodes::new());
        nodes.set_down("ks-3", true);

        let monitor = HealthMonitor::new(store.clone(), nodes, Duration::from_secs(1));
        monitor.check_all().await.unwrap();

        let registry = NodeHealthRegistry::new(store);
        let r = registry.readiness(None).await.unwrap();
        assert_eq!(r.unhealthy_nodes, vec![NodeId::from("ks-3")]);
        // Health checks are reported, but activation is the operator's call.
        assert!(r.signup_ready);
    }

    #[tokio::test]
    async fn test_threshold_bounds() {
        let store = Arc::new(MemoryStore::new(KeyShareNodeMeta { sss_threshold: 2 }));
        for node in cluster(2, &[NodeStatus::Active; 3]).nodes {
            store.upsert_node(node).await.unwrap();
        }
        let registry = NodeHealthRegistry::new(store);
        assert!(registry.set_threshold(3).await.is_ok());
        assert!(registry.set_threshold(4).await.is_err());
        assert!(registry.set_threshold(0).await.is_err());
        assert_eq!(registry.cluster().await.unwrap().threshold, 3);
        assert!(registry
            .set_node_status(&"ks-9".into(), NodeStatus::Inactive)
            .await
            .is_err());
    }
}
