use crate::{
    model::{KeyShareNode, NodeId},
    store::{NodeStore, StoreError},
};

/// A snapshot of the custodian cluster, taken at the start of a request.
///
/// Node activation can change at any time, so this is never cached across
/// requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub threshold: usize,
    /// Every configured node, sorted by id.
    pub nodes: Vec<KeyShareNode>,
}

impl ClusterConfig {
    pub async fn load(store: &(impl NodeStore + ?Sized)) -> Result<Self, StoreError> {
        let threshold = store.meta().await?.sss_threshold;
        let mut nodes = store.nodes().await?;
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(Self { threshold, nodes })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &KeyShareNode> {
        self.nodes.iter().filter(|n| n.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_nodes().count()
    }

    pub fn inactive_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| !n.is_active())
            .map(|n| n.node_id.clone())
            .collect()
    }

    /// The active nodes, minus some excluded ones.
    pub fn active_except(&self, exclude: &[NodeId]) -> Vec<KeyShareNode> {
        self.active_nodes()
            .filter(|n| !exclude.contains(&n.node_id))
            .cloned()
            .collect()
    }
}
