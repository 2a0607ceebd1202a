use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{NodeStore, SessionStore, StoreError, WalletStore};
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

#[derive(Debug, Default)]
struct Tables {
    wallets: HashMap<WalletId, Wallet>,
    wallet_nodes: BTreeMap<(WalletId, NodeId), WalletKsNodeStatus>,
    nodes: BTreeMap<NodeId, KeyShareNode>,
    health: Vec<KsNodeHealthCheck>,
    sessions: HashMap<SessionId, TssSession>,
    stages: HashMap<(SessionId, StageType), TssStage>,
}

/// A store keeping everything in memory.
///
/// Each operation takes the table lock once, so compare-and-set operations are
/// atomic with respect to each other.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    meta: RwLock<KeyShareNodeMeta>,
}

impl MemoryStore {
    pub fn new(meta: KeyShareNodeMeta) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            meta: RwLock::new(meta),
        }
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn insert_wallet(&self, wallet: Wallet) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let taken = tables
            .wallets
            .values()
            .any(|w| w.user_id == wallet.user_id && w.curve_type == wallet.curve_type);
        if taken || tables.wallets.contains_key(&wallet.wallet_id) {
            return Err(StoreError::Conflict(format!(
                "wallet for {} on {}",
                wallet.user_id, wallet.curve_type
            )));
        }
        tables.wallets.insert(wallet.wallet_id, wallet);
        Ok(())
    }

    async fn wallet(&self, wallet_id: WalletId) -> Result<Option<Wallet>, StoreError> {
        Ok(self.tables.read().wallets.get(&wallet_id).cloned())
    }

    async fn wallet_for_user(
        &self,
        user_id: &str,
        curve_type: CurveType,
    ) -> Result<Option<Wallet>, StoreError> {
        Ok(self
            .tables
            .read()
            .wallets
            .values()
            .find(|w| w.user_id == user_id && w.curve_type == curve_type)
            .cloned())
    }

    async fn set_wallet_status(
        &self,
        wallet_id: WalletId,
        status: WalletStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let wallet = tables
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| StoreError::NotFound(format!("wallet {wallet_id}")))?;
        wallet.status = status;
        wallet.updated_at = Utc::now();
        Ok(())
    }

    async fn next_share_generation(&self, wallet_id: WalletId) -> Result<u64, StoreError> {
        let mut tables = self.tables.write();
        let wallet = tables
            .wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| StoreError::NotFound(format!("wallet {wallet_id}")))?;
        wallet.share_generation += 1;
        wallet.updated_at = Utc::now();
        Ok(wallet.share_generation)
    }

    async fn wallet_node_statuses(
        &self,
        wallet_id: WalletId,
    ) -> Result<Vec<WalletKsNodeStatus>, StoreError> {
        Ok(self
            .tables
            .read()
            .wallet_nodes
            .range((wallet_id, NodeId(String::new()))..)
            .take_while(|((w, _), _)| *w == wallet_id)
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn set_wallet_node_status(
        &self,
        wallet_id: WalletId,
        node_id: &NodeId,
        status: WalletNodeStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if !tables.wallets.contains_key(&wallet_id) {
            return Err(StoreError::NotFound(format!("wallet {wallet_id}")));
        }
        tables.wallet_nodes.insert(
            (wallet_id, node_id.clone()),
            WalletKsNodeStatus {
                wallet_id,
                node_id: node_id.clone(),
                status,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn nodes(&self) -> Result<Vec<KeyShareNode>, StoreError> {
        Ok(self.tables.read().nodes.values().cloned().collect())
    }

    async fn upsert_node(&self, node: KeyShareNode) -> Result<(), StoreError> {
        self.tables.write().nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    async fn set_node_status(
        &self,
        node_id: &NodeId,
        status: NodeStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let node = tables
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| StoreError::NotFound(format!("node {node_id}")))?;
        node.status = status;
        Ok(())
    }

    async fn meta(&self) -> Result<KeyShareNodeMeta, StoreError> {
        Ok(*self.meta.read())
    }

    async fn set_meta(&self, meta: KeyShareNodeMeta) -> Result<(), StoreError> {
        *self.meta.write() = meta;
        Ok(())
    }

    async fn append_health_check(&self, check: KsNodeHealthCheck) -> Result<(), StoreError> {
        self.tables.write().health.push(check);
        Ok(())
    }

    async fn latest_health_checks(&self) -> Result<Vec<KsNodeHealthCheck>, StoreError> {
        let tables = self.tables.read();
        let mut latest: BTreeMap<&NodeId, &KsNodeHealthCheck> = BTreeMap::new();
        // The log is appended in time order, so later entries win.
        for check in &tables.health {
            latest.insert(&check.node_id, check);
        }
        Ok(latest.into_values().cloned().collect())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: TssSession) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Conflict(format!(
                "session {}",
                session.session_id
            )));
        }
        tables.sessions.insert(session.session_id, session);
        Ok(())
    }

    async fn session(&self, session_id: SessionId) -> Result<Option<TssSession>, StoreError> {
        Ok(self.tables.read().sessions.get(&session_id).cloned())
    }

    async fn transition_session(
        &self,
        session_id: SessionId,
        from: SessionState,
        to: SessionState,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let session = tables
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        if session.state != from {
            return Err(StoreError::Conflict(format!(
                "session {session_id} is {:?}, not {from:?}",
                session.state
            )));
        }
        session.state = to;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn stage(
        &self,
        session_id: SessionId,
        stage_type: StageType,
    ) -> Result<Option<TssStage>, StoreError> {
        Ok(self
            .tables
            .read()
            .stages
            .get(&(session_id, stage_type))
            .cloned())
    }

    async fn stages(&self, session_id: SessionId) -> Result<Vec<TssStage>, StoreError> {
        let tables = self.tables.read();
        Ok(StageType::ALL
            .iter()
            .filter_map(|t| tables.stages.get(&(session_id, *t)).cloned())
            .collect())
    }

    async fn insert_stage(&self, stage: TssStage) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let key = (stage.session_id, stage.stage_type);
        if tables.stages.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "{} stage of session {} already exists",
                stage.stage_type, stage.session_id
            )));
        }
        tables.stages.insert(key, stage);
        Ok(())
    }

    async fn advance_stage(
        &self,
        session_id: SessionId,
        stage_type: StageType,
        expected: StageStatus,
        status: StageStatus,
        data: StageState,
        receipt: StepReceipt,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let stage = tables
            .stages
            .get_mut(&(session_id, stage_type))
            .ok_or_else(|| StoreError::NotFound(format!("{stage_type} stage of {session_id}")))?;
        if stage.stage_status != expected {
            return Err(StoreError::Conflict(format!(
                "stage is at {}, expected {expected}",
                stage.stage_status
            )));
        }
        stage.stage_status = status;
        stage.stage_data = data;
        stage.receipt = receipt;
        stage.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        crypto::commit,
        model::StepResponse,
        stage::{TriplesStatus, TriplesStep},
    };

    fn store() -> MemoryStore {
        MemoryStore::new(KeyShareNodeMeta { sss_threshold: 2 })
    }

    fn wallet(user: &str, curve_type: CurveType) -> Wallet {
        Wallet {
            wallet_id: WalletId::new(),
            user_id: user.to_string(),
            curve_type,
            public_key: vec![2; 33],
            status: WalletStatus::Active,
            sss_threshold: 2,
            share_generation: 0,
            enc_tss_share: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn receipt(step: u8) -> StepReceipt {
        StepReceipt {
            step,
            request: commit(&step),
            response: StepResponse {
                msgs: vec![step],
                output: None,
            },
        }
    }

    fn triples_stage(session_id: SessionId) -> TssStage {
        TssStage {
            session_id,
            stage_type: StageType::Triples,
            stage_status: StageStatus::Triples(TriplesStatus::Step1),
            stage_data: StageState::new(StageType::Triples, 1, vec![1]),
            receipt: receipt(1),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_one_wallet_per_user_and_curve() {
        let store = store();
        store
            .insert_wallet(wallet("alice", CurveType::Secp256k1))
            .await
            .unwrap();
        store
            .insert_wallet(wallet("alice", CurveType::Ed25519))
            .await
            .unwrap();
        let err = store
            .insert_wallet(wallet("alice", CurveType::Secp256k1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_wallet_node_statuses_are_per_wallet() {
        let store = store();
        let a = wallet("alice", CurveType::Secp256k1);
        let b = wallet("bob", CurveType::Secp256k1);
        let (a_id, b_id) = (a.wallet_id, b.wallet_id);
        store.insert_wallet(a).await.unwrap();
        store.insert_wallet(b).await.unwrap();
        store
            .set_wallet_node_status(a_id, &"ks-1".into(), WalletNodeStatus::UnrecoverableDataLoss)
            .await
            .unwrap();
        assert_eq!(store.wallet_node_statuses(a_id).await.unwrap().len(), 1);
        assert!(store.wallet_node_statuses(b_id).await.unwrap().is_empty());

        assert_eq!(store.next_share_generation(a_id).await.unwrap(), 1);
        assert_eq!(store.next_share_generation(a_id).await.unwrap(), 2);
        assert_eq!(store.next_share_generation(b_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stage_insert_is_unique() {
        let store = store();
        let session_id = SessionId::new();
        store.insert_stage(triples_stage(session_id)).await.unwrap();
        let err = store.insert_stage(triples_stage(session_id)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_advance_stage_compares_status() {
        let store = store();
        let session_id = SessionId::new();
        store.insert_stage(triples_stage(session_id)).await.unwrap();

        let step2 = crate::stage::StageStep::Triples(TriplesStep::Step2);
        let advance = |expected| {
            store.advance_stage(
                session_id,
                StageType::Triples,
                expected,
                step2.outcome(),
                StageState::new(StageType::Triples, 2, vec![2]),
                receipt(2),
            )
        };
        advance(StageStatus::Triples(TriplesStatus::Step1))
            .await
            .unwrap();
        // A second writer racing from the same predecessor loses.
        let err = advance(StageStatus::Triples(TriplesStatus::Step1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let stage = store
            .stage(session_id, StageType::Triples)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stage.stage_status, StageStatus::Triples(TriplesStatus::Step2));
        assert_eq!(stage.receipt.step, 2);
    }

    #[tokio::test]
    async fn test_latest_health_check_wins() {
        let store = store();
        for status in [
            crate::model::HealthStatus::Healthy,
            crate::model::HealthStatus::Unhealthy,
        ] {
            store
                .append_health_check(KsNodeHealthCheck {
                    node_id: "ks-1".into(),
                    status,
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
        let latest = store.latest_health_checks().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].status, crate::model::HealthStatus::Unhealthy);
    }
}
