//! Driving a signing session through its stages, one request at a time.
//!
//! A session runs TRIPLES, then PRESIGN, then SIGN. Each step of each stage is
//! a separate request, handled here by:
//!
//! 1. resolving the session, and checking it belongs to the requested wallet;
//! 2. checking the caller owns that wallet;
//! 3. checking the stage is exactly one step behind the requested step;
//! 4. running the engine on the stored state and the client's messages;
//! 5. storing the new state, if the stage is still where step 3 saw it.
//!
//! Steps of one session are serialized by a lock, and the store's
//! compare-and-set guards against writers in other processes. A session's
//! lock lives only while some request holds or waits on it, so sessions
//! that clients abandon leave nothing behind.
//!
//! Repeating the last executed step with the same messages returns the stored
//! answer, without running the engine again. This lets clients retry requests
//! whose response was lost.
use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol::lock::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    cipher::ShareCipher,
    crypto::{commit, Commitment},
    engine::{EngineError, MpcEngine, StageState, StepInput, Transition},
    error::CustodyError,
    identity::Identity,
    model::{
        SessionId, SessionState, StepReceipt, StepResponse, TssSession, TssStage, Wallet,
        WalletId,
    },
    stage::{StageStep, StageType, TriplesStep},
    store::{Store, StoreError},
};

/// A request to run one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub email: String,
    pub wallet_id: WalletId,
    /// Absent only for the first step of triple generation, which starts a
    /// new session.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(with = "crate::serde::base64_bytes")]
    pub msgs: Vec<u8>,
}

/// The server's answer to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReply {
    pub session_id: SessionId,
    pub stage_type: StageType,
    pub stage_status: String,
    #[serde(with = "crate::serde::base64_bytes")]
    pub msgs: Vec<u8>,
    /// The terminal output of the stage, such as `presign_big_r`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::serde::base64_opt"
    )]
    pub output: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    pub stage_type: StageType,
    pub stage_status: String,
    pub updated_at: DateTime<Utc>,
}

/// A session and its stage history, without any protocol state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: SessionId,
    pub wallet_id: WalletId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stages: Vec<StageView>,
}

fn fingerprint(step: StageStep, msgs: &[u8]) -> Commitment {
    commit(&(step.stage_type().tag(), step.ordinal(), msgs))
}

pub struct SessionStateMachine {
    store: Arc<dyn Store>,
    engine: Arc<dyn MpcEngine>,
    cipher: ShareCipher,
    locks: parking_lot::Mutex<HashMap<SessionId, Arc<Mutex<()>>>>,
}

impl SessionStateMachine {
    pub fn new(store: Arc<dyn Store>, engine: Arc<dyn MpcEngine>, cipher: ShareCipher) -> Self {
        Self {
            store,
            engine,
            cipher,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, session_id: SessionId) -> Arc<Mutex<()>> {
        self.locks.lock().entry(session_id).or_default().clone()
    }

    /// Give back a lock from [Self::lock_for], dropping it from the table
    /// once no other request holds it.
    ///
    /// Clones are only taken under the table lock, so a count of one means
    /// the table has the last reference, and nobody can be waiting on it.
    fn release(&self, session_id: SessionId, lock: Arc<Mutex<()>>) {
        drop(lock);
        let mut locks = self.locks.lock();
        if locks
            .get(&session_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&session_id);
        }
    }

    /// Check the caller owns the wallet, under the email they claim.
    async fn authorize(
        &self,
        identity: &Identity,
        wallet_id: WalletId,
        email: &str,
    ) -> Result<Wallet, CustodyError> {
        let wallet = self
            .store
            .wallet(wallet_id)
            .await?
            .ok_or_else(|| CustodyError::Unauthorized(format!("unknown wallet {wallet_id}")))?;
        if wallet.user_id != identity.user_id {
            return Err(CustodyError::Unauthorized(
                "wallet belongs to another user".to_string(),
            ));
        }
        if email != identity.email {
            return Err(CustodyError::Unauthorized(
                "email does not match the token".to_string(),
            ));
        }
        Ok(wallet)
    }

    async fn load_session(&self, session_id: SessionId) -> Result<TssSession, CustodyError> {
        self.store
            .session(session_id)
            .await?
            .ok_or_else(|| CustodyError::InvalidSession(format!("unknown session {session_id}")))
    }

    async fn create_session(
        &self,
        wallet: &Wallet,
        identity: &Identity,
    ) -> Result<TssSession, CustodyError> {
        let now = Utc::now();
        let session = TssSession {
            session_id: SessionId::new(),
            wallet_id: wallet.wallet_id,
            customer_id: identity.user_id.clone(),
            state: SessionState::InProgress,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_session(session.clone()).await?;
        info!(session_id = %session.session_id, wallet_id = %wallet.wallet_id, "session created");
        Ok(session)
    }

    /// Run one step of a stage.
    #[instrument(skip_all, fields(stage = %stage_type, step = n, wallet_id = %request.wallet_id))]
    pub async fn step(
        &self,
        identity: &Identity,
        stage_type: StageType,
        n: u8,
        request: StepRequest,
    ) -> Result<StepReply, CustodyError> {
        let step = StageStep::new(stage_type, n)
            .ok_or_else(|| CustodyError::InvalidStage(format!("{stage_type} has no step {n}")))?;

        let existing = match request.session_id {
            Some(session_id) => {
                let session = self.load_session(session_id).await?;
                if session.wallet_id != request.wallet_id {
                    return Err(CustodyError::InvalidSession(format!(
                        "session {session_id} is not bound to wallet {}",
                        request.wallet_id
                    )));
                }
                Some(session)
            }
            None if step == StageStep::Triples(TriplesStep::Step1) => None,
            None => {
                return Err(CustodyError::InvalidSession(
                    "session_id is required".to_string(),
                ))
            }
        };

        let wallet = self
            .authorize(identity, request.wallet_id, &request.email)
            .await?;
        let session = match existing {
            Some(session) if session.customer_id != identity.user_id => {
                return Err(CustodyError::Unauthorized(
                    "session belongs to another user".to_string(),
                ))
            }
            Some(session) => session,
            None => self.create_session(&wallet, identity).await?,
        };
        let session_id = session.session_id;

        let lock = self.lock_for(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.run_step(&wallet, session_id, step, &request.msgs)
                .await
        };
        self.release(session_id, lock);
        result
    }

    async fn run_step(
        &self,
        wallet: &Wallet,
        session_id: SessionId,
        step: StageStep,
        msgs: &[u8],
    ) -> Result<StepReply, CustodyError> {
        let stage_type = step.stage_type();
        let reply = |response: StepResponse| StepReply {
            session_id,
            stage_type,
            stage_status: step.outcome().as_str().to_string(),
            msgs: response.msgs,
            output: response.output,
        };

        // The state may have changed while we waited for the lock.
        let session = self.load_session(session_id).await?;
        if session.state == SessionState::Failed {
            return Err(CustodyError::InvalidStage(format!(
                "session {session_id} has failed"
            )));
        }

        let request = fingerprint(step, msgs);
        let stage = self.store.stage(session_id, stage_type).await?;
        if let Some(stage) = &stage {
            if stage.receipt.step == step.ordinal() && stage.receipt.request == request {
                debug!(%session_id, "replaying stored response");
                return Ok(reply(stage.receipt.response.clone()));
            }
        }
        if session.state == SessionState::Completed {
            return Err(CustodyError::InvalidStage(format!(
                "session {session_id} is completed"
            )));
        }

        let prior = match step.predecessor() {
            None => {
                if let Some(stage) = stage {
                    return Err(CustodyError::InvalidStage(format!(
                        "{stage_type} stage already exists, at {}",
                        stage.stage_status.as_str()
                    )));
                }
                match stage_type.previous() {
                    None => None,
                    Some(previous) => {
                        let previous_stage = self
                            .store
                            .stage(session_id, previous)
                            .await?
                            .ok_or_else(|| {
                                CustodyError::InvalidStage(format!(
                                    "{stage_type} needs a {previous} stage first"
                                ))
                            })?;
                        if !previous_stage.stage_status.is_completed() {
                            return Err(CustodyError::InvalidStage(format!(
                                "{previous} stage is at {}, not COMPLETED",
                                previous_stage.stage_status.as_str()
                            )));
                        }
                        Some(previous_stage.stage_data)
                    }
                }
            }
            Some(expected) => {
                let stage = stage.ok_or_else(|| {
                    CustodyError::InvalidStage(format!("no {stage_type} stage to continue"))
                })?;
                if stage.stage_status != expected {
                    return Err(CustodyError::InvalidStage(format!(
                        "{stage_type} stage is at {}, step {} needs {}",
                        stage.stage_status.as_str(),
                        step.ordinal(),
                        expected.as_str()
                    )));
                }
                Some(stage.stage_data)
            }
        };

        let key_share = if self.engine.needs_key_share(stage_type) {
            Some(self.cipher.open(&wallet.enc_tss_share, &wallet.public_key)?)
        } else {
            None
        };

        let transition = self.engine.step(StepInput {
            step,
            prior: prior.as_ref(),
            incoming: msgs,
            key_share: key_share.as_deref().map(Vec::as_slice),
        });
        let transition = match transition {
            Ok(t) if t.is_finish() == step.is_last() => t,
            Ok(_) => {
                self.fail(session_id).await;
                return Err(EngineError::Internal(format!(
                    "engine finished out of turn at {step}"
                ))
                .into());
            }
            Err(EngineError::Validation(reason)) => {
                warn!(%session_id, %reason, "engine rejected step");
                self.fail(session_id).await;
                return Err(CustodyError::InvalidResult {
                    stage: stage_type,
                    reason,
                });
            }
            Err(e) => {
                warn!(%session_id, error = %e, "engine failed");
                self.fail(session_id).await;
                return Err(e.into());
            }
        };

        let (state, response) = match transition {
            Transition::Advance { state, outgoing } => (
                state,
                StepResponse {
                    msgs: outgoing,
                    output: None,
                },
            ),
            Transition::Finish {
                state,
                outgoing,
                output,
            } => (
                state,
                StepResponse {
                    msgs: outgoing,
                    output,
                },
            ),
        };
        self.persist(session_id, step, state, request, response.clone())
            .await?;

        if step.is_last() && stage_type == StageType::Sign {
            self.store
                .transition_session(session_id, SessionState::InProgress, SessionState::Completed)
                .await?;
            info!(%session_id, "session completed");
        }
        debug!(%session_id, status = %step.outcome(), "step done");
        Ok(reply(response))
    }

    async fn persist(
        &self,
        session_id: SessionId,
        step: StageStep,
        state: StageState,
        request: Commitment,
        response: StepResponse,
    ) -> Result<(), CustodyError> {
        let receipt = StepReceipt {
            step: step.ordinal(),
            request,
            response,
        };
        let stored = match step.predecessor() {
            None => {
                let now = Utc::now();
                self.store
                    .insert_stage(TssStage {
                        session_id,
                        stage_type: step.stage_type(),
                        stage_status: step.outcome(),
                        stage_data: state,
                        receipt,
                        created_at: now,
                        updated_at: now,
                    })
                    .await
            }
            Some(expected) => {
                self.store
                    .advance_stage(
                        session_id,
                        step.stage_type(),
                        expected,
                        step.outcome(),
                        state,
                        receipt,
                    )
                    .await
            }
        };
        stored.map_err(|e| match e {
            StoreError::Conflict(msg) => CustodyError::InvalidStage(msg),
            e => e.into(),
        })
    }

    async fn fail(&self, session_id: SessionId) {
        match self
            .store
            .transition_session(session_id, SessionState::InProgress, SessionState::Failed)
            .await
        {
            Ok(()) => warn!(%session_id, "session failed"),
            Err(e) => warn!(%session_id, error = %e, "could not mark session failed"),
        }
    }

    async fn owned_session(
        &self,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<TssSession, CustodyError> {
        let session = self.load_session(session_id).await?;
        if session.customer_id != identity.user_id {
            return Err(CustodyError::Unauthorized(
                "session belongs to another user".to_string(),
            ));
        }
        Ok(session)
    }

    pub async fn session_status(
        &self,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<SessionView, CustodyError> {
        let session = self.owned_session(identity, session_id).await?;
        let stages = self
            .store
            .stages(session_id)
            .await?
            .into_iter()
            .map(|stage| StageView {
                stage_type: stage.stage_type,
                stage_status: stage.stage_status.as_str().to_string(),
                updated_at: stage.updated_at,
            })
            .collect();
        Ok(SessionView {
            session_id,
            wallet_id: session.wallet_id,
            state: session.state,
            created_at: session.created_at,
            updated_at: session.updated_at,
            stages,
        })
    }

    pub async fn abort_session(
        &self,
        identity: &Identity,
        session_id: SessionId,
    ) -> Result<(), CustodyError> {
        self.owned_session(identity, session_id).await?;
        let lock = self.lock_for(session_id);
        let result = {
            let _guard = lock.lock().await;
            self.store
                .transition_session(session_id, SessionState::InProgress, SessionState::Failed)
                .await
        };
        self.release(session_id, lock);
        result.map_err(|e| match e {
            StoreError::Conflict(_) => CustodyError::InvalidSession(format!(
                "session {session_id} is not in progress"
            )),
            e => e.into(),
        })?;
        info!(%session_id, "session aborted");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        compat::CurveType,
        engine::{ClientRun, TranscriptEngine},
        error::ErrorCode,
        model::{KeyShareNodeMeta, WalletStatus},
        store::{MemoryStore, SessionStore, WalletStore},
    };

    /// Counts how often the engine actually runs.
    struct CountingEngine {
        inner: TranscriptEngine,
        runs: AtomicUsize,
    }

    impl MpcEngine for CountingEngine {
        fn needs_key_share(&self, stage: StageType) -> bool {
            self.inner.needs_key_share(stage)
        }

        fn step(&self, input: StepInput<'_>) -> Result<Transition, EngineError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.inner.step(input)
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        engine: Arc<CountingEngine>,
        machine: SessionStateMachine,
        alice: Identity,
        wallet_id: WalletId,
    }

    async fn wallet_for(store: &MemoryStore, cipher: &ShareCipher, user: &str) -> WalletId {
        let public_key = vec![2u8; 33];
        let wallet = Wallet {
            wallet_id: WalletId::new(),
            user_id: user.to_string(),
            curve_type: CurveType::Secp256k1,
            enc_tss_share: cipher.seal(&[7u8; 32], &public_key),
            public_key,
            status: WalletStatus::Active,
            sss_threshold: 2,
            share_generation: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let id = wallet.wallet_id;
        store.insert_wallet(wallet).await.unwrap();
        id
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new(KeyShareNodeMeta { sss_threshold: 2 }));
        let cipher = ShareCipher::new([9u8; 32]);
        let engine = Arc::new(CountingEngine {
            inner: TranscriptEngine::new(),
            runs: AtomicUsize::new(0),
        });
        let wallet_id = wallet_for(&store, &cipher, "alice").await;
        let machine = SessionStateMachine::new(store.clone(), engine.clone(), cipher);
        Harness {
            store,
            engine,
            machine,
            alice: Identity {
                user_id: "alice".to_string(),
                email: "alice@example.com".to_string(),
            },
            wallet_id,
        }
    }

    impl Harness {
        fn request(&self, session_id: Option<SessionId>, msgs: Vec<u8>) -> StepRequest {
            StepRequest {
                email: self.alice.email.clone(),
                wallet_id: self.wallet_id,
                session_id,
                msgs,
            }
        }

        /// Run steps `from..=to` of a stage, driving the client side too.
        async fn run(
            &self,
            client: &mut ClientRun,
            session_id: Option<SessionId>,
            stage: StageType,
            from: u8,
            to: u8,
        ) -> StepReply {
            let mut session_id = session_id;
            let mut last = None;
            for n in from..=to {
                let step = StageStep::new(stage, n).unwrap();
                let msgs = client.message(step).unwrap();
                let reply = self
                    .machine
                    .step(&self.alice, stage, n, self.request(session_id, msgs))
                    .await
                    .unwrap();
                client.receive(step, &reply.msgs).unwrap();
                session_id = Some(reply.session_id);
                last = Some(reply);
            }
            last.unwrap()
        }

        async fn status(&self, session_id: SessionId, stage: StageType) -> String {
            self.store
                .stage(session_id, stage)
                .await
                .unwrap()
                .unwrap()
                .stage_status
                .to_string()
        }
    }

    fn code(result: Result<StepReply, CustodyError>) -> ErrorCode {
        result.unwrap_err().code()
    }

    #[tokio::test]
    async fn test_happy_path_through_sign() {
        let h = harness().await;
        let mut client = ClientRun::new();

        let triples = h.run(&mut client, None, StageType::Triples, 1, 11).await;
        let session_id = triples.session_id;
        assert_eq!(triples.stage_status, "COMPLETED");
        assert_eq!(
            h.status(session_id, StageType::Triples).await,
            "TRIPLES:COMPLETED"
        );

        let presign = h
            .run(&mut client, Some(session_id), StageType::Presign, 1, 3)
            .await;
        assert_eq!(
            h.status(session_id, StageType::Presign).await,
            "PRESIGN:COMPLETED"
        );
        assert_eq!(presign.output.as_deref(), client.presign_big_r());

        client.set_message_hash([4u8; 32]);
        let sign = h
            .run(&mut client, Some(session_id), StageType::Sign, 1, 1)
            .await;
        assert_eq!(sign.output.map(|s| s.len()), Some(64));

        let view = h.machine.session_status(&h.alice, session_id).await.unwrap();
        assert_eq!(view.state, SessionState::Completed);
        assert_eq!(view.stages.len(), 3);
        assert!(view.stages.iter().all(|s| s.stage_status == "COMPLETED"));
    }

    #[tokio::test]
    async fn test_presign_needs_completed_triples() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let reply = h.run(&mut client, None, StageType::Triples, 1, 10).await;
        let session_id = reply.session_id;
        assert_eq!(h.status(session_id, StageType::Triples).await, "TRIPLES:STEP_10");

        let msgs = client
            .message(StageStep::new(StageType::Presign, 1).unwrap())
            .unwrap();
        let result = h
            .machine
            .step(&h.alice, StageType::Presign, 1, h.request(Some(session_id), msgs))
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssStage);
    }

    #[tokio::test]
    async fn test_presign_without_triples() {
        let h = harness().await;
        let now = Utc::now();
        let session_id = SessionId::new();
        h.store
            .insert_session(TssSession {
                session_id,
                wallet_id: h.wallet_id,
                customer_id: h.alice.user_id.clone(),
                state: SessionState::InProgress,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let msgs = ClientRun::new()
            .message(StageStep::new(StageType::Presign, 1).unwrap())
            .unwrap();
        let result = h
            .machine
            .step(
                &h.alice,
                StageType::Presign,
                1,
                h.request(Some(session_id), msgs.clone()),
            )
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssStage);
        assert!(h.store.stages(session_id).await.unwrap().is_empty());

        let result = h
            .machine
            .step(&h.alice, StageType::Presign, 1, h.request(None, msgs))
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssSession);
    }

    #[tokio::test]
    async fn test_second_presign_stage_refused() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let session_id = h
            .run(&mut client, None, StageType::Triples, 1, 11)
            .await
            .session_id;
        h.run(&mut client, Some(session_id), StageType::Presign, 1, 3)
            .await;

        let msgs = ClientRun::new()
            .message(StageStep::new(StageType::Presign, 1).unwrap())
            .unwrap();
        let result = h
            .machine
            .step(&h.alice, StageType::Presign, 1, h.request(Some(session_id), msgs))
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssStage);
    }

    #[tokio::test]
    async fn test_out_of_order_step() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let session_id = h
            .run(&mut client, None, StageType::Triples, 1, 2)
            .await
            .session_id;
        let msgs = client
            .message(StageStep::new(StageType::Triples, 4).unwrap())
            .unwrap();
        let result = h
            .machine
            .step(&h.alice, StageType::Triples, 4, h.request(Some(session_id), msgs))
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssStage);

        let result = h
            .machine
            .step(&h.alice, StageType::Triples, 12, h.request(Some(session_id), vec![]))
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssStage);
    }

    #[tokio::test]
    async fn test_session_binding() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let session_id = h
            .run(&mut client, None, StageType::Triples, 1, 1)
            .await
            .session_id;
        let msgs = client
            .message(StageStep::new(StageType::Triples, 2).unwrap())
            .unwrap();

        let mut request = h.request(Some(session_id), msgs.clone());
        request.wallet_id = WalletId::new();
        let result = h.machine.step(&h.alice, StageType::Triples, 2, request).await;
        assert_eq!(code(result), ErrorCode::InvalidTssSession);

        let result = h
            .machine
            .step(
                &h.alice,
                StageType::Triples,
                2,
                h.request(Some(SessionId::new()), msgs.clone()),
            )
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssSession);

        let mut request = h.request(Some(session_id), msgs.clone());
        request.email = "mallory@example.com".to_string();
        let result = h.machine.step(&h.alice, StageType::Triples, 2, request).await;
        assert_eq!(code(result), ErrorCode::Unauthorized);

        let bob = Identity {
            user_id: "bob".to_string(),
            email: "alice@example.com".to_string(),
        };
        let result = h
            .machine
            .step(&bob, StageType::Triples, 2, h.request(Some(session_id), msgs))
            .await;
        assert_eq!(code(result), ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_retry_replays_stored_response() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let first = h.run(&mut client, None, StageType::Triples, 1, 3).await;
        let runs = h.engine.runs.load(Ordering::SeqCst);

        let step = StageStep::new(StageType::Triples, 4).unwrap();
        let msgs = client.message(step).unwrap();
        let request = h.request(Some(first.session_id), msgs);
        let a = h
            .machine
            .step(&h.alice, StageType::Triples, 4, request.clone())
            .await
            .unwrap();
        let b = h
            .machine
            .step(&h.alice, StageType::Triples, 4, request)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(h.engine.runs.load(Ordering::SeqCst), runs + 1);

        // The client continues as if only one request was made.
        client.receive(step, &b.msgs).unwrap();
        h.run(&mut client, Some(first.session_id), StageType::Triples, 5, 11)
            .await;
    }

    #[tokio::test]
    async fn test_concurrent_steps_advance_once() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let session_id = h
            .run(&mut client, None, StageType::Triples, 1, 1)
            .await
            .session_id;

        let step = StageStep::new(StageType::Triples, 2).unwrap();
        let a = client.message(step).unwrap();
        let b = ClientRun::new().message(step).unwrap();
        let (ra, rb) = futures::join!(
            h.machine
                .step(&h.alice, StageType::Triples, 2, h.request(Some(session_id), a)),
            h.machine
                .step(&h.alice, StageType::Triples, 2, h.request(Some(session_id), b)),
        );
        assert_eq!([ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let err = ra.err().or(rb.err()).unwrap();
        assert_eq!(err.code(), ErrorCode::InvalidTssStage);
        assert_eq!(h.status(session_id, StageType::Triples).await, "TRIPLES:STEP_2");
        assert!(h.machine.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_session_leaves_no_lock() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let session_id = h
            .run(&mut client, None, StageType::Triples, 1, 3)
            .await
            .session_id;

        // The client never comes back.
        let session = h.store.session(session_id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::InProgress);
        assert!(h.machine.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_lock_outlives_release_while_shared() {
        let h = harness().await;
        let session_id = SessionId::new();
        let a = h.machine.lock_for(session_id);
        let b = h.machine.lock_for(session_id);
        assert!(Arc::ptr_eq(&a, &b));

        let guard = b.lock().await;
        h.machine.release(session_id, a);
        // Whoever comes next must queue on the mutex still held.
        let c = h.machine.lock_for(session_id);
        assert!(Arc::ptr_eq(&b, &c));
        assert!(c.try_lock().is_none());

        drop(guard);
        h.machine.release(session_id, b);
        h.machine.release(session_id, c);
        assert!(h.machine.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_engine_rejection_fails_session() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let session_id = h
            .run(&mut client, None, StageType::Triples, 1, 11)
            .await
            .session_id;
        h.run(&mut client, Some(session_id), StageType::Presign, 1, 2)
            .await;

        // A presign_big_r that is not the one the server computed.
        let step = StageStep::new(StageType::Presign, 3).unwrap();
        let mut garbage = client.message(step).unwrap();
        let last = garbage.len() - 1;
        garbage[last] ^= 0xff;
        let result = h
            .machine
            .step(&h.alice, StageType::Presign, 3, h.request(Some(session_id), garbage))
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssPresignResult);

        let session = h.store.session(session_id).await.unwrap().unwrap();
        assert_eq!(session.state, SessionState::Failed);

        // Nothing more happens in a failed session.
        let msgs = client.message(step).unwrap();
        let result = h
            .machine
            .step(&h.alice, StageType::Presign, 3, h.request(Some(session_id), msgs))
            .await;
        assert_eq!(code(result), ErrorCode::InvalidTssStage);
    }

    #[tokio::test]
    async fn test_abort_session() {
        let h = harness().await;
        let mut client = ClientRun::new();
        let session_id = h
            .run(&mut client, None, StageType::Triples, 1, 1)
            .await
            .session_id;

        let bob = Identity {
            user_id: "bob".to_string(),
            email: "bob@example.com".to_string(),
        };
        assert!(matches!(
            h.machine.abort_session(&bob, session_id).await,
            Err(CustodyError::Unauthorized(_))
        ));

        h.machine.abort_session(&h.alice, session_id).await.unwrap();
        let view = h.machine.session_status(&h.alice, session_id).await.unwrap();
        assert_eq!(view.state, SessionState::Failed);
        assert!(matches!(
            h.machine.abort_session(&h.alice, session_id).await,
            Err(CustodyError::InvalidSession(_))
        ));
        assert!(h.machine.locks.lock().is_empty());
    }
}
