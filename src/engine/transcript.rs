//! A deterministic reference engine, binding both parties to a shared transcript.
//!
//! This engine runs the same message schedule as the real two-party protocol,
//! over secp256k1:
//!
//! - TRIPLES: eleven rounds in which both parties contribute randomness, ending
//!   with a commitment to the generated triples.
//! - PRESIGN: an exchange of nonce commitments `R_c` and `R_s`, a confirmation
//!   round, and a final round where the client reveals the `R = R_c + R_s` it
//!   computed, which the server checks against its own.
//! - SIGN: both parties contribute a scalar bound to the message hash, and the
//!   output is `(x(R), s_c + s_s)`.
//!
//! Every message is absorbed into a hash chain, in the order client then server,
//! so both parties end each round with the same chain value.
//!
//! It performs none of the secret arithmetic of a real threshold ECDSA protocol,
//! and its "signatures" are not ECDSA signatures. It exists to exercise the
//! orchestration end to end, and to give clients something to run against in
//! development.
use elliptic_curve::{
    ff::Field, ops::Reduce, point::AffineCoordinates, sec1::ToEncodedPoint,
};
use k256::{ProjectivePoint, PublicKey, Scalar, U256};
use magikitten::Transcript;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use super::{EngineError, MpcEngine, StageState, StepInput, Transition};
use crate::{
    compat::{scalar_from_bytes, scalar_to_bytes},
    serde::{decode, encode},
    stage::{PresignStep, StageStep, StageType},
};

const CHAIN_LABEL: &[u8] = b"keyshare-custody transcript engine v0.1.0 chain";
const PRF_LABEL: &[u8] = b"keyshare-custody transcript engine v0.1.0 prf";

const CONTRIBUTION_LEN: usize = 32;
const HASH_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Role {
    Client,
    Server,
}

/// The state one party carries between steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EngineState {
    role: Role,
    seed: [u8; 32],
    chain: [u8; 32],
    /// Set once triple generation completes.
    triples: Option<[u8; 32]>,
    /// Our own nonce commitment, during presigning.
    own_big_r: Option<Vec<u8>>,
    /// The joint nonce commitment.
    big_r: Option<Vec<u8>>,
    /// Our contribution to the current round, kept by the client until the
    /// server answers.
    pending: Option<Vec<u8>>,
}

impl EngineState {
    fn new(role: Role) -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let mut chain = [0u8; 32];
        absorb(&mut chain, b"start", &[]);
        Self {
            role,
            seed,
            chain,
            triples: None,
            own_big_r: None,
            big_r: None,
            pending: None,
        }
    }

    fn contribution(&self, label: &'static [u8], step: StageStep) -> Vec<u8> {
        let mut out = vec![0u8; CONTRIBUTION_LEN];
        prf(&self.seed, &self.chain, &[step.stage_type().tag(), step.ordinal()])
            .challenge(label)
            .fill_bytes(&mut out);
        out
    }

    fn scalar(&self, label: &'static [u8], data: &[u8]) -> Scalar {
        Scalar::random(&mut prf(&self.seed, &self.chain, data).challenge(label))
    }
}

/// A message for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RoundMessage {
    stage: u8,
    step: u8,
    payload: Vec<u8>,
}

impl RoundMessage {
    fn new(step: StageStep, payload: Vec<u8>) -> Self {
        Self {
            stage: step.stage_type().tag(),
            step: step.ordinal(),
            payload,
        }
    }

    fn decode_for(step: StageStep, data: &[u8]) -> Result<Self, EngineError> {
        let msg: RoundMessage = decode(data)
            .map_err(|e| EngineError::Validation(format!("malformed message: {e}")))?;
        if msg.stage != step.stage_type().tag() || msg.step != step.ordinal() {
            return Err(EngineError::Validation(format!(
                "message is for stage tag {} step {}, expected {step}",
                msg.stage, msg.step
            )));
        }
        Ok(msg)
    }
}

fn absorb(chain: &mut [u8; 32], label: &'static [u8], data: &[u8]) {
    let mut transcript = Transcript::new(CHAIN_LABEL);
    transcript.message(b"previous", chain.as_slice());
    transcript.message(label, data);
    transcript.challenge(b"next").fill_bytes(chain);
}

fn prf(seed: &[u8; 32], chain: &[u8; 32], data: &[u8]) -> Transcript {
    let mut transcript = Transcript::new(PRF_LABEL);
    transcript.message(b"seed", seed.as_slice());
    transcript.message(b"chain", chain.as_slice());
    transcript.message(b"data", data);
    transcript
}

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

fn decode_point(bytes: &[u8], what: &str) -> Result<ProjectivePoint, EngineError> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|_| EngineError::Validation(format!("malformed {what}")))
}

fn expect_len(payload: &[u8], len: usize, what: &str) -> Result<(), EngineError> {
    if payload.len() != len {
        return Err(EngineError::Validation(format!(
            "{what} must be {len} bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}

/// The signature output of the sign stage, as `r || s`.
fn signature_bytes(big_r: &[u8], s: &Scalar) -> Result<Vec<u8>, EngineError> {
    let big_r = decode_point(big_r, "presign_big_r")?;
    let r = <Scalar as Reduce<U256>>::reduce_bytes(&big_r.to_affine().x());
    let mut out = scalar_to_bytes(&r);
    out.extend_from_slice(&scalar_to_bytes(s));
    Ok(out)
}

/// Load the state a step starts from.
fn load_state(input: &StepInput<'_>) -> Result<EngineState, EngineError> {
    let step = input.step;
    let stage = step.stage_type();

    let prior = match (step.is_first(), stage.previous()) {
        // Triple generation starts from scratch.
        (true, None) => return Ok(EngineState::new(Role::Server)),
        (true, Some(previous)) => {
            let prior = input.prior.ok_or_else(|| {
                EngineError::Validation(format!("{stage} needs a completed {previous} stage"))
            })?;
            if prior.stage() != previous || prior.step() != previous.step_count() {
                return Err(EngineError::Validation(format!(
                    "{stage} needs a completed {previous} stage"
                )));
            }
            prior
        }
        (false, _) => {
            let prior = input
                .prior
                .ok_or_else(|| EngineError::Internal(format!("no state for {step}")))?;
            if prior.stage() != stage || prior.step() + 1 != step.ordinal() {
                return Err(EngineError::Internal(format!(
                    "state from {} step {} cannot feed {step}",
                    prior.stage(),
                    prior.step()
                )));
            }
            prior
        }
    };

    let state: EngineState = decode(prior.as_bytes())
        .map_err(|e| EngineError::Internal(format!("corrupt engine state: {e}")))?;
    if state.role != Role::Server {
        return Err(EngineError::Internal("state belongs to a client".to_string()));
    }
    Ok(state)
}

/// The server side of the reference engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptEngine;

impl TranscriptEngine {
    pub fn new() -> Self {
        Self
    }

    fn triples_step(
        &self,
        state: &mut EngineState,
        step: StageStep,
        payload: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        expect_len(payload, CONTRIBUTION_LEN, "triples contribution")?;
        absorb(&mut state.chain, b"client", payload);
        let ours = state.contribution(b"triples", step);
        absorb(&mut state.chain, b"server", &ours);
        if step.is_last() {
            let mut triples = [0u8; 32];
            triples.copy_from_slice(&state.chain);
            absorb(&mut triples, b"triples output", &[]);
            state.triples = Some(triples);
        }
        Ok(ours)
    }

    fn presign_step(
        &self,
        state: &mut EngineState,
        step: PresignStep,
        payload: &[u8],
    ) -> Result<(Vec<u8>, Option<Vec<u8>>), EngineError> {
        match step {
            PresignStep::Step1 => {
                if state.triples.is_none() {
                    return Err(EngineError::Validation(
                        "no triples to presign with".to_string(),
                    ));
                }
                let their_big_r = decode_point(payload, "nonce commitment")?;
                absorb(&mut state.chain, b"client", payload);

                let k = state.scalar(b"nonce", b"presign");
                let own_big_r = encode_point(&(ProjectivePoint::GENERATOR * k));
                absorb(&mut state.chain, b"server", &own_big_r);

                let big_r = ProjectivePoint::GENERATOR * k + their_big_r;
                state.big_r = Some(encode_point(&big_r));
                state.own_big_r = Some(own_big_r.clone());
                Ok((own_big_r, None))
            }
            PresignStep::Step2 => {
                let step = StageStep::Presign(step);
                expect_len(payload, CONTRIBUTION_LEN, "presign confirmation")?;
                absorb(&mut state.chain, b"client", payload);
                let ours = state.contribution(b"presign", step);
                absorb(&mut state.chain, b"server", &ours);
                Ok((ours, None))
            }
            PresignStep::Step3 => {
                // Parse before comparing, so garbage is reported as garbage.
                decode_point(payload, "presign_big_r")?;
                let big_r = state
                    .big_r
                    .clone()
                    .ok_or_else(|| EngineError::Internal("no nonce commitment".to_string()))?;
                if !bool::from(big_r.as_slice().ct_eq(payload)) {
                    return Err(EngineError::Validation(
                        "presign_big_r does not match".to_string(),
                    ));
                }
                absorb(&mut state.chain, b"client", payload);
                absorb(&mut state.chain, b"server", &big_r);
                Ok((big_r.clone(), Some(big_r)))
            }
        }
    }

    fn sign_step(
        &self,
        state: &mut EngineState,
        payload: &[u8],
        key_share: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
        let key_share =
            key_share.ok_or_else(|| EngineError::Internal("signing needs a key share".to_string()))?;
        expect_len(payload, HASH_LEN + 32, "sign message")?;
        let (msg_hash, their_s) = payload.split_at(HASH_LEN);
        let their_s = scalar_from_bytes::<Scalar>(their_s)
            .ok_or_else(|| EngineError::Validation("malformed signature share".to_string()))?;
        let big_r = state
            .big_r
            .clone()
            .ok_or_else(|| EngineError::Validation("no presignature to sign with".to_string()))?;

        let mut data = msg_hash.to_vec();
        data.extend_from_slice(key_share);
        let our_s = state.scalar(b"sign", &data);

        absorb(&mut state.chain, b"client", payload);
        let ours = scalar_to_bytes(&our_s);
        absorb(&mut state.chain, b"server", &ours);

        let signature = signature_bytes(&big_r, &(their_s + our_s))?;
        Ok((ours, signature))
    }
}

impl MpcEngine for TranscriptEngine {
    fn needs_key_share(&self, stage: StageType) -> bool {
        stage == StageType::Sign
    }

    fn step(&self, input: StepInput<'_>) -> Result<Transition, EngineError> {
        let step = input.step;
        let msg = RoundMessage::decode_for(step, input.incoming)?;
        let mut state = load_state(&input)?;

        let (payload, output) = match step {
            StageStep::Triples(_) => (self.triples_step(&mut state, step, &msg.payload)?, None),
            StageStep::Presign(s) => self.presign_step(&mut state, s, &msg.payload)?,
            StageStep::Sign(_) => {
                let (payload, signature) =
                    self.sign_step(&mut state, &msg.payload, input.key_share)?;
                (payload, Some(signature))
            }
        };

        let state = StageState::new(step.stage_type(), step.ordinal(), encode(&state));
        let outgoing = encode(&RoundMessage::new(step, payload));
        if step.is_last() {
            Ok(Transition::Finish {
                state,
                outgoing,
                output,
            })
        } else {
            Ok(Transition::Advance { state, outgoing })
        }
    }
}

/// The client side of the reference engine.
///
/// Each round, the client first produces its [message](ClientRun::message),
/// sends it, and then [receives](ClientRun::receive) the server's answer.
#[derive(Debug, Clone)]
pub struct ClientRun {
    state: EngineState,
    msg_hash: Option<[u8; HASH_LEN]>,
}

impl Default for ClientRun {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRun {
    pub fn new() -> Self {
        Self {
            state: EngineState::new(Role::Client),
            msg_hash: None,
        }
    }

    /// Set the hash of the message the sign stage will sign.
    pub fn set_message_hash(&mut self, msg_hash: [u8; HASH_LEN]) {
        self.msg_hash = Some(msg_hash);
    }

    /// The joint nonce commitment, once the first presign round is done.
    pub fn presign_big_r(&self) -> Option<&[u8]> {
        self.state.big_r.as_deref()
    }

    /// Produce our message for a step.
    pub fn message(&mut self, step: StageStep) -> Result<Vec<u8>, EngineError> {
        let state = &mut self.state;
        let payload = match step {
            StageStep::Triples(_) | StageStep::Presign(PresignStep::Step2) => {
                state.contribution(b"client contribution", step)
            }
            StageStep::Presign(PresignStep::Step1) => {
                let k = state.scalar(b"nonce", b"presign");
                let own = encode_point(&(ProjectivePoint::GENERATOR * k));
                state.own_big_r = Some(own.clone());
                own
            }
            StageStep::Presign(PresignStep::Step3) => state
                .big_r
                .clone()
                .ok_or_else(|| EngineError::Internal("no nonce commitment yet".to_string()))?,
            StageStep::Sign(_) => {
                let msg_hash = self
                    .msg_hash
                    .ok_or_else(|| EngineError::Internal("no message hash set".to_string()))?;
                let s = state.scalar(b"sign", &msg_hash);
                let mut payload = msg_hash.to_vec();
                payload.extend_from_slice(&scalar_to_bytes(&s));
                payload
            }
        };
        absorb(&mut state.chain, b"client", &payload);
        state.pending = Some(payload.clone());
        Ok(encode(&RoundMessage::new(step, payload)))
    }

    /// Absorb the server's answer to a step.
    ///
    /// Returns the terminal output of the stage, if this step finished it.
    pub fn receive(
        &mut self,
        step: StageStep,
        incoming: &[u8],
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let msg = RoundMessage::decode_for(step, incoming)?;
        let state = &mut self.state;
        let ours = state
            .pending
            .take()
            .ok_or_else(|| EngineError::Internal(format!("no message sent for {step}")))?;

        let output = match step {
            StageStep::Triples(_) => {
                expect_len(&msg.payload, CONTRIBUTION_LEN, "triples contribution")?;
                absorb(&mut state.chain, b"server", &msg.payload);
                if step.is_last() {
                    let mut triples = [0u8; 32];
                    triples.copy_from_slice(&state.chain);
                    absorb(&mut triples, b"triples output", &[]);
                    state.triples = Some(triples);
                }
                None
            }
            StageStep::Presign(PresignStep::Step1) => {
                let theirs = decode_point(&msg.payload, "nonce commitment")?;
                absorb(&mut state.chain, b"server", &msg.payload);
                let own = decode_point(&ours, "nonce commitment")?;
                state.big_r = Some(encode_point(&(own + theirs)));
                None
            }
            StageStep::Presign(PresignStep::Step2) => {
                expect_len(&msg.payload, CONTRIBUTION_LEN, "presign confirmation")?;
                absorb(&mut state.chain, b"server", &msg.payload);
                None
            }
            StageStep::Presign(PresignStep::Step3) => {
                let big_r = state.big_r.clone().unwrap_or_default();
                if !bool::from(big_r.as_slice().ct_eq(&msg.payload)) {
                    return Err(EngineError::Validation(
                        "server presign_big_r does not match".to_string(),
                    ));
                }
                absorb(&mut state.chain, b"server", &msg.payload);
                Some(big_r)
            }
            StageStep::Sign(_) => {
                let their_s = scalar_from_bytes::<Scalar>(&msg.payload).ok_or_else(|| {
                    EngineError::Validation("malformed signature share".to_string())
                })?;
                let our_s = scalar_from_bytes::<Scalar>(&ours[HASH_LEN..])
                    .ok_or_else(|| EngineError::Internal("lost our signature share".to_string()))?;
                absorb(&mut state.chain, b"server", &msg.payload);
                let big_r = state
                    .big_r
                    .clone()
                    .ok_or_else(|| EngineError::Internal("no presignature".to_string()))?;
                Some(signature_bytes(&big_r, &(our_s + their_s))?)
            }
        };
        Ok(output)
    }
}
