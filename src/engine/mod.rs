//! This module provides abstractions for plugging in an MPC engine.
//!
//! The session state machine never looks inside protocol state or messages.
//! It hands the engine the state persisted after the previous step, along with
//! whatever the client sent, and gets back new state to persist and messages to
//! return. How many rounds the math needs, and how it serializes its messages,
//! is entirely the engine's business.
use core::fmt;

use thiserror::Error;

use crate::stage::{StageStep, StageType};

pub mod transcript;

pub use transcript::{ClientRun, TranscriptEngine};

/// Represents an error the engine can report for a step.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The incoming messages, or the state they were checked against, failed
    /// validation. This is terminal for the session.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Something went wrong that says nothing about the peer's behavior.
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Opaque engine state, persisted between steps.
///
/// The tag records which stage and step produced the state, so a state can
/// never be fed to the wrong step without the engine noticing.
#[derive(Clone, PartialEq, Eq)]
pub struct StageState {
    stage: StageType,
    step: u8,
    bytes: Vec<u8>,
}

impl StageState {
    pub fn new(stage: StageType, step: u8, bytes: Vec<u8>) -> Self {
        Self { stage, step, bytes }
    }

    pub fn stage(&self) -> StageType {
        self.stage
    }

    pub fn step(&self) -> u8 {
        self.step
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageState")
            .field("stage", &self.stage)
            .field("step", &self.step)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// What the engine needs to run one server-side step.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub step: StageStep,
    /// The state after the previous step.
    ///
    /// For the first step of a stage, this is the final state of the previous
    /// stage, if there is one.
    pub prior: Option<&'a StageState>,
    /// The messages the client sent for this step.
    pub incoming: &'a [u8],
    /// The server's share of the signing key, for stages that need it.
    pub key_share: Option<&'a [u8]>,
}

/// The result of running a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// More steps follow.
    Advance { state: StageState, outgoing: Vec<u8> },
    /// The stage is finished, with an optional terminal output.
    Finish {
        state: StageState,
        outgoing: Vec<u8>,
        output: Option<Vec<u8>>,
    },
}

impl Transition {
    pub fn is_finish(&self) -> bool {
        matches!(self, Transition::Finish { .. })
    }
}

/// A trait for MPC engines.
///
/// This represents the server's side of a two-party protocol, as a pure
/// function from previous state and incoming messages to the next state.
pub trait MpcEngine: Send + Sync {
    /// Whether this engine needs the server's key share for a stage.
    fn needs_key_share(&self, stage: StageType) -> bool;

    /// Run one step.
    fn step(&self, input: StepInput<'_>) -> Result<Transition, EngineError>;
}
