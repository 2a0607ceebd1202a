//! Keyshare custody is a service holding one half of a user's two-party
//! signing key, and backing up the other half across a set of custodian nodes.
//!
//! # Warning
//!
//! This is experimental cryptographic software.
//!
//! - The bundled [engine::TranscriptEngine] exercises the protocol schedule,
//! but does not produce real ECDSA signatures.
//! - This library has not undergone any form of audit.
//!
//! # Design
//!
//! There are two halves to the service.
//!
//! The first half orchestrates signing sessions between a client and the
//! server. A session runs three stages in order:
//!
//! - TRIPLES, generating Beaver triples, in eleven steps;
//! - PRESIGN, turning triples into a presignature, in three steps;
//! - SIGN, using the presignature on a message hash, in one step.
//!
//! Each step is a separate, stateless HTTP request. The server persists the
//! opaque state an [engine::MpcEngine] hands back after each step, and
//! enforces that steps run in order, exactly once, for the wallet the session
//! was opened on. See [session] for the rules.
//!
//! The second half keeps the user's *key component* recoverable. At signup the
//! component is split with Shamir's scheme, at a threshold `t`, across every
//! custodian node:
//! ```ignore
//! x_c = f(0), share_i = f(i + 1), deg(f) = t - 1
//! ```
//! Each share is sealed before it leaves the server, and tagged with a
//! *generation*, so that shares from different splits are never combined. At
//! sign-in, shares are fetched from every active node, and any `t` of the
//! newest generation rebuild `x_c`, which is checked against the wallet's
//! public key.
//!
//! Nodes fail. The service tracks which nodes are activated by operators,
//! polls their health, and records which nodes lost which wallet's share.
//! Once every node is active again, a *reshare* rebuilds the component from
//! the survivors and splits it anew, under a fresh generation, without
//! changing the public key.
//!
//! # Layout
//!
//! | Module | Role |
//! |--------|------|
//! |[session]|the stage state machine|
//! |[wallet]|signup, sign-in, data loss|
//! |[reshare]|restoring lost shares|
//! |[distributor], [reconstructor]|fanning shares out, and back in|
//! |[health]|activation, health checks, readiness|
//! |[store]|persistence|
//! |[node]|the node protocol, its client, and a reference node|
//! |[api]|the HTTP surface|
pub mod api;
pub mod cipher;
pub mod cluster;
pub mod compat;
pub mod config;
mod crypto;
pub mod distributor;
pub mod engine;
pub mod error;
mod fanout;
pub mod health;
pub mod identity;
mod math;
pub mod model;
pub mod node;
mod participants;
pub mod reconstructor;
pub mod reshare;
mod serde;
pub mod session;
pub mod sss;
pub mod stage;
pub mod store;
pub mod wallet;

pub use compat::{CurveType, CustodyCurve};
pub use error::{CustodyError, ErrorCode};

/// Resolves once the process is asked to stop.
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for shutdown");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
