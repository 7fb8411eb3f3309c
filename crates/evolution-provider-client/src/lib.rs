//! Provider client for channel pairing.
//!
//! Issues single request/response operations against the messaging provider
//! (create session, fetch pairing code, fetch session state, register
//! callback, read the callback back). It never retries and knows nothing
//! about timing; that policy belongs to the pairing orchestrator.
//!
//! The [`ProviderClient`] trait is the seam the orchestrator depends on.
//! [`EvolutionClient`] implements it over HTTP with `reqwest`.

mod client;
mod error;
mod evolution;
mod types;

pub use client::ProviderClient;
pub use error::{ProviderError, ProviderResult};
pub use evolution::EvolutionClient;
pub use types::{CallbackRegistration, CallbackStatus, PairingCode, SessionCreated};
