//! # Relay Gateway Admission Control
//!
//! Admission layer for a gateway that relays AI requests to many upstream
//! providers. Before a request is dispatched it must pass three gates:
//!
//! - the caller's credential resolves to a routing group ([`credential`])
//! - the target channel, and the caller on that channel, are under their
//!   request ceilings ([`ratelimit`])
//! - the (channel, model) pairing is not quarantined for degraded latency
//!   ([`health`])
//!
//! [`admission::AdmissionGate`] runs the three in order. State can be shared
//! across gateway instances through an optional remote cache ([`cache`]);
//! without one every instance keeps its own counters.

/// Error types, configuration, clock and background task helpers
pub mod core;

/// Shared remote cache abstraction with Redis and in-memory backends
pub mod cache;

/// Channel+model circuit breaker driven by latency samples
pub mod health;

/// Per-channel and per-channel-per-caller request ceilings
pub mod ratelimit;

/// Multi-group credential routing with legacy migration
pub mod credential;

/// Composition of the three gates
pub mod admission;

/// Admin and admission HTTP surface
pub mod gateway;

/// Logging and metrics
pub mod observability;

pub use admission::{AdmissionDecision, AdmissionGate, AdmissionRequest, RejectReason, Rejection};
pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
