//! ACME agent - endpoint compliance agent core.
//!
//! A compliance-module scheduler and executor with:
//! - Pluggable compliance modules with per-module state machines
//! - Executor pool fed by request/response queues with adaptive sizing
//! - Recurring configuration pull from a central registrar
//! - Signed installer (usher) pipeline with hash and signature gating
//! - Registration/renewal with adaptive retry
//! - Routed, disk-buffered event sink

pub mod cli;
pub mod daemon;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use daemon::Agent;
pub use domain::errors::{AgentError, AgentResult};
