//! Infrastructure layer: registrar transport, persistence, crypto,
//! archives, logging, and platform adapters.

pub mod archive;
pub mod config;
pub mod crypto;
pub mod logging;
pub mod persistence;
pub mod platform;
pub mod registrar;
pub mod sink;

pub use config::ConfigLoader;
pub use persistence::StateLayout;
pub use registrar::HttpRegistrarClient;
