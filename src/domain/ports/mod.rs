//! Trait seams to external collaborators.

pub mod event_sink;
pub mod identity;
pub mod module;
pub mod network;
pub mod platform;
pub mod registrar;

pub use event_sink::EventSink;
pub use identity::{Identity, PostureClaims};
pub use module::{ModuleBehavior, ModuleDefinition};
pub use network::NetworkStateProvider;
pub use platform::PlatformProbe;
pub use registrar::{ApiResponse, RegistrarApi, RegistrarError};
