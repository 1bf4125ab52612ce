//! Application services for the compliance agent.

pub mod compliance_config;
pub mod config_controller;
pub mod config_files;
pub mod controller;
pub mod event_router;
pub mod executor;
pub mod qualifier;
pub mod registration;
pub mod registry;
pub mod timer;
pub mod token_config;
pub mod usher;

pub use config_controller::{ConfigModule, ConfigModuleError, ConfigurationController};
pub use controller::ComplianceController;
pub use event_router::EventRouter;
pub use executor::{Executor, ExecutorHandle};
pub use qualifier::Qualifier;
pub use registration::RegistrationManager;
pub use registry::ModuleRegistry;
pub use timer::{RecurringTimer, TimerError};
