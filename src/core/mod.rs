pub mod executor;
pub mod forward;
pub mod host;
pub mod messages;
pub mod resource_manager;

pub use executor::{CreateOutcome, ScriptExecutor, VmExecutor};
pub use forward::{ForwardOutcome, ForwardingCoordinator};
pub use host::Host;
pub use messages::{CommandResult, CreateRequest, DestroyRequest, ForwardEnvelope, StatusMessage, Tube};
pub use resource_manager::ResourceManager;
