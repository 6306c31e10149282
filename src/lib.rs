pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod logs;
pub mod monitoring;
pub mod queue;
pub mod reporter;
pub mod scheduler;
pub mod worker;

// Re-exports
pub use crate::config::Settings;
pub use crate::core::{ForwardingCoordinator, Host, ResourceManager};
pub use crate::errors::{ClusterError, ClusterResult};
pub use crate::logs::{LogStore, RetentionPolicy};
#[doc(hidden)]
pub use crate::queue::MemoryBroker;
pub use crate::queue::{BeanstalkBroker, Broker};
pub use crate::reporter::StatusReporter;
pub use crate::scheduler::HostSelector;
pub use crate::worker::{CycleOutcome, WorkerLoop};
