pub mod coordinator;
pub mod resource;
pub mod signal;

pub use coordinator::{ShutdownCoordinator, ShutdownCoordinatorBuilder, ShutdownPhase};
pub use resource::{CleanupReport, Resource, ResourceError, ResourceManager, TaskResource};
pub use signal::{ShutdownSignal, SignalHandler};
