pub mod bus;
pub mod entity;
pub mod error;

pub use bus::{EventBus, SharedEventBus};
pub use error::{FluxError, Result};
