pub mod scheduler;
pub mod traits;

pub use scheduler::{LoopHandle, MaintenanceLoop};
pub use traits::{PeriodicTask, TickOutcome};
