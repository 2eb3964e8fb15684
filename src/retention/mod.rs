//! Retention policy and the cleanup sweep that enforces it.

pub mod inventory;
pub mod policy;
pub mod sweep;

pub use inventory::{survey_directory, DirectorySummary};
pub use policy::{RetentionPolicy, Verdict};
pub use sweep::{sweep_directory, SweepError, SweepReport};
