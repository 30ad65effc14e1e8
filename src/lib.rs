//! Staged, bounded process shutdown.
//!
//! Work registers against one of three [`Stage`]s through a shared
//! [`Coordinator`]. When shutdown is triggered the coordinator waits for
//! [`GateGuard`] holders to leave, then fires each stage in order and waits
//! (at most the configured timeout per stage) for its waiters to report
//! completion.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod notifier;
mod registry;
#[cfg(unix)]
pub mod signal;
pub mod stage;

pub use config::{ShutdownConfig, TermSignal};
pub use coordinator::{Coordinator, ShutdownReport, StageReport};
pub use error::{Error, Result};
pub use gate::GateGuard;
pub use notifier::{Completion, Notifier, NotifierId};
pub use stage::{Phase, Stage};
