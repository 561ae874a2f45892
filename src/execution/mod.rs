// Position exit management and linked-order reconciliation
pub mod arbiter;
pub mod control;
pub mod exit_controller;
pub mod oco_monitor;

pub use arbiter::{Arbiter, SharedExitState};
pub use control::CommandInbox;
pub use exit_controller::{restore_exit_states, CycleReport, ExitController};
pub use oco_monitor::OcoMonitor;
