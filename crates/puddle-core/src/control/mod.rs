//! Host-side loop timing
//!
//! Nothing in the core schedules itself. The binary drives
//! [`Robot::update`](crate::Robot::update) through a [`ControlLoop`], which
//! runs on the caller's thread at a fixed cadence.

mod control_loop;

pub use control_loop::{ControlLoop, ControlLoopConfig, ControlLoopStats};
