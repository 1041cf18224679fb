//! Simulated hardware
//!
//! Motors that live behind a [`SerialLink`](crate::bus::SerialLink) and speak
//! the real wire protocol, for tests and for running without a robot.

pub mod motors;

pub use motors::{SimLink, SimulatedMotors};
