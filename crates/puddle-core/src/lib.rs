//! puddle-core: joint control for a legged robot on geared BLDC actuators
//!
//! The robot is a neck plus two five-joint legs. Every joint is a geared
//! brushless actuator sitting on an RS-485 serial bus and speaking a fixed-size
//! binary frame protocol (17-byte commands, 16-byte feedback, CRC-16).
//!
//! # Modules
//!
//! - [`protocol`] - Wire codec for command/feedback frames, checksums, provisioning
//! - [`bus`] - Serial bus transport and the bus arena owned by the robot
//! - [`motion`] - Easing curves used when interpolating joint moves
//! - [`actuator`] - Per-joint state machine (range, gains, interpolation, faults)
//! - [`leg`] - Five-actuator leg, poses and batched bus exchange
//! - [`robot`] - Whole-body assembly: buses, neck, legs, warm-up, calibration
//! - [`trajectory`] - Pose recorder and player
//! - [`control`] - Fixed-rate control loop for the host process
//! - [`config`] - Robot topology document
//! - [`sim`] - Simulated motors behind a serial link
//!
//! # Data flow
//!
//! ```text
//! Robot ──► Leg ──► Actuator ──► CommandFrame ──► Bus ──► tty
//!   ▲        │                                     │
//!   │        └──── Feedback (matched by motor id) ◄┘
//!   │
//! Recorder / Player (operate on Leg poses only)
//! ```
//!
//! Everything runs on the caller's thread. A control cycle blocks for at most
//! the configured per-read timeout of each exchange.

#![warn(unused_must_use)]

pub mod actuator;
pub mod bus;
pub mod clock;
pub mod config;
pub mod control;
pub mod leg;
pub mod motion;
pub mod protocol;
pub mod robot;
pub mod sim;
pub mod trajectory;
pub mod verbosity;

#[cfg(test)]
pub(crate) mod test_support;

pub use actuator::{Actuator, MotionState, Range};
pub use bus::{Bus, BusId, BusSet, SerialLink};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::RobotConfig;
pub use control::{ControlLoop, ControlLoopConfig};
pub use leg::{Joint, Leg, Pose, PoseTarget};
pub use motion::Easing;
pub use protocol::{ChecksumVersion, CommandFrame, Feedback, FrameError, MotorError, MotorMode};
pub use robot::{Robot, Side};
pub use trajectory::{Player, Recorder, Sample, Trajectory};
pub use verbosity::{Trace, Verbosity};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for puddle-core
///
/// Per-motor problems inside a control cycle are not errors: they are counted
/// on the actuator and folded into the boolean result of `update()`. The
/// variants below are what escapes to the caller.
#[derive(Debug, thiserror::Error)]
#[must_use = "errors must be handled or explicitly ignored with let _ = ..."]
#[non_exhaustive]
pub enum Error {
    /// Invalid robot topology or parameter.
    /// Fatal at startup: unknown bus reference, bad checksum version, bad motor id.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serial link unavailable or a write failed.
    /// A disabled bus reports this for every operation instead of blocking.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A bounded read expired before a full frame arrived.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A frame was received but cannot be trusted.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// One or more motors did not answer or reported a fault.
    #[error("Actuator fault: {0}")]
    Fault(String),

    /// Observed joint angle lies far outside the calibrated range.
    /// Usually means the range was calibrated with the horn on a different spline.
    #[error("Actuator {actuator} out of alignment: position {position:.3} at {degrees:.2}°")]
    Alignment {
        actuator: String,
        position: f64,
        degrees: f64,
    },

    /// Operation attempted in a state that cannot honour it.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(format!("I/O error: {}", e))
    }
}

/// Result type alias for puddle-core operations
pub type Result<T> = std::result::Result<T, Error>;
