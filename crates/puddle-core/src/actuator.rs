//! Per-joint actuator state machine
//!
//! An [`Actuator`] turns move requests into a stream of command frames and
//! folds feedback back into its observed state. It never touches a bus
//! itself: the owning [`Leg`](crate::Leg) (or the robot, for the neck) asks it
//! for a command each cycle and hands it whatever feedback came back.
//!
//! ```text
//!            move (t > 0)              finish time
//!   Idle ─────────────────► Moving ───────────────► Idle
//!    ▲  ▲                     │                       │ relax within the
//!    │  │ stiff               │ relax                 ▼ settle window
//!    │  └───────── Relaxed ◄──┴────────────────── Settling
//!    └──── move (t = 0) snaps                 (off time reached)
//! ```
//!
//! Time is passed in as whole milliseconds so the machine itself is pure.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::JointConfig;
use crate::motion::Easing;
use crate::protocol::{CommandFrame, Feedback, MotorError, MotorMode};
use crate::{Error, Result};

/// Time after a move finishes during which a relax request is deferred
pub const SETTLE_WINDOW_MS: u64 = 200;

/// A motor that answered within this window is considered responding
pub const RESPONSE_WINDOW_MS: u64 = 100;

/// How far outside [0, 1] a readout may drift before it is an alignment fault
const ALIGNMENT_MARGIN: f64 = 0.5;

/// Calibrated travel of a joint, in output degrees
///
/// The two bounds may be given in either order. A bound that has never been
/// calibrated is NaN and is stored as `null`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "[Option<f64>; 2]", into = "[Option<f64>; 2]")]
pub struct Range {
    bounds: [f64; 2],
}

impl Range {
    pub const UNSET: Range = Range {
        bounds: [f64::NAN, f64::NAN],
    };

    pub fn new(a: f64, b: f64) -> Self {
        Self { bounds: [a, b] }
    }

    pub fn bounds(&self) -> [f64; 2] {
        self.bounds
    }

    pub fn min(&self) -> f64 {
        self.bounds[0].min(self.bounds[1])
    }

    pub fn max(&self) -> f64 {
        self.bounds[0].max(self.bounds[1])
    }

    /// Both bounds set and distinct
    pub fn is_valid(&self) -> bool {
        self.bounds[0].is_finite() && self.bounds[1].is_finite() && self.bounds[0] != self.bounds[1]
    }
}

impl Default for Range {
    fn default() -> Self {
        Self::UNSET
    }
}

impl PartialEq for Range {
    fn eq(&self, other: &Self) -> bool {
        self.bounds
            .iter()
            .zip(other.bounds.iter())
            .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b)
    }
}

impl From<[Option<f64>; 2]> for Range {
    fn from(v: [Option<f64>; 2]) -> Self {
        Range::new(v[0].unwrap_or(f64::NAN), v[1].unwrap_or(f64::NAN))
    }
}

impl From<Range> for [Option<f64>; 2] {
    fn from(r: Range) -> Self {
        r.bounds.map(|b| if b.is_nan() { None } else { Some(b) })
    }
}

/// Where an actuator is in its motion lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    /// Holding the last commanded position
    Idle,
    /// Interpolating towards a target
    Moving,
    /// Move finished, relax requested; still holding until the off time
    Settling,
    /// Braked, zero gains
    Relaxed,
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    start_time: u64,
    finish_time: u64,
    start: f64,
    target: f64,
}

/// Interpolate between `start` and `target`; exact at both ends
fn interpolate(start: f64, target: f64, easing: Easing, fraction: f64) -> f64 {
    if fraction <= 0.0 {
        start
    } else if fraction >= 1.0 {
        target
    } else {
        start + (target - start) * easing.apply(fraction)
    }
}

/// One geared joint motor
#[derive(Debug, Clone)]
pub struct Actuator {
    id: u8,
    name: String,
    range: Range,
    invert: bool,
    kp: f64,
    kd: f64,
    tau: f64,
    easing: Easing,

    active: bool,
    ignored: bool,
    state: MotionState,
    motion: Option<Motion>,
    /// Commanded output angle, degrees
    pos_now: f64,
    last_move_time: u64,
    /// End of the settle window of the last finished move
    off_time: Option<u64>,

    /// Observed output angle, degrees
    degrees: f64,
    min_degrees: f64,
    max_degrees: f64,
    last_response: Option<u64>,
    last_error: MotorError,
    miss_count: u32,
    error_count: u32,
}

impl Actuator {
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            range: Range::UNSET,
            invert: false,
            kp: 1.0,
            kd: 0.01,
            tau: 0.0,
            easing: Easing::default(),
            active: false,
            ignored: false,
            state: MotionState::Relaxed,
            motion: None,
            pos_now: f64::NAN,
            last_move_time: 0,
            off_time: None,
            degrees: f64::NAN,
            min_degrees: f64::NAN,
            max_degrees: f64::NAN,
            last_response: None,
            last_error: MotorError::None,
            miss_count: 0,
            error_count: 0,
        }
    }

    pub fn from_config(name: impl Into<String>, joint: &JointConfig) -> Self {
        let mut actuator = Self::new(joint.id, name);
        actuator.range = joint.range;
        actuator.invert = joint.invert;
        actuator.kp = joint.kp;
        actuator.kd = joint.kd;
        actuator.tau = joint.tau;
        actuator
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn set_range(&mut self, a: f64, b: f64) {
        self.range = Range::new(a, b);
    }

    pub fn set_invert(&mut self, invert: bool) {
        self.invert = invert;
    }

    pub fn set_gains(&mut self, kp: f64, kd: f64) {
        self.kp = kp;
        self.kd = kd;
    }

    pub fn set_tau(&mut self, tau: f64) {
        self.tau = tau;
    }

    pub fn set_easing(&mut self, easing: Easing) {
        self.easing = easing;
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_moving(&self) -> bool {
        self.state == MotionState::Moving
    }

    /// Exclude this actuator from bus exchanges
    pub fn set_ignored(&mut self, ignored: bool) {
        self.ignored = ignored;
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored
    }

    /// Map a range fraction to output degrees
    ///
    /// Depends only on the range's min and max, not on the order the bounds
    /// were given in. NaN if the range is not calibrated.
    pub fn scale_to_pos(&self, fraction: f64) -> f64 {
        if !self.range.is_valid() {
            return f64::NAN;
        }
        let mut s = fraction.clamp(0.0, 1.0);
        if self.invert {
            s = 1.0 - s;
        }
        let (min, max) = (self.range.min(), self.range.max());
        min + (max - min) * s
    }

    /// Move to a range fraction in [0, 1]
    pub fn move_to_position(
        &mut self,
        now: u64,
        start_delay: u64,
        move_time: u64,
        fraction: f64,
    ) -> Result<()> {
        let degrees = self.scale_to_pos(fraction);
        self.move_to_degrees(now, start_delay, move_time, degrees)
    }

    /// Move to an output angle, clamped to the calibrated range
    ///
    /// A zero `move_time` jumps straight to the target. Any pending relax is
    /// cancelled.
    pub fn move_to_degrees(
        &mut self,
        now: u64,
        start_delay: u64,
        move_time: u64,
        degrees: f64,
    ) -> Result<()> {
        if !self.range.is_valid() {
            return Err(Error::InvalidState(format!(
                "actuator {} has no calibrated range",
                self.name
            )));
        }
        if degrees.is_nan() {
            return Err(Error::InvalidState(format!(
                "actuator {} asked to move to NaN",
                self.name
            )));
        }
        let target = degrees.clamp(self.range.min(), self.range.max());
        self.active = true;

        if move_time == 0 {
            self.motion = None;
            self.off_time = None;
            self.pos_now = target;
            self.state = MotionState::Idle;
            return Ok(());
        }

        let start = if self.degrees.is_finite() {
            self.degrees
        } else if self.pos_now.is_finite() {
            self.pos_now
        } else {
            target
        };
        let start_time = now.saturating_add(start_delay);
        let finish_time = start_time.saturating_add(move_time);
        self.motion = Some(Motion {
            start_time,
            finish_time,
            start,
            target,
        });
        self.off_time = Some(finish_time.saturating_add(SETTLE_WINDOW_MS));
        self.pos_now = start;
        self.last_move_time = now;
        self.state = MotionState::Moving;
        Ok(())
    }

    /// Advance the motion profile to `now`
    pub fn tick(&mut self, now: u64) {
        if let Some(m) = self.motion {
            if now < m.start_time {
                return;
            }
            if now >= m.finish_time {
                self.pos_now = m.target;
                self.motion = None;
                self.state = MotionState::Idle;
            } else if now != self.last_move_time {
                let fraction = (now - m.start_time) as f64 / (m.finish_time - m.start_time) as f64;
                self.pos_now = interpolate(m.start, m.target, self.easing, fraction);
                self.last_move_time = now;
            }
            return;
        }

        if let Some(off) = self.off_time {
            if now >= off {
                self.off_time = None;
                if self.state == MotionState::Settling {
                    self.active = false;
                    self.state = MotionState::Relaxed;
                }
            }
        }
    }

    /// Stop driving the joint
    ///
    /// Mid-move the actuator relaxes at once. Shortly after a move finished
    /// it keeps holding until the settle window closes.
    pub fn relax(&mut self, now: u64) {
        let settling = self.motion.is_none()
            && self.active
            && matches!(self.off_time, Some(off) if now < off);
        if settling {
            self.state = MotionState::Settling;
        } else {
            self.force_relax();
        }
    }

    /// Brake immediately, ignoring the settle window
    pub fn force_relax(&mut self) {
        self.motion = None;
        self.off_time = None;
        self.active = false;
        self.state = MotionState::Relaxed;
    }

    /// Start driving again, holding the last observed angle
    ///
    /// With no angle observed or commanded yet there is nothing to hold, so
    /// the actuator stays braked.
    pub fn stiff(&mut self) {
        self.motion = None;
        self.off_time = None;
        if self.degrees.is_finite() {
            self.pos_now = self.degrees;
        } else if !self.pos_now.is_finite() {
            warn!(actuator = %self.name, motor = self.id, "no known angle to hold; staying relaxed");
            self.force_relax();
            return;
        }
        self.active = true;
        self.state = MotionState::Idle;
    }

    /// Produce this cycle's command, or `None` when ignored
    pub fn command(&mut self, now: u64) -> Option<CommandFrame> {
        if self.ignored {
            return None;
        }
        self.tick(now);
        if self.active && self.pos_now.is_finite() {
            let mut cmd = CommandFrame::new(self.id, MotorMode::Drive);
            cmd.set_kp(self.kp);
            cmd.set_kd(self.kd);
            cmd.set_position_degrees(self.pos_now);
            cmd.set_torque(self.tau);
            cmd.set_velocity(0.0);
            Some(cmd)
        } else {
            Some(CommandFrame::brake(self.id))
        }
    }

    /// Fold one feedback frame into the observed state
    ///
    /// Returns whether the frame was accepted.
    pub fn ingest(&mut self, now: u64, feedback: &Feedback) -> bool {
        if feedback.error.is_fault() {
            self.error_count += 1;
            if feedback.error != self.last_error {
                warn!(
                    actuator = %self.name,
                    motor = self.id,
                    "motor reported {:?}",
                    feedback.error
                );
            }
            self.last_error = feedback.error;
            return false;
        }
        self.last_error = MotorError::None;
        if feedback.motor_id != self.id {
            warn!(
                actuator = %self.name,
                "wrong motor replied: got {}, expected {}",
                feedback.motor_id,
                self.id
            );
            return false;
        }

        let degrees = feedback.angle_degrees();
        self.degrees = degrees;
        if !self.active {
            self.pos_now = degrees;
        }
        if self.min_degrees.is_nan() || degrees < self.min_degrees {
            self.min_degrees = degrees;
        }
        if self.max_degrees.is_nan() || degrees > self.max_degrees {
            self.max_degrees = degrees;
        }
        self.last_response = Some(now);
        true
    }

    /// Count an exchange that produced no usable feedback
    pub fn record_miss(&mut self) {
        self.miss_count += 1;
    }

    /// Observed output angle in degrees (NaN before the first reply)
    pub fn degrees(&self) -> f64 {
        self.degrees
    }

    /// Angle currently being commanded, degrees
    pub fn commanded_degrees(&self) -> f64 {
        self.pos_now
    }

    /// Observed angle mapped into [0, 1] through the range
    ///
    /// `Ok(None)` when the range is uncalibrated or nothing has been observed
    /// yet. Slightly out-of-range readings are clamped; readings more than
    /// half a range outside are an alignment fault.
    pub fn try_position(&self) -> Result<Option<f64>> {
        if !self.range.is_valid() || self.degrees.is_nan() {
            return Ok(None);
        }
        let (min, max) = (self.range.min(), self.range.max());
        let mut position = (self.degrees - min) / (max - min);
        if self.invert {
            position = 1.0 - position;
        }
        if position < -ALIGNMENT_MARGIN || position > 1.0 + ALIGNMENT_MARGIN {
            return Err(Error::Alignment {
                actuator: self.name.clone(),
                position,
                degrees: self.degrees,
            });
        }
        Ok(Some(position.clamp(0.0, 1.0)))
    }

    /// [`try_position`](Self::try_position), with every failure folded to NaN
    pub fn position(&self) -> f64 {
        match self.try_position() {
            Ok(Some(p)) => p,
            Ok(None) => f64::NAN,
            Err(e) => {
                error!(
                    range = ?self.range.bounds(),
                    "{}",
                    e
                );
                f64::NAN
            }
        }
    }

    /// Smallest and largest angle observed, once anything has been observed
    pub fn envelope(&self) -> Option<(f64, f64)> {
        if self.min_degrees.is_nan() || self.max_degrees.is_nan() {
            None
        } else {
            Some((self.min_degrees, self.max_degrees))
        }
    }

    pub fn min_degrees(&self) -> f64 {
        self.min_degrees
    }

    pub fn max_degrees(&self) -> f64 {
        self.max_degrees
    }

    pub fn miss_count(&self) -> u32 {
        self.miss_count
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn has_error(&self) -> bool {
        self.miss_count != 0 || self.error_count != 0
    }

    pub fn last_error(&self) -> MotorError {
        self.last_error
    }

    /// Milliseconds since the last accepted feedback
    pub fn time_since_last_response(&self, now: u64) -> Option<u64> {
        self.last_response.map(|t| now.saturating_sub(t))
    }

    pub fn is_responding(&self, now: u64) -> bool {
        matches!(self.time_since_last_response(now), Some(dt) if dt < RESPONSE_WINDOW_MS)
    }
}
