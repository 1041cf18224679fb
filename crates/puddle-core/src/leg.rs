//! Five-actuator leg
//!
//! A [`Leg`] owns its actuators in a fixed anatomical order and runs one
//! batched exchange per control cycle on its bus. Each command gets its own
//! reply slot, and the bus rejects a reply whose motor id differs from the
//! addressed one, so a crosstalking motor can never feed another joint.

use std::fmt::Write as _;
use std::sync::Arc;

use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::actuator::Actuator;
use crate::bus::{BusId, BusSet};
use crate::clock::Clock;
use crate::config::LegConfig;
use crate::protocol::CommandFrame;
use crate::verbosity::{Trace, Verbosity};
use crate::Result;

/// Actuators per leg
pub const NUM_JOINTS: usize = 5;

/// Joint names in actuator order
pub const JOINT_NAMES: [&str; NUM_JOINTS] = [
    "ankle.pitch",
    "knee.pitch",
    "hip.pitch",
    "hip.roll",
    "hip.yaw",
];

/// Default time for a knee move
pub const DEFAULT_KNEE_MOVE_MS: u64 = 2_000;

/// A joint of the leg, in actuator order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Joint {
    AnklePitch = 0,
    KneePitch = 1,
    HipPitch = 2,
    HipRoll = 3,
    HipYaw = 4,
}

impl Joint {
    pub const ALL: [Joint; NUM_JOINTS] = [
        Joint::AnklePitch,
        Joint::KneePitch,
        Joint::HipPitch,
        Joint::HipRoll,
        Joint::HipYaw,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        JOINT_NAMES[self.index()]
    }
}

/// Normalized positions of all five joints
///
/// NaN marks a joint as unset. Equality is approximate: set entries must lie
/// within [`Pose::TOLERANCE`] of each other, unset entries match only unset
/// entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(from = "[Option<f64>; NUM_JOINTS]", into = "[Option<f64>; NUM_JOINTS]")]
pub struct Pose {
    positions: [f64; NUM_JOINTS],
}

impl Pose {
    pub const TOLERANCE: f64 = 1e-4;

    pub const UNSET: Pose = Pose {
        positions: [f64::NAN; NUM_JOINTS],
    };

    pub fn new(positions: [f64; NUM_JOINTS]) -> Self {
        Self { positions }
    }

    /// Every joint at the same position
    pub fn uniform(position: f64) -> Self {
        Self::new([position; NUM_JOINTS])
    }

    #[must_use]
    pub fn with(mut self, joint: Joint, position: f64) -> Self {
        self.positions[joint.index()] = position;
        self
    }

    pub fn get(&self, joint: Joint) -> f64 {
        self.positions[joint.index()]
    }

    pub fn set(&mut self, joint: Joint, position: f64) {
        self.positions[joint.index()] = position;
    }

    pub fn positions(&self) -> &[f64; NUM_JOINTS] {
        &self.positions
    }

    pub fn almost_equal(&self, other: &Pose, tolerance: f64) -> bool {
        self.positions
            .iter()
            .zip(other.positions.iter())
            .all(|(a, b)| {
                if a.is_nan() || b.is_nan() {
                    a.is_nan() && b.is_nan()
                } else {
                    (a - b).abs() <= tolerance
                }
            })
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::UNSET
    }
}

impl PartialEq for Pose {
    fn eq(&self, other: &Self) -> bool {
        self.almost_equal(other, Self::TOLERANCE)
    }
}

impl From<[Option<f64>; NUM_JOINTS]> for Pose {
    fn from(v: [Option<f64>; NUM_JOINTS]) -> Self {
        Self::new(v.map(|p| p.unwrap_or(f64::NAN)))
    }
}

impl From<Pose> for [Option<f64>; NUM_JOINTS] {
    fn from(p: Pose) -> Self {
        p.positions.map(|v| if v.is_nan() { None } else { Some(v) })
    }
}

/// Something whose joints can be read and driven as a whole pose
pub trait PoseTarget {
    /// Current normalized position of every joint
    fn pose(&self) -> Pose;

    /// Move every set joint to its target over `move_time` milliseconds
    fn set_pose(&mut self, pose: &Pose, move_time: u64) -> Result<()>;

    /// Stop driving all joints
    fn relax(&mut self);
}

/// One leg on one bus
pub struct Leg {
    name: String,
    bus: BusId,
    actuators: [Actuator; NUM_JOINTS],
    clock: Arc<dyn Clock>,
    verbosity: Verbosity,
}

impl std::fmt::Debug for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Leg")
            .field("name", &self.name)
            .field("bus", &self.bus)
            .field("actuators", &self.actuators)
            .finish()
    }
}

impl Leg {
    pub fn new(
        name: impl Into<String>,
        bus: BusId,
        config: &LegConfig,
        clock: Arc<dyn Clock>,
        verbosity: Verbosity,
    ) -> Self {
        let joints = config.joints();
        let actuators =
            std::array::from_fn(|i| Actuator::from_config(JOINT_NAMES[i], joints[i]));
        Self {
            name: name.into(),
            bus,
            actuators,
            clock,
            verbosity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> BusId {
        self.bus
    }

    pub fn actuators(&self) -> &[Actuator; NUM_JOINTS] {
        &self.actuators
    }

    pub fn actuators_mut(&mut self) -> &mut [Actuator; NUM_JOINTS] {
        &mut self.actuators
    }

    pub fn joint(&self, joint: Joint) -> &Actuator {
        &self.actuators[joint.index()]
    }

    pub fn joint_mut(&mut self, joint: Joint) -> &mut Actuator {
        &mut self.actuators[joint.index()]
    }

    /// Run one control cycle
    ///
    /// Returns false if any non-ignored actuator got no reply or a rejected
    /// one. Silent actuators get their miss count bumped; the others are
    /// updated normally.
    pub fn update(&mut self, buses: &mut BusSet) -> bool {
        let now = self.clock.now_ms();

        let mut cmds: ArrayVec<CommandFrame, NUM_JOINTS> = ArrayVec::new();
        let mut slots: ArrayVec<usize, NUM_JOINTS> = ArrayVec::new();
        for (i, actuator) in self.actuators.iter_mut().enumerate() {
            if let Some(cmd) = actuator.command(now) {
                if self.verbosity.is_enabled(Trace::Move) && actuator.is_active() {
                    info!(leg = %self.name, "[{}]: {:.4}", actuator.name(), actuator.commanded_degrees());
                }
                cmds.push(cmd);
                slots.push(i);
            }
        }

        let replies = match buses.get_mut(self.bus) {
            Some(bus) => bus.transact_batch(&cmds),
            None => {
                error!(leg = %self.name, "unresolved leg bus");
                ArrayVec::new()
            }
        };

        let mut success = true;
        for (n, &i) in slots.iter().enumerate() {
            let actuator = &mut self.actuators[i];
            match replies.get(n).copied().flatten() {
                Some(fb) => {
                    if !actuator.ingest(now, &fb) {
                        success = false;
                    }
                }
                None => {
                    actuator.record_miss();
                    success = false;
                }
            }
        }

        if self.verbosity.is_enabled(Trace::Position) {
            if let Some(report) = self.report() {
                info!("{}", report);
            }
        }
        success
    }

    /// Readout of every joint as `[leg.joint:pos ...]`, skipping unknown ones
    pub fn report(&self) -> Option<String> {
        let mut out = String::new();
        for actuator in &self.actuators {
            let pos = actuator.position();
            if pos.is_nan() {
                continue;
            }
            out.push(if out.is_empty() { '[' } else { ' ' });
            let _ = write!(out, "{}.{}:{:.6}", self.name, actuator.name(), pos);
        }
        if out.is_empty() {
            None
        } else {
            out.push(']');
            Some(out)
        }
    }

    pub fn pose(&self) -> Pose {
        Pose::new(std::array::from_fn(|i| self.actuators[i].position()))
    }

    /// Move every set joint of `pose`; unset joints keep their target
    ///
    /// All joints are attempted; the first failure is returned.
    pub fn set_pose(&mut self, pose: &Pose, move_time: u64) -> Result<()> {
        let now = self.clock.now_ms();
        let mut result = Ok(());
        for (actuator, &position) in self.actuators.iter_mut().zip(pose.positions()) {
            if position.is_nan() {
                continue;
            }
            if let Err(e) = actuator.move_to_position(now, 0, move_time, position) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn relax(&mut self) {
        let now = self.clock.now_ms();
        for actuator in self.actuators.iter_mut() {
            actuator.relax(now);
        }
    }

    /// Brake every joint now, skipping any settle window
    pub fn force_relax(&mut self) {
        for actuator in self.actuators.iter_mut() {
            actuator.force_relax();
        }
    }

    /// Stiffen every joint at its current angle
    pub fn stand(&mut self) {
        for actuator in self.actuators.iter_mut() {
            actuator.stiff();
        }
    }

    pub fn set_knee(&mut self, degrees: f64, move_time: u64) -> Result<()> {
        let now = self.clock.now_ms();
        self.joint_mut(Joint::KneePitch)
            .move_to_degrees(now, 0, move_time, degrees)
    }

    pub fn is_moving(&self) -> bool {
        self.actuators.iter().any(Actuator::is_moving)
    }
}

impl PoseTarget for Leg {
    fn pose(&self) -> Pose {
        Leg::pose(self)
    }

    fn set_pose(&mut self, pose: &Pose, move_time: u64) -> Result<()> {
        Leg::set_pose(self, pose, move_time)
    }

    fn relax(&mut self) {
        Leg::relax(self)
    }
}
