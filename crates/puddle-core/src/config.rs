//! Robot topology document
//!
//! Describes which serial adapters exist, which bus each joint group sits on,
//! and every joint's motor id, range and gains. Stored as pretty-printed JSON;
//! uncalibrated range bounds are `null`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

pub use crate::actuator::Range;
use crate::bus::{DEFAULT_READ_TIMEOUT_CS, MAX_BUSES};
use crate::protocol::{ChecksumVersion, MAX_MOTOR_ID};
use crate::{Error, Result};

/// Default file the CLI reads and writes
pub const CONFIG_FILE: &str = "robot.json";

pub const DEFAULT_LEFT_BUS: &str = "left_bus";
pub const DEFAULT_RIGHT_BUS: &str = "right_bus";
pub const DEFAULT_LEFT_ADAPTER: &str = "/dev/ttyUSB0";
pub const DEFAULT_RIGHT_ADAPTER: &str = "/dev/ttyUSB1";

pub const MOTOR_ID_NECK: u8 = 0;
pub const MOTOR_ID_ANKLE_PITCH: u8 = 1;
pub const MOTOR_ID_KNEE_PITCH: u8 = 2;
pub const MOTOR_ID_HIP_PITCH: u8 = 3;
pub const MOTOR_ID_HIP_ROLL: u8 = 4;
pub const MOTOR_ID_HIP_YAW: u8 = 5;

/// Motor family on a bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BusKind {
    #[default]
    GoMotor,
}

fn default_read_timeout() -> u32 {
    DEFAULT_READ_TIMEOUT_CS
}

/// One serial adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: BusKind,
    /// Device path, e.g. `/dev/ttyUSB0`
    pub adapter: String,
    /// Motor protocol revision, 1 or 2
    pub version: u8,
    /// Per-read wait in centiseconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_cs: u32,
    /// Bytes a read waits for before returning early
    #[serde(default)]
    pub min_bytes: usize,
}

impl BusConfig {
    pub fn new(name: impl Into<String>, adapter: impl Into<String>, version: u8) -> Self {
        Self {
            name: name.into(),
            kind: BusKind::GoMotor,
            adapter: adapter.into(),
            version,
            read_timeout_cs: DEFAULT_READ_TIMEOUT_CS,
            min_bytes: 0,
        }
    }

    pub fn with_read_timeout(mut self, centiseconds: u32, min_bytes: usize) -> Self {
        self.read_timeout_cs = centiseconds;
        self.min_bytes = min_bytes;
        self
    }

    pub fn checksum_version(&self) -> Result<ChecksumVersion> {
        ChecksumVersion::try_from(self.version)
            .map_err(|e| Error::Config(format!("bus {}: {}", self.name, e)))
    }
}

fn default_kp() -> f64 {
    1.0
}

fn default_kd() -> f64 {
    0.01
}

/// Motor id, range and gains of one joint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointConfig {
    pub id: u8,
    #[serde(default)]
    pub range: Range,
    #[serde(default = "default_kp")]
    pub kp: f64,
    #[serde(default = "default_kd")]
    pub kd: f64,
    #[serde(default)]
    pub tau: f64,
    #[serde(default)]
    pub invert: bool,
}

impl JointConfig {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            range: Range::UNSET,
            kp: default_kp(),
            kd: default_kd(),
            tau: 0.0,
            invert: false,
        }
    }

    pub fn with_range(mut self, a: f64, b: f64) -> Self {
        self.range = Range::new(a, b);
        self
    }

    pub fn with_gains(mut self, kp: f64, kd: f64) -> Self {
        self.kp = kp;
        self.kd = kd;
        self
    }
}

/// The neck actuator and the bus it sits on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeckConfig {
    pub bus: String,
    #[serde(flatten)]
    pub joint: JointConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PitchJoint {
    pub pitch: JointConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HipJoints {
    pub pitch: JointConfig,
    pub roll: JointConfig,
    pub yaw: JointConfig,
}

/// One leg: its bus and five joints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegConfig {
    pub bus: String,
    pub ankle: PitchJoint,
    pub knee: PitchJoint,
    pub hip: HipJoints,
}

impl LegConfig {
    /// Leg with the stock motor ids and nothing calibrated
    pub fn new(bus: impl Into<String>) -> Self {
        Self {
            bus: bus.into(),
            ankle: PitchJoint {
                pitch: JointConfig::new(MOTOR_ID_ANKLE_PITCH),
            },
            knee: PitchJoint {
                pitch: JointConfig::new(MOTOR_ID_KNEE_PITCH),
            },
            hip: HipJoints {
                pitch: JointConfig::new(MOTOR_ID_HIP_PITCH),
                roll: JointConfig::new(MOTOR_ID_HIP_ROLL),
                yaw: JointConfig::new(MOTOR_ID_HIP_YAW),
            },
        }
    }

    /// Joints in actuator order: ankle, knee, hip pitch, hip roll, hip yaw
    pub fn joints(&self) -> [&JointConfig; 5] {
        [
            &self.ankle.pitch,
            &self.knee.pitch,
            &self.hip.pitch,
            &self.hip.roll,
            &self.hip.yaw,
        ]
    }

    pub fn joints_mut(&mut self) -> [&mut JointConfig; 5] {
        [
            &mut self.ankle.pitch,
            &mut self.knee.pitch,
            &mut self.hip.pitch,
            &mut self.hip.roll,
            &mut self.hip.yaw,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegsConfig {
    pub left: LegConfig,
    pub right: LegConfig,
}

/// Whole-robot topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    pub bus: Vec<BusConfig>,
    pub neck: NeckConfig,
    pub leg: LegsConfig,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            bus: vec![
                BusConfig::new(DEFAULT_LEFT_BUS, DEFAULT_LEFT_ADAPTER, 1),
                BusConfig::new(DEFAULT_RIGHT_BUS, DEFAULT_RIGHT_ADAPTER, 1),
            ],
            neck: NeckConfig {
                bus: DEFAULT_LEFT_BUS.into(),
                joint: JointConfig::new(MOTOR_ID_NECK),
            },
            leg: LegsConfig {
                left: LegConfig::new(DEFAULT_LEFT_BUS),
                right: LegConfig::new(DEFAULT_RIGHT_BUS),
            },
        }
    }
}

impl RobotConfig {
    /// Check bus count, bus names, protocol versions and motor ids
    ///
    /// Bus references from the neck and legs are resolved later, when the
    /// robot is assembled.
    pub fn validate(&self) -> Result<()> {
        if self.bus.len() > MAX_BUSES {
            return Err(Error::Config(format!(
                "{} buses configured, at most {} supported",
                self.bus.len(),
                MAX_BUSES
            )));
        }
        for (i, bus) in self.bus.iter().enumerate() {
            if bus.name.is_empty() {
                return Err(Error::Config(format!("bus #{} has no name", i)));
            }
            if self.bus[..i].iter().any(|b| b.name == bus.name) {
                return Err(Error::Config(format!("duplicate bus name {}", bus.name)));
            }
            bus.checksum_version()?;
        }

        let mut joints: Vec<(String, &JointConfig)> = vec![("neck".into(), &self.neck.joint)];
        for (side, leg) in [("left", &self.leg.left), ("right", &self.leg.right)] {
            for (joint, name) in leg.joints().into_iter().zip(crate::leg::JOINT_NAMES) {
                joints.push((format!("{}.{}", side, name), joint));
            }
        }
        for (name, joint) in joints {
            if joint.id > MAX_MOTOR_ID {
                return Err(Error::Config(format!(
                    "{}: motor id {} out of range 0-{}",
                    name, joint.id, MAX_MOTOR_ID
                )));
            }
        }
        Ok(())
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    /// Read and validate a JSON document
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("bad config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Load `path`, or write the defaults there if it does not exist yet
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if Self::exists(path) {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        info!("wrote default configuration to {}", path.display());
        Ok(config)
    }

    pub fn bus_config(&self, name: &str) -> Option<&BusConfig> {
        self.bus.iter().find(|b| b.name == name)
    }
}
