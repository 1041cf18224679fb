//! Pose trajectories: recording, playback and persistence
//!
//! A trajectory is a list of [`Sample`]s, each carrying the time since the
//! previous sample and the leg pose at that moment. The [`Recorder`] builds
//! one by watching a leg, the [`Player`] drives a leg through one.

pub mod player;
pub mod recorder;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::leg::Pose;
use crate::{Error, Result};

pub use player::{Player, TRANSITION_MS};
pub use recorder::Recorder;

/// One captured pose
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Milliseconds since the previous sample; zero for the first
    pub elapsed: u64,
    pub pose: Pose,
}

/// An ordered list of samples, optionally tagged with the leg it came from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leg: Option<String>,
    pub samples: Vec<Sample>,
}

impl Trajectory {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { leg: None, samples }
    }

    #[must_use]
    pub fn with_leg(mut self, leg: impl Into<String>) -> Self {
        self.leg = Some(leg.into());
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total playback time after the initial transition
    pub fn duration_ms(&self) -> u64 {
        self.samples.iter().skip(1).map(|s| s.elapsed).sum()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("bad trajectory {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize trajectory: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
