//! Shared fixtures for unit tests

use crate::leg::{Pose, PoseTarget};
use crate::Result;

/// A pose target that reports a scripted pose and records every call
#[derive(Debug, Default)]
pub struct ScriptedLeg {
    pub current: Pose,
    pub set_calls: Vec<(Pose, u64)>,
    pub relax_calls: usize,
}

impl ScriptedLeg {
    pub fn at(pose: Pose) -> Self {
        Self {
            current: pose,
            ..Self::default()
        }
    }
}

impl PoseTarget for ScriptedLeg {
    fn pose(&self) -> Pose {
        self.current
    }

    fn set_pose(&mut self, pose: &Pose, move_time: u64) -> Result<()> {
        self.set_calls.push((*pose, move_time));
        Ok(())
    }

    fn relax(&mut self) {
        self.relax_calls += 1;
    }
}
