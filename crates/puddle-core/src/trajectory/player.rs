//! Trajectory playback

use std::sync::Arc;

use tracing::info;

use super::{Sample, Trajectory};
use crate::clock::Clock;
use crate::leg::PoseTarget;
use crate::verbosity::{Trace, Verbosity};
use crate::{Error, Result};

/// Time allowed to reach the first sample from wherever the leg is
pub const TRANSITION_MS: u64 = 2_000;

/// Replays a trajectory onto a leg
///
/// The first sample is approached over [`TRANSITION_MS`]; every later sample
/// is applied immediately, spaced by its recorded elapsed time. Once the last
/// sample has had its time, playback ends and the leg is relaxed.
pub struct Player {
    clock: Arc<dyn Clock>,
    verbosity: Verbosity,
    samples: Vec<Sample>,
    index: usize,
    next_time: u64,
    playing: bool,
}

impl Player {
    pub fn new(clock: Arc<dyn Clock>, verbosity: Verbosity) -> Self {
        Self {
            clock,
            verbosity,
            samples: Vec::new(),
            index: 0,
            next_time: 0,
            playing: false,
        }
    }

    /// Replace the loaded samples; stops nothing, call before `start`
    pub fn load(&mut self, trajectory: &Trajectory) {
        self.samples = trajectory.samples.clone();
        self.index = 0;
        self.playing = false;
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Index of the next sample to be applied
    pub fn position(&self) -> usize {
        self.index
    }

    /// Begin moving towards the first sample
    pub fn start(&mut self, target: &mut impl PoseTarget) -> Result<()> {
        self.playing = false;
        self.index = 0;
        let Some(first) = self.samples.first() else {
            return Err(Error::InvalidState("no samples loaded".into()));
        };
        let now = self.clock.now_ms();
        target.set_pose(&first.pose, TRANSITION_MS)?;
        self.log(0, first);
        self.next_time = now + TRANSITION_MS;
        self.index = 1;
        self.playing = true;
        Ok(())
    }

    /// Stop and relax; returns whether playback was running
    pub fn stop(&mut self, target: &mut impl PoseTarget) -> bool {
        if !self.playing {
            return false;
        }
        self.playing = false;
        self.index = 0;
        self.next_time = 0;
        target.relax();
        true
    }

    /// Apply the next sample once it is due
    pub fn update(&mut self, target: &mut impl PoseTarget) -> Result<()> {
        if !self.playing {
            return Ok(());
        }
        let now = self.clock.now_ms();
        if now < self.next_time {
            return Ok(());
        }
        let Some(sample) = self.samples.get(self.index).copied() else {
            if self.verbosity.is_enabled(Trace::General) {
                info!("playback finished");
            }
            self.stop(target);
            return Ok(());
        };
        self.log(self.index, &sample);
        self.index += 1;
        self.next_time = now + self.samples.get(self.index).map_or(0, |s| s.elapsed);
        target.set_pose(&sample.pose, 0)
    }

    fn log(&self, index: usize, sample: &Sample) {
        if self.verbosity.is_enabled(Trace::General) {
            info!("play pose {}: {:?}", index, sample.pose.positions());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::leg::Pose;
    use crate::test_support::ScriptedLeg;

    fn trajectory(elapsed: &[u64]) -> Trajectory {
        Trajectory::new(
            elapsed
                .iter()
                .enumerate()
                .map(|(i, &elapsed)| Sample {
                    elapsed,
                    pose: Pose::uniform(i as f64 / 10.0),
                })
                .collect(),
        )
    }

    #[test]
    fn test_start_without_samples_fails() {
        let clock = ManualClock::new(0);
        let mut player = Player::new(Arc::new(clock), Verbosity::QUIET);
        let mut leg = ScriptedLeg::at(Pose::UNSET);
        assert!(player.start(&mut leg).is_err());
        assert!(!player.is_playing());
    }

    #[test]
    fn test_replays_every_sample_once_on_schedule() {
        let clock = ManualClock::new(10_000);
        let mut player = Player::new(Arc::new(clock.clone()), Verbosity::QUIET);
        let traj = trajectory(&[0, 100, 50, 250]);
        player.load(&traj);

        let mut leg = ScriptedLeg::at(Pose::UNSET);
        player.start(&mut leg).unwrap();
        assert_eq!(leg.set_calls, vec![(Pose::uniform(0.0), TRANSITION_MS)]);

        let mut call_times = vec![clock.now_ms()];
        while player.is_playing() {
            clock.advance(1);
            let before = leg.set_calls.len();
            player.update(&mut leg).unwrap();
            if leg.set_calls.len() > before {
                call_times.push(clock.now_ms());
            }
            assert!(clock.now_ms() < 20_000, "playback never ended");
        }

        assert_eq!(leg.set_calls.len(), traj.len());
        for (i, (pose, move_time)) in leg.set_calls.iter().enumerate() {
            assert_eq!(*pose, traj.samples[i].pose);
            if i > 0 {
                assert_eq!(*move_time, 0);
            }
        }
        // Sample 1 waits out the transition, later ones their recorded gaps
        assert_eq!(call_times, vec![10_000, 12_000, 12_050, 12_300]);
        assert_eq!(leg.relax_calls, 1);
    }

    #[test]
    fn test_single_sample_relaxes_after_transition() {
        let clock = ManualClock::new(0);
        let mut player = Player::new(Arc::new(clock.clone()), Verbosity::QUIET);
        player.load(&trajectory(&[0]));
        let mut leg = ScriptedLeg::at(Pose::UNSET);
        player.start(&mut leg).unwrap();

        clock.advance(TRANSITION_MS - 1);
        player.update(&mut leg).unwrap();
        assert!(player.is_playing());
        clock.advance(1);
        player.update(&mut leg).unwrap();
        assert!(!player.is_playing());
        assert_eq!(leg.set_calls.len(), 1);
        assert_eq!(leg.relax_calls, 1);
    }

    #[test]
    fn test_stop_relaxes_once() {
        let clock = ManualClock::new(0);
        let mut player = Player::new(Arc::new(clock), Verbosity::QUIET);
        player.load(&trajectory(&[0, 10]));
        let mut leg = ScriptedLeg::at(Pose::UNSET);
        player.start(&mut leg).unwrap();
        assert!(player.stop(&mut leg));
        assert!(!player.stop(&mut leg));
        assert_eq!(leg.relax_calls, 1);
        player.update(&mut leg).unwrap();
        assert_eq!(leg.set_calls.len(), 1);
    }
}
