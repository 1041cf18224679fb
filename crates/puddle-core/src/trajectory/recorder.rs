//! Pose recorder

use std::io::{self, Write};
use std::sync::Arc;

use tracing::info;

use super::{Sample, Trajectory};
use crate::clock::Clock;
use crate::leg::{Pose, PoseTarget};
use crate::verbosity::{Trace, Verbosity};

/// Samples a leg's pose whenever it changes
pub struct Recorder {
    clock: Arc<dyn Clock>,
    verbosity: Verbosity,
    recording: bool,
    last_pose: Pose,
    last_time: u64,
    samples: Vec<Sample>,
}

impl Recorder {
    pub fn new(clock: Arc<dyn Clock>, verbosity: Verbosity) -> Self {
        Self {
            clock,
            verbosity,
            recording: false,
            last_pose: Pose::UNSET,
            last_time: 0,
            samples: Vec::new(),
        }
    }

    /// Drop any previous samples and capture the current pose as sample zero
    pub fn start(&mut self, target: &impl PoseTarget) {
        self.clear();
        let pose = target.pose();
        self.last_pose = pose;
        self.last_time = self.clock.now_ms();
        self.samples.push(Sample { elapsed: 0, pose });
        self.recording = true;
        self.log("start", &pose);
    }

    /// Returns whether recording was in progress
    pub fn stop(&mut self) -> bool {
        std::mem::replace(&mut self.recording, false)
    }

    pub fn clear(&mut self) {
        self.stop();
        self.samples.clear();
        self.last_pose = Pose::UNSET;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Append a sample if the pose moved beyond tolerance
    ///
    /// Returns whether a sample was added.
    pub fn update(&mut self, target: &impl PoseTarget) -> bool {
        if !self.recording {
            return false;
        }
        let pose = target.pose();
        if pose == self.last_pose {
            return false;
        }
        let now = self.clock.now_ms();
        self.samples.push(Sample {
            elapsed: now.saturating_sub(self.last_time),
            pose,
        });
        self.last_pose = pose;
        self.last_time = now;
        self.log("add", &pose);
        true
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn trajectory(&self) -> Trajectory {
        Trajectory::new(self.samples.clone())
    }

    /// Write one `[elapsed]: p0, p1, ...` line per sample
    pub fn dump(&self, out: &mut impl Write) -> io::Result<()> {
        for sample in &self.samples {
            let p = sample.pose.positions();
            writeln!(
                out,
                "[{}]: {:.6}, {:.6}, {:.6}, {:.6}, {:.6}",
                sample.elapsed, p[0], p[1], p[2], p[3], p[4]
            )?;
        }
        Ok(())
    }

    fn log(&self, what: &str, pose: &Pose) {
        if self.verbosity.is_enabled(Trace::General) {
            info!("{} pose: {:?}", what, pose.positions());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::leg::Joint;
    use crate::test_support::ScriptedLeg;

    fn recorder() -> (ManualClock, Recorder) {
        let clock = ManualClock::new(500);
        let rec = Recorder::new(Arc::new(clock.clone()), Verbosity::QUIET);
        (clock, rec)
    }

    #[test]
    fn test_start_captures_sample_zero() {
        let (_clock, mut rec) = recorder();
        let leg = ScriptedLeg::at(Pose::uniform(0.3));
        rec.start(&leg);
        assert!(rec.is_recording());
        assert_eq!(rec.samples().len(), 1);
        assert_eq!(rec.samples()[0].elapsed, 0);
        assert_eq!(rec.samples()[0].pose, Pose::uniform(0.3));
    }

    #[test]
    fn test_still_pose_records_nothing() {
        let (clock, mut rec) = recorder();
        let leg = ScriptedLeg::at(Pose::uniform(0.3));
        rec.start(&leg);
        for _ in 0..1_000 {
            clock.advance(3);
            assert!(!rec.update(&leg));
        }
        assert_eq!(rec.samples().len(), 1);
    }

    #[test]
    fn test_jitter_within_tolerance_ignored() {
        let (clock, mut rec) = recorder();
        let mut leg = ScriptedLeg::at(Pose::uniform(0.3));
        rec.start(&leg);
        clock.advance(10);
        leg.current = Pose::uniform(0.3 + 5e-5);
        assert!(!rec.update(&leg));
    }

    #[test]
    fn test_changes_record_elapsed_time() {
        let (clock, mut rec) = recorder();
        let mut leg = ScriptedLeg::at(Pose::uniform(0.3));
        rec.start(&leg);

        clock.advance(40);
        leg.current = leg.current.with(Joint::KneePitch, 0.6);
        assert!(rec.update(&leg));

        clock.advance(25);
        assert!(!rec.update(&leg));
        clock.advance(15);
        leg.current = leg.current.with(Joint::HipYaw, 0.1);
        assert!(rec.update(&leg));

        let elapsed: Vec<u64> = rec.samples().iter().map(|s| s.elapsed).collect();
        assert_eq!(elapsed, vec![0, 40, 40]);
    }

    #[test]
    fn test_stop_and_clear() {
        let (_clock, mut rec) = recorder();
        let mut leg = ScriptedLeg::at(Pose::uniform(0.3));
        rec.start(&leg);
        assert!(rec.stop());
        assert!(!rec.stop());
        leg.current = Pose::uniform(0.9);
        assert!(!rec.update(&leg));
        assert_eq!(rec.samples().len(), 1);
        rec.clear();
        assert!(rec.samples().is_empty());
    }

    #[test]
    fn test_dump_format() {
        let (clock, mut rec) = recorder();
        let mut leg = ScriptedLeg::at(Pose::uniform(0.25));
        rec.start(&leg);
        clock.advance(100);
        leg.current = Pose::uniform(0.5);
        rec.update(&leg);

        let mut out = Vec::new();
        rec.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "[0]: 0.250000, 0.250000, 0.250000, 0.250000, 0.250000");
        assert!(lines[1].starts_with("[100]: 0.500000"));
    }
}
