//! Fixed-rate control loop
//!
//! Runs a callback at a fixed frequency on the calling thread, keeping timing
//! statistics. The loop can be cut short through a stop channel, which is
//! also what it sleeps on between iterations, so a stop request is seen
//! without waiting out the rest of the period.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use tracing::warn;

use crate::{Error, Result};

/// Configuration for a control loop
#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    /// Target loop rate in Hz
    pub rate_hz: f64,
    /// Name used in log lines
    pub name: std::sync::Arc<str>,
    /// Whether to warn when an iteration overruns its period
    pub warn_on_overrun: bool,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            rate_hz: 100.0,
            name: "control".into(),
            warn_on_overrun: true,
        }
    }
}

impl ControlLoopConfig {
    pub fn new(rate_hz: f64) -> Self {
        Self {
            rate_hz,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<std::sync::Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_overrun_warnings(mut self, warn: bool) -> Self {
        self.warn_on_overrun = warn;
        self
    }

    /// Target period
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    fn validate(&self) -> Result<()> {
        if self.rate_hz.is_finite() && self.rate_hz > 0.0 {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "{}: loop rate must be positive, got {}",
                self.name, self.rate_hz
            )))
        }
    }
}

/// Timing statistics for a control loop
///
/// Variance of the iteration time is tracked with Welford's online
/// algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlLoopStats {
    pub iterations: u64,
    /// Iterations whose callback took longer than the period
    pub overruns: u64,
    pub total_execution_time: Duration,
    pub max_iteration_time: Duration,
    pub min_iteration_time: Duration,
    pub last_iteration_time: Duration,
    welford_mean: f64,
    welford_m2: f64,
}

impl ControlLoopStats {
    pub fn update(&mut self, execution_time: Duration, target_period: Duration) {
        self.iterations += 1;
        self.total_execution_time += execution_time;
        self.last_iteration_time = execution_time;

        let secs = execution_time.as_secs_f64();
        if self.iterations == 1 {
            self.min_iteration_time = execution_time;
            self.max_iteration_time = execution_time;
            self.welford_mean = secs;
            self.welford_m2 = 0.0;
        } else {
            self.min_iteration_time = self.min_iteration_time.min(execution_time);
            self.max_iteration_time = self.max_iteration_time.max(execution_time);
            let delta = secs - self.welford_mean;
            self.welford_mean += delta / self.iterations as f64;
            self.welford_m2 += delta * (secs - self.welford_mean);
        }

        if execution_time > target_period {
            self.overruns += 1;
        }
    }

    pub fn avg_iteration_time(&self) -> Duration {
        if self.iterations == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.total_execution_time.as_nanos() / u128::from(self.iterations)) as u64)
        }
    }

    /// Fraction of iterations that overran (0.0 to 1.0)
    pub fn overrun_ratio(&self) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            self.overruns as f64 / self.iterations as f64
        }
    }

    /// Standard deviation of the iteration time in seconds
    ///
    /// Zero until two iterations have completed.
    pub fn jitter_std_dev(&self) -> f64 {
        if self.iterations < 2 {
            0.0
        } else {
            (self.welford_m2 / (self.iterations - 1) as f64).sqrt()
        }
    }
}

/// A fixed-rate loop on the current thread
///
/// # Example
/// ```ignore
/// use puddle_core::control::{ControlLoop, ControlLoopConfig};
///
/// let (tx, rx) = crossbeam_channel::bounded(1);
/// ctrlc::set_handler(move || { let _ = tx.try_send(()); })?;
///
/// let stats = ControlLoop::run_until(ControlLoopConfig::new(100.0), &rx, |_, _| {
///     robot.update();
///     true
/// })?;
/// ```
pub struct ControlLoop;

impl ControlLoop {
    /// Run until the callback returns false
    ///
    /// The callback receives the iteration count and the time since the
    /// previous iteration in seconds.
    pub fn run<F>(config: ControlLoopConfig, callback: F) -> Result<ControlLoopStats>
    where
        F: FnMut(u64, f64) -> bool,
    {
        Self::drive(config, None, callback)
    }

    /// Run until the callback returns false or `stop` fires
    ///
    /// A disconnected stop channel also ends the loop.
    pub fn run_until<F>(
        config: ControlLoopConfig,
        stop: &Receiver<()>,
        callback: F,
    ) -> Result<ControlLoopStats>
    where
        F: FnMut(u64, f64) -> bool,
    {
        Self::drive(config, Some(stop), callback)
    }

    /// Run for at most `duration`
    pub fn run_for<F>(
        config: ControlLoopConfig,
        duration: Duration,
        mut callback: F,
    ) -> Result<ControlLoopStats>
    where
        F: FnMut(u64, f64) -> bool,
    {
        let start = Instant::now();
        Self::run(config, |iter, dt| {
            if start.elapsed() >= duration {
                return false;
            }
            callback(iter, dt)
        })
    }

    fn drive<F>(
        config: ControlLoopConfig,
        stop: Option<&Receiver<()>>,
        mut callback: F,
    ) -> Result<ControlLoopStats>
    where
        F: FnMut(u64, f64) -> bool,
    {
        config.validate()?;
        let period = config.period();
        let mut stats = ControlLoopStats::default();
        let mut iteration = 0u64;
        let mut last_time = Instant::now();

        loop {
            if let Some(stop) = stop {
                match stop.try_recv() {
                    Err(TryRecvError::Empty) => {}
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                }
            }

            let loop_start = Instant::now();
            let dt = loop_start.duration_since(last_time).as_secs_f64();
            last_time = loop_start;

            let should_continue = callback(iteration, dt);
            let execution_time = loop_start.elapsed();
            if !should_continue {
                break;
            }
            stats.update(execution_time, period);
            iteration += 1;

            match period.checked_sub(execution_time) {
                Some(remaining) => match stop {
                    Some(stop) => match stop.recv_timeout(remaining) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    },
                    None => thread::sleep(remaining),
                },
                None if config.warn_on_overrun => {
                    warn!("{}: loop overrun by {:?}", config.name, execution_time - period);
                }
                None => {}
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_loop_iterations() {
        let config = ControlLoopConfig::new(1000.0).with_name("test");
        let stats = ControlLoop::run(config, |iter, _dt| iter < 10).unwrap();
        assert_eq!(stats.iterations, 10);
    }

    #[test]
    fn test_control_loop_timing() {
        let config = ControlLoopConfig::new(100.0);
        let start = Instant::now();
        let stats = ControlLoop::run(config, |iter, _dt| iter < 5).unwrap();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed <= Duration::from_millis(150));
        assert_eq!(stats.iterations, 5);
    }

    #[test]
    fn test_control_loop_stop_channel() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let config = ControlLoopConfig::new(100.0);
        let stats = ControlLoop::run_until(config, &rx, |iter, _dt| {
            if iter == 3 {
                tx.try_send(()).unwrap();
            }
            true
        })
        .unwrap();
        assert_eq!(stats.iterations, 4);
    }

    #[test]
    fn test_control_loop_stop_wakes_sleep() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let config = ControlLoopConfig::new(0.5);
        let start = Instant::now();
        let stats = ControlLoop::run_until(config, &rx, |_, _| {
            tx.try_send(()).unwrap();
            true
        })
        .unwrap();
        assert_eq!(stats.iterations, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_control_loop_disconnected_stop() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        drop(tx);
        let stats = ControlLoop::run_until(ControlLoopConfig::new(100.0), &rx, |_, _| true).unwrap();
        assert_eq!(stats.iterations, 0);
    }

    #[test]
    fn test_control_loop_run_for() {
        let config = ControlLoopConfig::new(100.0);
        let stats =
            ControlLoop::run_for(config, Duration::from_millis(100), |_iter, _dt| true).unwrap();
        assert!(
            stats.iterations >= 5 && stats.iterations <= 20,
            "Expected ~10 iterations, got {}",
            stats.iterations
        );
    }

    #[test]
    fn test_control_loop_rejects_bad_rate() {
        for rate in [0.0, -5.0, f64::NAN] {
            let result = ControlLoop::run(ControlLoopConfig::new(rate), |_, _| true);
            assert!(matches!(result, Err(Error::Config(_))));
        }
    }

    #[test]
    fn test_stats() {
        let mut stats = ControlLoopStats::default();
        let period = Duration::from_millis(10);
        for ms in [2, 4, 12, 6] {
            stats.update(Duration::from_millis(ms), period);
        }
        assert_eq!(stats.iterations, 4);
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.min_iteration_time, Duration::from_millis(2));
        assert_eq!(stats.max_iteration_time, Duration::from_millis(12));
        assert_eq!(stats.avg_iteration_time(), Duration::from_millis(6));
        assert!((stats.overrun_ratio() - 0.25).abs() < 1e-12);
        // sample std dev of [2, 4, 12, 6] ms
        assert!((stats.jitter_std_dev() - 0.004320).abs() < 1e-5);
    }
}
