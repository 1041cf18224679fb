//! Serial bus transport
//!
//! A [`Bus`] owns one RS-485 link and the checksum version its motors speak.
//! Every exchange is a blocking command write followed by a bounded read of
//! one feedback frame. A bus whose port could not be opened stays around in a
//! disabled state and fails every operation immediately.
//!
//! The robot keeps its buses in a [`BusSet`]; legs and actuators hold a
//! [`BusId`] into it rather than a reference.

pub mod link;

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use arrayvec::ArrayVec;
use tracing::{debug, info, warn};

use crate::protocol::provision::{self, ChangeIdRequest, CHANGE_ID_LEN};
use crate::protocol::{ChecksumVersion, CommandFrame, Feedback, FrameError, FEEDBACK_LEN};
use crate::verbosity::{Trace, Verbosity};
use crate::{Error, Result};

pub use link::SerialLink;

/// Most buses a robot can carry
pub const MAX_BUSES: usize = 4;

/// Most frames exchanged in one batch
pub const MAX_BATCH: usize = 16;

/// Default per-read wait, in centiseconds
pub const DEFAULT_READ_TIMEOUT_CS: u32 = 2;

/// Per-read wait while provisioning; the bootloader is slow to answer
const PROVISION_TIMEOUT_CS: u32 = 20;

/// Counters kept per bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub checksum_errors: u64,
    pub timeouts: u64,
}

/// One serial bus and the motors on it
pub struct Bus {
    name: String,
    adapter: String,
    version: ChecksumVersion,
    link: Option<Box<dyn SerialLink>>,
    read_timeout: Duration,
    min_bytes: usize,
    verbosity: Verbosity,
    stats: BusStats,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("adapter", &self.adapter)
            .field("version", &self.version)
            .field("enabled", &self.is_enabled())
            .field("read_timeout", &self.read_timeout)
            .field("stats", &self.stats)
            .finish()
    }
}

fn centiseconds(cs: u32) -> Duration {
    Duration::from_millis(cs as u64 * 10)
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Bus {
    /// Wrap an already opened link; `None` builds a disabled bus
    pub fn new(
        name: impl Into<String>,
        adapter: impl Into<String>,
        version: ChecksumVersion,
        link: Option<Box<dyn SerialLink>>,
        verbosity: Verbosity,
    ) -> Self {
        let mut bus = Self {
            name: name.into(),
            adapter: adapter.into(),
            version,
            link,
            read_timeout: centiseconds(DEFAULT_READ_TIMEOUT_CS),
            min_bytes: 0,
            verbosity,
            stats: BusStats::default(),
        };
        let timeout = bus.read_timeout;
        if let Some(link) = bus.link.as_mut() {
            if let Err(e) = link.set_timeout(timeout) {
                warn!(bus = %bus.name, "failed to set read timeout: {}", e);
            }
        }
        bus
    }

    /// Open the serial adapter at `adapter`
    ///
    /// A port that cannot be opened is logged and yields a disabled bus.
    #[cfg(feature = "serial")]
    pub fn open(
        name: impl Into<String>,
        adapter: impl Into<String>,
        version: ChecksumVersion,
        verbosity: Verbosity,
    ) -> Self {
        let name = name.into();
        let adapter = adapter.into();
        let link = match link::open(&adapter, centiseconds(DEFAULT_READ_TIMEOUT_CS)) {
            Ok(link) => {
                info!(bus = %name, adapter = %adapter, version = version.number(), "bus opened");
                Some(link)
            }
            Err(e) => {
                tracing::error!(bus = %name, "{}; bus disabled", e);
                None
            }
        };
        Self::new(name, adapter, version, link, verbosity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn version(&self) -> ChecksumVersion {
        self.version
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.link.is_some()
    }

    /// Drop the link; the bus is disabled from then on
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!(bus = %self.name, "bus closed");
        }
    }

    /// Bound each read to `cs` centiseconds and wait for at least `min_bytes`
    pub fn set_read_timeout(&mut self, cs: u32, min_bytes: usize) -> Result<()> {
        let timeout = centiseconds(cs);
        self.link_mut()?.set_timeout(timeout)?;
        self.read_timeout = timeout;
        self.min_bytes = min_bytes;
        Ok(())
    }

    /// Write a command without waiting for a reply
    pub fn send(&mut self, cmd: &CommandFrame) -> Result<()> {
        let bytes = cmd.encode(self.version);
        self.dump("W", &bytes);
        let name = &self.name;
        let link = match self.link.as_mut() {
            Some(link) => link,
            None => return Err(Error::Transport(format!("bus {} is disabled", name))),
        };
        // Leftovers from an earlier timed-out exchange would be read as our reply
        if let Err(e) = link.clear_input() {
            warn!(bus = %name, "failed to flush input: {}", e);
        }
        link.write_all(&bytes)
            .map_err(|e| Error::Transport(format!("failed to write motor command: {}", e)))?;
        link.flush()?;
        self.stats.frames_sent += 1;
        Ok(())
    }

    /// Write a command and read back one feedback frame
    pub fn transact(&mut self, cmd: &CommandFrame) -> Result<Feedback> {
        self.send(cmd)?;
        let mut buf = [0u8; FEEDBACK_LEN];
        if let Err(e) = self.read_exact(&mut buf) {
            if matches!(e, Error::Timeout(_)) {
                self.stats.timeouts += 1;
            }
            return Err(e);
        }
        self.dump("R", &buf);
        match Feedback::decode(&buf, self.version) {
            Ok(fb) if fb.motor_id != cmd.motor_id() => {
                warn!(
                    bus = %self.name,
                    "reply from motor {} to a command for motor {}; discarded",
                    fb.motor_id,
                    cmd.motor_id()
                );
                Err(FrameError::WrongMotor {
                    expected: cmd.motor_id(),
                    actual: fb.motor_id,
                }
                .into())
            }
            Ok(fb) => {
                self.stats.frames_received += 1;
                Ok(fb)
            }
            Err(e) => {
                if let FrameError::Checksum { expected, actual } = e {
                    self.stats.checksum_errors += 1;
                    warn!(
                        bus = %self.name,
                        motor = cmd.motor_id(),
                        "feedback checksum mismatch: expected {:04X}, got {:04X}",
                        expected,
                        actual
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Run a paired exchange for each command in order
    ///
    /// Slot `i` of the result answers `cmds[i]`: `Some` when that exchange
    /// completed a valid round trip with the addressed motor, `None`
    /// otherwise. Use [`success_count`] for the number of good slots.
    pub fn transact_batch(&mut self, cmds: &[CommandFrame]) -> ArrayVec<Option<Feedback>, MAX_BATCH> {
        let mut out = ArrayVec::new();
        if cmds.len() > MAX_BATCH {
            warn!(bus = %self.name, "batch of {} truncated to {}", cmds.len(), MAX_BATCH);
        }
        for cmd in cmds.iter().take(MAX_BATCH) {
            match self.transact(cmd) {
                Ok(fb) => out.push(Some(fb)),
                Err(e) => {
                    debug!(bus = %self.name, motor = cmd.motor_id(), "exchange failed: {}", e);
                    out.push(None);
                }
            }
        }
        out
    }

    /// Write raw bytes, bypassing framing
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<usize> {
        self.dump("W", bytes);
        let link = self.link_mut()?;
        link.write_all(bytes)?;
        link.flush()?;
        Ok(bytes.len())
    }

    /// Read raw bytes until `min_bytes` (at least one) arrive or the read
    /// timeout expires; returns how many were read
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        let want = self.min_bytes.max(1).min(buf.len());
        let n = self.read_until(buf, want)?;
        self.dump("R", &buf[..n]);
        Ok(n)
    }

    /// Give motor `old_id` the id `new_id`
    ///
    /// Drops every motor on the bus into its bootloader first. With `old_id`
    /// set to the broadcast id, every motor on the bus is renamed.
    pub fn change_motor_id(&mut self, old_id: u8, new_id: u8) -> Result<()> {
        let request = ChangeIdRequest::new(old_id, new_id)?;
        let (saved_timeout, saved_min) = (self.read_timeout, self.min_bytes);
        self.set_read_timeout(PROVISION_TIMEOUT_CS, CHANGE_ID_LEN)?;

        let mut result = self.provision(&request);

        self.read_timeout = saved_timeout;
        self.min_bytes = saved_min;
        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.set_timeout(saved_timeout) {
                warn!(bus = %self.name, "failed to restore read timeout: {}", e);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }

        match &result {
            Ok(()) => info!(bus = %self.name, "motor {} is now motor {}", old_id, new_id),
            Err(e) => warn!(bus = %self.name, "changing motor {} to {} failed: {}", old_id, new_id, e),
        }
        result
    }

    fn provision(&mut self, request: &ChangeIdRequest) -> Result<()> {
        self.send(&CommandFrame::boot())?;
        self.write_raw(&request.encode())?;
        let mut reply = [0u8; CHANGE_ID_LEN];
        let n = self.read_raw(&mut reply)?;
        if n != CHANGE_ID_LEN {
            return Err(Error::Timeout(format!(
                "no motor answered the id change ({} of {} bytes)",
                n, CHANGE_ID_LEN
            )));
        }
        provision::check_reply(&reply)?;
        Ok(())
    }

    fn link_mut(&mut self) -> Result<&mut Box<dyn SerialLink>> {
        match self.link.as_mut() {
            Some(link) => Ok(link),
            None => Err(Error::Transport(format!("bus {} is disabled", self.name))),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.read_until(buf, buf.len())?;
        if n < buf.len() {
            return Err(Error::Timeout(format!(
                "read timeout on {}: got {} of {} bytes",
                self.name,
                n,
                buf.len()
            )));
        }
        Ok(())
    }

    /// Read into `buf` until `want` bytes arrive or the deadline passes
    fn read_until(&mut self, buf: &mut [u8], want: usize) -> Result<usize> {
        let timeout = self.read_timeout;
        let link = self.link_mut()?;
        let start = Instant::now();
        let mut total = 0;

        while total < want {
            if start.elapsed() > timeout {
                break;
            }
            match link.read(&mut buf[total..]) {
                Ok(0) => std::thread::sleep(Duration::from_micros(100)),
                Ok(n) => total += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_micros(100));
                }
                Err(e) => return Err(Error::Transport(format!("read error: {}", e))),
            }
        }
        Ok(total)
    }

    fn dump(&self, dir: &str, bytes: &[u8]) {
        if self.verbosity.is_enabled(Trace::Motor) {
            info!(bus = %self.name, "[{}] {}", dir, hex(bytes));
        }
    }
}

/// Number of exchanges in a batch result that completed
pub fn success_count(replies: &[Option<Feedback>]) -> usize {
    replies.iter().filter(|r| r.is_some()).count()
}

/// Index of a bus inside a [`BusSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusId(usize);

impl BusId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Arena of the robot's buses
#[derive(Debug, Default)]
pub struct BusSet {
    buses: ArrayVec<Bus, MAX_BUSES>,
}

impl BusSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bus; names must be unique
    pub fn push(&mut self, bus: Bus) -> Result<BusId> {
        if self.resolve(bus.name()).is_some() {
            return Err(Error::Config(format!("duplicate bus name {}", bus.name())));
        }
        let id = BusId(self.buses.len());
        self.buses
            .try_push(bus)
            .map_err(|e| Error::Config(format!("too many buses (max {}): {}", MAX_BUSES, e.element().name())))?;
        Ok(id)
    }

    /// Look a bus up by its configured name
    pub fn resolve(&self, name: &str) -> Option<BusId> {
        self.buses.iter().position(|b| b.name() == name).map(BusId)
    }

    pub fn get(&self, id: BusId) -> Option<&Bus> {
        self.buses.get(id.0)
    }

    pub fn get_mut(&mut self, id: BusId) -> Option<&mut Bus> {
        self.buses.get_mut(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bus> {
        self.buses.iter()
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    /// Release every transport; ids stay valid but point at disabled buses
    pub fn close_all(&mut self) {
        for bus in self.buses.iter_mut() {
            bus.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MotorError, MotorMode};
    use crate::sim::SimulatedMotors;

    fn sim_bus(motors: &SimulatedMotors, version: ChecksumVersion) -> Bus {
        Bus::new("test", "sim", version, Some(motors.link()), Verbosity::QUIET)
    }

    #[test]
    fn test_transact_returns_feedback() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[1, 2]);
        let mut bus = sim_bus(&motors, ChecksumVersion::V1);

        let fb = bus.transact(&CommandFrame::brake(2)).unwrap();
        assert_eq!(fb.motor_id, 2);
        assert_eq!(fb.error, MotorError::None);
        assert_eq!(bus.stats().frames_sent, 1);
        assert_eq!(bus.stats().frames_received, 1);
    }

    #[test]
    fn test_disabled_bus_fails_fast() {
        let mut bus = Bus::new("dead", "/dev/null", ChecksumVersion::V1, None, Verbosity::QUIET);
        assert!(!bus.is_enabled());
        assert!(matches!(bus.send(&CommandFrame::brake(1)), Err(Error::Transport(_))));
        assert!(matches!(bus.transact(&CommandFrame::brake(1)), Err(Error::Transport(_))));
        assert_eq!(success_count(&bus.transact_batch(&[CommandFrame::brake(1)])), 0);
        assert!(bus.set_read_timeout(50, 4).is_err());
        assert_eq!(bus.read_timeout, centiseconds(DEFAULT_READ_TIMEOUT_CS));
        assert_eq!(bus.min_bytes, 0);
        assert!(bus.change_motor_id(0, 1).is_err());
    }

    #[test]
    fn test_silent_motor_times_out() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[1]);
        motors.set_silent(1, true);
        let mut bus = sim_bus(&motors, ChecksumVersion::V1);

        assert!(matches!(bus.transact(&CommandFrame::brake(1)), Err(Error::Timeout(_))));
        assert_eq!(bus.stats().timeouts, 1);
    }

    #[test]
    fn test_version_mismatch_gets_no_reply() {
        // Motors drop commands whose checksum they cannot verify
        let motors = SimulatedMotors::new(ChecksumVersion::V2, &[1]);
        let mut bus = sim_bus(&motors, ChecksumVersion::V1);
        assert!(bus.transact(&CommandFrame::brake(1)).is_err());
    }

    #[test]
    fn test_corrupt_feedback_counted() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[1]);
        motors.set_corrupt_checksum(1, true);
        let mut bus = sim_bus(&motors, ChecksumVersion::V1);

        let err = bus.transact(&CommandFrame::brake(1)).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::Checksum { .. })));
        assert_eq!(bus.stats().checksum_errors, 1);
    }

    #[test]
    fn test_batch_counts_partial_success() {
        let motors = SimulatedMotors::new(ChecksumVersion::V2, &[1, 2, 3]);
        motors.set_silent(2, true);
        let mut bus = sim_bus(&motors, ChecksumVersion::V2);

        let cmds: Vec<_> = [1, 2, 3]
            .iter()
            .map(|&id| CommandFrame::new(id, MotorMode::Drive))
            .collect();
        let replies = bus.transact_batch(&cmds);
        assert_eq!(replies.len(), 3);
        assert_eq!(success_count(&replies), 2);
        assert_eq!(replies[0].map(|fb| fb.motor_id), Some(1));
        assert!(replies[1].is_none());
        assert_eq!(replies[2].map(|fb| fb.motor_id), Some(3));
    }

    #[test]
    fn test_wrong_motor_reply_rejected() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[1, 2]);
        motors.set_reply_id(1, Some(2));
        let mut bus = sim_bus(&motors, ChecksumVersion::V1);

        let err = bus.transact(&CommandFrame::brake(1)).unwrap_err();
        assert!(matches!(
            err,
            Error::Frame(FrameError::WrongMotor {
                expected: 1,
                actual: 2
            })
        ));
        assert_eq!(bus.stats().frames_received, 0);

        let replies = bus.transact_batch(&[CommandFrame::brake(1), CommandFrame::brake(2)]);
        assert!(replies[0].is_none());
        assert_eq!(replies[1].map(|fb| fb.motor_id), Some(2));
    }

    /// Wraps a link, injecting `Interrupted` reads and failing timeout changes
    struct FlakyLink {
        inner: Box<dyn SerialLink>,
        interrupts: usize,
        timeouts_allowed: usize,
    }

    impl Read for FlakyLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.interrupts > 0 {
                self.interrupts -= 1;
                return Err(ErrorKind::Interrupted.into());
            }
            self.inner.read(buf)
        }
    }

    impl Write for FlakyLink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.inner.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl SerialLink for FlakyLink {
        fn clear_input(&mut self) -> std::io::Result<()> {
            self.inner.clear_input()
        }

        fn set_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
            if self.timeouts_allowed == 0 {
                return Err(std::io::Error::new(ErrorKind::Other, "port gone"));
            }
            self.timeouts_allowed -= 1;
            self.inner.set_timeout(timeout)
        }
    }

    fn flaky_bus(motors: &SimulatedMotors, interrupts: usize, timeouts_allowed: usize) -> Bus {
        let link = FlakyLink {
            inner: motors.link(),
            interrupts,
            timeouts_allowed,
        };
        Bus::new("flaky", "sim", ChecksumVersion::V1, Some(Box::new(link)), Verbosity::QUIET)
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[1]);
        let mut bus = flaky_bus(&motors, 3, usize::MAX);
        assert_eq!(bus.transact(&CommandFrame::brake(1)).unwrap().motor_id, 1);
    }

    #[test]
    fn test_change_motor_id_reports_failed_restore() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[0]);
        // One for construction, one to enter provisioning, none to restore
        let mut bus = flaky_bus(&motors, 0, 2);
        assert!(matches!(bus.change_motor_id(0, 4), Err(Error::Transport(_))));
        assert_eq!(motors.ids(), vec![4]);
        assert_eq!(bus.read_timeout, centiseconds(DEFAULT_READ_TIMEOUT_CS));
    }

    #[test]
    fn test_change_motor_id() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[0]);
        let mut bus = sim_bus(&motors, ChecksumVersion::V1);

        bus.change_motor_id(0, 4).unwrap();
        assert_eq!(motors.ids(), vec![4]);
        assert_eq!(bus.transact(&CommandFrame::brake(4)).unwrap().motor_id, 4);
        assert_eq!(bus.read_timeout, centiseconds(DEFAULT_READ_TIMEOUT_CS));
    }

    #[test]
    fn test_change_motor_id_without_motor() {
        let motors = SimulatedMotors::new(ChecksumVersion::V1, &[2]);
        let mut bus = sim_bus(&motors, ChecksumVersion::V1);
        assert!(matches!(bus.change_motor_id(5, 6), Err(Error::Timeout(_))));
        assert_eq!(motors.ids(), vec![2]);
    }

    #[test]
    fn test_bus_set_resolves_names() {
        let mut set = BusSet::new();
        let left = set
            .push(Bus::new("left_bus", "a", ChecksumVersion::V1, None, Verbosity::QUIET))
            .unwrap();
        let right = set
            .push(Bus::new("right_bus", "b", ChecksumVersion::V2, None, Verbosity::QUIET))
            .unwrap();
        assert_eq!(set.resolve("left_bus"), Some(left));
        assert_eq!(set.resolve("right_bus"), Some(right));
        assert_eq!(set.resolve("nope"), None);
        assert_eq!(set.get(right).unwrap().version(), ChecksumVersion::V2);

        assert!(set
            .push(Bus::new("left_bus", "c", ChecksumVersion::V1, None, Verbosity::QUIET))
            .is_err());
    }

    #[test]
    fn test_bus_set_capacity() {
        let mut set = BusSet::new();
        for i in 0..MAX_BUSES {
            set.push(Bus::new(format!("bus{}", i), "x", ChecksumVersion::V1, None, Verbosity::QUIET))
                .unwrap();
        }
        assert!(matches!(
            set.push(Bus::new("extra", "x", ChecksumVersion::V1, None, Verbosity::QUIET)),
            Err(Error::Config(_))
        ));
    }
}
