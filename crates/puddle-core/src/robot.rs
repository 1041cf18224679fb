//! Whole-robot assembly
//!
//! The [`Robot`] owns every bus, the neck actuator and both legs. It is built
//! from a [`RobotConfig`]: each bus entry becomes a [`Bus`] in the robot's
//! [`BusSet`], and the neck and legs are pointed at their bus by name. A name
//! that matches no bus is fatal.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::actuator::Actuator;
use crate::bus::{Bus, BusId, BusSet, SerialLink};
use crate::clock::Clock;
use crate::config::{BusConfig, RobotConfig};
use crate::leg::Leg;
use crate::protocol::ChecksumVersion;
use crate::verbosity::Verbosity;
use crate::{Error, Result};

/// Which leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    pub fn name(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Side {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            other => Err(Error::Config(format!("unknown leg {}", other))),
        }
    }
}

/// Neck plus two legs on up to four buses
pub struct Robot {
    buses: BusSet,
    neck: Actuator,
    neck_bus: BusId,
    left: Leg,
    right: Leg,
    clock: Arc<dyn Clock>,
    shut_down: bool,
}

impl fmt::Debug for Robot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Robot")
            .field("buses", &self.buses)
            .field("neck", &self.neck)
            .field("left", &self.left)
            .field("right", &self.right)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

fn resolve(buses: &BusSet, group: &str, name: &str) -> Result<BusId> {
    buses.resolve(name).ok_or_else(|| {
        error!(group, bus = name, "unknown bus");
        Error::Config(format!("unknown bus {} for {}", name, group))
    })
}

impl Robot {
    /// Open every configured serial adapter
    ///
    /// Adapters that fail to open leave their bus disabled; the robot is
    /// still built so the caller can decide what to do at [`init`](Self::init).
    #[cfg(feature = "serial")]
    pub fn open(config: &RobotConfig, clock: Arc<dyn Clock>, verbosity: Verbosity) -> Result<Self> {
        Self::assemble(config, clock, verbosity, |cfg, version| {
            Bus::open(cfg.name.clone(), cfg.adapter.clone(), version, verbosity)
        })
    }

    /// Build on links supplied by `connect`; `None` yields a disabled bus
    pub fn with_links<F>(
        config: &RobotConfig,
        clock: Arc<dyn Clock>,
        verbosity: Verbosity,
        mut connect: F,
    ) -> Result<Self>
    where
        F: FnMut(&BusConfig) -> Option<Box<dyn SerialLink>>,
    {
        Self::assemble(config, clock, verbosity, |cfg, version| {
            Bus::new(cfg.name.clone(), cfg.adapter.clone(), version, connect(cfg), verbosity)
        })
    }

    fn assemble<F>(
        config: &RobotConfig,
        clock: Arc<dyn Clock>,
        verbosity: Verbosity,
        mut make_bus: F,
    ) -> Result<Self>
    where
        F: FnMut(&BusConfig, ChecksumVersion) -> Bus,
    {
        config.validate()?;

        let mut buses = BusSet::new();
        for cfg in &config.bus {
            let version = cfg.checksum_version()?;
            let mut bus = make_bus(cfg, version);
            if bus.is_enabled() {
                if let Err(e) = bus.set_read_timeout(cfg.read_timeout_cs, cfg.min_bytes) {
                    warn!(bus = %cfg.name, "failed to set read timeout: {}", e);
                }
            }
            buses.push(bus)?;
        }

        let neck_bus = resolve(&buses, "neck", &config.neck.bus)?;
        let left_bus = resolve(&buses, "left", &config.leg.left.bus)?;
        let right_bus = resolve(&buses, "right", &config.leg.right.bus)?;

        Ok(Self {
            neck: Actuator::from_config("neck", &config.neck.joint),
            neck_bus,
            left: Leg::new("left", left_bus, &config.leg.left, clock.clone(), verbosity),
            right: Leg::new("right", right_bus, &config.leg.right, clock.clone(), verbosity),
            buses,
            clock,
            shut_down: false,
        })
    }

    pub fn buses(&self) -> &BusSet {
        &self.buses
    }

    pub fn neck(&self) -> &Actuator {
        &self.neck
    }

    pub fn neck_mut(&mut self) -> &mut Actuator {
        &mut self.neck
    }

    pub fn leg(&self, side: Side) -> &Leg {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn leg_mut(&mut self, side: Side) -> &mut Leg {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }

    /// Every actuator with the group it belongs to
    pub fn actuators(&self) -> impl Iterator<Item = (&str, &Actuator)> {
        std::iter::once(("", &self.neck))
            .chain(self.left.actuators().iter().map(|a| ("left", a)))
            .chain(self.right.actuators().iter().map(|a| ("right", a)))
    }

    /// Run one control cycle on the neck and both legs
    ///
    /// Returns false if any actuator failed its exchange this cycle.
    pub fn update(&mut self) -> bool {
        let neck = self.update_neck();
        let left = self.left.update(&mut self.buses);
        let right = self.right.update(&mut self.buses);
        neck && left && right
    }

    fn update_neck(&mut self) -> bool {
        let now = self.clock.now_ms();
        let Some(cmd) = self.neck.command(now) else {
            return true;
        };
        let reply = match self.buses.get_mut(self.neck_bus) {
            Some(bus) => bus.transact(&cmd),
            None => Err(Error::Config("unresolved neck bus".into())),
        };
        match reply {
            Ok(fb) => self.neck.ingest(now, &fb),
            Err(e) => {
                tracing::debug!("neck exchange failed: {}", e);
                self.neck.record_miss();
                false
            }
        }
    }

    /// Warm-up exchange
    ///
    /// Runs one cycle and names every actuator that did not answer. With
    /// `force_continue` those actuators are marked ignored and start-up
    /// proceeds; otherwise a [`Error::Fault`] lists them.
    pub fn init(&mut self, force_continue: bool) -> Result<()> {
        let neck_ok = self.update_neck();
        let left_ok = self.left.update(&mut self.buses);
        let right_ok = self.right.update(&mut self.buses);
        let now = self.clock.now_ms();

        let mut missing = Vec::new();
        if !neck_ok && !self.neck.is_responding(now) {
            error!("missing neck motor");
            error!("  [{}] {}", self.neck.id(), self.neck.name());
            missing.push(self.neck.name().to_string());
            if force_continue {
                self.neck.set_ignored(true);
            }
        }
        for (ok, leg) in [(left_ok, &mut self.left), (right_ok, &mut self.right)] {
            if ok {
                continue;
            }
            error!("missing {} motors", leg.name());
            let leg_name = leg.name().to_string();
            for actuator in leg.actuators_mut().iter_mut() {
                if actuator.is_ignored() || actuator.is_responding(now) {
                    continue;
                }
                error!("  [{}] {}", actuator.id(), actuator.name());
                missing.push(format!("{}.{}", leg_name, actuator.name()));
                if force_continue {
                    actuator.set_ignored(true);
                }
            }
        }

        if missing.is_empty() {
            return Ok(());
        }
        if force_continue {
            warn!("continuing without {} motor(s)", missing.len());
            Ok(())
        } else {
            Err(Error::Fault(format!("not responding: {}", missing.join(", "))))
        }
    }

    /// True if every actuator has a calibrated range and every one still in
    /// use has reported an angle
    pub fn check_ranges(&self) -> bool {
        let mut ok = true;
        for (group, actuator) in self.actuators() {
            let sep = if group.is_empty() { "" } else { "." };
            if !actuator.range().is_valid() {
                warn!("[{}] {}{}{}: range uninitialized", actuator.id(), group, sep, actuator.name());
                ok = false;
            }
            if !actuator.is_ignored() && actuator.envelope().is_none() {
                warn!("[{}] {}{}{}: no readings", actuator.id(), group, sep, actuator.name());
                ok = false;
            }
        }
        ok
    }

    /// Adopt each actuator's observed envelope as its range
    ///
    /// Writes the new ranges into the actuators and into `config`. Actuators
    /// with faults, or that never reported an angle, are left alone.
    pub fn update_joint_ranges(&mut self, config: &mut RobotConfig) {
        if let Some((min, max)) = Self::calibrated_envelope("", &self.neck) {
            self.neck.set_range(min, max);
            config.neck.joint.range = self.neck.range();
        }
        for (leg, leg_config) in [
            (&mut self.left, &mut config.leg.left),
            (&mut self.right, &mut config.leg.right),
        ] {
            let group = leg.name().to_string();
            for (actuator, joint) in leg.actuators_mut().iter_mut().zip(leg_config.joints_mut()) {
                if let Some((min, max)) = Self::calibrated_envelope(&group, actuator) {
                    actuator.set_range(min, max);
                    joint.range = actuator.range();
                }
            }
        }
    }

    fn calibrated_envelope(group: &str, actuator: &Actuator) -> Option<(f64, f64)> {
        if actuator.has_error() {
            warn!(
                "[{}] {} {}: skipped, {} misses / {} errors",
                actuator.id(),
                group,
                actuator.name(),
                actuator.miss_count(),
                actuator.error_count()
            );
            return None;
        }
        let envelope = actuator.envelope();
        match envelope {
            Some((min, max)) => info!("[{}] {} {}: [{:.3}, {:.3}]", actuator.id(), group, actuator.name(), min, max),
            None => warn!("[{}] {} {}: no readings", actuator.id(), group, actuator.name()),
        }
        envelope
    }

    /// Relax every actuator
    pub fn relax(&mut self) {
        let now = self.clock.now_ms();
        self.neck.relax(now);
        self.left.relax();
        self.right.relax();
    }

    /// Stiffen both legs at their current angles
    pub fn stand(&mut self) {
        self.left.stand();
        self.right.stand();
    }

    /// Brake everything, push the brake frames out, then release the buses
    ///
    /// Safe to call more than once; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.neck.force_relax();
        self.left.force_relax();
        self.right.force_relax();
        if !self.update() {
            warn!("not every motor acknowledged the final brake command");
        }
        self.buses.close_all();
        info!("robot shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for Robot {
    fn drop(&mut self) {
        self.shutdown();
    }
}
