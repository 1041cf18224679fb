//! Diagnostic verbosity flags
//!
//! Selects which high-volume per-cycle diagnostics are emitted. The set is
//! handed to the robot, legs and buses when they are built; the messages
//! themselves go through `tracing`.

use std::fmt;
use std::str::FromStr;

/// One class of per-cycle diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trace {
    /// Recorder and player sample events
    General,
    /// Interpolated target of every active actuator, each cycle
    Move,
    /// Hex dump of every frame written to or read from a bus
    Motor,
    /// Pose readout of every leg, each cycle
    Position,
}

impl Trace {
    const ALL: [Trace; 4] = [Trace::General, Trace::Move, Trace::Motor, Trace::Position];

    fn bit(self) -> u8 {
        match self {
            Trace::General => 1 << 0,
            Trace::Move => 1 << 1,
            Trace::Motor => 1 << 2,
            Trace::Position => 1 << 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Trace::General => "general",
            Trace::Move => "move",
            Trace::Motor => "motor",
            Trace::Position => "pos",
        }
    }
}

impl FromStr for Trace {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Trace::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| crate::Error::Config(format!("unknown trace flag: {}", s)))
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of enabled [`Trace`] classes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    bits: u8,
}

impl Verbosity {
    /// Nothing enabled
    pub const QUIET: Verbosity = Verbosity { bits: 0 };

    #[must_use]
    pub fn with(mut self, trace: Trace) -> Self {
        self.bits |= trace.bit();
        self
    }

    pub fn enable(&mut self, trace: Trace) {
        self.bits |= trace.bit();
    }

    #[inline]
    pub fn is_enabled(&self, trace: Trace) -> bool {
        self.bits & trace.bit() != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Trace> + '_ {
        Trace::ALL.into_iter().filter(|t| self.is_enabled(*t))
    }
}

impl FromIterator<Trace> for Verbosity {
    fn from_iter<I: IntoIterator<Item = Trace>>(iter: I) -> Self {
        iter.into_iter().fold(Verbosity::QUIET, Verbosity::with)
    }
}
