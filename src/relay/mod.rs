use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ClockError;

mod dry_run;
mod sysfs;

pub use self::dry_run::DryRunRelays;
pub use self::sysfs::SysfsRelays;

/// One of the two switched drive lines. C is the common return and is never switched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relay {
    A,
    B,
}

impl Relay {
    pub const ALL: [Relay; 2] = [Relay::A, Relay::B];
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relay::A => f.write_str("A"),
            Relay::B => f.write_str("B"),
        }
    }
}

/// The relays closed together by a single pulse. Accepts the same spellings
/// from JSON as from [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum PulseTarget {
    A,
    B,
    AB,
}

impl PulseTarget {
    pub fn relays(self) -> &'static [Relay] {
        match self {
            PulseTarget::A => &[Relay::A],
            PulseTarget::B => &[Relay::B],
            PulseTarget::AB => &Relay::ALL,
        }
    }
}

impl fmt::Display for PulseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PulseTarget::A => f.write_str("A"),
            PulseTarget::B => f.write_str("B"),
            PulseTarget::AB => f.write_str("A+B"),
        }
    }
}

impl FromStr for PulseTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(PulseTarget::A),
            "B" => Ok(PulseTarget::B),
            "AB" | "A+B" => Ok(PulseTarget::AB),
            other => Err(format!("unknown relay {:?} (expected A, B or AB)", other)),
        }
    }
}

impl TryFrom<String> for PulseTarget {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Logical relay control. Polarity is the implementation's concern: callers
/// only ever say "energized" or "de-energized".
#[cfg_attr(test, mockall::automock)]
pub trait RelayDriver {
    /// Closes the relay. Energizing an energized relay has no further effect.
    fn energize(&mut self, relay: Relay) -> Result<(), ClockError>;

    /// Opens the relay. De-energizing an open relay has no further effect.
    fn deenergize(&mut self, relay: Relay) -> Result<(), ClockError>;
}

impl<T: RelayDriver + ?Sized> RelayDriver for Box<T> {
    fn energize(&mut self, relay: Relay) -> Result<(), ClockError> {
        (**self).energize(relay)
    }

    fn deenergize(&mut self, relay: Relay) -> Result<(), ClockError> {
        (**self).deenergize(relay)
    }
}
