//! 12-hour dial arithmetic.
//!
//! Impulse dials have a 12-hour face, so every position is a minute in
//! `0..720`. System time is folded onto the same face and the two are related
//! by a single persisted quantity:
//!
//! ```text
//! dial = (system + offset) mod 720
//! ```

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ClockError;

/// Minutes on a 12-hour face.
pub const DIAL_MINUTES: u16 = 720;

/// Forward gaps above this are cheaper to wait out than to advance through.
const HALF_DIAL: u16 = DIAL_MINUTES / 2;

/// Minute delta between the dial and system time, always in `0..720`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialOffset(u16);

impl DialOffset {
    pub const ZERO: DialOffset = DialOffset(0);

    /// Reduces any minute count onto the dial.
    pub fn new(minutes: i64) -> Self {
        DialOffset(minutes.rem_euclid(DIAL_MINUTES as i64) as u16)
    }

    /// The offset for which `dial` is the reading at `system`.
    pub fn between(dial: u16, system: u16) -> Self {
        Self::new(dial as i64 - system as i64)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    /// Dial position implied by this offset at the given system minute.
    pub fn apply(self, system: u16) -> u16 {
        (system % DIAL_MINUTES + self.0) % DIAL_MINUTES
    }
}

impl fmt::Display for DialOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// System time folded onto the 12-hour face.
pub fn dial_minute(now: &NaiveDateTime) -> u16 {
    ((now.hour() * 60 + now.minute()) % DIAL_MINUTES as u32) as u16
}

/// Renders a dial position the way the face shows it: `12:05`, `03:40`.
pub fn format_dial(minutes: u16) -> String {
    let minutes = minutes % DIAL_MINUTES;
    let hour = minutes / 60;
    let display_hour = if hour == 0 { 12 } else { hour };
    format!("{:02}:{:02}", display_hour, minutes % 60)
}

/// Minutes the dial must move forward to show `system`.
pub fn forward_gap(system: u16, dial: u16) -> u16 {
    (system % DIAL_MINUTES + DIAL_MINUTES - dial % DIAL_MINUTES) % DIAL_MINUTES
}

/// What it takes to bring the dial back in line with system time.
///
/// The movement only runs forward, so a dial that is ahead is left standing
/// until system time catches up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionPlan {
    Aligned,
    /// Dial is behind by this many minutes.
    Advance(u16),
    /// Dial is ahead by this many minutes.
    Stall(u16),
}

impl CorrectionPlan {
    pub fn from_gap(gap: u16) -> Self {
        match gap % DIAL_MINUTES {
            0 => CorrectionPlan::Aligned,
            g if g > HALF_DIAL => CorrectionPlan::Stall(DIAL_MINUTES - g),
            g => CorrectionPlan::Advance(g),
        }
    }

    pub fn between(system: u16, dial: u16) -> Self {
        Self::from_gap(forward_gap(system, dial))
    }
}

/// A dial position read off the face by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialReading(u16);

impl DialReading {
    /// Accepts 12- or 24-hour readings; both land on the same face position.
    pub fn from_hour_minute(hour: u32, minute: u32) -> Result<Self, ClockError> {
        if hour > 23 {
            return Err(ClockError::InvalidDialReading(format!(
                "hour must be 0..23, got {}",
                hour
            )));
        }
        if minute > 59 {
            return Err(ClockError::InvalidDialReading(format!(
                "minute must be 0..59, got {}",
                minute
            )));
        }
        Ok(DialReading(((hour * 60 + minute) % DIAL_MINUTES as u32) as u16))
    }

    /// Minutes since 12:00 on the face; any value is folded onto the dial.
    pub fn from_minutes(minutes: i64) -> Self {
        DialReading(minutes.rem_euclid(DIAL_MINUTES as i64) as u16)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl FromStr for DialReading {
    type Err = ClockError;

    /// Parses `HH:MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (hh, mm) = s
            .split_once(':')
            .ok_or_else(|| ClockError::InvalidDialReading(format!("expected HH:MM, got {:?}", s)))?;
        let hour = hh
            .trim()
            .parse::<u32>()
            .map_err(|_| ClockError::InvalidDialReading(format!("bad hour {:?}", hh)))?;
        let minute = mm
            .trim()
            .parse::<u32>()
            .map_err(|_| ClockError::InvalidDialReading(format!("bad minute {:?}", mm)))?;
        Self::from_hour_minute(hour, minute)
    }
}

impl fmt::Display for DialReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_dial(self.0))
    }
}
