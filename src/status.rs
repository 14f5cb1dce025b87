use serde::{Deserialize, Serialize};

use crate::scheduler::{PulseEvent, RunMode};

/// Read-only projection of the scheduler for the control surface.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClockStatus {
    pub system_time: String,
    pub dial_time: String,
    pub dial_minutes: u16,
    pub offset_minutes: u16,
    pub has_offset: bool,
    pub mode: RunMode,
    /// Seconds until the next minute boundary.
    pub seconds_until_next_tick: u32,
    pub last_pulse: Option<PulseEvent>,
    pub fast_set: Option<FastSetProgress>,
    pub stall_remaining_minutes: Option<u16>,
    pub correction_pulses_remaining: Option<u32>,
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct FastSetProgress {
    pub pulses_sent: u32,
    pub remaining_minutes: u16,
}
