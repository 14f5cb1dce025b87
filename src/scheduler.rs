//! Pulse scheduling and dial correction.
//!
//! [`Scheduler`] is ticked once per second with the current wall-clock time and
//! decides which relays to close:
//!
//! ```text
//!  minute 0-49, :00   A+B
//!  minute 50-58, :00  A
//!  minute 59, :00     A, then a burst of A pulses at :02, :04, ... :34
//!  fast set           A+B every interval until the dial reaches system time
//!  stalled            nothing until system time reaches the dial
//! ```
//!
//! A tick never sleeps. It energizes the chosen relays and holds the pulse; the
//! caller releases it with [`Scheduler::release_pulse`] once the width has elapsed.

use chrono::{NaiveDateTime, Timelike};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::TimingConfig;
use crate::dial::{self, CorrectionPlan, DialOffset, DialReading, DIAL_MINUTES};
use crate::error::ClockError;
use crate::relay::{PulseTarget, Relay, RelayDriver};
use crate::status::{ClockStatus, FastSetProgress};
use crate::store::{OffsetStore, PersistedOffset};

const LAST_B_MINUTE: u32 = 49;
const BURST_MINUTE: u32 = 59;
const FAST_SET_LOG_EVERY: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Idle,
    FastSetAdvancing,
    Stalled,
    ManualPulse,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunMode::Idle => "idle",
            RunMode::FastSetAdvancing => "fast set advancing",
            RunMode::Stalled => "stalled",
            RunMode::ManualPulse => "manual pulse",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PulseKind {
    Minute,
    Correction,
    FastSet,
    Manual,
}

/// One energize/de-energize cycle issued to the relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseEvent {
    pub target: PulseTarget,
    pub kind: PulseKind,
    pub timestamp: NaiveDateTime,
    pub width_ms: u64,
}

impl PulseEvent {
    pub fn width(&self) -> Duration {
        Duration::from_millis(self.width_ms)
    }
}

/// Outcome of the first look at a minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MinuteClaim {
    /// Boundary pulse is owed.
    Due,
    /// First tick of the minute came too late for its pulse.
    Late,
    /// Already handled.
    Claimed,
}

#[derive(Debug, Clone, Copy)]
struct Burst {
    sent: u32,
    next_due: NaiveDateTime,
}

#[derive(Debug, Clone, Copy)]
struct FastSetRun {
    /// Physical dial position; advanced by one per pulse.
    dial: u16,
    pulses_sent: u32,
    started: NaiveDateTime,
    next_due: NaiveDateTime,
}

impl FastSetRun {
    fn new(dial: u16, now: NaiveDateTime) -> Self {
        FastSetRun {
            dial,
            pulses_sent: 0,
            started: now,
            next_due: now,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Idle { burst: Option<Burst> },
    FastSet(FastSetRun),
    /// The dial is ahead and stands still at `dial` until system time arrives.
    Stalled { dial: u16 },
    ManualPulse,
}

impl Mode {
    const IDLE: Mode = Mode::Idle { burst: None };

    fn run_mode(&self) -> RunMode {
        match self {
            Mode::Idle { .. } => RunMode::Idle,
            Mode::FastSet(_) => RunMode::FastSetAdvancing,
            Mode::Stalled { .. } => RunMode::Stalled,
            Mode::ManualPulse => RunMode::ManualPulse,
        }
    }
}

pub struct Scheduler<R, S>
where
    R: RelayDriver,
    S: OffsetStore,
{
    relays: R,
    store: S,
    timing: TimingConfig,

    offset: DialOffset,
    has_offset: bool,
    mode: Mode,

    /// Pulse whose relays are currently energized.
    held: Option<PulseEvent>,
    /// Minute boundary that passed while a pulse was held; its pulse is still owed.
    deferred_minute: Option<NaiveDateTime>,
    last_minute: Option<NaiveDateTime>,
    last_burst_hour: Option<NaiveDateTime>,
    last_pulse: Option<PulseEvent>,
    message: String,
}

impl<R, S> Scheduler<R, S>
where
    R: RelayDriver,
    S: OffsetStore,
{
    /// Loads the saved offset and forces both relays off.
    pub fn new(relays: R, store: S, timing: TimingConfig) -> Self {
        let saved = match store.load() {
            Ok(Some(saved)) => {
                info!(
                    "[Store] State restored: has_offset={}, offset_minutes={}",
                    saved.has_offset, saved.offset
                );
                saved
            }
            Ok(None) => {
                info!("[Store] No saved state (first run). Set the dial reading to begin.");
                PersistedOffset::default()
            }
            Err(e) => {
                warn!("[Store] {}; starting with offset 0", e);
                PersistedOffset::default()
            }
        };

        let mut scheduler = Scheduler {
            relays,
            store,
            timing,
            offset: saved.offset,
            has_offset: saved.has_offset,
            mode: Mode::IDLE,
            held: None,
            deferred_minute: None,
            last_minute: None,
            last_burst_hour: None,
            last_pulse: None,
            message: "Idle".to_string(),
        };
        scheduler.all_relays_off();
        scheduler
    }

    pub fn mode(&self) -> RunMode {
        self.mode.run_mode()
    }

    pub fn offset(&self) -> DialOffset {
        self.offset
    }

    pub fn held_pulse(&self) -> Option<PulseEvent> {
        self.held
    }

    /// Where the hands are at `now`.
    pub fn dial_minutes(&self, now: NaiveDateTime) -> u16 {
        match self.mode {
            Mode::FastSet(run) => run.dial,
            Mode::Stalled { dial } => dial,
            _ => self.offset.apply(dial::dial_minute(&now)),
        }
    }

    /// Advances the state machine to `now` and starts at most one pulse.
    pub fn tick(&mut self, now: NaiveDateTime) -> Option<PulseEvent> {
        let now = second_start(now);
        if let Some(held) = self.held {
            let start = minute_start(now);
            if self.last_minute != Some(start) && now.second() <= self.timing.late_tick_grace_secs {
                self.deferred_minute = Some(start);
            }
            debug!(
                "[Scheduler] Tick {} skipped: {} pulse still held",
                now.format("%H:%M:%S"),
                held.target
            );
            return None;
        }

        let claim = self.claim_minute(now);
        match self.mode {
            Mode::Idle { burst } => self.tick_idle(now, burst, claim),
            Mode::FastSet(run) => self.tick_fast_set(now, run),
            Mode::Stalled { dial } => {
                self.tick_stalled(now, dial, claim == MinuteClaim::Due);
                None
            }
            Mode::ManualPulse => None,
        }
    }

    /// Ends `event` if it is still the held pulse. A pulse already cut short by
    /// [`stop_correction`](Self::stop_correction) is left alone.
    pub fn release_pulse(&mut self, event: &PulseEvent) {
        if self.held.as_ref() != Some(event) {
            return;
        }
        self.held = None;
        for &relay in event.target.relays() {
            if let Err(e) = self.relays.deenergize(relay) {
                error!("[Relay] {}", e);
            }
        }
        if event.kind == PulseKind::Manual && matches!(self.mode, Mode::ManualPulse) {
            self.mode = Mode::IDLE;
            self.message = "Idle".to_string();
        }
    }

    pub fn set_dial(
        &mut self,
        reading: DialReading,
        now: NaiveDateTime,
    ) -> Result<DialOffset, ClockError> {
        self.ensure_idle("set dial")?;

        self.offset = DialOffset::between(reading.minutes(), dial::dial_minute(&now));
        self.has_offset = true;
        self.message = format!("Dial set to {}.", reading);
        info!(
            "[Scheduler] Dial set: {} -> offset={} (dial = system + offset)",
            reading, self.offset
        );
        self.persist();
        Ok(self.offset)
    }

    pub fn start_fast_set(&mut self, now: NaiveDateTime) -> Result<RunMode, ClockError> {
        const OP: &str = "start fast set";
        self.ensure_idle(OP)?;
        self.ensure_no_burst(OP)?;

        let now = second_start(now);
        let system = dial::dial_minute(&now);
        let dial = self.offset.apply(system);
        match CorrectionPlan::between(system, dial) {
            CorrectionPlan::Aligned => {
                info!("[FastSet] Already aligned.");
                self.message = "Already aligned (no action).".to_string();
            }
            CorrectionPlan::Advance(behind) => {
                info!(
                    "[FastSet] Dial is {} min slow: A+B every {}ms (width {}ms)",
                    behind, self.timing.fast_set_interval_ms, self.timing.fast_set_pulse_ms
                );
                self.mode = Mode::FastSet(FastSetRun::new(dial, now));
                self.message = "FAST SET running…".to_string();
            }
            CorrectionPlan::Stall(ahead) => self.enter_stall(dial, ahead),
        }
        Ok(self.mode())
    }

    /// Cancels any correction and forces both relays off. Always succeeds.
    pub fn stop_correction(&mut self, now: NaiveDateTime) -> RunMode {
        self.all_relays_off();
        self.held = None;

        let system = dial::dial_minute(&now);
        match self.mode {
            Mode::FastSet(run) => {
                self.offset = DialOffset::between(run.dial, system);
                info!(
                    "[FastSet] Cancelled by user after {} pulses; offset={}",
                    run.pulses_sent, self.offset
                );
                self.finish_run("FAST SET cancelled by user.".to_string());
            }
            Mode::Stalled { dial } => {
                self.offset = DialOffset::between(dial, system);
                info!("[Scheduler] Stall cancelled by user; offset={}", self.offset);
                self.finish_run("Stall cancelled by user.".to_string());
            }
            Mode::Idle { burst: Some(burst) } => {
                info!(
                    "[Scheduler] Correction burst cancelled after {}/{} pulses",
                    burst.sent, self.timing.correction_pulses
                );
                self.mode = Mode::IDLE;
                self.message = "Correction burst cancelled by user.".to_string();
            }
            Mode::ManualPulse => {
                self.mode = Mode::IDLE;
                self.message = "Manual pulse cancelled.".to_string();
            }
            Mode::Idle { burst: None } => {
                debug!("[Scheduler] Stop requested while idle; relays forced off");
            }
        }
        RunMode::Idle
    }

    /// Closes `target` immediately, bypassing the schedule. Wiring checks only.
    pub fn pulse_test(
        &mut self,
        target: PulseTarget,
        width: Option<Duration>,
        now: NaiveDateTime,
    ) -> Result<PulseEvent, ClockError> {
        const OP: &str = "pulse test";
        self.ensure_idle(OP)?;
        self.ensure_no_burst(OP)?;
        self.ensure_relays_free(OP)?;

        let width = self.timing.manual_pulse(width);
        info!("[Scheduler] Manual pulse {} for {}ms", target, width.as_millis());
        self.mode = Mode::ManualPulse;
        self.message = format!("Manual {} pulse.", target);
        Ok(self.fire(target, PulseKind::Manual, second_start(now), width))
    }

    /// Runs the minute-59 correction burst now, starting at the next tick.
    pub fn run_test_burst(&mut self, now: NaiveDateTime) -> Result<(), ClockError> {
        const OP: &str = "run correction burst";
        self.ensure_idle(OP)?;
        self.ensure_no_burst(OP)?;
        self.ensure_relays_free(OP)?;

        info!(
            "[Scheduler] Test burst: {} A pulses every {}ms",
            self.timing.correction_pulses, self.timing.correction_interval_ms
        );
        if self.timing.correction_pulses > 0 {
            let next_due = second_start(now) + chrono::Duration::seconds(1);
            self.mode = Mode::Idle {
                burst: Some(Burst { sent: 0, next_due }),
            };
        }
        self.message = "Correction burst requested.".to_string();
        Ok(())
    }

    pub fn status(&self, now: NaiveDateTime) -> ClockStatus {
        let system = dial::dial_minute(&now);
        let dial_minutes = self.dial_minutes(now);

        ClockStatus {
            system_time: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            dial_time: dial::format_dial(dial_minutes),
            dial_minutes,
            offset_minutes: self.offset.minutes(),
            has_offset: self.has_offset,
            mode: self.mode(),
            seconds_until_next_tick: 60 - now.second().min(59),
            last_pulse: self.last_pulse,
            fast_set: match self.mode {
                Mode::FastSet(run) => Some(FastSetProgress {
                    pulses_sent: run.pulses_sent,
                    remaining_minutes: dial::forward_gap(system, run.dial),
                }),
                _ => None,
            },
            stall_remaining_minutes: match self.mode {
                Mode::Stalled { dial } => Some(dial::forward_gap(dial, system)),
                _ => None,
            },
            correction_pulses_remaining: match self.mode {
                Mode::Idle { burst: Some(burst) } => {
                    Some(self.timing.correction_pulses.saturating_sub(burst.sent))
                }
                _ => None,
            },
            message: self.message.clone(),
        }
    }

    /// Releases everything on the way out.
    pub fn shutdown(&mut self) {
        self.held = None;
        self.all_relays_off();
    }

    fn tick_idle(
        &mut self,
        now: NaiveDateTime,
        burst: Option<Burst>,
        claim: MinuteClaim,
    ) -> Option<PulseEvent> {
        match claim {
            MinuteClaim::Due => {
                let target = if now.minute() <= LAST_B_MINUTE {
                    PulseTarget::AB
                } else {
                    PulseTarget::A
                };
                info!("[Scheduler] Minute tick {}: {} pulse", now.format("%H:%M"), target);
                self.arm_hourly_burst(now, burst);
                return Some(self.fire(target, PulseKind::Minute, now, self.timing.minute_pulse()));
            }
            MinuteClaim::Late => self.arm_hourly_burst(now, burst),
            MinuteClaim::Claimed => {}
        }

        let Mode::Idle {
            burst: Some(mut burst),
        } = self.mode
        else {
            return None;
        };
        if now < burst.next_due {
            return None;
        }
        burst.sent += 1;
        burst.next_due += self.timing.correction_interval();
        let total = self.timing.correction_pulses;
        info!("[Scheduler] Correction pulse {}/{} (A)", burst.sent, total);
        self.mode = Mode::Idle {
            burst: (burst.sent < total).then_some(burst),
        };
        Some(self.fire(
            PulseTarget::A,
            PulseKind::Correction,
            now,
            self.timing.correction_pulse(),
        ))
    }

    /// The gap is recomputed from live system time on every tick, so minutes
    /// that pass during a long run are absorbed rather than counted down.
    fn tick_fast_set(&mut self, now: NaiveDateTime, mut run: FastSetRun) -> Option<PulseEvent> {
        let system = dial::dial_minute(&now);
        self.offset = DialOffset::between(run.dial, system);

        let remaining = match CorrectionPlan::between(system, run.dial) {
            CorrectionPlan::Aligned => {
                info!("[FastSet] Complete. Pulses sent={}", run.pulses_sent);
                self.finish_run(format!("FAST SET complete (pulses sent: {}).", run.pulses_sent));
                return None;
            }
            CorrectionPlan::Stall(ahead) => {
                warn!("[FastSet] Dial is {} min fast; switching to stall", ahead);
                self.enter_stall(run.dial, ahead);
                return None;
            }
            CorrectionPlan::Advance(remaining) => remaining,
        };

        if now < run.next_due {
            return None;
        }
        if run.pulses_sent >= self.timing.fast_set_max_pulses {
            self.abort_run(format!(
                "FAST SET pulse cap reached ({}).",
                self.timing.fast_set_max_pulses
            ));
            return None;
        }
        if now - run.started > self.timing.fast_set_max_duration() {
            self.abort_run(format!(
                "FAST SET timeout reached ({}s).",
                self.timing.fast_set_max_secs
            ));
            return None;
        }

        run.dial = (run.dial + 1) % DIAL_MINUTES;
        run.pulses_sent += 1;
        run.next_due = now + self.timing.fast_set_interval();
        self.mode = Mode::FastSet(run);
        self.offset = DialOffset::between(run.dial, system);

        let left = remaining - 1;
        self.message = format!("Advancing… pulses={}, remaining={}", run.pulses_sent, left);
        if run.pulses_sent % FAST_SET_LOG_EVERY == 0 {
            info!("[FastSet] Progress: pulses={}, remaining={}", run.pulses_sent, left);
        } else {
            debug!("[FastSet] Pulse {} (remaining {})", run.pulses_sent, left);
        }

        let event = self.fire(
            PulseTarget::AB,
            PulseKind::FastSet,
            now,
            self.timing.fast_set_pulse(),
        );
        self.persist();
        Some(event)
    }

    fn tick_stalled(&mut self, now: NaiveDateTime, dial: u16, new_minute: bool) {
        let system = dial::dial_minute(&now);
        self.offset = DialOffset::between(dial, system);

        match CorrectionPlan::between(system, dial) {
            CorrectionPlan::Aligned => {
                info!(
                    "[Scheduler] System time reached dial at {}; resuming normal ticking",
                    dial::format_dial(dial)
                );
                self.finish_run("Stall complete; dial aligned.".to_string());
            }
            CorrectionPlan::Advance(behind) => {
                warn!(
                    "[Scheduler] Dial is now {} min slow while stalled (system clock stepped?); advancing",
                    behind
                );
                self.mode = Mode::FastSet(FastSetRun::new(dial, now));
                self.message = "FAST SET running…".to_string();
            }
            CorrectionPlan::Stall(ahead) => {
                if new_minute {
                    info!(
                        "[Scheduler] Minute tick {}: STALL (dial {} min fast). No pulses.",
                        now.format("%H:%M"),
                        ahead
                    );
                    self.message = format!("Dial is {} min fast: stalling until aligned.", ahead);
                    self.persist();
                }
            }
        }
    }

    fn enter_stall(&mut self, dial: u16, ahead: u16) {
        info!("[Scheduler] Dial is {} min fast -> stalling (no pulses)", ahead);
        self.mode = Mode::Stalled { dial };
        self.message = format!("Dial is {} min fast: stalling until aligned.", ahead);
        self.persist();
    }

    fn finish_run(&mut self, message: String) {
        self.mode = Mode::IDLE;
        self.message = message;
        self.persist();
    }

    fn abort_run(&mut self, reason: String) {
        error!("[FastSet] {} Stopping.", reason);
        self.all_relays_off();
        self.finish_run(reason);
    }

    /// Marks the minute containing `now` as handled.
    fn claim_minute(&mut self, now: NaiveDateTime) -> MinuteClaim {
        let start = minute_start(now);
        if self.last_minute == Some(start) {
            return MinuteClaim::Claimed;
        }
        let previous = self.last_minute.replace(start);
        let deferred = self.deferred_minute.take() == Some(start);
        if deferred || now.second() <= self.timing.late_tick_grace_secs {
            return MinuteClaim::Due;
        }
        if previous.is_some() && matches!(self.mode, Mode::Idle { .. }) {
            warn!(
                "[Scheduler] Missed minute boundary {} (tick {}s late)",
                start.format("%H:%M"),
                now.second()
            );
        }
        MinuteClaim::Late
    }

    /// Starts the minute-59 burst once per hour. Pulses whose due time has
    /// already passed are dropped rather than crammed into the remaining seconds.
    fn arm_hourly_burst(&mut self, now: NaiveDateTime, running: Option<Burst>) {
        let total = self.timing.correction_pulses;
        if now.minute() != BURST_MINUTE || total == 0 || !self.claim_burst_hour(now) {
            return;
        }
        if let Some(running) = running {
            warn!(
                "[Scheduler] Manual correction burst cut short at {}/{} pulses by the hourly burst",
                running.sent, total
            );
        }

        let interval = self.timing.correction_interval();
        let mut burst = Burst {
            sent: 0,
            next_due: minute_start(now) + interval,
        };
        while burst.next_due < now && burst.sent < total {
            burst.sent += 1;
            burst.next_due += interval;
        }

        if burst.sent == total {
            warn!(
                "[Scheduler] Correction burst for {} skipped: minute 59 first seen at :{:02}",
                now.format("%H:00"),
                now.second()
            );
            self.mode = Mode::IDLE;
            return;
        }
        if burst.sent > 0 {
            warn!(
                "[Scheduler] Correction burst started late at :{:02}; {} of {} pulses dropped",
                now.second(),
                burst.sent,
                total
            );
        } else {
            info!(
                "[Scheduler] Correction burst: {} A pulses every {}ms (width {}ms)",
                total, self.timing.correction_interval_ms, self.timing.correction_pulse_ms
            );
        }
        self.mode = Mode::Idle { burst: Some(burst) };
    }

    fn claim_burst_hour(&mut self, now: NaiveDateTime) -> bool {
        let hour = hour_start(now);
        if self.last_burst_hour == Some(hour) {
            return false;
        }
        self.last_burst_hour = Some(hour);
        true
    }

    fn fire(
        &mut self,
        target: PulseTarget,
        kind: PulseKind,
        now: NaiveDateTime,
        width: Duration,
    ) -> PulseEvent {
        for &relay in target.relays() {
            if let Err(e) = self.relays.energize(relay) {
                error!("[Relay] {}; {} pulse is best-effort", e, target);
            }
        }
        let event = PulseEvent {
            target,
            kind,
            timestamp: now,
            width_ms: width.as_millis() as u64,
        };
        self.held = Some(event);
        self.last_pulse = Some(event);
        event
    }

    fn all_relays_off(&mut self) {
        for relay in Relay::ALL {
            if let Err(e) = self.relays.deenergize(relay) {
                error!("[Relay] {}", e);
            }
        }
    }

    fn persist(&mut self) {
        let state = PersistedOffset {
            offset: self.offset,
            has_offset: self.has_offset,
        };
        if let Err(e) = self.store.save(&state) {
            warn!("[Store] {}; in-memory offset {} stays authoritative", e, self.offset);
        }
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<(), ClockError> {
        let reason = match self.mode {
            Mode::Idle { .. } => return Ok(()),
            Mode::FastSet(_) => "fast set is running",
            Mode::Stalled { .. } => "stalled waiting for system time",
            Mode::ManualPulse => "manual pulse in progress",
        };
        Err(ClockError::conflict(operation, reason))
    }

    fn ensure_no_burst(&self, operation: &'static str) -> Result<(), ClockError> {
        match self.mode {
            Mode::Idle { burst: Some(_) } => Err(ClockError::conflict(
                operation,
                "correction burst in progress",
            )),
            _ => Ok(()),
        }
    }

    fn ensure_relays_free(&self, operation: &'static str) -> Result<(), ClockError> {
        match self.held {
            Some(held) => Err(ClockError::conflict(
                operation,
                format!("{} pulse in progress", held.target),
            )),
            None => Ok(()),
        }
    }
}

fn second_start(now: NaiveDateTime) -> NaiveDateTime {
    now.with_nanosecond(0).unwrap_or(now)
}

fn minute_start(now: NaiveDateTime) -> NaiveDateTime {
    second_start(now).with_second(0).unwrap_or(now)
}

fn hour_start(now: NaiveDateTime) -> NaiveDateTime {
    minute_start(now).with_minute(0).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::MockRelayDriver;
    use crate::store::MockOffsetStore;
    use chrono::NaiveDate;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RelayState {
        energized: [bool; 2],
        energize_calls: usize,
    }

    #[derive(Clone, Default)]
    struct FakeRelays(Arc<Mutex<RelayState>>);

    impl FakeRelays {
        fn is_on(&self, relay: Relay) -> bool {
            self.0.lock().unwrap().energized[relay as usize]
        }

        fn energize_calls(&self) -> usize {
            self.0.lock().unwrap().energize_calls
        }
    }

    impl RelayDriver for FakeRelays {
        fn energize(&mut self, relay: Relay) -> Result<(), ClockError> {
            let mut state = self.0.lock().unwrap();
            state.energized[relay as usize] = true;
            state.energize_calls += 1;
            Ok(())
        }

        fn deenergize(&mut self, relay: Relay) -> Result<(), ClockError> {
            self.0.lock().unwrap().energized[relay as usize] = false;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct MemoryStore(Arc<Mutex<Option<PersistedOffset>>>);

    impl MemoryStore {
        fn saved(&self) -> Option<PersistedOffset> {
            *self.0.lock().unwrap()
        }
    }

    impl OffsetStore for MemoryStore {
        fn load(&self) -> Result<Option<PersistedOffset>, ClockError> {
            Ok(self.saved())
        }

        fn save(&mut self, state: &PersistedOffset) -> Result<(), ClockError> {
            *self.0.lock().unwrap() = Some(*state);
            Ok(())
        }
    }

    type TestScheduler = Scheduler<FakeRelays, MemoryStore>;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 10)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn scheduler_with(timing: TimingConfig) -> (TestScheduler, FakeRelays, MemoryStore) {
        let _ = env_logger::builder().is_test(true).try_init();
        let relays = FakeRelays::default();
        let store = MemoryStore::default();
        let scheduler = Scheduler::new(relays.clone(), store.clone(), timing);
        (scheduler, relays, store)
    }

    fn scheduler() -> (TestScheduler, FakeRelays, MemoryStore) {
        scheduler_with(TimingConfig::default())
    }

    /// Ticks once per second for `secs` seconds, releasing every pulse.
    fn run<R: RelayDriver, S: OffsetStore>(
        s: &mut Scheduler<R, S>,
        from: NaiveDateTime,
        secs: i64,
    ) -> Vec<PulseEvent> {
        let mut events = Vec::new();
        for i in 0..secs {
            if let Some(event) = s.tick(from + chrono::Duration::seconds(i)) {
                s.release_pulse(&event);
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_minutes_0_to_49_pulse_a_and_b_together() {
        let (mut s, _, _) = scheduler();
        let events = run(&mut s, at(10, 0, 0), 50 * 60);

        assert_eq!(events.len(), 50);
        for (minute, event) in events.iter().enumerate() {
            assert_eq!(event.target, PulseTarget::AB);
            assert_eq!(event.kind, PulseKind::Minute);
            assert_eq!(event.timestamp, at(10, minute as u32, 0));
        }
    }

    #[test]
    fn test_minutes_50_to_58_pulse_a_only() {
        let (mut s, _, _) = scheduler();
        let events = run(&mut s, at(10, 50, 0), 9 * 60);

        assert_eq!(events.len(), 9);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.target, PulseTarget::A);
            assert_eq!(event.timestamp, at(10, 50 + i as u32, 0));
        }
    }

    #[test]
    fn test_minute_59_sends_eighteen_a_pulses() {
        let (mut s, _, _) = scheduler();
        let events = run(&mut s, at(10, 59, 0), 60);

        assert_eq!(events.len(), 18);
        assert!(events.iter().all(|e| e.target == PulseTarget::A));
        assert!(events.iter().all(|e| e.timestamp.minute() == 59));
        assert_eq!(events[0].kind, PulseKind::Minute);
        assert_eq!(events[0].timestamp.second(), 0);

        let burst: Vec<u32> = events[1..].iter().map(|e| e.timestamp.second()).collect();
        let expected: Vec<u32> = (1..=17).map(|i| i * 2).collect();
        assert_eq!(burst, expected);
        assert!(events[1..].iter().all(|e| e.kind == PulseKind::Correction && e.width_ms == 500));

        let next = s.tick(at(11, 0, 0)).unwrap();
        assert_eq!(next.target, PulseTarget::AB);
        assert_eq!(next.kind, PulseKind::Minute);
    }

    #[test]
    fn test_full_hour_pulse_counts() {
        let (mut s, _, _) = scheduler();
        let events = run(&mut s, at(10, 0, 0), 3600);

        let ab: Vec<_> = events.iter().filter(|e| e.target == PulseTarget::AB).collect();
        assert_eq!(ab.len(), 50);
        assert!(ab.iter().all(|e| e.timestamp.minute() <= 49));
        assert_eq!(events.len(), 50 + 9 + 18);
    }

    #[test]
    fn test_late_tick_within_grace_fires_once() {
        let (mut s, _, _) = scheduler();

        let event = s.tick(at(10, 5, 2)).unwrap();
        s.release_pulse(&event);
        assert!(s.tick(at(10, 5, 3)).is_none());

        // Started mid-minute: that boundary is gone, wait for the next one.
        assert!(s.tick(at(10, 6, 30)).is_none());
        assert!(s.tick(at(10, 7, 0)).is_some());
    }

    #[test]
    fn test_subsecond_ticks_are_normalised() {
        let (mut s, _, _) = scheduler();
        let late = at(10, 59, 2) + chrono::Duration::milliseconds(3);

        let minute = s.tick(at(10, 59, 0)).unwrap();
        s.release_pulse(&minute);
        let first = s.tick(late).unwrap();
        assert_eq!(first.kind, PulseKind::Correction);
        assert_eq!(first.timestamp, at(10, 59, 2));
    }

    #[test]
    fn test_dial_follows_system_plus_offset_when_idle() {
        let (mut s, _, store) = scheduler();
        let offset = s
            .set_dial(DialReading::from_hour_minute(3, 40).unwrap(), at(10, 0, 20))
            .unwrap();

        assert_eq!(offset.minutes(), 340);
        assert_eq!(store.saved().unwrap().offset, offset);
        run(&mut s, at(10, 0, 21), 300);

        for now in [at(10, 0, 30), at(11, 15, 0), at(21, 59, 59)] {
            let expected = (dial::dial_minute(&now) + 340) % DIAL_MINUTES;
            assert_eq!(s.dial_minutes(now), expected);
            assert_eq!(s.status(now).dial_minutes, expected);
        }
    }

    #[test]
    fn test_fast_set_closes_ten_minute_lag_in_twenty_seconds() {
        let (mut s, relays, store) = scheduler();
        s.set_dial("09:50".parse().unwrap(), at(10, 0, 0)).unwrap();
        assert_eq!(s.offset().minutes(), 710);

        assert_eq!(s.start_fast_set(at(10, 0, 4)).unwrap(), RunMode::FastSetAdvancing);
        let events = run(&mut s, at(10, 0, 5), 30);

        assert_eq!(events.len(), 10);
        assert!(events
            .iter()
            .all(|e| e.target == PulseTarget::AB && e.kind == PulseKind::FastSet));
        let seconds: Vec<u32> = events.iter().map(|e| e.timestamp.second()).collect();
        assert_eq!(seconds, vec![5, 7, 9, 11, 13, 15, 17, 19, 21, 23]);

        assert_eq!(s.mode(), RunMode::Idle);
        assert_eq!(s.offset(), DialOffset::ZERO);
        assert_eq!(store.saved().unwrap().offset, DialOffset::ZERO);
        assert_eq!(s.dial_minutes(at(10, 0, 40)), 600);
        assert!(!relays.is_on(Relay::A) && !relays.is_on(Relay::B));
        assert!(s.status(at(10, 0, 40)).message.contains("pulses sent: 10"));
    }

    #[test]
    fn test_fast_set_absorbs_minutes_that_pass_during_the_run() {
        let (mut s, _, _) = scheduler();
        s.set_dial("09:55".parse().unwrap(), at(10, 0, 0)).unwrap();
        s.start_fast_set(at(10, 0, 55)).unwrap();

        let events = run(&mut s, at(10, 0, 56), 15);

        // Five minutes behind plus the boundary crossed at 10:01.
        assert_eq!(events.len(), 6);
        assert!(events.iter().all(|e| e.kind == PulseKind::FastSet));
        assert_eq!(s.mode(), RunMode::Idle);
        assert_eq!(s.dial_minutes(at(10, 1, 10)), 601);

        let next = s.tick(at(10, 2, 0)).unwrap();
        assert_eq!(next.kind, PulseKind::Minute);
    }

    #[test]
    fn test_fast_set_progress_in_status() {
        let (mut s, _, _) = scheduler();
        s.set_dial("09:50".parse().unwrap(), at(10, 0, 0)).unwrap();
        s.start_fast_set(at(10, 0, 4)).unwrap();
        run(&mut s, at(10, 0, 5), 4);

        let status = s.status(at(10, 0, 8));
        assert_eq!(status.mode, RunMode::FastSetAdvancing);
        assert_eq!(
            status.fast_set,
            Some(FastSetProgress {
                pulses_sent: 2,
                remaining_minutes: 8
            })
        );
        assert_eq!(status.dial_time, "09:52");
        assert_eq!(status.offset_minutes, 712);
    }

    #[test]
    fn test_dial_ahead_stalls_until_system_catches_up() {
        let (mut s, relays, store) = scheduler();
        s.set_dial("10:03".parse().unwrap(), at(10, 0, 0)).unwrap();

        assert_eq!(s.start_fast_set(at(10, 0, 10)).unwrap(), RunMode::Stalled);
        assert_eq!(s.status(at(10, 0, 10)).stall_remaining_minutes, Some(3));

        let calls = relays.energize_calls();
        let events = run(&mut s, at(10, 0, 11), 3 * 60 - 11);
        assert!(events.is_empty());
        assert_eq!(relays.energize_calls(), calls);
        assert_eq!(s.mode(), RunMode::Stalled);
        assert_eq!(s.dial_minutes(at(10, 2, 59)), 603);

        // Aligned at the 10:03 boundary: no pulse there, normal ticking after.
        assert!(s.tick(at(10, 3, 0)).is_none());
        assert_eq!(s.mode(), RunMode::Idle);
        assert_eq!(s.offset(), DialOffset::ZERO);
        assert_eq!(store.saved().unwrap().offset, DialOffset::ZERO);
        assert!(run(&mut s, at(10, 3, 1), 59).is_empty());

        let next = s.tick(at(10, 4, 0)).unwrap();
        assert_eq!(next.target, PulseTarget::AB);
    }

    #[test]
    fn test_stop_mid_fast_set_releases_relays_and_keeps_offset() {
        let (mut s, relays, store) = scheduler();
        s.set_dial("09:50".parse().unwrap(), at(10, 0, 0)).unwrap();
        s.start_fast_set(at(10, 0, 4)).unwrap();
        assert_eq!(run(&mut s, at(10, 0, 5), 6).len(), 3);

        let pulse = s.tick(at(10, 0, 11)).unwrap();
        assert!(relays.is_on(Relay::A) && relays.is_on(Relay::B));

        assert_eq!(s.stop_correction(at(10, 0, 11)), RunMode::Idle);
        assert!(!relays.is_on(Relay::A) && !relays.is_on(Relay::B));
        s.release_pulse(&pulse);

        // Four pulses landed: still six minutes behind.
        assert_eq!(s.offset().minutes(), 714);
        assert_eq!(store.saved().unwrap().offset.minutes(), 714);
        assert_eq!(s.status(at(10, 0, 12)).message, "FAST SET cancelled by user.");

        let events = run(&mut s, at(10, 0, 12), 120);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == PulseKind::Minute));
    }

    #[test]
    fn test_stop_mid_burst_cancels_remaining_pulses() {
        let (mut s, relays, _) = scheduler();
        assert_eq!(run(&mut s, at(10, 59, 0), 10).len(), 5);
        assert_eq!(s.status(at(10, 59, 10)).correction_pulses_remaining, Some(13));

        let pulse = s.tick(at(10, 59, 10)).unwrap();
        s.stop_correction(at(10, 59, 10));
        assert!(!relays.is_on(Relay::A));
        s.release_pulse(&pulse);

        assert!(run(&mut s, at(10, 59, 11), 49).is_empty());
        assert_eq!(s.tick(at(11, 0, 0)).unwrap().target, PulseTarget::AB);
    }

    #[test]
    fn test_stop_while_idle_is_harmless() {
        let (mut s, relays, store) = scheduler();
        assert_eq!(s.stop_correction(at(10, 0, 0)), RunMode::Idle);
        assert_eq!(s.stop_correction(at(10, 0, 1)), RunMode::Idle);
        assert!(!relays.is_on(Relay::A));
        assert_eq!(store.saved(), None);
    }

    #[test]
    fn test_operations_conflict_during_correction() {
        let (mut s, relays, _) = scheduler();
        s.set_dial("09:50".parse().unwrap(), at(10, 0, 0)).unwrap();
        s.start_fast_set(at(10, 0, 4)).unwrap();
        let calls = relays.energize_calls();

        assert!(matches!(
            s.set_dial("01:00".parse().unwrap(), at(10, 0, 4)),
            Err(ClockError::StateConflict { .. })
        ));
        assert!(matches!(
            s.pulse_test(PulseTarget::A, None, at(10, 0, 4)),
            Err(ClockError::StateConflict { .. })
        ));
        assert!(matches!(
            s.start_fast_set(at(10, 0, 4)),
            Err(ClockError::StateConflict { .. })
        ));
        assert!(matches!(
            s.run_test_burst(at(10, 0, 4)),
            Err(ClockError::StateConflict { .. })
        ));

        assert_eq!(s.offset().minutes(), 710);
        assert_eq!(s.mode(), RunMode::FastSetAdvancing);
        assert_eq!(relays.energize_calls(), calls);
    }

    #[test]
    fn test_set_dial_conflicts_while_stalled() {
        let (mut s, _, _) = scheduler();
        s.set_dial("10:30".parse().unwrap(), at(10, 0, 0)).unwrap();
        s.start_fast_set(at(10, 0, 1)).unwrap();

        let err = s.set_dial("10:00".parse().unwrap(), at(10, 0, 2)).unwrap_err();
        assert!(err.to_string().contains("stalled"));
        assert_eq!(s.offset().minutes(), 30);
    }

    #[test]
    fn test_fast_set_with_zero_gap_stays_idle() {
        let (mut s, relays, _) = scheduler();
        s.set_dial("10:00".parse().unwrap(), at(10, 0, 0)).unwrap();

        assert_eq!(s.start_fast_set(at(10, 0, 5)).unwrap(), RunMode::Idle);
        assert!(run(&mut s, at(10, 0, 6), 20).is_empty());
        assert_eq!(relays.energize_calls(), 0);
        assert_eq!(s.status(at(10, 0, 6)).message, "Already aligned (no action).");
    }

    #[test]
    fn test_fast_set_pulse_cap_aborts_run() {
        let timing = TimingConfig {
            fast_set_max_pulses: 3,
            ..TimingConfig::default()
        };
        let (mut s, relays, store) = scheduler_with(timing);
        s.set_dial("09:50".parse().unwrap(), at(10, 0, 0)).unwrap();
        s.start_fast_set(at(10, 0, 4)).unwrap();

        assert_eq!(run(&mut s, at(10, 0, 5), 20).len(), 3);
        assert_eq!(s.mode(), RunMode::Idle);
        assert!(s.status(at(10, 0, 30)).message.contains("pulse cap"));
        assert_eq!(store.saved().unwrap().offset.minutes(), 713);
        assert!(!relays.is_on(Relay::A) && !relays.is_on(Relay::B));
    }

    #[test]
    fn test_pulse_test_holds_manual_mode_until_released() {
        let (mut s, relays, _) = scheduler();
        let event = s
            .pulse_test(PulseTarget::B, Some(Duration::from_millis(10)), at(10, 0, 30))
            .unwrap();

        assert_eq!(event.width(), Duration::from_millis(50));
        assert_eq!(s.mode(), RunMode::ManualPulse);
        assert!(relays.is_on(Relay::B) && !relays.is_on(Relay::A));
        assert!(s.tick(at(10, 0, 31)).is_none());
        assert!(matches!(
            s.pulse_test(PulseTarget::A, None, at(10, 0, 31)),
            Err(ClockError::StateConflict { .. })
        ));

        s.release_pulse(&event);
        assert_eq!(s.mode(), RunMode::Idle);
        assert!(!relays.is_on(Relay::B));
    }

    #[test]
    fn test_minute_pulse_waits_for_manual_pulse() {
        let (mut s, _, _) = scheduler();
        let manual = s.pulse_test(PulseTarget::A, None, at(10, 0, 59)).unwrap();

        assert!(s.tick(at(10, 1, 0)).is_none());
        s.release_pulse(&manual);

        let minute = s.tick(at(10, 1, 1)).unwrap();
        assert_eq!(minute.kind, PulseKind::Minute);
        assert_eq!(minute.target, PulseTarget::AB);
    }

    #[test]
    fn test_long_manual_pulse_does_not_swallow_minute_pulse() {
        let (mut s, _, _) = scheduler();
        let manual = s
            .pulse_test(PulseTarget::A, Some(Duration::from_millis(5000)), at(10, 0, 58))
            .unwrap();
        assert_eq!(manual.width_ms, 5000);

        assert!(run(&mut s, at(10, 0, 59), 5).is_empty());
        s.release_pulse(&manual);

        let events = run(&mut s, at(10, 1, 4), 56);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, PulseKind::Minute);
        assert_eq!(events[0].target, PulseTarget::AB);
        assert_eq!(events[0].timestamp, at(10, 1, 4));

        let next = s.tick(at(10, 2, 0)).unwrap();
        assert_eq!(next.kind, PulseKind::Minute);
        assert_eq!(s.dial_minutes(at(10, 2, 0)), 602);
    }

    #[test]
    fn test_late_minute_59_keeps_remaining_burst_pulses() {
        let (mut s, _, _) = scheduler();
        let minute = s.tick(at(10, 58, 0)).unwrap();
        s.release_pulse(&minute);

        // Tick thread stalled across the 10:59 boundary.
        let events = run(&mut s, at(10, 59, 10), 50);

        assert_eq!(events.len(), 13);
        assert!(events.iter().all(|e| e.kind == PulseKind::Correction));
        assert_eq!(events[0].timestamp, at(10, 59, 10));
        assert_eq!(events[12].timestamp, at(10, 59, 34));
    }

    #[test]
    fn test_minute_59_seen_after_burst_window_skips_burst() {
        let (mut s, _, _) = scheduler();
        let minute = s.tick(at(10, 58, 0)).unwrap();
        s.release_pulse(&minute);

        assert!(run(&mut s, at(10, 59, 40), 20).is_empty());
        assert_eq!(s.status(at(10, 59, 45)).correction_pulses_remaining, None);
        assert_eq!(s.tick(at(11, 0, 0)).unwrap().target, PulseTarget::AB);
    }

    #[test]
    fn test_hourly_burst_replaces_manual_burst_at_minute_59() {
        let (mut s, _, _) = scheduler();
        s.run_test_burst(at(10, 58, 40)).unwrap();

        let events = run(&mut s, at(10, 58, 41), 60);
        let (before, after): (Vec<&_>, Vec<&_>) =
            events.iter().partition(|e| e.timestamp.minute() == 58);

        assert_eq!(before.len(), 10);
        assert_eq!(after[0].kind, PulseKind::Minute);
        assert_eq!(after[0].timestamp, at(10, 59, 0));
        let hourly: Vec<u32> = after[1..].iter().map(|e| e.timestamp.second()).collect();
        assert_eq!(hourly, (1..=17).map(|i| i * 2).collect::<Vec<u32>>());
    }

    #[test]
    fn test_manual_burst_runs_seventeen_pulses() {
        let (mut s, _, _) = scheduler();
        s.run_test_burst(at(10, 20, 10)).unwrap();
        assert!(matches!(
            s.start_fast_set(at(10, 20, 10)),
            Err(ClockError::StateConflict { .. })
        ));

        let events = run(&mut s, at(10, 20, 11), 40);
        assert_eq!(events.len(), 17);
        assert!(events.iter().all(|e| e.kind == PulseKind::Correction));
        assert_eq!(events[0].timestamp, at(10, 20, 11));
        assert_eq!(events[16].timestamp, at(10, 20, 43));
    }

    #[test]
    fn test_hardware_fault_does_not_stop_ticking() {
        let mut relays = MockRelayDriver::new();
        relays.expect_deenergize().returning(|_| Ok(()));
        relays
            .expect_energize()
            .returning(|relay| Err(ClockError::HardwareFault(format!("relay {} unreachable", relay))));

        let mut s = Scheduler::new(relays, MemoryStore::default(), TimingConfig::default());
        let events = run(&mut s, at(10, 0, 0), 121);

        assert_eq!(events.len(), 3);
        assert_eq!(s.mode(), RunMode::Idle);
        assert_eq!(s.held_pulse(), None);
    }

    #[test]
    fn test_persistence_fault_keeps_in_memory_offset() {
        let mut store = MockOffsetStore::new();
        store
            .expect_load()
            .returning(|| Err(ClockError::PersistenceFault("corrupt".into())));
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(ClockError::PersistenceFault("read-only".into())));

        let mut s = Scheduler::new(FakeRelays::default(), store, TimingConfig::default());
        assert_eq!(s.offset(), DialOffset::ZERO);

        let offset = s.set_dial("09:45".parse().unwrap(), at(10, 0, 0)).unwrap();
        assert_eq!(offset.minutes(), 705);
        assert_eq!(s.offset(), offset);
    }

    #[test]
    fn test_offset_survives_restart() {
        let store = MemoryStore::default();
        {
            let mut s = Scheduler::new(FakeRelays::default(), store.clone(), TimingConfig::default());
            s.set_dial("09:50".parse().unwrap(), at(10, 0, 0)).unwrap();
        }

        let s = Scheduler::new(FakeRelays::default(), store.clone(), TimingConfig::default());
        assert_eq!(s.offset().minutes(), 710);
        assert!(s.status(at(10, 30, 0)).has_offset);
        assert_eq!(s.dial_minutes(at(10, 30, 0)), 620);
    }

    #[test]
    fn test_new_forces_relays_off() {
        let mut relays = MockRelayDriver::new();
        relays.expect_deenergize().with(mockall::predicate::eq(Relay::A)).times(1).returning(|_| Ok(()));
        relays.expect_deenergize().with(mockall::predicate::eq(Relay::B)).times(1).returning(|_| Ok(()));

        let s = Scheduler::new(relays, MemoryStore::default(), TimingConfig::default());
        assert_eq!(s.mode(), RunMode::Idle);
    }
}
