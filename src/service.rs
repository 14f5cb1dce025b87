//! Shared front for the scheduler: a single lock around it, the tick loop, and
//! the operations the control surface calls.

use chrono::{Local, NaiveDateTime, Timelike};
use log::{debug, error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::dial::{DialOffset, DialReading};
use crate::error::ClockError;
use crate::relay::{PulseTarget, RelayDriver};
use crate::scheduler::{PulseEvent, RunMode, Scheduler};
use crate::status::ClockStatus;
use crate::store::OffsetStore;

/// Source of local wall-clock time.
pub trait WallClock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct LocalClock;

impl WallClock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

pub type BoxedScheduler = Scheduler<Box<dyn RelayDriver + Send>, Box<dyn OffsetStore + Send>>;

pub struct ClockService {
    scheduler: Mutex<BoxedScheduler>,
    clock: Box<dyn WallClock>,
}

impl ClockService {
    pub fn new(scheduler: BoxedScheduler, clock: Box<dyn WallClock>) -> Self {
        ClockService {
            scheduler: Mutex::new(scheduler),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoxedScheduler> {
        self.scheduler.lock().unwrap_or_else(|poisoned| {
            warn!("[Scheduler] State lock poisoned by a panicked thread; continuing");
            poisoned.into_inner()
        })
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub fn get_status(&self) -> ClockStatus {
        let now = self.now();
        self.lock().status(now)
    }

    pub fn set_dial(&self, reading: DialReading) -> Result<DialOffset, ClockError> {
        let now = self.now();
        self.lock().set_dial(reading, now)
    }

    pub fn start_fast_set(&self) -> Result<RunMode, ClockError> {
        let now = self.now();
        self.lock().start_fast_set(now)
    }

    pub fn stop_correction(&self) -> RunMode {
        let now = self.now();
        self.lock().stop_correction(now)
    }

    pub fn run_test_burst(&self) -> Result<(), ClockError> {
        let now = self.now();
        self.lock().run_test_burst(now)
    }

    /// Closes `target` and blocks for the pulse width. The lock is not held
    /// while waiting, so status and stop stay responsive.
    pub fn pulse_test(
        &self,
        target: PulseTarget,
        width: Option<Duration>,
    ) -> Result<PulseEvent, ClockError> {
        let now = self.now();
        let event = self.lock().pulse_test(target, width, now)?;
        thread::sleep(event.width());
        self.lock().release_pulse(&event);
        Ok(event)
    }

    /// Runs one scheduler tick, blocking for the width of any pulse it starts.
    pub fn tick_once(&self) -> Option<PulseEvent> {
        let now = self.now();
        let event = self.lock().tick(now)?;
        thread::sleep(event.width());
        self.lock().release_pulse(&event);
        Some(event)
    }

    /// Ticks on every whole second until `running` clears, then releases the relays.
    pub fn run(&self, running: &AtomicBool) {
        info!("[Scheduler] Tick loop started");
        while running.load(Ordering::SeqCst) {
            self.sleep_until_next_second();
            if !running.load(Ordering::SeqCst) {
                break;
            }

            match panic::catch_unwind(AssertUnwindSafe(|| self.tick_once())) {
                Ok(Some(event)) => debug!("[Scheduler] {} {:?} pulse done", event.target, event.kind),
                Ok(None) => {}
                Err(_) => {
                    error!("[Scheduler] Tick panicked; relays released, loop continues");
                    self.lock().shutdown();
                }
            }
        }
        self.lock().shutdown();
        info!("[Scheduler] Tick loop stopped; relays released");
    }

    fn sleep_until_next_second(&self) {
        let nanos = self.now().nanosecond() % 1_000_000_000;
        thread::sleep(Duration::from_nanos(u64::from(1_000_000_000 - nanos)));
    }
}
