use log::info;

use super::{Relay, RelayDriver};
use crate::error::ClockError;

/// Relay bank that only logs. Lets the daemon run on a machine without relays.
#[derive(Debug, Default)]
pub struct DryRunRelays {
    energized: [bool; 2],
}

impl DryRunRelays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_energized(&self, relay: Relay) -> bool {
        self.energized[relay as usize]
    }

    fn set(&mut self, relay: Relay, on: bool) {
        let slot = &mut self.energized[relay as usize];
        if *slot != on {
            *slot = on;
            info!("[Relay] (dry-run) {} {}", relay, if on { "ON" } else { "off" });
        }
    }
}

impl RelayDriver for DryRunRelays {
    fn energize(&mut self, relay: Relay) -> Result<(), ClockError> {
        self.set(relay, true);
        Ok(())
    }

    fn deenergize(&mut self, relay: Relay) -> Result<(), ClockError> {
        self.set(relay, false);
        Ok(())
    }
}
