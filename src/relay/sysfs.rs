use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use super::{Relay, RelayDriver};
use crate::config::GpioConfig;
use crate::error::ClockError;

/// How long udev gets to create (and chmod) a freshly exported pin.
const EXPORT_TIMEOUT: Duration = Duration::from_secs(2);

struct SysfsPin {
    number: u32,
    value_path: PathBuf,
}

/// Two relay outputs driven through `/sys/class/gpio`.
pub struct SysfsRelays {
    a: SysfsPin,
    b: SysfsPin,
    active_high: bool,
}

impl SysfsRelays {
    pub fn new(config: &GpioConfig) -> Result<Self> {
        let root = &config.sysfs_root;
        let a = export_pin(root, config.base + config.pin_a, config.active_high)?;
        let b = export_pin(root, config.base + config.pin_b, config.active_high)?;

        info!(
            "[Relay] sysfs GPIO ready: A=GPIO{} B=GPIO{} (active-{})",
            a.number,
            b.number,
            if config.active_high { "high" } else { "low" }
        );

        Ok(SysfsRelays {
            a,
            b,
            active_high: config.active_high,
        })
    }

    fn pin(&self, relay: Relay) -> &SysfsPin {
        match relay {
            Relay::A => &self.a,
            Relay::B => &self.b,
        }
    }

    fn write(&self, relay: Relay, energized: bool) -> Result<(), ClockError> {
        let pin = self.pin(relay);
        let level = if energized == self.active_high { "1" } else { "0" };
        fs::write(&pin.value_path, level).map_err(|e| {
            ClockError::HardwareFault(format!("relay {} (GPIO{}): {}", relay, pin.number, e))
        })
    }
}

impl RelayDriver for SysfsRelays {
    fn energize(&mut self, relay: Relay) -> Result<(), ClockError> {
        self.write(relay, true)
    }

    fn deenergize(&mut self, relay: Relay) -> Result<(), ClockError> {
        self.write(relay, false)
    }
}

impl Drop for SysfsRelays {
    fn drop(&mut self) {
        for relay in Relay::ALL {
            if let Err(e) = self.write(relay, false) {
                warn!("[Relay] Failed to release on shutdown: {}", e);
            }
        }
    }
}

fn export_pin(root: &Path, number: u32, active_high: bool) -> Result<SysfsPin> {
    let dir = root.join(format!("gpio{}", number));
    let direction = dir.join("direction");

    if !direction.exists() {
        debug!("[Relay] Exporting GPIO{}", number);
        fs::write(root.join("export"), number.to_string())
            .with_context(|| format!("Failed to export GPIO{} (are you in the gpio group?)", number))?;

        let start = Instant::now();
        while !direction.exists() {
            if start.elapsed() > EXPORT_TIMEOUT {
                return Err(anyhow!("GPIO{} did not appear under {}", number, root.display()));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    // "high"/"low" switch to output with that level atomically, so the relay
    // never closes while the pin is being configured.
    let idle_level = if active_high { "low" } else { "high" };
    fs::write(&direction, idle_level)
        .with_context(|| format!("Failed to configure GPIO{} as output", number))?;

    Ok(SysfsPin {
        number,
        value_path: dir.join("value"),
    })
}
