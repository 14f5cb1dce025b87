use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gpio: GpioConfig,
    pub timing: TimingConfig,
    pub web: WebConfig,
    pub state_file: PathBuf,
    /// SNTP server used for the startup clock check. `None` skips the check.
    pub ntp_server: Option<String>,
    pub ntp_max_offset_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    pub pin_a: u32,
    pub pin_b: u32,
    /// Waveshare-style relay boards close on LOW.
    pub active_high: bool,
    pub sysfs_root: PathBuf,
    /// Added to pin numbers on kernels that number sysfs GPIOs from a chip base (e.g. 512).
    pub base: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub minute_pulse_ms: u64,
    pub correction_pulses: u32,
    pub correction_interval_ms: u64,
    pub correction_pulse_ms: u64,
    pub fast_set_interval_ms: u64,
    pub fast_set_pulse_ms: u64,
    pub fast_set_max_pulses: u32,
    pub fast_set_max_secs: u64,
    /// A tick this many seconds late still fires the minute pulse.
    pub late_tick_grace_secs: u32,
    pub manual_pulse_min_ms: u64,
    pub manual_pulse_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gpio: GpioConfig::default(),
            timing: TimingConfig::default(),
            web: WebConfig::default(),
            state_file: default_state_file(),
            ntp_server: None,
            ntp_max_offset_ms: 500,
        }
    }
}

impl Default for GpioConfig {
    fn default() -> Self {
        GpioConfig {
            pin_a: 26,
            pin_b: 20,
            active_high: false,
            sysfs_root: PathBuf::from("/sys/class/gpio"),
            base: 0,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            minute_pulse_ms: 1000, // raise to 1200-1500 if the movement misses steps
            correction_pulses: 17,
            correction_interval_ms: 2000,
            correction_pulse_ms: 500,
            fast_set_interval_ms: 2000,
            fast_set_pulse_ms: 600,
            fast_set_max_pulses: 400,
            fast_set_max_secs: 40 * 60,
            late_tick_grace_secs: 3,
            manual_pulse_min_ms: 50,
            manual_pulse_max_ms: 5000,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        WebConfig {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

fn default_state_file() -> PathBuf {
    home::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("master-clock")
        .join("international_state.json")
}

impl Config {
    /// Reads a JSON config file; missing fields take their defaults.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gpio.pin_a == self.gpio.pin_b {
            return Err(anyhow!("Relay A and B cannot share GPIO{}", self.gpio.pin_a));
        }
        self.timing.validate()
    }
}

impl TimingConfig {
    pub fn minute_pulse(&self) -> Duration {
        Duration::from_millis(self.minute_pulse_ms)
    }

    pub fn correction_pulse(&self) -> Duration {
        Duration::from_millis(self.correction_pulse_ms)
    }

    pub fn correction_interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.correction_interval_ms as i64)
    }

    pub fn fast_set_pulse(&self) -> Duration {
        Duration::from_millis(self.fast_set_pulse_ms)
    }

    pub fn fast_set_interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.fast_set_interval_ms as i64)
    }

    pub fn fast_set_max_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.fast_set_max_secs as i64)
    }

    /// Width of a manual test pulse, defaulting to the minute pulse.
    pub fn manual_pulse(&self, requested: Option<Duration>) -> Duration {
        let ms = requested.map_or(self.minute_pulse_ms, |d| d.as_millis() as u64);
        Duration::from_millis(ms.clamp(self.manual_pulse_min_ms, self.manual_pulse_max_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.minute_pulse_ms == 0 || self.correction_pulse_ms == 0 || self.fast_set_pulse_ms == 0 {
            return Err(anyhow!("Pulse widths must be non-zero"));
        }
        if self.correction_pulse_ms >= self.correction_interval_ms {
            return Err(anyhow!(
                "Correction pulse ({}ms) must be shorter than its interval ({}ms)",
                self.correction_pulse_ms,
                self.correction_interval_ms
            ));
        }
        if self.fast_set_pulse_ms >= self.fast_set_interval_ms {
            return Err(anyhow!(
                "Fast-set pulse ({}ms) must be shorter than its interval ({}ms)",
                self.fast_set_pulse_ms,
                self.fast_set_interval_ms
            ));
        }
        if self.correction_pulses > 0 && self.minute_pulse_ms >= self.correction_interval_ms {
            return Err(anyhow!(
                "Minute pulse ({}ms) must end before the first correction pulse ({}ms)",
                self.minute_pulse_ms,
                self.correction_interval_ms
            ));
        }
        let burst_end_ms = self.correction_pulses as u64 * self.correction_interval_ms + self.correction_pulse_ms;
        if burst_end_ms >= 60_000 {
            return Err(anyhow!(
                "Correction burst ({} x {}ms) does not fit inside minute 59",
                self.correction_pulses,
                self.correction_interval_ms
            ));
        }
        if self.manual_pulse_min_ms > self.manual_pulse_max_ms {
            return Err(anyhow!("manual_pulse_min_ms exceeds manual_pulse_max_ms"));
        }
        Ok(())
    }
}
