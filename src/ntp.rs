use anyhow::{Context, Result};
use log::{info, warn};
use rsntp::SntpClient;
use std::time::Duration;

use crate::traits::NtpSource;

pub struct NtpClient {
    server: String,
}

impl NtpClient {
    pub fn new(server: &str) -> Self {
        NtpClient {
            server: server.to_string(),
        }
    }
}

impl NtpSource for NtpClient {
    fn get_offset(&self) -> Result<(Duration, i8)> {
        let result = SntpClient::new()
            .synchronize(&self.server)
            .with_context(|| format!("SNTP query to {} failed", self.server))?;

        let offset_secs = result.clock_offset().as_secs_f64();
        let sign = if offset_secs < 0.0 { -1 } else { 1 };
        Ok((Duration::from_secs_f64(offset_secs.abs()), sign))
    }
}

/// Reports how far the local clock is from `source`. Pulses follow the local
/// clock either way; this never adjusts it.
pub fn check_system_clock(source: &dyn NtpSource, max_offset: Duration) -> bool {
    match source.get_offset() {
        Ok((offset, sign)) => {
            let sign_str = if sign > 0 { "+" } else { "-" };
            if offset > max_offset {
                warn!(
                    "[NTP] System clock is off by {}{:?} (limit {:?}); the dial will follow it anyway",
                    sign_str, offset, max_offset
                );
                false
            } else {
                info!("[NTP] System clock offset {}{:?}", sign_str, offset);
                true
            }
        }
        Err(e) => {
            warn!("[NTP] Clock check failed: {:#}", e);
            false
        }
    }
}
