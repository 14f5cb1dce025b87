use anyhow::Result;
use std::time::Duration;

/// Reference time source used to sanity-check the local clock at startup.
#[cfg_attr(test, mockall::automock)]
pub trait NtpSource {
    /// Offset of the local clock from the reference as `(magnitude, sign)`.
    /// A positive sign means the local clock is behind.
    fn get_offset(&self) -> Result<(Duration, i8)>;
}
