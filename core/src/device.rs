//! Device identity and the small formatting/validation helpers the rest of
//! the crate shares (spec's "Subprocess & Utilities" component).

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A device's 24-hex-character lowercase identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for DeviceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl FromStr for DeviceId {
  type Err = Error;

  fn from_str(raw: &str) -> Result<Self> {
    if raw.len() == 24 && raw.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
      Ok(DeviceId(raw.to_string()))
    } else {
      Err(Error::InvalidOperation(format!(
        "{raw} is not a 24-character lowercase hex device id"
      )))
    }
  }
}

/// A candidate board. `platform_id` may be absent at discovery and is
/// filled in later from USB interrogation, a user-supplied hint, or the
/// device registry.
///
/// The transport-specific open handle is intentionally not stored here: it
/// is owned by whichever [`crate::transport::DeviceTransport`] session
/// opened it, so that per-device state stays shared-nothing across workers
/// (see spec's concurrency model).
#[derive(Debug, Clone)]
pub struct Device {
  pub id: DeviceId,
  pub platform_id: Option<u16>,
}

impl Device {
  pub fn new(id: DeviceId, platform_id: Option<u16>) -> Self {
    Device { id, platform_id }
  }

  /// A tracing span carrying this device's id, so every log line emitted
  /// while acting on this device is attributable to it.
  pub fn span(&self) -> tracing::Span {
    tracing::info_span!("device", id = %self.id)
  }
}

/// Format a byte address the way the raw programmer and debug-adapter
/// command lines expect: `0x` followed by lowercase hex, no leading zeros
/// beyond a single digit.
pub fn format_hex_address(address: u32) -> String {
  format!("{address:#x}")
}

/// Format a `vid:pid` pair the way `-d` flags expect it.
pub fn format_vid_pid(vid: u16, pid: u16) -> String {
  format!("{vid:04x}:{pid:04x}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn accepts_valid_ids() {
    let id: DeviceId = "0123456789abcdef01234567".parse().unwrap();
    assert_eq!(id.as_str(), "0123456789abcdef01234567");
  }

  #[test]
  fn rejects_uppercase_and_wrong_length() {
    assert!("0123456789ABCDEF01234567".parse::<DeviceId>().is_err());
    assert!("deadbeef".parse::<DeviceId>().is_err());
  }

  #[test]
  fn formats_addresses_and_vid_pid() {
    assert_eq!(format_hex_address(0x0800_0000), "0x8000000");
    assert_eq!(format_vid_pid(0x2b04, 0xd006), "2b04:d006");
  }
}
