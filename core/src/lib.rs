//! # boardflash-core
//!
//! Orchestration engine for flashing firmware onto embedded development
//! boards. This crate resolves the correct per-platform firmware module
//! binaries for a requested release, enumerates candidate boards across
//! whichever transports are available, and writes each board's modules to
//! the correct storage region, in parallel, with retries and resets.
//!
//! ## Main components
//!
//! - [`platform`] — the static catalog mapping platform id/name to MCU
//!   family, firmware module layout, and debug-adapter configuration.
//! - [`module`] — canonical [`module::Module`] records, parsed from
//!   on-disk binaries via the sibling `module-format` crate.
//! - [`cache`] — the release resolver: fetch, unpack, backfill, and cache
//!   per-release module files.
//! - [`transport`] — the three device transports (raw programmer, USB
//!   update-request, debug adapter) behind a shared capability interface.
//! - [`control`] — the line-oriented TCP client used to drive the
//!   debug-adapter daemon.
//! - [`flasher`] — the per-device flashing state machine.
//! - [`fleet`] — enumeration, identity reconciliation, and
//!   bounded-parallelism dispatch across a fleet of devices.

pub mod cache;
pub mod control;
pub mod device;
pub mod flasher;
pub mod fleet;
pub mod module;
pub mod platform;
pub mod registry;
pub mod release;
pub mod subprocess;
pub mod transport;

pub use device::Device;
pub use module::Module;
pub use platform::Platform;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds that can occur anywhere in the flashing pipeline.
///
/// A single flat enum, in the style of the teacher crate this workspace was
/// built from: one descriptive variant per failure mode rather than boxed
/// dynamic errors, so callers can match on specific outcomes (a draft
/// release requiring auth, a device that never showed up, and so on).
#[derive(thiserror::Error, Debug)]
pub enum Error {
  #[error("release not found: {0}")]
  ReleaseNotFound(String),

  #[error("release {0} has no usable binaries")]
  NoBinariesInRelease(String),

  #[error("unknown platform: {0}")]
  UnknownPlatform(String),

  #[error("unknown module type: {0}")]
  UnknownModuleType(String),

  #[error("unknown storage type: {0}")]
  UnknownStorageType(String),

  #[error("no storage descriptor for module type on this platform")]
  StorageUnknown,

  #[error("download failed for {asset}: {source}")]
  DownloadFailed {
    asset: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("failed to parse module at {path}: {source}")]
  ParseFailed {
    path: std::path::PathBuf,
    #[source]
    source: module_format::ParseError,
  },

  #[error("unsupported module: {0}")]
  UnsupportedModule(String),

  #[error("storage type has no alt-setting on this platform")]
  UnsupportedStorage,

  #[error("device is not open")]
  DeviceNotOpen,

  #[error("failed to open device {0}")]
  OpenFailed(String),

  #[error("programmer exited with code {code:?}: {stderr}")]
  ProgrammerFailed { code: Option<i32>, stderr: String },

  #[error("debug adapter daemon did not start within the timeout")]
  DaemonStartTimeout,

  #[error("debug adapter daemon exited unexpectedly")]
  DaemonExitedUnexpectedly,

  #[error("control protocol error: {0}")]
  ControlProtocolError(String),

  #[error("command timed out: {0}")]
  CommandTimeout(String),

  #[error("could not detect target platform; probe transcript:\n{0}")]
  UnknownTargetPlatform(String),

  #[error("no devices found")]
  NoDevicesFound,

  #[error("device not found: {0}")]
  DeviceNotFound(String),

  #[error("authentication required for draft releases (set GITHUB_TOKEN)")]
  AuthenticationRequired,

  #[error("usb error: {0}")]
  Usb(#[from] rusb::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("http error: {0}")]
  Http(#[from] reqwest::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("zip error: {0}")]
  Zip(#[from] zip::result::ZipError),

  #[error("semver error: {0}")]
  Semver(#[from] semver::Error),

  #[error("task join error: {0}")]
  Join(#[from] tokio::task::JoinError),

  #[error("invalid operation: {0}")]
  InvalidOperation(String),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn release_not_found_carries_the_version() {
    let err = Error::ReleaseNotFound("1.10.12-rc.13".into());
    assert_eq!(err.to_string(), "release not found: 1.10.12-rc.13");
  }
}
