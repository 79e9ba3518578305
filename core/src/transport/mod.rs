//! Capability interfaces shared by the three device transports, replacing
//! the `Device`/`FlashInterface` base-class hierarchy with two independent
//! traits: discovery (enumerate and open) and device control (write,
//! reset, capability checks).
//!
//! Grounded in `monsgeek-transport`'s `Transport`/`DeviceDiscovery` split:
//! the same shape (an async discovery trait returning boxed sessions of an
//! async device trait) covers a very different wire protocol here.

pub mod debug_adapter;
pub mod raw;
pub mod usb;

use std::path::Path;

use async_trait::async_trait;

use crate::device::DeviceId;
use crate::module::Module;
use crate::platform::{Platform, StorageType};
use crate::{Error, Result};

/// Outcome of a single module write.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashOutcome {
  /// Set when the device needs to re-enumerate before the next operation
  /// (the USB update-request transport always sets this).
  pub reset_pending: bool,
}

/// Enumerates and opens devices behind one primary transport.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
  /// Candidate device ids, with `platform_id` filled in only where this
  /// transport can determine it without a full open (e.g. none for raw
  /// programmer discovery, always for debug-adapter probes).
  async fn list(&self) -> Result<Vec<(DeviceId, Option<u16>)>>;

  /// Open a session against a known device id.
  async fn open_by_id(&self, id: &DeviceId) -> Result<Box<dyn DeviceTransport>>;
}

/// An open session against one device, behind one transport.
///
/// Every method here operates on a single already-open device; callers
/// (`crate::flasher`) serialize all calls to a given instance themselves,
/// upholding the shared-nothing-per-device model (spec's concurrency
/// model).
#[async_trait]
pub trait DeviceTransport: Send + Sync {
  fn device_id(&self) -> &DeviceId;

  fn can_flash_module(&self, module: &Module, platform: &Platform) -> bool;
  fn can_write_to_flash(&self, storage: StorageType, platform: &Platform) -> bool;

  async fn close(&mut self) -> Result<()>;
  async fn reset(&mut self) -> Result<()>;
  async fn prepare_to_flash(&mut self) -> Result<()>;

  /// Write a single file to a storage region at an address (raw
  /// programmer, debug adapter). Transports that don't expose raw writes
  /// (the USB update-request transport) keep the default, which fails.
  async fn write_to_flash(&mut self, file: &Path, storage: StorageType, address: u32, platform: &Platform) -> Result<FlashOutcome> {
    let _ = (file, storage, address, platform);
    Err(Error::UnsupportedModule(format!(
      "{} does not support raw flash writes",
      std::any::type_name::<Self>()
    )))
  }

  /// Stream a whole module image to the device's running firmware (USB
  /// update-request transport). Other transports keep the default.
  async fn flash_module(&mut self, module: &Module, file: &Path) -> Result<FlashOutcome> {
    let _ = (module, file);
    Err(Error::UnsupportedModule(format!(
      "{} does not support update-request writes",
      std::any::type_name::<Self>()
    )))
  }
}
