//! Update-request (USB) transport: asks the device's running firmware to
//! accept and apply a whole module image over its USB control endpoint,
//! rather than writing flash directly.
//!
//! Chunked control-transfer idiom grounded in the teacher crate's Amlogic
//! transport (`write_memory`/`bulkcmd`, which also move a whole buffer
//! across a control endpoint in fixed-size pieces).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusb::UsbContext;
use tokio::time::timeout;

use crate::device::DeviceId;
use crate::module::Module;
use crate::platform::{Platform, StorageType, CATALOG};
use crate::transport::{DeviceDiscovery, DeviceTransport, FlashOutcome};
use crate::{Error, Result};

const USB_CONTROL_TIMEOUT: Duration = Duration::from_secs(2);
const UPDATE_REQUEST_TIMEOUT: Duration = Duration::from_secs(240);
const CHUNK_SIZE: usize = 4096;

const REQUEST_ENTER_LISTENING_MODE: u8 = 0x02;
const REQUEST_BEGIN_UPDATE: u8 = 0x03;
const REQUEST_WRITE_CHUNK: u8 = 0x04;
const REQUEST_END_UPDATE: u8 = 0x05;

#[derive(Debug, Clone, Copy)]
pub struct UpdateRequestIdentity {
  pub vid: u16,
  pub pid: u16,
}

pub struct UpdateRequestDiscovery {
  identities: Vec<UpdateRequestIdentity>,
}

impl UpdateRequestDiscovery {
  pub fn new(identities: Vec<UpdateRequestIdentity>) -> Self {
    UpdateRequestDiscovery { identities }
  }
}

#[async_trait]
impl DeviceDiscovery for UpdateRequestDiscovery {
  async fn list(&self) -> Result<Vec<(DeviceId, Option<u16>)>> {
    let identities = self.identities.clone();
    tokio::task::spawn_blocking(move || list_devices(&identities)).await?
  }

  async fn open_by_id(&self, id: &DeviceId) -> Result<Box<dyn DeviceTransport>> {
    let identities = self.identities.clone();
    let id = id.clone();
    let (vid, pid) = tokio::task::spawn_blocking({
      let id = id.clone();
      move || find_device(&id, &identities)
    })
    .await??;
    Ok(Box::new(UpdateRequestTransport { id, vid, pid }))
  }
}

fn list_devices(identities: &[UpdateRequestIdentity]) -> Result<Vec<(DeviceId, Option<u16>)>> {
  let context = rusb::Context::new()?;
  let mut found = Vec::new();
  for device in context.devices()?.iter() {
    let Ok(desc) = device.device_descriptor() else { continue };
    if !identities.iter().any(|i| i.vid == desc.vendor_id() && i.pid == desc.product_id()) {
      continue;
    }
    let Some(serial) = read_serial(&device, &desc) else { continue };
    if let Ok(id) = serial.parse::<DeviceId>() {
      found.push((id, None));
    }
  }
  Ok(found)
}

fn find_device(id: &DeviceId, identities: &[UpdateRequestIdentity]) -> Result<(u16, u16)> {
  let context = rusb::Context::new()?;
  for device in context.devices()?.iter() {
    let Ok(desc) = device.device_descriptor() else { continue };
    if !identities.iter().any(|i| i.vid == desc.vendor_id() && i.pid == desc.product_id()) {
      continue;
    }
    let Some(serial) = read_serial(&device, &desc) else { continue };
    if serial.parse::<DeviceId>().as_ref() == Ok(id) {
      return Ok((desc.vendor_id(), desc.product_id()));
    }
  }
  Err(Error::OpenFailed(id.to_string()))
}

fn read_serial<T: UsbContext>(device: &rusb::Device<T>, desc: &rusb::DeviceDescriptor) -> Option<String> {
  let handle = device.open().ok()?;
  let language = *handle.read_languages(USB_CONTROL_TIMEOUT).ok()?.first()?;
  handle.read_serial_number_string(language, desc, USB_CONTROL_TIMEOUT).ok()
}

pub struct UpdateRequestTransport {
  id: DeviceId,
  vid: u16,
  pid: u16,
}

#[async_trait]
impl DeviceTransport for UpdateRequestTransport {
  fn device_id(&self) -> &DeviceId {
    &self.id
  }

  fn can_flash_module(&self, _module: &Module, _platform: &Platform) -> bool {
    true
  }

  fn can_write_to_flash(&self, _storage: StorageType, _platform: &Platform) -> bool {
    false
  }

  async fn close(&mut self) -> Result<()> {
    Ok(())
  }

  async fn reset(&mut self) -> Result<()> {
    let (vid, pid) = (self.vid, self.pid);
    tokio::task::spawn_blocking(move || send_simple_request(vid, pid, REQUEST_END_UPDATE)).await??;
    Ok(())
  }

  async fn prepare_to_flash(&mut self) -> Result<()> {
    let (vid, pid) = (self.vid, self.pid);
    tokio::task::spawn_blocking(move || send_simple_request(vid, pid, REQUEST_ENTER_LISTENING_MODE)).await??;
    Ok(())
  }

  async fn flash_module(&mut self, _module: &Module, file: &Path) -> Result<FlashOutcome> {
    let data = tokio::fs::read(file).await?;
    let vid = self.vid;
    let pid = self.pid;

    let send = tokio::task::spawn_blocking(move || send_update(vid, pid, &data));
    match timeout(UPDATE_REQUEST_TIMEOUT, send).await {
      Ok(result) => {
        result??;
        Ok(FlashOutcome { reset_pending: true })
      }
      Err(_) => Err(Error::CommandTimeout("update-request write".into())),
    }
  }
}

fn open_handle(vid: u16, pid: u16) -> Result<rusb::DeviceHandle<rusb::Context>> {
  let context = rusb::Context::new()?;
  let device = context
    .devices()?
    .iter()
    .find(|d| d.device_descriptor().map(|desc| desc.vendor_id() == vid && desc.product_id() == pid).unwrap_or(false))
    .ok_or_else(|| Error::OpenFailed(format!("{vid:04x}:{pid:04x}")))?;
  Ok(device.open()?)
}

fn send_simple_request(vid: u16, pid: u16, request: u8) -> Result<()> {
  let handle = open_handle(vid, pid)?;
  handle.write_control(0x40, request, 0, 0, &[], USB_CONTROL_TIMEOUT)?;
  Ok(())
}

/// Stream `data` to the device's firmware-update control endpoint in fixed
/// chunks, bracketed by a begin/end control request pair.
fn send_update(vid: u16, pid: u16, data: &[u8]) -> Result<()> {
  let handle = open_handle(vid, pid)?;
  handle.write_control(0x40, REQUEST_BEGIN_UPDATE, 0, 0, &(data.len() as u32).to_le_bytes(), USB_CONTROL_TIMEOUT)?;

  for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
    handle.write_control(0x40, REQUEST_WRITE_CHUNK, index as u16, 0, chunk, USB_CONTROL_TIMEOUT)?;
  }

  handle.write_control(0x40, REQUEST_END_UPDATE, 0, 0, &[], USB_CONTROL_TIMEOUT)?;
  Ok(())
}

/// Lightweight pre-probe used by [`crate::fleet::Fleet`] to fill in
/// `platform_id` before any transport is asked to open a device: scans the
/// bus for every platform's known normal-mode `(vid, pid)` and reads its
/// serial, without sending any control requests or opening a flashing
/// session. `open_by_id` is never called on this discovery directly (the
/// fleet only ever calls [`DeviceDiscovery::list`] on it); it delegates to
/// [`UpdateRequestDiscovery`] for symmetry in case a caller does.
pub struct UsbPlatformProbe;

#[async_trait]
impl DeviceDiscovery for UsbPlatformProbe {
  async fn list(&self) -> Result<Vec<(DeviceId, Option<u16>)>> {
    tokio::task::spawn_blocking(probe_known_platforms).await?
  }

  async fn open_by_id(&self, id: &DeviceId) -> Result<Box<dyn DeviceTransport>> {
    let identities: Vec<UpdateRequestIdentity> = CATALOG
      .platforms()
      .filter_map(|p| p.usb_identity)
      .map(|(vid, pid)| UpdateRequestIdentity { vid, pid })
      .collect();
    UpdateRequestDiscovery::new(identities).open_by_id(id).await
  }
}

fn probe_known_platforms() -> Result<Vec<(DeviceId, Option<u16>)>> {
  let context = rusb::Context::new()?;
  let mut found = Vec::new();
  for device in context.devices()?.iter() {
    let Ok(desc) = device.device_descriptor() else { continue };
    let Some(platform) = CATALOG
      .platforms()
      .find(|p| p.usb_identity == Some((desc.vendor_id(), desc.product_id())))
    else {
      continue;
    };
    let Some(serial) = read_serial(&device, &desc) else { continue };
    if let Ok(id) = serial.parse::<DeviceId>() {
      found.push((id, Some(platform.id)));
    }
  }
  Ok(found)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunk_size_divides_evenly_for_deterministic_chunk_counts() {
    let data = vec![0u8; CHUNK_SIZE * 3 + 1];
    let chunks: Vec<_> = data.chunks(CHUNK_SIZE).collect();
    assert_eq!(chunks.len(), 4);
    assert_eq!(chunks[3].len(), 1);
  }
}
