//! Raw-programmer (DFU) transport: invokes an external programming utility
//! against a USB device already sitting in its programmer mode.
//!
//! Control-transfer and device-matching idioms (enumerate by VID:PID,
//! `read_languages` + `read_serial_number_string` for identity, close the
//! handle before handing the bus to a subprocess) are grounded in the
//! teacher crate's Amlogic transport.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rusb::UsbContext;

use crate::device::{format_hex_address, format_vid_pid, DeviceId};
use crate::module::{Module, ModuleType};
use crate::platform::{Platform, StorageType};
use crate::subprocess;
use crate::transport::{DeviceDiscovery, DeviceTransport, FlashOutcome};
use crate::{Error, Result};

const USB_CONTROL_TIMEOUT: Duration = Duration::from_millis(500);
const PROGRAMMER_TIMEOUT: Duration = Duration::from_secs(120);
const MODE_SWITCH_REQUEST: u8 = 0x01;
/// How long to wait, polling at this interval, for the board to
/// re-enumerate in programmer mode after the mode-switch request.
const REENUMERATION_POLL: Duration = Duration::from_millis(250);
const REENUMERATION_ATTEMPTS: usize = 40;

/// A programmer-mode USB identity (vid:pid) worth enumerating.
#[derive(Debug, Clone, Copy)]
pub struct ProgrammerIdentity {
  pub vid: u16,
  pub pid: u16,
}

pub struct RawProgrammerDiscovery {
  programmer_path: String,
  identities: Vec<ProgrammerIdentity>,
}

impl RawProgrammerDiscovery {
  pub fn new(programmer_path: impl Into<String>, identities: Vec<ProgrammerIdentity>) -> Self {
    RawProgrammerDiscovery {
      programmer_path: programmer_path.into(),
      identities,
    }
  }
}

#[async_trait]
impl DeviceDiscovery for RawProgrammerDiscovery {
  async fn list(&self) -> Result<Vec<(DeviceId, Option<u16>)>> {
    let identities = self.identities.clone();
    tokio::task::spawn_blocking(move || list_by_serial(&identities)).await?
  }

  async fn open_by_id(&self, id: &DeviceId) -> Result<Box<dyn DeviceTransport>> {
    let identities = self.identities.clone();
    let id = id.clone();
    let found = tokio::task::spawn_blocking({
      let id = id.clone();
      move || find_by_serial(&id, &identities)
    })
    .await??;

    Ok(Box::new(RawProgrammerTransport {
      id,
      vid: found.0,
      pid: found.1,
      programmer_path: self.programmer_path.clone(),
    }))
  }
}

fn list_by_serial(identities: &[ProgrammerIdentity]) -> Result<Vec<(DeviceId, Option<u16>)>> {
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

fn find_by_serial(id: &DeviceId, identities: &[ProgrammerIdentity]) -> Result<(u16, u16)> {
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

/// An open session against a device sitting in (or switched into) its
/// programmer mode.
pub struct RawProgrammerTransport {
  id: DeviceId,
  vid: u16,
  pid: u16,
  programmer_path: String,
}

#[async_trait]
impl DeviceTransport for RawProgrammerTransport {
  fn device_id(&self) -> &DeviceId {
    &self.id
  }

  fn can_flash_module(&self, module: &Module, platform: &Platform) -> bool {
    module.r#type != ModuleType::Bootloader && platform.alt_setting(module.storage).is_some()
  }

  fn can_write_to_flash(&self, storage: StorageType, platform: &Platform) -> bool {
    platform.alt_setting(storage).is_some()
  }

  async fn close(&mut self) -> Result<()> {
    Ok(())
  }

  async fn reset(&mut self) -> Result<()> {
    Ok(())
  }

  async fn prepare_to_flash(&mut self) -> Result<()> {
    let id = self.id.clone();
    let vid = self.vid;
    let pid = self.pid;
    tokio::task::spawn_blocking(move || ensure_programmer_mode(&id, vid, pid)).await??;
    Ok(())
  }

  async fn write_to_flash(&mut self, file: &Path, storage: StorageType, address: u32, platform: &Platform) -> Result<FlashOutcome> {
    let alt = platform.alt_setting(storage).ok_or(Error::UnsupportedStorage)?;

    let vid_pid = format_vid_pid(self.vid, self.pid);
    let serial = self.id.as_str().to_string();
    let alt_arg = alt.to_string();
    let address_arg = format_hex_address(address);
    let file_arg = file.to_string_lossy().into_owned();

    let args = vec![
      "-d".to_string(),
      vid_pid,
      "-S".to_string(),
      serial,
      "-a".to_string(),
      alt_arg,
      "-s".to_string(),
      address_arg,
      "-D".to_string(),
      file_arg,
    ];

    let output = subprocess::run_with_timeout(&self.programmer_path, args, PROGRAMMER_TIMEOUT).await?;
    if !output.status.success() {
      return Err(Error::ProgrammerFailed {
        code: output.status.code(),
        stderr: output.stderr,
      });
    }
    Ok(FlashOutcome::default())
  }
}

/// Send the vendor mode-switch control request if the board isn't already
/// in programmer mode, then wait for it to re-enumerate under the same
/// serial.
fn ensure_programmer_mode(id: &DeviceId, vid: u16, pid: u16) -> Result<()> {
  let identity = [ProgrammerIdentity { vid, pid }];
  if find_by_serial(id, &identity).is_ok() {
    return Ok(());
  }

  let context = rusb::Context::new()?;
  let device = context
    .devices()?
    .iter()
    .find(|d| d.device_descriptor().map(|desc| desc.vendor_id() == vid && desc.product_id() == pid).unwrap_or(false));

  let Some(device) = device else {
    return Err(Error::OpenFailed(id.to_string()));
  };

  let handle = device.open()?;
  handle.write_control(0x40, MODE_SWITCH_REQUEST, 0, 0, &[], USB_CONTROL_TIMEOUT).ok();
  drop(handle);

  for _ in 0..REENUMERATION_ATTEMPTS {
    std::thread::sleep(REENUMERATION_POLL);
    if find_by_serial(id, &identity).is_ok() {
      return Ok(());
    }
  }
  Err(Error::OpenFailed(id.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn formats_programmer_args_the_same_way_the_command_line_expects() {
    assert_eq!(format_vid_pid(0x2b04, 0xd006), "2b04:d006");
    assert_eq!(format_hex_address(0x0800_0000), "0x8000000");
  }
}
