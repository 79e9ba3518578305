//! Debug-adapter transport: drives a target-control daemon (an openocd-style
//! subprocess) through a [`crate::control::ControlClient`] session.
//!
//! This is the most involved transport: it owns the daemon's lifecycle as
//! an explicit state machine (replacing the event-driven lifecycle the
//! system this was distilled from used), auto-detects the target MCU by
//! probing debug ports, and reads the device id once connected.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use regex::Regex;

use crate::control::{ControlClient, ControlOptions};
use crate::device::{format_hex_address, DeviceId};
use crate::module::Module;
use crate::platform::{DeviceIdRead, Platform, StorageType, CATALOG};
use crate::subprocess;
use crate::transport::{DeviceDiscovery, DeviceTransport, FlashOutcome};
use crate::{Error, Result};

const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(10);
const FLASH_WRITE_TIMEOUT: Duration = Duration::from_secs(120);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const RESET_MIN_INTERVAL: Duration = Duration::from_secs(5);
const DEBUG_PORT_PROBE_RANGE: std::ops::Range<u8> = 0..4;

const WROTE_BYTES_PATTERN: &str = r"(?i)wrote \d+ bytes from file";
const PROGRAMMING_FINISHED_PATTERN: &str = r"(?i)\*\* Programming Finished \*\*";
const HALTED_PATTERN: &str = r"(?i)target halted due to";
const NO_AP_PATTERN: &str = r"(?i)no ap found";

/// A known debug-adapter USB identity. `control_base_port` is the first
/// control port used; each additional adapter of the same kind found during
/// enumeration uses `control_base_port + index`.
///
/// `supported_mcu_list` is the set of platform ids this adapter model can
/// ever be wired to (spec §3's `supported_mcu_list`); when it names exactly
/// one platform, §4.6 step 1 lets detection be skipped entirely.
#[derive(Debug, Clone)]
pub struct AdapterIdentity {
  pub vid: u16,
  pub pid: u16,
  pub control_base_port: u16,
  pub supported_mcu_list: Vec<u16>,
}

impl Default for AdapterIdentity {
  /// ARM's CMSIS-DAP reference VID:PID, the identity every adapter the
  /// built-in platform catalog targets (`interface/cmsis-dap.cfg`) presents.
  /// Left empty: this generic adapter is wired to every nRF52840-based
  /// board in the catalog, so detection always runs.
  fn default() -> Self {
    AdapterIdentity {
      vid: 0x0d28,
      pid: 0x0204,
      control_base_port: 4444,
      supported_mcu_list: Vec::new(),
    }
  }
}

/// `Some(id)` iff `supported_mcu_list` names exactly one platform — the one
/// case spec §4.6 step 1 lets detection be skipped for.
fn single_known_mcu(supported_mcu_list: &[u16]) -> Option<u16> {
  match supported_mcu_list {
    [only] => Some(*only),
    _ => None,
  }
}

/// One physical adapter found on the bus.
#[derive(Debug, Clone)]
struct Adapter {
  serial: String,
  control_port: u16,
}

pub struct DebugAdapterDiscovery {
  identity: AdapterIdentity,
  daemon_path: String,
}

impl DebugAdapterDiscovery {
  pub fn new(daemon_path: impl Into<String>, identity: AdapterIdentity) -> Self {
    DebugAdapterDiscovery {
      identity,
      daemon_path: daemon_path.into(),
    }
  }
}

#[async_trait]
impl DeviceDiscovery for DebugAdapterDiscovery {
  async fn list(&self) -> Result<Vec<(DeviceId, Option<u16>)>> {
    let adapters = enumerate_adapters(&self.identity)?;
    let mut found = Vec::new();
    for adapter in adapters {
      match identify_adapter(&self.daemon_path, &adapter, &self.identity).await {
        Ok((id, platform_id, _used_srst, mut daemon)) => {
          let _ = daemon.stop().await;
          found.push((id, Some(platform_id)));
        }
        Err(err) => tracing::warn!(adapter = %adapter.serial, %err, "debug adapter did not identify a target"),
      }
    }
    Ok(found)
  }

  async fn open_by_id(&self, id: &DeviceId) -> Result<Box<dyn DeviceTransport>> {
    let adapters = enumerate_adapters(&self.identity)?;
    for adapter in adapters {
      let Ok((found_id, platform_id, used_srst, daemon)) = identify_adapter(&self.daemon_path, &adapter, &self.identity).await else {
        continue;
      };
      if &found_id != id {
        let mut daemon = daemon;
        let _ = daemon.stop().await;
        continue;
      }
      return Ok(Box::new(DebugAdapterTransport {
        id: found_id,
        adapter,
        daemon_path: self.daemon_path.clone(),
        platform_id,
        asserted_srst: used_srst,
        daemon: Some(daemon),
        last_reset: None,
        last_daemon_stop: None,
      }));
    }
    Err(Error::OpenFailed(id.to_string()))
  }
}

fn enumerate_adapters(identity: &AdapterIdentity) -> Result<Vec<Adapter>> {
  use rusb::UsbContext;

  let context = rusb::Context::new()?;
  let mut found = Vec::new();
  let mut index: u16 = 0;
  for device in context.devices()?.iter() {
    let Ok(desc) = device.device_descriptor() else { continue };
    if desc.vendor_id() != identity.vid || desc.product_id() != identity.pid {
      continue;
    }
    let Ok(handle) = device.open() else { continue };
    let Ok(languages) = handle.read_languages(Duration::from_millis(500)) else { continue };
    let Some(&language) = languages.first() else { continue };
    let raw_serial = handle
      .read_serial_number_string(language, &desc, Duration::from_millis(500))
      .unwrap_or_default();
    found.push(Adapter {
      serial: render_descriptor_string(&raw_serial),
      control_port: identity.control_base_port + index,
    });
    index += 1;
  }
  Ok(found)
}

/// Render a decoded USB string descriptor the way the control log expects:
/// printable ASCII passes through, ASCII control/DEL bytes become `\xNN`,
/// and any non-ASCII character becomes `?`.
fn render_descriptor_string(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    if c.is_ascii() {
      let byte = c as u8;
      if byte.is_ascii_graphic() || byte == b' ' {
        out.push(c);
      } else {
        out.push_str(&format!("\\x{byte:02X}"));
      }
    } else {
      out.push('?');
    }
  }
  out
}

/// Determine the target platform — skipping the probe daemon entirely when
/// the adapter's `supported_mcu_list` names exactly one platform — then stop
/// the probe daemon (if one ran), start a fresh daemon with the real target
/// config, assert SRST first when the platform requires it, and only then
/// read the device id. Returns the device id, the matched platform's id,
/// whether SRST assertion was needed, and the still-running real-target
/// daemon.
async fn identify_adapter(daemon_path: &str, adapter: &Adapter, identity: &AdapterIdentity) -> Result<(DeviceId, u16, bool, OpenOcd)> {
  let (platform, used_srst) = match single_known_mcu(&identity.supported_mcu_list) {
    Some(platform_id) => (CATALOG.by_id(platform_id)?, false),
    None => {
      let mut probe = OpenOcd::start_probe(daemon_path, adapter.control_port).await?;
      let client = probe.client.as_mut().expect("probe daemon connects its control client");

      let detected = match detect_platform(client, false).await {
        Ok(platform) => Ok((platform, false)),
        Err(_) => match detect_platform(client, true).await {
          Ok(platform) => Ok((platform, true)),
          Err(transcript) => Err(transcript),
        },
      };
      probe.stop().await?;
      match detected {
        Ok(result) => result,
        Err(transcript) => return Err(Error::UnknownTargetPlatform(transcript)),
      }
    }
  };

  let mut daemon = start_daemon_for_platform(daemon_path, adapter, platform).await?;
  let client = daemon.client.as_mut().expect("daemon just connected");
  let raw_id = read_device_id(client, platform).await?;
  Ok((raw_id, platform.id, used_srst, daemon))
}

/// Probe debug ports `0..4` with `dap info <n>`, stopping at the first "no
/// AP" response, and match the concatenated transcript against every
/// catalog platform's `manufacturer_match` strings.
async fn detect_platform(client: &mut ControlClient, assert_srst: bool) -> std::result::Result<&'static Platform, String> {
  if assert_srst {
    let _ = client.exec("connect_assert_srst srst_only srst_nogate", Some(COMMAND_TIMEOUT)).await;
  }

  let mut transcript = String::new();
  for port in DEBUG_PORT_PROBE_RANGE {
    let response = client
      .exec(&format!("dap info {port}"), Some(COMMAND_TIMEOUT))
      .await
      .map_err(|err| err.to_string())?;
    transcript.push_str(&response);
    transcript.push('\n');
    if Regex::new(NO_AP_PATTERN).unwrap().is_match(&response) {
      break;
    }
  }

  for platform in CATALOG.platforms() {
    let Some(target) = &platform.debug_target else { continue };
    if target.manufacturer_match.iter().any(|m| transcript.contains(m.as_str())) {
      return Ok(platform);
    }
  }
  Err(transcript)
}

async fn read_device_id(client: &mut ControlClient, platform: &Platform) -> Result<DeviceId> {
  let Some(target) = &platform.debug_target else {
    return Err(Error::UnsupportedModule("platform has no debug-adapter configuration".into()));
  };

  let raw = match &target.device_id_read {
    DeviceIdRead::Memory { address, length, prefix } => {
      let response = client
        .exec(&format!("mdb {} {}", format_hex_address(*address), length), Some(COMMAND_TIMEOUT))
        .await?;
      let hex: String = response.chars().filter(|c| c.is_ascii_hexdigit()).collect();
      match prefix {
        Some(p) => format!("{p}{hex}"),
        None => hex,
      }
    }
    DeviceIdRead::Procedure { name, pattern } => {
      let response = client.exec(name, Some(COMMAND_TIMEOUT)).await?;
      let re = Regex::new(pattern).map_err(|err| Error::ControlProtocolError(err.to_string()))?;
      let captures = re
        .captures(response.trim())
        .ok_or_else(|| Error::ControlProtocolError(format!("device id procedure output did not match: {response}")))?;
      captures
        .iter()
        .skip(1)
        .filter_map(|m| m.map(|m| m.as_str()))
        .collect::<Vec<_>>()
        .join("")
    }
  };

  raw.to_lowercase().parse()
}

/// The target-control daemon subprocess's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenOcdState {
  Stopped,
  Starting,
  Running,
  Stopping,
}

struct OpenOcd {
  state: OpenOcdState,
  process: Option<tokio::process::Child>,
  client: Option<ControlClient>,
  control_port: u16,
}

impl OpenOcd {
  /// Start a bare Cortex-M probe daemon (no real target config yet).
  async fn start_probe(daemon_path: &str, control_port: u16) -> Result<Self> {
    let init = format!(
      "transport select swd; target create probe.cpu cortex_m -endian little; telnet_port {control_port}; gdb_port disabled"
    );
    Self::start(daemon_path, &["interface/cmsis-dap.cfg".to_string()], &init, control_port).await
  }

  async fn start_for_platform(daemon_path: &str, platform: &Platform, control_port: u16) -> Result<Self> {
    let target = platform
      .debug_target
      .as_ref()
      .ok_or_else(|| Error::UnsupportedModule("platform has no debug-adapter configuration".into()))?;
    let init = format!("telnet_port {control_port}; gdb_port disabled");
    Self::start(
      daemon_path,
      &[target.interface_cfg.clone(), target.target_cfg.clone()],
      &init,
      control_port,
    )
    .await
  }

  async fn start(daemon_path: &str, config_files: &[String], init_script: &str, control_port: u16) -> Result<Self> {
    let mut args = Vec::new();
    for f in config_files {
      args.push("-f".to_string());
      args.push(f.clone());
    }
    args.push("-c".to_string());
    args.push(init_script.to_string());

    let mut process = subprocess::spawn_daemon(daemon_path, args)?;
    let mut openocd = OpenOcd {
      state: OpenOcdState::Starting,
      process: None,
      client: None,
      control_port,
    };

    let connect = async {
      loop {
        match ControlClient::connect("127.0.0.1", control_port, ControlOptions::default()).await {
          Ok(client) => return Ok(client),
          Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
      }
    };

    match tokio::time::timeout(DAEMON_START_TIMEOUT, connect).await {
      Ok(Ok(client)) => {
        openocd.client = Some(client);
        openocd.process = Some(process);
        openocd.state = OpenOcdState::Running;
        Ok(openocd)
      }
      _ => {
        let _ = process.kill().await;
        Err(Error::DaemonStartTimeout)
      }
    }
  }

  /// Graceful shutdown if the control client is idle and connected,
  /// otherwise a forced kill. Waits for process exit either way.
  async fn stop(&mut self) -> Result<()> {
    if self.state == OpenOcdState::Stopped {
      return Ok(());
    }
    self.state = OpenOcdState::Stopping;

    if let Some(client) = self.client.as_mut() {
      if client.is_connected() {
        let _ = client.exec("shutdown", Some(Duration::from_secs(2))).await;
        let _ = client.disconnect().await;
      }
    }

    if let Some(mut process) = self.process.take() {
      match tokio::time::timeout(Duration::from_secs(5), process.wait()).await {
        Ok(_) => {}
        Err(_) => {
          let _ = process.kill().await;
          let _ = process.wait().await;
        }
      }
    }

    self.state = OpenOcdState::Stopped;
    Ok(())
  }
}

/// An open session against one target MCU, behind a debug adapter.
pub struct DebugAdapterTransport {
  id: DeviceId,
  adapter: Adapter,
  daemon_path: String,
  platform_id: u16,
  asserted_srst: bool,
  daemon: Option<OpenOcd>,
  last_reset: Option<Instant>,
  last_daemon_stop: Option<Instant>,
}

async fn start_daemon_for_platform(daemon_path: &str, adapter: &Adapter, platform: &Platform) -> Result<OpenOcd> {
  let mut daemon = OpenOcd::start_for_platform(daemon_path, platform, adapter.control_port).await?;
  if platform.debug_target.as_ref().map(|t| t.requires_srst).unwrap_or(false) {
    let client = daemon.client.as_mut().expect("daemon just connected");
    reset_and_halt(client).await?;
  }
  Ok(daemon)
}

async fn reset_and_halt(client: &mut ControlClient) -> Result<()> {
  let response = client.exec("reset init", Some(COMMAND_TIMEOUT)).await?;
  if !Regex::new(HALTED_PATTERN).unwrap().is_match(&response) {
    client.exec("soft_reset_halt", Some(COMMAND_TIMEOUT)).await?;
  }
  Ok(())
}

#[async_trait]
impl DeviceTransport for DebugAdapterTransport {
  fn device_id(&self) -> &DeviceId {
    &self.id
  }

  fn can_flash_module(&self, module: &Module, _platform: &Platform) -> bool {
    module.storage == StorageType::InternalFlash
  }

  fn can_write_to_flash(&self, storage: StorageType, _platform: &Platform) -> bool {
    storage == StorageType::InternalFlash
  }

  async fn close(&mut self) -> Result<()> {
    let Some(daemon) = self.daemon.as_mut() else { return Ok(()) };
    if self.asserted_srst {
      if let Some(client) = daemon.client.as_mut() {
        if client.is_connected() {
          let _ = client.exec("reset run", Some(COMMAND_TIMEOUT)).await;
        }
      }
    }
    daemon.stop().await?;
    self.last_daemon_stop = Some(Instant::now());
    Ok(())
  }

  async fn reset(&mut self) -> Result<()> {
    if let Some(last) = self.last_reset {
      let elapsed = last.elapsed();
      if elapsed < RESET_MIN_INTERVAL {
        tokio::time::sleep(RESET_MIN_INTERVAL - elapsed).await;
      }
    }
    let daemon = self.daemon.as_mut().ok_or(Error::DeviceNotOpen)?;
    let client = daemon.client.as_mut().ok_or(Error::DeviceNotOpen)?;
    client.exec("reset run", Some(COMMAND_TIMEOUT)).await?;
    self.last_reset = Some(Instant::now());
    Ok(())
  }

  async fn prepare_to_flash(&mut self) -> Result<()> {
    if let Some(stopped_at) = self.last_daemon_stop {
      let mut rng = rand::thread_rng();
      let throttle = Duration::from_millis(rng.gen_range(1000..=3000));
      let elapsed = stopped_at.elapsed();
      if elapsed < throttle {
        tokio::time::sleep(throttle - elapsed).await;
      }
    }
    if self.daemon.is_none() {
      let adapter = self.adapter.clone();
      let platform = CATALOG.by_id(self.platform_id)?;
      self.daemon = Some(start_daemon_for_platform(&self.daemon_path, &adapter, platform).await?);
    }
    Ok(())
  }

  async fn write_to_flash(&mut self, file: &std::path::Path, storage: StorageType, address: u32, platform: &Platform) -> Result<FlashOutcome> {
    if storage != StorageType::InternalFlash {
      return Err(Error::UnsupportedStorage);
    }
    let target = platform
      .debug_target
      .as_ref()
      .ok_or_else(|| Error::UnsupportedModule("platform has no debug-adapter configuration".into()))?;

    let daemon = self.daemon.as_mut().ok_or(Error::DeviceNotOpen)?;
    let client = daemon.client.as_mut().ok_or(Error::DeviceNotOpen)?;

    let file_arg = file.to_string_lossy().into_owned();
    let address_arg = format_hex_address(address);

    let cmd = if target.requires_srst {
      format!("flash write_image erase unlock {file_arg} {address_arg}")
    } else {
      format!("program {file_arg} {address_arg}")
    };

    let response = client.exec(&cmd, Some(FLASH_WRITE_TIMEOUT)).await?;
    let wrote = Regex::new(WROTE_BYTES_PATTERN).unwrap().is_match(&response);
    let finished = Regex::new(PROGRAMMING_FINISHED_PATTERN).unwrap().is_match(&response);
    if !wrote && !finished {
      return Err(Error::ProgrammerFailed {
        code: None,
        stderr: response,
      });
    }
    Ok(FlashOutcome::default())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn renders_non_ascii_as_question_mark_and_control_bytes_as_hex_escapes() {
    assert_eq!(render_descriptor_string("ABC123"), "ABC123");
    assert_eq!(render_descriptor_string("A\u{7}B"), "A\\x07B");
    assert_eq!(render_descriptor_string("A\u{7f}B"), "A\\x7FB");
    assert_eq!(render_descriptor_string("Aé"), "A?");
  }

  #[test]
  fn single_known_mcu_only_skips_detection_with_exactly_one_entry() {
    assert_eq!(single_known_mcu(&[]), None);
    assert_eq!(single_known_mcu(&[13]), Some(13));
    assert_eq!(single_known_mcu(&[13, 14]), None);
  }
}
