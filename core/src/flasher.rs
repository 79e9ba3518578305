//! Per-device flashing state machine (spec's Per-Device Flasher): orders a
//! platform's modules into directly-writable vs. update-request-only,
//! retries on failure, switches transports mid-sequence, and resets.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::timeout;

use crate::device::DeviceId;
use crate::module::Module;
use crate::platform::Platform;
use crate::transport::{DeviceDiscovery, DeviceTransport};
use crate::{Error, Result};

const UPDATE_REQUEST_SWITCH_WAIT: Duration = Duration::from_secs(3);
const UPDATE_REQUEST_REOPEN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct FlasherOptions {
  pub max_retries: u32,
}

impl Default for FlasherOptions {
  fn default() -> Self {
    FlasherOptions { max_retries: 2 }
  }
}

/// Flashes one device's module set, given its primary transport (raw
/// programmer or debug adapter) and the USB update-request transport as
/// fallback for modules the primary can't write directly.
pub struct Flasher<'a> {
  pub device_id: DeviceId,
  pub platform: &'a Platform,
  pub primary: &'a dyn DeviceDiscovery,
  pub update_request: &'a dyn DeviceDiscovery,
  pub temp_dir: PathBuf,
}

impl<'a> Flasher<'a> {
  pub fn new(
    device_id: DeviceId,
    platform: &'a Platform,
    primary: &'a dyn DeviceDiscovery,
    update_request: &'a dyn DeviceDiscovery,
    temp_dir: PathBuf,
  ) -> Self {
    Flasher {
      device_id,
      platform,
      primary,
      update_request,
      temp_dir,
    }
  }

  pub async fn run(&self, modules: Vec<Module>, options: FlasherOptions) -> Result<()> {
    let span = tracing::info_span!("flash", device = %self.device_id, platform = %self.platform.name);
    let _enter = span.enter();

    let (direct, via_update) = self.partition(modules).await?;
    tracing::info!(direct = direct.len(), update_request = via_update.len(), "partitioned modules");

    self.flash_direct(direct, options.max_retries).await?;
    self.flash_via_update_request(via_update, options.max_retries).await?;
    Ok(())
  }

  /// A module goes through the primary transport iff it can flash that
  /// module type and write to its storage region; everything else falls
  /// back to the USB update-request transport. Input order is preserved
  /// within each partition.
  async fn partition(&self, modules: Vec<Module>) -> Result<(Vec<Module>, Vec<Module>)> {
    let mut transport = self.primary.open_by_id(&self.device_id).await?;
    let mut direct = Vec::new();
    let mut via_update = Vec::new();
    for module in modules {
      if transport.can_flash_module(&module, self.platform) && transport.can_write_to_flash(module.storage, self.platform) {
        direct.push(module);
      } else {
        via_update.push(module);
      }
    }
    transport.close().await?;
    Ok((direct, via_update))
  }

  /// A module slot marked required-encrypted that the candidate binary
  /// doesn't satisfy is skipped with a warning rather than flashed.
  fn should_skip_encrypted(&self, module: &Module) -> bool {
    match self.platform.storage_for_module(module.r#type, module.index) {
      Some(descriptor) => descriptor.encrypted && !module.encrypted,
      None => false,
    }
  }

  /// If `module.drop_header` is set, strip the leading `header_size` bytes
  /// into a sibling file under the per-device temp dir, memoized by source
  /// path so a retry doesn't re-materialize it.
  async fn materialize(&self, module: &Module, memo: &mut HashMap<PathBuf, PathBuf>) -> Result<PathBuf> {
    if !module.drop_header {
      return Ok(module.file_path.clone());
    }
    if let Some(existing) = memo.get(&module.file_path) {
      return Ok(existing.clone());
    }

    tokio::fs::create_dir_all(&self.temp_dir).await?;
    let file_name = module
      .file_path
      .file_name()
      .ok_or_else(|| Error::InvalidOperation(format!("module path has no file name: {}", module.file_path.display())))?;
    let dest = self.temp_dir.join(file_name);

    let data = tokio::fs::read(&module.file_path).await?;
    let trimmed = &data[(module.header_size as usize).min(data.len())..];
    tokio::fs::write(&dest, trimmed).await?;

    memo.insert(module.file_path.clone(), dest.clone());
    Ok(dest)
  }

  async fn flash_direct(&self, modules: Vec<Module>, max_retries: u32) -> Result<()> {
    if modules.is_empty() {
      return Ok(());
    }

    let mut remaining = modules;
    let mut retries_left = max_retries;
    let mut memo = HashMap::new();

    loop {
      let mut transport = self.primary.open_by_id(&self.device_id).await?;
      let attempt = self.run_direct_attempt(transport.as_mut(), &mut remaining, &mut memo).await;

      match attempt {
        Ok(()) => {
          transport.reset().await?;
          transport.close().await.ok();
          return Ok(());
        }
        Err(err) => {
          transport.close().await.ok();
          if retries_left == 0 || remaining.is_empty() {
            return Err(err);
          }
          retries_left -= 1;
          tracing::warn!(%err, retries_left, "direct flash attempt failed, retrying from the first unwritten module");
        }
      }
    }
  }

  async fn run_direct_attempt(
    &self,
    transport: &mut dyn DeviceTransport,
    remaining: &mut Vec<Module>,
    memo: &mut HashMap<PathBuf, PathBuf>,
  ) -> Result<()> {
    transport.prepare_to_flash().await?;
    while let Some(module) = remaining.first().cloned() {
      if self.should_skip_encrypted(&module) {
        tracing::warn!(module = ?module.r#type, index = ?module.index, "skipping module that requires encryption it does not have");
        remaining.remove(0);
        continue;
      }
      let file = self.materialize(&module, memo).await?;
      transport.write_to_flash(&file, module.storage, module.address, self.platform).await?;
      remaining.remove(0);
    }
    Ok(())
  }

  async fn flash_via_update_request(&self, modules: Vec<Module>, max_retries: u32) -> Result<()> {
    if modules.is_empty() {
      return Ok(());
    }

    tokio::time::sleep(UPDATE_REQUEST_SWITCH_WAIT).await;

    let mut remaining = modules;
    let mut retries_left = max_retries;
    let mut memo = HashMap::new();

    loop {
      let mut transport = self.open_update_request().await?;
      let attempt = self.run_update_request_attempt(&mut transport, &mut remaining, &mut memo).await;

      match attempt {
        Ok(()) => {
          transport.reset().await.ok();
          transport.close().await.ok();
          return Ok(());
        }
        Err(err) => {
          transport.close().await.ok();
          if retries_left == 0 || remaining.is_empty() {
            return Err(err);
          }
          retries_left -= 1;
          tracing::warn!(%err, retries_left, "update-request flash attempt failed, retrying from the first unwritten module");
        }
      }
    }
  }

  async fn open_update_request(&self) -> Result<Box<dyn DeviceTransport>> {
    match timeout(UPDATE_REQUEST_REOPEN_TIMEOUT, self.update_request.open_by_id(&self.device_id)).await {
      Ok(result) => result,
      Err(_) => Err(Error::CommandTimeout("re-opening device via the update-request transport".into())),
    }
  }

  async fn run_update_request_attempt(
    &self,
    transport: &mut Box<dyn DeviceTransport>,
    remaining: &mut Vec<Module>,
    memo: &mut HashMap<PathBuf, PathBuf>,
  ) -> Result<()> {
    transport.prepare_to_flash().await?;
    while let Some(module) = remaining.first().cloned() {
      if self.should_skip_encrypted(&module) {
        tracing::warn!(module = ?module.r#type, index = ?module.index, "skipping module that requires encryption it does not have");
        remaining.remove(0);
        continue;
      }
      let file = self.materialize(&module, memo).await?;
      let outcome = transport.flash_module(&module, &file).await?;
      remaining.remove(0);

      if outcome.reset_pending && !remaining.is_empty() {
        transport.close().await.ok();
        *transport = self.open_update_request().await?;
        transport.prepare_to_flash().await?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_retries_is_two() {
    assert_eq!(FlasherOptions::default().max_retries, 2);
  }
}
