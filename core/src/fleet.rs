//! Fleet Coordinator: enumerates candidate devices across whichever
//! transports are configured, reconciles identity against the device
//! registry, and dispatches one [`crate::flasher::Flasher`] per device
//! under bounded parallelism, propagating the first failure without
//! aborting the others.

use std::collections::HashMap;
use std::path::PathBuf;

use futures::stream::{self, StreamExt};

use crate::device::{Device, DeviceId};
use crate::flasher::{Flasher, FlasherOptions};
use crate::module::Module;
use crate::platform::CATALOG;
use crate::registry::{self, RegistryClient};
use crate::transport::DeviceDiscovery;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct FleetOptions {
  pub max_retries: u32,
  /// `None` means unbounded (spec's default).
  pub max_jobs: Option<usize>,
}

impl Default for FleetOptions {
  fn default() -> Self {
    FleetOptions {
      max_retries: 2,
      max_jobs: None,
    }
  }
}

/// A user-requested target, before local/registry reconciliation.
#[derive(Debug, Clone)]
pub enum TargetSelector {
  Id(DeviceId),
  Name(String),
}

#[derive(Debug, Clone)]
pub struct TargetRequest {
  pub selector: TargetSelector,
  pub platform_hint: Option<u16>,
}

pub struct Fleet<'a> {
  /// The debug-adapter transport if configured, else the raw programmer,
  /// else the USB update-request transport: whichever one the fleet was
  /// configured to enumerate against.
  pub primary: &'a dyn DeviceDiscovery,
  /// Always the USB update-request transport; used by the Flasher as the
  /// fallback for modules the primary transport can't write directly.
  pub update_request: &'a dyn DeviceDiscovery,
  /// A lightweight USB-level pre-probe used only to fill in `platform_id`
  /// before the primary transport is asked to open each device.
  pub usb_probe: &'a dyn DeviceDiscovery,
  pub registry: Option<&'a RegistryClient>,
  pub temp_root: PathBuf,
}

impl<'a> Fleet<'a> {
  pub async fn enumerate_devices(&self, options: FleetOptions) -> Result<Vec<Device>> {
    let probed: HashMap<DeviceId, Option<u16>> = self.usb_probe.list().await?.into_iter().collect();
    let candidates = self.primary.list().await?;
    let max_jobs = options.max_jobs.unwrap_or(usize::MAX);

    let results: Vec<Option<Device>> = stream::iter(candidates)
      .map(|(id, platform_hint)| {
        let platform_id = platform_hint.or_else(|| probed.get(&id).copied().flatten());
        async move { self.open_and_interrogate(id, platform_id, options.max_retries).await }
      })
      .buffer_unordered(max_jobs)
      .collect()
      .await;

    let devices: Vec<Device> = results.into_iter().flatten().collect();
    if devices.is_empty() {
      return Err(Error::NoDevicesFound);
    }
    Ok(devices)
  }

  async fn open_and_interrogate(&self, id: DeviceId, platform_id: Option<u16>, max_retries: u32) -> Option<Device> {
    let mut retries_left = max_retries;
    loop {
      match self.primary.open_by_id(&id).await {
        Ok(mut transport) => {
          let _ = transport.close().await;
          return Some(Device::new(id, platform_id));
        }
        Err(err) => {
          if retries_left == 0 {
            tracing::warn!(device = %id, %err, "giving up on device after exhausting retries during enumeration");
            return None;
          }
          retries_left -= 1;
        }
      }
    }
  }

  /// Resolve user-requested targets against the locally enumerated set.
  /// Unknown ids fail immediately. Names, and ids whose platform is still
  /// unknown locally, trigger a single registry call.
  pub async fn resolve_targets(&self, local: &[Device], requested: &[TargetRequest]) -> Result<Vec<Device>> {
    let local_by_id: HashMap<&DeviceId, &Device> = local.iter().map(|d| (&d.id, d)).collect();

    for request in requested {
      if let TargetSelector::Id(id) = &request.selector {
        if !local_by_id.contains_key(id) {
          return Err(Error::DeviceNotFound(id.to_string()));
        }
      }
    }

    let names: Vec<String> = requested
      .iter()
      .filter_map(|request| match &request.selector {
        TargetSelector::Name(name) => Some(name.clone()),
        TargetSelector::Id(_) => None,
      })
      .collect();
    let unknown_platform_ids: Vec<String> = requested
      .iter()
      .filter_map(|request| match &request.selector {
        TargetSelector::Id(id) if local_by_id.get(id).map(|d| d.platform_id.is_none()).unwrap_or(false) => Some(id.to_string()),
        _ => None,
      })
      .collect();

    let registry_devices = match self.registry {
      Some(client) => registry::resolve_names_and_platforms(client, &names, &unknown_platform_ids).await?,
      None => Vec::new(),
    };

    let mut resolved = Vec::new();
    for request in requested {
      let mut device = match &request.selector {
        TargetSelector::Id(id) => (*local_by_id.get(id).expect("checked above")).clone(),
        TargetSelector::Name(name) => {
          let entry = registry_devices
            .iter()
            .find(|d| d.name.as_deref() == Some(name.as_str()))
            .ok_or_else(|| Error::DeviceNotFound(name.clone()))?;
          let id: DeviceId = entry.id.parse()?;
          local_by_id.get(&id).map(|d| (*d).clone()).unwrap_or_else(|| Device::new(id, entry.platform_id))
        }
      };

      if device.platform_id.is_none() {
        device.platform_id = request
          .platform_hint
          .or_else(|| registry_devices.iter().find(|d| d.id.as_str() == device.id.as_str()).and_then(|d| d.platform_id));
      }

      if device.platform_id.is_none() {
        return Err(Error::UnknownPlatform(device.id.to_string()));
      }
      resolved.push(device);
    }
    Ok(resolved)
  }

  /// Run one Flasher per device under bounded parallelism. Every device
  /// reaches a terminal state regardless of earlier failures; the first
  /// captured error becomes this call's result.
  pub async fn dispatch(&self, devices: Vec<Device>, modules_by_platform: &HashMap<u16, Vec<Module>>, options: FleetOptions) -> Result<()> {
    let max_jobs = options.max_jobs.unwrap_or(usize::MAX);

    let results: Vec<Result<()>> = stream::iter(devices)
      .map(|device| {
        let modules = device
          .platform_id
          .and_then(|id| modules_by_platform.get(&id))
          .cloned()
          .unwrap_or_default();
        let temp_dir = self.temp_root.join(device.id.as_str());
        async move {
          let platform_id = device.platform_id.ok_or_else(|| Error::UnknownPlatform(device.id.to_string()))?;
          let platform = CATALOG.by_id(platform_id)?;
          let flasher = Flasher::new(device.id.clone(), platform, self.primary, self.update_request, temp_dir);
          flasher
            .run(modules, FlasherOptions { max_retries: options.max_retries })
            .await
        }
      })
      .buffer_unordered(max_jobs)
      .collect()
      .await;

    let mut first_error = None;
    for result in results {
      if let Err(err) = result {
        tracing::error!(%err, "device flashing failed");
        if first_error.is_none() {
          first_error = Some(err);
        }
      }
    }
    match first_error {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_options_are_unbounded_jobs_with_two_retries() {
    let options = FleetOptions::default();
    assert_eq!(options.max_retries, 2);
    assert!(options.max_jobs.is_none());
  }
}
