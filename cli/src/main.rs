mod monitoring;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;

use boardflash_core::cache::{ModuleCache, ReleaseOptions};
use boardflash_core::device::DeviceId;
use boardflash_core::fleet::{Fleet, FleetOptions, TargetRequest, TargetSelector};
use boardflash_core::module::ModuleType;
use boardflash_core::registry::RegistryClient;
use boardflash_core::release::ReleaseClient;
use boardflash_core::transport::debug_adapter::{AdapterIdentity, DebugAdapterDiscovery};
use boardflash_core::transport::raw::{ProgrammerIdentity, RawProgrammerDiscovery};
use boardflash_core::transport::usb::{UpdateRequestDiscovery, UpdateRequestIdentity, UsbPlatformProbe};
use boardflash_core::transport::DeviceDiscovery;
use boardflash_core::Module;

const DEFAULT_RELEASE_API: &str = "https://api.github.com/repos/particle-iot/device-os";
const DEFAULT_PROGRAMMER_PATH: &str = "particle-usb-programmer";
const DEFAULT_DAEMON_PATH: &str = "openocd";
const APP_NAME: &str = "boardflash";

/// DFU-mode identity Particle's Gen3 (STM32-based) boards present while the
/// raw programmer is writing to them.
const DFU_IDENTITY: ProgrammerIdentity = ProgrammerIdentity { vid: 0x0483, pid: 0xdf11 };

#[derive(Parser, Debug)]
#[command(
  name = "boardflash",
  version,
  about = "flash fleets of embedded development boards",
  long_about = None
)]
#[allow(dead_code)]
struct Args {
  /// A release version (`v<semver>` or `<semver>`), or a path to a
  /// directory, zip archive, or single binary of firmware modules.
  target: String,

  /// Flash a specific device: `<id-or-name>` or `<id-or-name>:<platform>`.
  /// Repeatable.
  #[arg(short, long = "device", value_name = "ID-OR-NAME[:PLATFORM]")]
  devices: Vec<String>,

  /// Flash every device this fleet can see, instead of an explicit list.
  #[arg(long)]
  all_devices: bool,

  /// Use the debug-adapter daemon as the primary transport instead of the
  /// raw programmer.
  #[arg(long, conflicts_with = "usb")]
  openocd: bool,

  /// Use the USB update-request transport as the primary transport instead
  /// of the raw programmer.
  #[arg(long, conflicts_with = "openocd")]
  usb: bool,

  #[arg(long)]
  system: bool,
  #[arg(long = "no-system")]
  no_system: bool,

  #[arg(long)]
  user: bool,
  #[arg(long = "no-user")]
  no_user: bool,

  #[arg(long)]
  bootloader: bool,
  #[arg(long = "no-bootloader")]
  no_bootloader: bool,

  #[arg(long)]
  ncp: bool,
  #[arg(long = "no-ncp")]
  no_ncp: bool,

  #[arg(long)]
  radio: bool,
  #[arg(long = "no-radio")]
  no_radio: bool,

  /// Allow resolving draft releases (requires GITHUB_TOKEN).
  #[arg(long)]
  draft: bool,

  /// Bypass the on-disk release cache.
  #[arg(long = "no-cache")]
  no_cache: bool,

  /// Retries per device before giving up on it.
  #[arg(short, long, default_value_t = 2)]
  retries: u32,

  /// Maximum devices flashed concurrently. Unbounded if omitted.
  #[arg(short, long)]
  jobs: Option<usize>,

  /// Increase logging verbosity. Repeatable.
  #[arg(short, action = clap::ArgAction::Count)]
  verbose: u8,
}

impl Args {
  fn module_filter(&self) -> ModuleFilter {
    ModuleFilter {
      system: !self.no_system,
      user: !self.no_user,
      bootloader: !self.no_bootloader,
      ncp: !self.no_ncp,
      radio: !self.no_radio,
    }
  }
}

struct ModuleFilter {
  system: bool,
  user: bool,
  bootloader: bool,
  ncp: bool,
  radio: bool,
}

impl ModuleFilter {
  fn allows(&self, ty: ModuleType) -> bool {
    match ty {
      ModuleType::SystemPart => self.system,
      ModuleType::UserPart => self.user,
      ModuleType::Bootloader => self.bootloader,
      ModuleType::NcpFirmware => self.ncp,
      ModuleType::RadioStack => self.radio,
    }
  }
}

fn parse_device_request(raw: &str) -> anyhow::Result<TargetRequest> {
  let (selector_str, platform_hint) = match raw.split_once(':') {
    Some((id, platform)) => (id, Some(resolve_platform_hint(platform)?)),
    None => (raw, None),
  };

  let selector = match selector_str.parse::<DeviceId>() {
    Ok(id) => TargetSelector::Id(id),
    Err(_) => TargetSelector::Name(selector_str.to_string()),
  };

  Ok(TargetRequest { selector, platform_hint })
}

fn resolve_platform_hint(platform: &str) -> anyhow::Result<u16> {
  if let Ok(id) = platform.parse::<u16>() {
    return Ok(id);
  }
  Ok(boardflash_core::platform::CATALOG.by_name(platform)?.id)
}

#[tokio::main]
async fn main() -> ExitCode {
  let args = Args::parse();
  monitoring::init_logger(args.verbose);

  match run(args).await {
    Ok(()) => {
      tracing::info!("done!");
      ExitCode::SUCCESS
    }
    Err(err) => {
      tracing::error!("{err:?}");
      ExitCode::FAILURE
    }
  }
}

async fn run(args: Args) -> anyhow::Result<()> {
  let filter = args.module_filter();

  let home = dirs::home_dir().context("could not determine home directory")?;
  let cache_dir = home.join(".particle").join(APP_NAME).join("binaries");
  let temp_root = std::env::temp_dir().join(format!("{APP_NAME}-{}", std::process::id()));
  let assets_dir = temp_root.join("bundled-assets");
  tokio::fs::create_dir_all(&temp_root).await.ok();

  let release_api = std::env::var("BOARDFLASH_RELEASE_API").unwrap_or_else(|_| DEFAULT_RELEASE_API.to_string());
  let github_token = std::env::var("GITHUB_TOKEN").ok();
  if args.draft && github_token.is_none() {
    bail!("--draft requires GITHUB_TOKEN to be set");
  }

  let release_client = ReleaseClient::new(release_api, github_token);
  let cache = ModuleCache::new(cache_dir, temp_root.clone(), assets_dir, release_client);

  let target_path = PathBuf::from(&args.target);
  let all_modules = if target_path.exists() {
    cache.get_modules_from_path(&target_path)?
  } else {
    let version = args.target.trim_start_matches('v');
    cache
      .get_release_modules(
        version,
        ReleaseOptions {
          no_cache: args.no_cache,
          draft: args.draft,
        },
      )
      .await?
  };

  let modules: Vec<Module> = all_modules.into_iter().filter(|m| filter.allows(m.r#type)).collect();
  if modules.is_empty() {
    bail!("no modules left to flash after applying module-type filters");
  }

  let mut modules_by_platform: HashMap<u16, Vec<Module>> = HashMap::new();
  for module in modules {
    modules_by_platform.entry(module.platform_id).or_default().push(module);
  }

  let programmer_path = std::env::var("BOARDFLASH_PROGRAMMER").unwrap_or_else(|_| DEFAULT_PROGRAMMER_PATH.to_string());
  let daemon_path = std::env::var("BOARDFLASH_OPENOCD").unwrap_or_else(|_| DEFAULT_DAEMON_PATH.to_string());

  let usb_identities: Vec<UpdateRequestIdentity> = boardflash_core::platform::CATALOG
    .platforms()
    .filter_map(|p| p.usb_identity)
    .map(|(vid, pid)| UpdateRequestIdentity { vid, pid })
    .collect();

  let raw_discovery = RawProgrammerDiscovery::new(programmer_path, vec![DFU_IDENTITY]);
  let debug_discovery = DebugAdapterDiscovery::new(daemon_path, AdapterIdentity::default());
  let update_request_discovery = UpdateRequestDiscovery::new(usb_identities);
  let usb_probe = UsbPlatformProbe;

  // Primary transport is debug-adapter if configured, else raw-programmer,
  // else USB.
  let primary: &dyn DeviceDiscovery = if args.openocd {
    &debug_discovery
  } else if args.usb {
    &update_request_discovery
  } else {
    &raw_discovery
  };

  let registry_client = RegistryClient::from_environment().ok();
  if registry_client.is_none() && args.devices.iter().any(|d| !d.contains(':')) {
    tracing::warn!("no device-registry credentials found; device names will only resolve against locally enumerated ids");
  }

  let fleet = Fleet {
    primary,
    update_request: &update_request_discovery,
    usb_probe: &usb_probe,
    registry: registry_client.as_ref(),
    temp_root: temp_root.clone(),
  };

  let fleet_options = FleetOptions {
    max_retries: args.retries,
    max_jobs: args.jobs,
  };

  let local_devices = fleet.enumerate_devices(fleet_options).await?;

  let targets = if args.all_devices {
    local_devices.clone()
  } else {
    if args.devices.is_empty() {
      bail!("no devices selected: pass --device/-d at least once, or --all-devices");
    }
    let requests: anyhow::Result<Vec<TargetRequest>> = args.devices.iter().map(|raw| parse_device_request(raw)).collect();
    fleet.resolve_targets(&local_devices, &requests?).await?
  };

  tracing::info!(count = targets.len(), "flashing devices");
  fleet.dispatch(targets, &modules_by_platform, fleet_options).await?;

  let _ = tokio::fs::remove_dir_all(&temp_root).await;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn module_filter_defaults_to_allowing_everything() {
    let filter = ModuleFilter {
      system: true,
      user: true,
      bootloader: true,
      ncp: true,
      radio: true,
    };
    assert!(filter.allows(ModuleType::SystemPart));
    assert!(filter.allows(ModuleType::UserPart));
    assert!(filter.allows(ModuleType::Bootloader));
    assert!(filter.allows(ModuleType::NcpFirmware));
    assert!(filter.allows(ModuleType::RadioStack));
  }

  #[test]
  fn module_filter_excludes_disabled_types_only() {
    let filter = ModuleFilter {
      system: true,
      user: true,
      bootloader: false,
      ncp: true,
      radio: false,
    };
    assert!(!filter.allows(ModuleType::Bootloader));
    assert!(!filter.allows(ModuleType::RadioStack));
    assert!(filter.allows(ModuleType::SystemPart));
  }

  #[test]
  fn device_request_without_colon_has_no_platform_hint() {
    let request = parse_device_request("e00fce68f35356a1b1334f6e").unwrap();
    assert!(request.platform_hint.is_none());
    assert!(matches!(request.selector, TargetSelector::Id(_)));
  }

  #[test]
  fn device_request_with_non_hex_selector_is_a_name() {
    let request = parse_device_request("my-desk-unit").unwrap();
    assert!(matches!(request.selector, TargetSelector::Name(name) if name == "my-desk-unit"));
  }

  #[test]
  fn device_request_with_numeric_platform_suffix_is_parsed_directly() {
    let request = parse_device_request("my-desk-unit:13").unwrap();
    assert_eq!(request.platform_hint, Some(13));
  }

  #[test]
  fn device_request_with_platform_name_suffix_resolves_against_the_catalog() {
    let request = parse_device_request("my-desk-unit:boron").unwrap();
    assert_eq!(request.platform_hint, Some(13));
  }

  #[test]
  fn device_request_with_unknown_platform_name_fails() {
    assert!(parse_device_request("my-desk-unit:not-a-real-platform").is_err());
  }
}
