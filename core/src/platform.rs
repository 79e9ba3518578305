//! Static catalog mapping platform id/name to MCU family, firmware module
//! layout, storage-to-alt-setting mapping, and debug-adapter configuration.
//!
//! Lifecycle: built once at startup (see [`catalog`]) and never mutated
//! afterwards, mirroring the teacher crate's `SUPERBIRD_PARTITIONS` static
//! table, generalized from one hardcoded board to an indexed table of them.

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::{module::ModuleType, Error, Result};

/// A storage region a module can be written into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
  InternalFlash,
  ExternalFlash,
  Factory,
}

impl StorageType {
  pub fn parse(raw: &str) -> Result<Self> {
    match raw {
      "internal_flash" => Ok(StorageType::InternalFlash),
      "external_flash" => Ok(StorageType::ExternalFlash),
      "factory" => Ok(StorageType::Factory),
      other => Err(Error::UnknownStorageType(other.to_string())),
    }
  }
}

/// The resolved storage region plus whether that slot requires encryption.
#[derive(Debug, Clone, Copy)]
pub struct StorageDescriptor {
  pub storage: StorageType,
  pub encrypted: bool,
}

/// A region reserved for the filesystem or device config table.
#[derive(Debug, Clone, Copy)]
pub struct Region {
  pub storage: StorageType,
  pub address: u32,
  pub size: u32,
}

/// Config needed to drive the debug-adapter transport against this
/// platform's MCU.
#[derive(Debug, Clone)]
pub struct DebugTargetConfig {
  /// openocd-style interface/target config file fragments.
  pub interface_cfg: String,
  pub target_cfg: String,
  /// Manufacturer string substring(s) returned by `dap info` that identify
  /// this MCU during debug-port auto-detection. Detection matches whichever
  /// platform's string appears first in the transcript, so these must be
  /// unique across the catalog even when every platform shares an MCU
  /// family — the onboard debug probe's product string carries the board
  /// name for exactly this reason.
  pub manufacturer_match: Vec<String>,
  /// Whether this MCU requires SRST asserted on connect.
  pub requires_srst: bool,
  /// `mdb <addr> <n>` read, or a custom Tcl procedure name, used to read the
  /// device id once connected.
  pub device_id_read: DeviceIdRead,
}

#[derive(Debug, Clone)]
pub enum DeviceIdRead {
  Memory { address: u32, length: u32, prefix: Option<String> },
  Procedure { name: String, pattern: String },
}

/// A class of hardware board: a fixed MCU family, storage layout, and
/// firmware module set.
#[derive(Debug, Clone)]
pub struct Platform {
  pub id: u16,
  pub name: &'static str,
  pub display_name: &'static str,
  pub mcu_family: &'static str,

  pub has_radio_stack: bool,
  pub has_ncp_firmware: bool,

  pub filesystem_region: Option<Region>,
  pub device_config_table: Option<Region>,
  pub debug_target: Option<DebugTargetConfig>,
  /// The `(vid, pid)` this platform's normal-mode (listening/DFU) firmware
  /// presents on the bus, used by the fleet coordinator's lightweight USB
  /// pre-probe to fill in `platform_id` before any transport is opened.
  pub usb_identity: Option<(u16, u16)>,

  storage_map: HashMap<(ModuleType, Option<u8>), StorageDescriptor>,
  alt_settings: HashMap<StorageType, u8>,
}

impl Platform {
  /// Select the unique module descriptor when the type has no indices, the
  /// match on index when multiple exist, or `None` if nothing matches.
  pub fn storage_for_module(&self, ty: ModuleType, index: Option<u8>) -> Option<StorageDescriptor> {
    if let Some(found) = self.storage_map.get(&(ty, index)) {
      return Some(*found);
    }
    if index.is_some() {
      return None;
    }
    // no index supplied: succeed only if there is exactly one descriptor
    // for this type across all indices.
    let mut matches = self.storage_map.iter().filter(|((t, _), _)| *t == ty);
    let first = matches.next()?;
    if matches.next().is_some() {
      return None;
    }
    Some(*first.1)
  }

  pub fn alt_setting(&self, storage: StorageType) -> Option<u8> {
    self.alt_settings.get(&storage).copied()
  }
}

/// Raw, externally-sourced description of a platform, as it would arrive
/// from a config file or registry payload. [`Platform::from_record`] is the
/// fallible constructor that turns this into a [`Platform`].
pub struct PlatformRecord {
  pub id: u16,
  pub name: &'static str,
  pub display_name: &'static str,
  pub mcu_family: &'static str,
  pub has_radio_stack: bool,
  pub has_ncp_firmware: bool,
  pub filesystem_region: Option<Region>,
  pub device_config_table: Option<Region>,
  pub debug_target: Option<DebugTargetConfig>,
  pub usb_identity: Option<(u16, u16)>,
  /// `(module type tag, optional index, storage type tag, encrypted)`.
  pub storage_entries: Vec<(&'static str, Option<u8>, &'static str, bool)>,
  /// `(storage type tag, alt-setting)`.
  pub alt_settings: Vec<(&'static str, u8)>,
}

impl Platform {
  pub fn from_record(record: PlatformRecord) -> Result<Self> {
    let mut storage_map = HashMap::new();
    for (ty_tag, index, storage_tag, encrypted) in record.storage_entries {
      let ty = ModuleType::parse(ty_tag)?;
      let storage = StorageType::parse(storage_tag)?;
      storage_map.insert((ty, index), StorageDescriptor { storage, encrypted });
    }

    let mut alt_settings = HashMap::new();
    for (storage_tag, alt) in record.alt_settings {
      let storage = StorageType::parse(storage_tag)?;
      alt_settings.insert(storage, alt);
    }

    Ok(Platform {
      id: record.id,
      name: record.name,
      display_name: record.display_name,
      mcu_family: record.mcu_family,
      has_radio_stack: record.has_radio_stack,
      has_ncp_firmware: record.has_ncp_firmware,
      filesystem_region: record.filesystem_region,
      device_config_table: record.device_config_table,
      debug_target: record.debug_target,
      usb_identity: record.usb_identity,
      storage_map,
      alt_settings,
    })
  }
}

/// The full set of known platforms, indexed for lookup by id and by name.
pub struct Catalog {
  by_id: HashMap<u16, Platform>,
  by_name: HashMap<&'static str, u16>,
}

impl Catalog {
  pub fn by_id(&self, id: u16) -> Result<&Platform> {
    self.by_id.get(&id).ok_or_else(|| Error::UnknownPlatform(id.to_string()))
  }

  pub fn by_name(&self, name: &str) -> Result<&Platform> {
    let id = self
      .by_name
      .get(name)
      .ok_or_else(|| Error::UnknownPlatform(name.to_string()))?;
    self.by_id(*id)
  }

  pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
    self.by_id.values()
  }
}

fn build_catalog() -> Catalog {
  let records = vec![
    PlatformRecord {
      id: 12,
      name: "argon",
      display_name: "Argon",
      mcu_family: "nrf52840",
      has_radio_stack: true,
      has_ncp_firmware: true,
      filesystem_region: None,
      device_config_table: Some(Region {
        storage: StorageType::InternalFlash,
        address: 0x0007_E000,
        size: 0x2000,
      }),
      debug_target: Some(DebugTargetConfig {
        interface_cfg: "interface/cmsis-dap.cfg".into(),
        target_cfg: "target/nrf52.cfg".into(),
        manufacturer_match: vec!["nRF52840-QFAA Argon".into()],
        requires_srst: false,
        device_id_read: DeviceIdRead::Memory {
          address: 0x1000_0060,
          length: 8,
          prefix: None,
        },
      }),
      usb_identity: Some((0x2b04, 0xc006)),
      storage_entries: vec![
        ("bootloader", None, "internal_flash", false),
        ("system_part", Some(1), "internal_flash", false),
        ("system_part", Some(2), "internal_flash", false),
        ("user_part", None, "internal_flash", false),
        ("radio_stack", None, "internal_flash", false),
        ("ncp_firmware", None, "external_flash", false),
      ],
      alt_settings: vec![("internal_flash", 0), ("external_flash", 1)],
    },
    PlatformRecord {
      id: 13,
      name: "boron",
      display_name: "Boron",
      mcu_family: "nrf52840",
      has_radio_stack: true,
      has_ncp_firmware: true,
      filesystem_region: None,
      device_config_table: Some(Region {
        storage: StorageType::InternalFlash,
        address: 0x0007_E000,
        size: 0x2000,
      }),
      debug_target: Some(DebugTargetConfig {
        interface_cfg: "interface/cmsis-dap.cfg".into(),
        target_cfg: "target/nrf52.cfg".into(),
        manufacturer_match: vec!["nRF52840-QFAA Boron".into()],
        requires_srst: false,
        device_id_read: DeviceIdRead::Memory {
          address: 0x1000_0060,
          length: 8,
          prefix: None,
        },
      }),
      usb_identity: Some((0x2b04, 0xd00a)),
      storage_entries: vec![
        ("bootloader", None, "internal_flash", false),
        ("system_part", Some(1), "internal_flash", false),
        ("system_part", Some(2), "internal_flash", false),
        ("user_part", None, "internal_flash", false),
        ("radio_stack", None, "internal_flash", false),
        ("ncp_firmware", None, "external_flash", false),
      ],
      alt_settings: vec![("internal_flash", 0), ("external_flash", 1)],
    },
    PlatformRecord {
      id: 14,
      name: "xenon",
      display_name: "Xenon",
      mcu_family: "nrf52840",
      has_radio_stack: true,
      has_ncp_firmware: false,
      filesystem_region: None,
      device_config_table: None,
      debug_target: Some(DebugTargetConfig {
        interface_cfg: "interface/cmsis-dap.cfg".into(),
        target_cfg: "target/nrf52.cfg".into(),
        manufacturer_match: vec!["nRF52840-QFAA Xenon".into()],
        requires_srst: false,
        device_id_read: DeviceIdRead::Memory {
          address: 0x1000_0060,
          length: 8,
          prefix: None,
        },
      }),
      usb_identity: Some((0x2b04, 0xc00c)),
      storage_entries: vec![
        ("bootloader", None, "internal_flash", false),
        ("system_part", Some(1), "internal_flash", false),
        ("system_part", Some(2), "internal_flash", false),
        ("user_part", None, "internal_flash", false),
        ("radio_stack", None, "internal_flash", false),
      ],
      alt_settings: vec![("internal_flash", 0)],
    },
    PlatformRecord {
      id: 25,
      name: "bsom",
      display_name: "B SoM",
      mcu_family: "nrf52840",
      has_radio_stack: true,
      has_ncp_firmware: true,
      filesystem_region: Some(Region {
        storage: StorageType::ExternalFlash,
        address: 0,
        size: 0x0100_0000,
      }),
      device_config_table: Some(Region {
        storage: StorageType::InternalFlash,
        address: 0x0007_E000,
        size: 0x2000,
      }),
      debug_target: Some(DebugTargetConfig {
        interface_cfg: "interface/cmsis-dap.cfg".into(),
        target_cfg: "target/nrf52.cfg".into(),
        manufacturer_match: vec!["nRF52840-QFAA B5SoM".into()],
        requires_srst: true,
        device_id_read: DeviceIdRead::Procedure {
          name: "read_som_id".into(),
          pattern: r"^ID:([0-9a-fA-F]+):([0-9a-fA-F]+)$".into(),
        },
      }),
      usb_identity: Some((0x2b04, 0xd021)),
      storage_entries: vec![
        ("bootloader", None, "internal_flash", false),
        ("system_part", Some(1), "internal_flash", false),
        ("system_part", Some(2), "internal_flash", false),
        ("user_part", None, "internal_flash", false),
        ("radio_stack", None, "internal_flash", false),
        ("ncp_firmware", None, "external_flash", false),
      ],
      alt_settings: vec![("internal_flash", 0), ("external_flash", 1)],
    },
    PlatformRecord {
      id: 26,
      name: "tracker",
      display_name: "Tracker One",
      mcu_family: "nrf52840",
      has_radio_stack: true,
      has_ncp_firmware: true,
      filesystem_region: Some(Region {
        storage: StorageType::ExternalFlash,
        address: 0,
        size: 0x0100_0000,
      }),
      device_config_table: Some(Region {
        storage: StorageType::InternalFlash,
        address: 0x0007_E000,
        size: 0x2000,
      }),
      debug_target: Some(DebugTargetConfig {
        interface_cfg: "interface/cmsis-dap.cfg".into(),
        target_cfg: "target/nrf52.cfg".into(),
        manufacturer_match: vec!["nRF52840-QFAA Tracker".into()],
        requires_srst: true,
        device_id_read: DeviceIdRead::Memory {
          address: 0x1000_0060,
          length: 8,
          prefix: Some("TR".into()),
        },
      }),
      usb_identity: Some((0x2b04, 0xd017)),
      storage_entries: vec![
        ("bootloader", None, "internal_flash", true),
        ("system_part", Some(1), "internal_flash", false),
        ("system_part", Some(2), "internal_flash", false),
        ("user_part", None, "internal_flash", false),
        ("radio_stack", None, "internal_flash", false),
        ("ncp_firmware", None, "external_flash", false),
      ],
      alt_settings: vec![("internal_flash", 0), ("external_flash", 1)],
    },
  ];

  let mut by_id = HashMap::new();
  let mut by_name = HashMap::new();
  for record in records {
    let id = record.id;
    let name = record.name;
    let platform = Platform::from_record(record).expect("builtin catalog records are well-formed");
    by_name.insert(name, id);
    by_id.insert(id, platform);
  }

  Catalog { by_id, by_name }
}

lazy_static! {
  pub static ref CATALOG: Catalog = build_catalog();
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn by_id_and_by_name_agree() {
    let by_id = CATALOG.by_id(13).unwrap();
    let by_name = CATALOG.by_name("boron").unwrap();
    assert_eq!(by_id.id, by_name.id);
  }

  #[test]
  fn every_built_in_platform_has_a_distinct_usb_identity() {
    let identities: Vec<(u16, u16)> = CATALOG.platforms().filter_map(|p| p.usb_identity).collect();
    assert_eq!(identities.len(), CATALOG.platforms().count());
    let unique: std::collections::HashSet<_> = identities.iter().collect();
    assert_eq!(unique.len(), identities.len());
  }

  #[test]
  fn every_built_in_platform_has_a_distinct_manufacturer_match() {
    let strings: Vec<&str> = CATALOG
      .platforms()
      .filter_map(|p| p.debug_target.as_ref())
      .flat_map(|t| t.manufacturer_match.iter().map(String::as_str))
      .collect();
    let unique: std::collections::HashSet<_> = strings.iter().collect();
    assert_eq!(unique.len(), strings.len(), "manufacturer_match strings must not collide across platforms");
  }

  #[test]
  fn unknown_platform_is_an_error() {
    assert!(matches!(CATALOG.by_id(9999), Err(Error::UnknownPlatform(_))));
    assert!(matches!(CATALOG.by_name("nope"), Err(Error::UnknownPlatform(_))));
  }

  #[test]
  fn storage_for_module_resolves_indexed_entries() {
    let boron = CATALOG.by_id(13).unwrap();
    let part1 = boron.storage_for_module(ModuleType::SystemPart, Some(1)).unwrap();
    let part2 = boron.storage_for_module(ModuleType::SystemPart, Some(2)).unwrap();
    assert_eq!(part1.storage, part2.storage);
    assert!(boron.storage_for_module(ModuleType::SystemPart, Some(9)).is_none());
  }

  #[test]
  fn storage_for_module_resolves_unique_untagged_entry() {
    let boron = CATALOG.by_id(13).unwrap();
    let bootloader = boron.storage_for_module(ModuleType::Bootloader, None).unwrap();
    assert_eq!(bootloader.storage, StorageType::InternalFlash);
  }

  #[test]
  fn alt_setting_lookup() {
    let boron = CATALOG.by_id(13).unwrap();
    assert_eq!(boron.alt_setting(StorageType::InternalFlash), Some(0));
    assert_eq!(boron.alt_setting(StorageType::Factory), None);
  }

  #[test]
  fn unknown_module_type_fails_construction() {
    let record = PlatformRecord {
      id: 999,
      name: "bogus",
      display_name: "Bogus",
      mcu_family: "none",
      has_radio_stack: false,
      has_ncp_firmware: false,
      filesystem_region: None,
      device_config_table: None,
      debug_target: None,
      usb_identity: None,
      storage_entries: vec![("not_a_real_type", None, "internal_flash", false)],
      alt_settings: vec![],
    };
    assert!(matches!(Platform::from_record(record), Err(Error::UnknownModuleType(_))));
  }

  #[test]
  fn unknown_storage_type_fails_construction() {
    let record = PlatformRecord {
      id: 998,
      name: "bogus2",
      display_name: "Bogus2",
      mcu_family: "none",
      has_radio_stack: false,
      has_ncp_firmware: false,
      filesystem_region: None,
      device_config_table: None,
      debug_target: None,
      usb_identity: None,
      storage_entries: vec![("bootloader", None, "not_a_real_storage", false)],
      alt_settings: vec![],
    };
    assert!(matches!(Platform::from_record(record), Err(Error::UnknownStorageType(_))));
  }
}
