//! Canonical, catalog-resolved representation of a firmware module binary,
//! and the thin wrapper around the `module-format` crate that produces it.
//!
//! The core never parses header bytes itself (see the project's Non-goals);
//! it only resolves a parsed [`module_format::ModuleHeader`] against the
//! [`crate::platform::Catalog`].

use std::path::{Path, PathBuf};

use crate::platform::{Catalog, StorageType};
use crate::{Error, Result};

/// The kind of firmware module, as distinguished in the platform catalog's
/// storage map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleType {
  UserPart,
  SystemPart,
  Bootloader,
  RadioStack,
  NcpFirmware,
}

impl ModuleType {
  pub fn parse(raw: &str) -> Result<Self> {
    match raw {
      "user_part" => Ok(ModuleType::UserPart),
      "system_part" => Ok(ModuleType::SystemPart),
      "bootloader" => Ok(ModuleType::Bootloader),
      "radio_stack" => Ok(ModuleType::RadioStack),
      "ncp_firmware" => Ok(ModuleType::NcpFirmware),
      other => Err(Error::UnknownModuleType(other.to_string())),
    }
  }

  fn from_function(function: module_format::ModuleFunction) -> Option<Self> {
    use module_format::ModuleFunction as F;
    match function {
      F::UserPart => Some(ModuleType::UserPart),
      F::SystemPart => Some(ModuleType::SystemPart),
      F::Bootloader => Some(ModuleType::Bootloader),
      F::RadioStack => Some(ModuleType::RadioStack),
      F::NcpFirmware => Some(ModuleType::NcpFirmware),
      F::MonoFirmware | F::ResourceModule | F::Settings | F::Unknown(_) => None,
    }
  }
}

/// A firmware module binary, ready to flash.
///
/// Invariant: `(platform_id, type, index)` is unique within a resolved
/// module set (enforced by [`crate::cache`], not by this type itself).
#[derive(Debug, Clone)]
pub struct Module {
  pub platform_id: u16,
  pub r#type: ModuleType,
  pub index: Option<u8>,
  pub version: u32,
  pub storage: StorageType,
  pub address: u32,
  pub module_size: u32,
  pub header_size: u16,
  pub drop_header: bool,
  pub encrypted: bool,
  pub needs_to_be_encrypted: bool,
  pub crc_valid: bool,
  pub file_size: u64,
  pub file_path: PathBuf,
}

/// Outcome of attempting to parse a candidate file as a module.
pub enum ParseOutcome {
  Module(Module),
  /// Parsed fine, but the module function is deliberately unsupported
  /// (`mono_firmware`, `resource`, `settings`) or unrecognized. Callers
  /// should log a warning and move on rather than fail the whole resolve.
  Skipped { reason: String },
}

/// Parse a candidate firmware file at `path` into a [`Module`], resolving
/// its header against `catalog`.
pub fn parse_module_file(path: &Path, catalog: &Catalog) -> Result<ParseOutcome> {
  let data = std::fs::read(path)?;
  let header = module_format::parse(&data).map_err(|source| Error::ParseFailed {
    path: path.to_path_buf(),
    source,
  })?;

  if header.module_function.is_skippable() {
    return Ok(ParseOutcome::Skipped {
      reason: format!("unsupported module function: {}", header.module_function),
    });
  }

  let Some(ty) = ModuleType::from_function(header.module_function) else {
    return Ok(ParseOutcome::Skipped {
      reason: format!("unknown module function: {}", header.module_function),
    });
  };

  let platform = catalog.by_id(header.platform_id)?;
  let index = if header.module_index == 0 {
    None
  } else {
    Some(header.module_index)
  };

  let descriptor = platform
    .storage_for_module(ty, index)
    .ok_or(Error::StorageUnknown)?;

  if !header.crc_valid {
    tracing::warn!(path = %path.display(), "module CRC does not match; flashing anyway");
  }

  Ok(ParseOutcome::Module(Module {
    platform_id: header.platform_id,
    r#type: ty,
    index,
    version: header.module_version as u32,
    storage: descriptor.storage,
    address: header.start_address,
    module_size: header.module_size(),
    header_size: header.header_size,
    drop_header: header.drop_header(),
    encrypted: header.encrypted(),
    needs_to_be_encrypted: descriptor.encrypted,
    crc_valid: header.crc_valid,
    file_size: data.len() as u64,
    file_path: path.to_path_buf(),
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::CATALOG;
  use module_format::PREFIX_HEADER_LEN;

  fn write_module(dir: &Path, function: u8, platform_id: u16, index: u8, version: u16, flags: u8) -> PathBuf {
    let mut buf = vec![0u8; PREFIX_HEADER_LEN];
    buf[0..4].copy_from_slice(&0x0800_0000u32.to_le_bytes());
    buf[4..8].copy_from_slice(&0x0800_0FFCu32.to_le_bytes());
    buf[9] = function;
    buf[10] = index;
    buf[11] = flags;
    buf[12..14].copy_from_slice(&version.to_le_bytes());
    buf[14..16].copy_from_slice(&platform_id.to_le_bytes());
    buf[16..18].copy_from_slice(&(PREFIX_HEADER_LEN as u16).to_le_bytes());
    buf.extend_from_slice(&[0xCC; 32]);
    // CRC is deliberately wrong; parsing must still succeed (warning only).
    buf.extend_from_slice(&0u32.to_le_bytes());

    let path = dir.join("module.bin");
    std::fs::write(&path, &buf).unwrap();
    path
  }

  #[test]
  fn parses_a_valid_user_part() {
    let dir = tempdir();
    let path = write_module(dir.path(), 5, 13, 0, 42, 0);
    match parse_module_file(&path, &CATALOG).unwrap() {
      ParseOutcome::Module(m) => {
        assert_eq!(m.platform_id, 13);
        assert_eq!(m.r#type, ModuleType::UserPart);
        assert_eq!(m.index, None);
        assert_eq!(m.version, 42);
        assert!(!m.crc_valid);
      }
      ParseOutcome::Skipped { reason } => panic!("unexpected skip: {reason}"),
    }
  }

  #[test]
  fn skips_resource_modules() {
    let dir = tempdir();
    let path = write_module(dir.path(), 1, 13, 0, 1, 0);
    match parse_module_file(&path, &CATALOG).unwrap() {
      ParseOutcome::Skipped { .. } => {}
      ParseOutcome::Module(_) => panic!("resource modules should be skipped"),
    }
  }

  #[test]
  fn skips_unknown_functions() {
    let dir = tempdir();
    let path = write_module(dir.path(), 200, 13, 0, 1, 0);
    match parse_module_file(&path, &CATALOG).unwrap() {
      ParseOutcome::Skipped { .. } => {}
      ParseOutcome::Module(_) => panic!("unknown functions should be skipped"),
    }
  }

  #[test]
  fn unknown_platform_fails() {
    let dir = tempdir();
    let path = write_module(dir.path(), 5, 9999, 0, 1, 0);
    assert!(matches!(parse_module_file(&path, &CATALOG), Err(Error::UnknownPlatform(_))));
  }

  #[test]
  fn indexed_system_parts_resolve_by_index() {
    let dir = tempdir();
    let path = write_module(dir.path(), 4, 13, 1, 1, 0);
    match parse_module_file(&path, &CATALOG).unwrap() {
      ParseOutcome::Module(m) => assert_eq!(m.index, Some(1)),
      ParseOutcome::Skipped { reason } => panic!("unexpected skip: {reason}"),
    }
  }

  fn tempdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
  }
}
