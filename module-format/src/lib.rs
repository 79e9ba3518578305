//! Parser for the fixed-size prefix header embedded at the start of every
//! device-os firmware module binary.
//!
//! This crate knows nothing about platforms, storage regions, or caching —
//! it only turns a byte slice into a [`ModuleHeader`]. Higher layers (the
//! `boardflash-core` module metadata parser) are responsible for resolving
//! the header's `platform_id` and `module_function` against a platform
//! catalog.

use std::fmt;

/// Number of bytes occupied by the prefix header at the start of a module
/// binary.
pub const PREFIX_HEADER_LEN: usize = 20;

/// The tag stored in the header's `module_function` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFunction {
  ResourceModule,
  Bootloader,
  MonoFirmware,
  SystemPart,
  UserPart,
  Settings,
  NcpFirmware,
  RadioStack,
  Unknown(u8),
}

impl ModuleFunction {
  fn from_raw(raw: u8) -> Self {
    match raw {
      1 => ModuleFunction::ResourceModule,
      2 => ModuleFunction::Bootloader,
      3 => ModuleFunction::MonoFirmware,
      4 => ModuleFunction::SystemPart,
      5 => ModuleFunction::UserPart,
      6 => ModuleFunction::Settings,
      7 => ModuleFunction::NcpFirmware,
      8 => ModuleFunction::RadioStack,
      other => ModuleFunction::Unknown(other),
    }
  }

  /// Module functions that are recognized but deliberately not flashable.
  pub fn is_skippable(&self) -> bool {
    matches!(
      self,
      ModuleFunction::MonoFirmware | ModuleFunction::ResourceModule | ModuleFunction::Settings
    )
  }
}

impl fmt::Display for ModuleFunction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModuleFunction::ResourceModule => write!(f, "resource"),
      ModuleFunction::Bootloader => write!(f, "bootloader"),
      ModuleFunction::MonoFirmware => write!(f, "mono_firmware"),
      ModuleFunction::SystemPart => write!(f, "system_part"),
      ModuleFunction::UserPart => write!(f, "user_part"),
      ModuleFunction::Settings => write!(f, "settings"),
      ModuleFunction::NcpFirmware => write!(f, "ncp_firmware"),
      ModuleFunction::RadioStack => write!(f, "radio_stack"),
      ModuleFunction::Unknown(raw) => write!(f, "unknown(0x{raw:02x})"),
    }
  }
}

/// Flag bits stored in the header's `flags` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
  pub const DROP_HEADER: u8 = 0b0000_0001;
  pub const ENCRYPTED: u8 = 0b0000_0010;
  pub const NEEDS_TO_BE_ENCRYPTED: u8 = 0b0000_0100;

  fn from_bits_truncate(bits: u8) -> Self {
    HeaderFlags(bits & (Self::DROP_HEADER | Self::ENCRYPTED | Self::NEEDS_TO_BE_ENCRYPTED))
  }

  fn contains(&self, bit: u8) -> bool {
    self.0 & bit != 0
  }
}

/// A parsed prefix header, plus the CRC check performed against the trailing
/// 4 bytes of the file.
#[derive(Debug, Clone)]
pub struct ModuleHeader {
  pub start_address: u32,
  pub end_address: u32,
  pub module_function: ModuleFunction,
  pub module_index: u8,
  pub module_version: u16,
  pub platform_id: u16,
  pub header_size: u16,
  pub flags: HeaderFlags,
  /// Whether the trailing CRC32 matched the computed checksum over the rest
  /// of the file. A mismatch is a warning, never a parse failure.
  pub crc_valid: bool,
}

impl ModuleHeader {
  pub fn drop_header(&self) -> bool {
    self.flags.contains(HeaderFlags::DROP_HEADER)
  }

  pub fn encrypted(&self) -> bool {
    self.flags.contains(HeaderFlags::ENCRYPTED)
  }

  pub fn needs_to_be_encrypted(&self) -> bool {
    self.flags.contains(HeaderFlags::NEEDS_TO_BE_ENCRYPTED)
  }

  /// `end - start + 4`, the module size including its trailing CRC.
  pub fn module_size(&self) -> u32 {
    self.end_address.saturating_sub(self.start_address) + 4
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
  #[error("file is too short to contain a module header ({0} bytes)")]
  Truncated(usize),
}

/// Parse the prefix header out of a module binary's full contents.
///
/// The header occupies the first [`PREFIX_HEADER_LEN`] bytes; the CRC is the
/// little-endian u32 stored in the final 4 bytes of `data`.
pub fn parse(data: &[u8]) -> Result<ModuleHeader, ParseError> {
  if data.len() < PREFIX_HEADER_LEN + 4 {
    return Err(ParseError::Truncated(data.len()));
  }

  let start_address = u32::from_le_bytes(data[0..4].try_into().unwrap());
  let end_address = u32::from_le_bytes(data[4..8].try_into().unwrap());
  // data[8] is reserved
  let module_function = ModuleFunction::from_raw(data[9]);
  let module_index = data[10];
  let flags = HeaderFlags::from_bits_truncate(data[11]);
  let module_version = u16::from_le_bytes(data[12..14].try_into().unwrap());
  let platform_id = u16::from_le_bytes(data[14..16].try_into().unwrap());
  let header_size = u16::from_le_bytes(data[16..18].try_into().unwrap());
  // data[18..20] is reserved

  let stored_crc = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
  let computed_crc = crc32(&data[..data.len() - 4]);

  Ok(ModuleHeader {
    start_address,
    end_address,
    module_function,
    module_index,
    module_version,
    platform_id,
    header_size,
    flags,
    crc_valid: stored_crc == computed_crc,
  })
}

/// Table-based CRC32 (IEEE 802.3 polynomial), computed by hand so this crate
/// carries no further dependencies.
fn crc32(data: &[u8]) -> u32 {
  const POLY: u32 = 0xEDB8_8320;

  let mut crc = 0xFFFF_FFFFu32;
  for &byte in data {
    crc ^= byte as u32;
    for _ in 0..8 {
      let mask = (crc & 1).wrapping_neg();
      crc = (crc >> 1) ^ (POLY & mask);
    }
  }
  !crc
}

#[cfg(test)]
mod tests {
  use super::*;

  fn build_header(function: u8, flags: u8) -> Vec<u8> {
    let mut buf = vec![0u8; PREFIX_HEADER_LEN];
    buf[0..4].copy_from_slice(&0x0800_0000u32.to_le_bytes());
    buf[4..8].copy_from_slice(&0x0800_FFFCu32.to_le_bytes());
    buf[9] = function;
    buf[10] = 0;
    buf[11] = flags;
    buf[12..14].copy_from_slice(&7u16.to_le_bytes());
    buf[14..16].copy_from_slice(&13u16.to_le_bytes());
    buf[16..18].copy_from_slice(&(PREFIX_HEADER_LEN as u16).to_le_bytes());
    buf
  }

  #[test]
  fn parses_valid_header_and_crc() {
    let mut data = build_header(5, 0);
    data.extend_from_slice(&[0xAA; 16]);
    let crc = crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());

    let header = parse(&data).expect("parse");
    assert_eq!(header.module_function, ModuleFunction::UserPart);
    assert_eq!(header.platform_id, 13);
    assert_eq!(header.module_version, 7);
    assert!(header.crc_valid);
    assert_eq!(header.module_size(), 0xFFFC + 4);
  }

  #[test]
  fn crc_mismatch_is_a_warning_not_a_failure() {
    let mut data = build_header(5, 0);
    data.extend_from_slice(&[0xAA; 16]);
    data.extend_from_slice(&0u32.to_le_bytes());

    let header = parse(&data).expect("parse");
    assert!(!header.crc_valid);
  }

  #[test]
  fn truncated_file_is_rejected() {
    let data = vec![0u8; 4];
    assert!(matches!(parse(&data), Err(ParseError::Truncated(4))));
  }

  #[test]
  fn skippable_functions_are_flagged() {
    assert!(ModuleFunction::MonoFirmware.is_skippable());
    assert!(ModuleFunction::ResourceModule.is_skippable());
    assert!(ModuleFunction::Settings.is_skippable());
    assert!(!ModuleFunction::UserPart.is_skippable());
  }

  #[test]
  fn flags_decode() {
    let mut data = build_header(2, 0b0000_0111);
    data.extend_from_slice(&[0u8; 16]);
    let crc = crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());

    let header = parse(&data).expect("parse");
    assert!(header.drop_header());
    assert!(header.encrypted());
    assert!(header.needs_to_be_encrypted());
  }
}
