//! The Module Cache & Resolver: locates, downloads, unpacks, parses,
//! canonicalizes, and caches the per-platform firmware module binaries for
//! a requested release, backfilling anything missing from bundled assets
//! or older releases.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::module::{self, Module, ModuleType, ParseOutcome};
use crate::platform::{Catalog, CATALOG};
use crate::release::{Asset, Release, ReleaseClient};
use crate::{Error, Result};

const MAX_PARALLEL_DOWNLOADS: usize = 6;
const MAX_BACKFILL_PROBES: usize = 20;

/// Fixed, enumerated options for a release resolve (spec §9: no loose
/// option bags).
#[derive(Debug, Clone, Copy, Default)]
pub struct ReleaseOptions {
  pub no_cache: bool,
  pub draft: bool,
}

pub struct ModuleCache {
  cache_dir: PathBuf,
  temp_dir: PathBuf,
  assets_dir: PathBuf,
  client: Arc<ReleaseClient>,
  catalog: &'static Catalog,
}

impl ModuleCache {
  pub fn new(cache_dir: PathBuf, temp_dir: PathBuf, assets_dir: PathBuf, client: ReleaseClient) -> Self {
    ModuleCache {
      cache_dir,
      temp_dir,
      assets_dir,
      client: Arc::new(client),
      catalog: &CATALOG,
    }
  }

  /// Resolve every module for `version`, consulting the on-disk cache
  /// first unless `opts.no_cache` is set.
  pub async fn get_release_modules(&self, version: &str, opts: ReleaseOptions) -> Result<Vec<Module>> {
    if opts.draft && std::env::var("GITHUB_TOKEN").is_err() {
      return Err(Error::AuthenticationRequired);
    }

    let version_dir = self.cache_dir.join(version);
    if !opts.no_cache && version_dir.is_dir() {
      let modules = parse_all_bins(&version_dir, self.catalog)?;
      if !modules.is_empty() {
        tracing::debug!(version, "fast path: using cached release");
        return Ok(modules);
      }
    }

    let parsed_version = semver::Version::parse(version.trim_start_matches('v'))?;
    let release = self.locate_release(version, &parsed_version, opts.draft).await?;

    let assets: Vec<Asset> = release.select_assets().into_iter().cloned().collect();
    if assets.is_empty() {
      return Err(Error::NoBinariesInRelease(version.to_string()));
    }

    let download_dir = self.temp_dir.join("downloads").join(version);
    self.download_assets(&assets, &download_dir).await?;
    unpack_zips(&download_dir)?;

    let mut grouped = self.canonicalize(&download_dir)?;
    self.backfill(&mut grouped, &parsed_version).await?;

    let mut modules: Vec<Module> = grouped.into_values().collect();

    if !release.draft {
      self.commit(version, &mut modules)?;
    }

    let _ = tokio::fs::remove_dir_all(&download_dir).await;

    Ok(modules)
  }

  /// Parse a local file, directory, or zip archive of module binaries
  /// directly, bypassing the release host entirely.
  pub fn get_modules_from_path(&self, path: &Path) -> Result<Vec<Module>> {
    if path.is_dir() {
      return parse_all_bins(path, self.catalog);
    }
    if path.extension().and_then(|e| e.to_str()) == Some("zip") {
      let extract_dir = self.temp_dir.join("local-zip");
      let _ = std::fs::remove_dir_all(&extract_dir);
      extract_zip(path, &extract_dir)?;
      return parse_all_bins(&extract_dir, self.catalog);
    }
    match module::parse_module_file(path, self.catalog)? {
      ParseOutcome::Module(m) => Ok(vec![m]),
      ParseOutcome::Skipped { reason } => {
        tracing::warn!(path = %path.display(), reason, "skipping module");
        Ok(vec![])
      }
    }
  }

  async fn locate_release(&self, version: &str, parsed: &semver::Version, draft: bool) -> Result<Release> {
    if let Some(release) = self.client.get_release_by_tag(&format!("v{version}")).await? {
      return Ok(release);
    }
    if let Some(release) = self.client.get_release_by_tag(version).await? {
      return Ok(release);
    }
    if draft {
      if let Some(release) = self.client.find_draft_release(parsed).await? {
        return Ok(release);
      }
    }
    Err(Error::ReleaseNotFound(version.to_string()))
  }

  async fn download_assets(&self, assets: &[Asset], dest_dir: &Path) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_DOWNLOADS));
    let mut tasks = Vec::new();

    for asset in assets {
      let semaphore = semaphore.clone();
      let client = self.client.clone();
      let asset = asset.clone();
      let dest = dest_dir.join(&asset.name);

      tasks.push(tokio::spawn(async move {
        let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
        client.download_asset(&asset, &dest).await
      }));
    }

    for task in tasks {
      task.await??;
    }
    Ok(())
  }

  /// Walk the download directory, parse every `*.bin`, and group into a
  /// map keyed by `(platform_name, type, index)`, applying the ordered
  /// tie-breaks on collision.
  fn canonicalize(&self, download_dir: &Path) -> Result<HashMap<(String, ModuleType, Option<u8>), Module>> {
    let mut grouped = HashMap::new();
    for path in walk_files(download_dir, "bin")? {
      match module::parse_module_file(&path, self.catalog) {
        Ok(ParseOutcome::Module(m)) => {
          let platform_name = self.catalog.by_id(m.platform_id)?.name.to_string();
          insert_with_tiebreak(&mut grouped, platform_name, m);
        }
        Ok(ParseOutcome::Skipped { reason }) => {
          tracing::warn!(path = %path.display(), reason, "skipping module");
        }
        Err(err) => {
          tracing::warn!(path = %path.display(), %err, "failed to parse candidate module");
        }
      }
    }
    Ok(grouped)
  }

  async fn backfill(
    &self,
    grouped: &mut HashMap<(String, ModuleType, Option<u8>), Module>,
    version: &semver::Version,
  ) -> Result<()> {
    let platforms_present: std::collections::HashSet<String> =
      grouped.keys().map(|(name, _, _)| name.clone()).collect();

    let mut missing: Vec<(String, ModuleType)> = Vec::new();
    for platform_name in &platforms_present {
      let platform = self.catalog.by_name(platform_name)?;
      let mut needed = vec![ModuleType::Bootloader, ModuleType::UserPart];
      if platform.has_radio_stack {
        needed.push(ModuleType::RadioStack);
      }
      if platform.has_ncp_firmware {
        needed.push(ModuleType::NcpFirmware);
      }
      for ty in needed {
        let present = grouped.keys().any(|(name, t, _)| name == platform_name && *t == ty);
        if !present {
          missing.push((platform_name.clone(), ty));
        }
      }
    }

    // Step 1: scan bundled assets.
    if self.assets_dir.is_dir() {
      let bundled = parse_all_bins(&self.assets_dir, self.catalog).unwrap_or_default();
      missing.retain(|(platform_name, ty)| {
        let found = bundled
          .iter()
          .find(|m| self.catalog.by_id(m.platform_id).map(|p| p.name) == Ok(platform_name.as_str()) && &m.r#type == ty);
        match found {
          Some(m) => {
            grouped.insert((platform_name.clone(), *ty, m.index), m.clone());
            false
          }
          None => true,
        }
      });
    }

    // Step 2: radio stack / NCP firmware missing entirely is a warning, not
    // a failure.
    missing.retain(|(platform_name, ty)| {
      if matches!(ty, ModuleType::RadioStack | ModuleType::NcpFirmware) {
        tracing::warn!(platform = %platform_name, module_type = ?ty, "missing from release and bundled assets");
        false
      } else {
        true
      }
    });

    if missing.is_empty() {
      return Ok(());
    }

    // Step 3: probe up to MAX_BACKFILL_PROBES prior releases, newest first.
    let priors = self.prior_releases(version).await?;
    for release in priors {
      if missing.is_empty() {
        break;
      }
      let still_missing = missing.clone();
      for (platform_name, ty) in still_missing {
        let keyword = match ty {
          ModuleType::Bootloader => "bootloader",
          ModuleType::UserPart => "tinker",
          _ => continue,
        };
        let platform_keyword = platform_name.to_lowercase();
        let Some(asset) = release.assets.iter().find(|a| {
          let name = a.name.to_lowercase();
          name.ends_with(".bin") && name.contains(keyword) && name.contains(&platform_keyword)
        }) else {
          continue;
        };

        let dest = self.temp_dir.join("backfill").join(&release.tag).join(&asset.name);
        if self.client.download_asset(asset, &dest).await.is_err() {
          continue;
        }

        if let Ok(ParseOutcome::Module(m)) = module::parse_module_file(&dest, self.catalog) {
          if self.catalog.by_id(m.platform_id).map(|p| p.name) == Ok(platform_name.as_str()) {
            grouped.insert((platform_name.clone(), ty, m.index), m);
            missing.retain(|(p, t)| !(p == &platform_name && *t == ty));
          }
        }
      }
    }

    // Step 4: whatever is still missing is a warning.
    for (platform_name, ty) in missing {
      tracing::warn!(platform = %platform_name, module_type = ?ty, "module missing after backfill");
    }

    Ok(())
  }

  /// List prior releases strictly older than `version`, newest first,
  /// capped at [`MAX_BACKFILL_PROBES`].
  async fn prior_releases(&self, version: &semver::Version) -> Result<Vec<Release>> {
    let mut all = Vec::new();
    let mut page = 1;
    loop {
      let releases = self.client.list_releases_page(page).await?;
      if releases.is_empty() {
        break;
      }
      all.extend(releases);
      page += 1;
    }

    let mut prior: Vec<(semver::Version, Release)> = all
      .into_iter()
      .filter_map(|r| {
        let stripped = r.tag.strip_prefix('v').unwrap_or(&r.tag);
        semver::Version::parse(stripped).ok().map(|v| (v, r))
      })
      .filter(|(v, _)| v < version)
      .collect();

    prior.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(prior.into_iter().take(MAX_BACKFILL_PROBES).map(|(_, r)| r).collect())
  }

  /// Clear the version's cache directory and copy the final module set
  /// into it, updating each module's `file_path`.
  fn commit(&self, version: &str, modules: &mut [Module]) -> Result<()> {
    let version_dir = self.cache_dir.join(version);
    if version_dir.exists() {
      std::fs::remove_dir_all(&version_dir)?;
    }

    for module in modules.iter_mut() {
      let platform_name = self.catalog.by_id(module.platform_id)?.name;
      let dest_dir = version_dir.join(platform_name);
      std::fs::create_dir_all(&dest_dir)?;
      let file_name = module
        .file_path
        .file_name()
        .ok_or_else(|| Error::InvalidOperation("module file has no name".into()))?;
      let dest = dest_dir.join(file_name);

      std::fs::copy(&module.file_path, &dest)?;
      module.file_path = dest;
    }
    Ok(())
  }
}

fn insert_with_tiebreak(grouped: &mut HashMap<(String, ModuleType, Option<u8>), Module>, platform_name: String, module: Module) {
  let key = (platform_name, module.r#type, module.index);
  match grouped.get(&key) {
    Some(existing) if !should_replace(&module, existing) => {}
    _ => {
      grouped.insert(key, module);
    }
  }
}

/// Ordered tie-break rules for two modules competing for the same
/// `(platform, type, index)` slot.
fn should_replace(candidate: &Module, incumbent: &Module) -> bool {
  if candidate.r#type == ModuleType::UserPart {
    let candidate_tinker = is_tinker_build(&candidate.file_path);
    let incumbent_tinker = is_tinker_build(&incumbent.file_path);
    if candidate_tinker != incumbent_tinker {
      return candidate_tinker;
    }
  }
  if candidate.version != incumbent.version {
    return candidate.version > incumbent.version;
  }
  candidate.file_size < incumbent.file_size
}

fn is_tinker_build(path: &Path) -> bool {
  path
    .file_name()
    .map(|n| n.to_string_lossy().to_lowercase().contains("tinker"))
    .unwrap_or(false)
}

/// Recursively parse every `*.bin` file under `dir` into a flat module list,
/// without any grouping or tie-breaking (used for already-canonical trees:
/// the warm cache and user-supplied directories).
fn parse_all_bins(dir: &Path, catalog: &Catalog) -> Result<Vec<Module>> {
  let mut modules = Vec::new();
  for path in walk_files(dir, "bin")? {
    match module::parse_module_file(&path, catalog) {
      Ok(ParseOutcome::Module(m)) => modules.push(m),
      Ok(ParseOutcome::Skipped { reason }) => {
        tracing::warn!(path = %path.display(), reason, "skipping module");
      }
      Err(err) => {
        tracing::warn!(path = %path.display(), %err, "failed to parse candidate module");
      }
    }
  }
  Ok(modules)
}

fn walk_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
  let mut out = Vec::new();
  if !dir.is_dir() {
    return Ok(out);
  }
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    let path = entry.path();
    if path.is_dir() {
      out.extend(walk_files(&path, extension)?);
    } else if path.extension().and_then(|e| e.to_str()) == Some(extension) {
      out.push(path);
    }
  }
  Ok(out)
}

fn unpack_zips(dir: &Path) -> Result<()> {
  for path in walk_files(dir, "zip")? {
    let stem = path
      .file_stem()
      .ok_or_else(|| Error::InvalidOperation("zip asset has no file name".into()))?;
    let extract_dir = path.parent().unwrap_or(dir).join(stem);
    extract_zip(&path, &extract_dir)?;
  }
  Ok(())
}

fn extract_zip(zip_path: &Path, extract_dir: &Path) -> Result<()> {
  let file = std::fs::File::open(zip_path)?;
  let mut archive = zip::ZipArchive::new(std::io::BufReader::new(file))?;
  std::fs::create_dir_all(extract_dir)?;

  for i in 0..archive.len() {
    let mut entry = archive.by_index(i)?;
    let Some(relative) = entry.enclosed_name() else {
      continue;
    };
    let out_path = extract_dir.join(relative);

    if entry.is_dir() {
      std::fs::create_dir_all(&out_path)?;
      continue;
    }
    if let Some(parent) = out_path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let mut out_file = std::fs::File::create(&out_path)?;
    std::io::copy(&mut entry, &mut out_file)?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use module_format::PREFIX_HEADER_LEN;

  fn write_module_at(path: &Path, function: u8, platform_id: u16, index: u8, version: u16, size_hint: usize) {
    let mut buf = vec![0u8; PREFIX_HEADER_LEN];
    buf[0..4].copy_from_slice(&0x0800_0000u32.to_le_bytes());
    buf[4..8].copy_from_slice(&0x0800_0FFCu32.to_le_bytes());
    buf[9] = function;
    buf[10] = index;
    buf[12..14].copy_from_slice(&version.to_le_bytes());
    buf[14..16].copy_from_slice(&platform_id.to_le_bytes());
    buf[16..18].copy_from_slice(&(PREFIX_HEADER_LEN as u16).to_le_bytes());
    buf.extend_from_slice(&vec![0xAA; size_hint]);
    buf.extend_from_slice(&0u32.to_le_bytes());
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, &buf).unwrap();
  }

  #[test]
  fn tinker_build_wins_regardless_of_version() {
    let dir = tempfile::tempdir().unwrap();
    let old_tinker = dir.path().join("boron-tinker-v1.bin");
    let new_plain = dir.path().join("boron-system-v2.bin");
    write_module_at(&old_tinker, 5, 13, 0, 1, 16);
    write_module_at(&new_plain, 5, 13, 0, 99, 16);

    let tinker = module::parse_module_file(&old_tinker, &CATALOG).unwrap();
    let plain = module::parse_module_file(&new_plain, &CATALOG).unwrap();
    let (ParseOutcome::Module(tinker), ParseOutcome::Module(plain)) = (tinker, plain) else {
      panic!("expected modules");
    };

    assert!(should_replace(&tinker, &plain));
    assert!(!should_replace(&plain, &tinker));
  }

  #[test]
  fn higher_version_wins_when_neither_is_tinker() {
    let dir = tempfile::tempdir().unwrap();
    let v1 = dir.path().join("boron-system-v1.bin");
    let v2 = dir.path().join("boron-system-v2.bin");
    write_module_at(&v1, 4, 13, 1, 1, 16);
    write_module_at(&v2, 4, 13, 1, 2, 16);

    let m1 = match module::parse_module_file(&v1, &CATALOG).unwrap() {
      ParseOutcome::Module(m) => m,
      _ => panic!(),
    };
    let m2 = match module::parse_module_file(&v2, &CATALOG).unwrap() {
      ParseOutcome::Module(m) => m,
      _ => panic!(),
    };

    assert!(should_replace(&m2, &m1));
  }

  #[test]
  fn smaller_file_size_wins_as_final_tiebreak() {
    let dir = tempfile::tempdir().unwrap();
    let big = dir.path().join("boron-system-big.bin");
    let small = dir.path().join("boron-system-small.bin");
    write_module_at(&big, 4, 13, 1, 5, 256);
    write_module_at(&small, 4, 13, 1, 5, 16);

    let big = match module::parse_module_file(&big, &CATALOG).unwrap() {
      ParseOutcome::Module(m) => m,
      _ => panic!(),
    };
    let small = match module::parse_module_file(&small, &CATALOG).unwrap() {
      ParseOutcome::Module(m) => m,
      _ => panic!(),
    };

    assert!(should_replace(&small, &big));
    assert!(!should_replace(&big, &small));
  }

  #[test]
  fn fast_path_parses_cached_directory_without_network() {
    let cache_dir = tempfile::tempdir().unwrap();
    let version_dir = cache_dir.path().join("2.1.0").join("boron");
    write_module_at(&version_dir.join("system-part1.bin"), 4, 13, 1, 1, 16);
    write_module_at(&version_dir.join("user-part.bin"), 5, 13, 0, 1, 16);
    write_module_at(&version_dir.join("bootloader.bin"), 2, 13, 0, 1, 16);

    let modules = parse_all_bins(cache_dir.path().join("2.1.0").as_path(), &CATALOG).unwrap();
    assert_eq!(modules.len(), 3);
  }

  #[test]
  fn walk_files_recurses_into_subdirectories() {
    let dir = tempfile::tempdir().unwrap();
    write_module_at(&dir.path().join("a").join("one.bin"), 2, 13, 0, 1, 4);
    write_module_at(&dir.path().join("b").join("c").join("two.bin"), 2, 13, 0, 1, 4);

    let found = walk_files(dir.path(), "bin").unwrap();
    assert_eq!(found.len(), 2);
  }
}
