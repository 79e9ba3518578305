//! Client for the external release-hosting service: a versioned object
//! store with tagged releases and per-release downloadable assets.
//!
//! Modeled on the GitHub Releases API, which is what `GITHUB_TOKEN` (spec
//! §6) implies: `listReleases` is paginated 100 items/page, `getReleaseByTag`
//! looks a release up directly, and each asset has its own download
//! endpoint that wants `Accept: application/octet-stream`.

use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

const PER_PAGE: u32 = 100;

/// One downloadable file attached to a release.
#[derive(Debug, Clone)]
pub struct Asset {
  pub name: String,
  pub url: String,
  pub size: u64,
}

/// A tagged release: either the single non-draft release matching a tag, or
/// one entry out of the full (paginated) listing used to find drafts.
#[derive(Debug, Clone)]
pub struct Release {
  pub tag: String,
  pub draft: bool,
  pub assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct GhAsset {
  name: String,
  url: String,
  size: u64,
}

#[derive(Debug, Deserialize)]
struct GhRelease {
  tag_name: String,
  draft: bool,
  #[serde(default)]
  assets: Vec<GhAsset>,
}

impl From<GhRelease> for Release {
  fn from(gh: GhRelease) -> Self {
    Release {
      tag: gh.tag_name,
      draft: gh.draft,
      assets: gh
        .assets
        .into_iter()
        .map(|a| Asset {
          name: a.name,
          url: a.url,
          size: a.size,
        })
        .collect(),
    }
  }
}

pub struct ReleaseClient {
  http: reqwest::Client,
  base_url: String,
  token: Option<String>,
}

impl ReleaseClient {
  /// `base_url` is the repo API root, e.g.
  /// `https://api.github.com/repos/particle-iot/device-os`.
  pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
    ReleaseClient {
      http: reqwest::Client::new(),
      base_url: base_url.into(),
      token,
    }
  }

  fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  /// Look up a release by exact tag. Returns `Ok(None)` on a 404 so callers
  /// can try an alternate tag spelling before giving up.
  pub async fn get_release_by_tag(&self, tag: &str) -> Result<Option<Release>> {
    let url = format!("{}/releases/tags/{tag}", self.base_url);
    let request = self.authorize(self.http.get(&url));
    let response = request.send().await.map_err(|source| Error::DownloadFailed {
      asset: tag.to_string(),
      source,
    })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    let response = response.error_for_status()?;
    let gh: GhRelease = response.json().await?;
    Ok(Some(gh.into()))
  }

  /// Fetch one page (1-indexed) of the full release listing, 100 items per
  /// page, newest first (matches the hosting service's default ordering).
  pub async fn list_releases_page(&self, page: u32) -> Result<Vec<Release>> {
    let url = format!("{}/releases", self.base_url);
    let request = self.authorize(
      self
        .http
        .get(&url)
        .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())]),
    );
    let response = request.send().await?.error_for_status()?;
    let releases: Vec<GhRelease> = response.json().await?;
    Ok(releases.into_iter().map(Release::from).collect())
  }

  /// Page through the full release listing until a release whose tag
  /// (stripped of a leading `v`) equals `version` by semver equality and
  /// whose `draft` flag is set is found.
  pub async fn find_draft_release(&self, version: &semver::Version) -> Result<Option<Release>> {
    let mut page = 1;
    loop {
      let releases = self.list_releases_page(page).await?;
      if releases.is_empty() {
        return Ok(None);
      }
      for release in &releases {
        let stripped = release.tag.strip_prefix('v').unwrap_or(&release.tag);
        if release.draft {
          if let Ok(tag_version) = semver::Version::parse(stripped) {
            if &tag_version == version {
              return Ok(Some(release.clone()));
            }
          }
        }
      }
      page += 1;
    }
  }

  /// Download a single asset to `dest`, streaming the response body to
  /// disk.
  pub async fn download_asset(&self, asset: &Asset, dest: &Path) -> Result<()> {
    let request = self.authorize(
      self
        .http
        .get(&asset.url)
        .header(reqwest::header::ACCEPT, "application/octet-stream"),
    );
    let response = request.send().await.map_err(|source| Error::DownloadFailed {
      asset: asset.name.clone(),
      source,
    })?;
    let response = response.error_for_status().map_err(|source| Error::DownloadFailed {
      asset: asset.name.clone(),
      source,
    })?;

    let bytes = response.bytes().await.map_err(|source| Error::DownloadFailed {
      asset: asset.name.clone(),
      source,
    })?;

    if let Some(parent) = dest.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
  }
}

impl Release {
  /// Prefer `*.bin` assets; if none, fall back to `*.zip` assets (a known
  /// incomplete set).
  pub fn select_assets(&self) -> Vec<&Asset> {
    let bins: Vec<&Asset> = self.assets.iter().filter(|a| a.name.ends_with(".bin")).collect();
    if !bins.is_empty() {
      return bins;
    }
    self.assets.iter().filter(|a| a.name.ends_with(".zip")).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn asset(name: &str) -> Asset {
    Asset {
      name: name.to_string(),
      url: format!("https://example.invalid/{name}"),
      size: 0,
    }
  }

  #[test]
  fn prefers_bin_assets_over_zip() {
    let release = Release {
      tag: "v2.1.0".into(),
      draft: false,
      assets: vec![asset("boron.bin"), asset("argon.bin"), asset("everything.zip")],
    };
    let selected = release.select_assets();
    assert_eq!(selected.len(), 2);
    assert!(selected.iter().all(|a| a.name.ends_with(".bin")));
  }

  #[test]
  fn falls_back_to_zip_when_no_bin_assets() {
    let release = Release {
      tag: "v2.1.0".into(),
      draft: false,
      assets: vec![asset("everything.zip")],
    };
    let selected = release.select_assets();
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].name, "everything.zip");
  }
}
