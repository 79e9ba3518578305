//! Client for the external device-registry API used to resolve device
//! names to ids and to look up a device's platform when it isn't known
//! locally.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Result;

/// One entry from `listDevices`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDevice {
  pub id: String,
  pub name: Option<String>,
  pub platform_id: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
  pub username: String,
}

pub struct RegistryClient {
  http: reqwest::Client,
  api_url: String,
  token: String,
}

impl RegistryClient {
  pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
    RegistryClient {
      http: reqwest::Client::new(),
      api_url: api_url.into(),
      token: token.into(),
    }
  }

  /// Resolve credentials the same way the CLI does: `PARTICLE_TOKEN` first,
  /// then `~/.particle/profile.json` (which names the active profile) plus
  /// `~/.particle/<profile>.config.json` (which holds `access_token` and
  /// `apiUrl`).
  pub fn from_environment() -> Result<Self> {
    if let Ok(token) = std::env::var("PARTICLE_TOKEN") {
      return Ok(RegistryClient::new(default_api_url(), token));
    }

    let home = dirs::home_dir().ok_or_else(|| crate::Error::InvalidOperation("no home directory".into()))?;
    let profile_path = home.join(".particle").join("profile.json");
    let profile: ProfilePointer = serde_json::from_str(&std::fs::read_to_string(profile_path)?)?;

    let config_path: PathBuf = home
      .join(".particle")
      .join(format!("{}.config.json", profile.name));
    let config: ProfileConfig = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;

    Ok(RegistryClient::new(
      config.api_url.unwrap_or_else(default_api_url),
      config.access_token,
    ))
  }

  pub async fn get_user_info(&self) -> Result<UserInfo> {
    let url = format!("{}/v1/user", self.api_url);
    let response = self
      .http
      .get(&url)
      .bearer_auth(&self.token)
      .send()
      .await?
      .error_for_status()?;
    Ok(response.json().await?)
  }

  pub async fn list_devices(&self) -> Result<Vec<RegistryDevice>> {
    let url = format!("{}/v1/devices", self.api_url);
    let response = self
      .http
      .get(&url)
      .bearer_auth(&self.token)
      .send()
      .await?
      .error_for_status()?;
    Ok(response.json().await?)
  }

  pub async fn get_device(&self, id: &str) -> Result<RegistryDevice> {
    let url = format!("{}/v1/devices/{id}", self.api_url);
    let response = self
      .http
      .get(&url)
      .bearer_auth(&self.token)
      .send()
      .await?
      .error_for_status()?;
    Ok(response.json().await?)
  }

  pub async fn update_device(&self, id: &str, development: bool, product: Option<&str>) -> Result<()> {
    let url = match product {
      Some(product) => format!("{}/v1/products/{product}/devices/{id}", self.api_url),
      None => format!("{}/v1/devices/{id}", self.api_url),
    };
    let body = UpdateDeviceBody { development };
    self
      .http
      .put(&url)
      .bearer_auth(&self.token)
      .json(&body)
      .send()
      .await?
      .error_for_status()?;
    Ok(())
  }
}

#[derive(Serialize)]
struct UpdateDeviceBody {
  development: bool,
}

#[derive(Deserialize)]
struct ProfilePointer {
  name: String,
}

#[derive(Deserialize)]
struct ProfileConfig {
  access_token: String,
  #[serde(rename = "apiUrl")]
  api_url: Option<String>,
}

fn default_api_url() -> String {
  "https://api.particle.io".to_string()
}

/// Resolve a set of user-requested device names and unknown-platform
/// device ids against the registry in a single call, per spec §4.9.
pub async fn resolve_names_and_platforms(
  client: &RegistryClient,
  names: &[String],
  unknown_platform_ids: &[String],
) -> Result<Vec<RegistryDevice>> {
  if names.is_empty() && unknown_platform_ids.is_empty() {
    return Ok(vec![]);
  }
  client.list_devices().await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_api_url_is_particle_io() {
    assert_eq!(default_api_url(), "https://api.particle.io");
  }
}
