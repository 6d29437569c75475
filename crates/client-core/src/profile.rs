//! Connection settings for the remote platform.
//!
//! Settings are layered, weakest first: built-in defaults, the on-disk
//! profile, then whatever overrides the caller assembles from its CLI flags
//! and environment. Layers combine with [`ClientProfile::overlay`]; a missing
//! profile file is simply an empty layer, never an error.

use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable pointing at an explicit profile file, bypassing the
/// config-directory lookup.
pub const PROFILE_ENV: &str = "SKYLIFT_CONFIG";

const PROFILE_DIR: &str = "skylift";
const PROFILE_FILE: &str = "profile.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientProfile {
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
    /// Proxy session mode: `off`, `basic`, or `ntlm`.
    pub proxy_mode: Option<String>,
}

impl ClientProfile {
    /// Combine two layers: fields set in `stronger` win, everything else
    /// falls through to `self`.
    pub fn overlay(self, stronger: ClientProfile) -> ClientProfile {
        ClientProfile {
            api_base_url: stronger.api_base_url.or(self.api_base_url),
            api_token: stronger.api_token.or(self.api_token),
            proxy_mode: stronger.proxy_mode.or(self.proxy_mode),
        }
    }

    /// Strip surrounding whitespace and treat blank fields as unset. The
    /// proxy mode is additionally lowercased.
    pub fn tidied(self) -> ClientProfile {
        ClientProfile {
            api_base_url: tidy(self.api_base_url),
            api_token: tidy(self.api_token),
            proxy_mode: tidy(self.proxy_mode).map(|v| v.to_ascii_lowercase()),
        }
    }
}

fn tidy(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Where the profile lives: `$SKYLIFT_CONFIG` names the file directly;
/// otherwise it sits under the XDG config directory (or `~/.config`).
pub fn profile_path() -> anyhow::Result<PathBuf> {
    if let Some(explicit) = std::env::var_os(PROFILE_ENV) {
        if explicit.is_empty() {
            anyhow::bail!("{PROFILE_ENV} is set but empty");
        }
        return Ok(PathBuf::from(explicit));
    }

    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|dir| !dir.as_os_str().is_empty())
        .or_else(|| {
            std::env::var_os("HOME")
                .filter(|home| !home.is_empty())
                .map(|home| PathBuf::from(home).join(".config"))
        })
        .ok_or_else(|| anyhow::anyhow!("neither XDG_CONFIG_HOME nor HOME is set"))?;

    Ok(base.join(PROFILE_DIR).join(PROFILE_FILE))
}

/// Read the on-disk layer. A file that does not exist yields the empty
/// profile; a file that exists but cannot be parsed is an error.
pub fn read_profile() -> anyhow::Result<ClientProfile> {
    let path = profile_path()?;
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ClientProfile::default());
        }
        Err(err) => anyhow::bail!("read profile {}: {err}", path.display()),
    };
    let profile: ClientProfile = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("parse profile {}: {err}", path.display()))?;
    Ok(profile.tidied())
}

/// Durably replace the on-disk profile: the body is staged to a sibling
/// file, synced, then moved over the old profile in one rename.
pub fn write_profile(profile: &ClientProfile) -> anyhow::Result<()> {
    let path = profile_path()?;
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let body = serde_json::to_vec_pretty(&profile.clone().tidied())?;
    let staging = path.with_extension("staged");
    {
        let mut file = std::fs::File::create(&staging)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    std::fs::rename(&staging, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_the_stronger_layer() {
        let file_layer = ClientProfile {
            api_base_url: Some("https://api.example.com".to_string()),
            api_token: Some("tok_file".to_string()),
            proxy_mode: Some("basic".to_string()),
        };
        let overrides = ClientProfile {
            api_base_url: None,
            api_token: Some("tok_cli".to_string()),
            proxy_mode: None,
        };

        let merged = file_layer.overlay(overrides);
        assert_eq!(
            merged.api_base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(merged.api_token.as_deref(), Some("tok_cli"));
        assert_eq!(merged.proxy_mode.as_deref(), Some("basic"));
    }

    #[test]
    fn overlay_of_empty_layers_is_empty() {
        let merged = ClientProfile::default().overlay(ClientProfile::default());
        assert_eq!(merged, ClientProfile::default());
    }

    #[test]
    fn tidied_drops_blank_fields_and_lowercases_proxy() {
        let profile = ClientProfile {
            api_base_url: Some("  https://api.example.com  ".to_string()),
            api_token: Some("   ".to_string()),
            proxy_mode: Some(" NTLM ".to_string()),
        };
        let tidied = profile.tidied();
        assert_eq!(
            tidied.api_base_url.as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(tidied.api_token, None);
        assert_eq!(tidied.proxy_mode.as_deref(), Some("ntlm"));
    }

    #[test]
    fn profile_round_trips_through_json() {
        let profile = ClientProfile {
            api_base_url: Some("https://api.example.com".to_string()),
            api_token: Some("tok_123".to_string()),
            proxy_mode: Some("ntlm".to_string()),
        };
        let json = serde_json::to_string(&profile).unwrap();
        let back: ClientProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn unknown_and_missing_fields_deserialize_cleanly() {
        let back: ClientProfile =
            serde_json::from_str(r#"{"api_token":"tok_9","retired_field":true}"#).unwrap();
        assert_eq!(back.api_token.as_deref(), Some("tok_9"));
        assert_eq!(back.api_base_url, None);
    }
}
