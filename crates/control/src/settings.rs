//! Bootstrap configuration for the `bastion` binary.
//!
//! Everything here is read once at startup from a TOML file; the versioned
//! runtime configuration (bindings, topology) lives in the revision store,
//! not here.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use bastion_common::DnsProviderId;

use crate::acme::ProviderConfig;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Top-level bootstrap settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub admin: AdminBootstrap,
    #[serde(default)]
    pub acme: AcmeSettings,
    #[serde(default)]
    pub dns: DnsSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogSettings {
    /// Default tracing filter; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    /// Directory for key and certificate material.
    #[serde(default = "default_blob_path")]
    pub blob_path: PathBuf,
}

/// Admin listener defaults used to seed the very first revision.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminBootstrap {
    #[serde(default = "default_admin_port")]
    pub port: u16,
    #[serde(default)]
    pub listen_any: bool,
    /// Default confirm-window length for commits, in seconds.
    #[serde(default = "default_confirm_seconds")]
    pub confirm_seconds: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcmeSettings {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsSettings {
    #[serde(default)]
    pub providers: Vec<DnsProviderSettings>,
}

/// One operator-scripted DNS provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsProviderSettings {
    pub id: DnsProviderId,
    pub name: String,
    /// Path to the Luau script implementing the record capability.
    pub script_path: PathBuf,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            blob_path: default_blob_path(),
        }
    }
}

impl Default for AdminBootstrap {
    fn default() -> Self {
        Self {
            port: default_admin_port(),
            listen_any: false,
            confirm_seconds: default_confirm_seconds(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_blob_path() -> PathBuf {
    PathBuf::from("/var/lib/bastion/blobs")
}

fn default_admin_port() -> u16 {
    8443
}

fn default_confirm_seconds() -> u32 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.admin.port, 8443);
        assert!(!settings.admin.listen_any);
        assert_eq!(settings.log.level, "info");
        assert!(settings.acme.providers.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let text = r#"
[log]
level = "debug"
json = true

[storage]
blob_path = "/tmp/bastion-test/blobs"

[admin]
port = 9443
listen_any = true
confirm_seconds = 120

[[acme.providers]]
id = "letsencrypt"
name = "Let's Encrypt"
directory_url = "https://acme-v02.api.letsencrypt.org/directory"

[[acme.providers]]
id = "staging"
name = "Let's Encrypt Staging"
directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"
contact_emails_optional = true

[[dns.providers]]
id = "8d7f3b1a-4f41-4f43-9e62-3a8dca16cf01"
name = "example-dns"
script_path = "/etc/bastion/dns/example.luau"
"#;
        let settings: Settings = toml::from_str(text).unwrap();
        assert_eq!(settings.admin.port, 9443);
        assert_eq!(settings.acme.providers.len(), 2);
        assert!(settings.acme.providers[1].contact_emails_optional);
        assert_eq!(settings.dns.providers[0].name, "example-dns");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = toml::from_str::<Settings>("[admin]\nbogus = 1\n").unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
