//! Server settings.
//!
//! Read from `~/.config/parley/server.json` (or the path in
//! `PARLEY_CONFIG`). A missing file means defaults; the `PORT` environment
//! variable overrides the port either way.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use parley_presence_server::{DEFAULT_AUTH_TIMEOUT, DEFAULT_PORT, ServerConfig};

/// On-disk shape of the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    bind_addr: Option<String>,
    #[serde(default)]
    auth_timeout_secs: Option<u64>,
    #[serde(default)]
    close_superseded: Option<bool>,
}

/// Resolved server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub port: u16,
    pub bind_addr: IpAddr,
    pub auth_timeout: Duration,
    /// Close the older socket when a user opens a second one.
    pub close_superseded: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            port: DEFAULT_PORT,
            bind_addr: server.bind_addr,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            close_superseded: server.close_superseded,
        }
    }
}

impl AppConfig {
    /// Loads settings from `path`, falling back to defaults for a missing
    /// file, a malformed file or any unset field.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = AppConfig::default();
        if !path.exists() {
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let Ok(file) = serde_json::from_str::<SettingsFile>(&content) else {
            tracing::warn!(path = %path.display(), "failed to parse server settings, using defaults");
            return Ok(config);
        };

        if let Some(port) = file.port {
            config.port = port;
        }
        if let Some(addr) = file.bind_addr {
            match addr.parse() {
                Ok(ip) => config.bind_addr = ip,
                Err(_) => tracing::warn!(%addr, "invalid bindAddr in settings, using default"),
            }
        }
        if let Some(secs) = file.auth_timeout_secs {
            config.auth_timeout = Duration::from_secs(secs);
        }
        if let Some(close) = file.close_superseded {
            config.close_superseded = close;
        }
        Ok(config)
    }

    /// Writes the settings to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = SettingsFile {
            port: Some(self.port),
            bind_addr: Some(self.bind_addr.to_string()),
            auth_timeout_secs: Some(self.auth_timeout.as_secs()),
            close_superseded: Some(self.close_superseded),
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        tracing::debug!(path = %path.display(), "server settings saved");
        Ok(())
    }

    /// Applies the `PORT` environment override. An unparsable value is
    /// ignored with a warning.
    pub fn apply_port_override(&mut self, value: Option<&str>) {
        let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return;
        };
        match value.parse() {
            Ok(port) => self.port = port,
            Err(_) => tracing::warn!(value, "ignoring invalid PORT"),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr,
            port: self.port,
            auth_timeout: self.auth_timeout,
            close_superseded: self.close_superseded,
        }
    }
}

/// Settings path: `PARLEY_CONFIG` if set, else `<config dir>/parley/server.json`.
pub fn config_path() -> PathBuf {
    match std::env::var_os("PARLEY_CONFIG") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => config_base_dir().join("parley").join("server.json"),
    }
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.port, 5000);
        assert!(config.close_superseded);
    }

    #[test]
    fn partial_file_overrides_only_present_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{"port": 6100, "closeSuperseded": false}"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.port, 6100);
        assert!(!config.close_superseded);
        assert_eq!(config.auth_timeout, DEFAULT_AUTH_TIMEOUT);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.json");
        let config = AppConfig {
            port: 7000,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            auth_timeout: Duration::from_secs(3),
            close_superseded: false,
        };
        config.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn port_override() {
        let mut config = AppConfig::default();
        config.apply_port_override(Some("8080"));
        assert_eq!(config.port, 8080);

        config.apply_port_override(Some("not-a-port"));
        assert_eq!(config.port, 8080);

        config.apply_port_override(Some(""));
        config.apply_port_override(None);
        assert_eq!(config.port, 8080);
        assert_eq!(config.server_config().port, 8080);
    }
}
