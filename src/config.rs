//! # Configuration Loading
//!
//! Device configuration lives in a small line-oriented text file, one
//! directive per line: `Host:`, `WiFi:` (repeatable, opens a network entry),
//! `Pass:` (attaches to the most recent `WiFi:`), `Port:`, `Image:`,
//! `Meta:`, `Up:`.
//!
//! Two copies may exist: one on the removable card (the provisioning medium)
//! and one in fixed internal storage. The removable copy takes priority when
//! present and well-formed; after the first fully successful wake cycle it
//! is migrated to internal storage and deleted, so the card can be removed.
//!
//! Parsing prefers partial success over total failure: unparseable lines are
//! skipped with a log line. A config is only rejected outright when a
//! required field (host, image path, metadata path, or a complete WiFi
//! entry) never showed up.

use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fixed internal config path.
pub const PRIMARY_CONFIG_PATH: &str = "/flash/data/config.txt";
/// Removable-card config path.
pub const SECONDARY_CONFIG_PATH: &str = "/sd/config.txt";

/// Errors from configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The medium could not be read at all.
    #[error("config I/O: {0}")]
    Io(#[from] io::Error),

    /// The file parsed but is missing a required field.
    #[error("config incomplete: needs host, image, metadata and a WiFi entry")]
    Incomplete,
}

/// Which medium supplied the active configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Fixed internal storage.
    Primary,
    /// Removable card.
    Secondary,
}

/// One known WiFi network, in file order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WifiNetwork {
    pub ssid: String,
    pub passphrase: String,
}

/// Parsed device configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub image_path: String,
    pub metadata_path: String,
    /// Telemetry upload path; empty string disables the upload.
    pub upload_path: String,
    /// Known networks in file order; earlier entries are preferred.
    pub wifi: Vec<WifiNetwork>,
    pub source: ConfigOrigin,
}

impl DeviceConfig {
    /// Parse directive lines into a config.
    ///
    /// Returns `None` when a required field is missing. The `source` tag
    /// defaults to [`ConfigOrigin::Primary`]; [`ConfigStore::load`] stamps
    /// the actual medium.
    pub fn parse(text: &str) -> Option<DeviceConfig> {
        let mut host = String::new();
        let mut port = 80u16;
        let mut image = String::new();
        let mut meta = String::new();
        let mut upload = String::new();
        let mut wifi: Vec<WifiNetwork> = Vec::new();

        for line in text.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("Host:") {
                host = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("WiFi:") {
                wifi.push(WifiNetwork {
                    ssid: value.trim().to_string(),
                    passphrase: String::new(),
                });
            } else if let Some(value) = line.strip_prefix("Pass:") {
                match wifi.last_mut() {
                    Some(net) => net.passphrase = value.trim().to_string(),
                    None => warn!("Pass: line with no preceding WiFi: line, skipping"),
                }
            } else if let Some(value) = line.strip_prefix("Port:") {
                match value.trim().parse() {
                    Ok(p) => port = p,
                    Err(_) => warn!("can't process line '{line}'"),
                }
            } else if let Some(value) = line.strip_prefix("Image:") {
                image = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("Meta:") {
                meta = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("Up:") {
                upload = value.trim().to_string();
            }
            // anything else is a comment or noise; partial config beats none
        }

        let usable = !host.is_empty()
            && !image.is_empty()
            && !meta.is_empty()
            && wifi
                .iter()
                .any(|n| !n.ssid.is_empty() && !n.passphrase.is_empty());
        if !usable {
            return None;
        }

        Some(DeviceConfig {
            host,
            port,
            image_path: image,
            metadata_path: meta,
            upload_path: upload,
            wifi,
            source: ConfigOrigin::Primary,
        })
    }

    /// Passphrase for a scanned SSID, if it is a known network.
    pub fn passphrase_for(&self, ssid: &str) -> Option<&str> {
        self.wifi
            .iter()
            .find(|n| n.ssid == ssid)
            .map(|n| n.passphrase.as_str())
    }

    /// Serialise back to directive lines, the inverse of [`Self::parse`].
    pub fn to_file_format(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Host:{}\n", self.host));
        for net in &self.wifi {
            out.push_str(&format!("WiFi:{}\n", net.ssid));
            out.push_str(&format!("Pass:{}\n", net.passphrase));
        }
        out.push_str(&format!("Port:{}\n", self.port));
        out.push_str(&format!("Image:{}\n", self.image_path));
        out.push_str(&format!("Meta:{}\n", self.metadata_path));
        if !self.upload_path.is_empty() {
            out.push_str(&format!("Up:{}\n", self.upload_path));
        }
        out
    }
}

/// The two configuration media and the operations across them.
pub struct ConfigStore {
    primary: PathBuf,
    secondary: PathBuf,
}

impl ConfigStore {
    pub fn new(primary: impl Into<PathBuf>, secondary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }

    /// Store over the default device paths.
    pub fn at_default_paths() -> Self {
        Self::new(PRIMARY_CONFIG_PATH, SECONDARY_CONFIG_PATH)
    }

    /// Load configuration, removable card first, internal storage second.
    ///
    /// Any failure on the card (missing, unreadable, incomplete) falls back
    /// to internal storage; a failure there is final.
    pub fn load(&self) -> Result<DeviceConfig, ConfigError> {
        match Self::load_file(&self.secondary, ConfigOrigin::Secondary) {
            Ok(cfg) => {
                info!("loaded config from removable card");
                Ok(cfg)
            }
            Err(err) => {
                warn!("can't use card config ({err}), trying internal storage");
                let cfg = Self::load_file(&self.primary, ConfigOrigin::Primary)?;
                info!("loaded config from internal storage");
                Ok(cfg)
            }
        }
    }

    fn load_file(path: &Path, origin: ConfigOrigin) -> Result<DeviceConfig, ConfigError> {
        let text = fs::read_to_string(path)?;
        let mut cfg = DeviceConfig::parse(&text).ok_or(ConfigError::Incomplete)?;
        cfg.source = origin;
        Ok(cfg)
    }

    /// Migrate a known-good card config to internal storage, then delete the
    /// card copy.
    ///
    /// Idempotent: when the internal copy already matches, only the delete
    /// runs; when the card copy is already gone, this is a no-op.
    pub fn transfer(&self) -> io::Result<()> {
        let src = match fs::read(&self.secondary) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };

        let already_matches = fs::read(&self.primary)
            .map(|cur| cur == src)
            .unwrap_or(false);
        if !already_matches {
            if let Some(parent) = self.primary.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&self.primary, &src)?;
        }

        fs::remove_file(&self.secondary)
    }

    /// Write a config to the removable card, for provisioning tooling.
    pub fn save_secondary(&self, cfg: &DeviceConfig) -> io::Result<()> {
        fs::write(&self.secondary, cfg.to_file_format())
    }
}
