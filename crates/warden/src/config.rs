//! Daemon configuration management

use crate::engine::IdFormat;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default allow-list location
pub const DEFAULT_POLICY_PATH: &str = "/etc/usbwarden/allowlist";

/// Kernel control file that severs a USB device from its driver
pub const DEFAULT_UNBIND_PATH: &str = "/sys/bus/usb/drivers/usb/unbind";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    pub daemon: DaemonSettings,
    pub policy: PolicySettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub enforcement: EnforcementSettings,
    /// Audit logging configuration
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub log_level: String,
    /// Running under systemd (sd_notify readiness and watchdog)
    #[serde(default)]
    pub service_mode: bool,
}

/// Allow-list settings
///
/// # Example Configuration
/// ```toml
/// [policy]
/// path = "/etc/usbwarden/allowlist"
/// id_format = "legacy-decimal"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySettings {
    pub path: PathBuf,
    /// How vendor/product ids are read from sysfs and from the allow-list.
    /// `legacy-decimal` keeps the historical digit accumulation, `hex` reads
    /// them as the hexadecimal values the kernel actually exposes.
    #[serde(default)]
    pub id_format: IdFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Mount point of sysfs
    #[serde(default = "MonitorSettings::default_sysfs_root")]
    pub sysfs_root: PathBuf,
    /// Report devices already connected at start-up
    #[serde(default = "MonitorSettings::default_true")]
    pub enumerate_existing: bool,
    /// Never hand root hubs (`usbN`) to the authorization engine
    #[serde(default = "MonitorSettings::default_true")]
    pub skip_root_hubs: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sysfs_root: Self::default_sysfs_root(),
            enumerate_existing: true,
            skip_root_hubs: true,
        }
    }
}

impl MonitorSettings {
    fn default_sysfs_root() -> PathBuf {
        PathBuf::from("/sys")
    }

    fn default_true() -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementSettings {
    #[serde(default = "EnforcementSettings::default_unbind_path")]
    pub unbind_path: PathBuf,
    /// Log denials instead of unbinding
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            unbind_path: Self::default_unbind_path(),
            dry_run: false,
        }
    }
}

impl EnforcementSettings {
    fn default_unbind_path() -> PathBuf {
        PathBuf::from(DEFAULT_UNBIND_PATH)
    }
}

/// Audit logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable audit logging
    #[serde(default)]
    pub enabled: bool,
    /// Path to audit log file
    #[serde(default = "AuditConfig::default_path")]
    pub path: PathBuf,
    /// Maximum log file size in MB before rotation
    #[serde(default)]
    pub max_size_mb: Option<u32>,
    /// Maximum number of rotated files to keep
    #[serde(default)]
    pub max_files: Option<u32>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: Self::default_path(),
            max_size_mb: Some(10),
            max_files: Some(5),
        }
    }
}

impl AuditConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("/var/log/usbwarden/audit.log")
    }
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonSettings {
                log_level: "info".to_string(),
                service_mode: false,
            },
            policy: PolicySettings {
                path: PathBuf::from(DEFAULT_POLICY_PATH),
                id_format: IdFormat::default(),
            },
            monitor: MonitorSettings::default(),
            enforcement: EnforcementSettings::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbwarden/warden.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: WardenConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.expand_paths();
        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbwarden").join("warden.toml")
        } else {
            PathBuf::from(".config/usbwarden/warden.toml")
        }
    }

    /// Apply `~` expansion to every configured path
    fn expand_paths(&mut self) {
        self.policy.path = expand_path(&self.policy.path);
        self.monitor.sysfs_root = expand_path(&self.monitor.sysfs_root);
        self.enforcement.unbind_path = expand_path(&self.enforcement.unbind_path);
        self.audit.path = expand_path(&self.audit.path);
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.policy.path.as_os_str().is_empty() {
            return Err(anyhow!("policy.path must not be empty"));
        }

        if self.enforcement.unbind_path.as_os_str().is_empty() {
            return Err(anyhow!("enforcement.unbind_path must not be empty"));
        }

        if self.audit.max_files == Some(0) {
            return Err(anyhow!("audit.max_files must be at least 1"));
        }

        Ok(())
    }
}

fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}
