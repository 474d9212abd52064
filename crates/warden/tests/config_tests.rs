//! Integration tests for configuration parsing
//!
//! Tests daemon configuration files, including:
//! - Full configuration with every section
//! - Minimal configuration falling back to defaults
//! - Save/load through the filesystem
//! - Invalid configuration handling

use std::path::PathBuf;
use tempfile::TempDir;
use warden::IdFormat;
use warden::config::{DEFAULT_UNBIND_PATH, WardenConfig};

const FULL_CONFIG: &str = r#"
[daemon]
log_level = "debug"
service_mode = true

[policy]
path = "/etc/usbwarden/allowlist.hex"
id_format = "hex"

[monitor]
sysfs_root = "/sys"
enumerate_existing = false
skip_root_hubs = false

[enforcement]
unbind_path = "/sys/bus/usb/drivers/usb/unbind"
dry_run = true

[audit]
enabled = true
path = "/var/log/usbwarden/audit.log"
max_size_mb = 50
max_files = 3
"#;

const MINIMAL_CONFIG: &str = r#"
[daemon]
log_level = "info"

[policy]
path = "/etc/usbwarden/allowlist"
"#;

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("warden.toml");
    std::fs::write(&path, content).unwrap();
    path
}

mod parsing {
    use super::*;

    #[test]
    fn test_full_config() {
        let dir = TempDir::new().unwrap();
        let config = WardenConfig::load(Some(write_config(&dir, FULL_CONFIG))).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert!(config.daemon.service_mode);
        assert_eq!(config.policy.id_format, IdFormat::Hex);
        assert!(!config.monitor.enumerate_existing);
        assert!(!config.monitor.skip_root_hubs);
        assert!(config.enforcement.dry_run);
        assert!(config.audit.enabled);
        assert_eq!(config.audit.max_size_mb, Some(50));
        assert_eq!(config.audit.max_files, Some(3));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let dir = TempDir::new().unwrap();
        let config = WardenConfig::load(Some(write_config(&dir, MINIMAL_CONFIG))).unwrap();

        assert_eq!(config.policy.id_format, IdFormat::LegacyDecimal);
        assert!(config.monitor.enumerate_existing);
        assert!(config.monitor.skip_root_hubs);
        assert!(!config.enforcement.dry_run);
        assert_eq!(
            config.enforcement.unbind_path,
            PathBuf::from(DEFAULT_UNBIND_PATH)
        );
        assert!(!config.audit.enabled);
    }

    #[test]
    fn test_tilde_paths_are_expanded() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[daemon]
log_level = "info"

[policy]
path = "~/allowlist"
"#,
        );

        let config = WardenConfig::load(Some(path)).unwrap();
        assert!(!config.policy.path.starts_with("~"));
        assert!(config.policy.path.ends_with("allowlist"));
    }
}

mod invalid {
    use super::*;

    #[test]
    fn test_unknown_id_format() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[daemon]
log_level = "info"

[policy]
path = "/etc/usbwarden/allowlist"
id_format = "octal"
"#,
        );
        assert!(WardenConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, &MINIMAL_CONFIG.replace("\"info\"", "\"loud\""));
        assert!(WardenConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_zero_rotated_files() {
        let dir = TempDir::new().unwrap();
        let content = format!("{}\n[audit]\nmax_files = 0\n", MINIMAL_CONFIG);
        let path = write_config(&dir, &content);
        assert!(WardenConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(WardenConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}

mod persistence {
    use super::*;

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("warden.toml");

        let mut config = WardenConfig::default();
        config.policy.id_format = IdFormat::Hex;
        config.enforcement.dry_run = true;
        config.save(&path).unwrap();

        let loaded = WardenConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.policy.id_format, IdFormat::Hex);
        assert!(loaded.enforcement.dry_run);
        assert_eq!(loaded.policy.path, config.policy.path);
    }
}
