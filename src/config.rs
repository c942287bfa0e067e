// src/config.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info, warn};
use xdg::BaseDirectories;

pub const APP_NAME: &str = "lpem";
pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";

/// Main configuration structure, mapping to config.toml.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub hypervisor: HypervisorConfig,
    #[serde(default)]
    pub ssh: SshDefaultsConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HypervisorConfig {
    #[serde(default = "default_libvirt_uri")]
    pub uri: String,
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default = "default_image_dir")]
    pub image_dir: String,
}

fn default_libvirt_uri() -> String {
    std::env::var("LIBVIRT_URI").unwrap_or_else(|_| "qemu:///system".to_string())
}
fn default_shutdown_deadline_secs() -> u64 {
    120
}
fn default_image_dir() -> String {
    "~/.local/share/lpem/images".to_string()
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        HypervisorConfig {
            uri: default_libvirt_uri(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            image_dir: default_image_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SshDefaultsConfig {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_key_path")]
    pub key_path: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_package_command_timeout_secs")]
    pub package_command_timeout_secs: u64,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
    #[serde(default = "default_readiness_poll_interval_secs")]
    pub readiness_poll_interval_secs: u64,
    #[serde(default)]
    pub enforce_key_permissions: bool,
}

fn default_ssh_user() -> String {
    "student".to_string()
}
fn default_ssh_key_path() -> String {
    "~/.ssh/id_ed25519".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_command_timeout_secs() -> u64 {
    30
}
fn default_package_command_timeout_secs() -> u64 {
    120
}
fn default_readiness_timeout_secs() -> u64 {
    120
}
fn default_readiness_poll_interval_secs() -> u64 {
    5
}

impl Default for SshDefaultsConfig {
    fn default() -> Self {
        SshDefaultsConfig {
            user: default_ssh_user(),
            key_path: default_ssh_key_path(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            package_command_timeout_secs: default_package_command_timeout_secs(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            readiness_poll_interval_secs: default_readiness_poll_interval_secs(),
            enforce_key_permissions: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ChallengeConfig {
    #[serde(default = "default_challenges_dir")]
    pub challenges_dir: String,
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,
    #[serde(default)]
    pub keep_snapshot: bool,
}

fn default_challenges_dir() -> String {
    "./challenges".to_string()
}
fn default_snapshot_prefix() -> String {
    "lpem".to_string()
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        ChallengeConfig {
            challenges_dir: default_challenges_dir(),
            snapshot_prefix: default_snapshot_prefix(),
            keep_snapshot: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_rotate_daily")]
    pub rotate_daily: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "~/.cache/lpem/logs".to_string()
}
fn default_rotate_daily() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_dir: default_log_dir(),
            rotate_daily: default_rotate_daily(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hypervisor: HypervisorConfig::default(),
            ssh: SshDefaultsConfig::default(),
            challenge: ChallengeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(config_path_override: Option<&Path>) -> Result<Self> {
        let xdg_dirs = BaseDirectories::with_prefix(APP_NAME)?;
        let config_path = match config_path_override {
            Some(path) => path.to_path_buf(),
            None => xdg_dirs
                .find_config_file(DEFAULT_CONFIG_FILENAME)
                .unwrap_or_else(|| xdg_dirs.get_config_home().join(DEFAULT_CONFIG_FILENAME)),
        };

        info!("Attempting to load configuration from: {:?}", config_path);

        let mut config: Config = if config_path.exists() {
            let config_str = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
            toml::from_str(&config_str)
                .with_context(|| format!("Failed to parse TOML from config file: {:?}", config_path))?
        } else {
            warn!(
                "Config file not found at {:?}. Using default configuration.",
                config_path
            );
            Config::default()
        };

        // Env var wins over a config-file URI unless the user explicitly
        // passed --config (then the file's own [hypervisor].uri stands).
        if config_path_override.is_none() {
            if let Ok(uri) = std::env::var("LIBVIRT_URI") {
                config.hypervisor.uri = uri;
            }
        }

        config.ssh.key_path = shellexpand::tilde(&config.ssh.key_path).into_owned();
        config.hypervisor.image_dir = shellexpand::tilde(&config.hypervisor.image_dir).into_owned();
        config.logging.log_dir = shellexpand::tilde(&config.logging.log_dir).into_owned();

        debug!("Loaded config: {:?}", config);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_section() {
        let cfg = Config::default();
        assert_eq!(cfg.ssh.connect_timeout_secs, 10);
        assert_eq!(cfg.ssh.command_timeout_secs, 30);
        assert_eq!(cfg.ssh.package_command_timeout_secs, 120);
        assert_eq!(cfg.ssh.readiness_timeout_secs, 120);
        assert_eq!(cfg.hypervisor.shutdown_deadline_secs, 120);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let toml_str = r#"
            [ssh]
            user = "otheruser"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.ssh.user, "otheruser");
        assert_eq!(cfg.ssh.connect_timeout_secs, 10);
        assert_eq!(cfg.hypervisor.uri, default_libvirt_uri());
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let toml_str = r#"
            [nonsense]
            x = 1
        "#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }
}
