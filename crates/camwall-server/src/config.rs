//! Configuration management
//!
//! Layers, lowest precedence first: built-in defaults, the TOML file,
//! `CAMWALL_*` environment variables, command line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use camwall_core::{ChannelOrder, GeometryLimits, SessionConfig};

use crate::cli::Cli;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub slots: usize,
    pub max_frame_bytes: usize,
    pub max_dimension: u32,
    /// 0 disables the idle timeout
    pub idle_timeout_secs: u64,
    pub channel_order: ChannelOrder,
    /// `""` or `"off"` in TOML disables the admin server
    #[serde(
        deserialize_with = "deserialize_optional_addr",
        serialize_with = "serialize_optional_addr"
    )]
    pub admin_addr: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_dir: Option<PathBuf>,
    pub snapshot_interval_secs: u64,
    /// 0 disables periodic per-slot statistics
    pub stats_interval_secs: u64,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            slots: 2,
            max_frame_bytes: 64 * 1024 * 1024,
            max_dimension: 8192,
            idle_timeout_secs: 30,
            channel_order: ChannelOrder::Rgb,
            admin_addr: Some(SocketAddr::from(([127, 0, 0, 1], 9090))),
            snapshot_dir: None,
            snapshot_interval_secs: 5,
            stats_interval_secs: 10,
            log_level: "info".to_string(),
        }
    }
}

/// `""`, `"off"`, `"none"` and `"disabled"` all mean "no address".
fn parse_optional_addr(raw: &str) -> Result<Option<SocketAddr>, std::net::AddrParseError> {
    match raw.trim() {
        "" | "off" | "none" | "disabled" => Ok(None),
        addr => addr.parse().map(Some),
    }
}

fn deserialize_optional_addr<'de, D>(deserializer: D) -> Result<Option<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_optional_addr(&raw).map_err(serde::de::Error::custom)
}

fn serialize_optional_addr<S>(addr: &Option<SocketAddr>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match addr {
        Some(addr) => serializer.collect_str(addr),
        None => serializer.serialize_str("off"),
    }
}

impl ServerConfig {
    /// Load configuration from the TOML file, environment variables and command line
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        Self::load_with_env(cli, |key| std::env::var(key).ok())
    }

    /// [`ServerConfig::load`] with an explicit environment lookup.
    pub fn load_with_env(
        cli: &Cli,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };

        config.apply_env(env)?;
        cli.apply(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML file; missing keys keep their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(addr) = env("CAMWALL_LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid CAMWALL_LISTEN_ADDR: {}", e)))?;
        }

        if let Some(slots) = env("CAMWALL_SLOTS") {
            self.slots = slots
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid CAMWALL_SLOTS: {}", e)))?;
        }

        if let Some(addr) = env("CAMWALL_ADMIN_ADDR") {
            self.admin_addr = parse_optional_addr(&addr)
                .map_err(|e| ConfigError::Invalid(format!("Invalid CAMWALL_ADMIN_ADDR: {}", e)))?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots == 0 {
            return Err(ConfigError::Invalid("slots must be > 0".to_string()));
        }

        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("max_frame_bytes must be > 0".to_string()));
        }

        if self.max_dimension == 0 {
            return Err(ConfigError::Invalid("max_dimension must be > 0".to_string()));
        }

        if let Some(dir) = &self.snapshot_dir {
            if dir.exists() && !dir.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "snapshot_dir is not a directory: {:?}",
                    dir
                )));
            }
            if self.snapshot_interval_secs == 0 {
                return Err(ConfigError::Invalid(
                    "snapshot_interval_secs must be > 0 when snapshot_dir is set".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    /// Convert to the per-connection session settings
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            limits: GeometryLimits {
                max_dimension: self.max_dimension,
                max_frame_bytes: self.max_frame_bytes,
            },
            idle_timeout: self.idle_timeout(),
            channel_order: self.channel_order,
        }
    }

    /// Render as TOML, for `--print-config`
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_toml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::load_with_env(&Cli::default(), no_env).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.slots, 2);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.channel_order, ChannelOrder::Rgb);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let file = write_toml(
            r#"
            listen_addr = "127.0.0.1:7000"
            slots = 4
            idle_timeout_secs = 0
            channel_order = "legacy-grb"
            admin_addr = "off"
            "#,
        );
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            ..Cli::default()
        };
        let config = ServerConfig::load_with_env(&cli, no_env).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.slots, 4);
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.channel_order, ChannelOrder::LegacyGrb);
        assert_eq!(config.admin_addr, None);
        // Untouched keys keep their defaults.
        assert_eq!(config.max_dimension, 8192);
    }

    #[test]
    fn test_env_overrides_toml_and_cli_overrides_env() {
        let file = write_toml("slots = 4\nlisten_addr = \"127.0.0.1:7000\"\n");
        let env: HashMap<&str, &str> = [
            ("CAMWALL_SLOTS", "3"),
            ("CAMWALL_LISTEN_ADDR", "127.0.0.1:7001"),
            ("CAMWALL_ADMIN_ADDR", "127.0.0.1:9191"),
        ]
        .into_iter()
        .collect();
        let cli = Cli {
            config: Some(file.path().to_path_buf()),
            listen_addr: Some("127.0.0.1:7002".parse().unwrap()),
            ..Cli::default()
        };

        let config =
            ServerConfig::load_with_env(&cli, |key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.slots, 3);
        assert_eq!(config.listen_addr, "127.0.0.1:7002".parse().unwrap());
        assert_eq!(config.admin_addr, Some("127.0.0.1:9191".parse().unwrap()));
    }

    #[test]
    fn test_invalid_env_value() {
        let err = ServerConfig::load_with_env(&Cli::default(), |key| {
            (key == "CAMWALL_SLOTS").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("CAMWALL_SLOTS")));
    }

    #[test]
    fn test_unknown_channel_order_in_toml() {
        let file = write_toml("channel_order = \"bgr\"\n");
        assert!(matches!(
            ServerConfig::from_toml_file(file.path()),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_unknown_key_in_toml() {
        let file = write_toml("max_allocations = 3\n");
        assert!(matches!(
            ServerConfig::from_toml_file(file.path()),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/camwall.toml")),
            ..Cli::default()
        };
        assert!(matches!(
            ServerConfig::load_with_env(&cli, no_env),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        for config in [
            ServerConfig { slots: 0, ..ServerConfig::default() },
            ServerConfig { max_frame_bytes: 0, ..ServerConfig::default() },
            ServerConfig { max_dimension: 0, ..ServerConfig::default() },
        ] {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_snapshot_dir_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = ServerConfig {
            snapshot_dir: Some(file.path().to_path_buf()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            snapshot_dir: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        config.validate().unwrap();

        let config = ServerConfig {
            snapshot_dir: Some(dir.path().to_path_buf()),
            snapshot_interval_secs: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_conversion() {
        let config = ServerConfig {
            max_frame_bytes: 1000,
            max_dimension: 64,
            idle_timeout_secs: 0,
            channel_order: ChannelOrder::LegacyGrb,
            ..ServerConfig::default()
        };
        let session = config.to_session_config();
        assert_eq!(session.limits.max_frame_bytes, 1000);
        assert_eq!(session.limits.max_dimension, 64);
        assert_eq!(session.idle_timeout, None);
        assert_eq!(session.channel_order, ChannelOrder::LegacyGrb);
    }

    #[test]
    fn test_disabled_admin_survives_print_config() {
        let config = ServerConfig {
            admin_addr: None,
            ..ServerConfig::default()
        };
        let text = config.to_toml().unwrap();
        assert!(text.contains("admin_addr = \"off\""));
        let file = write_toml(&text);
        assert_eq!(ServerConfig::from_toml_file(file.path()).unwrap().admin_addr, None);
    }

    #[test]
    fn test_printed_config_parses_back() {
        let config = ServerConfig {
            snapshot_dir: Some(PathBuf::from("/tmp/camwall")),
            ..ServerConfig::default()
        };
        let text = config.to_toml().unwrap();
        let file = write_toml(&text);
        assert_eq!(ServerConfig::from_toml_file(file.path()).unwrap(), config);
    }
}
