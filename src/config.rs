//! Daemon configuration.
//!
//! Layered with figment: built-in defaults, then the TOML file, then
//! `LAYOUTD_*` environment variables, then command line flags.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::selection::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/layoutd/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Webhook,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name pools use to address their reports to this door.
    pub cell_name: String,
    /// JSON-RPC listener for clients, pools and admins.
    pub rpc_bind: SocketAddr,
    /// Mover queue requested on the pools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_queue: Option<String>,
    /// Cell name of the pool selection service.
    pub pool_manager: String,
    /// How long a layout request waits for the pool to get ready.
    pub reply_timeout_ms: u64,
    pub retry_period_ms: u64,
    pub retry_count: u32,
    /// How long a layout return waits for the mover to stop.
    pub mover_kill_timeout_ms: u64,
    pub stripe_unit: u32,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    /// Routing table: cell name to the address it listens on.
    pub endpoints: HashMap<String, SocketAddr>,
    pub notifications: NotificationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cell_name: "NFS-door".to_string(),
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], 7549)),
            io_queue: None,
            pool_manager: "PoolManager".to_string(),
            reply_timeout_ms: 3_000,
            retry_period_ms: 500,
            retry_count: u32::MAX,
            mover_kill_timeout_ms: 500,
            stripe_unit: 4096 * 256,
            simulation: false,
            verbose: false,
            json_logs: false,
            endpoints: HashMap::new(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from the default config file location.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_PATH), cli_args)
    }

    pub fn load<T: Serialize>(config_file: &Path, cli_args: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("LAYOUTD_").split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment
            .extract()
            .with_context(|| format!("Invalid configuration ({})", config_file.display()))
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn mover_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.mover_kill_timeout_ms)
    }

    /// Selection retries share the reply budget of the layout request.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_count,
            Duration::from_millis(self.retry_period_ms),
            self.reply_timeout(),
        )
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Flags {
        #[serde(skip_serializing_if = "Option::is_none")]
        io_queue: Option<String>,
    }

    #[test]
    fn defaults_without_file() {
        let config =
            AppConfig::load(Path::new("/nonexistent/layoutd.toml"), None::<&Flags>).unwrap();

        assert_eq!(config.reply_timeout(), Duration::from_secs(3));
        assert_eq!(config.mover_kill_timeout(), Duration::from_millis(500));
        assert_eq!(config.retry_policy().retry_period, Duration::from_millis(500));
        assert_eq!(config.stripe_unit, 1024 * 1024);
    }

    #[test]
    fn file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
io_queue = "nfs"
reply_timeout_ms = 1500

[endpoints]
pool-1 = "10.0.0.1:7550"

[notifications]
channel = "webhook"
webhook_url = "http://billing/"
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path(), None::<&Flags>).unwrap();
        assert_eq!(config.io_queue.as_deref(), Some("nfs"));
        assert_eq!(config.reply_timeout_ms, 1500);
        assert_eq!(config.endpoints["pool-1"], "10.0.0.1:7550".parse().unwrap());
        assert_eq!(config.notifications.channel, NotificationChannelType::Webhook);

        let flags = Flags {
            io_queue: Some("fast".into()),
        };
        let config = AppConfig::load(file.path(), Some(&flags)).unwrap();
        assert_eq!(config.io_queue.as_deref(), Some("fast"));
        assert_eq!(config.reply_timeout_ms, 1500);
    }

    #[test]
    fn toml_dump_loads_back() {
        let mut config = AppConfig::default();
        config
            .endpoints
            .insert("PoolManager".into(), "10.0.0.10:7551".parse().unwrap());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes()).unwrap();

        let loaded = AppConfig::load(file.path(), None::<&Flags>).unwrap();
        assert_eq!(loaded, config);
    }
}
