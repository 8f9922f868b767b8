//! Server configuration
//!
//! Loaded once by the binary from an optional TOML file and `EXCHANGE_*`
//! environment variables, then handed to [`Server::new`] by reference.
//!
//! [`Server::new`]: crate::server::Server::new

use config::{Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ServerError;

pub const DEFAULT_CONFIG_FILE: &str = "exchange.toml";
pub const ENV_PREFIX: &str = "EXCHANGE";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub wal_dir: PathBuf,
    pub wal_file: String,
    /// Listen address in text form: `":8080"` binds every interface.
    pub port: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub database_connect_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Events the hub keeps for subscribers that connect late.
    #[serde(default = "default_hub_backlog")]
    pub hub_backlog: usize,
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_hub_backlog() -> usize {
    1024
}

impl Config {
    /// Build a config with defaults for everything but the required fields.
    pub fn new(
        database_url: impl Into<String>,
        wal_dir: impl Into<PathBuf>,
        wal_file: impl Into<String>,
        port: impl Into<String>,
        allowed_origins: Vec<String>,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            wal_dir: wal_dir.into(),
            wal_file: wal_file.into(),
            port: port.into(),
            allowed_origins,
            database_max_connections: default_max_connections(),
            database_connect_timeout_secs: default_connect_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            hub_backlog: default_hub_backlog(),
        }
    }

    /// Load from `path` (if it exists) layered under `EXCHANGE_*` variables.
    ///
    /// `EXCHANGE_ALLOWED_ORIGINS` is a comma separated list.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let settings = config::Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_origins"),
            )
            .build()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.database_url.trim().is_empty() {
            return Err(ServerError::Configuration("database_url is empty".into()));
        }
        if self.wal_dir.as_os_str().is_empty() {
            return Err(ServerError::Configuration("wal_dir is empty".into()));
        }
        if self.wal_file.is_empty() || Path::new(&self.wal_file).components().count() != 1 {
            return Err(ServerError::Configuration(format!(
                "wal_file must be a plain file name, got {:?}",
                self.wal_file
            )));
        }
        if self.hub_backlog == 0 {
            return Err(ServerError::Configuration("hub_backlog must be positive".into()));
        }
        if self.database_max_connections == 0 {
            return Err(ServerError::Configuration(
                "database_max_connections must be positive".into(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Parse `port` into a socket address. Only `:port` and literal
    /// `ip:port` forms are accepted; host names are not resolved.
    pub fn listen_addr(&self) -> Result<SocketAddr, ServerError> {
        let addr = if self.port.starts_with(':') {
            format!("0.0.0.0{}", self.port)
        } else {
            self.port.clone()
        };
        addr.parse()
            .map_err(|_| ServerError::Configuration(format!("invalid listen port {:?}", self.port)))
    }

    pub fn wal_path(&self) -> PathBuf {
        self.wal_dir.join(&self.wal_file)
    }

    pub fn database_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database_connect_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
