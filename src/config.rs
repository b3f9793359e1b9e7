//! YAML configuration for a loadsim server instance.
//!
//! The schema mirrors the config file sections one-to-one; every option is
//! required. Parse failures surface as [`Error::Config`] and terminate the
//! process with `EC_INVALID_CONFIG_FILE`.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub control_server: ControlServerConfig,
    pub listen: ListenConfig,
    pub networking: NetworkingConfig,
    pub concurrency: ConcurrencyConfig,
    pub sessions: SessionsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlServerConfig {
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub reuse_address: bool,
    pub separate_acceptor_thread: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkingConfig {
    pub socket_close_linger: bool,
    pub socket_close_linger_timeout: u32,
    /// Parsed for config compatibility; the engine does not enforce a
    /// per-source connection cap.
    pub max_connections_per_source: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcurrencyConfig {
    /// Initial number of reactors.
    pub num_workers: usize,
    /// Reserved reactor capacity; `add_context` fails beyond this.
    pub max_num_workers: usize,
    /// Thread multiplier per reactor.
    pub num_threads_per_worker: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionsConfig {
    /// 0 means unbounded.
    pub max_session_pool_size: usize,
    pub max_transfer_size: usize,
    pub eager_session_pool: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Re-print the stats header every this many rows; 0 disables it.
    pub header_interval: u64,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("{}: {e}", path.as_ref().display())))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency.num_workers == 0 {
            return Err(Error::Config("concurrency.num_workers must be > 0".into()));
        }
        if self.concurrency.max_num_workers < self.concurrency.num_workers {
            return Err(Error::Config(
                "concurrency.max_num_workers must be >= num_workers".into(),
            ));
        }
        if !(1..=64).contains(&self.concurrency.num_threads_per_worker) {
            return Err(Error::Config(
                "concurrency.num_threads_per_worker must be in 1..=64".into(),
            ));
        }
        if self.sessions.eager_session_pool && self.sessions.max_session_pool_size == 0 {
            return Err(Error::Config(
                "sessions.eager_session_pool requires a bounded max_session_pool_size".into(),
            ));
        }
        Ok(())
    }
}
