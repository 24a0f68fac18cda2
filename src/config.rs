//! Configuration loading for the pool daemon.
//!
//! Settings come from a single TOML file supplied on the command line. The
//! structure mirrors the daemon's external interfaces: node RPC, node ZMQ,
//! the Stratum listener, and the data directory for share/block records.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bitcoin::Network;
use serde::Deserialize;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Which chain the pool serves; payout addresses must match.
    #[serde(default)]
    pub network: NetworkName,

    /// Bitcoin Core JSON-RPC endpoint
    pub rpc: RpcConfig,

    /// Bitcoin Core ZMQ notifications
    pub zmq: ZmqConfig,

    /// Stratum listener
    pub stratum: StratumConfig,

    /// Record persistence
    #[serde(default)]
    pub data: DataConfig,
}

/// Chain selector, as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkName {
    #[default]
    Main,
    Test,
    Regtest,
}

impl NetworkName {
    pub fn to_network(self) -> Network {
        match self {
            NetworkName::Main => Network::Bitcoin,
            NetworkName::Test => Network::Testnet,
            NetworkName::Regtest => Network::Regtest,
        }
    }
}

/// Bitcoin Core JSON-RPC connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Endpoint URL, e.g. "http://127.0.0.1:8332"
    pub url: String,

    /// HTTP basic auth user
    pub user: String,

    /// HTTP basic auth password
    pub password: String,

    /// Request timeout in seconds
    #[serde(default = "default_rpc_timeout")]
    pub timeout_s: u64,
}

/// Bitcoin Core ZMQ settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ZmqConfig {
    /// SUB endpoint publishing `hashblock`, e.g. "tcp://127.0.0.1:28332"
    pub endpoint: String,
}

/// Stratum listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StratumConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Connection cap; further connections are refused
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Initial per-session share difficulty
    #[serde(default = "default_difficulty")]
    pub difficulty: f64,

    /// Adopt a client's mining.suggest_difficulty
    #[serde(default = "default_true")]
    pub accept_suggested_difficulty: bool,

    /// Version-rolling bits offered to clients (hex)
    #[serde(
        default = "default_version_mask",
        deserialize_with = "deserialize_hex_u32"
    )]
    pub version_rolling_mask: u32,
}

/// Where share and block records are appended.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
        }
    }
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_difficulty() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_version_mask() -> u32 {
    0x1fff_e000
}

fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.trim_start_matches("0x");
    u32::from_str_radix(s, 16).map_err(serde::de::Error::custom)
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let config: Config = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.rpc.url.is_empty(), "rpc.url must not be empty");
        anyhow::ensure!(!self.zmq.endpoint.is_empty(), "zmq.endpoint must not be empty");
        anyhow::ensure!(self.stratum.port != 0, "stratum.port must not be zero");
        anyhow::ensure!(
            self.stratum.max_connections > 0,
            "stratum.max_connections must be positive"
        );
        Ok(())
    }
}
