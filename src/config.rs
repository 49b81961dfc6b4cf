use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 1024;
pub const DEFAULT_RECEIPTS_CACHE_SIZE: usize = 1024;
pub const DEFAULT_TX_LOOKUP_CACHE_SIZE: usize = 4096;
pub const DEFAULT_TX_CHAN_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0} must be positive")]
    Zero(&'static str),
}

/// Tunables of a host adapter instance. Missing fields take their defaults.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(default)]
pub struct Config {
    pub block_cache_size: usize,
    pub receipts_cache_size: usize,
    pub tx_lookup_cache_size: usize,
    /// Capacity of the channel between the VM pool and the broadcast handler.
    pub tx_chan_size: usize,
    pub historical_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            receipts_cache_size: DEFAULT_RECEIPTS_CACHE_SIZE,
            tx_lookup_cache_size: DEFAULT_TX_LOOKUP_CACHE_SIZE,
            tx_chan_size: DEFAULT_TX_CHAN_SIZE,
            historical_enabled: true,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, v) in [
            ("block_cache_size", self.block_cache_size),
            ("receipts_cache_size", self.receipts_cache_size),
            ("tx_lookup_cache_size", self.tx_lookup_cache_size),
            ("tx_chan_size", self.tx_chan_size),
        ] {
            if v == 0 {
                return Err(ConfigError::Zero(name))
            }
        }
        Ok(())
    }
}

#[test]
fn test_config() {
    let config = Config::from_json("{}").unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.tx_chan_size, 4096);

    let config =
        Config::from_json(r#"{"block_cache_size": 8, "historical_enabled": false}"#)
            .unwrap();
    assert_eq!(config.block_cache_size, 8);
    assert_eq!(config.receipts_cache_size, DEFAULT_RECEIPTS_CACHE_SIZE);
    assert!(!config.historical_enabled);

    assert!(matches!(
        Config::from_json(r#"{"tx_chan_size": 0}"#),
        Err(ConfigError::Zero("tx_chan_size"))
    ));
    assert!(matches!(
        Config::from_json("[1]"),
        Err(ConfigError::Parse(_))
    ));
}
