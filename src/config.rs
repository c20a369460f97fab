use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compress::Codec;
use crate::error::{Error, IoResultExt, Result};

/// image build configuration
///
/// loadable from TOML for CLI use, or constructed directly by library
/// callers. `validate` must pass before a writer is opened.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// base-2 log of the data block size, 12..=20
    pub block_log: u32,
    /// compressor name: none, zlib, xz, lz4, zstd
    pub compression: String,
    /// collapse identical blocks and fragment tails
    pub dedup: bool,
    /// keep compression and writing on the calling thread
    pub single_threaded: bool,
    /// superblock modification time (seconds since epoch)
    pub modification_time: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_log: 17,
            compression: "zlib".to_string(),
            dedup: false,
            single_threaded: false,
            modification_time: 0,
        }
    }
}

impl Config {
    /// load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(12..=20).contains(&self.block_log) {
            return Err(Error::InvalidConfig(format!(
                "block_log {} out of range 12..=20",
                self.block_log
            )));
        }
        self.codec()?;
        Ok(())
    }

    pub fn codec(&self) -> Result<Codec> {
        Codec::from_name(&self.compression)
    }

    pub fn block_size(&self) -> usize {
        1 << self.block_log
    }
}
