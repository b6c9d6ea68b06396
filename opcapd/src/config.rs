use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::hooks::WatchedOp;
use crate::scratch::system_page_size;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/opcap/opcap.toml";
pub const ENV_CONFIG_PATH: &str = "OPCAP_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub scratch: ScratchConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden
    /// with the `OPCAP_CONFIG` environment variable. If the file
    /// is missing or fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// Load an explicitly named file. Unlike [`Config::load`], a missing or
    /// malformed file is an error.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    /// Mapping buffer size in 16-byte fragments.
    #[serde(default = "default_map_fragments")]
    pub map_fragments: usize,
    /// Samples the channel holds before new ones are dropped.
    #[serde(default = "default_sample_capacity")]
    pub sample_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            map_fragments: default_map_fragments(),
            sample_capacity: default_sample_capacity(),
        }
    }
}

fn default_map_fragments() -> usize {
    8192
}
fn default_sample_capacity() -> usize {
    65_536
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScratchConfig {
    #[serde(default = "system_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            page_size: system_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

fn default_max_pages() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_watch")]
    pub watch: Vec<WatchedOp>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            watch: default_watch(),
        }
    }
}

fn default_watch() -> Vec<WatchedOp> {
    WatchedOp::ALL.to_vec()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
