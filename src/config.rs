//! Configuration file parsing for the product ledger service.
//!
//! This module handles loading and parsing the `config.toml` file for server-side
//! settings such as CORS, request size limits, ledger connection parameters and
//! catalog text limits.
//!
//! Configuration is optional; every section falls back to its defaults.
//! Deployment secrets (contract address, signing key, provider endpoint) are
//! read from the environment instead, see [`crate::from_env`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete service configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub request: RequestConfig,
    pub ledger: LedgerConfig,
    pub catalog: CatalogConfig,
    pub images: ImagesConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// If the file doesn't exist, returns the default configuration.
    /// If the file exists but is malformed, returns an error.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()
    }

    /// Load configuration from environment variable CONFIG_FILE or default path.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::from_file(config_path)
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory with a prebuilt frontend served for unmatched paths.
    /// Nothing is served when unset.
    pub static_dir: Option<PathBuf>,
}

/// CORS configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    /// List of allowed origins. Empty list means allow all (*).
    pub allowed_origins: Vec<String>,
}

/// Request validation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Maximum request body size in bytes (default 1MB).
    pub max_body_size_bytes: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_body_size_bytes: 1_048_576, // 1MB
        }
    }
}

/// Ledger connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Fixed delay between a lost connection and the next attempt.
    pub reconnect_interval_seconds: u64,
    /// Node endpoint used outside production.
    pub development_endpoint: String,
    /// Network id whose record in the build artifact holds the contract address.
    pub development_network_id: String,
    /// Truffle build artifact of the catalog contract (development only).
    pub artifact_path: PathBuf,
    /// ABI file used in production. The bundled ABI is used when unset.
    pub abi_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_seconds: 10,
            development_endpoint: "ws://localhost:8545".to_string(),
            development_network_id: "1337".to_string(),
            artifact_path: PathBuf::from("contracts/build/contracts/ProductosChain.json"),
            abi_path: None,
        }
    }
}

impl LedgerConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds)
    }
}

/// Limits applied to product text before it reaches the ledger.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub name_max_chars: usize,
    pub description_max_chars: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            name_max_chars: 100,
            description_max_chars: 200,
        }
    }
}

/// Where uploaded product images are kept and published.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub dir: PathBuf,
    /// URL prefix of stored images. A path (`/uploads`) is served by this
    /// service from `dir`.
    pub public_url: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("uploads"),
            public_url: "/uploads".to_string(),
        }
    }
}
