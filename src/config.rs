//! Configuration management for the OMERO bridge CLI.
//!
//! This module provides the command-line interface:
//! - Command-line arguments via clap
//! - Environment variables with `OMERO_` prefix
//! - Sensible defaults for all optional settings
//!
//! The core library never reads configuration itself; it consumes the plain
//! [`SessionConfig`], [`CacheConfig`] and [`RetryPolicy`] structs built here.
//!
//! # Environment Variables
//!
//! - `OMERO_SERVER` - Base URL of the image server (required)
//! - `OMERO_USER` - Login name (required)
//! - `OMERO_PASSWORD` - Password (required)
//! - `OMERO_POOL_SIZE` - Concurrent remote calls (default: 4)
//! - `OMERO_POOL_WAIT_MS` - Wait for a pooled connection (default: 5000)
//! - `OMERO_CALL_TIMEOUT_MS` - Bound on each remote call (default: 30000)
//! - `OMERO_IDLE_TIMEOUT_SECS` - Reconnect after idling this long, 0 disables (default: 600)
//! - `OMERO_MAX_ATTEMPTS` - Attempts per plane fetch (default: 4)
//! - `OMERO_INITIAL_BACKOFF_MS` - First retry delay (default: 100)
//! - `OMERO_MAX_BACKOFF_MS` - Retry delay cap (default: 2000)
//! - `OMERO_CACHE_BYTES` - Plane cache budget (default: 256MB)
//! - `OMERO_CACHE_WAIT_MS` - Wait for an in-flight fetch, 0 waits forever (default: 0)

use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::dataset::{DatasetId, HandleConfig};
use crate::plane::{
    CacheConfig, RetryPolicy, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF,
    DEFAULT_PLANE_CACHE_BUDGET,
};
use crate::remote::Credentials;
use crate::session::{
    SessionConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_POOL_SIZE,
    DEFAULT_POOL_WAIT_TIMEOUT,
};

// =============================================================================
// Default Values
// =============================================================================

const DEFAULT_POOL_WAIT_MS: u64 = DEFAULT_POOL_WAIT_TIMEOUT.as_millis() as u64;
const DEFAULT_CALL_TIMEOUT_MS: u64 = DEFAULT_CALL_TIMEOUT.as_millis() as u64;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = DEFAULT_IDLE_TIMEOUT.as_secs();
const DEFAULT_INITIAL_BACKOFF_MS: u64 = DEFAULT_INITIAL_BACKOFF.as_millis() as u64;
const DEFAULT_MAX_BACKOFF_MS: u64 = DEFAULT_MAX_BACKOFF.as_millis() as u64;

/// Upper bound accepted for `--pool-size`.
pub const MAX_POOL_SIZE: usize = 64;

// =============================================================================
// CLI Arguments
// =============================================================================

/// OMERO bridge - lazy array access to images on a remote OMERO server.
#[derive(Parser, Debug, Clone)]
#[command(name = "omero-bridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Open an image and read its default planes through the bridge.
    View(ViewConfig),

    /// Verify the server can be reached and the credentials are accepted.
    Check(CheckConfig),
}

/// Server, credential and session options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct ConnectionConfig {
    /// Base URL of the image server, e.g. https://omero.example.org
    #[arg(long, env = "OMERO_SERVER")]
    pub server: String,

    /// Login name.
    #[arg(short, long, env = "OMERO_USER")]
    pub username: String,

    /// Password.
    #[arg(short, long, env = "OMERO_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Maximum number of concurrent remote calls.
    #[arg(long, default_value_t = DEFAULT_POOL_SIZE, env = "OMERO_POOL_SIZE")]
    pub pool_size: usize,

    /// Milliseconds to wait for a pooled connection before failing.
    #[arg(long, default_value_t = DEFAULT_POOL_WAIT_MS, env = "OMERO_POOL_WAIT_MS")]
    pub pool_wait_ms: u64,

    /// Milliseconds before a single remote call is abandoned.
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT_MS, env = "OMERO_CALL_TIMEOUT_MS")]
    pub call_timeout_ms: u64,

    /// Seconds of inactivity after which the session is re-established (0 = never).
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "OMERO_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: u64,

    /// Attempts per plane fetch, including the first.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS, env = "OMERO_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Milliseconds before the first retry of a failed fetch.
    #[arg(long, default_value_t = DEFAULT_INITIAL_BACKOFF_MS, env = "OMERO_INITIAL_BACKOFF_MS")]
    pub initial_backoff_ms: u64,

    /// Upper bound in milliseconds on the delay between retries.
    #[arg(long, default_value_t = DEFAULT_MAX_BACKOFF_MS, env = "OMERO_MAX_BACKOFF_MS")]
    pub max_backoff_ms: u64,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl ConnectionConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        let server = self.server.trim();
        if server.is_empty() {
            return Err("Server URL is required. Set --server or OMERO_SERVER".to_string());
        }
        if !(server.starts_with("http://") || server.starts_with("https://")) {
            return Err(format!(
                "Server URL must start with http:// or https://, got '{}'",
                server
            ));
        }

        if self.username.is_empty() {
            return Err("Username is required. Set --username or OMERO_USER".to_string());
        }

        if self.pool_size == 0 || self.pool_size > MAX_POOL_SIZE {
            return Err(format!("pool_size must be between 1 and {}", MAX_POOL_SIZE));
        }
        if self.pool_wait_ms == 0 {
            return Err("pool_wait_ms must be greater than 0".to_string());
        }
        if self.call_timeout_ms == 0 {
            return Err("call_timeout_ms must be greater than 0".to_string());
        }

        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("initial_backoff_ms must not exceed max_backoff_ms".to_string());
        }

        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.password)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            credentials: self.credentials(),
            pool_size: self.pool_size,
            pool_wait_timeout: Duration::from_millis(self.pool_wait_ms),
            call_timeout: self.call_timeout(),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Options of the `view` command.
#[derive(Args, Debug, Clone)]
pub struct ViewConfig {
    #[command(flatten)]
    pub connection: ConnectionConfig,

    /// Image to open, as Image:<id> or a bare id.
    pub object: DatasetId,

    /// Load every plane of every channel up front instead of on demand.
    #[arg(long, default_value_t = false)]
    pub eager: bool,

    /// Pyramid level to read (0 = full resolution).
    #[arg(long, conflicts_with = "scale")]
    pub level: Option<usize>,

    /// Downsample factor the viewer displays at; picks the matching level.
    #[arg(long)]
    pub scale: Option<f64>,

    /// Plane cache budget in bytes.
    #[arg(long, default_value_t = DEFAULT_PLANE_CACHE_BUDGET, env = "OMERO_CACHE_BYTES")]
    pub cache_bytes: usize,

    /// Milliseconds to wait for a plane another reader is fetching (0 = no limit).
    #[arg(long, default_value_t = 0, env = "OMERO_CACHE_WAIT_MS")]
    pub cache_wait_ms: u64,
}

impl ViewConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.connection.validate()?;

        if self.cache_bytes == 0 {
            return Err("cache_bytes must be greater than 0".to_string());
        }

        if let Some(scale) = self.scale {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(format!("scale must be a positive number, got {}", scale));
            }
        }

        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            budget_bytes: self.cache_bytes,
            wait_timeout: (self.cache_wait_ms > 0)
                .then(|| Duration::from_millis(self.cache_wait_ms)),
        }
    }

    pub fn handle_config(&self) -> HandleConfig {
        HandleConfig {
            cache: self.cache_config(),
            retry: self.connection.retry_policy(),
        }
    }
}

/// Options of the `check` command.
#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    #[command(flatten)]
    pub connection: ConnectionConfig,

    /// Also resolve the metadata of this image.
    #[arg(long)]
    pub object: Option<DatasetId>,
}

impl CheckConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.connection.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
