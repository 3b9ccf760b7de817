//! Cluster settings and configuration rendering.
//!
//! This module provides the tunable profile applied to every disposable
//! cluster. The values are the fixed profile the harness has always
//! used, chosen for startup speed and sandbox portability rather than
//! production fitness, exposed as a named struct so individual knobs
//! can be overridden without code changes:
//!
//! - [`ClusterSettings`] - the profile, serde-deserializable with
//!   defaults for every field
//! - [`InstanceConfig`] - the computed, immutable per-instance layout
//! - [`render_conf_block`] - the `postgresql.conf` lines appended after
//!   `initdb` runs (later lines win, so these are authoritative)

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::allocator::Endpoint;
use crate::error::{Error, Result};

/// Placeholder port used in socket-only mode: the Unix socket path
/// carries a port suffix even when no TCP listener exists.
pub const SOCKET_ONLY_PORT: u16 = 64321;

/// Environment variable that preserves cluster directories on destroy.
pub const KEEP_CLUSTER_ENV: &str = "PGCRADLE_KEEP_CLUSTER";

/// Tunable profile for a disposable cluster.
///
/// All fields have defaults matching the harness's historical fixed
/// profile; load overrides from TOML with [`ClusterSettings::from_toml_file`]
/// or use struct update syntax on `ClusterSettings::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    /// Name of the database created for the test session.
    pub database: String,
    /// Connecting user; defaults to `PGUSER`, then the login user.
    pub user: String,
    /// Extension installed into the database and preloaded into every
    /// session, when set.
    pub extension: Option<String>,
    /// Helper SQL script loaded once after the extension is installed.
    /// Configured-but-missing is a fatal packaging defect.
    pub helper_sql: Option<PathBuf>,
    /// Readiness/shutdown timeout handed to `pg_ctl -t`, in seconds.
    pub startup_timeout_secs: u32,
    /// Preserve on-disk state when the cluster is destroyed, for
    /// post-mortem debugging. Also enabled by `PGCRADLE_KEEP_CLUSTER`.
    pub keep_cluster: bool,
    pub shared_buffers: String,
    pub max_connections: u32,
    pub statement_timeout: u32,
    pub lock_timeout: u32,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            database: "pgcradle".to_string(),
            user: default_user(),
            extension: None,
            helper_sql: None,
            startup_timeout_secs: 120,
            keep_cluster: std::env::var(KEEP_CLUSTER_ENV).is_ok_and(|v| !v.is_empty()),
            shared_buffers: "128MB".to_string(),
            max_connections: 50,
            statement_timeout: 0,
            lock_timeout: 0,
        }
    }
}

impl ClusterSettings {
    /// Load a settings profile from a TOML file.
    ///
    /// Missing keys keep their defaults, so a profile only needs to name
    /// the knobs it changes.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading settings profile {}", path.display()), e))?;
        toml::from_str(&content).map_err(|e| Error::io(
            format!("parsing settings profile {}", path.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        ))
    }
}

fn default_user() -> String {
    std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "postgres".to_string())
}

/// Computed, immutable layout of one cluster instance.
///
/// `data_dir` is always a strict sub-path of `base_dir`. The socket
/// directory lives outside `base_dir` (its own disposable namespace) so
/// the two survive independently during teardown ordering.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub base_dir: PathBuf,
    pub data_dir: PathBuf,
    pub logfile: PathBuf,
    pub host: String,
    /// `None` in socket-only mode; see [`InstanceConfig::effective_port`].
    pub tcp_port: Option<u16>,
    pub socket_dir: PathBuf,
    pub database: String,
    pub user: String,
}

impl InstanceConfig {
    /// Compute the instance layout from a base directory and an
    /// allocated endpoint.
    #[must_use]
    pub fn new(base_dir: PathBuf, endpoint: &Endpoint, settings: &ClusterSettings) -> Self {
        Self {
            data_dir: base_dir.join("data"),
            logfile: base_dir.join("postgres.log"),
            base_dir,
            host: endpoint.host.clone(),
            tcp_port: endpoint.tcp_port,
            socket_dir: endpoint.socket_dir.clone(),
            database: settings.database.clone(),
            user: settings.user.clone(),
        }
    }

    /// Port used in conf lines, `psql -p`, and `PGPORT`: the discovered
    /// TCP port, or the socket-only placeholder.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.tcp_port.unwrap_or(SOCKET_ONLY_PORT)
    }

    /// `listen_addresses` value: empty disables the TCP listener.
    #[must_use]
    pub fn listen_addresses(&self) -> &str {
        if self.tcp_port.is_some() { "127.0.0.1" } else { "" }
    }

    /// Rotated-log directory populated by the logging collector.
    #[must_use]
    pub fn rotated_log_dir(&self) -> PathBuf {
        self.data_dir.join("pg_log")
    }
}

/// Render the configuration block appended to `postgresql.conf`.
///
/// Appended after the defaults `initdb` generates, so every key here
/// overrides whatever the initializer set. Durability is deliberately
/// relaxed (`fsync = off` and friends): the cluster never outlives the
/// test session.
#[must_use]
pub fn render_conf_block(config: &InstanceConfig, settings: &ClusterSettings) -> String {
    let mut block = String::new();
    let mut line = |s: String| {
        block.push_str(&s);
        block.push('\n');
    };

    line(format!("listen_addresses = '{}'", config.listen_addresses()));
    line(format!("port = {}", config.effective_port()));
    line(format!(
        "unix_socket_directories = '{}'",
        config.socket_dir.display()
    ));
    line("logging_collector = on".to_string());
    line("log_destination = 'stderr,csvlog'".to_string());
    line("log_directory = 'pg_log'".to_string());
    line("log_min_messages = warning".to_string());
    line("log_line_prefix = '%t [%p]: [%l-1] user=%u,db=%d,app=%a,client=%h '".to_string());
    line("log_statement = 'all'".to_string());
    if let Some(extension) = &settings.extension {
        line(format!("session_preload_libraries = '{extension}'"));
    }
    line("fsync = off".to_string());
    line("synchronous_commit = off".to_string());
    line("full_page_writes = off".to_string());
    line(format!("shared_buffers = '{}'", settings.shared_buffers));
    line(format!("max_connections = {}", settings.max_connections));
    line(format!("statement_timeout = {}", settings.statement_timeout));
    line(format!("lock_timeout = {}", settings.lock_timeout));
    block
}
