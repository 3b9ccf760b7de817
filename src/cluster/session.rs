//! Convenience facade over a running cluster instance.
//!
//! A [`Session`] borrows its [`PgCluster`](super::PgCluster) and can
//! therefore never mutate lifecycle state; everything it does goes
//! through the SQL client or reads files the server already wrote:
//!
//! - execute ad hoc statements and statement files
//! - produce a connection descriptor and subprocess environment
//! - read and reset the server log window
//! - drive pgbench load against the instance

use std::ffi::OsStr;
use std::path::Path;

use tracing::debug;

use crate::command::{self, CommandHandle, CommandOutput, EnvMap};
use crate::config::{InstanceConfig, SOCKET_ONLY_PORT};
use crate::error::{Error, Result};

use super::logs::LogArchive;
use super::PgCluster;

/// Maintenance database used for `CREATE DATABASE`.
const MAINTENANCE_DB: &str = "postgres";

/// Minimal descriptor any SQL client needs to connect.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// `127.0.0.1`, or the socket directory path in socket-only mode.
    pub host: String,
    /// `None` when the server listens on a Unix socket only.
    pub port: Option<u16>,
    pub database: String,
    pub user: String,
}

impl ConnectionInfo {
    /// Keyword/value connection string:
    /// `host=<h> port=<p> dbname=<d> user=<u>`.
    #[must_use]
    pub fn dsn(&self) -> String {
        format!(
            "host={} port={} dbname={} user={}",
            self.host,
            self.effective_port(),
            self.database,
            self.user
        )
    }

    /// Standard four-variable connection environment for subprocesses
    /// (`PGHOST`, `PGPORT`, `PGDATABASE`, `PGUSER`).
    ///
    /// Returned as an explicit mapping to thread into process spawns;
    /// the global environment is never mutated.
    #[must_use]
    pub fn client_env(&self) -> EnvMap {
        vec![
            ("PGHOST".to_string(), self.host.clone()),
            ("PGPORT".to_string(), self.effective_port().to_string()),
            ("PGDATABASE".to_string(), self.database.clone()),
            ("PGUSER".to_string(), self.user.clone()),
        ]
    }

    /// Same endpoint, different database.
    #[must_use]
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }

    fn effective_port(&self) -> u16 {
        self.port.unwrap_or(SOCKET_ONLY_PORT)
    }
}

/// Load-generation parameters for a pgbench run.
#[derive(Debug, Clone)]
pub struct LoadProfile {
    pub clients: u32,
    pub threads: u32,
    pub duration_secs: u32,
    /// Extra flags appended before the database name.
    pub extra_args: Vec<String>,
}

impl Default for LoadProfile {
    fn default() -> Self {
        Self {
            clients: 4,
            threads: 2,
            duration_secs: 5,
            extra_args: Vec::new(),
        }
    }
}

/// Facade over one running instance.
#[derive(Debug, Clone, Copy)]
pub struct Session<'a> {
    cluster: &'a PgCluster,
}

impl<'a> Session<'a> {
    pub(crate) fn new(cluster: &'a PgCluster) -> Self {
        Self { cluster }
    }

    /// Execute one statement against the session database.
    pub fn run_sql(&self, sql: &str) -> Result<CommandOutput> {
        let config = self.require_config()?;
        self.psql(config, &config.database, Payload::Statement(sql), false)
    }

    /// Execute one statement against a named database.
    pub fn run_sql_in(&self, sql: &str, database: &str) -> Result<CommandOutput> {
        let config = self.require_config()?;
        self.psql(config, database, Payload::Statement(sql), false)
    }

    /// Stream a statement file into the session database.
    pub fn run_sql_file(&self, path: &Path) -> Result<CommandOutput> {
        let config = self.require_config()?;
        self.psql(config, &config.database, Payload::File(path), false)
    }

    /// Stream a statement file into a named database.
    pub fn run_sql_file_in(&self, path: &Path, database: &str) -> Result<CommandOutput> {
        let config = self.require_config()?;
        self.psql(config, database, Payload::File(path), false)
    }

    /// Create a database, treating "already exists" as success.
    ///
    /// Must stay idempotent against races with prior partial runs.
    pub fn create_database(&self, database: &str) -> Result<()> {
        let config = self.require_config()?;
        self.psql(
            config,
            MAINTENANCE_DB,
            Payload::Statement(&format!("CREATE DATABASE {database}")),
            true,
        )?;
        Ok(())
    }

    /// Connection descriptor for the session database.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        let config = self.require_config()?;
        Ok(ConnectionInfo {
            host: config.host.clone(),
            port: config.tcp_port,
            database: config.database.clone(),
            user: config.user.clone(),
        })
    }

    /// Concatenated server log text (primary plus rotated files).
    pub fn read_log(&self) -> Result<String> {
        self.log_archive()?.read()
    }

    /// Reset the log window between independent test cases.
    pub fn truncate_log(&self) -> Result<()> {
        self.log_archive()?.truncate()
    }

    /// True when a pgbench binary was located.
    #[must_use]
    pub fn pgbench_available(&self) -> bool {
        self.cluster.toolchain().pgbench.is_some()
    }

    /// Run pgbench to completion against the session database.
    ///
    /// Non-zero exit surfaces as [`Error::CommandFailed`] with captured
    /// output attached.
    pub fn pgbench_run(&self, script: &Path, profile: &LoadProfile) -> Result<CommandOutput> {
        self.pgbench_spawn(script, profile)?.wait()
    }

    /// Launch pgbench without waiting, for concurrent load scenarios.
    ///
    /// Fails with [`Error::LoadGeneratorUnavailable`] before touching
    /// the filesystem or spawning anything when pgbench was never
    /// located.
    pub fn pgbench_spawn(&self, script: &Path, profile: &LoadProfile) -> Result<CommandHandle> {
        let Some(pgbench) = self.cluster.toolchain().pgbench.as_deref() else {
            return Err(Error::LoadGeneratorUnavailable);
        };
        let config = self.require_config()?;
        let port = config.effective_port().to_string();
        let clients = profile.clients.to_string();
        let threads = profile.threads.to_string();
        let duration = profile.duration_secs.to_string();

        let mut args: Vec<&OsStr> = vec![
            OsStr::new("-h"),
            OsStr::new(&config.host),
            OsStr::new("-p"),
            OsStr::new(&port),
            OsStr::new("-n"),
            OsStr::new("-c"),
            OsStr::new(&clients),
            OsStr::new("-j"),
            OsStr::new(&threads),
            OsStr::new("-T"),
            OsStr::new(&duration),
            OsStr::new("-f"),
            script.as_os_str(),
        ];
        args.extend(profile.extra_args.iter().map(|a| OsStr::new(a.as_str())));
        args.push(OsStr::new(&config.database));

        debug!(clients = profile.clients, duration = profile.duration_secs, "starting pgbench");
        command::spawn(pgbench, &args, &self.connection_info()?.client_env())
    }

    fn log_archive(&self) -> Result<LogArchive> {
        let config = self.require_config()?;
        Ok(LogArchive::new(
            config.logfile.clone(),
            config.rotated_log_dir(),
        ))
    }

    fn require_config(&self) -> Result<&'a InstanceConfig> {
        self.cluster.config().ok_or(Error::InvalidTransition {
            operation: "use",
            state: self.cluster.state(),
        })
    }

    /// Shared psql delivery: fail fast on errors, optionally tolerating
    /// an "already exists" rejection for idempotent statements.
    fn psql(
        &self,
        config: &InstanceConfig,
        database: &str,
        payload: Payload<'_>,
        tolerate_exists: bool,
    ) -> Result<CommandOutput> {
        let port = config.effective_port().to_string();
        let mut args: Vec<&OsStr> = vec![
            OsStr::new("-h"),
            OsStr::new(&config.host),
            OsStr::new("-p"),
            OsStr::new(&port),
            OsStr::new("-d"),
            OsStr::new(database),
            OsStr::new("-v"),
            OsStr::new("ON_ERROR_STOP=1"),
        ];
        match payload {
            Payload::Statement(sql) => {
                args.push(OsStr::new("-c"));
                args.push(OsStr::new(sql));
            },
            Payload::File(path) => {
                args.push(OsStr::new("-f"));
                args.push(path.as_os_str());
            },
        }

        let env = self.connection_info()?.with_database(database).client_env();
        match command::run(&self.cluster.toolchain().psql, &args, &env) {
            Ok(output) => Ok(output),
            Err(Error::CommandFailed { ref stderr, .. })
                if tolerate_exists && stderr.contains("already exists") =>
            {
                Ok(CommandOutput::default())
            },
            Err(other) => Err(other),
        }
    }
}

/// What gets handed to the SQL client: an inline statement or a file.
enum Payload<'a> {
    Statement(&'a str),
    File(&'a Path),
}
