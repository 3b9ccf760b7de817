//! PostgreSQL toolchain discovery.
//!
//! Locates the external binaries the harness drives: the data-directory
//! initializer (`initdb`), the process controller (`pg_ctl`), the SQL
//! client (`psql`), and optionally the load generator (`pgbench`).
//! Resolution goes through `pg_config --bindir`; set the `PG_CONFIG`
//! environment variable to point at a specific installation.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::argv;
use crate::command;
use crate::error::{Error, Result};

/// Environment variable overriding the `pg_config` binary to use.
pub const PG_CONFIG_ENV: &str = "PG_CONFIG";

/// Resolved paths to the PostgreSQL binaries.
#[derive(Debug, Clone)]
pub struct PgToolchain {
    /// Installation `bindir` reported by `pg_config`.
    pub bindir: PathBuf,
    pub initdb: PathBuf,
    pub pg_ctl: PathBuf,
    pub psql: PathBuf,
    /// `None` when pgbench exists neither in `bindir` nor on `PATH`;
    /// load-generation requests then fail with
    /// [`Error::LoadGeneratorUnavailable`](crate::Error::LoadGeneratorUnavailable).
    pub pgbench: Option<PathBuf>,
}

impl PgToolchain {
    /// Locate the toolchain via `pg_config`.
    ///
    /// Honors [`PG_CONFIG_ENV`]; otherwise expects `pg_config` on `PATH`.
    pub fn locate() -> Result<Self> {
        let pg_config =
            std::env::var(PG_CONFIG_ENV).unwrap_or_else(|_| "pg_config".to_string());
        Self::from_pg_config(Path::new(&pg_config))
    }

    /// Locate the toolchain via an explicit `pg_config` binary.
    pub fn from_pg_config(pg_config: &Path) -> Result<Self> {
        let output =
            command::run(pg_config, &argv!["--bindir"], &Vec::new()).map_err(|e| {
                Error::toolchain_missing(format!(
                    "`{} --bindir` failed: {e}",
                    pg_config.display()
                ))
            })?;
        let bindir = PathBuf::from(output.stdout.trim());
        if bindir.as_os_str().is_empty() {
            return Err(Error::toolchain_missing(format!(
                "`{} --bindir` reported an empty path",
                pg_config.display()
            )));
        }
        debug!(bindir = %bindir.display(), "located PostgreSQL toolchain");

        let pgbench = locate_pgbench(&bindir);
        Ok(Self {
            initdb: bindir.join("initdb"),
            pg_ctl: bindir.join("pg_ctl"),
            psql: bindir.join("psql"),
            pgbench,
            bindir,
        })
    }
}

/// Prefer the installation's own pgbench; fall back to `PATH`.
fn locate_pgbench(bindir: &Path) -> Option<PathBuf> {
    let candidate = bindir.join("pgbench");
    if candidate.exists() {
        return Some(candidate);
    }
    search_path("pgbench")
}

/// Minimal `PATH` search for an executable name.
fn search_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
