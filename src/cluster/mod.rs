//! Lifecycle management for one disposable cluster instance.
//!
//! [`PgCluster`] owns the full lifecycle of a single PostgreSQL server:
//! provision on-disk state, apply configuration, start the process,
//! wait for readiness, and later stop and destroy it. Every transition
//! is idempotent, so a teardown path that runs after a partial failure
//! still releases whatever was acquired.
//!
//! Lifecycle state moves strictly forward:
//!
//! ```text
//! Uninitialized -> Initializing -> Running -> Stopped -> Destroyed
//! ```
//!
//! A stopped cluster cannot be restarted; the only thing left to do
//! with it is inspect its on-disk state and destroy it. The manager is
//! single-owner: callers serialize lifecycle calls externally (tests
//! start one instance per session), while the running server itself
//! accepts arbitrary concurrent client traffic that this type does not
//! mediate.

pub mod logs;
pub mod session;

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::allocator;
use crate::argv;
use crate::classify;
use crate::command::{self, CommandOutput};
use crate::config::{ClusterSettings, InstanceConfig, render_conf_block};
use crate::error::{Error, Result};
use crate::toolchain::PgToolchain;

pub use logs::LogArchive;
pub use session::{ConnectionInfo, LoadProfile, Session};

/// Where an instance is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Running,
    Stopped,
    Destroyed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        };
        f.write_str(label)
    }
}

/// Manages one temporary PostgreSQL cluster.
#[derive(Debug)]
pub struct PgCluster {
    base_dir: PathBuf,
    settings: ClusterSettings,
    toolchain: PgToolchain,
    config: Option<InstanceConfig>,
    state: LifecycleState,
}

impl PgCluster {
    /// Create a manager rooted at `base_dir`, locating the toolchain
    /// via `pg_config`.
    ///
    /// Nothing touches the filesystem until [`initialize`](Self::initialize).
    pub fn new(base_dir: impl Into<PathBuf>, settings: ClusterSettings) -> Result<Self> {
        let toolchain = PgToolchain::locate()?;
        Ok(Self::with_toolchain(base_dir, settings, toolchain))
    }

    /// Create a manager with an explicitly resolved toolchain.
    #[must_use]
    pub fn with_toolchain(
        base_dir: impl Into<PathBuf>,
        settings: ClusterSettings,
        toolchain: PgToolchain,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            settings,
            toolchain,
            config: None,
            state: LifecycleState::Uninitialized,
        }
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    #[must_use]
    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    #[must_use]
    pub fn toolchain(&self) -> &PgToolchain {
        &self.toolchain
    }

    /// Instance layout, available once initialization has allocated
    /// resources.
    #[must_use]
    pub fn config(&self) -> Option<&InstanceConfig> {
        self.config.as_ref()
    }

    /// Facade for driving SQL and load generation against the instance.
    #[must_use]
    pub fn session(&self) -> Session<'_> {
        Session::new(self)
    }

    /// Provision and start the instance; no-op when already running.
    ///
    /// Combines directory provisioning, resource allocation, `initdb`,
    /// configuration, server start (blocking until ready or the
    /// configured timeout), database creation, and extension/helper-SQL
    /// setup. Classified environment failures surface as
    /// [`Error::EnvironmentUnsupported`]; anything else propagates
    /// unchanged.
    pub fn initialize(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Running => return Ok(()),
            LifecycleState::Stopped | LifecycleState::Destroyed => {
                return Err(Error::InvalidTransition {
                    operation: "initialize",
                    state: self.state,
                });
            },
            LifecycleState::Uninitialized | LifecycleState::Initializing => {},
        }
        self.state = LifecycleState::Initializing;

        fs::create_dir_all(&self.base_dir).map_err(|e| {
            Error::io(format!("creating base dir {}", self.base_dir.display()), e)
        })?;

        let endpoint = allocator::allocate(&self.namespace())?;
        let config = InstanceConfig::new(self.base_dir.clone(), &endpoint, &self.settings);
        // Stored before anything can fail so destroy() can still find
        // and remove the socket directory after a partial start.
        self.config = Some(config.clone());

        self.run_initdb(&config)?;
        append_conf_block(&config, &self.settings)?;
        self.run_pg_ctl(&config, "start", &[])?;
        self.state = LifecycleState::Running;
        info!(
            base_dir = %config.base_dir.display(),
            port = config.effective_port(),
            "cluster running"
        );

        let session = Session::new(&*self);
        session.create_database(&config.database)?;
        if let Some(extension) = self.settings.extension.clone() {
            session.run_sql(&format!("CREATE EXTENSION IF NOT EXISTS {extension}"))?;
        }
        if let Some(helper) = self.settings.helper_sql.clone() {
            if !helper.exists() {
                return Err(Error::PreconditionMissing { path: helper });
            }
            session.run_sql_file(&helper)?;
        }
        Ok(())
    }

    /// Shut the server down; no-op unless running.
    ///
    /// Failures from the stop command are swallowed (logged only): a
    /// failed stop must not prevent the ensuing destroy from attempting
    /// cleanup.
    pub fn stop(&mut self) {
        if self.state != LifecycleState::Running {
            return;
        }
        if let Some(config) = self.config.clone() {
            if let Err(e) = self.run_pg_ctl(&config, "stop", &argv!["-m", "fast"]) {
                warn!(error = %e, "pg_ctl stop failed; continuing teardown");
            }
        }
        self.state = LifecycleState::Stopped;
    }

    /// Stop the server and remove everything it owned on disk.
    ///
    /// Safe to call repeatedly; already-missing directories are
    /// success. When the keep flag is set (settings or
    /// `PGCRADLE_KEEP_CLUSTER`), directories survive for post-mortem
    /// inspection.
    pub fn destroy(&mut self) -> Result<()> {
        self.stop();
        if self.settings.keep_cluster {
            info!(base_dir = %self.base_dir.display(), "keep flag set; preserving cluster");
        } else {
            remove_dir_if_present(&self.base_dir)?;
            if let Some(config) = &self.config {
                remove_dir_if_present(&config.socket_dir)?;
            }
        }
        self.state = LifecycleState::Destroyed;
        Ok(())
    }

    /// Namespace fragment for the socket directory, from the base-dir
    /// name.
    fn namespace(&self) -> String {
        self.base_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cluster".to_string())
    }

    /// Run the directory initializer with fixed, portable flags: UTF-8,
    /// no OS locale, mmap-backed dynamic shared memory.
    fn run_initdb(&self, config: &InstanceConfig) -> Result<()> {
        let result = command::run(
            &self.toolchain.initdb,
            &argv![
                "-D",
                &config.data_dir,
                "-U",
                &config.user,
                "--encoding",
                "UTF8",
                "--no-locale",
                "--set",
                "dynamic_shared_memory_type=mmap",
            ],
            &Vec::new(),
        );
        match result {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed {
                program,
                args,
                status,
                stdout,
                stderr,
            }) => match classify::classify(&stdout, &stderr) {
                Some(kind) => Err(Error::EnvironmentUnsupported {
                    kind,
                    detail: format!("initdb failed: {}", kind.explanation()),
                }),
                // Unclassified failures are genuine bugs, not
                // environment limits; propagate verbatim.
                None => Err(Error::CommandFailed {
                    program,
                    args,
                    status,
                    stdout,
                    stderr,
                }),
            },
            Err(other) => Err(other),
        }
    }

    /// Drive the process controller, waiting up to the configured
    /// timeout for the action to complete.
    fn run_pg_ctl(
        &self,
        config: &InstanceConfig,
        action: &str,
        extra_args: &[&OsStr],
    ) -> Result<CommandOutput> {
        let timeout = self.settings.startup_timeout_secs.to_string();
        let mut args: Vec<&OsStr> = vec![
            OsStr::new("-D"),
            config.data_dir.as_os_str(),
            OsStr::new("-l"),
            config.logfile.as_os_str(),
            OsStr::new("-w"),
            OsStr::new("-t"),
            OsStr::new(&timeout),
            OsStr::new(action),
        ];
        args.extend_from_slice(extra_args);
        debug!(action, "running pg_ctl");
        command::run(&self.toolchain.pg_ctl, &args, &Vec::new())
    }
}

/// Last line of defense: a dropped cluster still tears itself down.
impl Drop for PgCluster {
    fn drop(&mut self) {
        if self.state != LifecycleState::Destroyed {
            if let Err(e) = self.destroy() {
                warn!(error = %e, "cluster teardown on drop failed");
            }
        }
    }
}

/// Append the deterministic settings block to `postgresql.conf`.
fn append_conf_block(config: &InstanceConfig, settings: &ClusterSettings) -> Result<()> {
    let conf = config.data_dir.join("postgresql.conf");
    let block = render_conf_block(config, settings);
    let mut file = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&conf)
        .map_err(|e| Error::io(format!("opening {}", conf.display()), e))?;
    write!(file, "\n{block}").map_err(|e| Error::io(format!("appending to {}", conf.display()), e))
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("removing {}", dir.display()), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Fake toolchain whose initdb creates the data directory and whose
    /// pg_ctl/psql succeed without doing anything.
    fn stub_toolchain(dir: &Path) -> PgToolchain {
        let initdb = dir.join("initdb");
        write_script(&initdb, "#!/bin/sh\nmkdir -p \"$2\"\n");
        PgToolchain {
            bindir: dir.to_path_buf(),
            initdb,
            pg_ctl: PathBuf::from("/bin/true"),
            psql: PathBuf::from("/bin/true"),
            pgbench: None,
        }
    }

    fn failing_initdb_toolchain(dir: &Path, stderr: &str) -> PgToolchain {
        let initdb = dir.join("initdb");
        write_script(&initdb, &format!("#!/bin/sh\necho '{stderr}' >&2\nexit 1\n"));
        PgToolchain {
            bindir: dir.to_path_buf(),
            initdb,
            pg_ctl: PathBuf::from("/bin/true"),
            psql: PathBuf::from("/bin/true"),
            pgbench: None,
        }
    }

    fn write_script(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn settings() -> ClusterSettings {
        ClusterSettings {
            keep_cluster: false,
            ..ClusterSettings::default()
        }
    }

    #[test]
    fn test_initialize_reaches_running_and_is_idempotent() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let base = scratch.path().join("cluster");
        let mut cluster = PgCluster::with_toolchain(&base, settings(), toolchain);

        cluster.initialize().unwrap();
        assert_eq!(cluster.state(), LifecycleState::Running);
        let port = cluster.config().unwrap().effective_port();

        // Second call is a no-op: no re-allocation, no second process.
        cluster.initialize().unwrap();
        assert_eq!(cluster.config().unwrap().effective_port(), port);
        cluster.destroy().unwrap();
    }

    #[test]
    fn test_stop_is_noop_when_not_running() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let mut cluster =
            PgCluster::with_toolchain(scratch.path().join("cluster"), settings(), toolchain);

        cluster.stop();
        assert_eq!(cluster.state(), LifecycleState::Uninitialized);
        cluster.stop();
        assert_eq!(cluster.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn test_stopped_cluster_cannot_restart() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let mut cluster =
            PgCluster::with_toolchain(scratch.path().join("cluster"), settings(), toolchain);

        cluster.initialize().unwrap();
        cluster.stop();
        assert_eq!(cluster.state(), LifecycleState::Stopped);
        let err = cluster.initialize().unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        cluster.destroy().unwrap();
    }

    #[test]
    fn test_destroy_removes_dirs_and_is_repeat_safe() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let base = scratch.path().join("cluster");
        let mut cluster = PgCluster::with_toolchain(&base, settings(), toolchain);

        cluster.initialize().unwrap();
        let socket_dir = cluster.config().unwrap().socket_dir.clone();
        assert!(base.exists());
        assert!(socket_dir.exists());

        cluster.destroy().unwrap();
        assert!(!base.exists());
        assert!(!socket_dir.exists());
        assert_eq!(cluster.state(), LifecycleState::Destroyed);

        // Second destroy with everything already gone.
        cluster.destroy().unwrap();
    }

    #[test]
    fn test_destroy_honors_keep_flag() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let base = scratch.path().join("cluster");
        let mut cluster = PgCluster::with_toolchain(
            &base,
            ClusterSettings {
                keep_cluster: true,
                ..ClusterSettings::default()
            },
            toolchain,
        );

        cluster.initialize().unwrap();
        let socket_dir = cluster.config().unwrap().socket_dir.clone();
        cluster.destroy().unwrap();
        assert!(base.exists());
        assert!(socket_dir.exists());

        fs::remove_dir_all(&base).unwrap();
        fs::remove_dir_all(&socket_dir).unwrap();
    }

    #[test]
    fn test_destroy_without_initialize_is_safe() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let mut cluster =
            PgCluster::with_toolchain(scratch.path().join("never_made"), settings(), toolchain);
        cluster.destroy().unwrap();
        assert_eq!(cluster.state(), LifecycleState::Destroyed);
    }

    #[test]
    fn test_classified_initdb_failure_is_environment_unsupported() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = failing_initdb_toolchain(
            scratch.path(),
            "FATAL: could not create shared memory segment: Operation not permitted",
        );
        let mut cluster =
            PgCluster::with_toolchain(scratch.path().join("cluster"), settings(), toolchain);

        let err = cluster.initialize().unwrap_err();
        assert!(matches!(err, Error::EnvironmentUnsupported { .. }));
        // Teardown after the classified failure still cleans up.
        cluster.destroy().unwrap();
        assert!(!scratch.path().join("cluster").exists());
    }

    #[test]
    fn test_unclassified_initdb_failure_propagates_verbatim() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = failing_initdb_toolchain(scratch.path(), "initdb: bogus flag");
        let mut cluster =
            PgCluster::with_toolchain(scratch.path().join("cluster"), settings(), toolchain);

        let err = cluster.initialize().unwrap_err();
        match err {
            Error::CommandFailed { stderr, .. } => assert!(stderr.contains("bogus flag")),
            other => panic!("unexpected error: {other}"),
        }
        cluster.destroy().unwrap();
    }

    #[test]
    fn test_missing_helper_sql_is_precondition_failure() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let mut cluster = PgCluster::with_toolchain(
            scratch.path().join("cluster"),
            ClusterSettings {
                helper_sql: Some(scratch.path().join("does_not_exist.sql")),
                ..settings()
            },
            toolchain,
        );

        let err = cluster.initialize().unwrap_err();
        assert!(matches!(err, Error::PreconditionMissing { .. }));
        cluster.destroy().unwrap();
    }

    #[test]
    fn test_conf_block_is_appended_to_existing_conf() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let base = scratch.path().join("cluster");
        let mut cluster = PgCluster::with_toolchain(&base, settings(), toolchain);
        cluster.initialize().unwrap();

        let conf = fs::read_to_string(base.join("data").join("postgresql.conf")).unwrap();
        assert!(conf.contains("logging_collector = on"));
        assert!(conf.contains("fsync = off"));
        cluster.destroy().unwrap();
    }

    #[test]
    fn test_drop_tears_down() {
        let scratch = tempfile::tempdir().unwrap();
        let toolchain = stub_toolchain(scratch.path());
        let base = scratch.path().join("cluster");
        let socket_dir;
        {
            let mut cluster = PgCluster::with_toolchain(&base, settings(), toolchain);
            cluster.initialize().unwrap();
            socket_dir = cluster.config().unwrap().socket_dir.clone();
        }
        assert!(!base.exists());
        assert!(!socket_dir.exists());
    }
}
