//! Disposable PostgreSQL cluster harness for integration test suites.
//!
//! `pgcradle` provisions one fully isolated, throwaway PostgreSQL
//! instance on demand, exposes a narrow API for driving SQL and pgbench
//! workloads against it, and guarantees teardown of every acquired
//! resource (server process, data directories, sockets) no matter how
//! the session ends.
//!
//! # Example
//!
//! ```no_run
//! use pgcradle::{ClusterSettings, PgCluster};
//!
//! # fn main() -> pgcradle::Result<()> {
//! let mut cluster = PgCluster::new("/tmp/my_test_cluster", ClusterSettings::default())?;
//! cluster.initialize()?;
//!
//! let session = cluster.session();
//! session.run_sql("SELECT 1")?;
//! println!("{}", session.connection_info()?.dsn());
//!
//! cluster.destroy()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Environment classification
//!
//! Sandboxes that forbid shared-memory IPC or TCP binds are a fact of
//! CI life. Startup failures caused by the *environment* surface as
//! [`Error::EnvironmentUnsupported`] so a suite can skip instead of
//! fail; everything else propagates verbatim. See [`classify`] for the
//! (deliberately best-effort) heuristics.

pub mod allocator;
pub mod classify;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod toolchain;

pub use classify::EnvFailureKind;
pub use cluster::{ConnectionInfo, LifecycleState, LoadProfile, LogArchive, PgCluster, Session};
pub use command::{CommandHandle, CommandOutput};
pub use config::{ClusterSettings, InstanceConfig};
pub use error::{Error, Result};
pub use toolchain::PgToolchain;
