//! pgcradle CLI: drive a throwaway PostgreSQL cluster from the shell.
//!
//! - `pgcradle check` - locate the toolchain and print what resolved
//! - `pgcradle exec` - provision a cluster, run SQL, tear it down
//! - `pgcradle bench` - provision a cluster, run a pgbench script
//!
//! Environment-level failures (sandbox forbids shared memory, pgbench
//! missing) exit with code 2 and a "skipped" message so wrapper scripts
//! can tell them apart from real failures.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use pgcradle::{ClusterSettings, Error, LoadProfile, PgCluster, PgToolchain};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "pgcradle", version, about = "Disposable PostgreSQL cluster harness")]
struct Cli {
    /// Settings profile (TOML); missing keys keep their defaults.
    #[arg(long, global = true)]
    profile: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate the PostgreSQL toolchain and print the resolved binaries.
    Check,
    /// Provision a throwaway cluster, run SQL against it, destroy it.
    Exec {
        /// Inline statement to execute.
        #[arg(long, conflicts_with = "file")]
        sql: Option<String>,
        /// Statement file to execute.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Preserve the cluster directories for post-mortem inspection.
        #[arg(long)]
        keep: bool,
    },
    /// Provision a throwaway cluster and run a pgbench script.
    Bench {
        /// pgbench script file.
        #[arg(long)]
        script: PathBuf,
        /// Concurrent client connections.
        #[arg(short = 'c', long, default_value_t = 4)]
        clients: u32,
        /// Worker threads.
        #[arg(short = 'j', long, default_value_t = 2)]
        threads: u32,
        /// Run duration in seconds.
        #[arg(short = 'T', long, default_value_t = 5)]
        duration: u32,
        /// Preserve the cluster directories for post-mortem inspection.
        #[arg(long)]
        keep: bool,
    },
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Environment limits are "skip", not "fail".
            if let Some(harness_err) = e.downcast_ref::<Error>()
                && harness_err.is_skippable()
            {
                eprintln!("skipped: {harness_err}");
                return ExitCode::from(2);
            }
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        },
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.profile {
        Some(path) => ClusterSettings::from_toml_file(path)?,
        None => ClusterSettings::default(),
    };

    match cli.command {
        Commands::Check => check(),
        Commands::Exec { sql, file, keep } => exec(settings, sql, file, keep),
        Commands::Bench {
            script,
            clients,
            threads,
            duration,
            keep,
        } => bench(settings, script, clients, threads, duration, keep),
    }
}

fn check() -> Result<()> {
    let toolchain = PgToolchain::locate()?;
    println!("bindir:  {}", toolchain.bindir.display());
    println!("initdb:  {}", toolchain.initdb.display());
    println!("pg_ctl:  {}", toolchain.pg_ctl.display());
    println!("psql:    {}", toolchain.psql.display());
    match &toolchain.pgbench {
        Some(path) => println!("pgbench: {}", path.display()),
        None => println!("pgbench: not found (load generation unavailable)"),
    }
    Ok(())
}

fn exec(
    mut settings: ClusterSettings,
    sql: Option<String>,
    file: Option<PathBuf>,
    keep: bool,
) -> Result<()> {
    settings.keep_cluster |= keep;
    let mut cluster = provision(settings)?;

    let result = (|| -> Result<String> {
        let session = cluster.session();
        let output = match (&sql, &file) {
            (Some(statement), _) => session.run_sql(statement)?,
            (None, Some(path)) => session.run_sql_file(path)?,
            (None, None) => anyhow::bail!("one of --sql or --file is required"),
        };
        Ok(output.stdout)
    })();

    finish(&mut cluster, keep)?;
    print!("{}", result?);
    Ok(())
}

fn bench(
    mut settings: ClusterSettings,
    script: PathBuf,
    clients: u32,
    threads: u32,
    duration: u32,
    keep: bool,
) -> Result<()> {
    settings.keep_cluster |= keep;
    let mut cluster = provision(settings)?;

    let profile = LoadProfile {
        clients,
        threads,
        duration_secs: duration,
        extra_args: Vec::new(),
    };
    let result = cluster.session().pgbench_run(&script, &profile);

    finish(&mut cluster, keep)?;
    let output = result?;
    print!("{}", output.stdout);
    Ok(())
}

fn provision(settings: ClusterSettings) -> Result<PgCluster> {
    let base_dir = tempfile::Builder::new()
        .prefix("pgcradle_cli_")
        .tempdir()
        .context("creating scratch directory")?
        .keep();
    let mut cluster = PgCluster::new(base_dir, settings)?;
    if let Err(e) = cluster.initialize() {
        // Best effort: don't leave a half-built cluster behind a
        // provisioning error.
        let _ = cluster.destroy();
        return Err(e.into());
    }
    Ok(cluster)
}

fn finish(cluster: &mut PgCluster, keep: bool) -> Result<()> {
    if keep && let Some(config) = cluster.config() {
        eprintln!("cluster preserved at {}", config.base_dir.display());
    }
    // With the keep flag set, destroy stops the server but leaves the
    // directories in place.
    cluster.destroy().context("destroying cluster")
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
