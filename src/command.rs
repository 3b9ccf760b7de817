//! External command execution with captured output.
//!
//! Every process the harness drives (`initdb`, `pg_ctl`, `psql`,
//! `pgbench`) goes through this module, so success-or-error semantics
//! and output capture are uniform:
//!
//! - [`run`] executes to completion and errors on non-zero exit.
//! - [`spawn`] launches without waiting and returns a [`CommandHandle`];
//!   its `wait()` is the only blocking point, so a test can run two load
//!   generators concurrently by spawning both before waiting on either.
//!
//! Connection parameters for child processes are passed as an explicit
//! environment mapping layered over the inherited environment. The
//! process-global environment is never mutated.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::error::{Error, Result};

/// Extra environment variables threaded into a child process.
pub type EnvMap = Vec<(String, String)>;

/// Captured output of a completed external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A spawned, not-yet-waited external command.
#[derive(Debug)]
pub struct CommandHandle {
    program: String,
    args: Vec<String>,
    child: Child,
}

impl CommandHandle {
    /// Process ID of the running child.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Block until the process exits, collecting its output.
    ///
    /// Returns [`Error::CommandFailed`] on non-zero exit, with the
    /// captured stdout/stderr attached.
    pub fn wait(self) -> Result<CommandOutput> {
        let Self {
            program,
            args,
            child,
        } = self;
        let output = child
            .wait_with_output()
            .map_err(|e| Error::io(format!("waiting for `{program}`"), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(%program, status = ?output.status.code(), "command finished");

        if output.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            Err(Error::CommandFailed {
                program,
                args,
                status: output.status.code(),
                stdout,
                stderr,
            })
        }
    }
}

/// Run an external command to completion, capturing its output.
///
/// `env` entries are added on top of the inherited environment of the
/// child only; non-zero exit is an error carrying the captured output.
pub fn run(program: &Path, args: &[&OsStr], env: &EnvMap) -> Result<CommandOutput> {
    spawn(program, args, env)?.wait()
}

/// Launch an external command without waiting for it.
///
/// Stdout and stderr are piped so the eventual [`CommandHandle::wait`]
/// can capture them.
pub fn spawn(program: &Path, args: &[&OsStr], env: &EnvMap) -> Result<CommandHandle> {
    let program_label = program.display().to_string();
    debug!(program = %program_label, ?args, "spawning command");

    let child = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::io(format!("spawning `{program_label}`"), e))?;

    Ok(CommandHandle {
        program: program_label,
        args: args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect(),
        child,
    })
}

/// Convenience for building an argv slice out of string-ish values.
#[macro_export]
macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        [$(std::ffi::OsStr::new($arg)),*]
    };
}
