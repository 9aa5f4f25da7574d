//! External command execution
//!
//! Engine start/stop scripts, log readers, restore and verification tools all
//! run through [`ProcessControl`]. Each invocation carries its own timeout and
//! has its output captured so that tools which report failure only in their
//! text can still be caught.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::ToolPaths;

/// Errors raised while running an external command
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {code:?}: {stderr}")]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} reported an error: {line}")]
    ErrorSentinel { program: String, line: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One external command invocation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File fed to the command's stdin
    pub stdin_file: Option<PathBuf>,
    /// File that receives stdout instead of the capture buffer
    pub stdout_file: Option<PathBuf>,
    /// OS user to run as, through `su`
    pub run_as: Option<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin_file: None,
            stdout_file: None,
            run_as: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn with_stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn with_run_as(mut self, user: impl Into<String>) -> Self {
        self.run_as = Some(user.into());
        self
    }

    /// `start-redis.sh <port>`
    pub fn start_instance(tools: &ToolPaths, port: u16, timeout: Duration) -> Self {
        Self::new(&tools.start_script, timeout).arg(port.to_string())
    }

    /// `stop-redis.sh <port>`
    pub fn stop_instance(tools: &ToolPaths, port: u16, timeout: Duration) -> Self {
        Self::new(&tools.stop_script, timeout).arg(port.to_string())
    }

    /// File name of the program, for logs and errors
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        if let Some(stdin) = &self.stdin_file {
            write!(f, " < {}", stdin.display())?;
        }
        if let Some(stdout) = &self.stdout_file {
            write!(f, " > {}", stdout.display())?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Require a zero exit and no error sentinel in either stream
    pub fn check(self, spec: &CommandSpec) -> Result<Self, ProcessError> {
        if !self.success() {
            return Err(ProcessError::NonZeroExit {
                program: spec.program_name(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            });
        }
        if let Some(line) =
            scan_error_sentinels(&self.stdout).or_else(|| scan_error_sentinels(&self.stderr))
        {
            return Err(ProcessError::ErrorSentinel {
                program: spec.program_name(),
                line,
            });
        }
        Ok(self)
    }
}

lazy_static! {
    static ref ERRORS_COUNT: Regex = Regex::new(r"errors:\s*(\d+)").expect("errors count pattern");
}

/// Find the first line that signals failure despite a clean exit code
///
/// Matches `ERR` replies, `error:` prefixes (any case) and `errors: N`
/// summaries with `N > 0`.
pub fn scan_error_sentinels(text: &str) -> Option<String> {
    for line in text.lines() {
        if line.contains("ERR") || line.to_ascii_lowercase().contains("error:") {
            return Some(line.trim().to_string());
        }
        if let Some(caps) = ERRORS_COUNT.captures(line) {
            if caps[1].parse::<u64>().map(|n| n > 0).unwrap_or(true) {
                return Some(line.trim().to_string());
            }
        }
    }
    None
}

/// Runs external commands
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Run to completion. A non-zero exit is returned, not raised; use
    /// [`CommandOutput::check`] to turn it into an error.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;

    /// Run and require a clean exit with no error sentinel
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let output = self.run(spec).await?;
        output.check(spec)
    }
}

/// [`ProcessControl`] over `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct TokioProcessControl;

impl TokioProcessControl {
    pub fn new() -> Self {
        Self
    }

    fn build(spec: &CommandSpec) -> tokio::process::Command {
        match &spec.run_as {
            Some(user) => {
                let mut line = shell_quote(&spec.program.to_string_lossy());
                for arg in &spec.args {
                    line.push(' ');
                    line.push_str(&shell_quote(arg));
                }
                let mut command = tokio::process::Command::new("su");
                command.args([user.as_str(), "-s", "/bin/sh", "-c", line.as_str()]);
                command
            }
            None => {
                let mut command = tokio::process::Command::new(&spec.program);
                command.args(&spec.args);
                command
            }
        }
    }
}

fn open_file(path: &Path, write: bool) -> Result<std::fs::File, ProcessError> {
    let result = if write {
        std::fs::File::create(path)
    } else {
        std::fs::File::open(path)
    };
    result.map_err(|source| ProcessError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[async_trait]
impl ProcessControl for TokioProcessControl {
    #[instrument(skip(self, spec), fields(program = %spec.program_name()))]
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let mut command = Self::build(spec);
        command.kill_on_drop(true).stderr(Stdio::piped());

        match &spec.stdin_file {
            Some(path) => command.stdin(Stdio::from(open_file(path, false)?)),
            None => command.stdin(Stdio::null()),
        };
        match &spec.stdout_file {
            Some(path) => command.stdout(Stdio::from(open_file(path, true)?)),
            None => command.stdout(Stdio::piped()),
        };

        debug!(command = %spec, "Running external command");
        let started = Instant::now();
        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program_name(),
            source,
        })?;

        let output = match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ProcessError::Spawn {
                program: spec.program_name(),
                source,
            })?,
            Err(_) => {
                warn!(command = %spec, timeout = ?spec.timeout, "External command timed out");
                return Err(ProcessError::Timeout {
                    program: spec.program_name(),
                    timeout: spec.timeout,
                });
            }
        };

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed: started.elapsed(),
        };
        debug!(code = ?result.code, elapsed = ?result.elapsed, "External command finished");
        Ok(result)
    }
}
