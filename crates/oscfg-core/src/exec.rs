//! Subprocess execution capability.
//!
//! Every package-manager invocation and exec-step script runs through
//! [`CommandRunner`], so reconciliation logic can be tested against a fake
//! runner and the real one can enforce the non-interactive environment and
//! per-exec timeout in one place.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Default per-exec timeout.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// A fully-specified subprocess invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program path or name.
    pub program: String,
    /// Arguments, excluding the program itself.
    pub args: Vec<String>,
    /// Extra environment entries layered over the inherited environment.
    pub env: BTreeMap<String, String>,
    /// Working directory, if any.
    pub cwd: Option<PathBuf>,
    /// Per-invocation timeout override.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Spec for `program` with `args`.
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(ToString::to_string).collect(),
            ..Self::default()
        }
    }

    /// Add an environment entry.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Append an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// One-line rendering for logs and errors.
    #[must_use]
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

/// Captured output of a finished subprocess.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Whether the process exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Lossy stderr, trimmed, for error messages.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Errors spawning or supervising a subprocess.
///
/// A non-zero exit is NOT an error at this layer; callers inspect
/// [`CommandOutput::code`] because several package-manager exit codes carry
/// meaning (yum's 100, exec-step's 100/101).
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The process outlived its timeout and was killed.
    #[error("{program} timed out after {timeout:?}")]
    Timeout {
        /// Program that was killed.
        program: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// Waiting on the process failed.
    #[error("failed waiting on {program}: {source}")]
    Wait {
        /// Program being waited on.
        program: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Subprocess execution seam.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion, capturing output.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// [`CommandRunner`] over `tokio::process` with timeout enforcement.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    default_timeout: Duration,
}

impl SystemRunner {
    /// Runner with the given default timeout.
    #[must_use]
    pub const fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(DEFAULT_EXEC_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }

        tracing::debug!(command = %spec.display(), "running");

        let child = cmd.spawn().map_err(|e| ExecError::Spawn {
            program: spec.program.clone(),
            source: e,
        })?;

        let timeout = spec.timeout.unwrap_or(self.default_timeout);
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecError::Wait {
                    program: spec.program.clone(),
                    source: e,
                })
            }
            // kill_on_drop reaps the child when the future is dropped here.
            Err(_) => {
                return Err(ExecError::Timeout {
                    program: spec.program.clone(),
                    timeout,
                })
            }
        };

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            code: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output_and_code() {
        let runner = SystemRunner::default();
        let out = runner
            .run(&CommandSpec::new("sh", &["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.code, Some(3));
        assert!(!out.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout), "out\n");
        assert_eq!(out.stderr_lossy(), "err");
    }

    #[tokio::test]
    async fn test_env_injection() {
        let runner = SystemRunner::default();
        let spec = CommandSpec::new("sh", &["-c", "echo $OSCFG_TEST_VAR"])
            .env("OSCFG_TEST_VAR", "ok");
        let out = runner.run(&spec).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "ok");
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let runner = SystemRunner::default();
        let mut spec = CommandSpec::new("sleep", &["30"]);
        spec.timeout = Some(Duration::from_millis(50));
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = SystemRunner::default();
        let err = runner
            .run(&CommandSpec::new("oscfg-no-such-binary-xyz", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }
}
