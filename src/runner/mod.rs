//! Process execution
//!
//! Runs one external command to completion and hands back what it printed. Stdout and
//! stderr are captured on separate pipes, each drained by its own thread so a chatty
//! child can't dead-lock on a full pipe buffer.
//!
//! A command that runs and exits non-zero is a normal [`ExecutionResult`]. Only a command
//! that can't be started or waited on is an [`ExecutionError`].

pub mod prefix;

pub use prefix::PrefixWriter;

use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use thiserror::Error;
use tracing::debug;

/// Exit code reported when the OS gives us neither a code nor a signal.
const UNKNOWN_EXIT_CODE: i32 = 1;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment, overriding on conflict.
    pub env: Vec<(String, String)>,
    /// Decorate each captured line with `[program] `.
    pub prefix_output: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            prefix_output: true,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env_overrides(mut self, env: &[(String, String)]) -> Self {
        self.env.extend(env.iter().cloned());
        self
    }

    pub fn prefixed(mut self, prefix_output: bool) -> Self {
        self.prefix_output = prefix_output;
        self
    }

    /// Run `command` through the platform shell.
    pub fn shell(command: &str) -> Self {
        if cfg!(windows) {
            Self::new("cmd").args(["/C", command])
        } else {
            Self::new("sh").args(["-c", command])
        }
    }

    /// `program arg1 arg2`, for banners and error messages.
    pub fn label(&self) -> String {
        let mut label = self.program.clone();
        for arg in &self.args {
            label.push(' ');
            label.push_str(arg);
        }
        label
    }
}

/// Output of one finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to start `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to capture {stream} of `{command}`: {message}")]
    Capture {
        command: String,
        stream: &'static str,
        message: String,
    },
}

/// Anything that can run a [`CommandSpec`] to completion.
pub trait Executor {
    fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult, ExecutionError>;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult, ExecutionError> {
        (**self).run(spec)
    }
}

/// Runs commands as real child processes. Holds no state between calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl Executor for ProcessExecutor {
    fn run(&self, spec: &CommandSpec) -> Result<ExecutionResult, ExecutionError> {
        let label = spec.label();
        debug!(command = %label, "spawning");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| ExecutionError::Launch {
            command: label.clone(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| ExecutionError::Capture {
            command: label.clone(),
            stream: "stdout",
            message: "pipe was not opened".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ExecutionError::Capture {
            command: label.clone(),
            stream: "stderr",
            message: "pipe was not opened".to_string(),
        })?;

        let prefix = spec.prefix_output.then(|| spec.program.clone());
        let stdout_handle = spawn_drain(stdout, prefix.clone());
        let stderr_handle = spawn_drain(stderr, prefix);

        let status = child.wait().map_err(|source| ExecutionError::Wait {
            command: label.clone(),
            source,
        })?;

        let stdout = join_drain(stdout_handle, &label, "stdout")?;
        let stderr = join_drain(stderr_handle, &label, "stderr")?;
        let exit_code = exit_code(status);
        debug!(command = %label, exit_code, "finished");

        Ok(ExecutionResult {
            stdout,
            stderr,
            exit_code,
        })
    }
}

fn spawn_drain<R>(
    mut stream: R,
    prefix_program: Option<String>,
) -> thread::JoinHandle<io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || match prefix_program {
        Some(program) => {
            let mut writer = PrefixWriter::for_program(Vec::new(), &program);
            io::copy(&mut stream, &mut writer)?;
            writer.flush()?;
            Ok(writer.into_inner())
        }
        None => {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf)?;
            Ok(buf)
        }
    })
}

fn join_drain(
    handle: thread::JoinHandle<io::Result<Vec<u8>>>,
    command: &str,
    stream: &'static str,
) -> Result<String, ExecutionError> {
    let capture_error = |message: String| ExecutionError::Capture {
        command: command.to_string(),
        stream,
        message,
    };
    let bytes = handle
        .join()
        .map_err(|_| capture_error("reader thread panicked".to_string()))?
        .map_err(|e| capture_error(e.to_string()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// The process's own exit code, or `128 + signal` for a signal death on Unix.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    UNKNOWN_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_joins_args() {
        let spec = CommandSpec::new("pip").args(["install", "foo"]);
        assert_eq!(spec.label(), "pip install foo");
        assert_eq!(CommandSpec::new("make").label(), "make");
    }

    #[test]
    fn test_builder_defaults() {
        let spec = CommandSpec::new("cargo")
            .with_env_overrides(&[("CI".to_string(), "1".to_string())])
            .prefixed(false);
        assert!(spec.args.is_empty());
        assert_eq!(spec.env, vec![("CI".to_string(), "1".to_string())]);
        assert!(!spec.prefix_output);
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_spec_uses_sh() {
        let spec = CommandSpec::shell("apt-get install -y foo");
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "apt-get install -y foo"]);
    }

    #[test]
    fn test_missing_binary_is_launch_error() {
        let spec = CommandSpec::new("ai-harness-definitely-not-a-real-binary");
        let err = ProcessExecutor.run(&spec).unwrap_err();
        assert!(matches!(err, ExecutionError::Launch { .. }));
        assert!(err.to_string().contains("ai-harness-definitely-not-a-real-binary"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_a_result() {
        let spec = CommandSpec::shell("echo out; echo err >&2; exit 3").prefixed(false);
        let result = ProcessExecutor.run(&spec).unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_streams_are_prefixed_separately() {
        let spec = CommandSpec::shell("printf 'a\\nb'; printf 'e\\n' >&2");
        let result = ProcessExecutor.run(&spec).unwrap();
        assert_eq!(result.stdout, "[sh] a\n[sh] b");
        assert_eq!(result.stderr, "[sh] e\n");
        assert!(result.success());
    }

    #[cfg(unix)]
    #[test]
    fn test_env_overrides_reach_child() {
        let spec = CommandSpec::shell("printf %s \"$AI_HARNESS_TEST_VALUE\"")
            .with_env_overrides(&[("AI_HARNESS_TEST_VALUE".to_string(), "42".to_string())])
            .prefixed(false);
        let result = ProcessExecutor.run(&spec).unwrap();
        assert_eq!(result.stdout, "42");
    }

    #[cfg(unix)]
    #[test]
    fn test_signal_death_maps_to_128_plus_signal() {
        let spec = CommandSpec::shell("kill -9 $$").prefixed(false);
        let result = ProcessExecutor.run(&spec).unwrap();
        assert_eq!(result.exit_code, 137);
    }
}
