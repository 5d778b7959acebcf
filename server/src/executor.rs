use std::{
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use thiserror::Error;

#[cfg(target_os = "android")]
const DEFAULT_SHELL: &str = "/system/bin/sh";
#[cfg(not(target_os = "android"))]
const DEFAULT_SHELL: &str = "/bin/sh";

/// The platform shell commands are run through
pub fn default_shell() -> PathBuf {
    PathBuf::from(DEFAULT_SHELL)
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("failed to spawn {}: {source}", .shell.display())]
    Spawn {
        shell:  PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for command to finish: {0}")]
    Wait(#[source] io::Error),
}

/// Runs command strings through `sh -c` and captures standard output.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: PathBuf,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(default_shell())
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    pub fn shell(&self) -> &Path {
        &self.shell
    }

    /// Runs `command` to completion and returns its stdout, one `\n` per line.
    ///
    /// Blocks for as long as the command runs. The exit status is logged, not
    /// returned; stderr is discarded.
    pub fn execute(&self, command: &str) -> Result<String, ExecutionError> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                shell: self.shell.clone(),
                source,
            })?;

        let output = child.wait_with_output().map_err(ExecutionError::Wait)?;

        tracing::debug!(
            "Command exited with {} ({} bytes stdout, {} bytes stderr)",
            output.status,
            output.stdout.len(),
            output.stderr.len()
        );

        Ok(terminate_lines(&output.stdout))
    }
}

/// Decodes output as lossy UTF-8 and ends every line, including the last, with `\n`.
fn terminate_lines(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len() + 1);
    for line in text.lines() {
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_only() {
        let output = ShellExecutor::default()
            .execute("echo hello; echo oops >&2; echo world")
            .unwrap();
        assert_eq!(output, "hello\nworld\n");
    }

    #[test]
    fn silent_command_yields_empty_output() {
        assert_eq!(ShellExecutor::default().execute("true").unwrap(), "");
    }

    #[test]
    fn exit_status_is_not_an_error() {
        let output = ShellExecutor::default().execute("echo partial; exit 3").unwrap();
        assert_eq!(output, "partial\n");
    }

    #[test]
    fn last_line_gets_a_newline() {
        assert_eq!(ShellExecutor::default().execute("printf abc").unwrap(), "abc\n");
        assert_eq!(terminate_lines(b"a\r\nb\n"), "a\nb\n");
    }

    #[test]
    fn missing_shell_is_a_spawn_error() {
        let executor = ShellExecutor::new("/nonexistent/dtf/sh");
        match executor.execute("echo hi") {
            Err(ExecutionError::Spawn { shell, .. }) => {
                assert_eq!(shell, PathBuf::from("/nonexistent/dtf/sh"))
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
    }
}
