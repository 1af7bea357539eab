use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },

    #[error("`{command}` did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

impl CommandError {
    /// Combined output of the failed command, empty when it never ran.
    pub fn output(&self) -> &str {
        match self {
            CommandError::Failed { output, .. } => output,
            _ => "",
        }
    }

    /// Short reason suitable for embedding in a higher level error.
    pub fn reason(&self) -> String {
        match self {
            CommandError::Failed { status, output, .. } => {
                let output = output.trim();
                if output.is_empty() {
                    format!("exited with {}", status)
                } else {
                    output.to_string()
                }
            }
            other => other.to_string(),
        }
    }
}

/// Runs host tools. Implemented by [`SystemRunner`] and by fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Run `argv` to completion and return its stdout.
    fn run(&self, argv: &[String], timeout: Option<Duration>) -> Result<String, CommandError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<R> {
    fn run(&self, argv: &[String], timeout: Option<Duration>) -> Result<String, CommandError> {
        (**self).run(argv, timeout)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String], timeout: Option<Duration>) -> Result<String, CommandError> {
        let command = cmdline(argv);
        let (program, args) = argv.split_first().ok_or_else(|| CommandError::Spawn {
            command: command.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "empty command line"),
        })?;

        info!(target: "snapfreeze::cmd", "$ {}", command);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                command: command.clone(),
                source,
            })?;

        // Both pipes are drained off-thread so a chatty child never blocks on a full pipe.
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = match timeout {
            None => child.wait(),
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    match child.try_wait() {
                        Ok(Some(status)) => break Ok(status),
                        Ok(None) if Instant::now() >= deadline => {
                            let _ = child.kill();
                            let _ = child.wait();
                            error!(target: "snapfreeze::cmd", "`{}` timed out after {:?}", command, limit);
                            return Err(CommandError::TimedOut { command, timeout: limit });
                        }
                        Ok(None) => thread::sleep(POLL_INTERVAL),
                        Err(e) => break Err(e),
                    }
                }
            }
        }
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if status.success() {
            for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
                debug!(target: "snapfreeze::cmd", "{}", line.trim_end());
            }
            for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
                warn!(target: "snapfreeze::cmd", "{}", line.trim_end());
            }
            Ok(stdout)
        } else {
            let mut output = stdout;
            output.push_str(&stderr);
            for line in output.lines() {
                error!(target: "snapfreeze::cmd", "! {}", line.trim_end());
            }
            Err(CommandError::Failed {
                command,
                status: status.to_string(),
                output,
            })
        }
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Shell-like rendering of an argv for logs and error messages.
pub fn cmdline(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
                format!("'{}'", arg.replace('\'', "'\\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build an argv from string-ish pieces.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmdline_quotes_whitespace() {
        let line = cmdline(&argv(["mount", "-o", "ro", "/dev/vg0/snap", "/mnt/my snap"]));
        assert_eq!(line, "mount -o ro /dev/vg0/snap '/mnt/my snap'");
    }

    #[test]
    fn test_run_captures_stdout() {
        let out = SystemRunner
            .run(&argv(["sh", "-c", "echo hello; echo warn 1>&2"]), None)
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_run_failure_carries_output() {
        let err = SystemRunner
            .run(&argv(["sh", "-c", "echo 'volume group not found' 1>&2; exit 5"]), None)
            .unwrap_err();
        match &err {
            CommandError::Failed { output, .. } => assert!(output.contains("volume group not found")),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.reason(), "volume group not found");
    }

    #[test]
    fn test_run_times_out() {
        let start = Instant::now();
        let err = SystemRunner
            .run(&argv(["sleep", "5"]), Some(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_run_missing_program() {
        let err = SystemRunner
            .run(&argv(["/nonexistent/snapfreeze-tool"]), None)
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }
}
