//! Spawning of external commands with captured output.
use super::Invocation;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub(crate) struct Output {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// The text to show the user when the command failed: stderr if the
    /// command wrote any, stdout otherwise.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

/// Runs `invocation` to completion.
///
/// `advisory_timeout` never interrupts the child: formatting tools have no
/// cooperative cancellation and killing one mid-write leaves the device in an
/// undefined state. Past the timeout a warning is logged once and waiting
/// continues.
pub(crate) fn run(invocation: &Invocation, advisory_timeout: Option<Duration>) -> io::Result<Output> {
    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let status = wait(&mut child, invocation, advisory_timeout)?;

    let stdout = stdout
        .join()
        .map_err(|_| io::Error::other("stdout reader thread panicked"))??;
    let stderr = stderr
        .join()
        .map_err(|_| io::Error::other("stderr reader thread panicked"))??;

    Ok(Output {
        status: status.code(),
        stdout,
        stderr,
    })
}

fn wait(child: &mut Child, invocation: &Invocation, timeout: Option<Duration>) -> io::Result<ExitStatus> {
    let Some(timeout) = timeout else {
        return child.wait();
    };

    let start = Instant::now();
    let mut warned = false;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if !warned && start.elapsed() > timeout {
            warn!(
                "`{}` is still running after {:?}; it cannot be interrupted, continuing to wait",
                invocation, timeout
            );
            warned = true;
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::new("sh", ["-c", script])
    }

    #[test]
    fn captures_exit_code_and_streams() {
        let out = run(&sh("echo out; echo err >&2; exit 3"), None).unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
        assert_eq!(out.diagnostic(), "err");
    }

    #[test]
    fn diagnostic_falls_back_to_stdout() {
        let out = run(&sh("echo only-stdout; exit 1"), None).unwrap();
        assert_eq!(out.diagnostic(), "only-stdout");
    }

    #[test]
    fn timeout_is_advisory() {
        let out = run(&sh("sleep 0.3; exit 0"), Some(Duration::from_millis(10))).unwrap();
        assert!(out.success());
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let inv = Invocation::new("cardprep-definitely-missing-binary", Vec::<String>::new());
        assert!(run(&inv, None).is_err());
    }
}
