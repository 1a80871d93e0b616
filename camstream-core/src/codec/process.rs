//! Bounded `ffmpeg` child processes.
//!
//! Every child the codec layer spawns is collected through
//! [`run_with_deadline`]: stdin is fed and stdout/stderr are drained on
//! helper threads while the caller polls `try_wait`, and a child still
//! running at the deadline is killed.

use std::io::{self, Read, Write};
use std::process::{Child, Output};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL: Duration = Duration::from_millis(1);

/// Wait for `child` to exit, writing `input` to its stdin first.
///
/// Returns `Ok(None)` when the deadline passed; the child has been
/// killed and reaped by then. Pipe threads of a killed child are left
/// detached, since a grandchild may still hold the pipes open.
pub(crate) fn run_with_deadline(
    mut child: Child,
    input: Option<Vec<u8>>,
    timeout: Duration,
) -> io::Result<Option<Output>> {
    let feeder = match (child.stdin.take(), input) {
        (Some(mut stdin), Some(data)) => Some(thread::spawn(move || stdin.write_all(&data))),
        // Dropping the handle closes the child's stdin.
        _ => None,
    };
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL);
    };

    let fed = feeder.map(|handle| {
        handle
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")))
    });
    let output = Output {
        status,
        stdout: stdout.map(collect).unwrap_or_default(),
        stderr: stderr.map(collect).unwrap_or_default(),
    };
    // A failing child may exit before reading its input; its status
    // and stderr explain more than the broken pipe does.
    match fed {
        Some(Err(e)) if output.status.success() => Err(e),
        _ => Ok(Some(output)),
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_default()
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[test]
    fn completed_child_returns_output() {
        let out = run_with_deadline(sh("cat; echo oops >&2"), Some(b"hello".to_vec()), Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert!(out.status.success());
        assert_eq!(out.stdout, b"hello");
        assert_eq!(String::from_utf8_lossy(&out.stderr).trim(), "oops");
    }

    #[test]
    fn hung_child_is_killed_at_deadline() {
        let started = Instant::now();
        let out = run_with_deadline(sh("exec sleep 30"), None, Duration::from_millis(100)).unwrap();
        assert!(out.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn early_exit_reports_status_not_pipe() {
        // The child never reads its input and fails.
        let out = run_with_deadline(sh("exit 3"), Some(vec![0u8; 1 << 20]), Duration::from_secs(5))
            .unwrap()
            .unwrap();
        assert_eq!(out.status.code(), Some(3));
    }
}
