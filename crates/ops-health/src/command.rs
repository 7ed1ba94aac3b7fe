//! C2 — bounded subprocess execution.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Runs `cmd` through `/bin/sh -c`, capturing stdout on success.
///
/// Returns `None` on nonzero exit, timeout, or spawn error. The caller is
/// responsible for quoting/escaping any externally-derived value
/// (`shell_quote` below) before it is substituted into `cmd`.
pub async fn run(cmd: &str, timeout_seconds: u64, working_dir: &Path) -> Option<String> {
    debug!(cmd, "running command");

    // `kill_on_drop` is what makes the timeout path below actually kill
    // the child: `tokio::time::timeout` drops the losing future (and the
    // `Child` it owns via `wait_with_output`) without running any async
    // cleanup, so the kill has to happen synchronously in `Drop`.
    let child = match Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(cmd, error = %e, "failed to spawn command");
            return None;
        }
    };

    let wait = tokio::time::timeout(Duration::from_secs(timeout_seconds), child.wait_with_output()).await;

    match wait {
        Ok(Ok(output)) => {
            if !output.stderr.is_empty() {
                debug!(cmd, stderr = %String::from_utf8_lossy(&output.stderr), "command stderr");
            }
            if output.status.success() {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                warn!(cmd, code = ?output.status.code(), "command exited nonzero");
                None
            }
        }
        Ok(Err(e)) => {
            warn!(cmd, error = %e, "command I/O error");
            None
        }
        Err(_) => {
            warn!(cmd, timeout_seconds, "command timed out, killing child");
            None
        }
    }
}

/// POSIX single-quote escaping for values interpolated into a shell
/// command string (git tags, SHAs, etc.).
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_on_success() {
        let out = run("echo hello", 5, Path::new(".")).await;
        assert_eq!(out.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_yields_none() {
        let out = run("exit 1", 5, Path::new(".")).await;
        assert_eq!(out, None);
    }

    #[tokio::test]
    async fn timeout_yields_none() {
        let out = run("sleep 5", 1, Path::new(".")).await;
        assert_eq!(out, None);
    }

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(shell_quote("v1.0.2"), "'v1.0.2'");
        assert_eq!(shell_quote("a'b"), r"'a'\''b'");
    }
}
