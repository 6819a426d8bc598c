use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Configuration for one local test-launcher invocation.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
}

/// Output from a completed local invocation.
#[derive(Debug)]
pub struct LaunchOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl LaunchOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}

/// Spawn a test launcher, stream its output line-by-line, and wait for exit.
///
/// The child is placed in its own process group on Unix so a timeout or
/// cancellation kills the whole launcher tree, not just the direct child.
/// Cancellation observed on `cancel` aborts the wait and returns
/// `Error::Cancelled` after the group has been killed.
pub async fn launch_and_wait(
    config: LaunchConfig,
    mut cancel: Option<watch::Receiver<bool>>,
) -> Result<LaunchOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))? as i32;

    let stdout = child.stdout.take().expect("stdout is piped");
    let stderr = child.stderr.take().expect("stderr is piped");

    let prefix_out = config.log_prefix.clone();
    let prefix_err = config.log_prefix.clone();

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            info!("[{prefix_out}] {line}");
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            warn!("[{prefix_err}] {line}");
            lines.push(line);
        }
        lines
    });

    let status = loop {
        let timed_wait = async {
            match config.timeout {
                Some(dur) => tokio::time::timeout(dur, child.wait()).await,
                None => Ok(child.wait().await),
            }
        };
        tokio::pin!(timed_wait);

        let cancelled = match cancel.as_mut() {
            Some(rx) => {
                tokio::select! {
                    result = &mut timed_wait => break finish_wait(result, pid, &config)?,
                    changed = rx.changed() => changed.is_ok() && *rx.borrow(),
                }
            }
            None => break finish_wait(timed_wait.await, pid, &config)?,
        };

        if cancelled {
            warn!("[{}] cancelled, killing process group", config.log_prefix);
            kill_group(pid);
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Cancelled);
        }
        // Sender dropped without signaling; stop watching and keep waiting.
        cancel = None;
    };

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = extract_exit_info(&status);

    Ok(LaunchOutput {
        exit_code,
        signal,
        stdout: stdout_lines.join("\n"),
        stderr: stderr_lines.join("\n"),
    })
}

fn finish_wait(
    result: std::result::Result<std::io::Result<std::process::ExitStatus>, tokio::time::error::Elapsed>,
    pid: i32,
    config: &LaunchConfig,
) -> Result<std::process::ExitStatus> {
    match result {
        Ok(status) => status.map_err(|e| Error::Process(format!("wait error: {e}"))),
        Err(_) => {
            kill_group(pid);
            Err(Error::Process(format!(
                "'{}' timed out after {:?}",
                config.command, config.timeout
            )))
        }
    }
}

/// SIGTERM the process group, then SIGKILL shortly after.
fn kill_group(pid: i32) {
    #[cfg(unix)]
    unsafe {
        libc::killpg(pid, libc::SIGTERM);
        std::thread::sleep(std::time::Duration::from_millis(500));
        libc::killpg(pid, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(command: &str, args: &[&str]) -> LaunchConfig {
        LaunchConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            working_dir: std::env::temp_dir(),
            timeout: None,
            log_prefix: "test".to_string(),
            env: vec![],
        }
    }

    #[tokio::test]
    async fn test_launch_captures_stdout() {
        let output = launch_and_wait(launch("sh", &["-c", "echo hello"]), None)
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn test_launch_nonzero_exit() {
        let output = launch_and_wait(launch("sh", &["-c", "exit 3"]), None)
            .await
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_launch_missing_binary() {
        let err = launch_and_wait(launch("/nonexistent/launcher", &[]), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_launch_timeout_kills() {
        let mut config = launch("sh", &["-c", "sleep 30"]);
        config.timeout = Some(Duration::from_millis(100));
        let err = launch_and_wait(config, None).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_launch_env_passthrough() {
        let mut config = launch("sh", &["-c", "echo $REFLAKE_TEST_VAR"]);
        config.env = vec![("REFLAKE_TEST_VAR".to_string(), "42".to_string())];
        let output = launch_and_wait(config, None).await.unwrap();
        assert_eq!(output.stdout, "42");
    }

    #[tokio::test]
    async fn test_launch_cancelled() {
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(launch_and_wait(
            launch("sh", &["-c", "sleep 30"]),
            Some(rx),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
