//! Local Sandbox Implementation
//!
//! Runs every command through `sh -c` on the current host. Useful when the
//! process already lives inside the isolated environment (a container or VM
//! image with Xvfb, xfce4, x11vnc and noVNC installed).

use std::collections::HashMap;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{CommandHandle, RunOptions, SandboxBackend, SandboxConfig};
use crate::{Error, ExecOutput, Result};

/// Sandbox backed by the local host.
pub struct LocalSandbox {
    /// Sandbox configuration
    config: SandboxConfig,
    /// Background commands, keyed by pid. Exited ones are reaped and
    /// dropped on the next `spawn` or `kill_process`.
    children: Mutex<HashMap<u32, Child>>,
}

impl LocalSandbox {
    /// Create a new local sandbox
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, command: &str, opts: &RunOptions) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        cmd
    }

    /// Reap children that have exited and forget them.
    fn prune(children: &mut HashMap<u32, Child>) {
        children.retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid, %status, "reaped background process");
                false
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(pid, "failed to poll background process: {}", e);
                true
            }
        });
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.children.lock().await.len()
    }

    async fn terminate(pid: u32, mut child: Child) -> Result<()> {
        // Background commands lead their own process group; take down the
        // whole group so `sh -c "cd x && ./proxy"` does not leave the proxy.
        #[cfg(unix)]
        {
            // SAFETY: plain syscall on a pid we spawned and still own.
            let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(Error::Io(err));
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            child.start_kill()?;
        }
        child.wait().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl SandboxBackend for LocalSandbox {
    async fn run(&self, command: &str, opts: &RunOptions) -> Result<ExecOutput> {
        let mut cmd = self.command(command, opts);
        cmd.kill_on_drop(true);

        let output = match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    Error::Timeout(format!(
                        "command `{}` did not finish within {}",
                        command,
                        humantime::format_duration(limit)
                    ))
                })??,
            None => cmd.output().await?,
        };

        Ok(ExecOutput::new(
            output.stdout,
            output.stderr,
            output.status.code().unwrap_or(-1),
        ))
    }

    async fn spawn(&self, command: &str, opts: &RunOptions) -> Result<CommandHandle> {
        let mut cmd = self.command(command, opts);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Sandbox(format!("`{}` exited before reporting a pid", command)))?;

        let mut children = self.children.lock().await;
        Self::prune(&mut children);
        children.insert(pid, child);
        Ok(CommandHandle::new(pid, command))
    }

    async fn kill_process(&self, pid: u32) -> Result<()> {
        let child = {
            let mut children = self.children.lock().await;
            let child = children.remove(&pid);
            Self::prune(&mut children);
            child
        };
        match child {
            Some(child) => Self::terminate(pid, child).await,
            None => Err(Error::Sandbox(format!("no background process with pid {}", pid))),
        }
    }

    async fn expose_port(&self, port: u16) -> Result<String> {
        Ok(format!("{}:{}", self.config.public_host, port))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        Ok(tokio::fs::remove_file(path).await?)
    }

    async fn kill(&self) -> Result<()> {
        let children: Vec<(u32, Child)> = self.children.lock().await.drain().collect();
        for (pid, child) in children {
            if let Err(e) = Self::terminate(pid, child).await {
                tracing::warn!(pid, "failed to kill background process: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sandbox() -> LocalSandbox {
        LocalSandbox::new(SandboxConfig::default())
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let output = sandbox()
            .run("echo hello; echo oops >&2", &RunOptions::default())
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_str(), "hello\n");
        assert_eq!(output.stderr_str(), "oops\n");
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let output = sandbox().run("exit 3", &RunOptions::default()).await.unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn test_run_passes_env() {
        let opts = RunOptions {
            timeout: None,
            env: vec![("DISPLAY".into(), ":42".into())],
        };
        let output = sandbox().run("printf %s \"$DISPLAY\"", &opts).await.unwrap();
        assert_eq!(output.stdout_str(), ":42");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let opts = RunOptions {
            timeout: Some(Duration::from_millis(100)),
            env: Vec::new(),
        };
        let err = sandbox().run("sleep 5", &opts).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_spawn_and_kill() {
        let sandbox = sandbox();
        let handle = sandbox
            .spawn("sleep 30", &RunOptions::default())
            .await
            .unwrap();
        assert!(handle.pid() > 0);

        sandbox.kill_process(handle.pid()).await.unwrap();
        let err = sandbox.kill_process(handle.pid()).await.unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
    }

    #[tokio::test]
    async fn test_exited_children_are_reaped() {
        let sandbox = sandbox();
        for _ in 0..20 {
            sandbox.spawn("true", &RunOptions::default()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        let handle = sandbox
            .spawn("sleep 30", &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(sandbox.tracked().await, 1);

        sandbox.kill_process(handle.pid()).await.unwrap();
        assert_eq!(sandbox.tracked().await, 0);
    }

    #[tokio::test]
    async fn test_expose_port_uses_public_host() {
        let config = SandboxConfig {
            public_host: "desk.internal".into(),
            ..SandboxConfig::default()
        };
        let host = LocalSandbox::new(config).expose_port(6080).await.unwrap();
        assert_eq!(host, "desk.internal:6080");
    }

    #[tokio::test]
    async fn test_read_and_remove_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shot.png");
        std::fs::write(&path, b"\x89PNG").unwrap();
        let path = path.to_str().unwrap();

        let sandbox = sandbox();
        assert_eq!(sandbox.read_file(path).await.unwrap(), b"\x89PNG");
        sandbox.remove_file(path).await.unwrap();
        assert!(sandbox.read_file(path).await.is_err());
    }
}
