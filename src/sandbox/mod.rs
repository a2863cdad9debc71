//! Sandbox Module
//!
//! The command-execution boundary to the platform hosting the desktop.
//! Everything above this module talks to a [`Sandbox`]; the platform itself
//! is a [`SandboxBackend`]:
//! - [`LocalSandbox`]: runs `sh -c` on this host
//! - [`MockSandbox`]: a simulated X11 desktop for tests
//! - any external platform via [`Sandbox::custom`]
//!
//! # Example
//!
//! ```no_run
//! use void_desktop::sandbox::Sandbox;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sandbox = Sandbox::local().env("DISPLAY", ":0").build()?;
//!
//!     let output = sandbox.run("xdpyinfo -display :0").await?;
//!     println!("{}", output.stdout_str());
//!
//!     Ok(())
//! }
//! ```

pub mod local;
pub mod mock;

use std::sync::Arc;
use std::time::Duration;

pub use local::LocalSandbox;
pub use mock::MockSandbox;

use crate::poll::{self, PollConfig};
use crate::{Error, ExecOutput, Result};

/// Default per-command timeout for foreground commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-command options passed to a [`SandboxBackend`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Kill the command if it runs longer than this. `None` means no limit.
    pub timeout: Option<Duration>,
    /// Environment variables for the command.
    pub env: Vec<(String, String)>,
}

/// Handle to a detached background command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHandle {
    pid: u32,
    command: String,
}

impl CommandHandle {
    pub fn new(pid: u32, command: impl Into<String>) -> Self {
        Self {
            pid,
            command: command.into(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

/// The hosting platform's side of command execution.
///
/// `run` reports the raw exit status; turning a non-zero exit into
/// [`Error::CommandExit`] happens once, in [`Sandbox::run`].
#[async_trait::async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Run a shell command to completion.
    async fn run(&self, command: &str, opts: &RunOptions) -> Result<ExecOutput>;

    /// Start a shell command in the background and return immediately.
    async fn spawn(&self, command: &str, opts: &RunOptions) -> Result<CommandHandle>;

    /// Terminate a background command started by [`spawn`](Self::spawn).
    async fn kill_process(&self, pid: u32) -> Result<()>;

    /// Make a sandbox port reachable from outside and return its host.
    async fn expose_port(&self, port: u16) -> Result<String>;

    /// Read a file from the sandbox filesystem.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    /// Remove a file from the sandbox filesystem.
    async fn remove_file(&self, path: &str) -> Result<()>;

    /// Tear down the whole sandbox.
    async fn kill(&self) -> Result<()>;
}

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Environment variables applied to every command
    pub env: Vec<(String, String)>,
    /// Timeout for foreground commands
    pub command_timeout: Duration,
    /// Host name `expose_port` reports for the local backend
    pub public_host: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            env: Vec::new(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            public_host: "localhost".to_string(),
        }
    }
}

impl SandboxConfig {
    /// Value of an environment variable set on the sandbox, last one wins.
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A sandbox hosting a desktop
pub struct Sandbox {
    /// Sandbox configuration
    config: SandboxConfig,
    /// The underlying implementation
    inner: SandboxInner,
}

enum SandboxInner {
    /// Commands run on this host
    Local(Box<LocalSandbox>),
    /// Simulated desktop for testing
    Mock(Box<MockSandbox>),
    /// Externally provided platform
    Custom(Box<dyn SandboxBackend>),
}

impl Sandbox {
    /// Start building a sandbox that runs commands on this host
    pub fn local() -> SandboxBuilder {
        SandboxBuilder::new(SandboxType::Local)
    }

    /// Create a mock sandbox for testing
    pub fn mock() -> SandboxBuilder {
        SandboxBuilder::new(SandboxType::Mock)
    }

    /// Wrap an external platform implementation
    pub fn custom(backend: impl SandboxBackend + 'static) -> SandboxBuilder {
        let mut builder = SandboxBuilder::new(SandboxType::Custom);
        builder.custom = Some(Box::new(backend));
        builder
    }

    fn backend(&self) -> &dyn SandboxBackend {
        match &self.inner {
            SandboxInner::Local(local) => &**local,
            SandboxInner::Mock(mock) => &**mock,
            SandboxInner::Custom(custom) => &**custom,
        }
    }

    fn options(&self, timeout: Option<Duration>) -> RunOptions {
        RunOptions {
            timeout,
            env: self.config.env.clone(),
        }
    }

    /// Run a command with the default timeout.
    ///
    /// A non-zero exit status is returned as [`Error::CommandExit`].
    pub async fn run(&self, command: &str) -> Result<ExecOutput> {
        self.run_with_timeout(command, Some(self.config.command_timeout))
            .await
    }

    /// Run a command with an explicit timeout (`None` for no limit).
    pub async fn run_with_timeout(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        tracing::debug!(command, "run");
        let output = self.backend().run(command, &self.options(timeout)).await?;

        if output.success() {
            return Ok(output);
        }

        tracing::debug!(
            command,
            exit_code = output.exit_code,
            "command failed; stderr={}",
            output.stderr_str().trim()
        );
        Err(Error::CommandExit {
            command: command.to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout_str(),
            stderr: output.stderr_str(),
        })
    }

    /// Start a detached background command with no timeout.
    pub async fn spawn(&self, command: &str) -> Result<CommandHandle> {
        let handle = self.backend().spawn(command, &self.options(None)).await?;
        tracing::debug!(command, pid = handle.pid(), "spawned background command");
        Ok(handle)
    }

    /// Kill a background command.
    pub async fn kill_process(&self, handle: &CommandHandle) -> Result<()> {
        tracing::debug!(pid = handle.pid(), command = handle.command(), "kill");
        self.backend().kill_process(handle.pid()).await
    }

    /// Externally reachable host for a sandbox port.
    pub async fn expose_port(&self, port: u16) -> Result<String> {
        self.backend().expose_port(port).await
    }

    /// Read a file from the sandbox
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.backend().read_file(path).await
    }

    /// Remove a file from the sandbox
    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.backend().remove_file(path).await
    }

    /// Poll `command` until `on_result` accepts its output.
    ///
    /// See [`poll::wait_and_verify`].
    pub async fn wait_and_verify<F>(
        &self,
        command: &str,
        on_result: F,
        config: &PollConfig,
    ) -> Result<bool>
    where
        F: Fn(&ExecOutput) -> bool,
    {
        poll::wait_and_verify(self, command, on_result, config).await
    }

    /// Get sandbox configuration
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The simulated desktop, when this is a mock sandbox.
    pub fn as_mock(&self) -> Option<&MockSandbox> {
        match &self.inner {
            SandboxInner::Mock(mock) => Some(&**mock),
            _ => None,
        }
    }

    /// Kill the sandbox and everything running in it
    pub async fn kill(&self) -> Result<()> {
        self.backend().kill().await
    }
}

/// Types of sandboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxType {
    /// Commands run on this host
    Local,
    /// Simulated desktop for testing
    Mock,
    /// Externally provided platform
    Custom,
}

/// Builder for creating sandboxes
pub struct SandboxBuilder {
    sandbox_type: SandboxType,
    config: SandboxConfig,
    custom: Option<Box<dyn SandboxBackend>>,
}

impl SandboxBuilder {
    /// Create a new sandbox builder
    pub fn new(sandbox_type: SandboxType) -> Self {
        Self {
            sandbox_type,
            config: SandboxConfig::default(),
            custom: None,
        }
    }

    /// Add an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    /// Set the timeout for foreground commands
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set the host reported for exposed ports (local sandbox)
    pub fn public_host(mut self, host: impl Into<String>) -> Self {
        self.config.public_host = host.into();
        self
    }

    /// Kind of sandbox this builder produces
    pub fn sandbox_type(&self) -> SandboxType {
        self.sandbox_type
    }

    /// Build the sandbox
    pub fn build(self) -> Result<Arc<Sandbox>> {
        let inner = match self.sandbox_type {
            SandboxType::Local => {
                SandboxInner::Local(Box::new(LocalSandbox::new(self.config.clone())))
            }
            SandboxType::Mock => SandboxInner::Mock(Box::new(MockSandbox::new())),
            SandboxType::Custom => {
                let backend = self
                    .custom
                    .ok_or_else(|| Error::Config("custom sandbox requires a backend".into()))?;
                SandboxInner::Custom(backend)
            }
        };

        Ok(Arc::new(Sandbox {
            config: self.config,
            inner,
        }))
    }
}
