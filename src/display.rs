//! Virtual display and desktop session lifecycle.
//!
//! Xvfb provides the framebuffer, xfce4 the window manager on top of it.
//! Both run detached; Xvfb lives until the sandbox dies, and the window
//! manager is only restarted when [`DisplayManager::ensure_desktop_session`]
//! finds it gone.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::poll::PollConfig;
use crate::sandbox::Sandbox;
use crate::{Error, Result};

/// Screen dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for ScreenSize {
    fn default() -> Self {
        Self::new(1024, 768)
    }
}

impl fmt::Display for ScreenSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ScreenSize {
    type Err = Error;

    /// Parse `WIDTHxHEIGHT`, e.g. `1280x800`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid resolution '{}', expected WIDTHxHEIGHT", s));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self::new(width, height))
    }
}

/// A process known only by pid; whether it is still alive has to be asked
/// of the sandbox every time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessRef {
    pid: u32,
}

impl ProcessRef {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Look the pid up in the process table.
    ///
    /// A pid that is missing or in zombie state counts as not alive.
    pub async fn is_alive(&self, sandbox: &Sandbox) -> Result<bool> {
        match sandbox.run(&format!("ps -o stat=,args= -p {}", self.pid)).await {
            Ok(output) => Ok(!is_defunct(&output.stdout_str())),
            Err(e) if e.is_transient() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Whether a `ps -o stat=,args=` line describes a zombie (or nothing at all).
fn is_defunct(ps_line: &str) -> bool {
    let line = ps_line.trim();
    if line.is_empty() {
        return true;
    }
    line.starts_with('Z') || line.contains("<defunct>")
}

/// Command line starting the virtual framebuffer.
pub fn xvfb_command(display: &str, resolution: ScreenSize, dpi: u32) -> String {
    format!(
        "Xvfb {} -ac -screen 0 {}x{}x24 -retro -dpi {} -nolisten tcp -nolisten unix",
        display, resolution.width, resolution.height, dpi
    )
}

/// Command starting the desktop session.
pub const DESKTOP_SESSION_COMMAND: &str = "startxfce4";

/// Owns the virtual display and the desktop session running on it.
pub struct DisplayManager {
    sandbox: Arc<Sandbox>,
    display: String,
    window_manager: Option<ProcessRef>,
}

impl DisplayManager {
    /// Manager for a display that is already up (nothing is started).
    pub fn attach(sandbox: Arc<Sandbox>, display: impl Into<String>) -> Self {
        Self {
            sandbox,
            display: display.into(),
            window_manager: None,
        }
    }

    /// Launch Xvfb and wait until the display answers `xdpyinfo`.
    ///
    /// Fails with [`Error::Timeout`] if it does not come up within `poll`.
    pub async fn start(
        sandbox: Arc<Sandbox>,
        display: impl Into<String>,
        resolution: ScreenSize,
        dpi: u32,
        poll: &PollConfig,
    ) -> Result<Self> {
        let manager = Self::attach(sandbox, display);
        info!(display = %manager.display, %resolution, dpi, "starting virtual display");

        manager
            .sandbox
            .spawn(&xvfb_command(&manager.display, resolution, dpi))
            .await?;

        let ready = manager
            .sandbox
            .wait_and_verify(
                &format!("xdpyinfo -display {}", manager.display),
                |r| r.exit_code == 0,
                poll,
            )
            .await?;
        if !ready {
            return Err(Error::Timeout("Could not start Xvfb".into()));
        }

        debug!(display = %manager.display, "virtual display ready");
        Ok(manager)
    }

    /// Start the desktop session unless the recorded one is still alive.
    ///
    /// Returns `true` if a new session was started.
    pub async fn ensure_desktop_session(&mut self) -> Result<bool> {
        if let Some(wm) = self.window_manager {
            if wm.is_alive(&self.sandbox).await? {
                return Ok(false);
            }
            info!(pid = wm.pid(), "desktop session is gone, restarting");
        }

        let handle = self.sandbox.spawn(DESKTOP_SESSION_COMMAND).await?;
        self.window_manager = Some(ProcessRef::new(handle.pid()));
        info!(pid = handle.pid(), "desktop session started");
        Ok(true)
    }

    pub fn display(&self) -> &str {
        &self.display
    }

    /// Last window manager started by this manager, if any.
    pub fn window_manager(&self) -> Option<ProcessRef> {
        self.window_manager
    }
}
