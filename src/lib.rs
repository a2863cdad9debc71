//! void-desktop: Remote-Controlled Desktops in Sandboxes
//!
//! Brings up a virtual X11 desktop inside a sandbox, streams it to a browser
//! through x11vnc + noVNC, and drives it with synthetic mouse and keyboard
//! input.
//!
//! # Key Features
//!
//! - **Bring-up**: Xvfb display plus an xfce4 session, with readiness polling
//! - **Streaming**: password-protected or open noVNC URLs
//! - **Input**: xdotool clicks, drags, scrolling, typing and key chords
//! - **Capture**: PNG screenshots as bytes, blobs or byte streams
//!
//! # Example
//!
//! ```no_run
//! use void_desktop::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let mut desktop = Desktop::create(Sandbox::local(), DesktopConfig::default()).await?;
//!
//!     desktop
//!         .stream_mut()
//!         .start(StreamOptions::new().require_auth(true))
//!         .await?;
//!     let key = desktop.stream().auth_key()?.to_string();
//!     println!("{}", desktop.stream().url(&UrlOptions::default().auth_key(key))?);
//!
//!     desktop.double_click(Some((512, 384))).await?;
//!     desktop.press_combo(&["ctrl", "l"]).await?;
//!     desktop.write("https://example.com").await?;
//!     desktop.press("enter").await?;
//!
//!     desktop.stream_mut().stop().await?;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod config;
pub mod desktop;
pub mod display;
pub mod error;
pub mod keys;
pub mod poll;
pub mod sandbox;
pub mod shell;
pub mod stream;

// Re-exports for convenience
pub use capture::{Blob, Screenshot};
pub use desktop::{CursorPosition, Desktop, DesktopConfig, WriteOptions};
pub use display::ScreenSize;
pub use error::{Error, Result};
pub use sandbox::{Sandbox, SandboxBuilder};
pub use stream::{StreamOptions, UrlOptions, VncStream};

// Prelude for common imports
pub mod prelude {
    pub use crate::capture::Screenshot;
    pub use crate::desktop::{Desktop, DesktopConfig, WriteOptions};
    pub use crate::display::ScreenSize;
    pub use crate::error::{Error, Result};
    pub use crate::keys::{MouseButton, ScrollDirection};
    pub use crate::poll::PollConfig;
    pub use crate::sandbox::{Sandbox, SandboxBackend, SandboxBuilder};
    pub use crate::stream::{Resize, StreamOptions, UrlOptions};
    pub use crate::ExecOutput;
}

/// Output from executing a command in the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Standard output from the command
    pub stdout: Vec<u8>,
    /// Standard error from the command
    pub stderr: Vec<u8>,
    /// Exit code of the command
    pub exit_code: i32,
}

impl ExecOutput {
    /// Create a new ExecOutput
    pub fn new(stdout: Vec<u8>, stderr: Vec<u8>, exit_code: i32) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    /// Get stdout as a UTF-8 string, replacing invalid characters
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as a UTF-8 string, replacing invalid characters
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Check if the command succeeded (exit code 0)
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_output() {
        let output = ExecOutput::new(b"x:10 y:20\n".to_vec(), Vec::new(), 0);
        assert!(output.success());
        assert_eq!(output.stdout_str(), "x:10 y:20\n");
        assert_eq!(output.stderr_str(), "");
    }

    #[test]
    fn test_exec_output_failure() {
        let output = ExecOutput::new(Vec::new(), b"Can't open display\n".to_vec(), 1);
        assert!(!output.success());
        assert_eq!(output.stderr_str(), "Can't open display\n");
    }

    #[test]
    fn test_exec_output_lossy_utf8() {
        let output = ExecOutput::new(vec![0x66, 0xff, 0x6f], Vec::new(), 0);
        assert_eq!(output.stdout_str(), "f\u{fffd}o");
    }
}
