//! Desktop session facade.
//!
//! [`Desktop`] ties together display bring-up, input injection, screen
//! capture and the remote-viewing stream of one sandboxed desktop.
//!
//! # Example
//!
//! ```no_run
//! use void_desktop::{Desktop, DesktopConfig, Sandbox, ScreenSize};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DesktopConfig::default().with_resolution(ScreenSize::new(1280, 800));
//!     let desktop = Desktop::create(Sandbox::local(), config).await?;
//!
//!     desktop.left_click(Some((100, 200))).await?;
//!     desktop.write("hello world").await?;
//!     desktop.press("enter").await?;
//!
//!     let shot = desktop.screenshot().await?;
//!     shot.save("screen.png").await?;
//!     Ok(())
//! }
//! ```
//!
//! The desktop session is verified once, at bring-up. If the window manager
//! dies later, input operations keep running against a bare display until
//! [`Desktop::ensure_desktop_session`] is called again.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex_lite::Regex;
use tracing::{debug, info, warn};

use crate::capture::Screenshot;
use crate::display::{DisplayManager, ScreenSize};
use crate::keys::{self, MouseButton, ScrollDirection};
use crate::poll::PollConfig;
use crate::sandbox::{CommandHandle, Sandbox, SandboxBuilder};
use crate::shell::{self, quote};
use crate::stream::VncStream;
use crate::{Error, ExecOutput, Result};

/// Display used when none is configured.
pub const DEFAULT_DISPLAY: &str = ":0";

/// DPI used when none is configured.
pub const DEFAULT_DPI: u32 = 96;

/// Environment variable overriding the display identifier.
pub const ENV_DISPLAY: &str = "VOID_DESKTOP_DISPLAY";
/// Environment variable overriding the resolution (`WIDTHxHEIGHT`).
pub const ENV_RESOLUTION: &str = "VOID_DESKTOP_RESOLUTION";
/// Environment variable overriding the DPI.
pub const ENV_DPI: &str = "VOID_DESKTOP_DPI";

/// Bring-up parameters. Unset fields fall back to `:0`, 1024x768 and 96 DPI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesktopConfig {
    pub display: Option<String>,
    pub resolution: Option<ScreenSize>,
    pub dpi: Option<u32>,
    /// How long to wait for the display to answer
    pub startup_poll: Option<PollConfig>,
}

impl DesktopConfig {
    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn with_resolution(mut self, resolution: ScreenSize) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = Some(dpi);
        self
    }

    pub fn with_startup_poll(mut self, poll: PollConfig) -> Self {
        self.startup_poll = Some(poll);
        self
    }

    pub fn display(&self) -> &str {
        self.display.as_deref().unwrap_or(DEFAULT_DISPLAY)
    }

    pub fn resolution(&self) -> ScreenSize {
        self.resolution.unwrap_or_default()
    }

    pub fn dpi(&self) -> u32 {
        self.dpi.unwrap_or(DEFAULT_DPI)
    }

    pub fn startup_poll(&self) -> PollConfig {
        self.startup_poll.unwrap_or_default()
    }

    /// Default configuration with `VOID_DESKTOP_*` overrides applied.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    /// Apply `VOID_DESKTOP_*` environment overrides on top of `self`.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup` instead of the process environment.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(display) = lookup(ENV_DISPLAY).filter(|d| !d.is_empty()) {
            self.display = Some(display);
        }
        if let Some(resolution) = lookup(ENV_RESOLUTION) {
            self.resolution = Some(resolution.parse()?);
        }
        if let Some(dpi) = lookup(ENV_DPI) {
            let dpi = dpi
                .trim()
                .parse::<u32>()
                .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", ENV_DPI, dpi)))?;
            self.dpi = Some(dpi);
        }
        Ok(self)
    }
}

/// Mouse cursor coordinates in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPosition {
    pub x: u32,
    pub y: u32,
}

/// Pacing for [`Desktop::write_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Characters typed per xdotool call
    pub chunk_size: usize,
    /// Delay between keystrokes
    pub delay: Duration,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunk_size: 25,
            delay: Duration::from_millis(75),
        }
    }
}

/// A live desktop inside a sandbox.
pub struct Desktop {
    sandbox: Arc<Sandbox>,
    display: DisplayManager,
    stream: VncStream,
}

impl Desktop {
    /// Build the sandbox and bring the desktop up.
    ///
    /// `DISPLAY` is added to the sandbox environment, Xvfb is started and
    /// waited for, then the desktop session is launched.
    pub async fn create(builder: SandboxBuilder, config: DesktopConfig) -> Result<Self> {
        let display_id = config.display().to_string();
        let sandbox = builder.env("DISPLAY", display_id.clone()).build()?;

        let mut manager = DisplayManager::start(
            sandbox.clone(),
            display_id.clone(),
            config.resolution(),
            config.dpi(),
            &config.startup_poll(),
        )
        .await?;
        manager.ensure_desktop_session().await?;

        info!(display = %display_id, "desktop ready");
        Ok(Self {
            stream: VncStream::new(sandbox.clone(), display_id),
            display: manager,
            sandbox,
        })
    }

    /// Attach to a desktop that is already running in `sandbox`.
    ///
    /// Nothing is started; the desktop session is unknown until
    /// [`ensure_desktop_session`](Self::ensure_desktop_session) is called.
    pub fn connect(sandbox: Arc<Sandbox>, display: impl Into<String>) -> Self {
        let display = display.into();
        Self {
            stream: VncStream::new(sandbox.clone(), display.clone()),
            display: DisplayManager::attach(sandbox.clone(), display),
            sandbox,
        }
    }

    async fn xdotool(&self, args: &str) -> Result<ExecOutput> {
        self.sandbox.run(&format!("xdotool {}", args)).await
    }

    /// Move the mouse cursor.
    pub async fn move_mouse(&self, x: u32, y: u32) -> Result<()> {
        self.xdotool(&format!("mousemove --sync {} {}", x, y))
            .await?;
        Ok(())
    }

    async fn click_at(&self, at: Option<(u32, u32)>, click: &str) -> Result<()> {
        if let Some((x, y)) = at {
            self.move_mouse(x, y).await?;
        }
        self.xdotool(click).await?;
        Ok(())
    }

    /// Click `button`, optionally moving to `at` first.
    pub async fn click(&self, button: MouseButton, at: Option<(u32, u32)>) -> Result<()> {
        self.click_at(at, &format!("click {}", button.number()))
            .await
    }

    pub async fn left_click(&self, at: Option<(u32, u32)>) -> Result<()> {
        self.click(MouseButton::Left, at).await
    }

    pub async fn double_click(&self, at: Option<(u32, u32)>) -> Result<()> {
        self.click_at(at, &format!("click --repeat 2 {}", MouseButton::Left.number()))
            .await
    }

    pub async fn right_click(&self, at: Option<(u32, u32)>) -> Result<()> {
        self.click(MouseButton::Right, at).await
    }

    pub async fn middle_click(&self, at: Option<(u32, u32)>) -> Result<()> {
        self.click(MouseButton::Middle, at).await
    }

    /// Turn the mouse wheel `amount` notches.
    pub async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<()> {
        self.xdotool(&format!("click --repeat {} {}", amount, direction.button()))
            .await?;
        Ok(())
    }

    /// Hold a mouse button down.
    pub async fn mouse_press(&self, button: MouseButton) -> Result<()> {
        self.xdotool(&format!("mousedown {}", button.number()))
            .await?;
        Ok(())
    }

    /// Release a held mouse button.
    pub async fn mouse_release(&self, button: MouseButton) -> Result<()> {
        self.xdotool(&format!("mouseup {}", button.number()))
            .await?;
        Ok(())
    }

    /// Drag with the left button from `from` to `to`.
    pub async fn drag(&self, from: (u32, u32), to: (u32, u32)) -> Result<()> {
        self.move_mouse(from.0, from.1).await?;
        self.mouse_press(MouseButton::Left).await?;
        self.move_mouse(to.0, to.1).await?;
        self.mouse_release(MouseButton::Left).await
    }

    /// Current mouse cursor position.
    pub async fn cursor_position(&self) -> Result<CursorPosition> {
        let output = self.xdotool("getmouselocation").await?;
        let (x, y) = parse_pair(&CURSOR_REGEX, "cursor position", &output)?;
        Ok(CursorPosition { x, y })
    }

    /// Current screen size as reported by xrandr.
    pub async fn screen_size(&self) -> Result<ScreenSize> {
        let output = self.sandbox.run("xrandr").await?;
        let (width, height) = parse_pair(&SIZE_REGEX, "screen size", &output)?;
        Ok(ScreenSize::new(width, height))
    }

    /// Type `text` with default pacing.
    pub async fn write(&self, text: &str) -> Result<()> {
        self.write_with(text, WriteOptions::default()).await
    }

    /// Type `text` in chunks of `opts.chunk_size` characters.
    pub async fn write_with(&self, text: &str, opts: WriteOptions) -> Result<()> {
        let delay_ms = opts.delay.as_millis();
        for chunk in shell::chunks(text, opts.chunk_size) {
            self.xdotool(&format!("type --delay {} {}", delay_ms, quote(chunk)))
                .await?;
        }
        Ok(())
    }

    /// Press and release a single key, e.g. `"enter"` or `"f5"`.
    pub async fn press(&self, key: &str) -> Result<()> {
        self.xdotool(&format!("key {}", keys::map_key(key)))
            .await?;
        Ok(())
    }

    /// Press a chord, e.g. `["ctrl", "shift", "t"]`.
    pub async fn press_combo<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        self.xdotool(&format!("key {}", keys::map_combo(keys)))
            .await?;
        Ok(())
    }

    /// Capture the screen, including the pointer, as PNG.
    ///
    /// The temporary file is removed whether or not reading it succeeded.
    pub async fn screenshot(&self) -> Result<Screenshot> {
        let path = format!("/tmp/screenshot-{}.png", uuid::Uuid::now_v7().simple());
        self.sandbox
            .run(&format!("scrot --pointer {}", path))
            .await?;

        let data = self.sandbox.read_file(&path).await;
        if let Err(e) = self.sandbox.remove_file(&path).await {
            warn!(path = %path, "failed to remove screenshot: {}", e);
        }

        let data = data?;
        debug!(bytes = data.len(), "screenshot captured");
        Ok(Screenshot::new(data))
    }

    /// Id of the focused window.
    pub async fn current_window_id(&self) -> Result<String> {
        let output = self.xdotool("getwindowfocus").await?;
        Ok(output.stdout_str().trim().to_string())
    }

    /// Ids of the visible windows whose class matches `app`.
    ///
    /// No match yields an empty list.
    pub async fn application_windows(&self, app: &str) -> Result<Vec<String>> {
        let output = match self
            .xdotool(&format!("search --onlyvisible --class {}", quote(app)))
            .await
        {
            Ok(output) => output,
            // xdotool search exits 1 when nothing matches
            Err(Error::CommandExit {
                exit_code: 1,
                ref stdout,
                ..
            }) if stdout.trim().is_empty() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(output
            .stdout_str()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Title of window `window_id`.
    pub async fn window_title(&self, window_id: &str) -> Result<String> {
        let output = self
            .xdotool(&format!("getwindowname {}", quote(window_id)))
            .await?;
        Ok(output.stdout_str().trim().to_string())
    }

    /// Raise and focus window `window_id`.
    pub async fn activate_window(&self, window_id: &str) -> Result<()> {
        self.xdotool(&format!("windowactivate --sync {}", quote(window_id)))
            .await?;
        Ok(())
    }

    /// Launch a desktop application by its .desktop id, optionally with a URI.
    pub async fn launch(&self, app: &str, uri: Option<&str>) -> Result<CommandHandle> {
        let mut command = format!("gtk-launch {}", quote(app));
        if let Some(uri) = uri {
            command.push(' ');
            command.push_str(&quote(uri));
        }
        self.sandbox.spawn(&command).await
    }

    /// Open a file or URL with the default application.
    pub async fn open(&self, file_or_url: &str) -> Result<CommandHandle> {
        self.sandbox
            .spawn(&format!("xdg-open {}", quote(file_or_url)))
            .await
    }

    /// Sleep inside the sandbox.
    pub async fn wait(&self, duration: Duration) -> Result<()> {
        let limit = duration + self.sandbox.config().command_timeout;
        self.sandbox
            .run_with_timeout(&format!("sleep {}", duration.as_secs_f64()), Some(limit))
            .await?;
        Ok(())
    }

    /// Restart the desktop session if it is not running.
    ///
    /// Returns `true` if a new session was started.
    pub async fn ensure_desktop_session(&mut self) -> Result<bool> {
        self.display.ensure_desktop_session().await
    }

    pub fn stream(&self) -> &VncStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut VncStream {
        &mut self.stream
    }

    pub fn display(&self) -> &str {
        self.display.display()
    }

    pub fn display_manager(&self) -> &DisplayManager {
        &self.display
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Tear down the sandbox and everything in it.
    pub async fn kill(self) -> Result<()> {
        info!(display = %self.display.display(), "killing desktop sandbox");
        self.sandbox.kill().await
    }
}

static CURSOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"x:(\d+)\s+y:(\d+)").expect("Invalid cursor position regex"));
static SIZE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)x(\d+)").expect("Invalid screen size regex"));

/// Two numbers captured by `re` from a command's stdout.
fn parse_pair(re: &Regex, what: &'static str, output: &ExecOutput) -> Result<(u32, u32)> {
    let stdout = output.stdout_str();
    let parse_error = || Error::Parse {
        what,
        output: stdout.clone(),
    };

    let caps = re.captures(&stdout).ok_or_else(parse_error)?;
    let first = caps[1].parse::<u32>().map_err(|_| parse_error())?;
    let second = caps[2].parse::<u32>().map_err(|_| parse_error())?;
    Ok((first, second))
}
