//! Remote viewing of the desktop through x11vnc and a noVNC web proxy.
//!
//! x11vnc serves the display over VNC on the viewer port; noVNC's
//! `novnc_proxy` bridges that to a websocket + web client on the bridge
//! port, which the sandbox platform exposes as an HTTPS host.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::poll::PollConfig;
use crate::sandbox::{CommandHandle, Sandbox};
use crate::shell::quote;
use crate::{Error, Result};

/// Default VNC port x11vnc listens on.
pub const DEFAULT_VIEWER_PORT: u16 = 5900;

/// Default port noVNC listens on.
pub const DEFAULT_BRIDGE_PORT: u16 = 6080;

/// Length of generated stream passwords.
pub const PASSWORD_LEN: usize = 16;

const PASSWORD_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Lifecycle of a [`VncStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Starting,
    Running,
}

/// Options for [`VncStream::start`]. Unset fields fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Port x11vnc listens on (default 5900)
    #[serde(default)]
    pub viewer_port: Option<u16>,
    /// Port noVNC listens on (default 6080)
    #[serde(default)]
    pub bridge_port: Option<u16>,
    /// Protect the stream with a generated password
    #[serde(default)]
    pub require_auth: Option<bool>,
    /// Stream a single X window instead of the whole screen
    #[serde(default)]
    pub window_id: Option<String>,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn viewer_port(mut self, port: u16) -> Self {
        self.viewer_port = Some(port);
        self
    }

    pub fn bridge_port(mut self, port: u16) -> Self {
        self.bridge_port = Some(port);
        self
    }

    pub fn require_auth(mut self, enabled: bool) -> Self {
        self.require_auth = Some(enabled);
        self
    }

    pub fn window_id(mut self, id: impl Into<String>) -> Self {
        self.window_id = Some(id.into());
        self
    }
}

/// How the noVNC client fits the remote screen into the browser window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resize {
    Off,
    #[default]
    Scale,
    Remote,
}

impl Resize {
    pub fn as_str(self) -> &'static str {
        match self {
            Resize::Off => "off",
            Resize::Scale => "scale",
            Resize::Remote => "remote",
        }
    }
}

impl fmt::Display for Resize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Resize::Off),
            "scale" => Ok(Resize::Scale),
            "remote" => Ok(Resize::Remote),
            other => Err(Error::Config(format!(
                "invalid resize mode '{}', expected off, scale or remote",
                other
            ))),
        }
    }
}

/// Query options for [`VncStream::url`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlOptions {
    /// Connect as soon as the page loads
    pub auto_connect: bool,
    /// Disable keyboard and mouse input from the viewer
    pub view_only: bool,
    /// Resize mode; `None` leaves it to the client
    pub resize: Option<Resize>,
    /// Password to embed, usually [`VncStream::auth_key`]
    pub auth_key: Option<String>,
}

impl Default for UrlOptions {
    fn default() -> Self {
        Self {
            auto_connect: true,
            view_only: false,
            resize: Some(Resize::Scale),
            auth_key: None,
        }
    }
}

impl UrlOptions {
    pub fn auth_key(mut self, key: impl Into<String>) -> Self {
        self.auth_key = Some(key.into());
        self
    }

    pub fn view_only(mut self, view_only: bool) -> Self {
        self.view_only = view_only;
        self
    }

    pub fn resize(mut self, resize: Option<Resize>) -> Self {
        self.resize = resize;
        self
    }

    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }
}

/// Random alphanumeric string from the OS CSPRNG.
///
/// Bytes at or above the largest multiple of the alphabet size are
/// discarded so every character is equally likely.
pub fn generate_password(len: usize) -> Result<String> {
    let alphabet_len = PASSWORD_ALPHABET.len();
    let limit = (256 / alphabet_len) * alphabet_len;

    let mut password = String::with_capacity(len);
    let mut buf = [0u8; 64];
    while password.len() < len {
        getrandom::fill(&mut buf)
            .map_err(|e| Error::Sandbox(format!("failed to generate stream password: {}", e)))?;
        for &b in buf.iter().filter(|&&b| (b as usize) < limit) {
            if password.len() == len {
                break;
            }
            password.push(PASSWORD_ALPHABET[b as usize % alphabet_len] as char);
        }
    }
    Ok(password)
}

/// noVNC proxy command line bridging `viewer_port` to `bridge_port`.
pub fn novnc_command(viewer_port: u16, bridge_port: u16) -> String {
    format!(
        "cd /opt/noVNC/utils && ./novnc_proxy --vnc localhost:{} --listen {} --web /opt/noVNC > /tmp/novnc.log 2>&1",
        viewer_port, bridge_port
    )
}

/// The remote-viewing bridge of one desktop.
pub struct VncStream {
    sandbox: Arc<Sandbox>,
    display: String,
    viewer_port: u16,
    bridge_port: u16,
    auth_enabled: bool,
    password: Option<String>,
    url: Option<Url>,
    proxy: Option<CommandHandle>,
    state: StreamState,
    port_poll: PollConfig,
}

impl VncStream {
    pub fn new(sandbox: Arc<Sandbox>, display: impl Into<String>) -> Self {
        Self {
            sandbox,
            display: display.into(),
            viewer_port: DEFAULT_VIEWER_PORT,
            bridge_port: DEFAULT_BRIDGE_PORT,
            auth_enabled: false,
            password: None,
            url: None,
            proxy: None,
            state: StreamState::Stopped,
            port_poll: PollConfig::for_port(),
        }
    }

    /// Override how long `start` waits for noVNC to listen.
    pub fn with_port_poll(mut self, poll: PollConfig) -> Self {
        self.port_poll = poll;
        self
    }

    /// Start x11vnc and the noVNC proxy.
    ///
    /// Fails with [`Error::StreamAlreadyRunning`] before touching any state
    /// if an x11vnc server is already up. A proxy that never starts
    /// listening yields [`Error::Timeout`]; whatever was started is left for
    /// [`stop`](Self::stop) to clean up.
    pub async fn start(&mut self, opts: StreamOptions) -> Result<()> {
        if self.is_running().await? {
            return Err(Error::StreamAlreadyRunning);
        }

        self.state = StreamState::Starting;
        let result = self.start_inner(opts).await;
        self.state = match result {
            Ok(()) => StreamState::Running,
            Err(_) => StreamState::Stopped,
        };
        result
    }

    async fn start_inner(&mut self, opts: StreamOptions) -> Result<()> {
        let viewer_port = opts.viewer_port.unwrap_or(DEFAULT_VIEWER_PORT);
        let bridge_port = opts.bridge_port.unwrap_or(DEFAULT_BRIDGE_PORT);
        let auth_enabled = opts.require_auth.unwrap_or(false);
        let password = if auth_enabled {
            Some(generate_password(PASSWORD_LEN)?)
        } else {
            None
        };

        let host = self.sandbox.expose_port(bridge_port).await?;
        let base = Url::parse(&format!("https://{}/vnc.html", host))?;

        let vnc_command = self
            .vnc_command(viewer_port, password.as_deref(), opts.window_id.as_deref())
            .await?;
        self.sandbox.run(&vnc_command).await?;

        let proxy = self
            .sandbox
            .spawn(&novnc_command(viewer_port, bridge_port))
            .await?;
        self.proxy = Some(proxy);

        if !self.wait_for_port(bridge_port).await? {
            return Err(Error::Timeout("Could not start noVNC server".into()));
        }

        info!(
            viewer_port,
            bridge_port,
            auth = auth_enabled,
            "stream started at {}",
            base
        );
        self.viewer_port = viewer_port;
        self.bridge_port = bridge_port;
        self.auth_enabled = auth_enabled;
        self.password = password;
        self.url = Some(base);
        Ok(())
    }

    /// Build the x11vnc command line, storing `password` first if given.
    async fn vnc_command(
        &self,
        viewer_port: u16,
        password: Option<&str>,
        window_id: Option<&str>,
    ) -> Result<String> {
        let mut pwd_flag = "-nopw";
        if let Some(password) = password {
            self.sandbox.run("mkdir -p ~/.vnc").await?;
            self.sandbox
                .run(&format!("x11vnc -storepasswd {} ~/.vnc/passwd", password))
                .await?;
            pwd_flag = "-usepw";
        }

        let mut command = format!(
            "x11vnc -bg -display {} -forever -wait 50 -shared -rfbport {} {} 2>/tmp/x11vnc_stderr.log",
            quote(&self.display),
            viewer_port,
            pwd_flag
        );
        if let Some(id) = window_id {
            command.push_str(&format!(" -id {}", quote(id)));
        }
        Ok(command)
    }

    async fn wait_for_port(&self, port: u16) -> Result<bool> {
        self.sandbox
            .wait_and_verify(
                &format!("netstat -tuln | grep \":{} \"", port),
                |r| !r.stdout_str().trim().is_empty(),
                &self.port_poll,
            )
            .await
    }

    /// Stop x11vnc and the noVNC proxy. Safe to call when nothing runs.
    ///
    /// The password of the last start is kept.
    pub async fn stop(&mut self) -> Result<()> {
        if self.is_running().await? {
            match self.sandbox.run("pkill x11vnc").await {
                Ok(_) => {}
                // exited between the check and the kill
                Err(e) if e.is_transient() => debug!("pkill x11vnc: {}", e),
                Err(e) => return Err(e),
            }
        }

        let proxy = self.proxy.take();
        if self.url.take().is_some() {
            info!("stream stopped");
        }
        self.state = StreamState::Stopped;

        if let Some(proxy) = proxy {
            self.sandbox.kill_process(&proxy).await?;
        }
        Ok(())
    }

    /// Whether an x11vnc server is running in the sandbox.
    pub async fn is_running(&self) -> Result<bool> {
        match self.sandbox.run("pgrep -x x11vnc").await {
            Ok(output) => Ok(!output.stdout_str().trim().is_empty()),
            Err(e) if e.is_transient() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Password of the stream, if it was started with authentication.
    pub fn auth_key(&self) -> Result<&str> {
        self.password.as_deref().ok_or(Error::AuthNotEnabled)
    }

    /// URL of the noVNC web client with `opts` encoded as query parameters.
    pub fn url(&self, opts: &UrlOptions) -> Result<String> {
        let mut url = self.url.clone().ok_or(Error::StreamNotRunning)?;
        {
            let mut query = url.query_pairs_mut();
            if opts.auto_connect {
                query.append_pair("autoconnect", "true");
            }
            if opts.view_only {
                query.append_pair("view_only", "true");
            }
            if let Some(resize) = opts.resize {
                query.append_pair("resize", resize.as_str());
            }
            if let Some(key) = opts.auth_key.as_deref().filter(|k| !k.is_empty()) {
                query.append_pair("password", key);
            }
        }
        Ok(url.to_string().trim_end_matches('?').to_string())
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn viewer_port(&self) -> u16 {
        self.viewer_port
    }

    pub fn bridge_port(&self) -> u16 {
        self.bridge_port
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_enabled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn stream() -> (Arc<Sandbox>, VncStream) {
        let sandbox = Sandbox::mock().build().unwrap();
        let stream = VncStream::new(sandbox.clone(), ":0");
        (sandbox, stream)
    }

    #[test]
    fn test_generate_password() {
        let a = generate_password(PASSWORD_LEN).unwrap();
        let b = generate_password(PASSWORD_LEN).unwrap();
        assert_eq!(a.len(), PASSWORD_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
        assert_eq!(generate_password(0).unwrap(), "");
        assert_eq!(generate_password(200).unwrap().len(), 200);
    }

    #[test]
    fn test_resize_parse() {
        assert_eq!("Remote".parse::<Resize>().unwrap(), Resize::Remote);
        assert_eq!(Resize::default().to_string(), "scale");
        assert!("stretch".parse::<Resize>().is_err());
    }

    #[test]
    fn test_novnc_command_uses_ports() {
        assert_eq!(
            novnc_command(5901, 6081),
            "cd /opt/noVNC/utils && ./novnc_proxy --vnc localhost:5901 --listen 6081 --web /opt/noVNC > /tmp/novnc.log 2>&1"
        );
    }

    #[test]
    fn test_url_before_start_fails() {
        let (_, stream) = stream();
        assert!(matches!(
            stream.url(&UrlOptions::default()),
            Err(Error::StreamNotRunning)
        ));
        assert!(matches!(stream.auth_key(), Err(Error::AuthNotEnabled)));
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_start_without_auth() {
        let (sandbox, mut stream) = stream();
        stream.start(StreamOptions::new()).await.unwrap();

        assert_eq!(stream.state(), StreamState::Running);
        assert!(matches!(stream.auth_key(), Err(Error::AuthNotEnabled)));
        assert_eq!(
            stream.url(&UrlOptions::default()).unwrap(),
            "https://6080-mock.sandbox.local/vnc.html?autoconnect=true&resize=scale"
        );

        let mock = sandbox.as_mock().unwrap();
        assert!(mock.commands().contains(
            &"x11vnc -bg -display :0 -forever -wait 50 -shared -rfbport 5900 -nopw 2>/tmp/x11vnc_stderr.log"
                .to_string()
        ));
        assert_eq!(mock.spawned(), vec![novnc_command(5900, 6080)]);
    }

    #[tokio::test]
    async fn test_start_with_auth_and_custom_ports() {
        let (sandbox, mut stream) = stream();
        stream
            .start(
                StreamOptions::new()
                    .viewer_port(5901)
                    .bridge_port(6081)
                    .require_auth(true)
                    .window_id("0x400007"),
            )
            .await
            .unwrap();

        let key = stream.auth_key().unwrap().to_string();
        assert_eq!(key.len(), PASSWORD_LEN);

        let commands = sandbox.as_mock().unwrap().commands();
        assert!(commands.contains(&"mkdir -p ~/.vnc".to_string()));
        assert!(commands.contains(&format!("x11vnc -storepasswd {} ~/.vnc/passwd", key)));
        assert!(commands.contains(
            &"x11vnc -bg -display :0 -forever -wait 50 -shared -rfbport 5901 -usepw 2>/tmp/x11vnc_stderr.log -id 0x400007"
                .to_string()
        ));

        let url = stream
            .url(&UrlOptions::default().view_only(true).auth_key(key.clone()))
            .unwrap();
        assert_eq!(
            url,
            format!(
                "https://6081-mock.sandbox.local/vnc.html?autoconnect=true&view_only=true&resize=scale&password={}",
                key
            )
        );
    }

    #[tokio::test]
    async fn test_url_without_options() {
        let (_, mut stream) = stream();
        stream.start(StreamOptions::new()).await.unwrap();
        let url = stream
            .url(&UrlOptions::default().auto_connect(false).resize(None))
            .unwrap();
        assert_eq!(url, "https://6080-mock.sandbox.local/vnc.html");
    }

    #[tokio::test]
    async fn test_start_while_running_fails_without_side_effects() {
        let (sandbox, mut stream) = stream();
        stream
            .start(StreamOptions::new().require_auth(true))
            .await
            .unwrap();
        let key = stream.auth_key().unwrap().to_string();
        let commands_before = sandbox.as_mock().unwrap().commands().len();

        let err = stream
            .start(StreamOptions::new().bridge_port(7000).require_auth(false))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::StreamAlreadyRunning));
        assert_eq!(stream.auth_key().unwrap(), key);
        assert_eq!(stream.bridge_port(), DEFAULT_BRIDGE_PORT);
        assert_eq!(stream.state(), StreamState::Running);
        // only the pgrep probe ran
        assert_eq!(sandbox.as_mock().unwrap().commands().len(), commands_before + 1);
    }

    #[tokio::test]
    async fn test_start_refused_when_foreign_server_running() {
        let (sandbox, mut stream) = stream();
        sandbox.as_mock().unwrap().set_vnc_running(true);
        assert!(matches!(
            stream.start(StreamOptions::new()).await,
            Err(Error::StreamAlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_keeps_key() {
        let (sandbox, mut stream) = stream();
        stream
            .start(StreamOptions::new().require_auth(true))
            .await
            .unwrap();
        let key = stream.auth_key().unwrap().to_string();

        stream.stop().await.unwrap();
        stream.stop().await.unwrap();

        assert_eq!(stream.state(), StreamState::Stopped);
        assert_eq!(stream.auth_key().unwrap(), key);
        assert!(matches!(
            stream.url(&UrlOptions::default()),
            Err(Error::StreamNotRunning)
        ));

        let mock = sandbox.as_mock().unwrap();
        assert!(mock.running_pids().is_empty());
        assert_eq!(
            mock.commands().iter().filter(|c| *c == "pkill x11vnc").count(),
            1
        );
    }

    #[tokio::test]
    async fn test_restart_without_auth_clears_key() {
        let (_, mut stream) = stream();
        stream
            .start(StreamOptions::new().require_auth(true))
            .await
            .unwrap();
        stream.stop().await.unwrap();

        stream
            .start(StreamOptions::new().require_auth(false))
            .await
            .unwrap();
        assert!(matches!(stream.auth_key(), Err(Error::AuthNotEnabled)));
    }

    #[tokio::test]
    async fn test_restart_with_auth_omitted_clears_key() {
        let (_, mut stream) = stream();
        stream
            .start(StreamOptions::new().require_auth(true))
            .await
            .unwrap();
        stream.stop().await.unwrap();

        stream.start(StreamOptions::new()).await.unwrap();
        assert!(!stream.auth_enabled());
        assert!(matches!(stream.auth_key(), Err(Error::AuthNotEnabled)));
    }

    #[tokio::test]
    async fn test_restart_uses_default_ports() {
        let (sandbox, mut stream) = stream();
        stream
            .start(StreamOptions::new().viewer_port(5901).bridge_port(6081))
            .await
            .unwrap();
        stream.stop().await.unwrap();

        stream.start(StreamOptions::new()).await.unwrap();
        assert_eq!(stream.viewer_port(), DEFAULT_VIEWER_PORT);
        assert_eq!(stream.bridge_port(), DEFAULT_BRIDGE_PORT);
        assert_eq!(
            sandbox.as_mock().unwrap().spawned().last().unwrap(),
            &novnc_command(DEFAULT_VIEWER_PORT, DEFAULT_BRIDGE_PORT)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_restart_keeps_last_key() {
        let (sandbox, stream) = stream();
        let mut stream = stream.with_port_poll(PollConfig::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
        ));
        stream
            .start(StreamOptions::new().require_auth(true))
            .await
            .unwrap();
        let key = stream.auth_key().unwrap().to_string();
        stream.stop().await.unwrap();

        sandbox.as_mock().unwrap().bridge_never_listens();
        assert!(stream.start(StreamOptions::new()).await.is_err());
        assert_eq!(stream.auth_key().unwrap(), key);
        stream.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_window_id_is_quoted() {
        let (sandbox, mut stream) = stream();
        stream
            .start(StreamOptions::new().window_id("0x1; touch /tmp/x"))
            .await
            .unwrap();

        let commands = sandbox.as_mock().unwrap().commands();
        let vnc = commands
            .iter()
            .find(|c| c.starts_with("x11vnc -bg"))
            .unwrap();
        assert!(vnc.ends_with("2>/tmp/x11vnc_stderr.log -id '0x1; touch /tmp/x'"));
    }

    #[tokio::test]
    async fn test_stop_clears_state_when_proxy_kill_fails() {
        let (sandbox, mut stream) = stream();
        stream.start(StreamOptions::new()).await.unwrap();

        // tearing the sandbox down first leaves no proxy to kill
        sandbox.kill().await.unwrap();
        assert!(matches!(stream.stop().await, Err(Error::Sandbox(_))));

        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(matches!(
            stream.url(&UrlOptions::default()),
            Err(Error::StreamNotRunning)
        ));
        stream.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_timeout_leaves_cleanup_to_stop() {
        let (sandbox, stream) = stream();
        let mut stream = stream.with_port_poll(PollConfig::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
        ));
        let mock = sandbox.as_mock().unwrap();
        mock.bridge_never_listens();

        let err = stream.start(StreamOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(ref msg) if msg == "Could not start noVNC server"));
        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(stream.url(&UrlOptions::default()).is_err());
        assert_eq!(mock.running_pids().len(), 1);

        stream.stop().await.unwrap();
        assert!(mock.running_pids().is_empty());
        assert!(!stream.is_running().await.unwrap());
    }
}
