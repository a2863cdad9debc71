//! Desktop spec files.
//!
//! A spec describes which sandbox to use, how to bring the desktop up and
//! whether to stream it. YAML (`.yaml`/`.yml`) and JSON are accepted:
//!
//! ```yaml
//! api_version: v1
//! name: browser-desk
//! sandbox:
//!   mode: local
//!   command_timeout: 90s
//!   env:
//!     LANG: C.UTF-8
//! desktop:
//!   display: ":1"
//!   resolution: 1280x800
//! stream:
//!   enabled: true
//!   require_auth: true
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::desktop::{DesktopConfig, ENV_DISPLAY};
use crate::display::ScreenSize;
use crate::poll::PollConfig;
use crate::sandbox::{Sandbox, SandboxBuilder, DEFAULT_COMMAND_TIMEOUT};
use crate::stream::{Resize, StreamOptions, UrlOptions};
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesktopSpec {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    pub name: String,
    #[serde(default)]
    pub sandbox: SandboxSpec,
    #[serde(default)]
    pub desktop: DisplaySpec,
    #[serde(default)]
    pub stream: StreamSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    #[default]
    Local,
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    #[serde(default)]
    pub mode: SandboxMode,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Host name reported for exposed ports (local mode).
    #[serde(default)]
    pub public_host: Option<String>,
    /// Per-command timeout, e.g. "60s" or "2m".
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            mode: SandboxMode::default(),
            env: BTreeMap::new(),
            public_host: None,
            command_timeout: default_command_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplaySpec {
    #[serde(default)]
    pub display: Option<String>,
    /// `WIDTHxHEIGHT`
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub dpi: Option<u32>,
    /// How long to wait for the display to come up, e.g. "10s".
    #[serde(default)]
    pub startup_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Start the stream right after bring-up.
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub options: StreamOptions,
    #[serde(default)]
    pub view_only: bool,
    #[serde(default)]
    pub resize: Option<Resize>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_command_timeout() -> String {
    humantime::format_duration(DEFAULT_COMMAND_TIMEOUT).to_string()
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| Error::Config(format!("invalid {} '{}': {}", field, value, e)))
}

impl DesktopSpec {
    /// Sandbox builder for this spec's sandbox section.
    pub fn sandbox_builder(&self) -> Result<SandboxBuilder> {
        let mut builder = match self.sandbox.mode {
            SandboxMode::Local => Sandbox::local(),
            SandboxMode::Mock => Sandbox::mock(),
        };
        builder = builder.command_timeout(parse_duration(
            "sandbox.command_timeout",
            &self.sandbox.command_timeout,
        )?);
        if let Some(host) = &self.sandbox.public_host {
            builder = builder.public_host(host.clone());
        }
        for (key, value) in &self.sandbox.env {
            builder = builder.env(key.clone(), value.clone());
        }
        Ok(builder)
    }

    /// Bring-up parameters from the desktop section.
    pub fn desktop_config(&self) -> Result<DesktopConfig> {
        let resolution = self
            .desktop
            .resolution
            .as_deref()
            .map(str::parse::<ScreenSize>)
            .transpose()?;
        let startup_poll = self
            .desktop
            .startup_timeout
            .as_deref()
            .map(|t| parse_duration("desktop.startup_timeout", t))
            .transpose()?
            .map(|timeout| PollConfig {
                timeout,
                ..PollConfig::default()
            });

        Ok(DesktopConfig {
            display: self.desktop.display.clone(),
            resolution,
            dpi: self.desktop.dpi,
            startup_poll,
        })
    }

    pub fn stream_options(&self) -> StreamOptions {
        self.stream.options.clone()
    }

    /// URL options matching the stream section. The auth key is filled in
    /// by the caller once the stream is running.
    pub fn url_options(&self) -> UrlOptions {
        let mut opts = UrlOptions::default().view_only(self.stream.view_only);
        if let Some(resize) = self.stream.resize {
            opts = opts.resize(Some(resize));
        }
        opts
    }
}

pub fn load_spec(path: &Path) -> Result<DesktopSpec> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let spec: DesktopSpec = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML spec {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON spec {}: {}", path.display(), e)))?
    };

    validate_spec(&spec)?;
    Ok(spec)
}

pub fn validate_spec(spec: &DesktopSpec) -> Result<()> {
    if spec.api_version != "v1" {
        return Err(Error::Config(format!(
            "unsupported api_version '{}', expected 'v1'",
            spec.api_version
        )));
    }
    if spec.name.trim().is_empty() {
        return Err(Error::Config("name cannot be empty".into()));
    }

    if let Some(display) = &spec.desktop.display {
        if !display.starts_with(':') {
            return Err(Error::Config(format!(
                "desktop.display '{}' must look like ':0'",
                display
            )));
        }
    }
    if spec.sandbox.env.contains_key("DISPLAY") {
        return Err(Error::Config(format!(
            "sandbox.env must not set DISPLAY, use desktop.display or {}",
            ENV_DISPLAY
        )));
    }
    if spec.desktop.dpi == Some(0) {
        return Err(Error::Config("desktop.dpi must be positive".into()));
    }

    let opts = &spec.stream.options;
    if opts.viewer_port == Some(0) || opts.bridge_port == Some(0) {
        return Err(Error::Config("stream ports must be non-zero".into()));
    }
    let viewer = opts.viewer_port.unwrap_or(crate::stream::DEFAULT_VIEWER_PORT);
    let bridge = opts.bridge_port.unwrap_or(crate::stream::DEFAULT_BRIDGE_PORT);
    if viewer == bridge {
        return Err(Error::Config(format!(
            "stream.viewer_port and stream.bridge_port are both {}",
            viewer
        )));
    }

    // surface parse errors at load time rather than at bring-up
    spec.sandbox_builder()?;
    spec.desktop_config()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::sandbox::SandboxType;

    fn write_spec(name: &str, content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_yaml_spec() {
        let (_dir, path) = write_spec(
            "desk.yaml",
            r#"
name: browser-desk
sandbox:
  mode: mock
  command_timeout: 90s
  env:
    LANG: C.UTF-8
desktop:
  display: ":1"
  resolution: 1280x800
  dpi: 120
  startup_timeout: 30s
stream:
  enabled: true
  bridge_port: 6081
  require_auth: true
  view_only: true
  resize: remote
"#,
        );

        let spec = load_spec(&path).unwrap();
        assert_eq!(spec.api_version, "v1");
        assert_eq!(spec.sandbox.mode, SandboxMode::Mock);

        let builder = spec.sandbox_builder().unwrap();
        assert_eq!(builder.sandbox_type(), SandboxType::Mock);
        let sandbox = builder.build().unwrap();
        assert_eq!(sandbox.config().command_timeout, Duration::from_secs(90));
        assert_eq!(sandbox.config().env_var("LANG"), Some("C.UTF-8"));

        let config = spec.desktop_config().unwrap();
        assert_eq!(config.display(), ":1");
        assert_eq!(config.resolution(), ScreenSize::new(1280, 800));
        assert_eq!(config.dpi(), 120);
        assert_eq!(config.startup_poll().timeout, Duration::from_secs(30));

        assert!(spec.stream.enabled);
        let opts = spec.stream_options();
        assert_eq!(opts.bridge_port, Some(6081));
        assert_eq!(opts.viewer_port, None);
        assert_eq!(opts.require_auth, Some(true));

        let url = spec.url_options();
        assert!(url.view_only);
        assert_eq!(url.resize, Some(Resize::Remote));
    }

    #[test]
    fn test_load_json_spec_defaults() {
        let (_dir, path) = write_spec("desk.json", r#"{"name": "plain"}"#);

        let spec = load_spec(&path).unwrap();
        assert_eq!(spec.sandbox.mode, SandboxMode::Local);
        assert!(!spec.stream.enabled);

        let sandbox = spec.sandbox_builder().unwrap().build().unwrap();
        assert_eq!(sandbox.config().command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(spec.desktop_config().unwrap(), DesktopConfig::default());
        assert_eq!(spec.url_options(), UrlOptions::default());
    }

    #[test]
    fn test_invalid_specs_rejected() {
        let cases = [
            r#"{"name": "x", "api_version": "v2"}"#,
            r#"{"name": "  "}"#,
            r#"{"name": "x", "desktop": {"resolution": "big"}}"#,
            r#"{"name": "x", "desktop": {"display": "0"}}"#,
            r#"{"name": "x", "desktop": {"dpi": 0}}"#,
            r#"{"name": "x", "sandbox": {"command_timeout": "soon"}}"#,
            r#"{"name": "x", "sandbox": {"env": {"DISPLAY": ":9"}}}"#,
            r#"{"name": "x", "stream": {"viewer_port": 6080}}"#,
            r#"{"name": "x", "sandbox": {"mode": "firecracker"}}"#,
        ];
        for case in cases {
            let (_dir, path) = write_spec("bad.json", case);
            let err = load_spec(&path).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{case}: {err}");
        }
    }

    #[test]
    fn test_missing_file() {
        let err = load_spec(Path::new("/nonexistent/desk.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
