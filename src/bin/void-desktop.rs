use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use void_desktop::config::{load_spec, DesktopSpec};
use void_desktop::keys::map_combo;
use void_desktop::sandbox::{Sandbox, SandboxBuilder};
use void_desktop::stream::Resize;
use void_desktop::{Desktop, DesktopConfig, ScreenSize, StreamOptions, UrlOptions};

/// void-desktop - remote-controlled desktops in sandboxes
#[derive(Parser, Debug)]
#[command(name = "void-desktop")]
#[command(about = "Bring up, stream and drive a virtual X11 desktop")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a desktop and keep it up until Ctrl-C
    Up(UpArgs),
    /// Capture the screen of a running desktop
    Screenshot(ScreenshotArgs),
    /// Check a desktop spec file
    Validate {
        /// Spec file (.yaml, .yml or .json)
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the xdotool keysyms for a key chord
    Keys {
        /// Key names, e.g. `ctrl shift t`
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct UpArgs {
    /// Desktop spec file; flags below override it
    #[arg(long)]
    file: Option<PathBuf>,

    /// Use the simulated sandbox instead of this host
    #[arg(long)]
    mock: bool,

    /// X display, e.g. :1
    #[arg(long)]
    display: Option<String>,

    /// Screen size as WIDTHxHEIGHT
    #[arg(long)]
    resolution: Option<ScreenSize>,

    #[arg(long)]
    dpi: Option<u32>,

    /// Start the noVNC stream and print its URL
    #[arg(long)]
    stream: bool,

    /// Protect the stream with a generated password
    #[arg(long)]
    auth: bool,

    /// Viewer cannot send input
    #[arg(long)]
    view_only: bool,

    /// off, scale or remote
    #[arg(long)]
    resize: Option<Resize>,

    #[arg(long)]
    viewer_port: Option<u16>,

    #[arg(long)]
    bridge_port: Option<u16>,

    /// Stay up for this long instead of waiting for Ctrl-C (e.g. 30s, 5m)
    #[arg(long = "for", value_parser = humantime::parse_duration)]
    duration: Option<Duration>,
}

#[derive(Args, Debug)]
struct ScreenshotArgs {
    /// Where to write the PNG
    #[arg(short, long, default_value = "screenshot.png")]
    output: PathBuf,

    /// X display of the running desktop
    #[arg(long, env = "VOID_DESKTOP_DISPLAY", default_value = ":0")]
    display: String,

    /// Use the simulated sandbox instead of this host
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Up(args) => cmd_up(args).await?,
        Commands::Screenshot(args) => cmd_screenshot(args).await?,
        Commands::Validate { file } => cmd_validate(&file)?,
        Commands::Keys { names } => println!("{}", map_combo(&names)),
    }

    Ok(())
}

async fn cmd_up(args: UpArgs) -> Result<(), Box<dyn std::error::Error>> {
    let spec = args.file.as_deref().map(load_spec).transpose()?;

    let (mut builder, mut config, mut stream_opts, mut url_opts, mut stream) = match &spec {
        Some(spec) => (
            spec.sandbox_builder()?,
            spec.desktop_config()?,
            spec.stream_options(),
            spec.url_options(),
            spec.stream.enabled,
        ),
        None => (
            Sandbox::local(),
            DesktopConfig::default(),
            StreamOptions::new(),
            UrlOptions::default(),
            false,
        ),
    };
    config = config.apply_env()?;

    if args.mock {
        builder = rebuild_as_mock(spec.as_ref())?;
    }
    if let Some(display) = args.display {
        config = config.with_display(display);
    }
    if let Some(resolution) = args.resolution {
        config = config.with_resolution(resolution);
    }
    if let Some(dpi) = args.dpi {
        config = config.with_dpi(dpi);
    }
    if args.auth {
        stream_opts = stream_opts.require_auth(true);
    }
    if let Some(port) = args.viewer_port {
        stream_opts = stream_opts.viewer_port(port);
    }
    if let Some(port) = args.bridge_port {
        stream_opts = stream_opts.bridge_port(port);
    }
    if args.view_only {
        url_opts = url_opts.view_only(true);
    }
    if let Some(resize) = args.resize {
        url_opts = url_opts.resize(Some(resize));
    }
    stream |= args.stream || args.auth;

    let mut desktop = Desktop::create(builder, config).await?;
    println!("display: {}", desktop.display());
    println!("screen: {}", desktop.screen_size().await?);

    if stream {
        desktop.stream_mut().start(stream_opts).await?;
        if let Ok(key) = desktop.stream().auth_key() {
            url_opts = url_opts.auth_key(key);
            println!("auth key: {}", key);
        }
        println!("url: {}", desktop.stream().url(&url_opts)?);
    }

    match args.duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => {
            println!("press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    desktop.stream_mut().stop().await?;
    Ok(())
}

/// Same sandbox settings as the spec, but simulated.
fn rebuild_as_mock(spec: Option<&DesktopSpec>) -> Result<SandboxBuilder, Box<dyn std::error::Error>> {
    match spec {
        Some(spec) => {
            let mut spec = spec.clone();
            spec.sandbox.mode = void_desktop::config::SandboxMode::Mock;
            Ok(spec.sandbox_builder()?)
        }
        None => Ok(Sandbox::mock()),
    }
}

async fn cmd_screenshot(args: ScreenshotArgs) -> Result<(), Box<dyn std::error::Error>> {
    // the simulated sandbox has no desktop until one is brought up
    let desktop = if args.mock {
        Desktop::create(Sandbox::mock(), DesktopConfig::default().with_display(args.display)).await?
    } else {
        let sandbox = Sandbox::local().env("DISPLAY", args.display.clone()).build()?;
        Desktop::connect(sandbox, args.display)
    };
    let shot = desktop.screenshot().await?;
    shot.save(&args.output).await?;
    println!("wrote {} ({} bytes)", args.output.display(), shot.len());
    Ok(())
}

fn cmd_validate(file: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    // load_spec rejects invalid specs
    let spec = load_spec(file)?;
    println!(
        "valid: {} (name={}, sandbox={:?}, api_version={})",
        file.display(),
        spec.name,
        spec.sandbox.mode,
        spec.api_version
    );
    Ok(())
}
