use anyhow::Result;
use clap::{CommandFactory, Parser};
use dictad::audio::capture::list_devices;
use dictad::cli::{Cli, Commands};
use dictad::config::Config;
use dictad::daemon::run_daemon;
use dictad::error::DictadError;
use dictad::ipc::client::{send_command, stream_command};
use dictad::ipc::protocol::{Command, Event};
use dictad::ipc::server::IpcServer;
use owo_colors::OwoColorize;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);

    match cli.command {
        Commands::Daemon {
            socket,
            idle_timeout,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(device) = cli.device {
                config.audio.device = Some(device);
            }
            if let Some(model) = cli.model {
                config.model.path = Some(model);
            }
            if let Some(language) = cli.language {
                config.model.language = language;
            }
            if let Some(secs) = idle_timeout {
                config.model.idle_timeout_secs = secs;
            }
            run_daemon(config, socket).await?;
        }
        Commands::Start { socket } => {
            handle_start(socket).await?;
        }
        Commands::Stop { socket, session } => {
            handle_reply_command(socket, Command::Stop { session_id: session }).await?;
        }
        Commands::Cancel { socket, session } => {
            handle_reply_command(socket, Command::Cancel { session_id: session }).await?;
        }
        Commands::Status { socket } => {
            handle_status(socket).await?;
        }
        Commands::Listen { socket } => {
            handle_listen(socket).await?;
        }
        Commands::Shutdown { socket } => {
            handle_reply_command(socket, Command::Shutdown).await?;
        }
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "dictad", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the verbosity flags pick the filter.
/// Logs go to stderr so transcripts on stdout stay pipeable.
fn init_tracing(quiet: bool, verbose: u8) {
    let default_filter = match (quiet, verbose) {
        (true, _) => "dictad=warn",
        (false, 0) => "dictad=info",
        (false, 1) => "dictad=debug",
        (false, _) => "dictad=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/dictad/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        // Load from custom path
        Config::load(path)?
    } else {
        // Try default path, fall back to defaults
        let default_path = Config::default_path();
        Config::load_or_default(&default_path)
    };

    // Apply environment variable overrides
    Ok(config.with_env_overrides())
}

/// List available audio input devices.
fn list_audio_devices() -> Result<()> {
    let devices = list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

/// Start a session and render its event stream until it ends.
///
/// Partial results and state changes go to stderr; the final transcript is
/// printed to stdout so `dictad start | wl-copy` works.
async fn handle_start(socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);

    let mut stream = match stream_command(&socket_path, Command::Start).await {
        Ok(stream) => stream,
        Err(e) => connection_failed(&e),
    };

    let mut failed = false;
    while let Some(event) = stream.next_event().await? {
        match &event {
            Event::FinalResult { text, .. } => {
                if !text.is_empty() {
                    println!("{}", text);
                }
            }
            Event::Error { .. } => {
                dictad::output::render_event(&event);
                failed = true;
            }
            _ => dictad::output::render_event(&event),
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Send a single command and print the acknowledgement.
async fn handle_reply_command(socket: Option<PathBuf>, command: Command) -> Result<()> {
    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);

    match send_command(&socket_path, command).await {
        Ok(Event::Ok) => {
            println!("{}", "ok".green());
        }
        Ok(Event::Error { message, .. }) => {
            eprintln!("{}", format!("Error: {}", message).red());
            std::process::exit(1);
        }
        Ok(other) => {
            eprintln!("Unexpected reply: {:?}", other);
            std::process::exit(1);
        }
        Err(e) => connection_failed(&e),
    }

    Ok(())
}

/// Query the daemon and render a status report.
async fn handle_status(socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);

    match send_command(&socket_path, Command::Status).await {
        Ok(Event::Status {
            version,
            state,
            session_id,
            model_loaded,
            model_name,
            uptime_secs,
            device,
            sample_rate,
            vad_threshold,
        }) => {
            let client_version = dictad::version_string();

            println!("Status:");
            // Version info
            println!("  {}   {}", "Client:".dimmed(), client_version);
            print!("  {}   {}", "Daemon:".dimmed(), version);
            if client_version != version {
                print!(" {}", "(version mismatch!)".yellow());
            }
            println!();
            println!("  {}   {}", "Uptime:".dimmed(), format_uptime(uptime_secs));
            // Session
            match session_id {
                Some(id) => println!("  {}  {} ({})", "Session:".dimmed(), state, id),
                None => println!("  {}  {}", "Session:".dimmed(), state),
            }
            // Model
            if model_loaded && let Some(name) = model_name {
                println!("  {}    {}", "Model:".dimmed(), name);
            } else {
                println!("  {}    {}", "Model:".dimmed(), "not loaded".dimmed());
            }
            // Audio
            match device {
                Some(dev) => println!("  {}   {} @ {}Hz", "Device:".dimmed(), dev, sample_rate),
                None => println!("  {}   default @ {}Hz", "Device:".dimmed(), sample_rate),
            }
            println!("  {}      {:.3}", "VAD:".dimmed(), vad_threshold);
        }
        Ok(Event::Error { message, .. }) => {
            eprintln!("{}", format!("Error: {}", message).red());
            std::process::exit(1);
        }
        Ok(other) => {
            eprintln!("Unexpected reply: {:?}", other);
            std::process::exit(1);
        }
        Err(e) => connection_failed(&e),
    }

    Ok(())
}

/// Follow daemon events and render live output.
async fn handle_listen(socket: Option<PathBuf>) -> Result<()> {
    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);

    println!("Following daemon events... (Ctrl+C to stop)");

    let mut stream = match stream_command(&socket_path, Command::Listen).await {
        Ok(stream) => stream,
        Err(e) => connection_failed(&e),
    };
    while let Some(event) = stream.next_event().await? {
        dictad::output::render_event(&event);
    }

    dictad::output::clear_line();
    println!("Daemon connection closed");
    Ok(())
}

fn format_uptime(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}

fn connection_failed(e: &DictadError) -> ! {
    eprintln!(
        "{}",
        format!("Failed to communicate with daemon: {}", e).red()
    );
    eprintln!("Is the daemon running? Start it with: dictad daemon");
    std::process::exit(1);
}
