use clap::{Parser, Subcommand};
use lumabeat_common::{Request, Response, TempoCommand};
use tokio::net::UnixStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Parser)]
#[command(
    name = "lmbctl",
    version,
    about = "Lumabeat control utility - drive your lights from your music",
    long_about = r#"
Lumabeat Control Utility (lmbctl)
═════════════════════════════════

A CLI tool to control the Lumabeat lighting daemon.

All behavior (webhook endpoint, tempo mapping, palette tuning, per-player
rules) is configured through the config file at
~/.config/lumabeat/config.toml

EXAMPLES:
  lmbctl status                             Show the owning player and palette
  lmbctl sources                            List every visible media player
  lmbctl pause                              Freeze the lights on the current color
  lmbctl refresh                            Re-read artwork and tempo right now
  lmbctl tempo get "Orbital" "Halcyon"      Show the cached BPM for a track
  lmbctl tempo forget "Orbital" "Halcyon"   Drop a bad cached BPM

CONFIG:
  ~/.config/lumabeat/config.toml
"#,
    after_help = "Use 'lmbctl <command> --help' for more info on a specific command."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon socket path (defaults to XDG_RUNTIME_DIR/lumabeat.sock or /tmp/lumabeat-{USER}.sock)
    #[arg(short, long, global = true)]
    socket: Option<String>,

    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the owning source, track, palette and cadence
    #[command(visible_alias = "st")]
    Status,

    /// Pause color alternation, holding the current color
    Pause,

    /// Resume a paused alternation
    Resume,

    /// Stop alternating and release the light lock
    Stop,

    /// Re-run arbitration, artwork and tempo lookup immediately
    #[command(visible_alias = "r")]
    Refresh,

    /// List every media player the daemon can see
    #[command(visible_alias = "ls")]
    Sources,

    /// Inspect or evict cached track tempos
    Tempo {
        #[command(subcommand)]
        command: TempoSubcommand,
    },

    /// Validate configuration file without starting daemon
    #[command(name = "check-config", visible_alias = "cc")]
    CheckConfig,

    /// Stop the daemon gracefully
    Kill,
}

#[derive(Subcommand)]
enum TempoSubcommand {
    /// Show the cached BPM for a track
    Get { artist: String, title: String },
    /// Drop the cached BPM so the next play looks it up again
    Forget { artist: String, title: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle local commands first (don't need daemon connection)
    if let Commands::CheckConfig = &cli.command {
        let config_path = dirs::config_dir()
            .map(|p| p.join("lumabeat").join("config.toml"))
            .unwrap_or_else(|| std::path::PathBuf::from("config.toml"));

        if !config_path.exists() {
            eprintln!("✗ No config file found at {:?}", config_path);
            eprintln!("  The daemon requires at least light.webhook-url to be set.");
            std::process::exit(1);
        }

        let content = std::fs::read_to_string(&config_path)?;
        match toml::from_str::<toml::Value>(&content) {
            Ok(value) => {
                let webhook = value
                    .get("light")
                    .and_then(|l| l.get("webhook-url"))
                    .and_then(|u| u.as_str())
                    .unwrap_or("");
                if webhook.is_empty() {
                    eprintln!("✗ Configuration error: light.webhook-url is not set");
                    std::process::exit(1);
                }
                println!("✓ Configuration valid: {:?}", config_path);
            }
            Err(e) => {
                eprintln!("✗ Configuration error: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let request = match cli.command {
        Commands::Status => Request::Status,
        Commands::Pause => Request::Pause,
        Commands::Resume => Request::Resume,
        Commands::Stop => Request::Stop,
        Commands::Refresh => Request::Refresh,
        Commands::Sources => Request::Sources,
        Commands::Tempo { command } => Request::Tempo(match command {
            TempoSubcommand::Get { artist, title } => TempoCommand::Get { artist, title },
            TempoSubcommand::Forget { artist, title } => TempoCommand::Forget { artist, title },
        }),
        Commands::Kill => Request::Kill,
        Commands::CheckConfig => unreachable!(),
    };

    // Determine socket path (use provided or default)
    let socket_path = cli.socket.unwrap_or_else(|| {
        dirs::runtime_dir()
            .map(|d| d.join("lumabeat.sock").to_string_lossy().to_string())
            .unwrap_or_else(|| {
                let uid = std::env::var("USER").unwrap_or_else(|_| "lumabeat".to_string());
                format!("/tmp/lumabeat-{}.sock", uid)
            })
    });

    // Connect to daemon
    match UnixStream::connect(&socket_path).await {
        Ok(mut stream) => {
            let req_json = serde_json::to_string(&request)?;
            stream.write_all(req_json.as_bytes()).await?;
            stream.write_all(b"\n").await?;

            let mut response = String::new();
            stream.read_to_string(&mut response).await?;

            if response.is_empty() {
                println!("OK");
                return Ok(());
            }
            match serde_json::from_str::<Response>(&response) {
                Ok(resp) => print_response(resp),
                Err(_) => println!("{}", response),
            }
        }
        Err(e) => {
            eprintln!("Failed to connect to daemon at {}: {}", socket_path, e);
            eprintln!("Is lumabeat-daemon running?");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_response(resp: Response) {
    match resp {
        Response::Ok => println!("OK"),
        Response::Error(e) => eprintln!("Error: {}", e),
        Response::Status(status) => {
            println!(
                "Owner:      {}",
                status.owning_source.unwrap_or_else(|| "none".to_string())
            );
            println!(
                "Track:      {}",
                status.track.unwrap_or_else(|| "none".to_string())
            );
            println!("Session:    {}", status.session_state);
            if !status.palette.is_empty() {
                println!("Palette:    {}", status.palette.join(" "));
            }
            if status.bpm > 0.0 {
                println!("Tempo:      {:.0} bpm", status.bpm);
            } else {
                println!("Tempo:      unknown");
            }
            if status.delay_secs > 0.0 {
                println!(
                    "Cadence:    {:.1}s alternation / {:.2}s transition",
                    status.delay_secs, status.transition_secs
                );
            }
        }
        Response::Sources(sources) => {
            println!(
                "{:<20} | {:<8} | {:<7} | {:<6} | {:<30}",
                "Source", "Status", "Primary", "Ignore", "Track"
            );
            println!("{}", "-".repeat(82));
            for src in sources {
                println!(
                    "{:<20} | {:<8} | {:<7} | {:<6} | {:<30}",
                    src.id,
                    src.status,
                    if src.primary { "yes" } else { "" },
                    if src.ignored { "yes" } else { "" },
                    src.track.unwrap_or_default()
                );
            }
        }
        Response::Tempo(Some(bpm)) => println!("{:.1} bpm (cached)", bpm),
        Response::Tempo(None) => println!("No cached tempo for that track"),
    }
}
