use tracing_subscriber::{prelude::*, EnvFilter, Registry};
use tracing_subscriber::fmt as subscriber_fmt;
use tracing_subscriber::filter::LevelFilter;
use tracing::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use lumabeat_common::{Request, Response, TempoCommand};

mod arbiter;
mod artwork;
mod config;
mod dispatch;
mod palette;
mod scheduler;
mod sources;
mod tempo;

use arbiter::Arbiter;
use artwork::ArtworkResolver;
use config::Config;
use dispatch::{ColorSink, WebhookSink};
use palette::PaletteExtractor;
use sources::{PlayerctlProvider, SourceProvider};
use tempo::{DefaultProbe, TempoCache, TempoProbe, TempoResolver};

use chrono::Local;

struct CustomTimer;

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Show version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    /// Log verbosity (1=warn, 2=info, 3=debug, 4=trace); also logs to a file
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=4))]
    log: Option<u8>,

    /// Override the control socket path
    #[arg(long)]
    socket: Option<PathBuf>,
}

fn socket_path(override_path: Option<PathBuf>) -> PathBuf {
    override_path.unwrap_or_else(|| {
        dirs::runtime_dir()
            .map(|d| d.join("lumabeat.sock"))
            .unwrap_or_else(|| {
                let uid = std::env::var("USER").unwrap_or_else(|_| "lumabeat".to_string());
                PathBuf::from(format!("/tmp/lumabeat-{}.sock", uid))
            })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 1. Initialize Logging
    let log_level = args.log;
    let _guards = {
        let filter = match log_level {
            Some(1) => LevelFilter::WARN,
            Some(2) => LevelFilter::INFO,
            Some(3) => LevelFilter::DEBUG,
            Some(4) => LevelFilter::TRACE,
            None | _ => LevelFilter::INFO,
        };

        let env_filter = EnvFilter::builder()
            .with_default_directive(filter.into())
            .from_env_lossy()
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("reqwest=warn".parse().unwrap());

        if let Some(level) = log_level {
            let log_dir = dirs::config_dir()
                .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
                .join("lumabeat")
                .join("logs");
            std::fs::create_dir_all(&log_dir)?;

            let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
            let log_path = log_dir.join(format!("lumabeat-daemon-{}.log", timestamp));
            let file = std::fs::File::create(&log_path)?;
            println!("Logging to file: {}", log_path.display());
            let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file);
            let (non_blocking_stdout, stdout_guard) =
                tracing_appender::non_blocking(std::io::stdout());

            let file_layer = subscriber_fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_timer(CustomTimer);

            let stdout_layer = subscriber_fmt::layer()
                .with_writer(non_blocking_stdout)
                .with_timer(CustomTimer);

            Registry::default()
                .with(env_filter)
                .with(file_layer)
                .with(stdout_layer)
                .init();

            info!("Lumabeat daemon starting... (Level {})", level);
            (Some(file_guard), Some(stdout_guard))
        } else {
            let stdout_layer = subscriber_fmt::layer()
                .with_writer(std::io::stdout)
                .with_timer(CustomTimer);

            Registry::default()
                .with(env_filter)
                .with(stdout_layer)
                .init();
            info!("Lumabeat daemon starting...");
            (None, None)
        }
    };

    // 2. Load Configuration. Without a webhook endpoint there is nothing
    // this daemon can do, so a broken config is fatal.
    let config = Config::load().await?;

    // 3. Wire up collaborators
    let http = reqwest::Client::builder()
        .user_agent(concat!("lumabeat/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()?;

    let sink = Arc::new(WebhookSink::new(
        config.light.webhook_url.clone(),
        config.light.request_timeout,
    )?);
    let artwork = ArtworkResolver::new(config.global.artwork_dirs.clone(), http.clone())?;
    let extractor = PaletteExtractor::new(config.palette.clone());
    let cache = match &config.tempo.cache_path {
        Some(path) => TempoCache::open(path)?,
        None => TempoCache::open_default()?,
    };
    let probe = DefaultProbe::new(http, config.tempo.analyzer_command.clone());
    let tempo = TempoResolver::new(cache, probe, config.tempo.clone());

    let poll_interval = config.global.poll_interval;
    let mut arbiter = Arbiter::new(config, PlayerctlProvider, sink, artwork, extractor, tempo);

    // 4. IPC Socket Setup
    let socket_path = socket_path(args.socket);
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(&socket_path) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            let _ = std::fs::set_permissions(&socket_path, perms);
        }
    }

    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::unbounded_channel::<(
        Request,
        tokio::sync::oneshot::Sender<Response>,
    )>();

    // Spawn IPC Listener
    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                let cmd_tx = cmd_tx.clone();
                tokio::spawn(async move {
                    const MAX_MESSAGE_SIZE: usize = 8192;
                    let mut buf = [0u8; MAX_MESSAGE_SIZE];
                    if let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || n >= MAX_MESSAGE_SIZE {
                            return;
                        }
                        if let Ok(req_str) = std::str::from_utf8(&buf[..n]) {
                            if let Ok(req) = serde_json::from_str::<Request>(req_str.trim()) {
                                let (resp_tx, resp_rx) = tokio::sync::oneshot::channel();
                                if cmd_tx.send((req, resp_tx)).is_ok() {
                                    if let Ok(response) = resp_rx.await {
                                        if let Ok(json) = serde_json::to_string(&response) {
                                            let _ = stream.write_all(json.as_bytes()).await;
                                        }
                                    }
                                }
                            }
                        }
                    }
                });
            }
        }
    });

    info!(
        "Listening on {} (polling every {:?})",
        socket_path.display(),
        poll_interval
    );

    // Main Loop
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                arbiter.cycle().await;
            }
            Some((req, resp)) = cmd_rx.recv() => {
                let kill = matches!(req, Request::Kill);
                let response = handle_command(req, &mut arbiter).await;
                let _ = resp.send(response);
                if kill {
                    info!("Kill requested over IPC, shutting down");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Received shutdown signal, cleaning up...");
                break;
            }
        }
    }

    arbiter.shutdown().await;
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

async fn handle_command<P, S, T>(req: Request, arbiter: &mut Arbiter<P, S, T>) -> Response
where
    P: SourceProvider,
    S: ColorSink,
    T: TempoProbe,
{
    match req {
        Request::Status => Response::Status(arbiter.status()),
        Request::Pause => {
            arbiter.pause();
            Response::Ok
        }
        Request::Resume => {
            arbiter.resume();
            Response::Ok
        }
        Request::Stop => {
            arbiter.stop().await;
            Response::Ok
        }
        Request::Refresh => {
            arbiter.refresh().await;
            Response::Ok
        }
        Request::Sources => Response::Sources(arbiter.sources().await),
        Request::Tempo(TempoCommand::Get { artist, title }) => {
            Response::Tempo(arbiter.tempo().cached(&artist, &title))
        }
        Request::Tempo(TempoCommand::Forget { artist, title }) => {
            match arbiter.tempo().forget(&artist, &title) {
                Ok(true) => Response::Ok,
                Ok(false) => Response::Error("no cached tempo for that track".to_string()),
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::Kill => Response::Ok,
    }
}
