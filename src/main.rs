mod config;
mod http_server;
mod proxy;
mod state;
mod store;
mod utils;

use std::fs::File;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use simplelog::ConfigBuilder;

use config::Config;
use state::AppState;

#[derive(Parser, Debug)]
#[command(name = "m3u-proxy", about = "M3U stream-merger proxy")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on. Falls back to $PORT, then 8080.
    #[arg(long)]
    port: Option<u16>,
    /// Directory for rotating log files. Terminal-only logging when unset.
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Print the URL slug for a channel JSON definition and exit.
    #[arg(long, value_name = "FILE")]
    encode_channel: Option<PathBuf>,
}

/// open a log file, if file size exceeds 1MB, backup log file and create a new one.
fn open_log_file(log_dir: &Path) -> Result<File, Box<dyn std::error::Error>> {
    let log_filename = log_dir.join("m3u-proxy.log");

    if let Ok(meta) = std::fs::metadata(&log_filename) {
        if meta.len() > 1024 * 1024 {
            // move original file to backup
            let date_str = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let backup_filename = log_dir.join(format!("m3u-proxy-{date_str}.log"));
            std::fs::rename(&log_filename, backup_filename)?;
        }
    }

    Ok(File::options().create(true).append(true).open(&log_filename)?)
}

fn setup_logging(log_dir: Option<&Path>, debug: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if debug {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let config = ConfigBuilder::new()
        .add_filter_ignore_str("hyper")
        .add_filter_ignore_str("reqwest")
        .add_filter_ignore_str("h2")
        .build();

    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![simplelog::TermLogger::new(
        level,
        config,
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )];
    if let Some(log_dir) = log_dir {
        if !log_dir.exists() {
            std::fs::create_dir_all(log_dir)?;
        }
        loggers.push(simplelog::WriteLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            open_log_file(log_dir)?,
        ));
    }
    simplelog::CombinedLogger::init(loggers)?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(path) = args.encode_channel.as_deref() {
        let json = std::fs::read_to_string(path)?;
        let info: store::StreamInfo = serde_json::from_str(&json)?;
        println!("{}", store::encode_slug(&info)?);
        return Ok(());
    }

    let config = Config::load();
    setup_logging(args.log_dir.as_deref(), config.debug)?;

    if !config.load_balancing_mode.is_empty() {
        log::info!(
            "Load balancing mode: {} (priority ordering always applies)",
            config.load_balancing_mode
        );
    }

    let state = AppState::new(config)?;
    state.sessions.spawn_sweeper(Duration::from_secs(60));

    let port = args
        .port
        .or_else(|| std::env::var("PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(8080);
    let listener = tokio::net::TcpListener::bind((args.host.as_str(), port)).await?;
    log::info!("Listening on {}", listener.local_addr()?);

    let registry = state.registry.clone();
    let app =
        http_server::create_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutdown requested, closing all streams");
            registry.shutdown();
        })
        .await?;

    Ok(())
}
