use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use voxgate::{
    config::{Cli, Config},
    media::StreamEngine,
    server::{AppState, serve},
};

fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_deref().unwrap_or("info")));
    match &config.log_file {
        Some(log_file) => {
            let path = Path::new(log_file);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .map(|f| f.to_os_string())
                .unwrap_or_else(|| "voxgate.log".into());
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let conf = cli.conf.unwrap_or_else(|| "voxgate.toml".to_string());
    let (config, loaded) = if Path::new(&conf).exists() {
        (Config::load(&conf)?, true)
    } else {
        (Config::default(), false)
    };
    let _guard = init_tracing(&config);
    if loaded {
        info!("loaded config from {}", conf);
    } else {
        warn!("config file {} not found, using defaults", conf);
    }

    let mut engine = StreamEngine::default();
    engine.load_functions(&config);
    info!("functions: {:?}", engine.functions().names());

    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!("ctrl-c handler unavailable: {}", e),
        }
    });

    serve(AppState::new(config, engine, token)).await
}
