//! `api-cache`: a caching reverse proxy in front of a single upstream API.

use std::{
    fs::OpenOptions,
    io::Write,
    path::PathBuf,
    process::ExitCode,
    str::FromStr,
    sync::Arc,
};

use api_cache::{
    ApiCache, CacheManager, Config, LogFormat, LogOutput, LoggingConfig,
    MokaManager, RedisManager, Result, StoreBackend,
};
use api_cache_tower::ApiCacheService;
use axum::{routing::get, Router};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use env_logger::Target;
use log::LevelFilter;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::request_id::{
    MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer,
};

#[derive(Debug, Parser)]
#[command(name = "api-cache", version, about = "Caching reverse proxy for HTTP APIs")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => {
            log::info!("server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let level = LevelFilter::from_str(&logging.level)
        .map_err(|_| format!("invalid log level {:?}", logging.level))?;

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();
    match logging.format {
        LogFormat::Json => builder.format(|buf, record| {
            let line = serde_json::json!({
                "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "level": record.level().as_str().to_ascii_lowercase(),
                "target": record.target(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        }),
        LogFormat::Text => builder.format_timestamp_millis(),
    };

    let target = match logging.output {
        LogOutput::Stdout => Target::Stdout,
        LogOutput::Stderr => Target::Stderr,
        LogOutput::File => {
            let path = logging
                .file_path
                .as_deref()
                .ok_or("logging.file_path is required when output is file")?;
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Target::Pipe(Box::new(file))
        }
    };
    builder.target(target).try_init()?;
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let app = match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisManager::from_config(&config.store).await?;
            store.ping().await?;
            log::info!(
                "connected to store host={} port={} db={}",
                config.store.host,
                config.store.port,
                config.store.db
            );
            router(ApiCache::from_config(&config, store)?)
        }
        StoreBackend::Memory => {
            log::info!(
                "using in-memory store max_capacity={}",
                config.store.max_capacity
            );
            let store = MokaManager::new(config.store.max_capacity);
            router(ApiCache::from_config(&config, store)?)
        }
    };

    let listener = TcpListener::bind(config.server.bind_address()).await?;
    log::info!(
        "api-cache listening addr={} upstream={} rate_limit={} retry={} read_timeout_s={} write_timeout_s={} idle_timeout_s={}",
        config.server.bind_address(),
        config.upstream.base_url,
        config.rate_limit.enabled,
        config.retry.enabled,
        config.server.read_timeout.as_secs(),
        config.server.write_timeout.as_secs(),
        config.server.idle_timeout.as_secs()
    );

    let token = CancellationToken::new();
    let shutdown = token.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    let mut server_task = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server_task => return Ok(result??),
        _ = shutdown_signal() => {}
    }

    log::info!(
        "shutting down timeout_s={}",
        config.server.shutdown_timeout.as_secs()
    );
    token.cancel();
    match tokio::time::timeout(config.server.shutdown_timeout, server_task).await {
        Ok(joined) => joined??,
        Err(_) => log::warn!("graceful shutdown timed out, dropping connections"),
    }
    Ok(())
}

fn router<M: CacheManager>(cache: ApiCache<M>) -> Router {
    let metrics = Arc::clone(cache.metrics());
    Router::new()
        .route("/health", get(|| async { api_cache_tower::health() }))
        .route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics);
                async move { api_cache_tower::metrics(&metrics) }
            }),
        )
        .fallback_service(ApiCacheService::new(cache))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received ctrl-c"),
        _ = terminate => log::info!("received SIGTERM"),
    }
}
