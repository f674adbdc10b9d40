use std::{process, sync::Arc, time::Duration};

use revcache::{
    application::{directory::UserDirectory, error::AppError},
    cache::{CacheConfig, CacheManager, ProviderRegistry, duration_millis},
    config,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) =
        config::load_with_cli().map_err(|err| AppError::from(InfraError::from(err)))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::CheckConfig(_) => run_check_config(&settings),
    }
}

fn build_cache(settings: &config::Settings) -> Result<Arc<dyn CacheManager>, AppError> {
    let cache_config = CacheConfig::from(&settings.cache);
    ProviderRegistry::default()
        .create(&settings.cache.kind, &cache_config)
        .map_err(|err| AppError::from(InfraError::from(err)))
}

fn run_check_config(settings: &config::Settings) -> Result<(), AppError> {
    let cache = build_cache(settings)?;
    let cache_config = CacheConfig::from(&settings.cache);

    let summary = serde_json::json!({
        "server": {
            "addr": settings.server.addr.to_string(),
            "graceful_shutdown_seconds": settings.server.graceful_shutdown.as_secs(),
        },
        "cache": {
            "enabled": settings.cache.enabled,
            "type": cache.kind(),
            "default_ttl_ms": duration_millis(settings.cache.default_ttl),
            "max_entries": settings.cache.max_entries,
            "max_memory": settings.cache.max_memory,
            "eviction_policy": settings.cache.eviction_policy.as_str(),
            "cleanup_interval_ms": cache_config
                .cleanup_period()
                .map(duration_millis),
            "max_body_bytes": settings.cache.max_body_bytes,
            "routes": settings
                .cache
                .routes
                .iter()
                .map(|route| serde_json::json!({
                    "path": route.path,
                    "ttl_ms": route.ttl.map(duration_millis),
                    "dependencies": route.dependencies,
                    "metadata_keys": route.metadata_keys,
                    "key_template": route.key_template,
                }))
                .collect::<Vec<_>>(),
        },
    });

    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| AppError::unexpected(format!("failed to render settings: {err}")))?;
    println!("{rendered}");
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = build_cache(&settings)?;
    if settings.cache.enabled {
        cache.start().map_err(|err| AppError::from(InfraError::from(err)))?;
    } else {
        info!("Response cache disabled");
    }

    let directory = UserDirectory::with_sample_data(Arc::clone(&cache));
    let state = HttpState::new(Arc::clone(&cache), directory, &settings.cache);
    let router = http::build_router(state);

    let listener = TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Listening");

    let result = serve_until_shutdown(listener, router, settings.server.graceful_shutdown).await;

    if cache.is_running() {
        if let Err(err) = cache.stop() {
            warn!(error = %err, "Failed to stop cache");
        }
    }

    result
}

async fn serve_until_shutdown(
    listener: TcpListener,
    router: axum::Router,
    grace: Duration,
) -> Result<(), AppError> {
    let (signalled_tx, mut signalled_rx) = watch::channel(false);
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            shutdown_signal().await;
            let _ = signalled_tx.send(true);
        },
    );
    let server = server.into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| AppError::from(InfraError::from(err)))?;
        }
        Ok(_) = signalled_rx.wait_for(|signalled| *signalled) => {
            info!(grace = ?grace, "Shutdown requested, draining connections");
            match tokio::time::timeout(grace, &mut server).await {
                Ok(result) => result.map_err(|err| AppError::from(InfraError::from(err)))?,
                Err(_) => warn!(grace = ?grace, "Graceful shutdown timed out"),
            }
        }
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
