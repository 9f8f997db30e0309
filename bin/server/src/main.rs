use blockflow_server::{AppState, config::ServerConfig, routes};
use std::fmt;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Optional config file as the only argument; the environment overrides it
    let config_file = std::env::args_os().nth(1).map(PathBuf::from);
    let config = ServerConfig::load(config_file.as_deref())
        .unwrap_or_else(|e| exit_with("failed to load configuration", e));
    tracing::info!(?config, "Loaded configuration");

    let state = AppState::from_config(&config)
        .unwrap_or_else(|report| exit_with("failed to initialize application", report));

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .unwrap_or_else(|e| exit_with("failed to bind to address", e));

    tracing::info!("listening on http://{}", config.bind_address);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        exit_with("server error", e);
    }
}

fn exit_with(what: &str, error: impl fmt::Display) -> ! {
    tracing::error!("{what}:\n{error}");
    std::process::exit(1);
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
