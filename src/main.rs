#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # sandboxd
//!
//! In-container sandbox execution service.
//!
//! sandboxd exposes an HTTP API on port 3000 that lets an AI agent (or any
//! client) run commands in persistent shell sessions, manage background
//! processes, read and write files, clone repositories, and reach services
//! bound to localhost ports through a reverse proxy — all inside one
//! container. State lives in memory only; a restart loses every session and
//! process record.

use std::time::Duration;

use axum::{
    routing::{any, delete, get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use sandboxd::{routes, AppState, Config};

/// In-container sandbox execution service.
#[derive(Parser)]
#[command(name = "sandboxd", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("sandboxd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Workspace: {}", config.shell.default_working_dir);

    // The workspace is where sessions start; make sure it exists before the
    // first lazy session creation.
    if let Err(e) = tokio::fs::create_dir_all(&config.shell.default_working_dir).await {
        tracing::warn!(
            "Could not create workspace {}: {e}",
            config.shell.default_working_dir
        );
    }

    let state = AppState::new(config);

    let app = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/session/create", post(routes::sessions::create_session))
        .route("/api/session/list", get(routes::sessions::list_sessions))
        .route("/api/session/{id}", delete(routes::sessions::delete_session))
        .route("/api/session/{id}/env", post(routes::sessions::set_env_vars))
        .route("/api/execute", post(routes::exec::execute))
        .route("/api/execute/stream", post(routes::exec::execute_stream))
        .route("/api/process/start", post(routes::process::start_process))
        .route("/api/process/list", get(routes::process::list_processes))
        .route("/api/process/kill-all", delete(routes::process::kill_all))
        .route(
            "/api/process/{id}",
            get(routes::process::get_process).delete(routes::process::kill_process),
        )
        .route("/api/process/{id}/logs", get(routes::process::process_logs))
        .route(
            "/api/process/{id}/stream",
            get(routes::process::stream_process),
        )
        .route("/api/expose-port", post(routes::ports::expose_port))
        .route("/api/exposed-ports", get(routes::ports::list_ports))
        .route(
            "/api/exposed-ports/{port}",
            delete(routes::ports::unexpose_port),
        )
        .route(
            "/api/files",
            get(routes::files::read_file)
                .put(routes::files::write_file)
                .delete(routes::files::delete_file),
        )
        .route("/api/git/checkout", post(routes::git::checkout))
        .route("/proxy/{port}", any(routes::ports::proxy_root))
        .route("/proxy/{port}/{*path}", any(routes::ports::proxy))
        .with_state(state.clone());

    // CORS applies to every response, errors included. Headers are listed
    // explicitly — `allow_headers(Any)` breaks credentialed requests in
    // Firefox.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    // GUARD: .layer() only applies to routes merged BEFORE the call.
    let app = app.layer(cors).layer(TraceLayer::new_for_http()).layer(
        tower::limit::ConcurrencyLimitLayer::new(state.config.server.max_connections),
    );

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: drop terminal process records past their age.
    let process_gc = {
        let service = state.process_service.clone();
        let every = Duration::from_secs(state.config.server.process_gc_interval_secs);
        let max_age = Duration::from_secs(state.config.server.process_max_age_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                service.cleanup(max_age);
            }
        })
    };

    // Periodic sweep: drop ports that stayed inactive too long.
    let port_gc = {
        let registry = state.port_registry.clone();
        let every = Duration::from_secs(state.config.server.port_gc_interval_secs);
        let max_inactive = Duration::from_secs(state.config.server.port_max_inactive_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                registry.cleanup(max_inactive).await;
            }
        })
    };

    // Graceful shutdown on SIGINT/SIGTERM.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
    process_gc.abort();
    port_gc.abort();

    state.process_service.destroy().await;
    state.session_manager.destroy().await;
    info!("Goodbye");
}
