//! FileDrop server binary.
//!
//! This crate wires together HTTP routing, authentication, and upload
//! storage. The main entry point builds the Axum router and starts the HTTP
//! listener with graceful shutdown.

mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod http;
mod index;
mod locking;
mod logging;
mod storage;
mod version;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use clap::Parser;
use shadow_rs::shadow;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Mutex;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::{AuthConfig, Credentials};
use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::files::UploadLimits;
use crate::http::build_cors_layer;
use crate::locking::LockManager;
use crate::storage::Storage;

shadow!(build);

/// Starts the FileDrop server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::open(PathBuf::from(args.storage_dir.clone())).await?);
    let auth_config = Arc::new(AuthConfig {
        credentials: Credentials::single(args.auth_user.clone(), args.auth_pass_hash.clone()),
        sessions: Mutex::new(HashMap::new()),
        session_ttl: Duration::from_secs(args.session_ttl_secs),
        login_attempts: Mutex::new(HashMap::new()),
        login_window: Duration::from_secs(args.login_window_secs),
        login_max_attempts: args.login_max_attempts,
        login_lockout: Duration::from_secs(args.login_lockout_secs),
    });
    let upload_limits = Arc::new(UploadLimits {
        max_size: args.upload_max_size,
    });
    let lock_manager = Arc::new(LockManager::new());

    let mut app = Router::new()
        .route("/api/files/list", get(files::list_files))
        .route(
            "/api/files/upload",
            post(files::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/files/download", get(files::download_file))
        .route("/api/files/delete", delete(files::delete_file))
        .route("/api/auth/login", post(auth::auth_login))
        .route("/api/auth/logout", post(auth::auth_logout))
        .route("/api/auth/status", get(auth::auth_status))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage.clone()))
        .layer(Extension(auth_config.clone()))
        .layer(Extension(upload_limits))
        .layer(Extension(lock_manager));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.http_port);
    let listener = TcpListener::bind(addr).await?;

    info!("🚀 Starting HTTP server at {}", addr);
    spawn_background_tasks(storage, auth_config);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
