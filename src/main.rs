//! local-ftp server binary.
//!
//! Shares one flat directory over HTTP for quick LAN file transfer. The main
//! entry point builds the Axum router, wires the bulk upload and download
//! coordinators, and serves until Ctrl+C or SIGTERM.

mod archive;
mod atomic;
mod bulk_download;
mod bulk_upload;
mod config;
mod error;
mod files;
mod http;
mod logging;
mod net;
mod response;
mod storage;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum_server::Handle;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::bulk_download::BulkDownloader;
use crate::bulk_upload::BulkUploader;
use crate::config::{Args, SHUTDOWN_GRACE_SECS};
use crate::http::{build_cors_layer, method_not_allowed, resolve_client_ip};
use crate::storage::Storage;

/// Starts the local-ftp server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    let uploader = Arc::new(BulkUploader::new(storage.clone(), args.bulk_threshold));
    let downloader = Arc::new(BulkDownloader::new(storage.clone()));

    let upload_limit = if args.upload_max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max(usize::try_from(args.upload_max_size).unwrap_or(usize::MAX))
    };

    let app = Router::new()
        .route("/", get(http::root))
        .route(
            "/api/files",
            get(files::list_files).fallback(method_not_allowed),
        )
        .route(
            "/api/upload",
            post(files::upload_file)
                .fallback(method_not_allowed)
                .layer(upload_limit),
        )
        .route(
            "/api/upload-multiple",
            post(bulk_upload::upload_multiple)
                .fallback(method_not_allowed)
                .layer(upload_limit),
        )
        .route(
            "/api/upload-zip",
            post(files::upload_zip_notice).fallback(method_not_allowed),
        )
        .route(
            "/api/download/{name}",
            get(files::download_file).fallback(method_not_allowed),
        )
        .route(
            "/api/download-multiple",
            post(bulk_download::download_multiple).fallback(method_not_allowed),
        )
        .route(
            "/api/delete/{name}",
            delete(files::delete_file).fallback(method_not_allowed),
        )
        .fallback(http::not_found)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
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
        .layer(Extension(uploader))
        .layer(Extension(downloader))
        .layer(build_cors_layer(args.cors_origins.as_deref()));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("local-ftp server started");
    info!("  Local access:   http://127.0.0.1:{}", args.port);
    info!("  Network access: http://{}:{}", net::display_host(host), args.port);
    info!("  Upload dir:     {}", storage.root_path().display());
    info!(
        "  Bulk threshold: {} files (archived as zip above this)",
        args.bulk_threshold
    );

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
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
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
