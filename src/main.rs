//! Upshare server binary.
//!
//! Serves a directory tree over HTTP, accepts multipart uploads and deletes
//! inside it, and hands out share links backed by symlinks in a share
//! directory. The main entry point provisions the directories, builds the
//! Axum router and runs the HTTP (and optional HTTPS) listeners.

mod config;
mod error;
mod guard;
mod http;
mod logging;
mod share;
mod storage;
mod tls;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{MethodRouter, any};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::{Args, SHUTDOWN_GRACE_SECS, SiteConfig};
use crate::http::extract_forwarded_ip;
use crate::share::{SharedClock, SystemClock};
use crate::storage::ShareStore;

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), Error> {
    logging::init_logging();

    let args = Args::parse();
    let store = ShareStore::provision(&args.share_dir).await?;
    let shutdown = CancellationToken::new();
    let mut site = SiteConfig::from_args(&args, store.dir().to_path_buf(), shutdown.clone());

    if site.share_prefix.is_empty() || site.share_prefix == site.upload_prefix {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "share prefix must be non-empty and differ from the upload prefix",
        ));
    }
    // A templated root is checked per request instead.
    if !site.is_templated() {
        let root = std::path::absolute(&site.root)?;
        tokio::fs::create_dir_all(&root).await?;
        site.root = root.to_string_lossy().into_owned();
    }
    info!(
        root = site.root,
        share_dir = %store.dir().display(),
        share_prefix = site.share_prefix,
        "site configured"
    );

    let body_limit = match args.upload_max_size {
        0 => DefaultBodyLimit::disable(),
        max => DefaultBodyLimit::max(usize::try_from(max).unwrap_or(usize::MAX)),
    };
    let clock: SharedClock = Arc::new(SystemClock);
    let site = Arc::new(site);

    let mut app = mount(Router::new(), &site.share_prefix, any(share::share_entry));
    app = if site.upload_prefix.is_empty() {
        app.fallback(upload::tree_entry)
    } else {
        mount(app, &site.upload_prefix, any(upload::tree_entry))
    };
    let app = app
        .layer(body_limit)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = extract_forwarded_ip(request.headers())
                        .or(connect_ip)
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
        .layer(Extension(site))
        .layer(Extension(clock));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| Error::new(ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let tls_config = tls::load_rustls_config(&args).await?;
    let handle = Handle::new();

    tokio::spawn(shutdown_signal(handle.clone(), shutdown));

    info!("Starting HTTP server at {}", http_addr);
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service_with_connect_info::<SocketAddr>());

    match tls_config {
        Some(tls_config) => {
            let https_addr = SocketAddr::new(host, args.https_port);
            info!("Starting HTTPS server at {}", https_addr);
            let https_server = axum_server::bind_rustls(https_addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>());
            tokio::try_join!(http_server, https_server)?;
        }
        None => http_server.await?,
    }

    Ok(())
}

/// Routes `prefix`, `prefix/` and everything below it to `handler`.
fn mount(router: Router, prefix: &str, handler: MethodRouter) -> Router {
    router
        .route(prefix, handler.clone())
        .route(&format!("{prefix}/"), handler.clone())
        .route(&format!("{prefix}/{{*rest}}"), handler)
}

async fn shutdown_signal(handle: Handle, shutdown: CancellationToken) {
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
    shutdown.cancel();
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
