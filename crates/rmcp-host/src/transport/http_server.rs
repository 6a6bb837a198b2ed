//! The process-facing HTTP server: CORS, diagnostics and graceful shutdown
//! around a [`StreamableHttpService`].

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::OnceLock,
};

use axum::{
    Router,
    http::{HeaderName, Method, StatusCode},
    routing::get,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::Instrument;

use super::{common::http_header::HEADER_SESSION_ID, streamable_http_server::StreamableHttpService};

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind: SocketAddr,
    pub endpoint_path: String,
    pub ct: CancellationToken,
    /// Also shut down on SIGINT/SIGTERM.
    pub handle_signals: bool,
}

impl HttpServerConfig {
    pub fn new(host: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            bind: SocketAddr::new(host.into(), port),
            endpoint_path: "/mcp".to_string(),
            ct: CancellationToken::new(),
            handle_signals: true,
        }
    }
}

#[derive(Debug)]
pub struct HttpServer {
    pub config: HttpServerConfig,
    service: StreamableHttpService,
    handle: JoinHandle<()>,
}

impl HttpServer {
    pub async fn serve(bind: SocketAddr, service: StreamableHttpService) -> io::Result<Self> {
        let mut config = HttpServerConfig::new(bind.ip(), bind.port());
        config.handle_signals = false;
        Self::serve_with_config(config, service).await
    }

    pub async fn serve_with_config(
        mut config: HttpServerConfig,
        service: StreamableHttpService,
    ) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        // port 0 binds an ephemeral port
        config.bind = listener.local_addr()?;
        let router = Self::router(&config, &service);
        let ct = config.ct.clone();
        let signal = config.handle_signals.then(shutdown_signal);
        let shutdown_service = service.clone();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            match signal {
                Some(signal) => tokio::select! {
                    _ = ct.cancelled() => {}
                    _ = signal.cancelled() => {
                        tracing::info!("shutdown signal received");
                        ct.cancel();
                    }
                },
                None => ct.cancelled().await,
            }
            tracing::info!("http server cancelled");
            shutdown_service.shutdown().await;
        });
        let handle = tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "http server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("http-server", bind_address = %config.bind)),
        );
        tracing::info!(bind_address = %config.bind, path = %config.endpoint_path, "http server listening");
        Ok(Self {
            config,
            service,
            handle,
        })
    }

    /// `/health`, `/ping` and the MCP endpoint behind CORS.
    pub fn router(config: &HttpServerConfig, service: &StreamableHttpService) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/ping", get(ping))
            .route(&config.endpoint_path, service.method_router())
            .fallback(not_found)
            .layer(cors_layer())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.config.bind
    }

    pub fn service(&self) -> &StreamableHttpService {
        &self.service
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }

    /// Wait until the server has shut down and every session is closed.
    pub async fn waiting(self) -> Result<(), tokio::task::JoinError> {
        self.handle.await
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .expose_headers([HeaderName::from_static(HEADER_SESSION_ID)])
}

async fn health() -> &'static str {
    "OK"
}

async fn ping() -> &'static str {
    "pong"
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Cancelled on the first SIGINT or SIGTERM. The listener is installed once
/// per process, on the runtime of the first caller.
fn shutdown_signal() -> CancellationToken {
    static SIGNAL: OnceLock<CancellationToken> = OnceLock::new();
    SIGNAL
        .get_or_init(|| {
            let ct = CancellationToken::new();
            tokio::spawn({
                let ct = ct.clone();
                async move {
                    wait_for_signal().await;
                    ct.cancel();
                }
            });
            ct
        })
        .clone()
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
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
