//! HTTP server: routes, handlers and the middleware stack

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::{Gateway, ProbeReport};
use crate::metrics::Metrics;
use crate::request::{SendMailPayload, Violation};
use crate::security::{
    basic_auth_middleware, ip_filter_middleware, rate_limit_middleware, security_headers,
    BasicAuth, IpFilter, RateLimiter,
};
use crate::transport::MailTransport;

const SEND_ROUTE: &str = "/send-mail";
const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Shared handler state
pub struct AppState {
    pub gateway: Gateway,
    pub config: GatewayConfig,
    /// Present only when metrics are enabled
    pub metrics: Option<Metrics>,
    pub started: Instant,
}

/// The mail gateway HTTP server
pub struct GatewayServer {
    config: GatewayConfig,
    state: Arc<AppState>,
    limiter: Arc<RateLimiter>,
    ip_filter: Arc<IpFilter>,
    basic_auth: Option<Arc<BasicAuth>>,
    body_limit: usize,
}

impl GatewayServer {
    /// Create a new server sending through `transport`
    pub fn new(config: GatewayConfig, transport: Arc<dyn MailTransport>) -> Result<Self> {
        config.validate()?;

        let gateway = Gateway::new(
            transport,
            config.allowed_modes(),
            config.smtp_defaults(),
            config.dedup_settings(),
            config.send_timeout(),
        );

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_max,
            config.rate_limit_window(),
        ));
        let ip_filter = Arc::new(IpFilter::new(config.ip_allow_list()?, config.trust_proxy));
        let basic_auth = config.basic_auth().map(Arc::new);
        let body_limit = config.body_limit_bytes()?;

        let state = Arc::new(AppState {
            gateway,
            metrics: config.enable_metrics.then(Metrics::new),
            config: config.clone(),
            started: Instant::now(),
        });

        Ok(Self {
            config,
            state,
            limiter,
            ip_filter,
            basic_auth,
            body_limit,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        let mut routes = Router::new()
            .route(SEND_ROUTE, post(send_mail))
            .route("/smtp-modes", get(smtp_modes))
            .route("/health", get(health))
            .route("/config", get(config_info));

        if self.state.metrics.is_some() {
            routes = routes.route("/metrics", get(metrics_endpoint));
        }

        // Layers added later run earlier
        let mut routes = routes
            .layer(middleware::from_fn_with_state(
                self.limiter.clone(),
                rate_limit_middleware,
            ))
            .layer(middleware::from_fn_with_state(
                self.ip_filter.clone(),
                ip_filter_middleware,
            ));

        if let Some(auth) = &self.basic_auth {
            routes = routes.layer(middleware::from_fn_with_state(
                auth.clone(),
                basic_auth_middleware,
            ));
        }

        routes
            .layer(cors_layer(&self.config.cors_origins))
            .layer(DefaultBodyLimit::max(self.body_limit))
            .layer(middleware::from_fn(security_headers))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(
            "Mail gateway listening on {} (transport: {}, allowed modes: {})",
            addr,
            self.state.gateway.transport_name(),
            self.state.gateway.modes().describe()
        );
        if self.basic_auth.is_some() {
            info!("Basic auth: enabled");
        }
        if !self.ip_filter.allow_list.is_empty() {
            info!("IP allow-list: {} entries", self.config.ip_allowlist.len());
        }

        let sweeper = self.state.gateway.cache().spawn_sweeper();
        let cleanup = self.limiter.clone().spawn_cleanup();

        let app = self.router();
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        sweeper.abort();
        cleanup.abort();
        served?;

        info!("Mail gateway stopped");
        Ok(())
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(allowed))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Map a body that failed to parse into the error taxonomy
fn rejection_error(rejection: JsonRejection) -> GatewayError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        GatewayError::PayloadTooLarge(rejection.body_text())
    } else {
        GatewayError::Validation(vec![Violation::new("body", rejection.body_text())])
    }
}

async fn send_mail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<SendMailPayload>, JsonRejection>,
) -> Response {
    let start = Instant::now();

    let header_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok());

    let result = match payload {
        Ok(Json(payload)) => state.gateway.submit(payload, header_key).await,
        Err(rejection) => Err(rejection_error(rejection)),
    };

    let response = match result {
        Ok(sent) => Json(sent.as_ref()).into_response(),
        Err(e) => e.into_response(),
    };

    if let Some(metrics) = &state.metrics {
        metrics.observe(SEND_ROUTE, "POST", response.status().as_u16(), start.elapsed());
    }

    response
}

#[derive(Debug, Deserialize)]
struct ProbeQuery {
    host: Option<String>,
    modes: Option<String>,
}

async fn smtp_modes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProbeQuery>,
) -> Json<ProbeReport> {
    let report = state
        .gateway
        .probe(query.host.as_deref(), query.modes.as_deref())
        .await;
    Json(report)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.started.elapsed().as_secs_f64(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "allowedModes": state.gateway.modes().describe(),
    }))
}

/// Non-secret settings
async fn config_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "port": config.port,
        "requestBodyLimit": config.request_body_limit,
        "rateLimit": {
            "windowMs": config.rate_limit_window_ms,
            "max": config.rate_limit_max,
        },
        "corsOrigins": config.cors_origins,
        "trustProxy": config.trust_proxy,
        "metricsEnabled": config.enable_metrics,
        "allowedModes": state.gateway.modes().describe(),
    }))
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            metrics.to_prometheus(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    #[test]
    fn test_server_creation() {
        let server = GatewayServer::new(
            GatewayConfig::default(),
            Arc::new(LoopbackTransport::new()),
        );
        assert!(server.is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GatewayConfig {
            request_body_limit: "huge".to_string(),
            ..GatewayConfig::default()
        };
        assert!(GatewayServer::new(config, Arc::new(LoopbackTransport::new())).is_err());
    }

    #[test]
    fn test_metrics_toggle() {
        let config = GatewayConfig {
            enable_metrics: false,
            ..GatewayConfig::default()
        };
        let server = GatewayServer::new(config, Arc::new(LoopbackTransport::new())).unwrap();
        assert!(server.state().metrics.is_none());
    }
}
