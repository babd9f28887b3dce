use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{get, post},
};
use cetasense_core::StatusStore;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    broker::{AmqpBroker, Broker},
    cache::{self, ResponseCache},
    config::AppConfig,
    dispatcher::{self, JobDispatcher},
    handlers,
    metrics::Metrics,
    middleware as app_middleware,
    relay::{self, StatusRelay},
    store::create_status_store,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn StatusStore>,
    pub dispatcher: Arc<JobDispatcher>,
    pub relay: StatusRelay,
    pub cache: ResponseCache,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn StatusStore>,
        broker: Arc<dyn Broker>,
        metrics: Metrics,
    ) -> Self {
        let dispatcher = JobDispatcher::new(broker, config.broker.queue.clone(), metrics.clone());
        let relay = StatusRelay::new(store.clone(), metrics.clone(), config.jobs.keep_alive());
        let cache = ResponseCache::new(store.clone(), &config, metrics.clone());
        Self {
            config: Arc::new(config),
            store,
            dispatcher: Arc::new(dispatcher),
            relay,
            cache,
            metrics,
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let cfg = state.config.clone();

    let mut api = Router::new()
        .route("/api/localize", post(dispatcher::start_localization))
        .route(
            "/api/localize/stream/{job_id}",
            get(relay::stream_job_status),
        );
    if cfg.cache.enabled {
        api = api.layer(middleware::from_fn_with_state(
            state.cache.clone(),
            cache::response_cache,
        ));
    }

    let mut app = Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz));
    if cfg.metrics.enabled {
        app = app.route("/metrics", get(handlers::metrics));
    }

    // Middleware stack, outermost last: request id -> trace -> compression/cors -> body limit -> timing
    app.merge(api)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::server_timing,
        ))
        .layer(axum::extract::DefaultBodyLimit::max(cfg.server.body_limit_bytes))
        .layer(cors_layer(&cfg.server.cors_allowed_origins))
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<app_middleware::RequestId>()
                        .map(|id| id.to_string())
                        .unwrap_or_default();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

pub struct CetasenseServer {
    addr: SocketAddr,
    app: Router,
    relay: StatusRelay,
}

#[derive(Default)]
pub struct ServerBuilder {
    config: AppConfig,
    addr: Option<SocketAddr>,
    store: Option<Arc<dyn StatusStore>>,
    broker: Option<Arc<dyn Broker>>,
    metrics: Option<Metrics>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StatusStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Connect backing services and assemble the router.
    ///
    /// Broker and store outages at startup are logged, not fatal: the store
    /// falls back to local mode and the broker reconnects on first publish.
    pub async fn build(self) -> anyhow::Result<CetasenseServer> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        let metrics = match self.metrics {
            Some(m) => m,
            None if config.metrics.enabled => Metrics::install(),
            None => Metrics::noop(),
        };

        let store = match self.store {
            Some(store) => store,
            None => create_status_store(&config.redis).await,
        };

        let broker: Arc<dyn Broker> = match self.broker {
            Some(broker) => broker,
            None => {
                let amqp = AmqpBroker::new(&config.broker);
                if let Err(e) = amqp.connect(&config.broker.queue).await {
                    tracing::warn!(error = %e, "job broker unavailable at startup, will retry on first job");
                }
                Arc::new(amqp)
            }
        };

        tracing::info!(
            store = store.mode(),
            queue = %config.broker.queue,
            cache = config.cache.enabled,
            "server components ready"
        );

        let addr = self.addr.unwrap_or_else(|| config.addr());
        let state = AppState::new(config, store, broker, metrics);
        let relay = state.relay.clone();
        Ok(CetasenseServer {
            addr,
            app: build_app(state),
            relay,
        })
    }
}

impl CetasenseServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let relay = self.relay;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                // Open status streams would otherwise hold the drain forever.
                relay.shutdown();
            })
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
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
    tracing::info!("shutdown signal received");
}
