//! Application startup and lifecycle management.

use crate::config::{Config, StoreBackend};
use crate::gateways::{CardGateway, GatewayRegistry, MpesaGateway};
use crate::handlers::{fee_structures, invoices, payments, webhooks};
use crate::services::applicator::PaymentApplicator;
use crate::services::database::PgLedgerStore;
use crate::services::invoices::InvoiceManager;
use crate::services::ledger::{LedgerStore, MemoryLedgerStore};
use crate::services::metrics::{HTTP_REQUESTS_TOTAL, HTTP_REQUEST_DURATION};
use crate::services::notifier::{LogNotifier, Notifier};
use crate::services::reconciliation::ReconciliationScheduler;
use crate::services::{get_metrics, init_metrics};
use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use secrecy::ExposeSecret;
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn LedgerStore>,
    pub invoices: Arc<InvoiceManager>,
    pub applicator: Arc<PaymentApplicator>,
    pub gateways: Arc<GatewayRegistry>,
}

/// Health check endpoint for liveness probes.
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "fees-service",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Readiness check endpoint.
async fn readiness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ready" })))
}

/// Prometheus metrics endpoint.
async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

async fn http_metrics_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), path.as_str(), status.as_str()])
        .inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), path.as_str()])
        .observe(start.elapsed().as_secs_f64());

    response
}

/// Build the HTTP router. Exposed separately so the test harness can serve
/// it against an in-memory store.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
        .route(
            "/fee-structures",
            post(fee_structures::create_fee_structure).get(fee_structures::list_fee_structures),
        )
        .route(
            "/fee-structures/:id/retire",
            post(fee_structures::retire_fee_structure),
        )
        .route(
            "/invoices",
            post(invoices::create_invoice).get(invoices::list_invoices),
        )
        .route("/invoices/:id", get(invoices::get_invoice))
        .route("/invoices/:id/cancel", post(invoices::cancel_invoice))
        .route(
            "/payments",
            post(payments::record_payment).get(payments::list_payments),
        )
        .route("/payments/initiate", post(payments::initiate_payment))
        .route("/payments/:id", get(payments::get_payment))
        .route("/payments/:id/refunds", post(payments::refund_payment))
        .route("/webhooks/mpesa", post(webhooks::mpesa_webhook))
        .route("/webhooks/card", post(webhooks::card_webhook))
        .layer(middleware::from_fn(http_metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn LedgerStore> = match config.store.backend {
            StoreBackend::Postgres => {
                let database_url = config.store.database_url.as_ref().ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!("Postgres store needs a database URL"))
                })?;
                let store = PgLedgerStore::new(
                    database_url.expose_secret(),
                    config.store.max_connections,
                    config.store.min_connections,
                )
                .await?;
                store.run_migrations().await?;
                Arc::new(store)
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory ledger store; records will not survive restarts");
                Arc::new(MemoryLedgerStore::new())
            }
        };

        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let invoices = Arc::new(InvoiceManager::new(store.clone(), notifier.clone()));
        let applicator = Arc::new(PaymentApplicator::new(store.clone(), notifier.clone()));

        let mpesa = MpesaGateway::new(config.mpesa.clone())?;
        if !mpesa.is_configured() {
            tracing::warn!("Mobile money credentials not configured; STK push is unavailable");
        }
        let card = CardGateway::new(config.card.clone())?;
        if !card.is_configured() {
            tracing::warn!("Card processor credentials not configured; checkout is unavailable");
        }
        let gateways = Arc::new(GatewayRegistry::new(vec![
            Arc::new(mpesa),
            Arc::new(card),
        ]));

        let state = AppState {
            config: config.clone(),
            store,
            invoices,
            applicator,
            gateways,
        };

        // Port 0 binds a random port for testing.
        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("fees-service bound to port {}", port);

        Ok(Self {
            port,
            listener,
            state,
            shutdown: CancellationToken::new(),
        })
    }

    /// Get the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the application state for sharing with background tasks.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Run the application until stopped.
    ///
    /// Serves the HTTP surface and the reconciliation scheduler; on ctrl-c
    /// both wind down and in-flight gateway calls are abandoned (the ledger
    /// only mutates after a confirmed provider response, so a cancelled
    /// call can never leave a half-applied payment).
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let Application {
            port: _,
            listener,
            state,
            shutdown,
        } = self;

        let scheduler = ReconciliationScheduler::new(
            state.store.clone(),
            state.applicator.clone(),
            state.invoices.clone(),
            state.gateways.clone(),
            state.config.reconciliation.clone(),
            shutdown.clone(),
        );
        let scheduler_handle = scheduler.spawn();

        let router = build_router(state);
        let graceful_token = shutdown.clone();
        let server = axum::serve(listener, router)
            .with_graceful_shutdown(async move { graceful_token.cancelled().await });

        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    tracing::error!("HTTP server error: {}", e);
                    shutdown.cancel();
                    let _ = scheduler_handle.await;
                    return Err(std::io::Error::other(format!("HTTP server error: {}", e)));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
            }
        }

        shutdown.cancel();
        let _ = scheduler_handle.await;
        Ok(())
    }
}
