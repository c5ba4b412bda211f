//! Application startup and lifecycle management.

use anyhow::Context;
use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use mongodb::{options::ClientOptions, Client, Database};
use secrecy::ExposeSecret;
use service_core::http::RetryConfig;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::{Config, StorageBackend};
use crate::handlers;
use crate::services::{
    init_metrics, BroadcastEvents, InMemoryInvoiceStore, InMemoryNotificationStore,
    InMemoryPaymentStore, InMemoryTokenCache, InvoiceStore, MongoInvoiceStore,
    MongoNotificationStore, MongoPaymentStore, MpesaClient, NotificationSink,
    PaymentOrchestrator, PaymentStore, PaystackClient, ProcessorRegistry, RedisTokenCache,
    TokenCache,
};
use crate::workers::ReconciliationWorker;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub mpesa: Arc<MpesaClient>,
    pub paystack: Arc<PaystackClient>,
    pub events: BroadcastEvents,
    pub payments: Arc<dyn PaymentStore>,
    pub invoices: Arc<dyn InvoiceStore>,
    /// Present only with the MongoDB backend.
    pub db: Option<Database>,
}

struct Stores {
    payments: Arc<dyn PaymentStore>,
    invoices: Arc<dyn InvoiceStore>,
    notifications: Arc<dyn NotificationSink>,
    db: Option<Database>,
}

async fn connect_stores(config: &Config) -> anyhow::Result<Stores> {
    match config.storage.backend {
        StorageBackend::Mongodb => {
            let database = config
                .storage
                .database
                .as_ref()
                .context("MongoDB backend selected without database settings")?;

            let mut client_options = ClientOptions::parse(database.url.expose_secret())
                .await
                .map_err(|e| {
                    tracing::error!("Failed to parse MongoDB connection string: {}", e);
                    e
                })?;
            client_options.app_name = Some(config.service_name.clone());

            let client = Client::with_options(client_options)?;
            let db = client.database(&database.db_name);

            let payments = MongoPaymentStore::new(&db);
            let invoices = MongoInvoiceStore::new(&db);
            let notifications = MongoNotificationStore::new(&db);

            payments.init_indexes().await.map_err(|e| {
                tracing::error!("Failed to initialize payment indexes: {}", e);
                e
            })?;
            invoices.init_indexes().await?;
            notifications.init_indexes().await?;

            tracing::info!(db_name = %database.db_name, "Using MongoDB storage");
            Ok(Stores {
                payments: Arc::new(payments),
                invoices: Arc::new(invoices),
                notifications: Arc::new(notifications),
                db: Some(db),
            })
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; data is lost on restart");
            Ok(Stores {
                payments: Arc::new(InMemoryPaymentStore::new()),
                invoices: Arc::new(InMemoryInvoiceStore::new()),
                notifications: Arc::new(InMemoryNotificationStore::new()),
                db: None,
            })
        }
    }
}

fn token_cache(config: &Config) -> anyhow::Result<Arc<dyn TokenCache>> {
    match &config.redis {
        Some(redis) => {
            let client = redis::Client::open(redis.url.expose_secret().as_str()).map_err(|e| {
                tracing::error!("Failed to create Redis client: {}", e);
                e
            })?;
            tracing::info!("Processor tokens cached in Redis");
            Ok(Arc::new(RedisTokenCache::new(client)))
        }
        None => Ok(Arc::new(InMemoryTokenCache::new())),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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

    tracing::info!("Shutdown signal received");
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        init_metrics();

        let stores = connect_stores(&config).await?;
        let tokens = token_cache(&config)?;

        let retry = RetryConfig::exponential(
            config.resilience.max_retries,
            config.resilience.retry_base(),
        );
        let timeout = config.resilience.timeout();

        let mpesa = Arc::new(MpesaClient::new(
            config.mpesa.clone(),
            timeout,
            retry.clone(),
            tokens,
        )?);
        let paystack = Arc::new(PaystackClient::new(
            config.paystack.clone(),
            timeout,
            retry,
        )?);

        if config.mpesa.is_configured() {
            tracing::info!(environment = ?config.mpesa.environment, "M-Pesa client initialized");
        } else {
            tracing::warn!("M-Pesa credentials not configured - mobile money payments disabled");
        }
        if config.paystack.is_configured() {
            tracing::info!("Paystack client initialized");
        } else {
            tracing::warn!("Paystack credentials not configured - card payments disabled");
        }

        let processors = ProcessorRegistry::new()
            .with(mpesa.clone())
            .with(paystack.clone());

        let events = BroadcastEvents::new();
        let orchestrator = Arc::new(PaymentOrchestrator::new(
            stores.payments.clone(),
            stores.invoices.clone(),
            stores.notifications,
            Arc::new(events.clone()),
            processors,
            &config.links.callback_base_url,
            &config.links.app_base_url,
        ));

        let state = AppState {
            config: config.clone(),
            orchestrator,
            mpesa,
            paystack,
            events,
            payments: stores.payments,
            invoices: stores.invoices,
            db: stores.db,
        };

        // Port 0 binds a random port for testing.
        let listener = TcpListener::bind((config.server.host.as_str(), config.server.port))
            .await
            .map_err(|e| {
                tracing::error!(
                    "Failed to bind HTTP listener to {}:{}: {}",
                    config.server.host,
                    config.server.port,
                    e
                );
                e
            })?;
        let http_port = listener.local_addr()?.port();

        tracing::info!("Settlement service: HTTP on port {}", http_port);

        let router = router(state.clone());

        Ok(Self {
            http_port,
            listener,
            router,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve until a shutdown signal arrives, running the reconciliation
    /// worker alongside when enabled.
    pub async fn run_until_stopped(self) -> anyhow::Result<()> {
        let shutdown_token = CancellationToken::new();
        let worker = ReconciliationWorker::new(
            self.state.config.reconciliation.clone(),
            self.state.orchestrator.clone(),
            shutdown_token.clone(),
        )
        .start();

        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        shutdown_token.cancel();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!("Reconciliation worker did not stop cleanly: {}", e);
            }
        }

        result.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            anyhow::Error::new(e)
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route(
            "/payments/initiate",
            post(handlers::payments::initiate_payment),
        )
        .route("/payments/events", get(handlers::events::payment_events))
        .route(
            "/payments/reconcile",
            post(handlers::payments::reconcile_pending),
        )
        .route(
            "/payments/mobile-money-status/:correlation_id",
            get(handlers::payments::mobile_money_status),
        )
        .route(
            "/payments/card-gateway-status/:reference",
            get(handlers::payments::card_gateway_status),
        )
        .route(
            "/payments/webhooks/mobile-money",
            post(handlers::webhooks::mobile_money_webhook),
        )
        .route(
            "/payments/webhooks/card-gateway",
            post(handlers::webhooks::card_gateway_webhook),
        )
        .route(
            "/payments/:id",
            get(handlers::payments::get_payment).delete(handlers::payments::delete_payment),
        )
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                    org_id = tracing::field::Empty,
                    user_id = tracing::field::Empty,
                )
            }),
        )
        .with_state(state)
}
