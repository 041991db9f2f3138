//! # anchorgate: an LLM gateway with quota enforcement and audit anchoring
//!
//! `anchorgate` sits between client applications and upstream LLM providers
//! (an OpenAI-compatible provider, an Anthropic-style provider and a local
//! inference backend). For every authenticated call it checks the caller's
//! remaining spending quota, rewrites the request for the target provider's
//! dialect, relays the response stream back unchanged, extracts token usage
//! from the captured response, prices the call, debits the quota and
//! persists an audit record. Audit records are then aggregated into Merkle
//! batches and anchored into an append-only on-chain log, giving every
//! record an independently verifiable inclusion proof.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); persistence
//! is PostgreSQL through the [`store::GatewayStore`] trait (an in-memory
//! implementation backs the test suite). Requests flow through
//! [`proxy`] — admission, rewrite, streaming relay with a bounded capture
//! tee — and settle in a post-flight step that runs regardless of client
//! liveness: [`usage`] extraction, [`pricing`], the transactional quota
//! debit, and the hand-off to the [`anchor`] batcher.
//!
//! Anchoring is eventually consistent by design: the request path never
//! waits for a batch to land on-chain. All anchor submissions pass through
//! a strict serial queue so sequence numbers cannot race; batch sizes adapt
//! to a daily transaction budget.
//!
//! ## Quick start
//!
//! ```no_run
//! use clap::Parser;
//! use anchorgate::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = anchorgate::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     anchorgate::telemetry::init_telemetry();
//!
//!     Application::new(config).await?.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     }).await
//! }
//! ```

pub mod anchor;
pub mod api;
pub mod config;
pub mod errors;
pub mod merkle;
pub mod pricing;
pub mod proxy;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod usage;

use crate::anchor::batcher::{self, BatcherHandle};
use crate::anchor::client::{AnchorChain, HttpAnchorClient};
use crate::anchor::{pipeline, sweeper};
use crate::api::handlers;
use crate::pricing::PricingEngine;
use crate::proxy::upstream::UpstreamClient;
use crate::store::{GatewayStore, postgres::PostgresStore};
use anyhow::Context;
use axum::{
    Router,
    routing::{delete, get, post, put},
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, instrument};

pub use config::Config;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn GatewayStore>,
    pub config: Arc<Config>,
    pub pricing: Arc<PricingEngine>,
    pub upstream: Arc<UpstreamClient>,
    /// Absent when anchoring is disabled; usage logs then stay unanchored.
    pub batcher: Option<BatcherHandle>,
    pub chain: Arc<dyn AnchorChain>,
}

/// Get the anchorgate database migrator.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Seed the pricing table from configuration. Only runs against an empty
/// table so operator edits are never overwritten.
#[instrument(skip_all)]
pub async fn seed_pricing(config: &Config, store: &dyn GatewayStore) -> anyhow::Result<()> {
    if config.pricing_seed.is_empty() {
        return Ok(());
    }
    if !store.list_pricing().await?.is_empty() {
        info!("Pricing table already populated, skipping seed");
        return Ok(());
    }
    for row in &config.pricing_seed {
        store.upsert_pricing(row).await?;
    }
    info!(rows = config.pricing_seed.len(), "Seeded pricing table");
    Ok(())
}

fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/logs", get(handlers::audit::list_logs))
        .route("/logs/{id}", get(handlers::audit::get_log))
        .route("/logs/{id}/verify", get(handlers::audit::verify_log))
        .route("/batches", get(handlers::stats::list_batches))
        .route("/batches/{id}", get(handlers::stats::get_batch))
        .route("/pricing", get(handlers::pricing::list_pricing))
        .route("/pricing", put(handlers::pricing::upsert_pricing))
        .route(
            "/pricing/{provider}/{model}",
            delete(handlers::pricing::delete_pricing),
        )
        .route("/pricing/invalidate", post(handlers::pricing::invalidate_pricing))
        .route("/consumers/{id}", get(handlers::consumers::get_consumer))
        .route("/consumers/{id}/quota", put(handlers::consumers::set_quota))
        .route("/stats/budget", get(handlers::stats::budget_today))
        .route("/stats/usage", get(handlers::stats::usage_totals))
        .route("/stats/anchor", get(handlers::stats::anchor_status));

    Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/ai/v1/chat/completions", post(handlers::chat::chat_completions))
        .nest("/admin/api/v1", admin_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The assembled application: router, shared state and background services.
pub struct Application {
    state: AppState,
    router: Router,
}

impl Application {
    /// Construct the production application: connect to PostgreSQL, run
    /// migrations, seed pricing, and wire the HTTP anchor client.
    pub async fn new(config: Config) -> anyhow::Result<Application> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
            .connect(&config.database.url)
            .await
            .context("connecting to PostgreSQL")?;
        migrator().run(&pool).await.context("running migrations")?;

        let store: Arc<dyn GatewayStore> = Arc::new(PostgresStore::new(pool));
        let chain: Arc<dyn AnchorChain> =
            Arc::new(HttpAnchorClient::new(&config.anchoring).context("building anchor client")?);
        Self::with_components(config, store, chain).await
    }

    /// Construct the application over injected collaborators. This is the
    /// single wiring point for store and chain implementations; tests pass
    /// the in-memory store and mock chain here.
    pub async fn with_components(
        config: Config,
        store: Arc<dyn GatewayStore>,
        chain: Arc<dyn AnchorChain>,
    ) -> anyhow::Result<Application> {
        seed_pricing(&config, store.as_ref()).await?;

        let pricing = Arc::new(
            PricingEngine::new(store.clone())
                .await
                .context("loading pricing table")?,
        );
        let upstream = Arc::new(UpstreamClient::new(&config).context("building upstream client")?);

        let batcher = if config.anchoring.enabled {
            pipeline::startup_check(store.as_ref(), chain.as_ref()).await;
            let (pipeline_handle, _pipeline_task) = pipeline::spawn(store.clone(), chain.clone());
            let (batcher_handle, _batcher_task) =
                batcher::spawn(store.clone(), pipeline_handle, config.batching.clone());
            if config.batching.sweep_enabled {
                let _sweeper_task = sweeper::spawn(
                    store.clone(),
                    batcher_handle.clone(),
                    sweeper::SweeperConfig {
                        interval: config.batching.sweep_interval,
                        min_age: config.batching.sweep_min_age,
                        batch_limit: 500,
                    },
                );
            }
            Some(batcher_handle)
        } else {
            info!("Anchoring disabled; usage logs will not be committed on-chain");
            None
        };

        let state = AppState {
            store,
            config: Arc::new(config),
            pricing,
            upstream,
            batcher,
            chain,
        };
        let router = create_router(state.clone());
        Ok(Application { state, router })
    }

    /// The assembled router, e.g. for an in-process test server.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Start serving until the shutdown future resolves, then flush pending
    /// anchors.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.state.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("anchorgate listening on http://{bind_addr}");

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        if let Some(batcher) = &self.state.batcher {
            info!("Flushing pending anchor batches...");
            batcher.flush().await;
        }
        Ok(())
    }
}
