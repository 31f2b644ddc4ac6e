//! HTTP server assembly and lifecycle.

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use mrs::types::Peer;

use crate::auth::key_cache::{HttpKeyFetcher, KeyCache};
use crate::auth::{keys, Authenticator};
use crate::config::Settings;
use crate::federation::sync::{SyncIngest, SyncPuller};
use crate::federation::{refresh, sync, FederationMetrics};
use crate::handlers::{self, AppState};
use crate::peer_store::Peers;
use crate::rate_limit::RateLimiter;
use crate::registry::RegistryService;
use crate::store::SqliteStore;
use crate::{auth_handlers, peer_handlers, sync_handlers, wellknown};

const AUTH_ATTEMPTS_PER_WINDOW: u32 = 10;
const AUTH_WINDOW: Duration = Duration::from_secs(60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/register", post(handlers::register))
        .route("/release", post(handlers::release))
        .route("/search", post(handlers::search))
        .route("/.well-known/mrs", get(wellknown::server_info))
        .route(
            "/.well-known/mrs/keys/:identity",
            get(wellknown::identity_key),
        )
        .route("/auth/register", post(auth_handlers::register_user))
        .route("/auth/login", post(auth_handlers::login_user))
        .route("/auth/me", get(auth_handlers::me))
        .route("/auth/me/registrations", get(auth_handlers::my_registrations))
        .route("/sync/snapshot", get(sync_handlers::snapshot))
        .route("/sync/changes", get(sync_handlers::changes))
        .route("/admin/peers", post(peer_handlers::add_peer))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Build the shared application state: provision the server key, load
/// bootstrap peers, and wire the components together.
pub async fn init_state(
    settings: Settings,
    store: SqliteStore,
) -> Result<Arc<AppState>, Box<dyn std::error::Error>> {
    let store = Arc::new(store);

    let server_key = keys::ensure_server_key(&store).await?;
    tracing::info!("Server signing key: {}", server_key.key_id);

    for peer_url in &settings.bootstrap_peers {
        store
            .upsert_peer(Peer {
                server_url: peer_url.trim_end_matches('/').to_string(),
                hint: None,
                last_seen: None,
                is_configured: true,
                authoritative_regions: None,
                sync_cursor: None,
            })
            .await?;
        tracing::info!("Added bootstrap peer: {}", peer_url);
    }

    let peers = Arc::new(Peers::load(Arc::clone(&store)).await?);

    let http = reqwest::Client::new();
    let key_cache = Arc::new(KeyCache::new(
        Arc::new(HttpKeyFetcher::new(http)),
        Duration::from_secs(settings.key_cache_ttl_seconds),
    ));
    let auth = Authenticator::new(
        Arc::clone(&store),
        key_cache,
        settings.server_domain.clone(),
    );

    let registry = RegistryService::new(
        Arc::clone(&store),
        settings.server_url.clone(),
        settings.max_radius,
        settings.max_results,
    );

    Ok(Arc::new(AppState {
        registry,
        auth,
        peers,
        metrics: Arc::new(FederationMetrics::default()),
        auth_limiter: RateLimiter::new(AUTH_ATTEMPTS_PER_WINDOW, AUTH_WINDOW),
        store,
        settings,
    }))
}

/// Run the server until shutdown.
pub async fn run(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteStore::open(&settings.database_path)?;
    tracing::info!("Database open at {}", settings.database_path);

    let state = init_state(settings, store).await?;
    spawn_background_tasks(&state).await?;

    let app = create_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", state.settings.host, state.settings.port).parse()?;
    tracing::info!("MRS server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn spawn_background_tasks(
    state: &Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let http = reqwest::Client::new();

    // Peer metadata refresh.
    tokio::spawn(refresh::run_peer_refresh_loop(
        Arc::clone(&state.peers),
        http.clone(),
        state.settings.server_url.clone(),
        Duration::from_secs(state.settings.peer_refresh_interval_seconds),
    ));

    // Sync pull loop, authenticated with the server key.
    let server_key = state
        .store
        .get_signing_key(mrs::validation::SERVER_IDENTITY_USER)
        .await?
        .ok_or("server key missing after init")?;
    let signing_key = keys::signing_key_from_record(&server_key)?;
    let ingest = SyncIngest::new(
        Arc::clone(&state.store),
        state.settings.server_url.clone(),
        Arc::clone(&state.metrics),
    );
    let puller = Arc::new(SyncPuller::new(
        ingest,
        Arc::clone(&state.peers),
        http,
        signing_key,
        &state.settings.server_url,
        &state.settings.server_domain,
    ));
    tokio::spawn(sync::run_sync_loop(
        puller,
        Arc::clone(&state.peers),
        Duration::from_secs(state.settings.sync_interval_seconds),
    ));

    // Token cleanup and tombstone/change-log GC.
    let store = Arc::clone(&state.store);
    let retention = chrono::Duration::days(state.settings.tombstone_retention_days);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            ticker.tick().await;
            match store.delete_expired_tokens().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Removed {} expired tokens", n),
                Err(e) => tracing::warn!("Token cleanup failed: {}", e),
            }
            match store.gc_expired(chrono::Utc::now() - retention).await {
                Ok((0, 0)) => {}
                Ok((tombs, log)) => tracing::info!(
                    "GC removed {} tombstones, pruned {} change-log entries",
                    tombs,
                    log
                ),
                Err(e) => tracing::warn!("GC failed: {}", e),
            }
        }
    });

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("Received SIGTERM signal");
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

    tracing::info!("Starting graceful shutdown...");
}
