use service_core::error::AppError;
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tenant_auth::{
    build_router,
    config::AuthConfig,
    db::{
        self,
        postgres::{PgDomainsRepository, PgKeyRepository, PgPatsRepository, PgRolesRepository},
    },
    services::{
        tokenizer, AuthService, DomainService, HttpCallout, PatService, SpiceDbAgent,
        TokenDurations, UuidProvider,
    },
    AppState,
};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = AuthConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        algorithm = %config.tokenizer.algorithm,
        "Starting tenant authorization service"
    );

    let pool = db::create_pool(&config.database)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::Error::new(e)))?;
    tracing::info!("Database initialized successfully");

    let tokenizer = tokenizer::from_config(&config.tokenizer)
        .map_err(|e| AppError::ConfigError(anyhow::Error::new(e)))?;
    let agent = Arc::new(SpiceDbAgent::new(&config.spicedb)?);
    let callout = Arc::new(HttpCallout::new(&config.callout)?);
    tracing::info!(
        spicedb = %config.spicedb.endpoint,
        callout_urls = config.callout.urls.len(),
        "Policy layer initialized"
    );

    let id_provider = Arc::new(UuidProvider);
    let pats_repo = Arc::new(PgPatsRepository::new(pool.clone()));

    let auth = AuthService::new(
        Arc::new(PgKeyRepository::new(pool.clone())),
        pats_repo.clone(),
        id_provider.clone(),
        tokenizer,
        agent,
        callout,
        TokenDurations::from_config(&config.tokens),
    );
    let domains = DomainService::new(
        Arc::new(PgDomainsRepository::new(pool.clone())),
        Arc::new(PgRolesRepository::new(pool.clone())),
        auth.clone(),
        id_provider.clone(),
    );
    let pats = PatService::new(pats_repo, auth.clone(), id_provider);

    let state = AppState {
        service_name: config.service_name.clone(),
        service_version: config.service_version.clone(),
        auth,
        domains,
        pats,
        pool: Some(pool),
    };
    let app = build_router(state).await?;

    let addr = config.common.socket_addr();
    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    service_core::axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.common.shutdown_grace_seconds))
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal(grace_seconds: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    tokio::time::sleep(tokio::time::Duration::from_secs(grace_seconds)).await;
}
