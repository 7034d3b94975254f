//! PaySync API server entrypoint

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use paysync_api::routes::create_router;
use paysync_api::{AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;

    let pool = paysync_shared::create_pool(&config.database_url)
        .await
        .context("connecting to database")?;
    paysync_shared::run_migrations(&pool)
        .await
        .context("running migrations")?;

    let state = AppState::new(pool, config.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("binding {}", config.bind_address))?;
    tracing::info!(address = %config.bind_address, "PaySync API listening");

    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
