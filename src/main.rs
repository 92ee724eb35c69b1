use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use waiting_room::{config::Config, state::Rooms, store::Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,waiting_room=debug,sqlx=warn")),
        )
        .init();

    let cfg   = Config::from_env().context("reading configuration")?;
    let store = Store::connect(&cfg.database_url, cfg.pins())
        .await
        .with_context(|| format!("opening {}", cfg.database_url))?;
    let rooms = Rooms::new(cfg.room_capacity);

    if cfg.jwt_secret.is_none() {
        tracing::warn!("JWT_SECRET unset: doctor connections are not authenticated");
    }

    let addr = cfg.bind_addr.clone();
    let app  = waiting_room::app(store, rooms, Arc::new(cfg));

    let listener = tokio::net::TcpListener::bind(&addr).await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "waiting room listening");
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
