//! TrueVault API server

use tracing::info;

use truevault_api::{router, AppConfig, AppState};
use truevault_billing::BillingService;
use truevault_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().map_err(|e| anyhow::anyhow!("config: {e}"))?;

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    let billing = BillingService::from_env(pool).map_err(|e| anyhow::anyhow!("billing: {e}"))?;

    if let Some(owner_email) = &config.owner_email {
        billing
            .vip
            .ensure_owner(owner_email)
            .await
            .map_err(|e| anyhow::anyhow!("owner seed: {e}"))?;
        info!("Owner VIP entry ensured");
    }

    let bind_addr = config.bind_addr.clone();
    let app = router(AppState { billing, config });

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "TrueVault API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
