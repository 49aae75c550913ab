// pending subscriptions that are never confirmed should not pile up forever;
// this worker periodically drops rows older than 24 h. once a row is gone,
// the emailed link resolves to "Token not found", same as a consumed token.

use std::time::Duration;

use sqlx::PgPool;

use crate::configuration::Settings;
use crate::startup::get_connection_pool;

async fn expire_stale_pending(pool: &PgPool) -> Result<(), anyhow::Error> {
    sqlx::query(
        r#"
        DELETE FROM pending_subscriptions
        WHERE now() - created_at > interval '24 hours'
"#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn expire_pending_loop(pool: &PgPool) -> Result<(), anyhow::Error> {
    loop {
        match expire_stale_pending(pool).await {
            Err(_) => tokio::time::sleep(Duration::from_secs(60)).await,
            Ok(_) => tokio::time::sleep(Duration::from_secs(600)).await,
        }
    }
}

/// To be run as a separate worker, outside the main API
pub async fn init_expiry_worker(cfg: Settings) -> Result<(), anyhow::Error> {
    let pool = get_connection_pool(&cfg.database);
    expire_pending_loop(&pool).await
}
