use anyhow::Context;
use tracing::info;

use delivery_core as delivery;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = delivery::config::load_config().context("loading configuration")?;
    delivery::config::init_tracing(cfg.log_level(), cfg.log_json);

    info!(environment = %cfg.environment, "Starting database migration");

    let db = delivery::db::establish_connection_from_app_config(&cfg)
        .await
        .context("connecting to database")?;

    delivery::db::run_migrations(&db)
        .await
        .context("running migrations")?;

    delivery::db::close_pool(db).await.context("closing pool")?;
    info!("Migration completed successfully");

    Ok(())
}
