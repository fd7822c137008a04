use std::sync::Arc;

use lqr_core::{config::Config, relay::RelayPorts, storage::SqliteStore};

#[tokio::main]
async fn main() -> Result<(), lqr_core::Error> {
    lqr_core::logging::init("lqr")?;

    let cfg = Arc::new(Config::load()?);

    let store = Arc::new(SqliteStore::open(&cfg.database_path, cfg.store_options())?);
    tracing::info!(path = %cfg.database_path.display(), "storage ready");

    lqr_telegram::router::run_polling(cfg, RelayPorts::from_store(store))
        .await
        .map_err(|e| lqr_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
