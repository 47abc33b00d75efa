// Copyright Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Attribution cannot be removed

use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::ManagerConfig;
use diesel_async::pooled_connection::RecyclingMethod;
use diesel_async::pooled_connection::bb8::Pool;
use std::env;

/// The async connection pool. Wrap in Arc to share it across tasks.
pub type BuswayPostgresPool =
    bb8::Pool<AsyncDieselConnectionManager<diesel_async::AsyncPgConnection>>;

/// Builds the pool from `DATABASE_URL`. Failure here is not fatal to the
/// server: callers degrade to in-memory operation without persisted speeds.
pub async fn make_async_pool() -> Result<
    bb8::Pool<AsyncDieselConnectionManager<diesel_async::AsyncPgConnection>>,
    Box<dyn std::error::Error + Sync + Send>,
> {
    let database_url = env::var("DATABASE_URL")?;

    let mut custom_conf = ManagerConfig::default();
    custom_conf.recycling_method = RecyclingMethod::Fast;

    let config: AsyncDieselConnectionManager<diesel_async::AsyncPgConnection> =
        AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new_with_config(
            database_url,
            custom_conf,
        );
    let pool = Pool::builder()
        .max_size(32)
        .min_idle(Some(4))
        .build(config)
        .await?;

    Ok(pool)
}
