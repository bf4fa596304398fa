use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Pool<Postgres>> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate(pool: &Pool<Postgres>) -> anyhow::Result<()> {
    sqlx::migrate!().run(pool).await?;
    info!("migrations applied");
    Ok(())
}

/// Connect and bring the schema up to date.
pub async fn init_db(database_url: &str, max_connections: u32) -> anyhow::Result<Pool<Postgres>> {
    let pool = connect(database_url, max_connections).await?;
    migrate(&pool).await?;
    Ok(pool)
}
