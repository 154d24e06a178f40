use anyhow::Context;

pub mod fetch_runs;
pub mod lock;
pub mod memory;
pub mod pending_requests;
pub mod prices;
pub mod retrieved_months;

pub async fn migrate(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running database migrations failed")?;
    Ok(())
}
