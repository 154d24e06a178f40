use anyhow::Context;

// Advisory locks are scoped to the Postgres session; this is a best-effort
// guard against two workers backfilling the same price series at once.
const LOCK_NAMESPACE: i64 = 0x454F_4446_494C_4C; // "EODFILL"

// FNV-1a, spelled out so the key never depends on std's hasher, which is
// free to change between releases; workers from different builds must agree
// on the key or the lock stops excluding anything.
fn lock_key_for_series(dataset: &str, ticker: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in dataset
        .as_bytes()
        .iter()
        .chain(b":")
        .chain(ticker.as_bytes())
    {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    LOCK_NAMESPACE ^ (hash as i64)
}

pub async fn try_acquire_series_lock(
    pool: &sqlx::PgPool,
    dataset: &str,
    ticker: &str,
) -> anyhow::Result<bool> {
    let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
        .persistent(false)
        .bind(lock_key_for_series(dataset, ticker))
        .fetch_one(pool)
        .await
        .context("advisory lock query failed")?;
    Ok(acquired)
}

pub async fn release_series_lock(
    pool: &sqlx::PgPool,
    dataset: &str,
    ticker: &str,
) -> anyhow::Result<()> {
    sqlx::query("SELECT pg_advisory_unlock($1)")
        .persistent(false)
        .bind(lock_key_for_series(dataset, ticker))
        .execute(pool)
        .await
        .context("advisory unlock query failed")?;
    Ok(())
}
