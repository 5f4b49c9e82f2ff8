#![forbid(unsafe_code)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let storage = wallet_sync_storage::PostgresStorage::connect(&database_url).await?;
    wallet_sync_storage::migrate_with_pool(storage.pool()).await?;
    println!("migrations complete");
    Ok(())
}
