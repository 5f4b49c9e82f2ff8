#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use wallet_sync_api::ApiState;
use wallet_sync_auth::DeviceTokenManager;
use wallet_sync_storage::PostgresStorage;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5480";
const DEFAULT_TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub device_token_key: [u8; 32],
    pub device_token_ttl: Duration,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_values(
            std::env::var("LISTEN_ADDR").ok(),
            std::env::var("DATABASE_URL").ok(),
            std::env::var("DEVICE_TOKEN_KEY").ok(),
            std::env::var("DEVICE_TOKEN_TTL_SECS").ok(),
        )
    }

    fn from_values(
        listen_addr: Option<String>,
        database_url: Option<String>,
        device_token_key: Option<String>,
        token_ttl_secs: Option<String>,
    ) -> anyhow::Result<Self> {
        let listen_addr =
            SocketAddr::from_str(listen_addr.as_deref().unwrap_or(DEFAULT_LISTEN_ADDR))?;
        let database_url =
            database_url.ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let device_token_key = parse_token_key(device_token_key)?;
        let device_token_ttl = match token_ttl_secs {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .map_err(|_| anyhow::anyhow!("DEVICE_TOKEN_TTL_SECS must be an integer"))?,
            ),
            None => Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
        };

        Ok(Self {
            listen_addr,
            database_url,
            device_token_key,
            device_token_ttl,
        })
    }
}

fn parse_token_key(value: Option<String>) -> anyhow::Result<[u8; 32]> {
    let raw = value.ok_or_else(|| anyhow::anyhow!("DEVICE_TOKEN_KEY must be set"))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(raw.trim())
        .map_err(|_| anyhow::anyhow!("DEVICE_TOKEN_KEY must be base64url"))?;
    let key: [u8; 32] = decoded
        .try_into()
        .map_err(|_| anyhow::anyhow!("DEVICE_TOKEN_KEY must decode to 32 bytes"))?;
    Ok(key)
}

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let storage = Arc::new(PostgresStorage::connect(&config.database_url).await?);
    let auth = Arc::new(DeviceTokenManager::new(
        config.device_token_key,
        config.device_token_ttl,
    ));
    let state = ApiState::new(storage, auth);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");
    axum::serve(listener, wallet_sync_api::router(state)).await?;
    Ok(())
}
