#![forbid(unsafe_code)]

//! Operator tool: mint a device bearer token for a `(user, device)` pair.
//! Production token issuance lives with the identity service; this bin
//! covers local development and smoke tests.

use std::env;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand_core::{OsRng, RngCore};
use wallet_sync_auth::DeviceTokenManager;

fn main() -> anyhow::Result<()> {
    let config = parse_args(env::args())?;
    run(config)
}

fn run(config: KeygenConfig) -> anyhow::Result<()> {
    let (key, generated) = match config.key.as_deref() {
        Some(encoded) => {
            let decoded = URL_SAFE_NO_PAD
                .decode(encoded.trim())
                .map_err(|_| anyhow::anyhow!("--key must be base64url"))?;
            let key: [u8; 32] = decoded
                .try_into()
                .map_err(|_| anyhow::anyhow!("--key must decode to 32 bytes"))?;
            (key, false)
        }
        None => {
            let mut key = [0_u8; 32];
            OsRng.fill_bytes(&mut key);
            (key, true)
        }
    };

    let manager = DeviceTokenManager::new(key, Duration::from_secs(config.ttl_secs));
    let token = manager.issue_token(&config.user, &config.device)?;

    println!("device token issued");
    println!("user={}", config.user);
    println!("device={}", config.device);
    println!("ttl_secs={}", config.ttl_secs);
    if generated {
        println!("device_token_key_base64url={}", URL_SAFE_NO_PAD.encode(key));
        println!("hint=set DEVICE_TOKEN_KEY on the server to this value");
    }
    println!("token={token}");

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeygenConfig {
    user: String,
    device: String,
    key: Option<String>,
    ttl_secs: u64,
}

const DEFAULT_TTL_SECS: u64 = 30 * 24 * 60 * 60;

fn parse_args<I>(args: I) -> anyhow::Result<KeygenConfig>
where
    I: IntoIterator<Item = String>,
{
    let mut user = None;
    let mut device = None;
    let mut key = env::var("DEVICE_TOKEN_KEY").ok();
    let mut ttl_secs = DEFAULT_TTL_SECS;

    let mut iter = args.into_iter();
    let _program = iter.next();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--user" => {
                let Some(value) = iter.next() else {
                    return Err(anyhow::anyhow!("--user requires a value"));
                };
                user = Some(value);
            }
            "--device" => {
                let Some(value) = iter.next() else {
                    return Err(anyhow::anyhow!("--device requires a value"));
                };
                device = Some(value);
            }
            "--key" => {
                let Some(value) = iter.next() else {
                    return Err(anyhow::anyhow!("--key requires a value"));
                };
                key = Some(value);
            }
            "--ttl-secs" => {
                let Some(value) = iter.next() else {
                    return Err(anyhow::anyhow!("--ttl-secs requires a value"));
                };
                ttl_secs = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("--ttl-secs must be an integer"))?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            unknown => {
                return Err(anyhow::anyhow!("unknown argument {unknown:?}"));
            }
        }
    }

    let user = user.ok_or_else(|| anyhow::anyhow!("--user is required"))?;
    let device = device.ok_or_else(|| anyhow::anyhow!("--device is required"))?;
    Ok(KeygenConfig {
        user,
        device,
        key,
        ttl_secs,
    })
}

fn print_usage() {
    println!(
        "Usage: wallet-sync-token-keygen --user <user-id> --device <device-id> [--key <base64url>] [--ttl-secs <secs>]"
    );
    println!("  --user: user id to bind the token to");
    println!("  --device: device id to bind the token to");
    println!("  --key: server HMAC key (default: DEVICE_TOKEN_KEY env; generated when absent)");
    println!("  --ttl-secs: token lifetime (default: 30 days)");
}
