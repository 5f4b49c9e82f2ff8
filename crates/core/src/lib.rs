#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod protocol;
pub mod registry;
pub mod validation;

/// WalletId is the top-level ownership boundary for all syncable rows.
/// Wallets are minted by clients, so the id follows the client-id grammar
/// rather than a server-side UUID. Parsing validates; the tuple field is
/// public so trusted sources (storage round-trips) can rebuild ids without
/// re-validating.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WalletId(pub String);

impl WalletId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WalletId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for WalletId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = validation::validate_client_id(s)
            .map_err(|_| CoreError::InvalidIdentifier)?;
        Ok(Self(id.to_owned()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid identifier")]
    InvalidIdentifier,
}

#[cfg(test)]
mod tests {
    use super::{CoreError, WalletId};

    #[test]
    fn wallet_id_round_trip() {
        let wallet: WalletId = "wal-1".parse().expect("parse wallet id");
        assert_eq!(wallet.as_str(), "wal-1");
        assert_eq!(wallet.to_string(), "wal-1");
    }

    #[test]
    fn wallet_id_rejects_invalid() {
        for raw in ["", "-leading-dash", "has space"] {
            let error = raw.parse::<WalletId>().expect_err("invalid id");
            assert!(matches!(error, CoreError::InvalidIdentifier), "{raw}");
        }
    }

    #[test]
    fn wallet_id_parse_trims() {
        let wallet: WalletId = "  wal-1  ".parse().expect("parse wallet id");
        assert_eq!(wallet.as_str(), "wal-1");
    }
}
