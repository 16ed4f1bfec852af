use serde::Deserialize;
use thiserror::Error as ThisError;

/// `RPC_VERIFY_ERROR`, `RPC_VERIFY_REJECTED`, `RPC_VERIFY_ALREADY_IN_CHAIN`.
pub const REJECTION_CODES: [i32; 3] = [-25, -26, -27];
/// `RPC_IN_WARMUP`
pub const WARMUP_CODE: i32 = -28;

#[derive(Deserialize, Debug)]
pub struct BitcoinRpcErrorResponse {
    pub code: i32,
    pub message: String,
}

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("Unexpected error: {0}")]
    Unexpected(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bitcoin RPC error (code {code}): {message}")]
    BitcoinRpc { code: i32, message: String },
    #[error("Transaction rejected (code {code}): {reason}")]
    Rejected { code: i32, reason: String },
    #[error("Wallet could not sign transaction: {0}")]
    SigningFailed(String),
    #[error("Deserialize hex error: {0}")]
    DeserializeHex(#[from] bitcoin::consensus::encode::FromHexError),
    #[error("Invalid header value error: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
}

impl Error {
    /// Promotes policy and consensus failures reported by
    /// `sendrawtransaction` to [`Error::Rejected`].
    pub fn classify(self) -> Self {
        match self {
            Error::BitcoinRpc { code, message } if REJECTION_CODES.contains(&code) => {
                Error::Rejected {
                    code,
                    reason: message,
                }
            }
            other => other,
        }
    }

    /// Connection trouble or a node still warming up. Worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(_) | Error::IO(_) => true,
            Error::BitcoinRpc { code, .. } => *code == WARMUP_CODE,
            _ => false,
        }
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            Error::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rejection_codes() {
        let err = Error::BitcoinRpc {
            code: -26,
            message: "insufficient fee, rejecting replacement".to_string(),
        }
        .classify();
        assert_eq!(
            err.rejection_reason(),
            Some("insufficient fee, rejecting replacement")
        );
        assert!(!err.is_transient());

        let err = Error::BitcoinRpc {
            code: -8,
            message: "Invalid parameter".to_string(),
        }
        .classify();
        assert!(matches!(err, Error::BitcoinRpc { code: -8, .. }));
        assert_eq!(err.rejection_reason(), None);
    }

    #[test]
    fn test_warmup_is_transient() {
        let err = Error::BitcoinRpc {
            code: WARMUP_CODE,
            message: "Loading block index...".to_string(),
        };
        assert!(err.is_transient());
        assert!(!Error::Unexpected("x".to_string()).is_transient());
    }
}
