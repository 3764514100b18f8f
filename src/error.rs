//! Error types for tonlink.

use serde::Serialize;

/// Top-level error type for the connection engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),
}

/// Failure domains used when surfacing errors to callers.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    Config,
    Protocol,
    Manifest,
    Crypto,
    Storage,
    Request,
    Bridge,
    Chain,
    Keys,
}

/// Structured error payload for callers deciding on retry policy.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub domain: ErrorDomain,
    pub code: &'static str,
    pub retryable: bool,
    pub message: String,
}

impl ErrorPayload {
    fn new(
        domain: ErrorDomain,
        code: &'static str,
        retryable: bool,
        message: impl Into<String>,
    ) -> Self {
        Self {
            domain,
            code,
            retryable,
            message: message.into(),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Deeplink and wire-shape errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed connection deeplink: {reason}")]
    MalformedDeeplink { reason: String },

    #[error("Wallet kind {kind} cannot produce signatures")]
    UnsupportedWalletKind { kind: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl ProtocolError {
    pub(crate) fn deeplink(reason: impl Into<String>) -> Self {
        Self::MalformedDeeplink {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// Application manifest errors.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Manifest at {url} is unreachable: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("Manifest at {url} is malformed: {reason}")]
    Malformed { url: String, reason: String },
}

/// Session encryption errors. Never carries key or ciphertext bytes.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Ciphertext failed authentication or is truncated")]
    InvalidCiphertext,

    #[error("Invalid key material: {reason}")]
    InvalidKey { reason: String },

    #[error("Encryption failed")]
    EncryptionFailed,
}

/// Persisted-state errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage I/O failure for {key}: {reason}")]
    IoFailure { key: String, reason: String },

    #[error("Stored record {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Incoming request handling errors.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Preview of request {request_id} failed: {reason}")]
    PreviewFailed { request_id: String, reason: String },

    #[error("Request {request_id} was already handled")]
    AlreadyHandled { request_id: String },

    #[error("Broadcast of request {request_id} failed: {reason}")]
    BroadcastFailed {
        request_id: String,
        reason: String,
        /// False when the chain refused the message itself.
        retryable: bool,
    },

    #[error("Request {request_id} is unknown")]
    Unknown { request_id: String },

    #[error("Request {request_id} cannot move from {state} to {target}")]
    InvalidTransition {
        request_id: String,
        state: String,
        target: String,
    },
}

impl RequestError {
    pub(crate) fn broadcast_failed(request_id: &str, cause: &ChainError) -> Self {
        let (reason, retryable) = match cause {
            ChainError::Rejected { reason } => (format!("rejected: {reason}"), false),
            other => (other.to_string(), true),
        };
        Self::BroadcastFailed {
            request_id: request_id.to_string(),
            reason,
            retryable,
        }
    }
}

/// Relay transmission errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to send message to {to}: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Event stream failed: {reason}")]
    StreamFailed { reason: String },
}

/// Chain service errors.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("Chain request {endpoint} failed: {reason}")]
    RequestFailed { endpoint: String, reason: String },

    #[error("Invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    #[error("Message rejected by chain: {reason}")]
    Rejected { reason: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Signing key provider errors.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("No signing key available for wallet {wallet}")]
    Unavailable { wallet: String },

    #[error("Signing key for wallet {wallet} is invalid")]
    Invalid { wallet: String },
}

impl Error {
    /// Map errors into a structured surface for callers deciding whether to retry.
    pub fn to_error_payload(&self) -> ErrorPayload {
        let message = self.to_string();
        match self {
            Self::Config(_) => {
                ErrorPayload::new(ErrorDomain::Config, "config.invalid", false, message)
            }
            Self::Protocol(err) => match err {
                ProtocolError::MalformedDeeplink { .. } => ErrorPayload::new(
                    ErrorDomain::Protocol,
                    "protocol.malformed_deeplink",
                    false,
                    message,
                ),
                ProtocolError::UnsupportedWalletKind { .. } => ErrorPayload::new(
                    ErrorDomain::Protocol,
                    "protocol.unsupported_wallet_kind",
                    false,
                    message,
                ),
                ProtocolError::InvalidRequest { .. } => ErrorPayload::new(
                    ErrorDomain::Protocol,
                    "protocol.invalid_request",
                    false,
                    message,
                ),
            },
            Self::Manifest(err) => match err {
                ManifestError::Unreachable { .. } => ErrorPayload::new(
                    ErrorDomain::Manifest,
                    "manifest.unreachable",
                    true,
                    message,
                ),
                ManifestError::Malformed { .. } => ErrorPayload::new(
                    ErrorDomain::Manifest,
                    "manifest.malformed",
                    false,
                    message,
                ),
            },
            Self::Crypto(_) => {
                ErrorPayload::new(ErrorDomain::Crypto, "crypto.invalid", false, message)
            }
            Self::Storage(err) => match err {
                StorageError::IoFailure { .. } => {
                    ErrorPayload::new(ErrorDomain::Storage, "storage.io_failure", true, message)
                }
                StorageError::Corrupt { .. } => {
                    ErrorPayload::new(ErrorDomain::Storage, "storage.corrupt", false, message)
                }
            },
            Self::Request(err) => match err {
                RequestError::PreviewFailed { .. } => ErrorPayload::new(
                    ErrorDomain::Request,
                    "request.preview_failed",
                    true,
                    message,
                ),
                RequestError::AlreadyHandled { .. } => ErrorPayload::new(
                    ErrorDomain::Request,
                    "request.already_handled",
                    false,
                    message,
                ),
                RequestError::BroadcastFailed { retryable, .. } => ErrorPayload::new(
                    ErrorDomain::Request,
                    "request.broadcast_failed",
                    *retryable,
                    message,
                ),
                RequestError::Unknown { .. } => {
                    ErrorPayload::new(ErrorDomain::Request, "request.unknown", false, message)
                }
                RequestError::InvalidTransition { .. } => ErrorPayload::new(
                    ErrorDomain::Request,
                    "request.invalid_transition",
                    false,
                    message,
                ),
            },
            Self::Bridge(_) => {
                ErrorPayload::new(ErrorDomain::Bridge, "bridge.send_failed", true, message)
            }
            Self::Chain(err) => match err {
                ChainError::Rejected { .. } => {
                    ErrorPayload::new(ErrorDomain::Chain, "chain.rejected", false, message)
                }
                _ => ErrorPayload::new(ErrorDomain::Chain, "chain.request_failed", true, message),
            },
            Self::Key(_) => {
                ErrorPayload::new(ErrorDomain::Keys, "keys.unavailable", false, message)
            }
        }
    }

    /// Whether the caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        self.to_error_payload().retryable
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deeplink_errors_are_not_retryable() {
        let err = Error::from(ProtocolError::deeplink("missing id"));
        let payload = err.to_error_payload();

        assert_eq!(payload.domain, ErrorDomain::Protocol);
        assert_eq!(payload.code, "protocol.malformed_deeplink");
        assert!(!payload.retryable);
    }

    #[test]
    fn manifest_unreachable_is_retryable() {
        let err = Error::from(ManifestError::Unreachable {
            url: "https://app.example/manifest.json".to_string(),
            reason: "connection refused".to_string(),
        });

        assert!(err.is_retryable());
        assert_eq!(err.to_error_payload().code, "manifest.unreachable");
    }

    #[test]
    fn transport_broadcast_failures_are_retryable() {
        let cause = ChainError::RequestFailed {
            endpoint: "/v2/blockchain/message".to_string(),
            reason: "timeout".to_string(),
        };
        let err = Error::from(RequestError::broadcast_failed("7", &cause));
        let payload = err.to_error_payload();

        assert_eq!(payload.domain, ErrorDomain::Request);
        assert_eq!(payload.code, "request.broadcast_failed");
        assert!(payload.retryable);
    }

    #[test]
    fn rejected_broadcast_is_not_retryable() {
        let cause = ChainError::Rejected {
            reason: "seqno mismatch".to_string(),
        };
        let err = Error::from(RequestError::broadcast_failed("7", &cause));

        assert!(!err.is_retryable());
        assert!(err.to_string().contains("rejected: seqno mismatch"));
    }

    #[test]
    fn crypto_errors_do_not_leak_details() {
        let err = Error::from(CryptoError::InvalidCiphertext);
        let payload = err.to_error_payload();

        assert!(!payload.retryable);
        assert_eq!(
            payload.message,
            "Crypto error: Ciphertext failed authentication or is truncated"
        );
    }

    #[test]
    fn serializes_error_payload() {
        let err = Error::from(RequestError::AlreadyHandled {
            request_id: "3".to_string(),
        });
        let value = serde_json::to_value(err.to_error_payload()).expect("valid json");

        assert_eq!(value["domain"], "request");
        assert_eq!(value["code"], "request.already_handled");
        assert_eq!(value["retryable"], false);
    }
}
