use thiserror::Error;

/// Reasons a capability token is rejected.
///
/// Only used for logging; callers that decide access go through
/// [`TokenCodec::verify`](super::TokenCodec::verify), which is a plain boolean.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum TokenError {
    #[error("Token has expired")]
    Expired,

    #[error("Signature mismatch")]
    BadSignature,

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Invalid signing key")]
    InvalidKey,
}
