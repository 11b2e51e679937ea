pub mod codec;
pub mod error;
pub mod link;

pub use codec::{CapabilityToken, SignatureScope, TokenCodec, now_unix};
pub use error::TokenError;
pub use link::{IssuedLink, LinkIssuer};

/// Short fingerprint of a token for log fields.
pub(crate) fn fingerprint(token: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    format!("{:016x}", hasher.finish())[..8].to_string()
}
