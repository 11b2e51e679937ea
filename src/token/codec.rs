use crate::token::error::TokenError;
use hmac::{Hmac, Mac};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Seconds since the unix epoch, saturating to zero on a clock before 1970.
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Which fields the link signature covers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignatureScope {
    /// `resource_id || expiry`. The size travels unsigned next to the token.
    ResourceExpiry,
    /// `resource_id ":" size ":" expiry`. A client cannot alter the declared size.
    #[default]
    ResourceSizeExpiry,
}

/// A signed, time-bound grant for one resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityToken {
    pub resource_id: String,
    pub size: u64,
    pub expiry: u64,
    /// Hex encoded HMAC-SHA256
    pub signature: String,
}

impl CapabilityToken {
    /// Render as the query string of a stream link.
    pub fn to_query(&self) -> String {
        format!(
            "resource_id={}&size={}&token={}&exp={}",
            utf8_percent_encode(&self.resource_id, NON_ALPHANUMERIC),
            self.size,
            self.signature,
            self.expiry
        )
    }
}

/// Issues and verifies capability tokens under a server-held secret.
#[derive(Clone)]
pub struct TokenCodec {
    mac: Arc<HmacSha256>,
    scope: SignatureScope,
}

impl TokenCodec {
    pub fn new(secret: &[u8], scope: SignatureScope) -> Result<Self, TokenError> {
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidKey)?;
        Ok(Self {
            mac: Arc::new(mac),
            scope,
        })
    }

    /// Codec with a freshly generated 32-byte secret. Tokens die with the process.
    pub fn random(scope: SignatureScope) -> Result<Self, TokenError> {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self::new(&secret, scope)
    }

    pub fn scope(&self) -> SignatureScope {
        self.scope
    }

    pub fn issue(&self, resource_id: &str, size: u64, ttl: Duration) -> CapabilityToken {
        self.issue_at(resource_id, size, ttl, now_unix())
    }

    pub fn issue_at(&self, resource_id: &str, size: u64, ttl: Duration, now: u64) -> CapabilityToken {
        let expiry = now.saturating_add(ttl.as_secs());
        let signature = hex::encode(self.keyed(resource_id, size, expiry).finalize().into_bytes());

        CapabilityToken {
            resource_id: resource_id.to_string(),
            size,
            expiry,
            signature,
        }
    }

    /// Total verification: any failure, including malformed input, is `false`.
    pub fn verify(&self, resource_id: &str, size: u64, expiry: u64, signature: &str) -> bool {
        self.check(resource_id, size, expiry, signature).is_ok()
    }

    pub fn check(
        &self,
        resource_id: &str,
        size: u64,
        expiry: u64,
        signature: &str,
    ) -> Result<(), TokenError> {
        self.check_at(resource_id, size, expiry, signature, now_unix())
    }

    pub fn check_at(
        &self,
        resource_id: &str,
        size: u64,
        expiry: u64,
        signature: &str,
        now: u64,
    ) -> Result<(), TokenError> {
        if now > expiry {
            return Err(TokenError::Expired);
        }

        let tag = hex::decode(signature)
            .map_err(|error| TokenError::Malformed(format!("signature is not hex: {error}")))?;

        // verify_slice compares in constant time
        self.keyed(resource_id, size, expiry)
            .verify_slice(&tag)
            .map_err(|_| TokenError::BadSignature)
    }

    fn keyed(&self, resource_id: &str, size: u64, expiry: u64) -> HmacSha256 {
        let mut mac = (*self.mac).clone();
        match self.scope {
            SignatureScope::ResourceExpiry => {
                mac.update(resource_id.as_bytes());
                mac.update(expiry.to_string().as_bytes());
            }
            SignatureScope::ResourceSizeExpiry => {
                mac.update(format!("{resource_id}:{size}:{expiry}").as_bytes());
            }
        }
        mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;
    const TTL: Duration = Duration::from_secs(3600);

    fn codec(scope: SignatureScope) -> TokenCodec {
        TokenCodec::new(b"test-secret", scope).unwrap()
    }

    #[test]
    fn test_issue_and_verify() {
        let codec = codec(SignatureScope::ResourceSizeExpiry);
        let token = codec.issue_at("BQACAgQAAxkBAAI", 1_000_000, TTL, NOW);

        assert_eq!(token.expiry, NOW + 3600);
        assert_eq!(token.signature.len(), 64);
        assert!(
            codec
                .check_at(&token.resource_id, token.size, token.expiry, &token.signature, NOW)
                .is_ok()
        );
        // Still valid exactly at expiry
        assert!(
            codec
                .check_at(&token.resource_id, token.size, token.expiry, &token.signature, NOW + 3600)
                .is_ok()
        );
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let codec = codec(SignatureScope::ResourceExpiry);
        let token = codec.issue_at("file", 10, TTL, NOW);

        assert_eq!(
            codec.check_at("file", 10, token.expiry, &token.signature, token.expiry + 1),
            Err(TokenError::Expired)
        );

        // Issued long ago with the real clock
        let stale = codec.issue_at("file", 10, TTL, 1_000);
        assert!(!codec.verify("file", 10, stale.expiry, &stale.signature));
    }

    #[test]
    fn test_altered_fields_are_rejected() {
        let codec = codec(SignatureScope::ResourceSizeExpiry);
        let token = codec.issue_at("resource-42", 5000, TTL, NOW);

        let mut altered_id = token.resource_id.clone().into_bytes();
        altered_id[0] ^= 0x01;
        let altered_id = String::from_utf8(altered_id).unwrap();

        let check = |id: &str, size: u64, exp: u64, sig: &str| codec.check_at(id, size, exp, sig, NOW);

        assert_eq!(
            check(&altered_id, 5000, token.expiry, &token.signature),
            Err(TokenError::BadSignature)
        );
        assert_eq!(
            check("resource-42", 5000, token.expiry + 1, &token.signature),
            Err(TokenError::BadSignature)
        );
        assert_eq!(
            check("resource-42", 5000, token.expiry - 1, &token.signature),
            Err(TokenError::BadSignature)
        );
        assert_eq!(
            check("resource-42", 5001, token.expiry, &token.signature),
            Err(TokenError::BadSignature)
        );

        let mut flipped = token.signature.clone();
        let last = if flipped.ends_with('0') { "1" } else { "0" };
        flipped.replace_range(63.., last);
        assert_eq!(
            check("resource-42", 5000, token.expiry, &flipped),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_legacy_scope_does_not_cover_size() {
        let codec = codec(SignatureScope::ResourceExpiry);
        let token = codec.issue_at("resource", 5000, TTL, NOW);

        assert!(
            codec
                .check_at("resource", 999_999, token.expiry, &token.signature, NOW)
                .is_ok()
        );
        assert_eq!(
            codec.check_at("resource", 5000, token.expiry + 1, &token.signature, NOW),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_legacy_scope_matches_plain_hmac() {
        let codec = codec(SignatureScope::ResourceExpiry);
        let token = codec.issue_at("abc", 1, TTL, NOW);

        let mut mac = HmacSha256::new_from_slice(b"test-secret").unwrap();
        mac.update(format!("abc{}", NOW + 3600).as_bytes());
        assert_eq!(token.signature, hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn test_malformed_and_foreign_signatures() {
        let codec = codec(SignatureScope::ResourceSizeExpiry);
        let token = codec.issue_at("resource", 1, TTL, NOW);

        assert!(matches!(
            codec.check_at("resource", 1, token.expiry, "not-hex!", NOW),
            Err(TokenError::Malformed(_))
        ));
        assert_eq!(
            codec.check_at("resource", 1, token.expiry, "abcd", NOW),
            Err(TokenError::BadSignature)
        );
        assert_eq!(
            codec.check_at("resource", 1, token.expiry, "", NOW),
            Err(TokenError::BadSignature)
        );

        let other = TokenCodec::new(b"other-secret", SignatureScope::ResourceSizeExpiry).unwrap();
        assert_eq!(
            other.check_at("resource", 1, token.expiry, &token.signature, NOW),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_random_codecs_do_not_share_secrets() {
        let first = TokenCodec::random(SignatureScope::default()).unwrap();
        let second = TokenCodec::random(SignatureScope::default()).unwrap();
        let token = first.issue("resource", 1, TTL);

        assert!(first.verify("resource", 1, token.expiry, &token.signature));
        assert!(!second.verify("resource", 1, token.expiry, &token.signature));
    }

    #[test]
    fn test_query_encodes_resource_id() {
        let codec = codec(SignatureScope::ResourceSizeExpiry);
        let token = codec.issue_at("a b/c&d", 42, TTL, NOW);

        assert_eq!(
            token.to_query(),
            format!(
                "resource_id=a%20b%2Fc%26d&size=42&token={}&exp={}",
                token.signature,
                NOW + 3600
            )
        );
    }
}
