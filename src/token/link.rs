use crate::token::codec::TokenCodec;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A stream link handed to the notification front-end.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuedLink {
    pub url: String,
    pub token: String,
    pub expires_at: u64,
}

/// Mints stream links with a fixed lifetime.
#[derive(Clone)]
pub struct LinkIssuer {
    codec: TokenCodec,
    base_url: String,
    ttl: Duration,
}

impl LinkIssuer {
    pub fn new(codec: TokenCodec, base_url: &str, ttl: Duration) -> Self {
        Self {
            codec,
            base_url: base_url.trim_end_matches('/').to_string(),
            ttl,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn issue_link(&self, resource_id: &str, size: u64) -> IssuedLink {
        self.issue_named_link(resource_id, size, None)
    }

    /// Like [`issue_link`](Self::issue_link), with a display file name appended.
    /// The name is not signed; it only picks the content type and disposition.
    pub fn issue_named_link(&self, resource_id: &str, size: u64, name: Option<&str>) -> IssuedLink {
        let token = self.codec.issue(resource_id, size, self.ttl);

        let mut url = format!("{}/stream?{}", self.base_url, token.to_query());
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            url.push_str("&name=");
            url.extend(utf8_percent_encode(name, NON_ALPHANUMERIC));
        }

        IssuedLink {
            url,
            token: token.signature,
            expires_at: token.expiry,
        }
    }
}
