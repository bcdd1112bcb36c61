use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    Valid,
    Invalid,
}

/// HMAC-SHA256 check of a raw request body against `sha256=<hex>` signatures.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Arc<[u8]>,
}

impl fmt::Debug for SignatureVerifier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SignatureVerifier")
            .field("secret", &"***")
            .finish()
    }
}

impl SignatureVerifier {
    /// # Errors
    /// Returns an error if `secret` is empty.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            bail!("webhook secret must not be empty");
        }

        Ok(Self {
            secret: Arc::from(secret.as_bytes()),
        })
    }

    /// A missing, malformed, or mismatching header is `Invalid`. The comparison runs in
    /// constant time.
    #[must_use]
    pub fn verify(&self, body: &[u8], signature_header: Option<&str>) -> SignatureStatus {
        let Some(provided) = signature_header
            .map(str::trim)
            .and_then(|header| header.strip_prefix(SIGNATURE_PREFIX))
        else {
            return SignatureStatus::Invalid;
        };

        let Ok(provided_bytes) = hex::decode(provided) else {
            return SignatureStatus::Invalid;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return SignatureStatus::Invalid;
        };
        mac.update(body);

        match mac.verify_slice(&provided_bytes) {
            Ok(()) => SignatureStatus::Valid,
            Err(_) => SignatureStatus::Invalid,
        }
    }

    /// Header value a sender holding the same secret would attach to `body`.
    #[cfg(test)]
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> String {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return String::new();
        };
        mac.update(body);
        format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
    }
}
