//! Signature verification for webhooks pushed by the service.
//!
//! Each webhook carries a hex HMAC-SHA256 of the raw body, keyed with the
//! secret configured on the output.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verifies webhook signatures for one shared secret.
#[derive(Clone)]
pub struct Webhook {
    secret: Vec<u8>,
}

impl Webhook {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Whether `signature` (lowercase or uppercase hex) is the HMAC of `body`.
    ///
    /// The comparison is constant-time.
    pub fn is_signature_valid(&self, body: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }

    /// Hex signature for `body`; what the service sends alongside it.
    pub fn sign(&self, body: &[u8]) -> String {
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mut mac) => {
                mac.update(body);
                hex::encode(mac.finalize().into_bytes())
            }
            // HMAC accepts keys of any length.
            Err(_) => String::new(),
        }
    }
}

impl std::fmt::Debug for Webhook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Webhook").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let hook = Webhook::new("Jefe");
        let sig = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";
        assert!(hook.is_signature_valid(b"what do ya want for nothing?", sig));
        assert_eq!(hook.sign(b"what do ya want for nothing?"), sig);
    }

    #[test]
    fn tampered_body_is_rejected() {
        let hook = Webhook::new("s3cret");
        let sig = hook.sign(br#"{"detect":"x"}"#);
        assert!(hook.is_signature_valid(br#"{"detect":"x"}"#, &sig));
        assert!(!hook.is_signature_valid(br#"{"detect":"y"}"#, &sig));
    }

    #[test]
    fn uppercase_hex_accepted_and_garbage_rejected() {
        let hook = Webhook::new("k");
        let sig = hook.sign(b"body").to_uppercase();
        assert!(hook.is_signature_valid(b"body", &sig));
        assert!(!hook.is_signature_valid(b"body", "not-hex"));
        assert!(!hook.is_signature_valid(b"body", ""));
    }
}
