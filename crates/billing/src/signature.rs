//! Webhook signature verification
//!
//! Both providers sign with HMAC-SHA256 but over different inputs: Stripe
//! signs `"{timestamp}.{body}"` and carries the timestamp in the header
//! (replay protection), GoCardless signs the raw body alone. Verification
//! failures collapse to `false`; callers reject with 401 and never reveal
//! which step failed.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use billhook_shared::PaymentProvider;

use crate::config::BillingConfig;

type HmacSha256 = Hmac<Sha256>;

/// Tolerated clock skew for the timestamped Stripe scheme (5 minutes).
const STRIPE_TIMESTAMP_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct SignatureVerifier {
    stripe_secret: String,
    gocardless_secret: String,
}

impl SignatureVerifier {
    pub fn new(config: &BillingConfig) -> Self {
        Self {
            stripe_secret: config.stripe_webhook_secret.clone(),
            gocardless_secret: config.gocardless_webhook_secret.clone(),
        }
    }

    /// Verify a raw request body against the provider's signature header.
    pub fn verify(&self, provider: PaymentProvider, payload: &str, signature: &str) -> bool {
        let valid = match provider {
            PaymentProvider::Stripe => self.verify_stripe_at(
                payload,
                signature,
                OffsetDateTime::now_utc().unix_timestamp(),
            ),
            PaymentProvider::GoCardless => self.verify_gocardless(payload, signature),
        };

        if !valid {
            tracing::warn!(
                provider = %provider,
                payload_len = payload.len(),
                signature_len = signature.len(),
                "Webhook signature verification failed"
            );
        }

        valid
    }

    /// Stripe scheme: header `t=<unix>,v1=<hex>[,v0=...]`, signed payload
    /// `"{t}.{body}"`, secret with its `whsec_` prefix stripped.
    fn verify_stripe_at(&self, payload: &str, signature: &str, now: i64) -> bool {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.trim().splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1]),
                    _ => {}
                }
            }
        }

        let (Some(timestamp), Some(v1_signature)) = (timestamp, v1_signature) else {
            return false;
        };

        if (now - timestamp).abs() > STRIPE_TIMESTAMP_TOLERANCE_SECS {
            tracing::warn!(
                timestamp,
                now,
                diff = (now - timestamp).abs(),
                "Stripe webhook timestamp outside tolerance"
            );
            return false;
        }

        let secret_key = self
            .stripe_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.stripe_secret);
        let signed_payload = format!("{timestamp}.{payload}");

        let Some(computed) = hmac_sha256_hex(secret_key, &signed_payload) else {
            return false;
        };

        bool::from(computed.as_bytes().ct_eq(v1_signature.as_bytes()))
    }

    /// GoCardless scheme: hex HMAC of the raw body. The comparison is
    /// substring-tolerant so headers carrying a scheme prefix (e.g.
    /// `sha256=<hex>`) still verify.
    fn verify_gocardless(&self, payload: &str, signature: &str) -> bool {
        let Some(computed) = hmac_sha256_hex(&self.gocardless_secret, payload) else {
            return false;
        };

        if signature.len() == computed.len() {
            return bool::from(computed.as_bytes().ct_eq(signature.as_bytes()));
        }

        signature.contains(computed.as_str())
    }
}

fn hmac_sha256_hex(secret: &str, message: &str) -> Option<String> {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => {
            tracing::error!("Webhook secret rejected by HMAC key schedule");
            return None;
        }
    };
    mac.update(message.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier {
            stripe_secret: "whsec_test_secret_key".to_string(),
            gocardless_secret: "gc_endpoint_secret".to_string(),
        }
    }

    fn stripe_header(secret: &str, timestamp: i64, payload: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed = format!("{timestamp}.{payload}");
        let sig = hmac_sha256_hex(key, &signed).unwrap();
        format!("t={timestamp},v1={sig}")
    }

    fn gocardless_digest(secret: &str, payload: &str) -> String {
        hmac_sha256_hex(secret, payload).unwrap()
    }

    // =========================================================================
    // Stripe scheme
    // =========================================================================

    #[test]
    fn stripe_valid_signature_accepted() {
        let v = verifier();
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let now = 1_700_000_000;
        let header = stripe_header("whsec_test_secret_key", now, payload);
        assert!(v.verify_stripe_at(payload, &header, now));
    }

    #[test]
    fn stripe_skew_within_tolerance_accepted() {
        let v = verifier();
        let payload = "{}";
        let now = 1_700_000_000;
        let header = stripe_header("whsec_test_secret_key", now - 299, payload);
        assert!(v.verify_stripe_at(payload, &header, now));
    }

    #[test]
    fn stripe_timestamp_outside_tolerance_rejected() {
        let v = verifier();
        let payload = "{}";
        let now = 1_700_000_000;
        let header = stripe_header("whsec_test_secret_key", now - 301, payload);
        assert!(!v.verify_stripe_at(payload, &header, now));
    }

    #[test]
    fn stripe_wrong_secret_rejected() {
        let v = verifier();
        let payload = "{}";
        let now = 1_700_000_000;
        let header = stripe_header("whsec_other_secret", now, payload);
        assert!(!v.verify_stripe_at(payload, &header, now));
    }

    #[test]
    fn stripe_tampered_payload_rejected() {
        let v = verifier();
        let now = 1_700_000_000;
        let header = stripe_header("whsec_test_secret_key", now, r#"{"amount":100}"#);
        assert!(!v.verify_stripe_at(r#"{"amount":999}"#, &header, now));
    }

    #[test]
    fn stripe_missing_v1_rejected() {
        let v = verifier();
        assert!(!v.verify_stripe_at("{}", "t=1700000000", 1_700_000_000));
    }

    #[test]
    fn stripe_garbage_header_rejected() {
        let v = verifier();
        assert!(!v.verify_stripe_at("{}", "not-a-signature", 1_700_000_000));
        assert!(!v.verify_stripe_at("{}", "", 1_700_000_000));
    }

    // =========================================================================
    // GoCardless scheme
    // =========================================================================

    #[test]
    fn gocardless_exact_digest_accepted() {
        let v = verifier();
        let payload = r#"{"events":[]}"#;
        let digest = gocardless_digest("gc_endpoint_secret", payload);
        assert!(v.verify_gocardless(payload, &digest));
    }

    #[test]
    fn gocardless_scheme_prefixed_digest_accepted() {
        let v = verifier();
        let payload = r#"{"events":[{"id":"EV123"}]}"#;
        let digest = gocardless_digest("gc_endpoint_secret", payload);
        assert!(v.verify_gocardless(payload, &format!("sha256={digest}")));
    }

    #[test]
    fn gocardless_wrong_digest_rejected() {
        let v = verifier();
        let payload = r#"{"events":[]}"#;
        let digest = gocardless_digest("some_other_secret", payload);
        assert!(!v.verify_gocardless(payload, &digest));
    }

    #[test]
    fn gocardless_empty_or_short_header_rejected() {
        let v = verifier();
        assert!(!v.verify_gocardless(r#"{"events":[]}"#, ""));
        assert!(!v.verify_gocardless(r#"{"events":[]}"#, "abc123"));
    }

    #[test]
    fn provider_dispatch_uses_the_right_scheme() {
        let v = verifier();
        let payload = r#"{"events":[]}"#;
        let gc_digest = gocardless_digest("gc_endpoint_secret", payload);
        // A GoCardless digest presented to the Stripe scheme must not pass.
        assert!(!v.verify_stripe_at(payload, &gc_digest, 1_700_000_000));
        assert!(v.verify_gocardless(payload, &gc_digest));
    }
}
