//! Provider webhook intake
//!
//! Both endpoints take the body as the raw string the provider signed.
//! Parsing happens after verification, inside the billing pipeline, so a
//! reformatted body can never pass signature checks.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;

use billhook_billing::DeliveryReport;
use billhook_shared::PaymentProvider;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";
const GOCARDLESS_SIGNATURE_HEADER: &str = "webhook-signature";

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<DeliveryReport>> {
    let signature = signature_header(&headers, STRIPE_SIGNATURE_HEADER)?;
    let report = state
        .billing
        .webhooks
        .handle_delivery(PaymentProvider::Stripe, &body, signature)
        .await?;
    Ok(Json(report))
}

pub async fn gocardless_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<DeliveryReport>> {
    let signature = signature_header(&headers, GOCARDLESS_SIGNATURE_HEADER)?;
    let report = state
        .billing
        .webhooks
        .handle_delivery(PaymentProvider::GoCardless, &body, signature)
        .await?;
    Ok(Json(report))
}

/// A missing or non-ASCII signature header is a verification failure, not
/// a malformed request: the delivery cannot be authenticated.
fn signature_header<'h>(headers: &'h HeaderMap, name: &str) -> Result<&'h str, ApiError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn missing_signature_header_is_unauthorized() {
        let headers = HeaderMap::new();
        assert!(matches!(
            signature_header(&headers, STRIPE_SIGNATURE_HEADER),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("Stripe-Signature", HeaderValue::from_static("t=1,v1=abc"));
        assert_eq!(
            signature_header(&headers, STRIPE_SIGNATURE_HEADER).ok(),
            Some("t=1,v1=abc")
        );
    }

    #[test]
    fn non_ascii_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Webhook-Signature",
            HeaderValue::from_bytes(&[0xff, 0xfe]).unwrap(),
        );
        assert!(signature_header(&headers, GOCARDLESS_SIGNATURE_HEADER).is_err());
    }
}
