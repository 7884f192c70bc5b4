//! Provider event envelopes
//!
//! Parses each provider's native webhook JSON into the normalized
//! [`ProviderEvent`] the rest of the pipeline consumes, and collapses
//! provider-specific event names into a small category enum so the state
//! machine stays provider-agnostic. Stripe delivers one event per request;
//! GoCardless batches several under `{"events": [...]}`.

use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use billhook_shared::PaymentProvider;

use crate::error::{BillingError, BillingResult};

/// Provider-agnostic effect of an event on subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    /// Payment authorization established (mandate active, subscription
    /// created with a live status).
    AuthorizationActivated,
    /// A charge settled.
    PaymentConfirmed,
    /// A charge failed.
    PaymentFailed,
    /// Subscription or its authorization ended, from either side.
    SubscriptionCancelled,
    /// Checkout/session completion: attaches provider references to the
    /// account without itself changing status.
    SubscriptionLinked,
}

impl EventCategory {
    pub fn reason_code(&self) -> &'static str {
        match self {
            EventCategory::AuthorizationActivated => "authorization_activated",
            EventCategory::PaymentConfirmed => "payment_confirmed",
            EventCategory::PaymentFailed => "payment_failed",
            EventCategory::SubscriptionCancelled => "subscription_cancelled",
            EventCategory::SubscriptionLinked => "subscription_linked",
        }
    }
}

/// One provider notification, normalized. `category` is `None` for event
/// types we acknowledge but do not act on.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub provider: PaymentProvider,
    pub external_id: String,
    pub event_type: String,
    pub category: Option<EventCategory>,
    /// Provider-assigned creation time, the ordering authority for the
    /// stale-event guard.
    pub occurred_at: OffsetDateTime,
    pub account_hint: Option<Uuid>,
    pub customer_ref: Option<String>,
    pub subscription_ref: Option<String>,
    pub mandate_ref: Option<String>,
    pub payment_ref: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    /// Non-sensitive excerpt stored on the ledger row.
    pub summary: Value,
}

/// Parse a verified webhook body into normalized events.
pub fn parse_events(provider: PaymentProvider, payload: &str) -> BillingResult<Vec<ProviderEvent>> {
    match provider {
        PaymentProvider::Stripe => parse_stripe(payload).map(|event| vec![event]),
        PaymentProvider::GoCardless => parse_gocardless(payload),
    }
}

// =============================================================================
// Stripe
// =============================================================================

#[derive(Debug, Deserialize)]
struct StripeEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created: i64,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: Value,
}

/// Map a Stripe event name to its category. `customer.subscription.updated`
/// is the one name whose effect depends on the embedded subscription
/// status, so the mapping takes that as a hint.
pub fn stripe_category(event_type: &str, status_hint: Option<&str>) -> Option<EventCategory> {
    match event_type {
        "checkout.session.completed" => Some(EventCategory::SubscriptionLinked),
        "customer.subscription.created" => Some(EventCategory::AuthorizationActivated),
        "invoice.paid" | "invoice.payment_succeeded" => Some(EventCategory::PaymentConfirmed),
        "invoice.payment_failed" => Some(EventCategory::PaymentFailed),
        "customer.subscription.deleted" => Some(EventCategory::SubscriptionCancelled),
        "customer.subscription.updated" => match status_hint {
            Some("canceled") | Some("incomplete_expired") => {
                Some(EventCategory::SubscriptionCancelled)
            }
            Some("past_due") | Some("unpaid") => Some(EventCategory::PaymentFailed),
            Some("active") | Some("trialing") => Some(EventCategory::AuthorizationActivated),
            _ => None,
        },
        _ => None,
    }
}

fn parse_stripe(payload: &str) -> BillingResult<ProviderEvent> {
    let envelope: StripeEnvelope = serde_json::from_str(payload)?;
    let object = &envelope.data.object;

    let occurred_at = OffsetDateTime::from_unix_timestamp(envelope.created).map_err(|_| {
        BillingError::InvalidPayload(format!(
            "event {} has unrepresentable created timestamp {}",
            envelope.id, envelope.created
        ))
    })?;

    let status_hint = object.get("status").and_then(Value::as_str);
    let category = stripe_category(&envelope.event_type, status_hint);

    let account_hint = object
        .get("metadata")
        .and_then(|m| m.get("account_id"))
        .and_then(Value::as_str)
        .or_else(|| object.get("client_reference_id").and_then(Value::as_str))
        .and_then(|s| Uuid::parse_str(s).ok());

    let customer_ref = object.get("customer").and_then(expandable_id);

    // Subscription objects carry the reference as their own id; invoices
    // and checkout sessions point at it.
    let subscription_ref = if envelope.event_type.starts_with("customer.subscription.") {
        object.get("id").and_then(Value::as_str).map(str::to_string)
    } else {
        object.get("subscription").and_then(expandable_id)
    };

    let payment_ref = if envelope.event_type.starts_with("invoice.") {
        object.get("id").and_then(Value::as_str).map(str::to_string)
    } else {
        None
    };

    let amount_cents = object.get("amount_paid").and_then(Value::as_i64);
    let currency = object
        .get("currency")
        .and_then(Value::as_str)
        .map(str::to_string);

    let summary = json!({
        "object": object.get("object"),
        "status": status_hint,
        "customer": customer_ref,
        "subscription": subscription_ref,
        "payment": payment_ref,
        "amount_paid": amount_cents,
        "currency": currency,
    });

    Ok(ProviderEvent {
        provider: PaymentProvider::Stripe,
        external_id: envelope.id,
        event_type: envelope.event_type,
        category,
        occurred_at,
        account_hint,
        customer_ref,
        subscription_ref,
        mandate_ref: None,
        payment_ref,
        amount_cents,
        currency,
        summary,
    })
}

/// Stripe expandable fields are either a bare id string or an object with
/// an `id` field, depending on the event's expansion settings.
fn expandable_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

// =============================================================================
// GoCardless
// =============================================================================

#[derive(Debug, Deserialize)]
struct GoCardlessEnvelope {
    events: Vec<GoCardlessEvent>,
}

#[derive(Debug, Deserialize)]
struct GoCardlessEvent {
    id: String,
    created_at: String,
    resource_type: String,
    action: String,
    #[serde(default)]
    links: GoCardlessLinks,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Default, Deserialize)]
struct GoCardlessLinks {
    mandate: Option<String>,
    subscription: Option<String>,
    customer: Option<String>,
    payment: Option<String>,
}

pub fn gocardless_category(resource_type: &str, action: &str) -> Option<EventCategory> {
    match (resource_type, action) {
        ("mandates", "active") | ("mandates", "reinstated") => {
            Some(EventCategory::AuthorizationActivated)
        }
        ("mandates", "cancelled") | ("mandates", "expired") | ("mandates", "failed") => {
            Some(EventCategory::SubscriptionCancelled)
        }
        ("payments", "confirmed") | ("payments", "paid_out") => {
            Some(EventCategory::PaymentConfirmed)
        }
        ("payments", "failed") => Some(EventCategory::PaymentFailed),
        ("subscriptions", "cancelled") | ("subscriptions", "finished") => {
            Some(EventCategory::SubscriptionCancelled)
        }
        ("subscriptions", "created") => Some(EventCategory::SubscriptionLinked),
        ("billing_requests", "fulfilled") => Some(EventCategory::SubscriptionLinked),
        _ => None,
    }
}

fn parse_gocardless(payload: &str) -> BillingResult<Vec<ProviderEvent>> {
    let envelope: GoCardlessEnvelope = serde_json::from_str(payload)?;
    if envelope.events.is_empty() {
        return Err(BillingError::InvalidPayload(
            "gocardless envelope contains no events".to_string(),
        ));
    }

    envelope.events.into_iter().map(normalize_gocardless).collect()
}

fn normalize_gocardless(event: GoCardlessEvent) -> BillingResult<ProviderEvent> {
    let occurred_at = OffsetDateTime::parse(&event.created_at, &Rfc3339).map_err(|_| {
        BillingError::InvalidPayload(format!(
            "event {} has unparseable created_at {:?}",
            event.id, event.created_at
        ))
    })?;

    let category = gocardless_category(&event.resource_type, &event.action);
    let event_type = format!("{}.{}", event.resource_type, event.action);

    let account_hint = event
        .metadata
        .get("account_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());

    let summary = json!({
        "resource_type": event.resource_type,
        "action": event.action,
        "mandate": event.links.mandate,
        "subscription": event.links.subscription,
        "customer": event.links.customer,
        "payment": event.links.payment,
    });

    Ok(ProviderEvent {
        provider: PaymentProvider::GoCardless,
        external_id: event.id,
        event_type,
        category,
        occurred_at,
        account_hint,
        customer_ref: event.links.customer,
        subscription_ref: event.links.subscription,
        mandate_ref: event.links.mandate,
        payment_ref: event.links.payment,
        // GoCardless events carry links only; amounts would require an API
        // read we deliberately do not make.
        amount_cents: None,
        currency: None,
        summary,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // =========================================================================
    // Category mappings
    // =========================================================================

    #[test]
    fn stripe_event_names_map_to_categories() {
        assert_eq!(
            stripe_category("checkout.session.completed", None),
            Some(EventCategory::SubscriptionLinked)
        );
        assert_eq!(
            stripe_category("customer.subscription.created", Some("incomplete")),
            Some(EventCategory::AuthorizationActivated)
        );
        assert_eq!(
            stripe_category("invoice.paid", None),
            Some(EventCategory::PaymentConfirmed)
        );
        assert_eq!(
            stripe_category("invoice.payment_failed", None),
            Some(EventCategory::PaymentFailed)
        );
        assert_eq!(
            stripe_category("customer.subscription.deleted", Some("canceled")),
            Some(EventCategory::SubscriptionCancelled)
        );
        assert_eq!(stripe_category("charge.refunded", None), None);
        assert_eq!(stripe_category("payment_intent.created", None), None);
    }

    #[test]
    fn stripe_subscription_updated_follows_the_status_hint() {
        let map = |hint| stripe_category("customer.subscription.updated", hint);
        assert_eq!(map(Some("active")), Some(EventCategory::AuthorizationActivated));
        assert_eq!(map(Some("trialing")), Some(EventCategory::AuthorizationActivated));
        assert_eq!(map(Some("past_due")), Some(EventCategory::PaymentFailed));
        assert_eq!(map(Some("unpaid")), Some(EventCategory::PaymentFailed));
        assert_eq!(map(Some("canceled")), Some(EventCategory::SubscriptionCancelled));
        assert_eq!(map(Some("incomplete")), None);
        assert_eq!(map(None), None);
    }

    #[test]
    fn gocardless_resource_actions_map_to_categories() {
        assert_eq!(
            gocardless_category("mandates", "active"),
            Some(EventCategory::AuthorizationActivated)
        );
        assert_eq!(
            gocardless_category("mandates", "cancelled"),
            Some(EventCategory::SubscriptionCancelled)
        );
        assert_eq!(
            gocardless_category("payments", "confirmed"),
            Some(EventCategory::PaymentConfirmed)
        );
        assert_eq!(
            gocardless_category("payments", "failed"),
            Some(EventCategory::PaymentFailed)
        );
        assert_eq!(
            gocardless_category("subscriptions", "cancelled"),
            Some(EventCategory::SubscriptionCancelled)
        );
        assert_eq!(
            gocardless_category("billing_requests", "fulfilled"),
            Some(EventCategory::SubscriptionLinked)
        );
        assert_eq!(gocardless_category("payouts", "paid"), None);
        assert_eq!(gocardless_category("refunds", "created"), None);
    }

    // =========================================================================
    // Stripe envelope parsing
    // =========================================================================

    #[test]
    fn parses_stripe_invoice_paid() {
        let payload = r#"{
            "id": "evt_1AbC",
            "type": "invoice.paid",
            "created": 1700000000,
            "data": {
                "object": {
                    "object": "invoice",
                    "id": "in_100",
                    "customer": "cus_42",
                    "subscription": "sub_42",
                    "amount_paid": 1900,
                    "currency": "eur",
                    "metadata": {"account_id": "6a3a4f7e-9a68-4cb8-93c1-d064f9b3a1f2"}
                }
            }
        }"#;

        let events = parse_events(PaymentProvider::Stripe, payload).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.external_id, "evt_1AbC");
        assert_eq!(event.category, Some(EventCategory::PaymentConfirmed));
        assert_eq!(event.occurred_at.unix_timestamp(), 1_700_000_000);
        assert_eq!(
            event.account_hint,
            Some(Uuid::parse_str("6a3a4f7e-9a68-4cb8-93c1-d064f9b3a1f2").unwrap())
        );
        assert_eq!(event.customer_ref.as_deref(), Some("cus_42"));
        assert_eq!(event.subscription_ref.as_deref(), Some("sub_42"));
        assert_eq!(event.payment_ref.as_deref(), Some("in_100"));
        assert_eq!(event.amount_cents, Some(1900));
    }

    #[test]
    fn parses_stripe_subscription_event_with_expanded_customer() {
        let payload = r#"{
            "id": "evt_2",
            "type": "customer.subscription.created",
            "created": 1700000100,
            "data": {
                "object": {
                    "object": "subscription",
                    "id": "sub_77",
                    "status": "active",
                    "customer": {"id": "cus_77", "object": "customer"},
                    "metadata": {}
                }
            }
        }"#;

        let event = &parse_events(PaymentProvider::Stripe, payload).unwrap()[0];
        assert_eq!(event.category, Some(EventCategory::AuthorizationActivated));
        assert_eq!(event.customer_ref.as_deref(), Some("cus_77"));
        assert_eq!(event.subscription_ref.as_deref(), Some("sub_77"));
        assert_eq!(event.account_hint, None);
        assert_eq!(event.payment_ref, None);
    }

    #[test]
    fn stripe_summary_excludes_unlisted_fields() {
        let payload = r#"{
            "id": "evt_3",
            "type": "invoice.paid",
            "created": 1700000000,
            "data": {
                "object": {
                    "object": "invoice",
                    "id": "in_1",
                    "customer_email": "user@example.com",
                    "customer_name": "A Person",
                    "amount_paid": 500
                }
            }
        }"#;

        let event = &parse_events(PaymentProvider::Stripe, payload).unwrap()[0];
        let rendered = event.summary.to_string();
        assert!(!rendered.contains("example.com"));
        assert!(!rendered.contains("A Person"));
        assert_eq!(event.summary["amount_paid"], 500);
    }

    #[test]
    fn malformed_stripe_payload_is_an_invalid_payload_error() {
        assert!(parse_events(PaymentProvider::Stripe, "{not json").is_err());
        // Structurally valid JSON missing the envelope fields also fails.
        assert!(parse_events(PaymentProvider::Stripe, r#"{"id": "evt_1"}"#).is_err());
    }

    // =========================================================================
    // GoCardless envelope parsing
    // =========================================================================

    #[test]
    fn parses_gocardless_batch_in_order() {
        let payload = r#"{
            "events": [
                {
                    "id": "EV001",
                    "created_at": "2024-11-14T16:00:00.000Z",
                    "resource_type": "payments",
                    "action": "confirmed",
                    "links": {"payment": "PM123", "mandate": "MD123", "customer": "CU123"}
                },
                {
                    "id": "EV002",
                    "created_at": "2024-11-14T16:00:05.000Z",
                    "resource_type": "mandates",
                    "action": "cancelled",
                    "links": {"mandate": "MD123"}
                }
            ]
        }"#;

        let events = parse_events(PaymentProvider::GoCardless, payload).unwrap();
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].external_id, "EV001");
        assert_eq!(events[0].event_type, "payments.confirmed");
        assert_eq!(events[0].category, Some(EventCategory::PaymentConfirmed));
        assert_eq!(events[0].payment_ref.as_deref(), Some("PM123"));
        assert_eq!(events[0].customer_ref.as_deref(), Some("CU123"));
        assert_eq!(events[0].amount_cents, None);

        assert_eq!(events[1].event_type, "mandates.cancelled");
        assert_eq!(events[1].category, Some(EventCategory::SubscriptionCancelled));
        assert_eq!(events[1].mandate_ref.as_deref(), Some("MD123"));
        assert!(events[1].occurred_at > events[0].occurred_at);
    }

    #[test]
    fn gocardless_metadata_account_hint_is_honored() {
        let payload = r#"{
            "events": [{
                "id": "EV010",
                "created_at": "2024-11-14T16:00:00.000Z",
                "resource_type": "billing_requests",
                "action": "fulfilled",
                "links": {"customer": "CU900"},
                "metadata": {"account_id": "0b40d2a4-6f0a-44ab-9c18-13af9b234d6a"}
            }]
        }"#;

        let event = &parse_events(PaymentProvider::GoCardless, payload).unwrap()[0];
        assert_eq!(event.category, Some(EventCategory::SubscriptionLinked));
        assert_eq!(
            event.account_hint,
            Some(Uuid::parse_str("0b40d2a4-6f0a-44ab-9c18-13af9b234d6a").unwrap())
        );
    }

    #[test]
    fn empty_gocardless_envelope_is_rejected() {
        assert!(parse_events(PaymentProvider::GoCardless, r#"{"events": []}"#).is_err());
        assert!(parse_events(PaymentProvider::GoCardless, r#"{}"#).is_err());
    }

    #[test]
    fn gocardless_bad_timestamp_is_rejected() {
        let payload = r#"{
            "events": [{
                "id": "EV011",
                "created_at": "yesterday",
                "resource_type": "payments",
                "action": "confirmed",
                "links": {}
            }]
        }"#;
        assert!(parse_events(PaymentProvider::GoCardless, payload).is_err());
    }

    #[test]
    fn unhandled_event_types_parse_with_no_category() {
        let payload = r#"{
            "id": "evt_9",
            "type": "charge.refunded",
            "created": 1700000000,
            "data": {"object": {"object": "charge", "id": "ch_1"}}
        }"#;
        let event = &parse_events(PaymentProvider::Stripe, payload).unwrap()[0];
        assert_eq!(event.category, None);
        assert_eq!(event.event_type, "charge.refunded");
    }
}
