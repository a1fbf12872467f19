//! Stripe PaymentIntents with the PIX payment method.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    header_str, hmac_sha256_matches, parse_signature_header, send_with_backoff, NewPixPayment,
    PaymentProvider, PaymentUpdate, PixCheckout, ProviderEvent, ProviderPayment,
};
use crate::config::ProviderConfig;
use crate::errors::{LedgerError, Result};
use crate::models::ProviderKind;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Webhook event envelope; only the fields reconciliation needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeEventData {
    pub object: StripeObject,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StripeObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl StripeEvent {
    /// The payment and status this event reports, if it concerns a
    /// PaymentIntent at all.
    pub fn payment_update(&self) -> Option<PaymentUpdate> {
        let raw_status = match self.event_type.as_str() {
            "payment_intent.succeeded" => "succeeded".to_string(),
            "payment_intent.payment_failed" => "failed".to_string(),
            "payment_intent.canceled" => "canceled".to_string(),
            t if t.starts_with("payment_intent.") => self.data.object.status.clone()?,
            _ => return None,
        };
        Some(PaymentUpdate::new(self.data.object.id.clone(), raw_status))
    }
}

/// Verify a `Stripe-Signature` header against the raw request body.
///
/// The signed payload is `"{t}.{body}"`; any `v1` entry may match. Events
/// older or newer than `tolerance_secs` are refused to block replays.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<()> {
    let parts = parse_signature_header(header);
    let timestamp = parts
        .iter()
        .find(|(k, _)| *k == "t")
        .and_then(|(_, v)| v.parse::<i64>().ok())
        .ok_or_else(|| LedgerError::InvalidSignature("missing timestamp".into()))?;

    let skew = now.timestamp().checked_sub(timestamp).map(i64::unsigned_abs);
    if !matches!(skew, Some(s) if s <= tolerance_secs.unsigned_abs()) {
        return Err(LedgerError::InvalidSignature(
            "timestamp outside tolerance".into(),
        ));
    }

    let mut signed = Vec::with_capacity(body.len() + 12);
    signed.extend_from_slice(timestamp.to_string().as_bytes());
    signed.push(b'.');
    signed.extend_from_slice(body);

    let matched = parts
        .iter()
        .filter(|(k, _)| *k == "v1")
        .any(|(_, sig)| hmac_sha256_matches(secret, &signed, sig));

    if matched {
        Ok(())
    } else {
        Err(LedgerError::InvalidSignature("no matching v1 signature".into()))
    }
}

pub struct StripeClient {
    client: Client,
    api_url: String,
    secret_key: String,
    webhook_secret: String,
    tolerance_secs: i64,
}

impl StripeClient {
    pub fn new(client: Client, config: &ProviderConfig, tolerance_secs: i64) -> Self {
        StripeClient {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            secret_key: config.api_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
            tolerance_secs,
        }
    }
}

/// PIX QR details Stripe attaches while a PaymentIntent awaits payment.
fn pix_details(intent: &Value) -> Value {
    let qr = &intent["next_action"]["pix_display_qr_code"];
    if intent["status"] != "requires_action" || qr.is_null() {
        return Value::Null;
    }
    json!({
        "qrCode": qr["hosted_voucher_url"],
        "pixCode": qr["data"],
        "expiresAt": qr["expires_at"],
    })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

#[async_trait]
impl PaymentProvider for StripeClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    fn authenticate_event(&self, body: &[u8], headers: &HeaderMap) -> Result<ProviderEvent> {
        let header = header_str(headers, SIGNATURE_HEADER)
            .ok_or_else(|| LedgerError::InvalidSignature("missing Stripe-Signature".into()))?;
        verify_signature(
            &self.webhook_secret,
            header,
            body,
            Utc::now(),
            self.tolerance_secs,
        )?;
        let event: StripeEvent = serde_json::from_slice(body)
            .map_err(|e| LedgerError::BadRequest(format!("Stripe event: {e}")))?;
        Ok(ProviderEvent::Stripe(event))
    }

    async fn get_payment_status(&self, payment_id: &str) -> Result<ProviderPayment> {
        let url = format!("{}/v1/payment_intents/{payment_id}", self.api_url);
        let intent = send_with_backoff("Stripe payment lookup", || {
            self.client.get(&url).bearer_auth(&self.secret_key)
        })
        .await?;

        let raw_status = string_field(&intent, "status")
            .ok_or_else(|| LedgerError::Provider("Stripe intent without status".into()))?;
        debug!(payment_id, status = %raw_status, "Fetched Stripe PaymentIntent");

        Ok(ProviderPayment {
            id: string_field(&intent, "id").unwrap_or_else(|| payment_id.to_string()),
            details: json!({ "pixDetails": pix_details(&intent) }),
            raw_status,
        })
    }

    async fn create_pix_payment(&self, payment: &NewPixPayment) -> Result<PixCheckout> {
        let url = format!("{}/v1/payment_intents", self.api_url);
        let form = [
            ("amount", payment.amount_cents.to_string()),
            ("currency", "brl".to_string()),
            ("payment_method_types[]", "pix".to_string()),
            ("payment_method_data[type]", "pix".to_string()),
            ("confirm", "true".to_string()),
            ("description", payment.description.clone()),
            ("receipt_email", payment.payer_email.clone()),
            ("metadata[ecopoint_id]", payment.ecopoint_id.clone()),
            ("metadata[user_id]", payment.donor_id.clone()),
        ];

        // Idempotency-Key makes the retry loop safe for a POST.
        let intent = send_with_backoff("Stripe payment creation", || {
            self.client
                .post(&url)
                .bearer_auth(&self.secret_key)
                .header("Idempotency-Key", &payment.idempotency_key)
                .form(&form)
        })
        .await?;

        let payment_id = string_field(&intent, "id")
            .ok_or_else(|| LedgerError::Provider("Stripe intent without id".into()))?;
        let qr = &intent["next_action"]["pix_display_qr_code"];
        let expires_at = qr["expires_at"]
            .as_i64()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .map(|dt| dt.to_rfc3339());

        Ok(PixCheckout {
            payment_id,
            qr_code: string_field(qr, "data"),
            qr_code_base64: None,
            ticket_url: string_field(qr, "hosted_voucher_url"),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{hmac_sha256_hex, MappedStatus};
    use mockito::{Matcher, Server};

    const SECRET: &str = "whsec_test";

    fn sign(body: &str, ts: i64) -> String {
        let sig = hmac_sha256_hex(SECRET, format!("{ts}.{body}").as_bytes());
        format!("t={ts},v1={sig}")
    }

    fn event(event_type: &str, status: Option<&str>) -> StripeEvent {
        StripeEvent {
            id: "evt_1".into(),
            event_type: event_type.into(),
            data: StripeEventData {
                object: StripeObject {
                    id: "pi_123".into(),
                    status: status.map(String::from),
                },
            },
        }
    }

    #[test]
    fn valid_signature_is_accepted() {
        let now = Utc::now();
        let body = r#"{"id":"evt_1"}"#;
        let header = sign(body, now.timestamp());
        verify_signature(SECRET, &header, body.as_bytes(), now, 300).unwrap();
    }

    #[test]
    fn any_v1_may_match() {
        let now = Utc::now();
        let body = r#"{"id":"evt_1"}"#;
        let good = sign(body, now.timestamp());
        let header = format!("t={},v1=00ff,{}", now.timestamp(), good.split_once(',').unwrap().1);
        verify_signature(SECRET, &header, body.as_bytes(), now, 300).unwrap();
    }

    #[test]
    fn tampered_body_is_rejected() {
        let now = Utc::now();
        let header = sign(r#"{"id":"evt_1"}"#, now.timestamp());
        let err = verify_signature(SECRET, &header, br#"{"id":"evt_2"}"#, now, 300).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature(_)));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let now = Utc::now();
        let body = r#"{"id":"evt_1"}"#;
        let header = sign(body, now.timestamp() - 301);
        let err = verify_signature(SECRET, &header, body.as_bytes(), now, 300).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature(_)));
    }

    #[test]
    fn extreme_timestamps_are_rejected() {
        let now = Utc::now();
        for ts in [i64::MIN, i64::MAX, i64::MIN + 1] {
            let header = format!("t={ts},v1=00");
            let err = verify_signature(SECRET, &header, b"{}", now, 300).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidSignature(_)));
        }
    }

    #[test]
    fn header_without_timestamp_is_rejected() {
        let err = verify_signature(SECRET, "v1=abcd", b"{}", Utc::now(), 300).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature(_)));
    }

    #[test]
    fn event_types_map_to_statuses() {
        let succeeded = event("payment_intent.succeeded", Some("succeeded"))
            .payment_update()
            .unwrap();
        assert_eq!(succeeded.payment_id, "pi_123");
        assert_eq!(succeeded.status, MappedStatus::Completed);

        let failed = event("payment_intent.payment_failed", Some("requires_payment_method"))
            .payment_update()
            .unwrap();
        assert_eq!(failed.status, MappedStatus::Failed);

        let canceled = event("payment_intent.canceled", None).payment_update().unwrap();
        assert_eq!(canceled.status, MappedStatus::Failed);

        let action = event("payment_intent.requires_action", Some("requires_action"))
            .payment_update()
            .unwrap();
        assert_eq!(action.status, MappedStatus::Pending);

        assert!(event("charge.refunded", Some("succeeded"))
            .payment_update()
            .is_none());
    }

    #[test]
    fn authenticate_event_decodes_payload() {
        let config = ProviderConfig {
            api_url: "http://unused".into(),
            api_key: "sk_test".into(),
            webhook_secret: SECRET.into(),
        };
        let client = StripeClient::new(Client::new(), &config, 300);
        let body = r#"{"id":"evt_9","type":"payment_intent.succeeded","data":{"object":{"id":"pi_9","status":"succeeded","metadata":{}}}}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            sign(body, Utc::now().timestamp()).parse().unwrap(),
        );

        let ProviderEvent::Stripe(ev) = client
            .authenticate_event(body.as_bytes(), &headers)
            .unwrap()
        else {
            panic!("expected a Stripe event");
        };
        assert_eq!(ev.data.object.id, "pi_9");

        let err = client
            .authenticate_event(body.as_bytes(), &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn lookup_reports_pix_details_while_awaiting_payment() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v1/payment_intents/pi_123")
            .match_header("authorization", "Bearer sk_test")
            .with_status(200)
            .with_body(
                json!({
                    "id": "pi_123",
                    "status": "requires_action",
                    "next_action": {
                        "type": "pix_display_qr_code",
                        "pix_display_qr_code": {
                            "data": "00020126...",
                            "hosted_voucher_url": "https://pay.stripe.com/pix/1",
                            "expires_at": 1_700_000_000
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = ProviderConfig {
            api_url: server.url(),
            api_key: "sk_test".into(),
            webhook_secret: SECRET.into(),
        };
        let client = StripeClient::new(Client::new(), &config, 300);
        let payment = client.get_payment_status("pi_123").await.unwrap();
        assert_eq!(payment.raw_status, "requires_action");
        assert_eq!(payment.to_update().status, MappedStatus::Pending);
        assert_eq!(payment.details["pixDetails"]["pixCode"], "00020126...");
    }

    #[tokio::test]
    async fn create_sends_form_with_idempotency_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/payment_intents")
            .match_header("idempotency-key", "don-1")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("amount".into(), "1500".into()),
                Matcher::UrlEncoded("currency".into(), "brl".into()),
                Matcher::UrlEncoded("metadata[user_id]".into(), "donor-1".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({
                    "id": "pi_new",
                    "status": "requires_action",
                    "next_action": {
                        "pix_display_qr_code": {
                            "data": "pixcode",
                            "hosted_voucher_url": "https://voucher",
                            "expires_at": 1_700_000_000
                        }
                    }
                })
                .to_string(),
            )
            .create_async()
            .await;

        let config = ProviderConfig {
            api_url: server.url(),
            api_key: "sk_test".into(),
            webhook_secret: SECRET.into(),
        };
        let client = StripeClient::new(Client::new(), &config, 300);
        let checkout = client
            .create_pix_payment(&NewPixPayment {
                amount_cents: 1500,
                description: "Doação para Horta".into(),
                payer_email: "donor@example.org".into(),
                ecopoint_id: "eco-1".into(),
                donor_id: "donor-1".into(),
                idempotency_key: "don-1".into(),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(checkout.payment_id, "pi_new");
        assert_eq!(checkout.qr_code.as_deref(), Some("pixcode"));
        assert_eq!(checkout.ticket_url.as_deref(), Some("https://voucher"));
        assert!(checkout.expires_at.is_some());
    }
}
