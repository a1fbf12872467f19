//! Payment provider clients (Stripe and MercadoPago, both PIX).
//!
//! Each provider turns its own webhook wire format into a [`ProviderEvent`]
//! and its own status vocabulary into a [`MappedStatus`]; the reconciliation
//! state machine only ever sees [`PaymentUpdate`]s.
//!
//! ## Resilience
//!
//! Lookups retry network errors, 429 and 5xx responses with exponential
//! back-off, at most [`MAX_ATTEMPTS`] times. Every call also carries the
//! shared client's timeout.

pub mod mercadopago;
pub mod stripe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::warn;

use crate::errors::{LedgerError, Result};
use crate::models::ProviderKind;

pub use mercadopago::{MercadoPagoClient, MercadoPagoNotification};
pub use stripe::{StripeClient, StripeEvent};

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 200;

/// Shared lifecycle outcome of a provider-specific status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedStatus {
    Completed,
    Failed,
    /// Still in progress at the provider; nothing to do.
    Pending,
    /// A status this service does not know; logged and ignored.
    Unrecognized,
}

impl MappedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Pending | Self::Unrecognized => "pending",
        }
    }
}

/// Map either provider's status vocabulary onto the donation lifecycle.
pub fn map_provider_status(raw: &str) -> MappedStatus {
    match raw {
        "approved" | "succeeded" => MappedStatus::Completed,
        "rejected" | "cancelled" | "canceled" | "failed" => MappedStatus::Failed,
        "in_process" | "pending" | "requires_action" => MappedStatus::Pending,
        _ => MappedStatus::Unrecognized,
    }
}

/// Provider-neutral "payment X is now in status Y".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpdate {
    pub payment_id: String,
    pub raw_status: String,
    pub status: MappedStatus,
}

impl PaymentUpdate {
    pub fn new(payment_id: impl Into<String>, raw_status: impl Into<String>) -> Self {
        let raw_status = raw_status.into();
        PaymentUpdate {
            payment_id: payment_id.into(),
            status: map_provider_status(&raw_status),
            raw_status,
        }
    }
}

/// Result of a direct "get payment by id" call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPayment {
    pub id: String,
    pub raw_status: String,
    /// Provider-specific extras for the status poll (e.g. PIX QR data).
    pub details: Value,
}

impl ProviderPayment {
    pub fn to_update(&self) -> PaymentUpdate {
        PaymentUpdate::new(self.id.clone(), self.raw_status.clone())
    }
}

/// An authenticated webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Stripe(StripeEvent),
    MercadoPago(MercadoPagoNotification),
}

/// Input for starting a PIX charge.
#[derive(Debug, Clone, Serialize)]
pub struct NewPixPayment {
    pub amount_cents: i64,
    pub description: String,
    pub payer_email: String,
    pub ecopoint_id: String,
    pub donor_id: String,
    /// Sent as the provider idempotency key; the donation id.
    pub idempotency_key: String,
}

/// What the donor needs to pay a PIX charge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PixCheckout {
    pub payment_id: String,
    pub qr_code: Option<String>,
    pub qr_code_base64: Option<String>,
    pub ticket_url: Option<String>,
    pub expires_at: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Check the delivery's signature and decode it. Any failure here is
    /// [`LedgerError::InvalidSignature`] and must not touch state.
    fn authenticate_event(&self, body: &[u8], headers: &HeaderMap) -> Result<ProviderEvent>;

    async fn get_payment_status(&self, payment_id: &str) -> Result<ProviderPayment>;

    async fn create_pix_payment(&self, payment: &NewPixPayment) -> Result<PixCheckout>;
}

/// Registered providers, keyed by kind.
#[derive(Clone, Default)]
pub struct Providers {
    by_kind: HashMap<ProviderKind, Arc<dyn PaymentProvider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.by_kind.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<&dyn PaymentProvider> {
        self.by_kind
            .get(&kind)
            .map(|p| p.as_ref())
            .ok_or_else(|| LedgerError::UnknownProvider(kind.as_str().to_string()))
    }
}

// ─────────────────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────────────────

/// Lower-case hex HMAC-SHA256 of `message`, as providers sign it.
#[cfg(test)]
pub(crate) fn hmac_sha256_hex(secret: &str, message: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of an expected MAC against a hex candidate.
pub(crate) fn hmac_sha256_matches(secret: &str, message: &[u8], candidate_hex: &str) -> bool {
    let Ok(candidate) = hex::decode(candidate_hex) else {
        return false;
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message);
    mac.verify_slice(&candidate).is_ok()
}

/// Parse `k1=v1,k2=v2` signature headers; repeated keys are kept in order.
pub(crate) fn parse_signature_header(header: &str) -> Vec<(&str, &str)> {
    header
        .split(',')
        .filter_map(|part| part.trim().split_once('='))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Send a request built by `build`, retrying transient failures, and decode
/// the JSON body.
pub(crate) async fn send_with_backoff<F>(label: &str, build: F) -> Result<Value>
where
    F: Fn() -> RequestBuilder,
{
    let mut backoff = INITIAL_BACKOFF_MS;
    let mut attempt = 1;

    loop {
        let retry_reason = match build().send().await {
            Err(e) => format!("request failed: {e}"),
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp.json::<Value>().await?);
                }
                if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(LedgerError::Provider(format!(
                        "{label} returned {status}: {body}"
                    )));
                }
                format!("status {status}")
            }
        };

        if attempt >= MAX_ATTEMPTS {
            return Err(LedgerError::Provider(format!(
                "{label} failed after {attempt} attempts: {retry_reason}"
            )));
        }
        warn!("{label} {retry_reason} (will retry in {backoff}ms)");
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        backoff *= 2;
        attempt += 1;
    }
}

/// Build the client shared by all outbound calls.
pub fn http_client(timeout_secs: u64) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[test]
    fn status_vocabulary() {
        assert_eq!(map_provider_status("approved"), MappedStatus::Completed);
        assert_eq!(map_provider_status("succeeded"), MappedStatus::Completed);
        for failed in ["rejected", "cancelled", "canceled", "failed"] {
            assert_eq!(map_provider_status(failed), MappedStatus::Failed);
        }
        for pending in ["in_process", "pending", "requires_action"] {
            assert_eq!(map_provider_status(pending), MappedStatus::Pending);
        }
        assert_eq!(map_provider_status("refunded"), MappedStatus::Unrecognized);
        assert_eq!(map_provider_status("APPROVED"), MappedStatus::Unrecognized);
    }

    #[test]
    fn signature_header_parsing() {
        let parts = parse_signature_header("t=1700000000, v1=abc,v1=def,v0=zzz");
        assert_eq!(
            parts,
            vec![("t", "1700000000"), ("v1", "abc"), ("v1", "def"), ("v0", "zzz")]
        );
    }

    #[test]
    fn hmac_round_trip_and_tamper() {
        let sig = hmac_sha256_hex("whsec_test", b"payload");
        assert!(hmac_sha256_matches("whsec_test", b"payload", &sig));
        assert!(!hmac_sha256_matches("whsec_test", b"payload!", &sig));
        assert!(!hmac_sha256_matches("other", b"payload", &sig));
        assert!(!hmac_sha256_matches("whsec_test", b"payload", "not-hex"));
    }

    #[tokio::test]
    async fn backoff_gives_up_after_max_attempts() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/thing")
            .with_status(503)
            .expect(MAX_ATTEMPTS as usize)
            .create_async()
            .await;

        let client = Client::new();
        let url = format!("{}/thing", server.url());
        let err = send_with_backoff("test", || client.get(&url))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Provider(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/thing")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let client = Client::new();
        let url = format!("{}/thing", server.url());
        let err = send_with_backoff("test", || client.get(&url))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Provider(_)));
        mock.assert_async().await;
    }
}
