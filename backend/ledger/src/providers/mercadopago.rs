//! MercadoPago payments API (PIX).

use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    header_str, hmac_sha256_matches, parse_signature_header, send_with_backoff, NewPixPayment,
    PaymentProvider, PixCheckout, ProviderEvent, ProviderPayment,
};
use crate::config::ProviderConfig;
use crate::errors::{LedgerError, Result};
use crate::models::ProviderKind;

pub const SIGNATURE_HEADER: &str = "x-signature";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Webhook notification. MercadoPago only says *which* payment changed;
/// the status has to be fetched.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MercadoPagoNotification {
    #[serde(rename = "type", default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<NotificationData>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotificationData {
    /// Sent as a number or a string depending on the API version.
    #[serde(default)]
    pub id: Value,
}

impl MercadoPagoNotification {
    pub fn is_payment(&self) -> bool {
        self.topic.as_deref() == Some("payment")
    }

    pub fn payment_id(&self) -> Option<String> {
        match &self.data.as_ref()?.id {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// The string MercadoPago signs:
/// `id:<data.id>;request-id:<x-request-id>;ts:<ts>;`, skipping absent parts.
fn signature_manifest(data_id: Option<&str>, request_id: Option<&str>, ts: &str) -> String {
    let mut manifest = String::new();
    if let Some(id) = data_id {
        manifest.push_str(&format!("id:{};", id.to_lowercase()));
    }
    if let Some(rid) = request_id {
        manifest.push_str(&format!("request-id:{rid};"));
    }
    manifest.push_str(&format!("ts:{ts};"));
    manifest
}

/// Verify an `x-signature: ts=..,v1=..` header for a notification about
/// `data_id`.
pub fn verify_signature(
    secret: &str,
    signature_header: &str,
    request_id: Option<&str>,
    data_id: Option<&str>,
) -> Result<()> {
    let parts = parse_signature_header(signature_header);
    let find = |key: &str| parts.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);

    let (Some(ts), Some(v1)) = (find("ts"), find("v1")) else {
        return Err(LedgerError::InvalidSignature(
            "malformed x-signature header".into(),
        ));
    };

    let manifest = signature_manifest(data_id, request_id, ts);
    if hmac_sha256_matches(secret, manifest.as_bytes(), v1) {
        Ok(())
    } else {
        Err(LedgerError::InvalidSignature("x-signature mismatch".into()))
    }
}

pub struct MercadoPagoClient {
    client: Client,
    api_url: String,
    access_token: String,
    webhook_secret: String,
}

impl MercadoPagoClient {
    pub fn new(client: Client, config: &ProviderConfig) -> Self {
        MercadoPagoClient {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            access_token: config.api_key.clone(),
            webhook_secret: config.webhook_secret.clone(),
        }
    }
}

fn transaction_data(payment: &Value) -> &Value {
    &payment["point_of_interaction"]["transaction_data"]
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

/// Payment ids come back as JSON numbers.
fn id_field(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[async_trait]
impl PaymentProvider for MercadoPagoClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MercadoPago
    }

    fn authenticate_event(&self, body: &[u8], headers: &HeaderMap) -> Result<ProviderEvent> {
        let signature = header_str(headers, SIGNATURE_HEADER)
            .ok_or_else(|| LedgerError::InvalidSignature("missing x-signature".into()))?;

        let request_id = header_str(headers, REQUEST_ID_HEADER);

        // The signature covers data.id, so the body has to be read first. An
        // unreadable body is only a bad request if it was signed without an id.
        let notification: MercadoPagoNotification = match serde_json::from_slice(body) {
            Ok(n) => n,
            Err(e) => {
                verify_signature(&self.webhook_secret, signature, request_id, None)?;
                return Err(LedgerError::BadRequest(format!(
                    "MercadoPago notification: {e}"
                )));
            }
        };

        verify_signature(
            &self.webhook_secret,
            signature,
            request_id,
            notification.payment_id().as_deref(),
        )?;
        Ok(ProviderEvent::MercadoPago(notification))
    }

    async fn get_payment_status(&self, payment_id: &str) -> Result<ProviderPayment> {
        let url = format!("{}/v1/payments/{payment_id}", self.api_url);
        let payment = send_with_backoff("MercadoPago payment lookup", || {
            self.client.get(&url).bearer_auth(&self.access_token)
        })
        .await?;

        let raw_status = string_field(&payment, "status")
            .ok_or_else(|| LedgerError::Provider("MercadoPago payment without status".into()))?;
        debug!(payment_id, status = %raw_status, "Fetched MercadoPago payment");

        let pix = transaction_data(&payment);
        let pix_details = if raw_status == "pending" && !pix.is_null() {
            json!({
                "qrCode": pix["qr_code"],
                "qrCodeBase64": pix["qr_code_base64"],
                "ticketUrl": pix["ticket_url"],
                "expiresAt": payment["date_of_expiration"],
            })
        } else {
            Value::Null
        };

        Ok(ProviderPayment {
            id: id_field(&payment).unwrap_or_else(|| payment_id.to_string()),
            details: json!({
                "statusDetail": payment["status_detail"],
                "pixDetails": pix_details,
            }),
            raw_status,
        })
    }

    async fn create_pix_payment(&self, payment: &NewPixPayment) -> Result<PixCheckout> {
        let url = format!("{}/v1/payments", self.api_url);
        let body = json!({
            "transaction_amount": payment.amount_cents as f64 / 100.0,
            "description": payment.description,
            "payment_method_id": "pix",
            "payer": { "email": payment.payer_email },
            "external_reference": payment.idempotency_key,
            "metadata": {
                "ecopoint_id": payment.ecopoint_id,
                "user_id": payment.donor_id,
            },
        });

        let created = send_with_backoff("MercadoPago payment creation", || {
            self.client
                .post(&url)
                .bearer_auth(&self.access_token)
                .header("X-Idempotency-Key", &payment.idempotency_key)
                .json(&body)
        })
        .await?;

        let payment_id = id_field(&created)
            .ok_or_else(|| LedgerError::Provider("MercadoPago payment without id".into()))?;
        let pix = transaction_data(&created);

        Ok(PixCheckout {
            payment_id,
            qr_code: string_field(pix, "qr_code"),
            qr_code_base64: string_field(pix, "qr_code_base64"),
            ticket_url: string_field(pix, "ticket_url"),
            expires_at: string_field(&created, "date_of_expiration"),
        })
    }
}
