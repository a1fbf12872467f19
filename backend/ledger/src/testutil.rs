//! Shared fixtures for the in-crate tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::models::{
    Donation, DonationStatus, PixKeyType, ProviderKind, ReputationDelta, Withdrawal,
    WithdrawalStatus,
};
use crate::money::{from_cents, FeeSplit};
use crate::notify::{EmailMessage, Notifier};
use crate::providers::{
    NewPixPayment, PaymentProvider, PixCheckout, ProviderEvent, ProviderPayment, StripeEvent,
};
use crate::reputation::ReputationService;

/// File-backed database in a temporary directory, so that several pool
/// connections really contend for SQLite's write lock.
pub struct TestDb {
    pub pool: SqlitePool,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let pool = db::init_pool(path.to_str().unwrap()).await.unwrap();
        TestDb { pool, _dir: dir }
    }

    pub async fn seed_user(&self, id: &str, full_name: Option<&str>) {
        sqlx::query("INSERT OR IGNORE INTO users (id, email, full_name) VALUES (?1, ?2, ?3)")
            .bind(id)
            .bind(format!("{id}@example.org"))
            .bind(full_name)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    /// A validated ecopoint that accepts donations, plus its owner.
    pub async fn seed_ecopoint(&self, id: &str, owner_id: &str) {
        self.seed_user(owner_id, Some("Dona Maria")).await;
        sqlx::query(
            "INSERT INTO ecopoints (id, name, owner_id, status, accepts_donations) \
             VALUES (?1, ?2, ?3, 'validated', 1)",
        )
        .bind(id)
        .bind(format!("Ecoponto {id}"))
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .unwrap();
    }

    pub async fn set_ecopoint_flags(&self, id: &str, status: &str, accepts_donations: bool) {
        sqlx::query("UPDATE ecopoints SET status = ?1, accepts_donations = ?2 WHERE id = ?3")
            .bind(status)
            .bind(accepts_donations)
            .bind(id)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    pub async fn seed_donation(
        &self,
        ecopoint_id: &str,
        donor_id: &str,
        amount_cents: i64,
        payment_id: &str,
        status: DonationStatus,
    ) -> Donation {
        self.seed_user(donor_id, None).await;
        let now = Utc::now();
        let donation = Donation {
            id: Uuid::new_v4().to_string(),
            ecopoint_id: ecopoint_id.to_string(),
            user_id: donor_id.to_string(),
            amount: from_cents(amount_cents),
            payment_id: payment_id.to_string(),
            provider: ProviderKind::MercadoPago,
            status,
            created_at: now,
            updated_at: now,
        };
        db::insert_donation(&self.pool, &donation).await.unwrap();
        donation
    }

    /// Move a donation's `created_at` into the past.
    pub async fn age_donation(&self, payment_id: &str, secs: i64) {
        sqlx::query("UPDATE donations SET created_at = ?1 WHERE payment_id = ?2")
            .bind(Utc::now() - Duration::seconds(secs))
            .bind(payment_id)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    pub async fn seed_withdrawal(
        &self,
        ecopoint_id: &str,
        user_id: &str,
        gross_cents: i64,
        status: WithdrawalStatus,
    ) -> Withdrawal {
        let split = FeeSplit::from_gross(from_cents(gross_cents));
        let withdrawal = Withdrawal {
            id: Uuid::new_v4().to_string(),
            ecopoint_id: ecopoint_id.to_string(),
            user_id: user_id.to_string(),
            amount_gross: split.gross,
            platform_fee: split.fee,
            amount_net: split.net,
            pix_key: "12345678909".to_string(),
            pix_key_type: PixKeyType::Cpf,
            status,
            created_at: Utc::now(),
            processed_at: None,
        };
        db::insert_withdrawal(&self.pool, &withdrawal).await.unwrap();
        withdrawal
    }

    pub async fn donation_status(&self, payment_id: &str) -> DonationStatus {
        db::find_donation_by_payment_id(&self.pool, payment_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    pub async fn reputation(&self, user_id: &str) -> Option<(i64, i64, i64)> {
        db::get_reputation(&self.pool, user_id).await.unwrap()
    }
}

pub fn sample_withdrawal(gross: Decimal) -> Withdrawal {
    let split = FeeSplit::from_gross(gross);
    Withdrawal {
        id: Uuid::new_v4().to_string(),
        ecopoint_id: "eco-1".into(),
        user_id: "owner-1".into(),
        amount_gross: split.gross,
        platform_fee: split.fee,
        amount_net: split.net,
        pix_key: "dono@example.org".into(),
        pix_key_type: PixKeyType::Email,
        status: WithdrawalStatus::Pending,
        created_at: Utc::now(),
        processed_at: None,
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_email(&self, message: &EmailMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Counts attempts and fails every one of them.
#[derive(Default)]
pub struct FailingNotifier {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send_email(&self, _message: &EmailMessage) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(LedgerError::Email("smtp down".into()))
    }
}

pub struct FailingReputation;

#[async_trait]
impl ReputationService for FailingReputation {
    async fn apply(&self, _user_id: &str, _delta: ReputationDelta) -> Result<()> {
        Err(LedgerError::Provider("reputation store offline".into()))
    }
}

pub const FAKE_SIGNATURE_HEADER: &str = "x-fake-signature";

/// Scriptable payment provider. Webhook bodies are Stripe-shaped events
/// and are accepted when `x-fake-signature: valid` is present.
pub struct FakeProvider {
    kind: ProviderKind,
    status: Mutex<String>,
    status_by_payment: Mutex<HashMap<String, String>>,
    fail_lookups: bool,
    pub lookups: AtomicUsize,
    pub created: Mutex<Vec<NewPixPayment>>,
}

impl FakeProvider {
    pub fn new(kind: ProviderKind, status: &str) -> Self {
        FakeProvider {
            kind,
            status: Mutex::new(status.to_string()),
            status_by_payment: Mutex::new(HashMap::new()),
            fail_lookups: false,
            lookups: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(kind: ProviderKind) -> Self {
        FakeProvider {
            fail_lookups: true,
            ..Self::new(kind, "pending")
        }
    }

    pub fn set_status(&self, status: &str) {
        *self.status.lock().unwrap() = status.to_string();
    }

    /// Report `status` for one payment, overriding the default.
    pub fn set_status_for(&self, payment_id: &str, status: &str) {
        self.status_by_payment
            .lock()
            .unwrap()
            .insert(payment_id.to_string(), status.to_string());
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn authenticate_event(&self, body: &[u8], headers: &HeaderMap) -> Result<ProviderEvent> {
        if headers.get(FAKE_SIGNATURE_HEADER).map(|v| v.as_bytes()) != Some(b"valid") {
            return Err(LedgerError::InvalidSignature("fake signature rejected".into()));
        }
        let event: StripeEvent = serde_json::from_slice(body)
            .map_err(|e| LedgerError::BadRequest(e.to_string()))?;
        Ok(ProviderEvent::Stripe(event))
    }

    async fn get_payment_status(&self, payment_id: &str) -> Result<ProviderPayment> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups {
            return Err(LedgerError::Provider("provider unreachable".into()));
        }
        let raw_status = self
            .status_by_payment
            .lock()
            .unwrap()
            .get(payment_id)
            .cloned()
            .unwrap_or_else(|| self.status.lock().unwrap().clone());
        Ok(ProviderPayment {
            id: payment_id.to_string(),
            raw_status,
            details: json!({ "source": "fake" }),
        })
    }

    async fn create_pix_payment(&self, payment: &NewPixPayment) -> Result<PixCheckout> {
        self.created.lock().unwrap().push(payment.clone());
        Ok(PixCheckout {
            payment_id: format!("fake_{}", payment.idempotency_key),
            qr_code: Some("00020126fake".into()),
            qr_code_base64: Some("ZmFrZQ==".into()),
            ticket_url: Some("https://pay.example/ticket".into()),
            expires_at: None,
        })
    }
}

/// A Stripe-shaped webhook body for the given payment.
pub fn stripe_event_body(event_type: &str, payment_id: &str, status: &str) -> String {
    json!({
        "id": format!("evt_{}", Uuid::new_v4()),
        "type": event_type,
        "data": { "object": { "id": payment_id, "status": status, "metadata": {} } }
    })
    .to_string()
}

pub fn fake_signed_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(FAKE_SIGNATURE_HEADER, "valid".parse().unwrap());
    headers
}
