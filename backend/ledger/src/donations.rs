//! Starting a PIX donation.

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::models::{Donation, DonationStatus, EcopointStatus, ProviderKind};
use crate::money::{from_cents, MAX_DONATION_CENTS, MIN_DONATION_CENTS};
use crate::providers::{NewPixPayment, Providers};

#[derive(Debug, Clone)]
pub struct StartDonation {
    pub ecopoint_id: String,
    pub amount_cents: i64,
    pub provider: ProviderKind,
}

/// What the donor needs to complete the payment.
#[derive(Debug, Clone, Serialize)]
pub struct DonationCheckout {
    pub donation_id: String,
    pub payment_id: String,
    pub provider: ProviderKind,
    pub qr_code: Option<String>,
    pub qr_code_base64: Option<String>,
    pub ticket_url: Option<String>,
    pub expires_at: Option<String>,
}

pub async fn start_donation(
    pool: &SqlitePool,
    providers: &Providers,
    donor_id: &str,
    request: &StartDonation,
) -> Result<DonationCheckout> {
    if !(MIN_DONATION_CENTS..=MAX_DONATION_CENTS).contains(&request.amount_cents) {
        return Err(LedgerError::InvalidDonationAmount(request.amount_cents));
    }

    let ecopoint = db::find_ecopoint(pool, &request.ecopoint_id)
        .await?
        .ok_or(LedgerError::EcopointNotFound)?;
    if ecopoint.status != EcopointStatus::Validated {
        return Err(LedgerError::EcopointNotValidated);
    }
    if !ecopoint.can_receive_donations() {
        return Err(LedgerError::DonationsDisabled);
    }

    let donor = db::find_user(pool, donor_id)
        .await?
        .ok_or(LedgerError::Unauthenticated)?;

    let donation_id = Uuid::new_v4().to_string();
    let checkout = providers
        .get(request.provider)?
        .create_pix_payment(&NewPixPayment {
            amount_cents: request.amount_cents,
            description: format!("Doação para {}", ecopoint.name),
            payer_email: donor.email,
            ecopoint_id: ecopoint.id.clone(),
            donor_id: donor_id.to_string(),
            idempotency_key: donation_id.clone(),
        })
        .await?;

    let now = Utc::now();
    let donation = Donation {
        id: donation_id,
        ecopoint_id: ecopoint.id,
        user_id: donor_id.to_string(),
        amount: from_cents(request.amount_cents),
        payment_id: checkout.payment_id.clone(),
        provider: request.provider,
        status: DonationStatus::Pending,
        created_at: now,
        updated_at: now,
    };
    db::insert_donation(pool, &donation).await?;
    info!(
        donation_id = %donation.id,
        payment_id = %donation.payment_id,
        provider = request.provider.as_str(),
        "Donation started"
    );

    Ok(DonationCheckout {
        donation_id: donation.id,
        payment_id: checkout.payment_id,
        provider: request.provider,
        qr_code: checkout.qr_code,
        qr_code_base64: checkout.qr_code_base64,
        ticket_url: checkout.ticket_url,
        expires_at: checkout.expires_at,
    })
}
