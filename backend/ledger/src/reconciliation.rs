//! Donation status state machine.
//!
//! ```text
//! pending ──► completed   (+10 reputation, +1 donation, owner e-mail)
//!    └──────► failed
//! ```
//!
//! Webhooks from either provider and the pending-donation sweeper all end
//! in [`Reconciler::apply_update`]. The transition itself is a single
//! conditional `UPDATE` on `status = 'pending'`, so only one caller can win
//! it and the completion side effects run exactly once however many times an
//! event is delivered.

use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::models::{Donation, DonationStatus, ProviderKind, ReputationDelta};
use crate::money::from_cents;
use crate::notify::{self, DonationReceipt, Notifier};
use crate::providers::{MappedStatus, PaymentUpdate, ProviderEvent, Providers};
use crate::reputation::ReputationService;

/// What a delivered update did. Every variant is acknowledged to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This call moved the donation out of `pending`.
    Transitioned(DonationStatus),
    /// Donation was already terminal; nothing changed.
    AlreadySettled,
    /// No donation carries this payment id (yet).
    UnknownPayment,
    /// Provider still reports the payment as in progress.
    StillPending,
    /// Status string outside the known vocabulary.
    Unrecognized,
    /// Authenticated, but not an event this service acts on.
    Ignored,
}

/// Response of the active status poll.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentStatusView {
    pub status: String,
    pub donation: Donation,
    #[serde(rename = "providerDetails")]
    pub provider_details: Value,
}

pub struct Reconciler {
    pub pool: SqlitePool,
    pub providers: Providers,
    pub reputation: Arc<dyn ReputationService>,
    pub notifier: Arc<dyn Notifier>,
    pub site_url: String,
}

impl Reconciler {
    /// Authenticate a webhook delivery and apply the status it carries.
    ///
    /// Only signature failures (and malformed bodies) are errors before any
    /// state is read; once authenticated every business no-op is `Ok`.
    pub async fn handle_provider_event(
        &self,
        kind: ProviderKind,
        body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Outcome> {
        let provider = self.providers.get(kind)?;
        let event = provider.authenticate_event(body, headers)?;

        let update = match event {
            ProviderEvent::Stripe(event) => match event.payment_update() {
                Some(update) => update,
                None => {
                    info!(event_id = %event.id, event_type = %event.event_type, "Ignoring Stripe event");
                    return Ok(Outcome::Ignored);
                }
            },
            ProviderEvent::MercadoPago(notification) => {
                if !notification.is_payment() {
                    info!(topic = ?notification.topic, "Ignoring MercadoPago notification");
                    return Ok(Outcome::Ignored);
                }
                let Some(payment_id) = notification.payment_id() else {
                    warn!(action = ?notification.action, "MercadoPago notification without data.id");
                    return Ok(Outcome::Ignored);
                };
                provider.get_payment_status(&payment_id).await?.to_update()
            }
        };

        self.apply_update(&update).await
    }

    /// Apply a provider-neutral status to the donation owning the payment.
    pub async fn apply_update(&self, update: &PaymentUpdate) -> Result<Outcome> {
        let target = match update.status {
            MappedStatus::Completed => DonationStatus::Completed,
            MappedStatus::Failed => DonationStatus::Failed,
            MappedStatus::Pending => return Ok(Outcome::StillPending),
            MappedStatus::Unrecognized => {
                info!(
                    payment_id = %update.payment_id,
                    status = %update.raw_status,
                    "Unrecognized payment status, leaving donation untouched"
                );
                return Ok(Outcome::Unrecognized);
            }
        };

        if !db::settle_donation(&self.pool, &update.payment_id, target).await? {
            return match db::find_donation_by_payment_id(&self.pool, &update.payment_id).await? {
                None => {
                    info!(payment_id = %update.payment_id, "No donation for payment, acknowledging");
                    Ok(Outcome::UnknownPayment)
                }
                Some(existing) => {
                    info!(
                        payment_id = %update.payment_id,
                        current = existing.status.as_str(),
                        incoming = target.as_str(),
                        "Donation already settled"
                    );
                    Ok(Outcome::AlreadySettled)
                }
            };
        }

        info!(payment_id = %update.payment_id, status = target.as_str(), "Donation settled");

        if target == DonationStatus::Completed {
            if let Some(donation) =
                db::find_donation_by_payment_id(&self.pool, &update.payment_id).await?
            {
                self.on_completed(&donation).await;
            }
        }
        Ok(Outcome::Transitioned(target))
    }

    /// Post-commit side effects of a completed donation. Failures are logged
    /// and never undo the status change.
    async fn on_completed(&self, donation: &Donation) {
        if let Err(e) = self
            .reputation
            .apply(&donation.user_id, ReputationDelta::DONATION_COMPLETED)
            .await
        {
            warn!(
                payment_id = %donation.payment_id,
                user_id = %donation.user_id,
                "Reputation update failed: {e}"
            );
        }

        if let Err(e) = self.notify_owner(donation).await {
            warn!(payment_id = %donation.payment_id, "Donation e-mail skipped: {e}");
        }
    }

    async fn notify_owner(&self, donation: &Donation) -> Result<()> {
        let ecopoint = db::find_ecopoint(&self.pool, &donation.ecopoint_id)
            .await?
            .ok_or(LedgerError::EcopointNotFound)?;
        let Some(owner) = db::find_user(&self.pool, &ecopoint.owner_id).await? else {
            warn!(ecopoint_id = %ecopoint.id, "Ecopoint owner has no user record");
            return Ok(());
        };
        let donor_name = db::find_user(&self.pool, &donation.user_id)
            .await?
            .and_then(|u| u.full_name)
            .unwrap_or_else(|| "Anônimo".to_string());
        let (total_cents, count) =
            db::completed_donation_totals(&self.pool, &donation.ecopoint_id).await?;
        let dashboard_url = format!("{}/dashboard/doacoes", self.site_url.trim_end_matches('/'));

        let message = notify::donation_received_email(
            &owner.email,
            &DonationReceipt {
                ecopoint_name: &ecopoint.name,
                amount: donation.amount,
                donor_name: &donor_name,
                total_received: from_cents(total_cents),
                donations_count: count,
                dashboard_url: &dashboard_url,
            },
        );
        notify::dispatch(self.notifier.as_ref(), "donation_received", message).await;
        Ok(())
    }

    /// Read-through status for the donor who made the payment.
    ///
    /// Completed donations answer from the database. Anything else asks the
    /// provider and maps its answer, without writing: persistence belongs to
    /// the webhook and the sweeper.
    pub async fn get_status(&self, payment_id: &str, requester_id: &str) -> Result<PaymentStatusView> {
        let donation = db::find_donation_by_payment_id(&self.pool, payment_id)
            .await?
            .filter(|d| d.user_id == requester_id)
            .ok_or(LedgerError::DonationNotFound)?;

        if donation.status == DonationStatus::Completed {
            return Ok(PaymentStatusView {
                status: DonationStatus::Completed.as_str().to_string(),
                donation,
                provider_details: Value::Null,
            });
        }

        let payment = self
            .providers
            .get(donation.provider)?
            .get_payment_status(payment_id)
            .await?;

        Ok(PaymentStatusView {
            status: payment.to_update().status.as_str().to_string(),
            donation,
            provider_details: payment.details,
        })
    }
}
