//! Withdrawal requests and their administrative lifecycle.
//!
//! Creating a withdrawal reads the balance, checks for an in-flight request
//! and inserts, all under one `BEGIN IMMEDIATE` transaction. SQLite admits a
//! single writer, so two requests for the same ecopoint cannot both pass the
//! balance check against the same funds.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, ImmediateTx};
use crate::errors::{LedgerError, Result};
use crate::ledger;
use crate::models::{Ecopoint, PixKeyType, Withdrawal, WithdrawalStatus};
use crate::money::{to_cents, FeeSplit, MIN_WITHDRAWAL_AMOUNT};
use crate::notify::{self, Notifier, PayoutRequester};
use crate::pix::is_valid_pix_key;

#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub ecopoint_id: String,
    pub amount_gross: Decimal,
    pub pix_key: String,
    pub pix_key_type: String,
}

/// Where payout notifications go.
pub struct PayoutNotices<'a> {
    pub notifier: &'a dyn Notifier,
    pub admin_email: &'a str,
}

/// Validate and record a withdrawal for `requester_id`, then notify the
/// owner and the platform admin.
///
/// Checks run in a fixed order and stop at the first failure: amount, key
/// type, ownership, in-flight request, key format, balance.
pub async fn request_withdrawal(
    pool: &SqlitePool,
    notices: &PayoutNotices<'_>,
    requester_id: &str,
    request: &WithdrawalRequest,
) -> Result<Withdrawal> {
    if request.amount_gross < MIN_WITHDRAWAL_AMOUNT {
        return Err(LedgerError::InvalidAmount);
    }
    to_cents(request.amount_gross)?;
    let pix_key_type: PixKeyType = request.pix_key_type.parse()?;

    let mut tx = ImmediateTx::begin(pool).await?;
    let created = match insert_checked(&mut tx, requester_id, request, pix_key_type).await {
        Ok(created) => created,
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!("Rollback after rejected withdrawal failed: {rb}");
            }
            return Err(e);
        }
    };
    tx.commit().await?;

    let (ecopoint, withdrawal) = created;
    info!(
        withdrawal_id = %withdrawal.id,
        ecopoint_id = %withdrawal.ecopoint_id,
        gross = %withdrawal.amount_gross,
        net = %withdrawal.amount_net,
        "Withdrawal requested"
    );

    send_payout_notices(pool, notices, &ecopoint, &withdrawal).await;
    Ok(withdrawal)
}

/// Steps that must see a stable view of the ecopoint's ledger.
async fn insert_checked(
    tx: &mut ImmediateTx,
    requester_id: &str,
    request: &WithdrawalRequest,
    pix_key_type: PixKeyType,
) -> Result<(Ecopoint, Withdrawal)> {
    let ecopoint = db::find_ecopoint(tx.conn(), &request.ecopoint_id)
        .await?
        .ok_or(LedgerError::EcopointNotFound)?;
    if ecopoint.owner_id != requester_id {
        return Err(LedgerError::NotOwner);
    }

    if db::has_in_flight_withdrawal(tx.conn(), &ecopoint.id).await? {
        return Err(LedgerError::DuplicateInFlight);
    }

    if !is_valid_pix_key(&request.pix_key, pix_key_type) {
        return Err(LedgerError::InvalidPixKeyFormat(
            pix_key_type.as_str().to_string(),
        ));
    }

    let available = ledger::balance_on(tx.conn(), &ecopoint.id).await?.available;
    if available < request.amount_gross {
        return Err(LedgerError::InsufficientBalance { available });
    }

    let split = FeeSplit::from_gross(request.amount_gross);
    let withdrawal = Withdrawal {
        id: Uuid::new_v4().to_string(),
        ecopoint_id: ecopoint.id.clone(),
        user_id: requester_id.to_string(),
        amount_gross: split.gross,
        platform_fee: split.fee,
        amount_net: split.net,
        pix_key: request.pix_key.clone(),
        pix_key_type,
        status: WithdrawalStatus::Pending,
        created_at: Utc::now(),
        processed_at: None,
    };
    db::insert_withdrawal(tx.conn(), &withdrawal).await?;
    Ok((ecopoint, withdrawal))
}

async fn send_payout_notices(
    pool: &SqlitePool,
    notices: &PayoutNotices<'_>,
    ecopoint: &Ecopoint,
    withdrawal: &Withdrawal,
) {
    let owner = match db::find_user(pool, &withdrawal.user_id).await {
        Ok(Some(owner)) => owner,
        Ok(None) => {
            warn!(withdrawal_id = %withdrawal.id, "Requester has no user record, skipping e-mails");
            return;
        }
        Err(e) => {
            warn!(withdrawal_id = %withdrawal.id, "Could not load requester for e-mails: {e}");
            return;
        }
    };

    let owner_message = notify::withdrawal_owner_email(&owner.email, &ecopoint.name, withdrawal);
    let admin_message = notify::withdrawal_admin_email(
        notices.admin_email,
        &ecopoint.name,
        &PayoutRequester {
            name: owner.full_name.as_deref().unwrap_or(&owner.email),
            email: &owner.email,
        },
        withdrawal,
    );

    tokio::join!(
        notify::dispatch(notices.notifier, "withdrawal_owner", owner_message),
        notify::dispatch(notices.notifier, "withdrawal_admin", admin_message),
    );
}

/// The requester's withdrawals, newest first.
pub async fn list_withdrawals(
    pool: &SqlitePool,
    user_id: &str,
    ecopoint_id: Option<&str>,
) -> Result<Vec<Withdrawal>> {
    db::list_withdrawals(pool, user_id, ecopoint_id).await
}

/// Move a withdrawal along its lifecycle on behalf of a platform admin.
pub async fn transition_withdrawal(
    pool: &SqlitePool,
    withdrawal_id: &str,
    next: WithdrawalStatus,
) -> Result<Withdrawal> {
    let current = db::find_withdrawal(pool, withdrawal_id)
        .await?
        .ok_or(LedgerError::WithdrawalNotFound)?;

    let invalid = || LedgerError::InvalidTransition {
        from: current.status.as_str().to_string(),
        to: next.as_str().to_string(),
    };
    if !current.status.can_transition_to(next) {
        return Err(invalid());
    }

    let processed_at = next.is_final().then(Utc::now);
    if !db::update_withdrawal_status(pool, withdrawal_id, current.status, next, processed_at).await? {
        // Someone else moved it first.
        return Err(invalid());
    }
    info!(
        withdrawal_id,
        from = current.status.as_str(),
        to = next.as_str(),
        "Withdrawal status changed"
    );

    db::find_withdrawal(pool, withdrawal_id)
        .await?
        .ok_or(LedgerError::WithdrawalNotFound)
}
