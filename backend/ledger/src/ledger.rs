//! Balance queries.
//!
//! `available = Σ completed donations − Σ net of withdrawals not rejected`
//!
//! Pending and processing withdrawals count because their funds are
//! reserved; completed ones because the money has left. The result is never
//! negative.

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::money::from_cents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSummary {
    #[serde(with = "rust_decimal::serde::float")]
    pub total_received: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub reserved_or_paid: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub available: Decimal,
}

/// Compute the balance on an existing connection. Callers that go on to
/// write based on the result must hold an [`db::ImmediateTx`] on `conn`.
pub async fn balance_on(conn: &mut SqliteConnection, ecopoint_id: &str) -> Result<BalanceSummary> {
    let (received_cents, _) = db::completed_donation_totals(&mut *conn, ecopoint_id).await?;
    let reserved_cents = db::reserved_withdrawal_cents(&mut *conn, ecopoint_id).await?;
    let available_cents = (received_cents - reserved_cents).max(0);

    Ok(BalanceSummary {
        total_received: from_cents(received_cents),
        reserved_or_paid: from_cents(reserved_cents),
        available: from_cents(available_cents),
    })
}

/// How much ecopoint `ecopoint_id` can withdraw right now.
///
/// Standalone read for display purposes; the withdrawal flow recomputes it
/// inside its own write-locked transaction.
pub async fn get_available_balance(pool: &SqlitePool, ecopoint_id: &str) -> Result<Decimal> {
    let mut conn = pool.acquire().await?;
    if db::find_ecopoint(&mut *conn, ecopoint_id).await?.is_none() {
        return Err(LedgerError::EcopointNotFound);
    }
    Ok(balance_on(&mut conn, ecopoint_id).await?.available)
}

/// Owner-only balance breakdown.
pub async fn get_balance_summary(
    pool: &SqlitePool,
    requester_id: &str,
    ecopoint_id: &str,
) -> Result<BalanceSummary> {
    let mut conn = pool.acquire().await?;
    let ecopoint = db::find_ecopoint(&mut *conn, ecopoint_id)
        .await?
        .ok_or(LedgerError::EcopointNotFound)?;
    if ecopoint.owner_id != requester_id {
        return Err(LedgerError::NotOwner);
    }
    balance_on(&mut conn, ecopoint_id).await
}
