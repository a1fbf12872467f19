//! Database layer: pool set-up, migrations and typed queries.
//!
//! Rows are read into private `*Row` structs and converted to the entities in
//! [`crate::models`], so cents never leak past this module.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::info;

use crate::errors::{LedgerError, Result};
use crate::models::{
    Donation, DonationStatus, Ecopoint, PixKeyType, ProviderKind, ReputationDelta, User,
    Withdrawal, WithdrawalStatus,
};
use crate::money::{from_cents, to_cents};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Write-locked transactions
// ─────────────────────────────────────────────────────────

/// A transaction opened with `BEGIN IMMEDIATE`, which takes SQLite's single
/// writer lock up front. Concurrent holders queue on the busy timeout instead
/// of both reading and then racing to write.
///
/// Dropping an uncommitted transaction closes its connection, which makes
/// SQLite roll it back.
pub struct ImmediateTx {
    conn: PoolConnection<Sqlite>,
    open: bool,
}

impl ImmediateTx {
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(ImmediateTx { conn, open: true })
    }

    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.open = false;
        Ok(())
    }
}

impl Drop for ImmediateTx {
    fn drop(&mut self) {
        if self.open {
            self.conn.close_on_drop();
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ─────────────────────────────────────────────────────────
// Collaborator entities (read only)
// ─────────────────────────────────────────────────────────

pub async fn find_ecopoint<'e, E: SqliteExecutor<'e>>(
    exec: E,
    ecopoint_id: &str,
) -> Result<Option<Ecopoint>> {
    let row = sqlx::query_as::<_, Ecopoint>(
        "SELECT id, name, owner_id, status, accepts_donations FROM ecopoints WHERE id = ?1",
    )
    .bind(ecopoint_id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}

pub async fn find_user<'e, E: SqliteExecutor<'e>>(exec: E, user_id: &str) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, User>("SELECT id, email, full_name FROM users WHERE id = ?1")
        .bind(user_id)
        .fetch_optional(exec)
        .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct DonationRow {
    id: String,
    ecopoint_id: String,
    user_id: String,
    amount_cents: i64,
    payment_id: String,
    provider: ProviderKind,
    status: DonationStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DonationRow> for Donation {
    fn from(row: DonationRow) -> Self {
        Donation {
            id: row.id,
            ecopoint_id: row.ecopoint_id,
            user_id: row.user_id,
            amount: from_cents(row.amount_cents),
            payment_id: row.payment_id,
            provider: row.provider,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const DONATION_COLUMNS: &str =
    "id, ecopoint_id, user_id, amount_cents, payment_id, provider, status, created_at, updated_at";

/// Persist a donation. A second donation for the same `payment_id` is
/// rejected with [`LedgerError::DuplicatePayment`].
pub async fn insert_donation<'e, E: SqliteExecutor<'e>>(exec: E, donation: &Donation) -> Result<()> {
    let amount_cents = to_cents(donation.amount)?;
    let result = sqlx::query(
        r#"
        INSERT INTO donations
            (id, ecopoint_id, user_id, amount_cents, payment_id, provider, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(&donation.id)
    .bind(&donation.ecopoint_id)
    .bind(&donation.user_id)
    .bind(amount_cents)
    .bind(&donation.payment_id)
    .bind(donation.provider)
    .bind(donation.status)
    .bind(donation.created_at)
    .bind(donation.updated_at)
    .execute(exec)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => {
            Err(LedgerError::DuplicatePayment(donation.payment_id.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn find_donation_by_payment_id<'e, E: SqliteExecutor<'e>>(
    exec: E,
    payment_id: &str,
) -> Result<Option<Donation>> {
    let row = sqlx::query_as::<_, DonationRow>(&format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE payment_id = ?1"
    ))
    .bind(payment_id)
    .fetch_optional(exec)
    .await?;
    Ok(row.map(Donation::from))
}

/// Move a donation out of `pending`. This is a compare-and-swap on the
/// current status: returns `true` only for the caller that performed the
/// transition, `false` if the donation is missing or already terminal.
pub async fn settle_donation<'e, E: SqliteExecutor<'e>>(
    exec: E,
    payment_id: &str,
    status: DonationStatus,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE donations
        SET    status = ?1, updated_at = ?2
        WHERE  payment_id = ?3 AND status = ?4
        "#,
    )
    .bind(status)
    .bind(Utc::now())
    .bind(payment_id)
    .bind(DonationStatus::Pending)
    .execute(exec)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Donations still pending that were created before `created_before`.
/// Never-swept donations come first, then the least recently swept, so every
/// stale donation is eventually revisited however many stay stuck.
pub async fn stale_pending_donations<'e, E: SqliteExecutor<'e>>(
    exec: E,
    created_before: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Donation>> {
    let rows = sqlx::query_as::<_, DonationRow>(&format!(
        r#"
        SELECT {DONATION_COLUMNS}
        FROM   donations
        WHERE  status = ?1 AND created_at < ?2
        ORDER  BY swept_at ASC NULLS FIRST, created_at ASC
        LIMIT  ?3
        "#
    ))
    .bind(DonationStatus::Pending)
    .bind(created_before)
    .bind(limit)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(Donation::from).collect())
}

/// Record that the sweeper looked at `payment_id`.
pub async fn mark_swept<'e, E: SqliteExecutor<'e>>(
    exec: E,
    payment_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE donations SET swept_at = ?1 WHERE payment_id = ?2")
        .bind(at)
        .bind(payment_id)
        .execute(exec)
        .await?;
    Ok(())
}

/// Total (in cents) and number of completed donations for an ecopoint.
pub async fn completed_donation_totals<'e, E: SqliteExecutor<'e>>(
    exec: E,
    ecopoint_id: &str,
) -> Result<(i64, i64)> {
    let row: (i64, i64) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount_cents), 0), COUNT(*)
        FROM   donations
        WHERE  ecopoint_id = ?1 AND status = ?2
        "#,
    )
    .bind(ecopoint_id)
    .bind(DonationStatus::Completed)
    .fetch_one(exec)
    .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Withdrawals
// ─────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: String,
    ecopoint_id: String,
    user_id: String,
    amount_gross_cents: i64,
    platform_fee_cents: i64,
    amount_net_cents: i64,
    pix_key: String,
    pix_key_type: PixKeyType,
    status: WithdrawalStatus,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<WithdrawalRow> for Withdrawal {
    fn from(row: WithdrawalRow) -> Self {
        Withdrawal {
            id: row.id,
            ecopoint_id: row.ecopoint_id,
            user_id: row.user_id,
            amount_gross: from_cents(row.amount_gross_cents),
            platform_fee: from_cents(row.platform_fee_cents),
            amount_net: from_cents(row.amount_net_cents),
            pix_key: row.pix_key,
            pix_key_type: row.pix_key_type,
            status: row.status,
            created_at: row.created_at,
            processed_at: row.processed_at,
        }
    }
}

const WITHDRAWAL_COLUMNS: &str = "id, ecopoint_id, user_id, amount_gross_cents, platform_fee_cents, \
     amount_net_cents, pix_key, pix_key_type, status, created_at, processed_at";

/// Net amount (in cents) of withdrawals that still hold or have already
/// paid out funds: everything except `rejected`.
pub async fn reserved_withdrawal_cents<'e, E: SqliteExecutor<'e>>(
    exec: E,
    ecopoint_id: &str,
) -> Result<i64> {
    let (total,): (i64,) = sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(amount_net_cents), 0)
        FROM   withdrawals
        WHERE  ecopoint_id = ?1 AND status IN (?2, ?3, ?4)
        "#,
    )
    .bind(ecopoint_id)
    .bind(WithdrawalStatus::Pending)
    .bind(WithdrawalStatus::Processing)
    .bind(WithdrawalStatus::Completed)
    .fetch_one(exec)
    .await?;
    Ok(total)
}

pub async fn has_in_flight_withdrawal<'e, E: SqliteExecutor<'e>>(
    exec: E,
    ecopoint_id: &str,
) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM withdrawals WHERE ecopoint_id = ?1 AND status IN (?2, ?3) LIMIT 1",
    )
    .bind(ecopoint_id)
    .bind(WithdrawalStatus::IN_FLIGHT[0])
    .bind(WithdrawalStatus::IN_FLIGHT[1])
    .fetch_optional(exec)
    .await?;
    Ok(row.is_some())
}

/// Persist a withdrawal. The partial unique index on in-flight rows turns a
/// second concurrent request into [`LedgerError::DuplicateInFlight`].
pub async fn insert_withdrawal<'e, E: SqliteExecutor<'e>>(
    exec: E,
    withdrawal: &Withdrawal,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO withdrawals
            (id, ecopoint_id, user_id, amount_gross_cents, platform_fee_cents, amount_net_cents,
             pix_key, pix_key_type, status, created_at, processed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
    )
    .bind(&withdrawal.id)
    .bind(&withdrawal.ecopoint_id)
    .bind(&withdrawal.user_id)
    .bind(to_cents(withdrawal.amount_gross)?)
    .bind(to_cents(withdrawal.platform_fee)?)
    .bind(to_cents(withdrawal.amount_net)?)
    .bind(&withdrawal.pix_key)
    .bind(withdrawal.pix_key_type)
    .bind(withdrawal.status)
    .bind(withdrawal.created_at)
    .bind(withdrawal.processed_at)
    .execute(exec)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(LedgerError::DuplicateInFlight),
        Err(e) => Err(e.into()),
    }
}

pub async fn find_withdrawal<'e, E: SqliteExecutor<'e>>(
    exec: E,
    withdrawal_id: &str,
) -> Result<Option<Withdrawal>> {
    let row = sqlx::query_as::<_, WithdrawalRow>(&format!(
        "SELECT {WITHDRAWAL_COLUMNS} FROM withdrawals WHERE id = ?1"
    ))
    .bind(withdrawal_id)
    .fetch_optional(exec)
    .await?;
    Ok(row.map(Withdrawal::from))
}

/// A user's withdrawals, newest first, optionally scoped to one ecopoint.
pub async fn list_withdrawals<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    ecopoint_id: Option<&str>,
) -> Result<Vec<Withdrawal>> {
    let rows = sqlx::query_as::<_, WithdrawalRow>(&format!(
        r#"
        SELECT {WITHDRAWAL_COLUMNS}
        FROM   withdrawals
        WHERE  user_id = ?1 AND (?2 IS NULL OR ecopoint_id = ?2)
        ORDER  BY created_at DESC, rowid DESC
        "#
    ))
    .bind(user_id)
    .bind(ecopoint_id)
    .fetch_all(exec)
    .await?;
    Ok(rows.into_iter().map(Withdrawal::from).collect())
}

/// Compare-and-swap a withdrawal's status. Returns `false` if the row was not
/// in `from` any more.
pub async fn update_withdrawal_status<'e, E: SqliteExecutor<'e>>(
    exec: E,
    withdrawal_id: &str,
    from: WithdrawalStatus,
    to: WithdrawalStatus,
    processed_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE withdrawals
        SET    status = ?1, processed_at = COALESCE(?2, processed_at)
        WHERE  id = ?3 AND status = ?4
        "#,
    )
    .bind(to)
    .bind(processed_at)
    .bind(withdrawal_id)
    .bind(from)
    .execute(exec)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Reputation
// ─────────────────────────────────────────────────────────

pub async fn increment_reputation<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
    delta: ReputationDelta,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO user_reputation (user_id, points, donations_count, reviews_count, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT (user_id) DO UPDATE SET
            points          = points + excluded.points,
            donations_count = donations_count + excluded.donations_count,
            reviews_count   = reviews_count + excluded.reviews_count,
            updated_at      = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(delta.points)
    .bind(delta.donations)
    .bind(delta.reviews)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

/// `(points, donations_count, reviews_count)` for a user, if any.
pub async fn get_reputation<'e, E: SqliteExecutor<'e>>(
    exec: E,
    user_id: &str,
) -> Result<Option<(i64, i64, i64)>> {
    let row = sqlx::query_as(
        "SELECT points, donations_count, reviews_count FROM user_reputation WHERE user_id = ?1",
    )
    .bind(user_id)
    .fetch_optional(exec)
    .await?;
    Ok(row)
}
