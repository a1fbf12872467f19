//! Ledger entities as seen by the rest of the service.
//!
//! Amounts are [`Decimal`] with two decimal places; the database stores
//! them as integer cents (see [`crate::money`]).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::LedgerError;

/// Lifecycle of a donation.
///
/// ```text
/// pending ──► completed
///    └──────► failed
/// ```
///
/// Both `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum DonationStatus {
    Pending,
    Completed,
    Failed,
}

impl DonationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Payment provider that owns a donation's `payment_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    MercadoPago,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::MercadoPago => "mercadopago",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stripe" => Ok(Self::Stripe),
            "mercadopago" => Ok(Self::MercadoPago),
            other => Err(LedgerError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Donation {
    pub id: String,
    pub ecopoint_id: String,
    pub user_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub payment_id: String,
    pub provider: ProviderKind,
    pub status: DonationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a withdrawal.
///
/// ```text
/// pending ──► processing ──► completed
///    │             └───────► rejected
///    └─────────────────────► rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    /// Statuses that reserve funds and block a new request.
    pub const IN_FLIGHT: [WithdrawalStatus; 2] = [Self::Pending, Self::Processing];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
        }
    }

    pub fn can_transition_to(self, next: WithdrawalStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Rejected)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Rejected)
        )
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum PixKeyType {
    Cpf,
    Cnpj,
    Email,
    Phone,
    Random,
}

impl PixKeyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpf => "CPF",
            Self::Cnpj => "CNPJ",
            Self::Email => "EMAIL",
            Self::Phone => "PHONE",
            Self::Random => "RANDOM",
        }
    }
}

impl std::str::FromStr for PixKeyType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CPF" => Ok(Self::Cpf),
            "CNPJ" => Ok(Self::Cnpj),
            "EMAIL" => Ok(Self::Email),
            "PHONE" => Ok(Self::Phone),
            "RANDOM" => Ok(Self::Random),
            other => Err(LedgerError::InvalidPixKeyType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Withdrawal {
    pub id: String,
    pub ecopoint_id: String,
    pub user_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_gross: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub platform_fee: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount_net: Decimal,
    pub pix_key: String,
    pub pix_key_type: PixKeyType,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum EcopointStatus {
    Pending,
    Validated,
    Rejected,
}

/// The slice of an ecopoint this service cares about.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Ecopoint {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub status: EcopointStatus,
    pub accepts_donations: bool,
}

impl Ecopoint {
    pub fn can_receive_donations(&self) -> bool {
        self.status == EcopointStatus::Validated && self.accepts_donations
    }
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
}

/// Increment applied to a user's reputation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReputationDelta {
    pub points: i64,
    pub donations: i64,
    pub reviews: i64,
}

impl ReputationDelta {
    /// Awarded once per completed donation.
    pub const DONATION_COMPLETED: ReputationDelta = ReputationDelta {
        points: 10,
        donations: 1,
        reviews: 0,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withdrawal_transitions() {
        use WithdrawalStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Rejected));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Rejected));
        assert!(!Rejected.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn donation_terminal_states() {
        assert!(!DonationStatus::Pending.is_terminal());
        assert!(DonationStatus::Completed.is_terminal());
        assert!(DonationStatus::Failed.is_terminal());
    }

    #[test]
    fn pix_key_type_parsing_is_exact() {
        assert_eq!("CPF".parse::<PixKeyType>().unwrap(), PixKeyType::Cpf);
        assert_eq!("RANDOM".parse::<PixKeyType>().unwrap(), PixKeyType::Random);
        assert!("cpf".parse::<PixKeyType>().is_err());
        assert!("IBAN".parse::<PixKeyType>().is_err());
    }

    #[test]
    fn provider_kind_round_trips_path_segment() {
        for kind in [ProviderKind::Stripe, ProviderKind::MercadoPago] {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert!("paypal".parse::<ProviderKind>().is_err());
    }
}
