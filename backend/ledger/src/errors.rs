//! Application-wide error types.

use rust_decimal::Decimal;
use thiserror::Error;

/// How a failure should be surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// User-correctable input.
    Validation,
    /// Caller is not authenticated or not allowed to act.
    Authorization,
    /// Absent, or not visible to the caller.
    NotFound,
    /// Valid input that collides with current ledger state.
    Conflict,
    /// Infrastructure failure; the caller may retry.
    Transient,
    /// Never retry verbatim.
    Permanent,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Email provider error: {0}")]
    Email(String),

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid fields: {0}")]
    MissingFields(String),

    #[error("Invalid withdrawal amount")]
    InvalidAmount,

    #[error("Invalid PIX key type: {0}")]
    InvalidPixKeyType(String),

    #[error("PIX key does not match type {0}")]
    InvalidPixKeyFormat(String),

    #[error("Invalid donation amount: {0} cents")]
    InvalidDonationAmount(i64),

    #[error("Requester is not authenticated")]
    Unauthenticated,

    #[error("Requester does not own the ecopoint")]
    NotOwner,

    #[error("Ecopoint not found")]
    EcopointNotFound,

    #[error("Ecopoint is not validated")]
    EcopointNotValidated,

    #[error("Ecopoint does not accept donations")]
    DonationsDisabled,

    #[error("Donation not found")]
    DonationNotFound,

    #[error("Withdrawal not found")]
    WithdrawalNotFound,

    #[error("Unknown payment provider: {0}")]
    UnknownProvider(String),

    #[error("A withdrawal is already in flight for this ecopoint")]
    DuplicateInFlight,

    #[error("Insufficient balance (available {available})")]
    InsufficientBalance { available: Decimal },

    #[error("Duplicate payment id: {0}")]
    DuplicatePayment(String),

    #[error("Withdrawal cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Webhook signature verification failed: {0}")]
    InvalidSignature(String),
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::BadRequest(_)
            | Self::MissingFields(_)
            | Self::InvalidAmount
            | Self::InvalidPixKeyType(_)
            | Self::InvalidPixKeyFormat(_)
            | Self::InvalidDonationAmount(_)
            | Self::EcopointNotValidated
            | Self::DonationsDisabled => ErrorClass::Validation,
            Self::Unauthenticated | Self::NotOwner => ErrorClass::Authorization,
            Self::EcopointNotFound
            | Self::DonationNotFound
            | Self::WithdrawalNotFound
            | Self::UnknownProvider(_) => ErrorClass::NotFound,
            Self::DuplicateInFlight
            | Self::InsufficientBalance { .. }
            | Self::DuplicatePayment(_)
            | Self::InvalidTransition { .. } => ErrorClass::Conflict,
            Self::InvalidSignature(_) => ErrorClass::Permanent,
            Self::Database(_)
            | Self::Migrate(_)
            | Self::Http(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Provider(_)
            | Self::Email(_) => ErrorClass::Transient,
        }
    }

    /// Short pt-BR message shown to end users.
    pub fn user_message(&self) -> String {
        match self {
            Self::BadRequest(_) => "Requisição inválida".to_string(),
            Self::MissingFields(_) => "Campos obrigatórios faltando ou inválidos".to_string(),
            Self::InvalidAmount => "Valor mínimo para saque é R$ 10.00".to_string(),
            Self::InvalidPixKeyType(_) => "Tipo de chave PIX inválido".to_string(),
            Self::InvalidPixKeyFormat(kind) => format!("Chave PIX inválida para o tipo {kind}"),
            Self::InvalidDonationAmount(_) => {
                "Valor deve estar entre R$ 2,00 e R$ 1.000,00".to_string()
            }
            Self::Unauthenticated => "Não autenticado".to_string(),
            Self::NotOwner => "Você não é o proprietário deste ecoponto".to_string(),
            Self::EcopointNotFound => "Ecoponto não encontrado".to_string(),
            Self::EcopointNotValidated => {
                "Apenas ecopontos validados podem receber doações".to_string()
            }
            Self::DonationsDisabled => "Este ecoponto não aceita doações".to_string(),
            Self::DonationNotFound => "Doação não encontrada".to_string(),
            Self::WithdrawalNotFound => "Saque não encontrado".to_string(),
            Self::UnknownProvider(_) => "Recurso não encontrado".to_string(),
            Self::DuplicateInFlight => {
                "Já existe uma solicitação de saque pendente para este ecoponto".to_string()
            }
            Self::InsufficientBalance { available } => {
                format!("Saldo insuficiente. Disponível: R$ {available:.2}")
            }
            Self::DuplicatePayment(_) => "Pagamento já registrado".to_string(),
            Self::InvalidTransition { .. } => "Transição de status inválida".to_string(),
            Self::InvalidSignature(_) => "Assinatura inválida".to_string(),
            Self::Database(_)
            | Self::Migrate(_)
            | Self::Http(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Provider(_)
            | Self::Email(_) => "Erro interno, tente novamente".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
