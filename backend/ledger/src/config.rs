//! Application configuration loaded from environment variables.

use crate::errors::{LedgerError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database location (e.g. sqlite:./ecomapa_ledger.db)
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Timeout applied to every outbound HTTP call
    pub http_timeout_secs: u64,
    pub stripe: ProviderConfig,
    pub mercadopago: ProviderConfig,
    /// Maximum clock skew accepted on signed webhook timestamps
    pub webhook_tolerance_secs: i64,
    pub email: EmailConfig,
    /// Shared secret for the administrative routes; `None` disables them
    pub admin_api_key: Option<String>,
    /// How often (in seconds) to re-check stale pending donations; 0 disables
    pub sweep_interval_secs: u64,
    /// Only donations pending for at least this long are swept
    pub sweep_min_age_secs: i64,
}

/// Credentials and endpoint for one payment provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_url: String,
    /// Secret key / access token used for API calls
    pub api_key: String,
    /// Shared secret used to sign webhook deliveries
    pub webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_url: String,
    /// Resend API key; email is disabled when absent
    pub api_key: Option<String>,
    pub from: String,
    pub admin_email: String,
    pub site_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./ecomapa_ledger.db".to_string()),
            api_port: parse_var("API_PORT", "3001")?,
            http_timeout_secs: parse_var("HTTP_TIMEOUT_SECS", "5")?,
            stripe: ProviderConfig {
                api_url: env_var("STRIPE_API_URL")
                    .unwrap_or_else(|_| "https://api.stripe.com".to_string()),
                api_key: required("STRIPE_SECRET_KEY")?,
                webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            },
            mercadopago: ProviderConfig {
                api_url: env_var("MERCADOPAGO_API_URL")
                    .unwrap_or_else(|_| "https://api.mercadopago.com".to_string()),
                api_key: required("MERCADOPAGO_ACCESS_TOKEN")?,
                webhook_secret: required("MERCADOPAGO_WEBHOOK_SECRET")?,
            },
            webhook_tolerance_secs: parse_var("WEBHOOK_TOLERANCE_SECS", "300")?,
            email: EmailConfig {
                api_url: env_var("RESEND_API_URL")
                    .unwrap_or_else(|_| "https://api.resend.com".to_string()),
                api_key: env_var("RESEND_API_KEY").ok().filter(|k| !k.is_empty()),
                from: env_var("EMAIL_FROM")
                    .unwrap_or_else(|_| "EcoMapa <noreply@ecomapa.com.br>".to_string()),
                admin_email: env_var("ADMIN_EMAIL")
                    .unwrap_or_else(|_| "admin@ecomapa.com.br".to_string()),
                site_url: env_var("SITE_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            admin_api_key: env_var("ADMIN_API_KEY").ok().filter(|k| !k.is_empty()),
            sweep_interval_secs: parse_var("SWEEP_INTERVAL_SECS", "60")?,
            sweep_min_age_secs: parse_var("SWEEP_MIN_AGE_SECS", "300")?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| LedgerError::Config(format!("Missing env var: {key}")))
}

fn required(key: &str) -> Result<String> {
    env_var(key).map_err(|_| LedgerError::Config(format!("{key} environment variable is required")))
}

fn parse_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    env_var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| LedgerError::Config(format!("Invalid {key}")))
}
