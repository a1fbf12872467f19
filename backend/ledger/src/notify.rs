//! Outbound e-mail notifications.
//!
//! Notifications are strictly best effort: [`dispatch`] logs and swallows
//! every failure, so callers invoke it only after their financial state has
//! been committed.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::EmailConfig;
use crate::errors::{LedgerError, Result};
use crate::models::Withdrawal;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(&self, message: &EmailMessage) -> Result<()>;
}

/// Send `message`, logging instead of propagating any failure.
pub async fn dispatch(notifier: &dyn Notifier, label: &str, message: EmailMessage) {
    match notifier.send_email(&message).await {
        Ok(()) => info!(notification = label, to = %message.to, "Notification sent"),
        Err(e) => warn!(notification = label, to = %message.to, "Notification failed: {e}"),
    }
}

// ─────────────────────────────────────────────────────────
// Resend
// ─────────────────────────────────────────────────────────

pub struct ResendNotifier {
    client: Client,
    api_url: String,
    api_key: String,
    from: String,
}

#[derive(Serialize)]
struct ResendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

impl ResendNotifier {
    pub fn new(client: Client, api_url: &str, api_key: &str, from: &str) -> Self {
        ResendNotifier {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            from: from.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn send_email(&self, message: &EmailMessage) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/emails", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&ResendRequest {
                from: &self.from,
                to: [&message.to],
                subject: &message.subject,
                html: &message.html,
            })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::Email(format!("Resend returned {status}: {body}")));
        }
        Ok(())
    }
}

/// Used when no e-mail credentials are configured.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send_email(&self, message: &EmailMessage) -> Result<()> {
        Err(LedgerError::Email(format!(
            "email disabled, dropped \"{}\"",
            message.subject
        )))
    }
}

/// Pick the Resend sender when a key is configured.
pub fn from_config(client: Client, config: &EmailConfig) -> Box<dyn Notifier> {
    match &config.api_key {
        Some(key) => Box::new(ResendNotifier::new(client, &config.api_url, key, &config.from)),
        None => {
            warn!("RESEND_API_KEY not set, email notifications are disabled");
            Box::new(DisabledNotifier)
        }
    }
}

// ─────────────────────────────────────────────────────────
// Messages
// ─────────────────────────────────────────────────────────

fn brl(amount: Decimal) -> String {
    format!("R$ {amount:.2}")
}

/// Escape user-supplied text for HTML bodies and quoted attributes.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn withdrawal_owner_email(to: &str, ecopoint_name: &str, w: &Withdrawal) -> EmailMessage {
    EmailMessage {
        to: to.to_string(),
        subject: format!("Saque de {} solicitado com sucesso", brl(w.amount_net)),
        html: format!(
            "<p>Recebemos sua solicitação de saque para <strong>{}</strong>.</p>\
             <ul><li>Valor bruto: {}</li><li>Taxa da plataforma (10%): {}</li>\
             <li>Valor líquido: {}</li><li>Chave PIX ({}): {}</li></ul>\
             <p>O pagamento será processado em até 3 dias úteis.</p>",
            escape_html(ecopoint_name),
            brl(w.amount_gross),
            brl(w.platform_fee),
            brl(w.amount_net),
            w.pix_key_type.as_str(),
            escape_html(&w.pix_key),
        ),
    }
}

pub struct PayoutRequester<'a> {
    pub name: &'a str,
    pub email: &'a str,
}

pub fn withdrawal_admin_email(
    to: &str,
    ecopoint_name: &str,
    requester: &PayoutRequester<'_>,
    w: &Withdrawal,
) -> EmailMessage {
    EmailMessage {
        to: to.to_string(),
        subject: format!(
            "AÇÃO NECESSÁRIA: Novo saque de {} - {ecopoint_name}",
            brl(w.amount_net)
        ),
        html: format!(
            "<p>Novo saque aguardando pagamento.</p>\
             <ul><li>Saque: {}</li><li>Ecoponto: {} ({})</li>\
             <li>Solicitante: {} &lt;{}&gt;</li><li>Valor bruto: {}</li>\
             <li>Taxa: {}</li><li>Pagar: {}</li><li>Chave PIX ({}): {}</li>\
             <li>Solicitado em: {}</li></ul>",
            escape_html(&w.id),
            escape_html(ecopoint_name),
            escape_html(&w.ecopoint_id),
            escape_html(requester.name),
            escape_html(requester.email),
            brl(w.amount_gross),
            brl(w.platform_fee),
            brl(w.amount_net),
            w.pix_key_type.as_str(),
            escape_html(&w.pix_key),
            w.created_at.format("%d/%m/%Y %H:%M UTC"),
        ),
    }
}

pub struct DonationReceipt<'a> {
    pub ecopoint_name: &'a str,
    pub amount: Decimal,
    pub donor_name: &'a str,
    pub total_received: Decimal,
    pub donations_count: i64,
    pub dashboard_url: &'a str,
}

pub fn donation_received_email(to: &str, receipt: &DonationReceipt<'_>) -> EmailMessage {
    EmailMessage {
        to: to.to_string(),
        subject: format!("Você recebeu uma doação de {}!", brl(receipt.amount)),
        html: format!(
            "<p><strong>{}</strong> doou {} para {}.</p>\
             <p>Total recebido: {} em {} doações.</p>\
             <p><a href=\"{}\">Ver painel de doações</a></p>",
            escape_html(receipt.donor_name),
            brl(receipt.amount),
            escape_html(receipt.ecopoint_name),
            brl(receipt.total_received),
            receipt.donations_count,
            escape_html(receipt.dashboard_url),
        ),
    }
}
