//! Structural checks for PIX payout keys.
//!
//! These only check shape (digit counts, e-mail syntax, UUID layout); CPF and
//! CNPJ check digits are left to the bank.

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::models::PixKeyType;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?)+$",
        )
        .expect("static regex")
    })
}

// Country code + area code + subscriber number, e.g. +5511987654321.
fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[1-9]\d{11,13}$").expect("static regex"))
}

fn all_digits(key: &str, len: usize) -> bool {
    key.len() == len && key.bytes().all(|b| b.is_ascii_digit())
}

/// Whether `key` has the structure expected for `kind`.
pub fn is_valid_pix_key(key: &str, kind: PixKeyType) -> bool {
    match kind {
        PixKeyType::Cpf => all_digits(key, 11),
        PixKeyType::Cnpj => all_digits(key, 14),
        PixKeyType::Email => key.len() <= 77 && email_re().is_match(key),
        PixKeyType::Phone => phone_re().is_match(key),
        PixKeyType::Random => key.len() == 36 && Uuid::try_parse(key).is_ok(),
    }
}
