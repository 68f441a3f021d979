//! Local identifier validation.
//!
//! Validation failures are reported before any network call is made; an
//! identifier that fails here never reaches the backend.

use crate::auth::AuthMethod;
use crate::error::{Result, WidgetError};
use regex::Regex;
use std::sync::LazyLock;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$").expect("valid email pattern")
});

/// Validate an email address.
///
/// # Errors
///
/// Returns a validation error when the address is not plausibly an email.
pub fn validate_email(email: &str) -> Result<()> {
    let email = email.trim();
    if email.is_empty() {
        return Err(WidgetError::Validation("email address is empty".to_owned()));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(WidgetError::Validation(format!(
            "'{email}' is not a valid email address"
        )));
    }
    Ok(())
}

/// Validate a phone number: exactly 10 digits, starting 6–9.
///
/// # Errors
///
/// Returns a validation error otherwise.
pub fn validate_phone(phone: &str) -> Result<()> {
    let phone = phone.trim();
    if phone.len() != 10 || !phone.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WidgetError::Validation(
            "phone number must be exactly 10 digits".to_owned(),
        ));
    }
    if !matches!(phone.as_bytes()[0], b'6'..=b'9') {
        return Err(WidgetError::Validation(
            "phone number must start with 6-9".to_owned(),
        ));
    }
    Ok(())
}

/// Validate an identifier for the given auth method.
///
/// # Errors
///
/// Returns a validation error when the identifier does not match the
/// method's format.
pub fn validate_identifier(method: AuthMethod, identifier: &str) -> Result<()> {
    match method {
        AuthMethod::Email => validate_email(identifier),
        AuthMethod::Phone => validate_phone(identifier),
    }
}

/// Validate an OTP code: exactly `length` ASCII digits.
///
/// # Errors
///
/// Returns a validation error otherwise.
pub fn validate_otp_code(code: &str, length: usize) -> Result<()> {
    if code.len() != length || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WidgetError::Validation(format!(
            "OTP code must be exactly {length} digits"
        )));
    }
    Ok(())
}
