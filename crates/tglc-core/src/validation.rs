//! Canonical input validation shared by the registry, pipeline and service ingress.

use crate::error::CreditError;
use crate::types::LiquidityRequest;

/// Upper bound on any single request: 1e9 major units at two decimals.
pub const MAX_AMOUNT_MINOR: u64 = 100_000_000_000;

const MAX_IDENTIFIER_LEN: usize = 128;
const MIN_DID_LEN: usize = 10;

/// Base58 alphabet used by XRPL classic addresses (no 0, O, I, l).
fn is_ripple_base58(c: char) -> bool {
    matches!(c, '1'..='9' | 'A'..='H' | 'J'..='N' | 'P'..='Z' | 'a'..='k' | 'm'..='z')
}

/// `^r[1-9A-HJ-NP-Za-km-z]{25,34}$`
pub fn validate_address(address: &str) -> Result<(), CreditError> {
    let mut chars = address.chars();
    let valid = chars.next() == Some('r')
        && (26..=35).contains(&address.len())
        && chars.all(is_ripple_base58);
    if !valid {
        return Err(CreditError::validation(format!(
            "invalid XRPL address '{}'",
            address
        )));
    }
    Ok(())
}

/// `[A-Z0-9]{3,40}`
pub fn validate_currency(code: &str) -> Result<(), CreditError> {
    let valid = (3..=40).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if !valid {
        return Err(CreditError::validation(format!(
            "invalid issued currency '{}'",
            code
        )));
    }
    Ok(())
}

pub fn validate_amount(field: &str, amount_minor: u64) -> Result<(), CreditError> {
    if amount_minor == 0 {
        return Err(CreditError::validation(format!("{field} must be positive")));
    }
    if amount_minor > MAX_AMOUNT_MINOR {
        return Err(CreditError::validation(format!(
            "{field} {amount_minor} exceeds maximum {MAX_AMOUNT_MINOR}"
        )));
    }
    Ok(())
}

pub fn validate_did(did: &str) -> Result<(), CreditError> {
    if !did.starts_with("did:") || did.len() < MIN_DID_LEN || did.chars().any(char::is_whitespace)
    {
        return Err(CreditError::validation(format!(
            "invalid business DID '{}'",
            did
        )));
    }
    Ok(())
}

pub fn validate_identifier(field: &str, value: &str) -> Result<(), CreditError> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(CreditError::validation(format!(
            "{field} must be 1..={MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(CreditError::validation(format!(
            "{field} '{}' contains whitespace or control characters",
            value.escape_debug()
        )));
    }
    Ok(())
}

/// Structural validation of a request, run before any state is touched.
pub fn validate_request(request: &LiquidityRequest) -> Result<(), CreditError> {
    validate_identifier("request_id", &request.request_id)?;
    validate_did(&request.business_did)?;
    validate_identifier("business_id", &request.business_id)?;
    validate_identifier("bank_id", &request.bank_id)?;
    validate_address(&request.principal_address)?;
    validate_amount("requested_amount_minor", request.requested_amount_minor)?;
    if request.requested_duration_days == Some(0) {
        return Err(CreditError::validation(
            "requested_duration_days must be positive",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_rules_follow_strict_variant() {
        assert!(validate_address("rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe").is_ok());
        // Too short for the strict rule even though it starts with 'r'.
        assert!(validate_address("rShort1234567890123456").is_err());
        // '0' and 'l' are outside the base58 alphabet.
        assert!(validate_address("rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAY0").is_err());
        assert!(validate_address("rPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYl").is_err());
        assert!(validate_address("xPT1Sjq2YGrBMTttX4GZHjKu9dyfzbpAYe").is_err());
    }

    #[test]
    fn currency_rules() {
        assert!(validate_currency("USD").is_ok());
        assert!(validate_currency("CORRIDOR0ELIGIBLE").is_ok());
        assert!(validate_currency("US").is_err());
        assert!(validate_currency("usd").is_err());
        assert!(validate_currency("CORRIDOR_ELIGIBLE").is_err());
    }

    #[test]
    fn amount_bounds() {
        assert!(validate_amount("amount", 1).is_ok());
        assert!(validate_amount("amount", MAX_AMOUNT_MINOR).is_ok());
        assert!(validate_amount("amount", 0).is_err());
        assert!(validate_amount("amount", MAX_AMOUNT_MINOR + 1).is_err());
    }

    #[test]
    fn did_and_identifier_rules() {
        assert!(validate_did("did:xrpl:biz-1").is_ok());
        assert!(validate_did("did:x").is_err());
        assert!(validate_did("business-1234").is_err());
        assert!(validate_identifier("bank_id", "bank-a").is_ok());
        assert!(validate_identifier("bank_id", "").is_err());
        assert!(validate_identifier("bank_id", "bank a").is_err());
    }
}
