//! Phone number normalization.

use leadflow_core::error::{LeadflowError, Result};

/// Canonical `+<digits>` form.
///
/// Only the shape is fixed here. Nothing checks that the result is dialable,
/// so malformed input comes out as a plausible but possibly invalid number.
pub fn normalize_phone(raw: &str, country_code: &str) -> Result<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(LeadflowError::Validation(format!(
            "phone number '{raw}' contains no digits"
        )));
    }

    if raw.trim_start().starts_with('+') {
        return Ok(format!("+{digits}"));
    }
    if !country_code.is_empty()
        && digits.len() == 10 + country_code.len()
        && digits.starts_with(country_code)
    {
        return Ok(format!("+{digits}"));
    }
    if digits.len() == 10 {
        return Ok(format!("+{country_code}{digits}"));
    }
    Ok(format!("+{digits}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        assert_eq!(normalize_phone("1234567890", "1").unwrap(), "+11234567890");
        assert_eq!(normalize_phone("+44 20 7946 0958", "1").unwrap(), "+442079460958");
        assert_eq!(normalize_phone("11234567890", "1").unwrap(), "+11234567890");
    }

    #[test]
    fn test_formatting_is_stripped() {
        assert_eq!(normalize_phone("(555) 123-4567", "1").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("  +1 (555) 123-4567 ", "1").unwrap(), "+15551234567");
        assert_eq!(normalize_phone("++49 30 1234", "1").unwrap(), "+49301234");
    }

    #[test]
    fn test_other_lengths_pass_through() {
        assert_eq!(normalize_phone("4930123456789", "1").unwrap(), "+4930123456789");
        assert_eq!(normalize_phone("12345", "1").unwrap(), "+12345");
    }

    #[test]
    fn test_other_country_code() {
        assert_eq!(normalize_phone("2079460958", "44").unwrap(), "+442079460958");
        assert_eq!(normalize_phone("442079460958", "44").unwrap(), "+442079460958");
    }

    #[test]
    fn test_no_digits_is_validation_error() {
        assert!(normalize_phone("", "1").unwrap_err().is_validation());
        assert!(normalize_phone("call me", "1").unwrap_err().is_validation());
    }
}
