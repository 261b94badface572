//! Boundary validation helpers.
//!
//! Configuration and registration calls validate here so that malformed
//! input never reaches the engines' state machines.

use crate::types::{Error, Result};

/// Validate that a string is not empty or whitespace.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate that a count is positive.
pub fn validate_positive(n: u64, field: &str) -> Result<()> {
    if n == 0 {
        return Err(Error::validation(format!("{} must be positive", field)));
    }
    Ok(())
}

/// Validate a 0..=100 score (health, battery). NaN is rejected.
pub fn validate_percent(value: f64, field: &str) -> Result<()> {
    if !(0.0..=100.0).contains(&value) {
        return Err(Error::validation(format!("{} must be within 0..=100, got {}", field, value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert!(validate_non_empty("rule-1", "name").is_ok());
        let err = validate_non_empty("  ", "name").unwrap_err();
        assert_eq!(err.to_string(), "validation error: name cannot be empty");
    }

    #[test]
    fn test_positive() {
        assert!(validate_positive(1, "min_events").is_ok());
        assert!(validate_positive(0, "min_events").is_err());
    }

    #[test]
    fn test_percent_bounds() {
        assert!(validate_percent(0.0, "health").is_ok());
        assert!(validate_percent(100.0, "health").is_ok());
        assert!(validate_percent(100.5, "health").is_err());
        assert!(validate_percent(f64::NAN, "health").is_err());
    }
}
