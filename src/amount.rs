//! Exact conversions between smallest-unit integer amounts (attoFIL) and their
//! decimal display form.
//!
//! Everything is computed on [`BigUint`]; the division by `10^decimals` only
//! happens when the display string is rendered.

use num_bigint::BigUint;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Invalid integer amount '{0}'")]
    InvalidInteger(String),

    #[error("Invalid decimal amount '{0}'")]
    InvalidDecimal(String),

    #[error("Amount '{value}' has more than {decimals} fractional digits")]
    PrecisionOverflow { value: String, decimals: u32 },
}

/// Parses a non-negative base-10 integer string.
pub fn parse_integer(value: &str) -> Result<BigUint, AmountError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::InvalidInteger(value.to_string()));
    }
    BigUint::parse_bytes(trimmed.as_bytes(), 10).ok_or_else(|| AmountError::InvalidInteger(value.to_string()))
}

/// Renders `value / 10^decimals` without trailing fractional zeros.
pub fn format_units(value: &BigUint, decimals: u32) -> String {
    let digits = value.to_str_radix(10);
    let decimals = decimals as usize;
    if decimals == 0 {
        return digits;
    }

    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals - digits.len() + 1), digits)
    } else {
        digits
    };
    let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
    let frac_part = frac_part.trim_end_matches('0');
    if frac_part.is_empty() {
        int_part.to_string()
    } else {
        format!("{}.{}", int_part, frac_part)
    }
}

/// Converts a smallest-unit integer string into its display form.
pub fn to_display(value: &str, decimals: u32) -> Result<String, AmountError> {
    Ok(format_units(&parse_integer(value)?, decimals))
}

/// Converts a display amount back into its smallest-unit integer.
pub fn to_smallest_unit(display: &str, decimals: u32) -> Result<BigUint, AmountError> {
    let trimmed = display.trim();
    let (int_part, frac_part) = match trimmed.split_once('.') {
        Some((i, f)) => (i, f),
        None => (trimmed, ""),
    };

    let all_digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part) {
        return Err(AmountError::InvalidDecimal(display.to_string()));
    }
    if frac_part.len() > decimals as usize {
        return Err(AmountError::PrecisionOverflow {
            value: display.to_string(),
            decimals,
        });
    }

    let combined = format!(
        "{}{}{}",
        if int_part.is_empty() { "0" } else { int_part },
        frac_part,
        "0".repeat(decimals as usize - frac_part.len())
    );
    BigUint::parse_bytes(combined.as_bytes(), 10).ok_or_else(|| AmountError::InvalidDecimal(display.to_string()))
}

/// `gas * gas_price` in smallest units.
pub fn fee(gas: &str, gas_price: &str) -> Result<BigUint, AmountError> {
    Ok(parse_integer(gas)? * parse_integer(gas_price)?)
}
