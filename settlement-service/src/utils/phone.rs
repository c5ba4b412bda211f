//! Kenyan MSISDN normalisation for mobile-money payers.

const COUNTRY_CODE: &str = "254";
const SUBSCRIBER_DIGITS: usize = 9;

/// Normalise a payer phone number to international `254XXXXXXXXX` form.
///
/// Accepts local `0XXXXXXXXX`, bare `XXXXXXXXX` and international
/// `254XXXXXXXXX` (optionally `+`-prefixed, with spaces or dashes).
/// Anything else is rejected.
pub fn normalize_msisdn(input: &str) -> Result<String, String> {
    let digits: String = input
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .collect();

    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid phone number '{}'", input));
    }

    let subscriber = match digits.len() {
        n if n == COUNTRY_CODE.len() + SUBSCRIBER_DIGITS => digits.strip_prefix(COUNTRY_CODE),
        n if n == SUBSCRIBER_DIGITS + 1 => digits.strip_prefix('0'),
        SUBSCRIBER_DIGITS => Some(digits.as_str()),
        _ => None,
    }
    .ok_or_else(|| {
        format!(
            "invalid phone number '{}': expected 254 followed by {} digits",
            input, SUBSCRIBER_DIGITS
        )
    })?;

    Ok(format!("{}{}", COUNTRY_CODE, subscriber))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_bare_and_international_forms_agree() {
        for input in ["0712345678", "712345678", "254712345678", "+254 712-345-678"] {
            assert_eq!(normalize_msisdn(input).unwrap(), "254712345678", "{}", input);
        }
    }

    #[test]
    fn bare_subscriber_number_starting_with_country_code_is_kept() {
        assert_eq!(normalize_msisdn("254712345").unwrap(), "254254712345");
        assert_eq!(normalize_msisdn("0254712345").unwrap(), "254254712345");
    }

    #[test]
    fn twelve_digits_must_carry_the_country_code() {
        assert!(normalize_msisdn("255712345678").is_err());
        assert!(normalize_msisdn("1712345678").is_err());
    }

    #[test]
    fn rejects_short_long_and_non_numeric() {
        assert!(normalize_msisdn("071234").is_err());
        assert!(normalize_msisdn("07123456789").is_err());
        assert!(normalize_msisdn("2547123456789").is_err());
        assert!(normalize_msisdn("07abc45678").is_err());
        assert!(normalize_msisdn("").is_err());
    }
}
