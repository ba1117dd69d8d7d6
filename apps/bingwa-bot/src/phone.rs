use crate::error::BotError;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s\-()]").unwrap());

// Safaricom/Airtel mobile ranges: 7XXXXXXXX and 1XXXXXXXX.
static INTERNATIONAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+?254([17][0-9]{8})$").unwrap());
static LOCAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^0([17][0-9]{8})$").unwrap());

/// Kenyan mobile number in canonical `254XXXXXXXXX` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Msisdn(String);

impl Msisdn {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Msisdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Accepts `07…`/`01…`, `2547…`/`2541…` and `+2547…`/`+2541…`.
pub fn normalize(input: &str) -> Result<Msisdn, BotError> {
    let cleaned = SEPARATORS.replace_all(input.trim(), "");

    let subscriber = INTERNATIONAL
        .captures(&cleaned)
        .or_else(|| LOCAL.captures(&cleaned))
        .and_then(|caps| caps.get(1))
        .ok_or(BotError::InvalidPhoneFormat)?;

    Ok(Msisdn(format!("254{}", subscriber.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_formats_share_one_canonical_form() {
        for input in ["0712345678", "254712345678", "+254712345678"] {
            assert_eq!(normalize(input).unwrap().as_str(), "254712345678", "input {input}");
        }
    }

    #[test]
    fn separators_are_ignored() {
        assert_eq!(normalize(" 0712 345-678 ").unwrap().as_str(), "254712345678");
        assert_eq!(normalize("(+254) 110 123 456").unwrap().as_str(), "254110123456");
    }

    #[test]
    fn airtel_one_prefix_is_accepted() {
        assert_eq!(normalize("0110123456").unwrap().as_str(), "254110123456");
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        for input in [
            "",
            "hello",
            "07123abc78",
            "071234567",
            "07123456789",
            "0812345678",
            "712345678",
            "+255712345678",
            "25471234567",
            "++254712345678",
            "07١٢٣٤٥٦٧٨",
            "25471234567８",
        ] {
            assert!(
                matches!(normalize(input), Err(BotError::InvalidPhoneFormat)),
                "input {input:?} should be rejected"
            );
        }
    }
}
