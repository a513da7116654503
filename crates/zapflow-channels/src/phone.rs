//! Best-effort phone normalization. Not an E.164 validator: a 10–11 digit
//! number is assumed to be a national number missing its country code.

/// Numbers with at least this many digits already carry a country code.
const MIN_INTERNATIONAL_DIGITS: usize = 12;

/// Strip everything but digits and prepend `country_code` to national numbers.
pub fn normalize_phone(raw: &str, country_code: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || digits.len() >= MIN_INTERNATIONAL_DIGITS {
        return digits;
    }
    format!("{country_code}{digits}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_number_gets_country_code() {
        let n = normalize_phone("11999998888", "55");
        assert_eq!(n, "5511999998888");
        assert!(n.len() >= 12);
    }

    #[test]
    fn test_prefixed_number_unchanged() {
        assert_eq!(normalize_phone("5511999998888", "55"), "5511999998888");
    }

    #[test]
    fn test_formatting_is_stripped() {
        assert_eq!(normalize_phone("+55 (11) 99999-8888", "55"), "5511999998888");
        assert_eq!(normalize_phone("(21) 3333-4444", "55"), "552133334444");
    }

    #[test]
    fn test_empty_stays_empty() {
        assert_eq!(normalize_phone("n/a", "55"), "");
    }
}
