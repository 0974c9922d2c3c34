use std::fmt;

/// Money is represented as an integer count of the currency's minor unit.
/// VND has no minor unit, so 500,000 VND is stored as `500_000`.
pub type Money = i64;

/// Format an amount with thousands separators.
/// Example: 500000 -> "500,000", -1500 -> "-1,500"
pub fn format_money(amount: Money) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

/// Parse a whole-unit amount, accepting `,` and `_` as digit separators.
/// Example: "500,000" -> 500000, "150_000" -> 150000
pub fn parse_money(input: &str) -> Result<Money, ParseMoneyError> {
    let input = input.trim();
    let (negative, digits) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };

    let cleaned: String = digits.chars().filter(|c| *c != ',' && *c != '_').collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseMoneyError::InvalidFormat);
    }

    let value: Money = cleaned.parse().map_err(|_| ParseMoneyError::Overflow)?;
    Ok(if negative { -value } else { value })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseMoneyError {
    InvalidFormat,
    Overflow,
}

impl fmt::Display for ParseMoneyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseMoneyError::InvalidFormat => write!(f, "invalid money format"),
            ParseMoneyError::Overflow => write!(f, "amount is too large"),
        }
    }
}

impl std::error::Error for ParseMoneyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_money() {
        assert_eq!(format_money(0), "0");
        assert_eq!(format_money(999), "999");
        assert_eq!(format_money(1000), "1,000");
        assert_eq!(format_money(500000), "500,000");
        assert_eq!(format_money(1234567), "1,234,567");
        assert_eq!(format_money(-1500), "-1,500");
    }

    #[test]
    fn test_parse_money() {
        assert_eq!(parse_money("500000"), Ok(500000));
        assert_eq!(parse_money("500,000"), Ok(500000));
        assert_eq!(parse_money(" 150_000 "), Ok(150000));
        assert_eq!(parse_money("-30,000"), Ok(-30000));
    }

    #[test]
    fn test_parse_money_invalid() {
        assert_eq!(parse_money(""), Err(ParseMoneyError::InvalidFormat));
        assert_eq!(parse_money("12.50"), Err(ParseMoneyError::InvalidFormat));
        assert_eq!(parse_money("abc"), Err(ParseMoneyError::InvalidFormat));
        assert_eq!(
            parse_money("99999999999999999999"),
            Err(ParseMoneyError::Overflow)
        );
    }
}
