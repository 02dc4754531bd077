/// Render a base-unit amount with `decimals` fractional digits, exact for any `u128`.
pub fn format_token_amount(amount: u128, decimals: u32) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let (whole, fraction) = match 10u128.checked_pow(decimals) {
        Some(scale) => (amount / scale, amount % scale),
        // Past 10^38 the scale exceeds every u128, so it is all fraction.
        None => (0, amount),
    };
    format!("{}.{:0width$}", whole, fraction, width = decimals as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_hastings_as_siacoins() {
        assert_eq!(
            format_token_amount(1_500_000_000_000_000_000_000_000, 24),
            "1.500000000000000000000000"
        );
        assert_eq!(format_token_amount(42, 2), "0.42");
        assert_eq!(format_token_amount(7, 0), "7");
    }

    #[test]
    fn huge_decimal_counts_do_not_overflow() {
        let formatted = format_token_amount(u128::MAX, 40);
        assert_eq!(formatted.len(), "0.".len() + 40);
        assert!(formatted.starts_with("0.00"));
        assert!(formatted.ends_with(&u128::MAX.to_string()));

        assert_eq!(
            format_token_amount(5, 38),
            format!("0.{}5", "0".repeat(37))
        );
    }
}
