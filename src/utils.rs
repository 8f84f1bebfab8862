// src/utils.rs
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Format a USD value in a human-readable way ("$1.20M", "$350.00K")
pub fn format_usd(value: Decimal) -> String {
    let v = value.to_f64().unwrap_or(0.0);
    if v >= 1_000_000_000.0 {
        format!("${:.2}B", v / 1_000_000_000.0)
    } else if v >= 1_000_000.0 {
        format!("${:.2}M", v / 1_000_000.0)
    } else if v >= 1_000.0 {
        format!("${:.2}K", v / 1_000.0)
    } else {
        format!("${:.2}", v)
    }
}

/// Shorten a wallet address for display: 0x1234...abcd
pub fn shorten_address(address: &str) -> String {
    // Counted in chars, not bytes: feed-supplied strings are untrusted and
    // byte slicing would panic off a UTF-8 boundary.
    let total = address.chars().count();
    if total <= 12 {
        return address.to_string();
    }
    let head: String = address.chars().take(6).collect();
    let tail: String = address.chars().skip(total - 4).collect();
    format!("{}...{}", head, tail)
}

/// Validate Solana address format
pub fn is_valid_solana_address(address: &str) -> bool {
    // Basic validation - Solana addresses are base58 encoded and 32-44 characters
    address.len() >= 32
        && address.len() <= 44
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() && !"0OIl".contains(c))
}

/// Validate EVM (Ethereum/BSC/Avalanche) address format
pub fn is_valid_evm_address(address: &str) -> bool {
    // EVM addresses are 42 characters starting with 0x
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Whether an address looks right for its chain's format.
pub fn is_plausible_address(chain: crate::models::Chain, address: &str) -> bool {
    use crate::models::Chain;
    match chain {
        Chain::Solana => is_valid_solana_address(address),
        Chain::Ethereum | Chain::Bsc | Chain::Avalanche => is_valid_evm_address(address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usd_formatting_scales() {
        assert_eq!(format_usd(Decimal::from(1_200_000)), "$1.20M");
        assert_eq!(format_usd(Decimal::from(350_000)), "$350.00K");
        assert_eq!(format_usd(Decimal::from(12)), "$12.00");
        assert_eq!(format_usd(Decimal::from(2_500_000_000i64)), "$2.50B");
    }

    #[test]
    fn address_shortening() {
        assert_eq!(
            shorten_address("0x1234567890abcdef1234567890abcdef12345678"),
            "0x1234...5678"
        );
        assert_eq!(shorten_address("short"), "short");
    }

    #[test]
    fn address_shortening_handles_multibyte_input() {
        // Garbage from an untrusted feed must not panic the formatter.
        let weird = "0x12é4567890ابجدef1234";
        let short = shorten_address(weird);
        assert!(short.starts_with("0x12é4"));
        assert!(short.ends_with("1234"));
        assert_eq!(shorten_address("ééééééééééé"), "ééééééééééé");
    }

    #[test]
    fn evm_address_validation() {
        assert!(is_valid_evm_address(
            "0x1234567890abcdef1234567890abcdef12345678"
        ));
        assert!(!is_valid_evm_address("0x123"));
        assert!(!is_valid_evm_address(
            "1234567890abcdef1234567890abcdef1234567890"
        ));
    }
}
