//! Address grammars for sender wallets and the payout ledger
//!
//! Sender wallets (used for attribution) may be any of:
//! - EVM: 0x + 40 hex chars (Ethereum, Base, BNB share one grammar)
//! - Solana: base58, 32-44 chars, decodes to a 32-byte key
//! - Bitcoin: Bech32 bc1... or Base58 P2PKH/P2SH (1.../3...)
//!
//! Payout addresses are Zcash: t1/t3 (transparent), zs/zc (shielded),
//! u1/u2 (unified).

use std::fmt;

/// Grammar a sender wallet matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Evm,
    Solana,
    Bitcoin,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Evm => write!(f, "EVM"),
            AddressKind::Solana => write!(f, "Solana"),
            AddressKind::Bitcoin => write!(f, "Bitcoin"),
        }
    }
}

const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Identify which chain grammar a sender wallet belongs to
pub fn classify_wallet(addr: &str) -> Result<AddressKind, String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err("Wallet address is empty".to_string());
    }
    if addr.starts_with("0x") || addr.starts_with("0X") {
        return validate_evm_address(addr).map(|_| AddressKind::Evm);
    }
    if validate_btc_address(addr).is_ok() {
        return Ok(AddressKind::Bitcoin);
    }
    if validate_solana_address(addr).is_ok() {
        return Ok(AddressKind::Solana);
    }
    Err(format!(
        "Invalid wallet address '{}': expected an EVM (0x...), Solana or Bitcoin address",
        addr
    ))
}

/// Canonical storage form: hex-based and bech32 forms are case-insensitive
/// and lowercased, base58 forms keep their case.
pub fn normalize_wallet(addr: &str) -> String {
    let addr = addr.trim();
    let lower = addr.to_ascii_lowercase();
    if lower.starts_with("0x") || lower.starts_with("bc1") {
        lower
    } else {
        addr.to_string()
    }
}

pub fn validate_evm_address(addr: &str) -> Result<(), String> {
    let body = addr
        .strip_prefix("0x")
        .or_else(|| addr.strip_prefix("0X"))
        .ok_or_else(|| format!("Invalid EVM address '{}': must start with 0x", addr))?;

    if body.len() != 40 {
        return Err(format!(
            "Invalid EVM address '{}': expected 40 hex chars, got {}",
            addr,
            body.len()
        ));
    }
    hex::decode(body)
        .map(|_| ())
        .map_err(|_| format!("Invalid EVM address '{}': contains non-hex characters", addr))
}

pub fn validate_solana_address(addr: &str) -> Result<(), String> {
    if addr.len() < 32 || addr.len() > 44 {
        return Err(format!(
            "Invalid Solana address '{}': expected 32-44 base58 chars",
            addr
        ));
    }
    let bytes = bs58::decode(addr)
        .into_vec()
        .map_err(|_| format!("Invalid Solana address '{}': not base58", addr))?;
    if bytes.len() != 32 {
        return Err(format!(
            "Invalid Solana address '{}': decodes to {} bytes, expected 32",
            addr,
            bytes.len()
        ));
    }
    Ok(())
}

/// Bitcoin mainnet address
///
/// Accepts:
/// - Bech32 native SegWit: bc1...
/// - Base58 P2PKH: 1...
/// - Base58 P2SH: 3...
pub fn validate_btc_address(addr: &str) -> Result<(), String> {
    if addr.len() < 25 || addr.len() > 62 {
        return Err(format!(
            "Invalid BTC address '{}': unexpected length ({}), expected 25-62 chars",
            addr,
            addr.len()
        ));
    }

    let lower = addr.to_ascii_lowercase();
    if let Some(data) = lower.strip_prefix("bc1") {
        // mixed case is invalid bech32
        if addr != lower && addr != addr.to_ascii_uppercase() {
            return Err(format!("Invalid BTC address '{}': mixed case", addr));
        }
        if !data.chars().all(|c| BECH32_CHARSET.contains(c)) {
            return Err(format!(
                "Invalid BTC address '{}': contains invalid bech32 characters",
                addr
            ));
        }
        return Ok(());
    }

    match addr.chars().next() {
        Some('1') | Some('3') => {}
        _ => {
            return Err(format!(
                "Invalid BTC address '{}': must be Bech32 (bc1...) or Base58 (1.../3...)",
                addr
            ))
        }
    }
    // version byte + 20-byte hash + 4-byte checksum
    match bs58::decode(addr).into_vec() {
        Ok(bytes) if bytes.len() == 25 => Ok(()),
        Ok(bytes) => Err(format!(
            "Invalid BTC address '{}': decodes to {} bytes, expected 25",
            addr,
            bytes.len()
        )),
        Err(_) => Err(format!("Invalid BTC address '{}': not base58", addr)),
    }
}

/// Zcash payout address
pub fn validate_zcash_address(addr: &str) -> Result<(), String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err("Zcash address is empty".to_string());
    }
    if !addr.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!(
            "Invalid Zcash address '{}': contains invalid characters",
            addr
        ));
    }

    let (min, max) = match addr.get(..2) {
        Some("t1") | Some("t3") | Some("zs") | Some("zc") => (35, 97),
        Some("u1") | Some("u2") => (40, 512),
        _ => {
            return Err(format!(
                "Invalid Zcash address '{}': must start with t1/t3 (transparent), zs/zc (shielded) or u1 (unified)",
                addr
            ))
        }
    };
    if addr.len() < min || addr.len() > max {
        return Err(format!(
            "Invalid Zcash address '{}': unexpected length ({}), expected {}-{} chars",
            addr,
            addr.len(),
            min,
            max
        ));
    }
    Ok(())
}

/// Display-friendly shortening: `t1abcd...wxyz`
pub fn short_address(addr: &str) -> String {
    if addr.len() > 16 && addr.is_ascii() {
        format!("{}...{}", &addr[..8], &addr[addr.len() - 6..])
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOL: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";

    #[test]
    fn test_evm() {
        assert_eq!(
            classify_wallet("0x742d35Cc6634C0532925a3b844Bc454e4438f44e"),
            Ok(AddressKind::Evm)
        );
        assert!(validate_evm_address("0x742d35Cc6634C0532925a3b844Bc454e4438f44").is_err());
        assert!(validate_evm_address("0xZZ2d35Cc6634C0532925a3b844Bc454e4438f44e").is_err());
    }

    #[test]
    fn test_btc() {
        assert!(validate_btc_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4").is_ok());
        assert!(validate_btc_address("1A1z7agoat5wbwrZCch3Z1PePPjRsrSne9").is_ok());
        assert!(validate_btc_address("3J98t1WpEZ73CNmYviecrnyiWrnqRhWNLy").is_ok());
        assert!(validate_btc_address("invalid_btc_address").is_err());
        assert_eq!(
            classify_wallet("1A1z7agoat5wbwrZCch3Z1PePPjRsrSne9"),
            Ok(AddressKind::Bitcoin)
        );
    }

    #[test]
    fn test_solana() {
        assert!(validate_solana_address(SOL).is_ok());
        assert_eq!(classify_wallet(SOL), Ok(AddressKind::Solana));
        // 0, O, I and l are outside the base58 alphabet
        assert!(validate_solana_address("0WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM").is_err());
        assert!(classify_wallet("hello").is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize_wallet(" 0xABCdef0000000000000000000000000000000001 "),
            "0xabcdef0000000000000000000000000000000001"
        );
        assert_eq!(normalize_wallet(SOL), SOL);
        assert_eq!(
            normalize_wallet("BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4"),
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
        );
    }

    #[test]
    fn test_zcash() {
        let t1 = format!("t1{}", "a".repeat(33));
        let zs = format!("zs{}", "q".repeat(76));
        let u1 = format!("u1{}", "x".repeat(140));
        assert!(validate_zcash_address(&t1).is_ok());
        assert!(validate_zcash_address(&zs).is_ok());
        assert!(validate_zcash_address(&u1).is_ok());

        assert!(validate_zcash_address("t1short").is_err());
        assert!(validate_zcash_address(&format!("x1{}", "a".repeat(33))).is_err());
        assert!(validate_zcash_address(&format!("t1{}!", "a".repeat(33))).is_err());
        assert!(validate_zcash_address("").is_err());
    }
}
