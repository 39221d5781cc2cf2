//! Conversion engine: transfer amount -> reference value -> payout amount
//!
//! `payout = value * (1 - fee_rate) / price(payout_coin)`, truncated to
//! 8 decimal places (zatoshi precision). Prices come from the oracle at call
//! time; redemption recomputes with whatever the oracle says then.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::sync::Arc;

use crate::error::ConversionError;
use crate::oracle::PriceOracle;
use crate::types::Coin;

/// Payout ledger precision (1 zatoshi = 1e-8 ZEC)
pub const PAYOUT_DECIMALS: u32 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionPolicy {
    pub fee_rate: Decimal,
    pub minimum_value: Decimal,
    pub payout_coin: Coin,
}

impl Default for ConversionPolicy {
    fn default() -> Self {
        Self {
            fee_rate: Decimal::new(1, 2),
            minimum_value: Decimal::from(10),
            payout_coin: Coin::Zec,
        }
    }
}

/// Full breakdown of one conversion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quote {
    pub source_coin: Coin,
    pub source_amount: Decimal,
    pub value: Decimal,
    pub payout_coin: Coin,
    pub payout_amount: Decimal,
    pub meets_minimum: bool,
}

#[derive(Clone)]
pub struct ConversionEngine {
    oracle: Arc<dyn PriceOracle>,
    policy: ConversionPolicy,
}

impl ConversionEngine {
    pub fn new(oracle: Arc<dyn PriceOracle>, policy: ConversionPolicy) -> Self {
        Self { oracle, policy }
    }

    pub fn policy(&self) -> &ConversionPolicy {
        &self.policy
    }

    fn price(&self, coin: Coin) -> Result<Decimal, ConversionError> {
        self.oracle
            .price(coin)
            .filter(|p| *p > Decimal::ZERO)
            .ok_or(ConversionError::PriceUnavailable(coin))
    }

    pub fn to_reference_value(&self, amount: Decimal, coin: Coin) -> Result<Decimal, ConversionError> {
        let price = self.price(coin)?;
        amount
            .checked_mul(price)
            .ok_or(ConversionError::Overflow(coin))
    }

    /// Inclusive floor: a value equal to the minimum passes
    pub fn meets_minimum(&self, value: Decimal) -> bool {
        value >= self.policy.minimum_value
    }

    pub fn compute_payout(&self, value: Decimal) -> Result<Decimal, ConversionError> {
        let payout_coin = self.policy.payout_coin;
        let price = self.price(payout_coin)?;
        let net = value
            .checked_mul(Decimal::ONE - self.policy.fee_rate)
            .ok_or(ConversionError::Overflow(payout_coin))?;
        let amount = net
            .checked_div(price)
            .ok_or(ConversionError::Overflow(payout_coin))?;
        Ok(amount
            .round_dp_with_strategy(PAYOUT_DECIMALS, RoundingStrategy::ToZero)
            .max(Decimal::ZERO))
    }

    pub fn quote(&self, amount: Decimal, coin: Coin) -> Result<Quote, ConversionError> {
        let value = self.to_reference_value(amount, coin)?;
        let payout_amount = self.compute_payout(value)?;
        Ok(Quote {
            source_coin: coin,
            source_amount: amount,
            value,
            payout_coin: self.policy.payout_coin,
            payout_amount,
            meets_minimum: self.meets_minimum(value),
        })
    }

    /// Advisory figure for issuance messages; zero when prices are unavailable
    pub fn estimate_payout(&self, amount: Decimal, coin: Coin) -> Decimal {
        match self.quote(amount, coin) {
            Ok(q) => q.payout_amount,
            Err(e) => {
                tracing::warn!("[CONVERSION] Estimate unavailable for {} {}: {}", amount, coin, e);
                Decimal::ZERO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::StaticPriceOracle;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn engine() -> ConversionEngine {
        let oracle = StaticPriceOracle::default()
            .with(Coin::Eth, d("3500"))
            .with(Coin::Sol, d("150"))
            .with(Coin::Zec, d("45"));
        ConversionEngine::new(Arc::new(oracle), ConversionPolicy::default())
    }

    #[test]
    fn test_reference_value() {
        let e = engine();
        assert_eq!(e.to_reference_value(d("1.0"), Coin::Eth).unwrap(), d("3500"));
        assert_eq!(e.to_reference_value(d("0.5"), Coin::Sol).unwrap(), d("75"));
        assert_eq!(
            e.to_reference_value(d("1"), Coin::Btc),
            Err(ConversionError::PriceUnavailable(Coin::Btc))
        );
    }

    #[test]
    fn test_minimum_is_monotonic_threshold() {
        let e = engine();
        assert!(!e.meets_minimum(d("9.99")));
        assert!(e.meets_minimum(d("10")));
        assert!(e.meets_minimum(d("10.01")));
    }

    #[test]
    fn test_payout_formula() {
        let e = engine();
        // 3500 * 0.99 / 45
        assert_eq!(e.compute_payout(d("3500")).unwrap(), d("77"));
        // 100 * 0.99 / 45 = 2.2 exactly
        assert_eq!(e.compute_payout(d("100")).unwrap(), d("2.2"));
        // 10 * 0.99 / 45 = 0.22
        assert_eq!(e.compute_payout(d("10")).unwrap(), d("0.22"));
        assert_eq!(e.compute_payout(d("1.37")).unwrap(), d("0.03014"));
        // 0.99 / 7 is cut at 8 places, never rounded up
        let e7 = ConversionEngine::new(
            Arc::new(StaticPriceOracle::default().with(Coin::Zec, d("7"))),
            ConversionPolicy::default(),
        );
        assert_eq!(e7.compute_payout(d("1")).unwrap(), d("0.14142857"));
    }

    #[test]
    fn test_round_trip_within_tolerance() {
        let e = engine();
        for amount in ["0.0123", "1.5", "2.75", "0.333333"] {
            let amount = d(amount);
            let q = e.quote(amount, Coin::Eth).unwrap();
            let exact = amount * d("3500") * d("0.99") / d("45");
            assert!((exact - q.payout_amount).abs() < d("0.00000001"));
            assert!(q.payout_amount <= exact);
        }
    }

    #[test]
    fn test_estimate_without_prices_is_zero() {
        let e = ConversionEngine::new(Arc::new(StaticPriceOracle::default()), ConversionPolicy::default());
        assert_eq!(e.estimate_payout(d("1"), Coin::Eth), Decimal::ZERO);
    }
}
