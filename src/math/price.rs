//! Conversions between human prices and the pool's Q64.96 square-root price.
//!
//! A human price is "token1 per token0" in display units. On chain the ratio is
//! expressed in base units, so every conversion first shifts by
//! `decimals1 - decimals0` before taking the square root.

use ethers::types::U256;
use num_bigint::BigInt;
use num_integer::Roots;
use num_traits::{One, ToPrimitive, Zero};
use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::math::tick_math::{
    bigint_to_u256, get_sqrt_ratio_at_tick, get_tick_at_sqrt_ratio, max_sqrt_ratio, min_sqrt_ratio, u256_to_bigint,
    MAX_TICK, MIN_TICK,
};
use crate::models::FeeTier;

/// Largest scale a `Decimal` can carry.
const MAX_DECIMAL_SCALE: u32 = 28;

fn pow10(exp: u32) -> BigInt {
    num_traits::pow(BigInt::from(10u8), exp as usize)
}

/// `decimals1 - decimals0`: the power of ten between a display price and a base-unit price.
pub fn decimals_adjustment(decimals0: u8, decimals1: u8) -> i32 {
    decimals1 as i32 - decimals0 as i32
}

/// Encodes a display price (token1 per token0) as a Q64.96 square-root ratio, rounded down.
pub fn price_to_sqrt_ratio(price: Decimal, decimals_adjustment: i32) -> Result<U256, EngineError> {
    if price <= Decimal::ZERO {
        return Err(EngineError::InvalidParameter(format!("price must be positive, got {price}")));
    }
    let mut numerator = BigInt::from(price.mantissa()) << 192;
    let mut denominator = pow10(price.scale());
    if decimals_adjustment >= 0 {
        numerator *= pow10(decimals_adjustment as u32);
    } else {
        denominator *= pow10(decimals_adjustment.unsigned_abs());
    }

    let sqrt = Roots::sqrt(&(numerator / denominator));
    if sqrt < min_sqrt_ratio() || sqrt >= max_sqrt_ratio() {
        return Err(EngineError::InvalidParameter(format!(
            "price {price} (decimal adjustment {decimals_adjustment}) is outside the representable tick range"
        )));
    }
    bigint_to_u256(&sqrt)
}

pub fn sqrt_ratio_to_tick(sqrt_ratio_x96: U256) -> Result<i32, EngineError> {
    get_tick_at_sqrt_ratio(&u256_to_bigint(sqrt_ratio_x96))
}

pub fn tick_to_sqrt_ratio(tick: i32) -> Result<U256, EngineError> {
    bigint_to_u256(&get_sqrt_ratio_at_tick(tick)?)
}

pub fn price_to_tick(price: Decimal, decimals_adjustment: i32) -> Result<i32, EngineError> {
    sqrt_ratio_to_tick(price_to_sqrt_ratio(price, decimals_adjustment)?)
}

/// Decodes a Q64.96 ratio back to a display price, truncated to the finest scale that fits a `Decimal`.
pub fn sqrt_ratio_to_price(sqrt_ratio_x96: U256, decimals_adjustment: i32) -> Result<Decimal, EngineError> {
    let s = u256_to_bigint(sqrt_ratio_x96);
    if s.is_zero() {
        return Err(EngineError::InvalidParameter("sqrt ratio of an uninitialized pool has no price".into()));
    }
    let squared = &s * &s;
    let mut denominator = BigInt::one() << 192;
    let mut numerator = squared;
    if decimals_adjustment >= 0 {
        denominator *= pow10(decimals_adjustment as u32);
    } else {
        numerator *= pow10(decimals_adjustment.unsigned_abs());
    }

    for scale in (0..=MAX_DECIMAL_SCALE).rev() {
        let value: BigInt = (&numerator * pow10(scale)) / &denominator;
        if let Some(mantissa) = value.to_i128() {
            if let Ok(price) = Decimal::try_from_i128_with_scale(mantissa, scale) {
                return Ok(price.normalize());
            }
        }
    }
    Err(EngineError::InvalidParameter(format!(
        "price at sqrt ratio {sqrt_ratio_x96} does not fit a decimal"
    )))
}

pub fn tick_to_price(tick: i32, decimals_adjustment: i32) -> Result<Decimal, EngineError> {
    sqrt_ratio_to_price(tick_to_sqrt_ratio(tick)?, decimals_adjustment)
}

/// Display-only price (token1 per token0). Never feed this into a transaction.
pub fn tick_to_display_price(tick: i32, decimals0: u8, decimals1: u8) -> f64 {
    let s = get_sqrt_ratio_at_tick(tick.clamp(MIN_TICK, MAX_TICK))
        .ok()
        .and_then(|r| r.to_f64())
        .unwrap_or(0.0)
        / ((1u128 << 96) as f64);
    let price_raw = s * s;
    price_raw * 10f64.powi(decimals0 as i32 - decimals1 as i32)
}

/// Nearest multiple of `spacing` (ties toward zero), kept inside the global tick bounds.
pub fn nearest_usable_tick(tick: i32, spacing: i32) -> i32 {
    let spacing = spacing.max(1);
    let tick = tick.clamp(MIN_TICK, MAX_TICK);
    let mut quotient = tick / spacing;
    let remainder = tick % spacing;
    if 2 * remainder.abs() > spacing {
        quotient += tick.signum();
    }
    let rounded = quotient * spacing;
    if rounded < MIN_TICK {
        rounded + spacing
    } else if rounded > MAX_TICK {
        rounded - spacing
    } else {
        rounded
    }
}

/// Widest usable range for the tier: the outermost spacing multiples inside the bounds.
pub fn full_range_ticks(fee: FeeTier) -> (i32, i32) {
    let spacing = fee.tick_spacing();
    let upper = (MAX_TICK / spacing) * spacing;
    (-upper, upper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_one_is_q96() {
        let sqrt = price_to_sqrt_ratio(dec!(1), 0).unwrap();
        assert_eq!(sqrt, U256::one() << 96);
        assert_eq!(sqrt_ratio_to_tick(sqrt).unwrap(), 0);
        assert_eq!(sqrt_ratio_to_price(sqrt, 0).unwrap(), dec!(1));
    }

    #[test]
    fn test_decimal_adjustment_changes_the_ratio() {
        // 1 token0 (6 decimals) = 2500 token1 (18 decimals)
        let adjusted = price_to_sqrt_ratio(dec!(2500), 12).unwrap();
        let naive = price_to_sqrt_ratio(dec!(2500), 0).unwrap();
        assert_ne!(adjusted, naive);
        // sqrt(10^12) = 10^6
        let ratio = u256_to_bigint(adjusted) / u256_to_bigint(naive);
        assert_eq!(ratio, BigInt::from(1_000_000u32));
    }

    #[test]
    fn test_non_positive_price_rejected() {
        assert!(price_to_sqrt_ratio(dec!(0), 0).is_err());
        assert!(price_to_sqrt_ratio(dec!(-1.5), 0).is_err());
    }

    #[test]
    fn test_nearest_usable_tick_rounding() {
        assert_eq!(nearest_usable_tick(29, 60), 0);
        assert_eq!(nearest_usable_tick(31, 60), 60);
        assert_eq!(nearest_usable_tick(30, 60), 0); // tie toward zero
        assert_eq!(nearest_usable_tick(-30, 60), 0);
        assert_eq!(nearest_usable_tick(-31, 60), -60);
        assert_eq!(nearest_usable_tick(-90, 60), -60);
        assert_eq!(nearest_usable_tick(887_272, 60), 887_220);
        assert_eq!(nearest_usable_tick(-887_272, 200), -887_200);
        assert_eq!(nearest_usable_tick(5, 1), 5);
    }

    #[test]
    fn test_full_range_ticks_per_tier() {
        assert_eq!(full_range_ticks(FeeTier::Lowest), (-887_272, 887_272));
        assert_eq!(full_range_ticks(FeeTier::Low), (-887_270, 887_270));
        assert_eq!(full_range_ticks(FeeTier::Medium), (-887_220, 887_220));
        assert_eq!(full_range_ticks(FeeTier::High), (-887_200, 887_200));
    }

    #[test]
    fn test_display_price_close_to_exact() {
        let tick = price_to_tick(dec!(3000), -12).unwrap();
        let display = tick_to_display_price(tick, 18, 6);
        assert!((display - 3000.0).abs() / 3000.0 < 0.0002, "display {display}");
    }
}
