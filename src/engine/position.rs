//! Turns pool state and deposit amounts into exact position parameters.
//!
//! Liquidity is always rounded down and the token amounts it needs are rounded
//! up, the same way the position manager does it, so the quoted amounts are
//! what the pool will actually pull and never exceed what was offered.

use ethers::types::U256;
use num_bigint::BigInt;
use rust_decimal::Decimal;

use crate::error::EngineError;
use crate::math::liquidity::{self, liquidity_for_amount0, liquidity_for_amount1, liquidity_for_amounts};
use crate::math::price::{full_range_ticks, nearest_usable_tick, price_to_sqrt_ratio, price_to_tick};
use crate::math::tick_math::{bigint_to_u256, get_sqrt_ratio_at_tick, u256_to_bigint, MAX_TICK, MIN_TICK};
use crate::models::{FeeTier, PoolState, RangeSpec, TokenSide};

/// How far the rounding guard may walk liquidity down before giving up.
const MAX_ROUNDING_STEPS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiquidityQuote {
    pub liquidity: u128,
    pub amount0: U256,
    pub amount1: U256,
}

pub fn validate_range(tick_lower: i32, tick_upper: i32, fee: FeeTier) -> Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::InvalidRange { lower: tick_lower, upper: tick_upper, reason: reason.into() };
    if tick_lower >= tick_upper {
        return Err(invalid("lower tick must be below upper tick"));
    }
    if tick_lower < MIN_TICK || tick_upper > MAX_TICK {
        return Err(invalid("outside the global tick bounds"));
    }
    let spacing = fee.tick_spacing();
    if tick_lower % spacing != 0 || tick_upper % spacing != 0 {
        return Err(invalid(&format!("ticks must be multiples of {spacing} for the {fee} tier")));
    }
    Ok(())
}

struct Ratios {
    current: BigInt,
    lower: BigInt,
    upper: BigInt,
}

fn ratios(pool: &PoolState, tick_lower: i32, tick_upper: i32) -> Result<Ratios, EngineError> {
    validate_range(tick_lower, tick_upper, pool.fee)?;
    if !pool.is_initialized() {
        return Err(EngineError::InvalidParameter(format!("pool {:?} has no price yet", pool.address)));
    }
    Ok(Ratios {
        current: u256_to_bigint(pool.sqrt_price_x96),
        lower: get_sqrt_ratio_at_tick(tick_lower)?,
        upper: get_sqrt_ratio_at_tick(tick_upper)?,
    })
}

/// Rounds-up amounts for `liquidity`, stepping liquidity down until both fit under the caps.
fn settle(r: &Ratios, mut liquidity: BigInt, cap0: Option<U256>, cap1: Option<U256>) -> Result<LiquidityQuote, EngineError> {
    let cap0 = cap0.map(u256_to_bigint);
    let cap1 = cap1.map(u256_to_bigint);
    let zero = BigInt::from(0u8);

    for _ in 0..MAX_ROUNDING_STEPS {
        if liquidity <= zero {
            break;
        }
        let (amount0, amount1) = liquidity::amounts_for_liquidity(&r.current, &r.lower, &r.upper, &liquidity, true);
        let over0 = cap0.as_ref().is_some_and(|cap| &amount0 > cap);
        let over1 = cap1.as_ref().is_some_and(|cap| &amount1 > cap);
        if !over0 && !over1 {
            let value = bigint_to_u256(&liquidity)?;
            if value > U256::from(u128::MAX) {
                return Err(EngineError::InvalidParameter("liquidity overflows uint128".into()));
            }
            return Ok(LiquidityQuote {
                liquidity: value.low_u128(),
                amount0: bigint_to_u256(&amount0)?,
                amount1: bigint_to_u256(&amount1)?,
            });
        }
        liquidity -= 1;
    }
    Err(EngineError::InvalidParameter("deposit amounts are too small to mint any liquidity".into()))
}

/// Largest liquidity both desired amounts can fund at the pool's current price.
///
/// Below the range only token0 counts, above it only token1, inside it the
/// scarcer side bounds the result.
pub fn from_amounts(
    pool: &PoolState,
    tick_lower: i32,
    tick_upper: i32,
    amount0_desired: U256,
    amount1_desired: U256,
) -> Result<LiquidityQuote, EngineError> {
    let r = ratios(pool, tick_lower, tick_upper)?;
    let liquidity = liquidity_for_amounts(
        &r.current,
        &r.lower,
        &r.upper,
        &u256_to_bigint(amount0_desired),
        &u256_to_bigint(amount1_desired),
    );
    settle(&r, liquidity, Some(amount0_desired), Some(amount1_desired))
}

/// Liquidity funded by one known amount; the other side's requirement is derived.
pub fn from_single_amount(
    pool: &PoolState,
    tick_lower: i32,
    tick_upper: i32,
    known: U256,
    side: TokenSide,
) -> Result<LiquidityQuote, EngineError> {
    let r = ratios(pool, tick_lower, tick_upper)?;
    let amount = u256_to_bigint(known);
    let liquidity = match side {
        TokenSide::Zero => {
            if r.current >= r.upper {
                return Err(EngineError::InvalidParameter(
                    "range sits below the current price; only token1 can be deposited".into(),
                ));
            }
            let from = if r.current > r.lower { &r.current } else { &r.lower };
            liquidity_for_amount0(from, &r.upper, &amount)
        }
        TokenSide::One => {
            if r.current <= r.lower {
                return Err(EngineError::InvalidParameter(
                    "range sits above the current price; only token0 can be deposited".into(),
                ));
            }
            let to = if r.current < r.upper { &r.current } else { &r.upper };
            liquidity_for_amount1(&r.lower, to, &amount)
        }
    };
    let (cap0, cap1) = match side {
        TokenSide::Zero => (Some(known), None),
        TokenSide::One => (None, Some(known)),
    };
    settle(&r, liquidity, cap0, cap1)
}

/// Token amounts held by `liquidity` over the range at the pool's current price.
pub fn amounts_for_liquidity(
    pool: &PoolState,
    tick_lower: i32,
    tick_upper: i32,
    liquidity: u128,
    round_up: bool,
) -> Result<(U256, U256), EngineError> {
    let r = ratios(pool, tick_lower, tick_upper)?;
    let (amount0, amount1) =
        liquidity::amounts_for_liquidity(&r.current, &r.lower, &r.upper, &BigInt::from(liquidity), round_up);
    Ok((bigint_to_u256(&amount0)?, bigint_to_u256(&amount1)?))
}

fn check_slippage(slippage: Decimal) -> Result<(), EngineError> {
    if slippage.is_sign_negative() || slippage >= Decimal::ONE {
        return Err(EngineError::InvalidParameter(format!("slippage must be in [0, 1), got {slippage}")));
    }
    Ok(())
}

/// Minimum acceptable amount: `amount * (1 - slippage)`, rounded down.
pub fn apply_slippage(amount: U256, slippage: Decimal) -> Result<U256, EngineError> {
    check_slippage(slippage)?;
    let denominator = num_traits::pow(BigInt::from(10u8), slippage.scale() as usize);
    let keep = &denominator - BigInt::from(slippage.mantissa());
    bigint_to_u256(&(u256_to_bigint(amount) * keep / denominator))
}

/// `floor(liquidity * fraction)` for a fraction in (0, 1].
pub fn liquidity_delta(liquidity: u128, fraction: Decimal) -> Result<u128, EngineError> {
    if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
        return Err(EngineError::InvalidParameter(format!("fraction must be in (0, 1], got {fraction}")));
    }
    let denominator = num_traits::pow(BigInt::from(10u8), fraction.scale() as usize);
    let delta = BigInt::from(liquidity) * BigInt::from(fraction.mantissa()) / denominator;
    let delta = bigint_to_u256(&delta)?.low_u128();
    if delta == 0 {
        return Err(EngineError::InvalidParameter(format!(
            "removing {fraction} of liquidity {liquidity} rounds to nothing"
        )));
    }
    Ok(delta)
}

/// Display price "B per A" as token1 per token0.
fn sorted_price(price_b_per_a: Decimal, a_is_token0: bool) -> Result<Decimal, EngineError> {
    if price_b_per_a <= Decimal::ZERO {
        return Err(EngineError::InvalidParameter(format!("price must be positive, got {price_b_per_a}")));
    }
    if a_is_token0 {
        Ok(price_b_per_a)
    } else {
        Decimal::ONE
            .checked_div(price_b_per_a)
            .ok_or_else(|| EngineError::InvalidParameter(format!("price {price_b_per_a} cannot be inverted")))
    }
}

/// Starting sqrt price for a new pool from a "B per A" display price.
pub fn initial_sqrt_price(price_b_per_a: Decimal, a_is_token0: bool, decimals_adjustment: i32) -> Result<U256, EngineError> {
    price_to_sqrt_ratio(sorted_price(price_b_per_a, a_is_token0)?, decimals_adjustment)
}

/// Tick pair for a caller's range. Price bounds are snapped to the tier's
/// spacing and swapped when token A is token1.
pub fn resolve_range(
    range: RangeSpec,
    fee: FeeTier,
    a_is_token0: bool,
    decimals_adjustment: i32,
) -> Result<(i32, i32), EngineError> {
    let (lower, upper) = match range {
        RangeSpec::FullRange => full_range_ticks(fee),
        RangeSpec::Ticks { lower, upper } => (lower, upper),
        RangeSpec::Prices { lower, upper } => {
            if lower >= upper {
                return Err(EngineError::InvalidParameter(format!(
                    "lower price {lower} must be below upper price {upper}"
                )));
            }
            let spacing = fee.tick_spacing();
            let a = nearest_usable_tick(price_to_tick(sorted_price(lower, a_is_token0)?, decimals_adjustment)?, spacing);
            let b = nearest_usable_tick(price_to_tick(sorted_price(upper, a_is_token0)?, decimals_adjustment)?, spacing);
            (a.min(b), a.max(b))
        }
    };
    validate_range(lower, upper, fee)?;
    Ok((lower, upper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::price::tick_to_sqrt_ratio;
    use ethers::types::Address;
    use rust_decimal_macros::dec;

    fn pool_at_tick(tick: i32, fee: FeeTier) -> PoolState {
        PoolState {
            address: Address::repeat_byte(9),
            token0: Address::repeat_byte(1),
            token1: Address::repeat_byte(2),
            fee,
            sqrt_price_x96: tick_to_sqrt_ratio(tick).unwrap(),
            tick,
            liquidity: 0,
        }
    }

    fn e18(n: u64) -> U256 {
        U256::from(n) * U256::exp10(18)
    }

    #[test]
    fn test_degenerate_ranges_rejected() {
        assert!(matches!(validate_range(60, 60, FeeTier::Medium), Err(EngineError::InvalidRange { .. })));
        assert!(matches!(validate_range(120, 60, FeeTier::Medium), Err(EngineError::InvalidRange { .. })));
        assert!(matches!(validate_range(-887_280, 0, FeeTier::Low), Err(EngineError::InvalidRange { .. })));
        assert!(matches!(validate_range(-50, 60, FeeTier::Medium), Err(EngineError::InvalidRange { .. })));
        assert!(validate_range(-60, 60, FeeTier::Medium).is_ok());
    }

    #[test]
    fn test_in_range_quote_is_bounded_by_scarcer_side() {
        let pool = pool_at_tick(0, FeeTier::Medium);
        let quote = from_amounts(&pool, -600, 600, e18(1), e18(100)).unwrap();
        assert!(quote.liquidity > 0);
        assert!(quote.amount0 <= e18(1));
        assert!(quote.amount1 <= e18(100));
        // token0 is the scarce side at price 1, so it is (almost) fully used
        assert!(e18(1) - quote.amount0 <= U256::from(1u8));
        assert!(quote.amount1 < e18(2));
    }

    #[test]
    fn test_out_of_range_quotes_use_one_side() {
        let below = pool_at_tick(-1200, FeeTier::Medium);
        let quote = from_amounts(&below, -600, 600, e18(1), e18(1)).unwrap();
        assert!(quote.amount0 > U256::zero());
        assert_eq!(quote.amount1, U256::zero());

        let above = pool_at_tick(1200, FeeTier::Medium);
        let quote = from_amounts(&above, -600, 600, e18(1), e18(1)).unwrap();
        assert_eq!(quote.amount0, U256::zero());
        assert!(quote.amount1 > U256::zero());
    }

    #[test]
    fn test_single_amount_derives_other_side() {
        let pool = pool_at_tick(0, FeeTier::Medium);
        let quote = from_single_amount(&pool, -600, 600, e18(1), TokenSide::Zero).unwrap();
        assert!(quote.amount0 <= e18(1));
        assert!(quote.amount1 > U256::zero());

        // the derived requirement funds (about) the same position from the other side
        let back = from_single_amount(&pool, -600, 600, quote.amount1, TokenSide::One).unwrap();
        let diff = quote.liquidity.abs_diff(back.liquidity);
        assert!(diff <= quote.liquidity / 1_000_000, "{} vs {}", quote.liquidity, back.liquidity);

        let above = pool_at_tick(1200, FeeTier::Medium);
        assert!(from_single_amount(&above, -600, 600, e18(1), TokenSide::Zero).is_err());
    }

    #[test]
    fn test_dust_amounts_rejected() {
        let pool = pool_at_tick(0, FeeTier::Medium);
        assert!(matches!(
            from_amounts(&pool, -60, 60, U256::zero(), U256::zero()),
            Err(EngineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_uninitialized_pool_has_no_quote() {
        let mut pool = pool_at_tick(0, FeeTier::Medium);
        pool.sqrt_price_x96 = U256::zero();
        assert!(from_amounts(&pool, -60, 60, e18(1), e18(1)).is_err());
    }

    #[test]
    fn test_slippage_band() {
        assert_eq!(apply_slippage(U256::from(10_000u64), dec!(0.005)).unwrap(), U256::from(9_950u64));
        assert_eq!(apply_slippage(U256::from(999u64), dec!(0.01)).unwrap(), U256::from(989u64));
        assert_eq!(apply_slippage(U256::from(5u64), Decimal::ZERO).unwrap(), U256::from(5u64));
        assert!(apply_slippage(U256::one(), Decimal::ONE).is_err());
        assert!(apply_slippage(U256::one(), dec!(-0.1)).is_err());
    }

    #[test]
    fn test_half_of_odd_liquidity_rounds_down() {
        assert_eq!(liquidity_delta(1001, dec!(0.5)).unwrap(), 500);
        assert_eq!(liquidity_delta(1001, Decimal::ONE).unwrap(), 1001);
        assert!(liquidity_delta(1001, Decimal::ZERO).is_err());
        assert!(liquidity_delta(1001, dec!(1.01)).is_err());
        assert!(liquidity_delta(1, dec!(0.5)).is_err());
    }

    #[test]
    fn test_price_range_flips_with_token_order() {
        // 18/18 decimals, B per A between 0.5 and 2
        let (lower, upper) =
            resolve_range(RangeSpec::Prices { lower: dec!(0.5), upper: dec!(2) }, FeeTier::Medium, true, 0).unwrap();
        assert!(lower < 0 && upper > 0);
        assert_eq!(lower % 60, 0);
        assert_eq!(upper % 60, 0);

        let (flip_lower, flip_upper) =
            resolve_range(RangeSpec::Prices { lower: dec!(0.5), upper: dec!(2) }, FeeTier::Medium, false, 0).unwrap();
        assert_eq!((flip_lower, flip_upper), (-upper, -lower));
    }

    #[test]
    fn test_full_range_and_explicit_ticks() {
        assert_eq!(resolve_range(RangeSpec::FullRange, FeeTier::Medium, true, 0).unwrap(), (-887_220, 887_220));
        assert!(resolve_range(RangeSpec::Ticks { lower: 10, upper: 20 }, FeeTier::Medium, true, 0).is_err());
        assert!(resolve_range(RangeSpec::Prices { lower: dec!(2), upper: dec!(1) }, FeeTier::Medium, true, 0).is_err());
    }

    #[test]
    fn test_initial_price_is_inverted_for_token1() {
        let direct = initial_sqrt_price(dec!(4), true, 0).unwrap();
        let inverted = initial_sqrt_price(dec!(0.25), false, 0).unwrap();
        assert_eq!(direct, inverted);
        assert_eq!(direct, U256::from(2u8) << 96);
    }
}
