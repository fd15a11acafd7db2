// Liquidity <-> token amounts for a price range (LiquidityAmounts semantics).
//
// sa < sb are the range bounds, sp the pool price, all Q64.96. Liquidity derived
// from amounts is always rounded down; amounts derived from liquidity can be
// rounded either way depending on who pays.

use num_bigint::BigInt;
use num_traits::Zero;

use crate::math::tick_math::{amount0_delta, amount1_delta, q96};

/// L0 = amount0 * sa * sb / ((sb - sa) * Q96)
pub fn liquidity_for_amount0(sa: &BigInt, sb: &BigInt, amount0: &BigInt) -> BigInt {
    let (sa, sb) = if sa < sb { (sa, sb) } else { (sb, sa) };
    let denom = (sb - sa) * q96();
    if denom.is_zero() {
        return BigInt::zero();
    }
    (amount0 * sa * sb) / denom
}

/// L1 = amount1 * Q96 / (sb - sa)
pub fn liquidity_for_amount1(sa: &BigInt, sb: &BigInt, amount1: &BigInt) -> BigInt {
    let (sa, sb) = if sa < sb { (sa, sb) } else { (sb, sa) };
    let diff = sb - sa;
    if diff.is_zero() {
        return BigInt::zero();
    }
    (amount1 * q96()) / diff
}

/// Largest liquidity the two amounts can back at price `sp`; the limiting side wins.
pub fn liquidity_for_amounts(sp: &BigInt, sa: &BigInt, sb: &BigInt, amount0: &BigInt, amount1: &BigInt) -> BigInt {
    if sp <= sa {
        liquidity_for_amount0(sa, sb, amount0)
    } else if sp < sb {
        let l0 = liquidity_for_amount0(sp, sb, amount0);
        let l1 = liquidity_for_amount1(sa, sp, amount1);
        if l0 < l1 {
            l0
        } else {
            l1
        }
    } else {
        liquidity_for_amount1(sa, sb, amount1)
    }
}

/// Token amounts represented by `liquidity` over [sa, sb] at price `sp`.
pub fn amounts_for_liquidity(
    sp: &BigInt,
    sa: &BigInt,
    sb: &BigInt,
    liquidity: &BigInt,
    round_up: bool,
) -> (BigInt, BigInt) {
    if sp <= sa {
        (amount0_delta(sa, sb, liquidity, round_up), BigInt::zero())
    } else if sp < sb {
        (
            amount0_delta(sp, sb, liquidity, round_up),
            amount1_delta(sa, sp, liquidity, round_up),
        )
    } else {
        (BigInt::zero(), amount1_delta(sa, sb, liquidity, round_up))
    }
}
