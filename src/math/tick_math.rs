// BigInt Uniswap v3 tick math.
// ----------------------------------------------------------------------------------------
// Everything that feeds a transaction goes through these integer routines; the
// canonical TickMath constants are reproduced bit for bit so the pool and this
// crate agree on every boundary price.

use ethers::types::U256;
use num_bigint::{BigInt, Sign};
use num_traits::{One, Signed, Zero};

use crate::error::EngineError;

pub const MIN_TICK: i32 = -887_272;
pub const MAX_TICK: i32 = 887_272;
pub const MIN_SQRT_RATIO: u128 = 4_295_128_739;
pub const MAX_SQRT_RATIO: &str = "1461446703485210103287273052203988822378723970342";
pub const Q96_SHIFT: usize = 96;

// --------------------------------- Helpers ---------------------------------

#[inline]
pub fn q96() -> BigInt {
    BigInt::one() << Q96_SHIFT
}

#[inline]
pub fn min_sqrt_ratio() -> BigInt {
    BigInt::from(MIN_SQRT_RATIO)
}

#[inline]
pub fn max_sqrt_ratio() -> BigInt {
    // Compile-time literal, always parses.
    MAX_SQRT_RATIO.parse::<BigInt>().unwrap_or_else(|_| BigInt::zero())
}

#[inline]
pub fn ceil_div(a: &BigInt, b: &BigInt) -> BigInt {
    // assumes a>=0, b>0
    if a.is_zero() {
        return BigInt::zero();
    }
    (a + (b - BigInt::one())) / b
}

pub fn u256_to_bigint(u: U256) -> BigInt {
    let mut buf = [0u8; 32];
    u.to_big_endian(&mut buf);
    BigInt::from_bytes_be(Sign::Plus, &buf)
}

pub fn bigint_to_u256(v: &BigInt) -> Result<U256, EngineError> {
    if v.is_negative() {
        return Err(EngineError::InvalidParameter(format!("negative value {v} cannot be encoded as uint256")));
    }
    let (_, bytes) = v.to_bytes_be();
    if bytes.len() > 32 {
        return Err(EngineError::InvalidParameter(format!("value {v} overflows uint256")));
    }
    Ok(U256::from_big_endian(&bytes))
}

pub fn check_tick(tick: i32) -> Result<(), EngineError> {
    if (MIN_TICK..=MAX_TICK).contains(&tick) {
        Ok(())
    } else {
        Err(EngineError::InvalidRange {
            lower: tick,
            upper: tick,
            reason: format!("tick outside [{MIN_TICK}, {MAX_TICK}]"),
        })
    }
}

// -------------------------------- Tick Math --------------------------------

/// Exact TickMath.getSqrtRatioAtTick (Q64.96 integer).
pub fn get_sqrt_ratio_at_tick(tick: i32) -> Result<BigInt, EngineError> {
    check_tick(tick)?;
    let abs_tick = tick.unsigned_abs();

    // ratio is Q128.128
    let mut ratio = if abs_tick & 0x1 != 0 {
        hex_constant("fffcb933bd6fad37aa2d162d1a594001")
    } else {
        BigInt::one() << 128
    };

    macro_rules! ms {
        ($hex:literal, $bit:expr) => {
            if abs_tick & $bit != 0 {
                ratio = (&ratio * hex_constant($hex)) >> 128;
            }
        };
    }

    ms!("fff97272373d413259a46990580e213a", 0x2);
    ms!("fff2e50f5f656932ef12357cf3c7fdcc", 0x4);
    ms!("ffe5caca7e10e4e61c3624eaa0941cd0", 0x8);
    ms!("ffcb9843d60f6159c9db58835c926644", 0x10);
    ms!("ff973b41fa98c081472e6896dfb254c0", 0x20);
    ms!("ff2ea16466c96a3843ec78b326b52861", 0x40);
    ms!("fe5dee046a99a2a811c461f1969c3053", 0x80);
    ms!("fcbe86c7900a88aedcffc83b479aa3a4", 0x100);
    ms!("f987a7253ac413176f2b074cf7815e54", 0x200);
    ms!("f3392b0822b70005940c7a398e4b70f3", 0x400);
    ms!("e7159475a2c29b7443b29c7fa6e889d9", 0x800);
    ms!("d097f3bdfd2022b8845ad8f792aa5825", 0x1000);
    ms!("a9f746462d870fdf8a65dc1f90e061e5", 0x2000);
    ms!("70d869a156d2a1b890bb3df62baf32f7", 0x4000);
    ms!("31be135f97d08fd981231505542fcfa6", 0x8000);
    ms!("09aa508b5b7a84e1c677de54f3e99bc9", 0x10000);
    ms!("05d6af8dedb81196699c329225ee604", 0x20000);
    ms!("2216e584f5fa1ea926041bedfe98", 0x40000);
    ms!("48a170391f7dc42444e8fa2", 0x80000);

    if tick > 0 {
        let max = (BigInt::one() << 256) - 1;
        ratio = max / ratio;
    }
    // round-up shift by 32 (Q128.128 -> Q64.96)
    Ok((&ratio + ((BigInt::one() << 32) - 1)) >> 32)
}

fn hex_constant(hex: &str) -> BigInt {
    // Only called with the literals above.
    BigInt::parse_bytes(hex.as_bytes(), 16).unwrap_or_else(BigInt::zero)
}

/// Greatest tick whose sqrt ratio is <= the given ratio (TickMath.getTickAtSqrtRatio).
pub fn get_tick_at_sqrt_ratio(sqrt_price_x96: &BigInt) -> Result<i32, EngineError> {
    if *sqrt_price_x96 < min_sqrt_ratio() || *sqrt_price_x96 >= max_sqrt_ratio() {
        return Err(EngineError::InvalidParameter(format!(
            "sqrt ratio {sqrt_price_x96} outside [MIN_SQRT_RATIO, MAX_SQRT_RATIO)"
        )));
    }
    let mut lo = MIN_TICK;
    let mut hi = MAX_TICK;
    while lo < hi {
        let mid = lo + ((hi - lo + 1) / 2);
        if get_sqrt_ratio_at_tick(mid)? <= *sqrt_price_x96 {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

// --------------------------- SqrtPriceMath deltas ---------------------------

/// amount0 = L * (sb - sa) / (sb * sa) in Q96, with the pool's two-step rounding.
pub fn amount0_delta(sqrt_ratio_a_x96: &BigInt, sqrt_ratio_b_x96: &BigInt, liquidity: &BigInt, round_up: bool) -> BigInt {
    if liquidity.is_zero() {
        return BigInt::zero();
    }
    let (sa, sb) = ordered(sqrt_ratio_a_x96, sqrt_ratio_b_x96);
    if sa.is_zero() || sa == sb {
        return BigInt::zero();
    }

    let numerator1 = liquidity << Q96_SHIFT;
    let numerator2 = &sb - &sa;

    if round_up {
        let t = ceil_div(&(&numerator1 * &numerator2), &sb);
        ceil_div(&t, &sa)
    } else {
        ((&numerator1 * &numerator2) / &sb) / &sa
    }
}

/// amount1 = L * (sb - sa) / Q96.
pub fn amount1_delta(sqrt_ratio_a_x96: &BigInt, sqrt_ratio_b_x96: &BigInt, liquidity: &BigInt, round_up: bool) -> BigInt {
    if liquidity.is_zero() {
        return BigInt::zero();
    }
    let (sa, sb) = ordered(sqrt_ratio_a_x96, sqrt_ratio_b_x96);
    if sa == sb {
        return BigInt::zero();
    }

    let num = liquidity * (sb - sa);
    let den = q96();
    if round_up {
        ceil_div(&num, &den)
    } else {
        num / den
    }
}

fn ordered(a: &BigInt, b: &BigInt) -> (BigInt, BigInt) {
    if a < b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
