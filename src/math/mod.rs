pub mod liquidity;
pub mod price;
pub mod tick_math;

pub use price::{
    decimals_adjustment, full_range_ticks, nearest_usable_tick, price_to_sqrt_ratio, price_to_tick, sqrt_ratio_to_price,
    sqrt_ratio_to_tick, tick_to_display_price, tick_to_price, tick_to_sqrt_ratio,
};
pub use tick_math::{MAX_TICK, MIN_TICK};
