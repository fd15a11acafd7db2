use clmm_position_engine::chain::pools::compute_pool_address;
use clmm_position_engine::engine::position::{from_amounts, resolve_range};
use clmm_position_engine::math::price::*;
use clmm_position_engine::math::tick_math::{MAX_TICK, MIN_TICK};
use clmm_position_engine::models::{FeeTier, PoolState, RangeSpec};
use ethers::types::{Address, H256, U256};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};

const FACTORY: &str = "0x1F98431c8aD98523631AE4a59f267346ea31F984";
const INIT_CODE_HASH: &str = "0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54";
const USDC: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
const WETH: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";

fn relative_error(expected: Decimal, actual: Decimal) -> Decimal {
    ((actual - expected) / expected).abs()
}

#[test]
fn test_price_tick_price_stays_within_one_tick() {
    println!("=== PRICE -> TICK -> PRICE ACROSS DECIMAL PAIRS ===");

    let cases: [(Decimal, u8, u8); 6] = [
        (dec!(2500), 18, 6),
        (dec!(0.0004), 6, 18),
        (dec!(1), 18, 18),
        (dec!(1.0003), 6, 6),
        (dec!(65000.25), 8, 6),
        (dec!(0.000031), 18, 8),
    ];
    for (price, d0, d1) in cases {
        let adj = decimals_adjustment(d0, d1);
        let tick = assert_ok!(price_to_tick(price, adj));
        let back = assert_ok!(tick_to_price(tick, adj));
        let error = relative_error(price, back);
        println!("  {price} ({d0}/{d1}) -> tick {tick} -> {back} (error {error})");

        // Ticks floor, so the decoded price sits at most one tick (1 bp) below.
        assert!(back <= price, "{back} above {price}");
        assert!(error < dec!(0.00011), "{price}: error {error}");
    }
}

#[test]
fn test_six_vs_eighteen_decimals_at_2500() {
    // 1 A (6 decimals) = 2500 B (18 decimals), A sorted first.
    let adj = decimals_adjustment(6, 18);
    assert_eq!(adj, 12);
    let tick = assert_ok!(price_to_tick(dec!(2500), adj));
    let back = assert_ok!(tick_to_price(tick, adj));
    let error = relative_error(dec!(2500), back);
    println!("  2500 (6/18) -> tick {tick} -> {back} (error {error})");
    assert!(error < dec!(0.0001), "error {error}");
}

#[test]
fn test_weth_usdc_reference_sqrt_price() {
    // token0 USDC (6), token1 WETH (18): 1/2500 WETH per USDC is 4e8 in base units.
    let sqrt = assert_ok!(price_to_sqrt_ratio(dec!(0.0004), decimals_adjustment(6, 18)));
    assert_eq!(sqrt, U256::from(20_000u64) << 96);

    let price = assert_ok!(sqrt_ratio_to_price(sqrt, decimals_adjustment(6, 18)));
    assert_eq!(price, dec!(0.0004));

    // Same market quoted from an 18/6 pair: 2500 within 0.01%.
    let sqrt = assert_ok!(price_to_sqrt_ratio(dec!(2500), decimals_adjustment(18, 6)));
    let tick = assert_ok!(sqrt_ratio_to_tick(sqrt));
    let display = tick_to_display_price(tick, 18, 6);
    assert!((display - 2500.0).abs() / 2500.0 < 0.0001, "display price {display}");
}

#[test]
fn test_sqrt_ratio_round_trip_on_tick_grid() {
    for tick in (MIN_TICK..=MAX_TICK).step_by(7_919).chain([MIN_TICK, -1, 0, 1, MAX_TICK - 1]) {
        let sqrt = assert_ok!(tick_to_sqrt_ratio(tick));
        assert_eq!(assert_ok!(sqrt_ratio_to_tick(sqrt)), tick);
    }
    assert_err!(tick_to_sqrt_ratio(MAX_TICK + 1));
    assert_err!(price_to_sqrt_ratio(dec!(0), 0));
    assert_err!(price_to_sqrt_ratio(dec!(-1), 0));
}

#[test]
fn test_nearest_usable_tick_is_stable() {
    for fee in FeeTier::ALL {
        let spacing = fee.tick_spacing();
        for tick in [MIN_TICK, -200_001, -12_345, -31, -1, 0, 1, 29, 30, 31, 99_999, MAX_TICK] {
            let usable = nearest_usable_tick(tick, spacing);
            assert_eq!(usable % spacing, 0, "{tick} @ {spacing} -> {usable}");
            assert!((MIN_TICK..=MAX_TICK).contains(&usable));
            assert_eq!(nearest_usable_tick(usable, spacing), usable);
        }
        let (lower, upper) = full_range_ticks(fee);
        assert_eq!(lower, -upper);
        assert!(upper + spacing > MAX_TICK);
    }
}

#[test]
fn test_quotes_never_exceed_desired_amounts() {
    println!("=== LIQUIDITY QUOTES AGAINST DESIRED AMOUNTS ===");

    let desired = [
        (U256::from(1u64), U256::from(1u64)),
        (U256::exp10(6), U256::exp10(18)),
        (U256::from(10u64) * U256::exp10(18), U256::from(25_000u64) * U256::exp10(6)),
        (U256::from(123_456_789u64), U256::from(987_654_321_000u64)),
    ];
    let mut quoted = 0;
    for current in [-120_000, -6_000, 0, 6_000, 200_000] {
        let pool = PoolState {
            address: Address::repeat_byte(0x55),
            token0: Address::repeat_byte(0x01),
            token1: Address::repeat_byte(0x02),
            fee: FeeTier::Medium,
            sqrt_price_x96: assert_ok!(tick_to_sqrt_ratio(current)),
            tick: current,
            liquidity: 0,
        };
        for (lower, upper) in [(-887_220, 887_220), (-6_000, 6_000), (-60, 60), (120_000, 240_000)] {
            for (amount0, amount1) in desired {
                // Dust deposits are rejected rather than quoted.
                let Ok(quote) = from_amounts(&pool, lower, upper, amount0, amount1) else { continue };
                assert!(quote.liquidity > 0);
                assert!(quote.amount0 <= amount0, "tick {current} [{lower},{upper}]: {} > {amount0}", quote.amount0);
                assert!(quote.amount1 <= amount1, "tick {current} [{lower},{upper}]: {} > {amount1}", quote.amount1);
                quoted += 1;
            }
        }
    }
    println!("  {quoted} quotes checked");
    assert!(quoted > 20);
}

#[test]
fn test_price_ranges_follow_caller_orientation() {
    // A is token1 here, so "B per A" bounds invert and swap.
    let adj = decimals_adjustment(6, 18);
    let (lower, upper) = assert_ok!(resolve_range(
        RangeSpec::Prices { lower: dec!(2000), upper: dec!(3000) },
        FeeTier::Medium,
        false,
        adj,
    ));
    assert!(lower < upper);
    assert_eq!(lower % 60, 0);
    assert_eq!(upper % 60, 0);

    let inverted_low = assert_ok!(tick_to_price(lower, adj));
    let inverted_high = assert_ok!(tick_to_price(upper, adj));
    assert!(relative_error(dec!(1) / dec!(3000), inverted_low) < dec!(0.01));
    assert!(relative_error(dec!(1) / dec!(2000), inverted_high) < dec!(0.01));
}

#[test]
fn test_mainnet_pool_addresses() {
    let factory: Address = FACTORY.parse().unwrap();
    let hash: H256 = INIT_CODE_HASH.parse().unwrap();
    let usdc: Address = USDC.parse().unwrap();
    let weth: Address = WETH.parse().unwrap();

    let expected = [
        (FeeTier::Low, "0x88e6A0c2dDD26FEEb64F039a2c41296FcB3f5640"),
        (FeeTier::Medium, "0x8ad599c3A0ff1De082011EFDDc58f1908eb6e6D8"),
    ];
    for (fee, address) in expected {
        let forward = assert_ok!(compute_pool_address(factory, hash, weth, usdc, fee));
        let backward = assert_ok!(compute_pool_address(factory, hash, usdc, weth, fee));
        assert_eq!(forward, backward);
        assert_eq!(forward, address.parse::<Address>().unwrap());
    }
    assert_err!(compute_pool_address(factory, hash, weth, weth, FeeTier::Low));
}
