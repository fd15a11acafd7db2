use std::sync::Arc;
use std::time::Duration;

use clmm_position_engine::chain::ledger::Ledger;
use clmm_position_engine::chain::resilience::{ResilientLedger, RetryPolicy};
use clmm_position_engine::chain::submit::ConfirmationPolicy;
use clmm_position_engine::chain::testing::{
    FakeChain, FakeToken, OfflineLedger, FACTORY, INIT_CODE_HASH, POSITION_MANAGER,
};
use clmm_position_engine::chain::tokens::TokenTable;
use clmm_position_engine::engine::{EngineSettings, LiquidityEngine};
use clmm_position_engine::error::{ChainError, EngineError};
use clmm_position_engine::models::{
    FeeTier, MintRequest, PositionAmounts, RangeSpec, TokenAmount, TokenReference, TxOptions,
};
use ethers::types::{Address, U256};
use rust_decimal_macros::dec;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn units(n: u64, decimals: usize) -> U256 {
    U256::from(n) * U256::exp10(decimals)
}

fn engine(chain: &FakeChain, ledgers: Vec<Arc<dyn Ledger>>) -> LiquidityEngine {
    let policy = RetryPolicy {
        base_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        ..RetryPolicy::default()
    };
    let settings = EngineSettings {
        factory: FACTORY,
        position_manager: POSITION_MANAGER,
        init_code_hash: INIT_CODE_HASH,
        default_slippage: dec!(0.01),
        default_deadline: Duration::from_secs(600),
        confirmation: ConfirmationPolicy {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            ..ConfirmationPolicy::default()
        },
    };
    let ledger = Arc::new(ResilientLedger::new(ledgers, policy));
    LiquidityEngine::new(1, ledger, chain.signer(), Arc::new(TokenTable::builtin().unwrap()), settings)
}

/// Two tokens with 6 and 18 decimals; the owner holds 50k of the first and 20 of the second.
fn funded_chain() -> (FakeChain, Address, Address) {
    let chain = FakeChain::new(1);
    let usd = chain.add_token(FakeToken::new("USDT", "Tether USD", 6));
    let eth = chain.add_token(FakeToken::new("stETH", "Staked Ether", 18));
    chain.mint_balance(usd, chain.owner(), units(50_000, 6));
    chain.mint_balance(eth, chain.owner(), units(20, 18));
    (chain, usd, eth)
}

#[tokio::test]
async fn test_position_lifecycle_returns_deposits() {
    init_logging();
    let (chain, usd, eth) = funded_chain();
    let owner = chain.owner();
    let mut engine = engine(&chain, vec![chain.ledger()]);

    // Caller quotes USDT per stETH; stETH is token1 here.
    let minted = engine
        .mint(MintRequest {
            token_a: TokenReference::erc20(1, eth),
            token_b: TokenReference::erc20(1, usd),
            fee: FeeTier::Medium,
            amount_a: "2".parse().unwrap(),
            amount_b: "5000".parse().unwrap(),
            range: RangeSpec::Prices { lower: dec!(2000), upper: dec!(3200) },
            initial_price: Some(dec!(2500)),
            recipient: None,
            options: TxOptions::default(),
        })
        .await
        .unwrap();
    let id = minted.position_id.unwrap();
    let position = engine.position(id).await.unwrap();
    assert_eq!((position.token0, position.token1), (usd, eth));
    assert_eq!(position.tick_lower % 60, 0);
    assert_eq!(position.tick_upper % 60, 0);
    assert_eq!(Some(position.liquidity), minted.liquidity);

    let increased = engine
        .increase(
            id,
            PositionAmounts {
                amount0: "1000".parse().unwrap(),
                amount1: TokenAmount::BaseUnits(units(1, 18)),
                use_native: false,
            },
            TxOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(increased.position_id, Some(id));
    let total = engine.position(id).await.unwrap().liquidity;
    assert_eq!(Some(total - position.liquidity), increased.liquidity);

    let decreased = engine.decrease(id, dec!(1), TxOptions::default()).await.unwrap();
    assert_eq!(decreased.liquidity, Some(total));
    assert_eq!(engine.position(id).await.unwrap().liquidity, 0);

    let collected = engine.collect(id, owner).await.unwrap();
    assert_eq!(collected.amount0, decreased.amount0);
    assert_eq!(collected.amount1, decreased.amount1);

    // Only rounding in the pool's favour is lost on the way out.
    let lost_usd = units(50_000, 6) - chain.balance(usd, owner);
    let lost_eth = units(20, 18) - chain.balance(eth, owner);
    assert!(lost_usd <= U256::from(4u8), "lost {lost_usd} USDT base units");
    assert!(lost_eth <= U256::from(4u8), "lost {lost_eth} stETH base units");
}

#[tokio::test]
async fn test_collect_pays_accrued_fees_to_recipient() {
    init_logging();
    let (chain, usd, eth) = funded_chain();
    let mut engine = engine(&chain, vec![chain.ledger()]);
    let minted = engine
        .mint(MintRequest {
            token_a: TokenReference::erc20(1, usd),
            token_b: TokenReference::erc20(1, eth),
            fee: FeeTier::Low,
            amount_a: "2500".parse().unwrap(),
            amount_b: "1".parse().unwrap(),
            range: RangeSpec::FullRange,
            initial_price: Some(dec!(0.0004)),
            recipient: None,
            options: TxOptions { slippage: Some(dec!(0.001)), deadline: None },
        })
        .await
        .unwrap();
    let id = minted.position_id.unwrap();

    chain.accrue_fees(id, 1_234, 5_678);
    let treasury = Address::repeat_byte(0x7e);
    let collected = engine.collect(id, treasury).await.unwrap();
    assert_eq!(collected.amount0, U256::from(1_234u64));
    assert_eq!(collected.amount1, U256::from(5_678u64));
    assert_eq!(chain.balance(usd, treasury), U256::from(1_234u64));
    assert_eq!(chain.balance(eth, treasury), U256::from(5_678u64));

    // Nothing left to take.
    let again = engine.collect(id, treasury).await.unwrap();
    assert!(again.amount0.is_zero() && again.amount1.is_zero());
}

#[tokio::test(start_paused = true)]
async fn test_engine_survives_a_dead_primary_endpoint() {
    init_logging();
    let (chain, usd, eth) = funded_chain();
    let dead: Arc<dyn Ledger> = Arc::new(OfflineLedger::new("primary", ChainError::rpc(503, "service unavailable")));
    let mut engine = engine(&chain, vec![dead, chain.ledger()]);
    engine.verify_chain().await.unwrap();

    let state = engine
        .ensure_pool(&TokenReference::erc20(1, usd), &TokenReference::erc20(1, eth), FeeTier::High, dec!(0.0004))
        .await
        .unwrap();
    assert_eq!(state.fee, FeeTier::High);
    assert_eq!((state.token0, state.token1), (usd, eth));

    let err = engine.position(U256::from(42u8)).await.unwrap_err();
    assert!(matches!(err, EngineError::Reverted(_)), "{err:?}");
}
