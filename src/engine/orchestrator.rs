//! The caller-facing engine: resolves tokens, drives pool creation, sizes
//! positions and submits position-manager transactions.
//!
//! Nothing is cached between operations. Every call re-reads the pool and
//! position it touches, and every write goes through the single
//! [`TransactionSubmitter`] owned by the engine, which is why all writes take
//! `&mut self`.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use futures::future::try_join_all;
use rust_decimal::Decimal;

use crate::chain::contracts::{self, CollectParams, DecreaseLiquidityParams, IncreaseLiquidityParams, MintParams};
use crate::chain::events::{DecodedOutcome, EventKind};
use crate::chain::ledger::{CallRequest, TransactionSigner};
use crate::chain::pools::{sort_tokens, PoolLocator};
use crate::chain::resilience::ResilientLedger;
use crate::chain::submit::{ConfirmationPolicy, TransactionSubmitter};
use crate::chain::tokens::{TokenResolver, TokenTable};
use crate::engine::approvals::ApprovalManager;
use crate::engine::position::{self, LiquidityQuote};
use crate::error::EngineError;
use crate::math::price::decimals_adjustment;
use crate::models::{
    FeeTier, MintRequest, PoolState, Position, PositionAmounts, TokenDescriptor, TokenReference, TransactionResult,
    TxOptions,
};

/// Deployment addresses and per-operation defaults.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub factory: Address,
    pub position_manager: Address,
    pub init_code_hash: H256,
    pub default_slippage: Decimal,
    pub default_deadline: Duration,
    pub confirmation: ConfirmationPolicy,
}

pub struct LiquidityEngine {
    chain_id: u64,
    ledger: Arc<ResilientLedger>,
    resolver: TokenResolver,
    pools: PoolLocator,
    approvals: ApprovalManager,
    submitter: TransactionSubmitter,
    position_manager: Address,
    default_slippage: Decimal,
    default_deadline: Duration,
}

/// A sorted pair with the side each caller token landed on.
struct SortedPair {
    token0: TokenDescriptor,
    token1: TokenDescriptor,
    a_is_token0: bool,
}

impl SortedPair {
    fn new(a: TokenDescriptor, b: TokenDescriptor) -> Result<Self, EngineError> {
        if a.same_token(&b) {
            return Err(EngineError::InvalidParameter(format!("{} cannot be paired with itself", a.symbol)));
        }
        let (first, _) = sort_tokens(a.address, b.address)?;
        let a_is_token0 = first == a.address;
        let (token0, token1) = if a_is_token0 { (a, b) } else { (b, a) };
        Ok(Self { token0, token1, a_is_token0 })
    }

    fn decimals_adjustment(&self) -> i32 {
        decimals_adjustment(self.token0.decimals, self.token1.decimals)
    }

    /// Orders caller-side (A, B) values as (token0, token1).
    fn order<T>(&self, a: T, b: T) -> (T, T) {
        if self.a_is_token0 {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Native value to attach for the given sorted amounts.
    fn native_value(&self, amount0: U256, amount1: U256) -> U256 {
        if self.token0.is_native {
            amount0
        } else if self.token1.is_native {
            amount1
        } else {
            U256::zero()
        }
    }
}

impl LiquidityEngine {
    pub fn new(
        chain_id: u64,
        ledger: Arc<ResilientLedger>,
        signer: Arc<dyn TransactionSigner>,
        table: Arc<TokenTable>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            chain_id,
            resolver: TokenResolver::new(ledger.clone(), table),
            pools: PoolLocator::new(ledger.clone(), settings.factory, settings.init_code_hash),
            approvals: ApprovalManager::new(ledger.clone(), settings.position_manager),
            submitter: TransactionSubmitter::new(ledger.clone(), signer, settings.confirmation),
            ledger,
            position_manager: settings.position_manager,
            default_slippage: settings.default_slippage,
            default_deadline: settings.default_deadline,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn account(&self) -> Address {
        self.submitter.account()
    }

    pub fn position_manager(&self) -> Address {
        self.position_manager
    }

    pub fn pool_address(&self, token_a: Address, token_b: Address, fee: FeeTier) -> Result<Address, EngineError> {
        self.pools.locate(token_a, token_b, fee)
    }

    /// Confirms the connected node serves the configured chain.
    pub async fn verify_chain(&self) -> Result<(), EngineError> {
        let remote = self.ledger.chain_id().await?;
        if remote != self.chain_id {
            return Err(EngineError::Config(format!(
                "provider {} serves chain {remote}, expected {}",
                self.ledger.primary_label(),
                self.chain_id
            )));
        }
        Ok(())
    }

    fn check_chain(&self, reference: &TokenReference) -> Result<(), EngineError> {
        if reference.chain_id != self.chain_id {
            return Err(EngineError::InvalidParameter(format!(
                "token {:?} is on chain {}, engine is on chain {}",
                reference.address, reference.chain_id, self.chain_id
            )));
        }
        Ok(())
    }

    async fn resolve_pair(&self, a: &TokenReference, b: &TokenReference) -> Result<SortedPair, EngineError> {
        self.check_chain(a)?;
        self.check_chain(b)?;
        let (a, b) = self.resolver.resolve_pair(a, b).await?;
        SortedPair::new(a, b)
    }

    fn deadline(&self, options: &TxOptions) -> U256 {
        let deadline = options.deadline.unwrap_or_else(|| {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            now + self.default_deadline.as_secs()
        });
        U256::from(deadline)
    }

    fn minimums(&self, options: &TxOptions, amount0: U256, amount1: U256) -> Result<(U256, U256), EngineError> {
        let slippage = options.slippage.unwrap_or(self.default_slippage);
        Ok((position::apply_slippage(amount0, slippage)?, position::apply_slippage(amount1, slippage)?))
    }

    /// Current pool state, `None` when the pool is missing or has no price yet.
    pub async fn pool_state(
        &self,
        token_a: &TokenReference,
        token_b: &TokenReference,
        fee: FeeTier,
    ) -> Result<Option<PoolState>, EngineError> {
        let pair = self.resolve_pair(token_a, token_b).await?;
        self.pools.get_state(pair.token0.address, pair.token1.address, fee).await
    }

    /// Creates and/or initializes the pool at "B per A" `price` when needed.
    /// An initialized pool is returned as is.
    pub async fn ensure_pool(
        &mut self,
        token_a: &TokenReference,
        token_b: &TokenReference,
        fee: FeeTier,
        price: Decimal,
    ) -> Result<PoolState, EngineError> {
        let pair = self.resolve_pair(token_a, token_b).await?;
        self.ensure_sorted_pool(&pair, fee, price).await
    }

    async fn ensure_sorted_pool(&mut self, pair: &SortedPair, fee: FeeTier, price: Decimal) -> Result<PoolState, EngineError> {
        let sqrt_price_x96 = position::initial_sqrt_price(price, pair.a_is_token0, pair.decimals_adjustment())?;
        self.pools
            .ensure_pool(&mut self.submitter, pair.token0.address, pair.token1.address, fee, sqrt_price_x96)
            .await
    }

    async fn existing_pool(&self, token0: Address, token1: Address, fee: FeeTier) -> Result<PoolState, EngineError> {
        self.pools.get_state(token0, token1, fee).await?.ok_or_else(|| {
            EngineError::InvalidParameter(format!(
                "no initialized {fee} pool for {token0:?}/{token1:?}; supply an initial price to create it"
            ))
        })
    }

    pub async fn position(&self, id: U256) -> Result<Position, EngineError> {
        let raw = self.ledger.call(&CallRequest::new(self.position_manager, contracts::positions(id))).await?;
        contracts::decode_position(id, &raw).map_err(EngineError::from_chain_failure)
    }

    /// Reads several positions concurrently; fails if any one read fails.
    pub async fn positions(&self, ids: &[U256]) -> Result<Vec<Position>, EngineError> {
        try_join_all(ids.iter().map(|id| self.position(*id))).await
    }

    /// Balance checks for both sides, then exact approvals for the ERC20 sides.
    async fn fund(&mut self, pair: &SortedPair, quote: &LiquidityQuote) -> Result<(), EngineError> {
        let owner = self.account();
        tokio::try_join!(
            self.approvals.ensure_balance(owner, &pair.token0, quote.amount0),
            self.approvals.ensure_balance(owner, &pair.token1, quote.amount1),
        )?;
        self.approvals.ensure_allowance(&mut self.submitter, &pair.token0, quote.amount0).await?;
        self.approvals.ensure_allowance(&mut self.submitter, &pair.token1, quote.amount1).await?;
        Ok(())
    }

    /// Attaches native value, wrapping the call so unused value is refunded.
    fn position_call(&self, data: Bytes, value: U256) -> CallRequest {
        if value.is_zero() {
            CallRequest::new(self.position_manager, data)
        } else {
            CallRequest::new(self.position_manager, contracts::multicall(vec![data, contracts::refund_eth()])).with_value(value)
        }
    }

    pub async fn mint(&mut self, request: MintRequest) -> Result<TransactionResult, EngineError> {
        let pair = self.resolve_pair(&request.token_a, &request.token_b).await?;
        // order() is its own inverse: sorted decimals come back in caller order.
        let (decimals_a, decimals_b) = pair.order(pair.token0.decimals, pair.token1.decimals);
        let amount_a = request.amount_a.to_base_units(decimals_a)?;
        let amount_b = request.amount_b.to_base_units(decimals_b)?;
        let (amount0, amount1) = pair.order(amount_a, amount_b);

        let pool = match request.initial_price {
            Some(price) => self.ensure_sorted_pool(&pair, request.fee, price).await?,
            None => self.existing_pool(pair.token0.address, pair.token1.address, request.fee).await?,
        };
        let (tick_lower, tick_upper) =
            position::resolve_range(request.range, request.fee, pair.a_is_token0, pair.decimals_adjustment())?;
        let quote = position::from_amounts(&pool, tick_lower, tick_upper, amount0, amount1)?;
        let (amount0_min, amount1_min) = self.minimums(&request.options, quote.amount0, quote.amount1)?;
        log::info!(
            "minting {}/{} {} [{tick_lower}, {tick_upper}]: liquidity {} from {} / {}",
            pair.token0.symbol,
            pair.token1.symbol,
            request.fee,
            quote.liquidity,
            quote.amount0,
            quote.amount1
        );

        self.fund(&pair, &quote).await?;

        let params = MintParams {
            token0: pair.token0.address,
            token1: pair.token1.address,
            fee: request.fee,
            tick_lower,
            tick_upper,
            amount0_desired: quote.amount0,
            amount1_desired: quote.amount1,
            amount0_min,
            amount1_min,
            recipient: request.recipient.unwrap_or_else(|| self.account()),
            deadline: self.deadline(&request.options),
        };
        let call = self.position_call(params.encode(), pair.native_value(quote.amount0, quote.amount1));
        let receipt = self.submitter.execute(call, "mint").await?;

        let result = self.outcome(&receipt, &[EventKind::PositionMinted, EventKind::LiquidityIncreased], "mint");
        check_minimums(&result, amount0_min, amount1_min, "mint")?;
        Ok(result)
    }

    /// Resolves a position's tokens; with `use_native` the wrapped-native side is paid natively.
    async fn position_pair(&self, position: &Position, use_native: bool) -> Result<SortedPair, EngineError> {
        let wrapped = self.resolver.table().wrapped_native(self.chain_id);
        let reference = |address: Address| {
            let mut r = TokenReference::erc20(self.chain_id, address);
            r.is_native = use_native && Some(address) == wrapped;
            r
        };
        let (r0, r1) = (reference(position.token0), reference(position.token1));
        if use_native && !r0.is_native && !r1.is_native {
            return Err(EngineError::InvalidParameter(format!(
                "position {} has no wrapped-native side to pay natively",
                position.id
            )));
        }
        // Native references resolve through the wrapped address, which is the position's own token.
        let (t0, t1) = self.resolver.resolve_pair(&r0, &r1).await?;
        SortedPair::new(t0, t1)
    }

    pub async fn increase(
        &mut self,
        position_id: U256,
        amounts: PositionAmounts,
        options: TxOptions,
    ) -> Result<TransactionResult, EngineError> {
        let position = self.position(position_id).await?;
        let pair = self.position_pair(&position, amounts.use_native).await?;
        let pool = self.existing_pool(position.token0, position.token1, position.fee).await?;

        let amount0 = amounts.amount0.to_base_units(pair.token0.decimals)?;
        let amount1 = amounts.amount1.to_base_units(pair.token1.decimals)?;
        let quote = position::from_amounts(&pool, position.tick_lower, position.tick_upper, amount0, amount1)?;
        let (amount0_min, amount1_min) = self.minimums(&options, quote.amount0, quote.amount1)?;
        log::info!(
            "increasing position {position_id} by liquidity {} from {} / {}",
            quote.liquidity,
            quote.amount0,
            quote.amount1
        );

        self.fund(&pair, &quote).await?;

        let params = IncreaseLiquidityParams {
            token_id: position_id,
            amount0_desired: quote.amount0,
            amount1_desired: quote.amount1,
            amount0_min,
            amount1_min,
            deadline: self.deadline(&options),
        };
        let call = self.position_call(params.encode(), pair.native_value(quote.amount0, quote.amount1));
        let receipt = self.submitter.execute(call, "increaseLiquidity").await?;

        let mut result = self.outcome(&receipt, &[EventKind::LiquidityIncreased], "increaseLiquidity");
        result.position_id.get_or_insert(position_id);
        check_minimums(&result, amount0_min, amount1_min, "increaseLiquidity")?;
        Ok(result)
    }

    /// Removes `fraction` of the position's liquidity. Withdrawn tokens stay
    /// owed to the position until [`collect`](Self::collect).
    pub async fn decrease(
        &mut self,
        position_id: U256,
        fraction: Decimal,
        options: TxOptions,
    ) -> Result<TransactionResult, EngineError> {
        let position = self.position(position_id).await?;
        let delta = position::liquidity_delta(position.liquidity, fraction)?;
        let pool = self.existing_pool(position.token0, position.token1, position.fee).await?;
        let (expected0, expected1) =
            position::amounts_for_liquidity(&pool, position.tick_lower, position.tick_upper, delta, false)?;
        let (amount0_min, amount1_min) = self.minimums(&options, expected0, expected1)?;
        log::info!(
            "decreasing position {position_id} by {delta} of {} liquidity (expecting {expected0} / {expected1})",
            position.liquidity
        );

        let params = DecreaseLiquidityParams {
            token_id: position_id,
            liquidity: delta,
            amount0_min,
            amount1_min,
            deadline: self.deadline(&options),
        };
        let call = CallRequest::new(self.position_manager, params.encode());
        let receipt = self.submitter.execute(call, "decreaseLiquidity").await?;

        let mut result = self.outcome(&receipt, &[EventKind::LiquidityDecreased], "decreaseLiquidity");
        result.position_id.get_or_insert(position_id);
        result.liquidity.get_or_insert(delta);
        check_minimums(&result, amount0_min, amount1_min, "decreaseLiquidity")?;
        Ok(result)
    }

    /// Collects everything owed to the position. Wrapped-native proceeds are
    /// paid out as the wrapped token.
    pub async fn collect(&mut self, position_id: U256, recipient: Address) -> Result<TransactionResult, EngineError> {
        let call = CallRequest::new(self.position_manager, CollectParams::all(position_id, recipient).encode());
        let receipt = self.submitter.execute(call, "collect").await?;
        let mut result = self.outcome(&receipt, &[EventKind::FeesCollected], "collect");
        result.position_id.get_or_insert(position_id);
        Ok(result)
    }

    /// Result of a confirmed transaction. Missing events leave the amounts at zero.
    fn outcome(&self, receipt: &TransactionReceipt, wanted: &[EventKind], what: &str) -> TransactionResult {
        let decoded = DecodedOutcome::from_logs(&receipt.logs, self.position_manager, wanted);
        if decoded.amount0.is_none() || decoded.amount1.is_none() {
            log::warn!(
                "{what} {:?} confirmed without a decodable {wanted:?} event; reporting zero amounts",
                receipt.transaction_hash
            );
        }
        TransactionResult {
            hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|b| b.as_u64()),
            gas_used: receipt.gas_used,
            position_id: decoded.position_id,
            liquidity: decoded.liquidity,
            amount0: decoded.amount0.unwrap_or_default(),
            amount1: decoded.amount1.unwrap_or_default(),
        }
    }
}

// Only decoded amounts are checked; zero defaults from missing events are not a slippage signal.
fn check_minimums(result: &TransactionResult, amount0_min: U256, amount1_min: U256, what: &str) -> Result<(), EngineError> {
    let decoded = !result.amount0.is_zero() || !result.amount1.is_zero();
    if decoded && (result.amount0 < amount0_min || result.amount1 < amount1_min) {
        return Err(EngineError::SlippageExceeded(format!(
            "{what} {:?} settled {} / {} below minimums {amount0_min} / {amount1_min}",
            result.hash, result.amount0, result.amount1
        )));
    }
    Ok(())
}
