//! In-memory chain for exercising the engine without a node.
//!
//! `FakeChain` implements both [`Ledger`] and [`TransactionSigner`]. It models
//! just enough of the factory, pools, position manager and ERC20 tokens to
//! run every engine operation end to end, including reverts, lost receipts,
//! rejected signatures and a pool-creation race.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ethers::abi::{self, AbiDecode, Token};
use ethers::types::{Address, Bytes, Log, TransactionReceipt, TxHash, H256, U256, U64};
use ethers::utils::keccak256;
use num_bigint::BigInt;

use crate::chain::contracts::{
    self, int24, uint, CollectParams, DecreaseLiquidityParams, Erc20Calls, IncreaseLiquidityParams, MintParams,
};
use crate::chain::events;
use crate::chain::ledger::{CallRequest, Ledger, TransactionSigner};
use crate::chain::pools::{compute_pool_address, sort_tokens};
use crate::chain::tokens::TokenTable;
use crate::error::{ChainError, ChainErrorKind};
use crate::math::liquidity::{amounts_for_liquidity, liquidity_for_amounts};
use crate::math::tick_math::{bigint_to_u256, get_sqrt_ratio_at_tick, get_tick_at_sqrt_ratio, u256_to_bigint};
use crate::models::FeeTier;

pub const FACTORY: Address = Address::repeat_byte(0xfa);
pub const POSITION_MANAGER: Address = Address::repeat_byte(0xe0);
pub const INIT_CODE_HASH: H256 = H256::repeat_byte(0x1c);

const CONTRACT_CODE: [u8; 1] = [0x60];

#[derive(Debug, Clone)]
pub struct FakeToken {
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    bytes32_symbol: bool,
}

impl FakeToken {
    pub fn new(symbol: &str, name: &str, decimals: u8) -> Self {
        Self { symbol: symbol.into(), name: name.into(), decimals, bytes32_symbol: false }
    }

    /// Returns `symbol()` as a NUL-padded bytes32, like some legacy tokens.
    pub fn with_bytes32_symbol(mut self) -> Self {
        self.bytes32_symbol = true;
        self
    }
}

#[derive(Debug, Clone)]
struct TokenState {
    meta: FakeToken,
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
}

#[derive(Debug, Clone)]
struct PoolEntry {
    token0: Address,
    token1: Address,
    fee: FeeTier,
    sqrt_price_x96: U256,
    tick: i32,
    liquidity: u128,
}

#[derive(Debug, Clone)]
struct PositionEntry {
    owner: Address,
    token0: Address,
    token1: Address,
    fee: FeeTier,
    tick_lower: i32,
    tick_upper: i32,
    liquidity: u128,
    owed0: u128,
    owed1: u128,
}

#[derive(Debug, Clone, Default)]
struct State {
    tokens: HashMap<Address, TokenState>,
    pools: HashMap<Address, PoolEntry>,
    positions: BTreeMap<U256, PositionEntry>,
    native: HashMap<Address, U256>,
    wrapped_native: Option<Address>,
    next_position_id: u64,
    next_token: u64,
    block: u64,
    nonce: u64,
    receipts: HashMap<TxHash, TransactionReceipt>,
    sent: Vec<[u8; 4]>,
    call_failures: HashMap<Address, ChainError>,
    upcoming_failures: VecDeque<ChainError>,
    race_on_create: Option<U256>,
    withhold_receipts: bool,
    receipt_failure: Option<ChainError>,
    reject_signatures: bool,
}

/// Per-transaction context: who is calling and how much native value is left.
struct Ctx {
    from: Address,
    value_left: U256,
    logs: Vec<Log>,
}

type Revert = String;

#[derive(Clone)]
pub struct FakeChain {
    chain_id: u64,
    owner: Address,
    label: String,
    state: Arc<Mutex<State>>,
}

impl FakeChain {
    /// A chain whose signer is `owner()`. The wrapped native token from the
    /// built-in table, if any, is deployed as an ordinary ERC20.
    pub fn new(chain_id: u64) -> Self {
        let chain = Self {
            chain_id,
            owner: Address::repeat_byte(0x0e),
            label: "fake".into(),
            state: Arc::new(Mutex::new(State { next_position_id: 1, block: 1, ..State::default() })),
        };
        let wrapped = TokenTable::builtin().ok().and_then(|t| t.wrapped_native(chain_id));
        if let Some(weth) = wrapped {
            let mut state = chain.lock();
            state.wrapped_native = Some(weth);
            state.tokens.insert(
                weth,
                TokenState {
                    meta: FakeToken::new("WETH", "Wrapped Ether", 18),
                    balances: HashMap::new(),
                    allowances: HashMap::new(),
                },
            );
        }
        chain
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.into();
        self
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        Arc::new(self.clone())
    }

    pub fn signer(&self) -> Arc<dyn TransactionSigner> {
        Arc::new(self.clone())
    }

    pub fn owner(&self) -> Address {
        self.owner
    }

    pub fn wrapped_native(&self) -> Option<Address> {
        self.lock().wrapped_native
    }

    /// Deploys a token at the next synthetic address (increasing, so deploy order is sort order).
    pub fn add_token(&self, meta: FakeToken) -> Address {
        let mut state = self.lock();
        state.next_token += 1;
        let address = Address::from_low_u64_be(0x1000 + state.next_token);
        state.tokens.insert(address, TokenState { meta, balances: HashMap::new(), allowances: HashMap::new() });
        address
    }

    pub fn mint_balance(&self, token: Address, holder: Address, amount: U256) {
        if let Some(t) = self.lock().tokens.get_mut(&token) {
            let entry = t.balances.entry(holder).or_default();
            *entry = entry.saturating_add(amount);
        }
    }

    pub fn set_native_balance(&self, holder: Address, amount: U256) {
        self.lock().native.insert(holder, amount);
    }

    pub fn native_balance_of(&self, holder: Address) -> U256 {
        self.lock().native.get(&holder).copied().unwrap_or_default()
    }

    pub fn balance(&self, token: Address, holder: Address) -> U256 {
        self.lock()
            .tokens
            .get(&token)
            .and_then(|t| t.balances.get(&holder).copied())
            .unwrap_or_default()
    }

    pub fn allowance(&self, token: Address, owner: Address, spender: Address) -> U256 {
        self.lock()
            .tokens
            .get(&token)
            .and_then(|t| t.allowances.get(&(owner, spender)).copied())
            .unwrap_or_default()
    }

    pub fn set_allowance(&self, token: Address, owner: Address, spender: Address, amount: U256) {
        if let Some(t) = self.lock().tokens.get_mut(&token) {
            t.allowances.insert((owner, spender), amount);
        }
    }

    /// Deploys a pool directly, initialized when `sqrt_price_x96` is given.
    pub fn deploy_pool(&self, token_a: Address, token_b: Address, fee: FeeTier, sqrt_price_x96: Option<U256>) -> Address {
        let mut state = self.lock();
        let pool = create_pool_entry(&mut state, token_a, token_b, fee).unwrap_or_else(|e| panic!("deploy_pool: {e}"));
        if let Some(sqrt) = sqrt_price_x96 {
            initialize_pool(&mut state, pool, sqrt).unwrap_or_else(|e| panic!("deploy_pool: {e}"));
        }
        pool
    }

    pub fn pool_liquidity(&self, pool: Address) -> Option<u128> {
        self.lock().pools.get(&pool).map(|p| p.liquidity)
    }

    pub fn position_liquidity(&self, id: U256) -> Option<u128> {
        self.lock().positions.get(&id).map(|p| p.liquidity)
    }

    /// Adds fees owed to a position, as swaps through its range would.
    pub fn accrue_fees(&self, id: U256, owed0: u128, owed1: u128) {
        if let Some(p) = self.lock().positions.get_mut(&id) {
            p.owed0 += owed0;
            p.owed1 += owed1;
        }
    }

    /// Selectors of every transaction sent so far, in order.
    pub fn sent_selectors(&self) -> Vec<[u8; 4]> {
        self.lock().sent.clone()
    }

    pub fn sent_count(&self, signature: &str) -> usize {
        let selector = contracts::selector(signature);
        self.lock().sent.iter().filter(|s| **s == selector).count()
    }

    /// Every `eth_call` to `target` fails with `error` from now on.
    pub fn fail_calls_to(&self, target: Address, error: ChainError) {
        self.lock().call_failures.insert(target, error);
    }

    /// The next `n` remote requests of any kind fail with `error`.
    pub fn fail_next(&self, n: usize, error: ChainError) {
        let mut state = self.lock();
        for _ in 0..n {
            state.upcoming_failures.push_back(error.clone());
        }
    }

    /// Another account creates and initializes the pool right before our own `createPool` lands.
    pub fn race_pool_creation(&self, their_sqrt_price_x96: U256) {
        self.lock().race_on_create = Some(their_sqrt_price_x96);
    }

    pub fn withhold_receipts(&self, withhold: bool) {
        self.lock().withhold_receipts = withhold;
    }

    /// Every receipt lookup fails with `error` from now on.
    pub fn fail_receipts(&self, error: ChainError) {
        self.lock().receipt_failure = Some(error);
    }

    pub fn reject_signatures(&self, reject: bool) {
        self.lock().reject_signatures = reject;
    }

    fn injected_failure(&self) -> Result<(), ChainError> {
        match self.lock().upcoming_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Ledger for FakeChain {
    fn label(&self) -> &str {
        &self.label
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        self.injected_failure()?;
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        self.injected_failure()?;
        Ok(self.lock().block)
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, ChainError> {
        self.injected_failure()?;
        let mut state = self.lock();
        if let Some(err) = state.call_failures.get(&request.to) {
            return Err(err.clone());
        }
        if request.selector() == Some(contracts::selector(contracts::CREATE_POOL)) {
            if let Some(their_price) = state.race_on_create.take() {
                race_create(&mut state, &request.data, their_price);
            }
        }

        let mut scratch = state.clone();
        drop(state);
        let mut ctx = Ctx { from: request.from.unwrap_or_default(), value_left: request.value, logs: Vec::new() };
        execute(&mut scratch, &mut ctx, request.to, &request.data).map_err(|reason| ChainError::revert_with_reason(&reason))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.injected_failure()?;
        let state = self.lock();
        let deployed = address == FACTORY
            || address == POSITION_MANAGER
            || state.tokens.contains_key(&address)
            || state.pools.contains_key(&address);
        Ok(if deployed { Bytes::from(CONTRACT_CODE.to_vec()) } else { Bytes::new() })
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.injected_failure()?;
        Ok(self.native_balance_of(address))
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        self.injected_failure()?;
        let state = self.lock();
        if let Some(err) = &state.receipt_failure {
            return Err(err.clone());
        }
        if state.withhold_receipts {
            return Ok(None);
        }
        Ok(state.receipts.get(&hash).cloned())
    }
}

#[async_trait]
impl TransactionSigner for FakeChain {
    fn address(&self) -> Address {
        self.owner
    }

    async fn send_transaction(&self, request: &CallRequest) -> Result<TxHash, ChainError> {
        if self.lock().reject_signatures {
            return Err(ChainError::new(ChainErrorKind::Rejected, "user rejected transaction"));
        }
        self.injected_failure()?;

        let mut state = self.lock();
        let from = self.owner;
        let funds = state.native.get(&from).copied().unwrap_or_default();
        if funds < request.value {
            return Err(ChainError::rpc(-32000, "insufficient funds for gas * price + value"));
        }

        state.nonce += 1;
        state.block += 1;
        let hash = H256::from(keccak256(state.nonce.to_be_bytes()));
        if let Some(selector) = request.selector() {
            state.sent.push(selector);
        }

        // Reverted transactions leave no trace beyond the receipt.
        let mut scratch = state.clone();
        scratch.native.insert(from, funds - request.value);
        let mut ctx = Ctx { from, value_left: request.value, logs: Vec::new() };
        let status = match execute(&mut scratch, &mut ctx, request.to, &request.data) {
            Ok(_) => {
                // Value not refunded through refundETH() stays with the callee.
                *state = scratch;
                1u64
            }
            Err(_) => 0u64,
        };

        let receipt = TransactionReceipt {
            transaction_hash: hash,
            block_number: Some(U64::from(state.block)),
            gas_used: Some(U256::from(150_000u64)),
            status: Some(U64::from(status)),
            from,
            to: Some(request.to),
            logs: if status == 1 { ctx.logs } else { Vec::new() },
            ..Default::default()
        };
        state.receipts.insert(hash, receipt);
        Ok(hash)
    }
}

/// Always fails with the same error; stands in for a dead provider.
pub struct OfflineLedger {
    label: String,
    error: ChainError,
}

impl OfflineLedger {
    pub fn new(label: &str, error: ChainError) -> Self {
        Self { label: label.into(), error }
    }
}

#[async_trait]
impl Ledger for OfflineLedger {
    fn label(&self) -> &str {
        &self.label
    }
    async fn chain_id(&self) -> Result<u64, ChainError> {
        Err(self.error.clone())
    }
    async fn block_number(&self) -> Result<u64, ChainError> {
        Err(self.error.clone())
    }
    async fn call(&self, _: &CallRequest) -> Result<Bytes, ChainError> {
        Err(self.error.clone())
    }
    async fn code_at(&self, _: Address) -> Result<Bytes, ChainError> {
        Err(self.error.clone())
    }
    async fn native_balance(&self, _: Address) -> Result<U256, ChainError> {
        Err(self.error.clone())
    }
    async fn receipt(&self, _: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        Err(self.error.clone())
    }
}

// ---------------------------------------------------------------------------
// Contract behaviour

fn execute(state: &mut State, ctx: &mut Ctx, to: Address, data: &[u8]) -> Result<Bytes, Revert> {
    if to == FACTORY {
        return factory_call(state, data);
    }
    if to == POSITION_MANAGER {
        return manager_call(state, ctx, data);
    }
    if state.pools.contains_key(&to) {
        return pool_call(state, to, data);
    }
    if state.tokens.contains_key(&to) {
        return token_call(state, ctx, to, data);
    }
    // Plain account: calls succeed and do nothing.
    Ok(Bytes::new())
}

fn selector_of(data: &[u8]) -> Option<[u8; 4]> {
    data.get(..4).map(|s| [s[0], s[1], s[2], s[3]])
}

fn is(data: &[u8], signature: &str) -> bool {
    selector_of(data) == Some(contracts::selector(signature))
}

fn create_pool_entry(state: &mut State, token_a: Address, token_b: Address, fee: FeeTier) -> Result<Address, Revert> {
    let (token0, token1) = sort_tokens(token_a, token_b).map_err(|e| e.to_string())?;
    let pool = compute_pool_address(FACTORY, INIT_CODE_HASH, token0, token1, fee).map_err(|e| e.to_string())?;
    if state.pools.contains_key(&pool) {
        return Err("pool already exists".into());
    }
    state.pools.insert(
        pool,
        PoolEntry { token0, token1, fee, sqrt_price_x96: U256::zero(), tick: 0, liquidity: 0 },
    );
    Ok(pool)
}

fn initialize_pool(state: &mut State, pool: Address, sqrt_price_x96: U256) -> Result<(), Revert> {
    let entry = state.pools.get_mut(&pool).ok_or_else(|| "no pool".to_string())?;
    if !entry.sqrt_price_x96.is_zero() {
        return Err("AI".into());
    }
    let tick = get_tick_at_sqrt_ratio(&u256_to_bigint(sqrt_price_x96)).map_err(|_| "R".to_string())?;
    entry.sqrt_price_x96 = sqrt_price_x96;
    entry.tick = tick;
    Ok(())
}

fn race_create(state: &mut State, data: &[u8], their_price: U256) {
    let Ok(tokens) = contracts::decode_call(
        contracts::CREATE_POOL,
        &[abi::ParamType::Address, abi::ParamType::Address, abi::ParamType::Uint(24)],
        data,
    ) else {
        return;
    };
    let mut it = tokens.into_iter();
    let (Some(a), Some(b), Some(fee)) = (it.next(), it.next(), it.next()) else { return };
    let (Ok(a), Ok(b), Ok(fee)) = (contracts::take_address(a), contracts::take_address(b), contracts::take_fee(fee)) else {
        return;
    };
    if let Ok(pool) = create_pool_entry(state, a, b, fee) {
        let _ = initialize_pool(state, pool, their_price);
    }
}

fn factory_call(state: &mut State, data: &[u8]) -> Result<Bytes, Revert> {
    if !is(data, contracts::CREATE_POOL) {
        return Err("factory: unknown selector".into());
    }
    let tokens = contracts::decode_call(
        contracts::CREATE_POOL,
        &[abi::ParamType::Address, abi::ParamType::Address, abi::ParamType::Uint(24)],
        data,
    )
    .map_err(|e| e.to_string())?;
    let mut it = tokens.into_iter();
    let mut next = || it.next().ok_or_else(|| "createPool: missing argument".to_string());
    let a = contracts::take_address(next()?).map_err(|e| e.to_string())?;
    let b = contracts::take_address(next()?).map_err(|e| e.to_string())?;
    let fee = contracts::take_fee(next()?).map_err(|e| e.to_string())?;
    let pool = create_pool_entry(state, a, b, fee)?;
    Ok(abi::encode(&[Token::Address(pool)]).into())
}

fn pool_call(state: &mut State, pool: Address, data: &[u8]) -> Result<Bytes, Revert> {
    if is(data, contracts::INITIALIZE) {
        let tokens = contracts::decode_call(contracts::INITIALIZE, &[abi::ParamType::Uint(160)], data)
            .map_err(|e| e.to_string())?;
        let sqrt = tokens.into_iter().next().and_then(|t| t.into_uint()).ok_or_else(|| "bad price".to_string())?;
        initialize_pool(state, pool, sqrt)?;
        return Ok(Bytes::new());
    }
    let entry = state.pools.get(&pool).ok_or_else(|| "no pool".to_string())?;
    let out = if is(data, contracts::SLOT0) {
        abi::encode(&[
            Token::Uint(entry.sqrt_price_x96),
            int24(entry.tick),
            uint(0u8),
            uint(1u8),
            uint(1u8),
            uint(0u8),
            Token::Bool(true),
        ])
    } else if is(data, contracts::LIQUIDITY) {
        abi::encode(&[uint(entry.liquidity)])
    } else if is(data, contracts::TOKEN0) {
        abi::encode(&[Token::Address(entry.token0)])
    } else if is(data, contracts::TOKEN1) {
        abi::encode(&[Token::Address(entry.token1)])
    } else {
        return Err("pool: unknown selector".into());
    };
    Ok(out.into())
}

fn token_call(state: &mut State, ctx: &mut Ctx, token: Address, data: &[u8]) -> Result<Bytes, Revert> {
    let call = Erc20Calls::decode(data).map_err(|e| format!("erc20: {e}"))?;
    let t = state.tokens.get_mut(&token).ok_or_else(|| "no token".to_string())?;
    let out = match call {
        Erc20Calls::Decimals(_) => abi::encode(&[uint(t.meta.decimals)]),
        Erc20Calls::Symbol(_) if t.meta.bytes32_symbol => {
            let mut word = [0u8; 32];
            let raw = t.meta.symbol.as_bytes();
            word[..raw.len().min(32)].copy_from_slice(&raw[..raw.len().min(32)]);
            word.to_vec()
        }
        Erc20Calls::Symbol(_) => abi::encode(&[Token::String(t.meta.symbol.clone())]),
        Erc20Calls::Name(_) => abi::encode(&[Token::String(t.meta.name.clone())]),
        Erc20Calls::BalanceOf(c) => abi::encode(&[Token::Uint(t.balances.get(&c.owner).copied().unwrap_or_default())]),
        Erc20Calls::Allowance(c) => abi::encode(&[Token::Uint(
            t.allowances.get(&(c.owner, c.spender)).copied().unwrap_or_default(),
        )]),
        Erc20Calls::Approve(c) => {
            t.allowances.insert((ctx.from, c.spender), c.amount);
            abi::encode(&[Token::Bool(true)])
        }
    };
    Ok(out.into())
}

/// Pulls `amount` of `token` from the caller: native value first for the wrapped token, then transferFrom.
fn pay(state: &mut State, ctx: &mut Ctx, token: Address, amount: U256) -> Result<(), Revert> {
    if amount.is_zero() {
        return Ok(());
    }
    if Some(token) == state.wrapped_native && ctx.value_left >= amount {
        ctx.value_left -= amount;
        return Ok(());
    }
    let t = state.tokens.get_mut(&token).ok_or_else(|| "STF".to_string())?;
    let allowance = t.allowances.get(&(ctx.from, POSITION_MANAGER)).copied().unwrap_or_default();
    let balance = t.balances.get(&ctx.from).copied().unwrap_or_default();
    if allowance < amount || balance < amount {
        return Err("STF".into());
    }
    if allowance != U256::MAX {
        t.allowances.insert((ctx.from, POSITION_MANAGER), allowance - amount);
    }
    t.balances.insert(ctx.from, balance - amount);
    Ok(())
}

fn credit(state: &mut State, token: Address, to: Address, amount: U256) {
    if let Some(t) = state.tokens.get_mut(&token) {
        let entry = t.balances.entry(to).or_default();
        *entry = entry.saturating_add(amount);
    }
}

fn to_u256(v: &BigInt) -> Result<U256, Revert> {
    bigint_to_u256(v).map_err(|e| e.to_string())
}

fn to_u128(v: &BigInt) -> Result<u128, Revert> {
    let v = to_u256(v)?;
    if v > U256::from(u128::MAX) {
        return Err("liquidity overflow".into());
    }
    Ok(v.low_u128())
}

/// Liquidity and owed amounts for adding `a0`/`a1` over [lower, upper] in `pool`.
fn add_liquidity(pool: &PoolEntry, lower: i32, upper: i32, a0: U256, a1: U256) -> Result<(u128, U256, U256), Revert> {
    if pool.sqrt_price_x96.is_zero() {
        return Err("LOK".into());
    }
    let spacing = pool.fee.tick_spacing();
    if lower >= upper {
        return Err("TLU".into());
    }
    if lower % spacing != 0 || upper % spacing != 0 {
        return Err("tick not on spacing".into());
    }
    let sa = get_sqrt_ratio_at_tick(lower).map_err(|_| "TLM".to_string())?;
    let sb = get_sqrt_ratio_at_tick(upper).map_err(|_| "TUM".to_string())?;
    let sp = u256_to_bigint(pool.sqrt_price_x96);
    let l = liquidity_for_amounts(&sp, &sa, &sb, &u256_to_bigint(a0), &u256_to_bigint(a1));
    let liquidity = to_u128(&l)?;
    if liquidity == 0 {
        return Err("zero liquidity".into());
    }
    let (used0, used1) = amounts_for_liquidity(&sp, &sa, &sb, &l, true);
    Ok((liquidity, to_u256(&used0)?, to_u256(&used1)?))
}

fn in_range(pool: &PoolEntry, lower: i32, upper: i32) -> bool {
    lower <= pool.tick && pool.tick < upper
}

fn pool_for(state: &State, token0: Address, token1: Address, fee: FeeTier) -> Result<Address, Revert> {
    let pool = compute_pool_address(FACTORY, INIT_CODE_HASH, token0, token1, fee).map_err(|e| e.to_string())?;
    if state.pools.contains_key(&pool) {
        Ok(pool)
    } else {
        Err(String::new())
    }
}

fn manager_call(state: &mut State, ctx: &mut Ctx, data: &[u8]) -> Result<Bytes, Revert> {
    if is(data, contracts::MULTICALL) {
        let calls = contracts::decode_multicall(data).map_err(|e| e.to_string())?;
        let mut results = Vec::new();
        for call in calls {
            results.push(Token::Bytes(manager_call(state, ctx, &call)?.to_vec()));
        }
        return Ok(abi::encode(&[Token::Array(results)]).into());
    }
    if is(data, contracts::REFUND_ETH) {
        let from = ctx.from;
        let refund = std::mem::take(&mut ctx.value_left);
        let entry = state.native.entry(from).or_default();
        *entry = entry.saturating_add(refund);
        return Ok(Bytes::new());
    }
    if is(data, contracts::POSITIONS) {
        let tokens = contracts::decode_call(contracts::POSITIONS, &[abi::ParamType::Uint(256)], data)
            .map_err(|e| e.to_string())?;
        let id = tokens.into_iter().next().and_then(|t| t.into_uint()).unwrap_or_default();
        let p = state.positions.get(&id).ok_or_else(|| "Invalid token ID".to_string())?;
        return Ok(abi::encode(&[
            uint(0u8),
            Token::Address(Address::zero()),
            Token::Address(p.token0),
            Token::Address(p.token1),
            uint(p.fee.fee_pips()),
            int24(p.tick_lower),
            int24(p.tick_upper),
            uint(p.liquidity),
            uint(0u8),
            uint(0u8),
            uint(p.owed0),
            uint(p.owed1),
        ])
        .into());
    }
    if is(data, contracts::MINT) {
        return mint(state, ctx, MintParams::decode(data).map_err(|e| e.to_string())?);
    }
    if is(data, contracts::INCREASE_LIQUIDITY) {
        return increase(state, ctx, IncreaseLiquidityParams::decode(data).map_err(|e| e.to_string())?);
    }
    if is(data, contracts::DECREASE_LIQUIDITY) {
        return decrease(state, ctx, DecreaseLiquidityParams::decode(data).map_err(|e| e.to_string())?);
    }
    if is(data, contracts::COLLECT) {
        return collect(state, ctx, CollectParams::decode(data).map_err(|e| e.to_string())?);
    }
    Err("manager: unknown selector".into())
}

fn mint(state: &mut State, ctx: &mut Ctx, p: MintParams) -> Result<Bytes, Revert> {
    if p.deadline.is_zero() {
        return Err("Transaction too old".into());
    }
    let pool_address = pool_for(state, p.token0, p.token1, p.fee)?;
    let pool = state.pools[&pool_address].clone();
    let (liquidity, used0, used1) = add_liquidity(&pool, p.tick_lower, p.tick_upper, p.amount0_desired, p.amount1_desired)?;
    if used0 < p.amount0_min || used1 < p.amount1_min {
        return Err("Price slippage check".into());
    }
    pay(state, ctx, p.token0, used0)?;
    pay(state, ctx, p.token1, used1)?;

    if in_range(&pool, p.tick_lower, p.tick_upper) {
        if let Some(entry) = state.pools.get_mut(&pool_address) {
            entry.liquidity += liquidity;
        }
    }
    let id = U256::from(state.next_position_id);
    state.next_position_id += 1;
    state.positions.insert(
        id,
        PositionEntry {
            owner: p.recipient,
            token0: p.token0,
            token1: p.token1,
            fee: p.fee,
            tick_lower: p.tick_lower,
            tick_upper: p.tick_upper,
            liquidity,
            owed0: 0,
            owed1: 0,
        },
    );
    ctx.logs.push(logs::nft_mint_log(POSITION_MANAGER, p.recipient, id));
    ctx.logs.push(logs::liquidity_log(POSITION_MANAGER, events::INCREASE_LIQUIDITY, id, liquidity, used0, used1));
    Ok(abi::encode(&[Token::Uint(id), uint(liquidity), Token::Uint(used0), Token::Uint(used1)]).into())
}

fn increase(state: &mut State, ctx: &mut Ctx, p: IncreaseLiquidityParams) -> Result<Bytes, Revert> {
    let position = state.positions.get(&p.token_id).cloned().ok_or_else(|| "Invalid token ID".to_string())?;
    let pool_address = pool_for(state, position.token0, position.token1, position.fee)?;
    let pool = state.pools[&pool_address].clone();
    let (liquidity, used0, used1) =
        add_liquidity(&pool, position.tick_lower, position.tick_upper, p.amount0_desired, p.amount1_desired)?;
    if used0 < p.amount0_min || used1 < p.amount1_min {
        return Err("Price slippage check".into());
    }
    pay(state, ctx, position.token0, used0)?;
    pay(state, ctx, position.token1, used1)?;

    if in_range(&pool, position.tick_lower, position.tick_upper) {
        if let Some(entry) = state.pools.get_mut(&pool_address) {
            entry.liquidity += liquidity;
        }
    }
    if let Some(entry) = state.positions.get_mut(&p.token_id) {
        entry.liquidity += liquidity;
    }
    ctx.logs.push(logs::liquidity_log(POSITION_MANAGER, events::INCREASE_LIQUIDITY, p.token_id, liquidity, used0, used1));
    Ok(abi::encode(&[uint(liquidity), Token::Uint(used0), Token::Uint(used1)]).into())
}

fn decrease(state: &mut State, ctx: &mut Ctx, p: DecreaseLiquidityParams) -> Result<Bytes, Revert> {
    let position = state.positions.get(&p.token_id).cloned().ok_or_else(|| "Invalid token ID".to_string())?;
    if position.owner != ctx.from {
        return Err("Not approved".into());
    }
    if p.liquidity == 0 || p.liquidity > position.liquidity {
        return Err(String::new());
    }
    let pool_address = pool_for(state, position.token0, position.token1, position.fee)?;
    let pool = state.pools[&pool_address].clone();
    let sa = get_sqrt_ratio_at_tick(position.tick_lower).map_err(|e| e.to_string())?;
    let sb = get_sqrt_ratio_at_tick(position.tick_upper).map_err(|e| e.to_string())?;
    let sp = u256_to_bigint(pool.sqrt_price_x96);
    let (a0, a1) = amounts_for_liquidity(&sp, &sa, &sb, &BigInt::from(p.liquidity), false);
    let (a0, a1) = (to_u256(&a0)?, to_u256(&a1)?);
    if a0 < p.amount0_min || a1 < p.amount1_min {
        return Err("Price slippage check".into());
    }

    if in_range(&pool, position.tick_lower, position.tick_upper) {
        if let Some(entry) = state.pools.get_mut(&pool_address) {
            entry.liquidity -= p.liquidity;
        }
    }
    if let Some(entry) = state.positions.get_mut(&p.token_id) {
        entry.liquidity -= p.liquidity;
        entry.owed0 = entry.owed0.saturating_add(a0.low_u128());
        entry.owed1 = entry.owed1.saturating_add(a1.low_u128());
    }
    ctx.logs.push(logs::liquidity_log(POSITION_MANAGER, events::DECREASE_LIQUIDITY, p.token_id, p.liquidity, a0, a1));
    Ok(abi::encode(&[Token::Uint(a0), Token::Uint(a1)]).into())
}

fn collect(state: &mut State, ctx: &mut Ctx, p: CollectParams) -> Result<Bytes, Revert> {
    let position = state.positions.get(&p.token_id).cloned().ok_or_else(|| "Invalid token ID".to_string())?;
    if position.owner != ctx.from {
        return Err("Not approved".into());
    }
    let a0 = position.owed0.min(p.amount0_max);
    let a1 = position.owed1.min(p.amount1_max);
    if let Some(entry) = state.positions.get_mut(&p.token_id) {
        entry.owed0 -= a0;
        entry.owed1 -= a1;
    }
    credit(state, position.token0, p.recipient, U256::from(a0));
    credit(state, position.token1, p.recipient, U256::from(a1));
    ctx.logs.push(logs::collect_log(POSITION_MANAGER, p.token_id, p.recipient, U256::from(a0), U256::from(a1)));
    Ok(abi::encode(&[uint(a0), uint(a1)]).into())
}

/// Builders for the position manager's receipt logs.
pub mod logs {
    use super::*;

    fn word(v: U256) -> H256 {
        let mut buf = [0u8; 32];
        v.to_big_endian(&mut buf);
        H256::from(buf)
    }

    pub fn nft_mint_log(manager: Address, owner: Address, token_id: U256) -> Log {
        Log {
            address: manager,
            topics: vec![events::topic(events::TRANSFER), H256::zero(), H256::from(owner), word(token_id)],
            ..Default::default()
        }
    }

    pub fn liquidity_log(manager: Address, signature: &str, token_id: U256, liquidity: u128, a0: U256, a1: U256) -> Log {
        Log {
            address: manager,
            topics: vec![events::topic(signature), word(token_id)],
            data: abi::encode(&[uint(liquidity), Token::Uint(a0), Token::Uint(a1)]).into(),
            ..Default::default()
        }
    }

    pub fn collect_log(manager: Address, token_id: U256, recipient: Address, a0: U256, a1: U256) -> Log {
        Log {
            address: manager,
            topics: vec![events::topic(events::COLLECT), word(token_id)],
            data: abi::encode(&[Token::Address(recipient), Token::Uint(a0), Token::Uint(a1)]).into(),
            ..Default::default()
        }
    }
}
