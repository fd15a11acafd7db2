use std::sync::Arc;

use ethers::abi::{self, Token};
use ethers::types::{Address, H256, U256};
use ethers::utils::{get_create2_address_from_hash, keccak256};

use crate::chain::contracts;
use crate::chain::ledger::CallRequest;
use crate::chain::resilience::ResilientLedger;
use crate::chain::submit::TransactionSubmitter;
use crate::error::EngineError;
use crate::models::{FeeTier, PoolState};

/// Address-sorted pair. Identical tokens cannot form a pool.
pub fn sort_tokens(a: Address, b: Address) -> Result<(Address, Address), EngineError> {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => Ok((a, b)),
        std::cmp::Ordering::Greater => Ok((b, a)),
        std::cmp::Ordering::Equal => Err(EngineError::InvalidParameter(format!("pool needs two distinct tokens, got {a:?} twice"))),
    }
}

/// CREATE2 address of the pool for (tokenA, tokenB, fee); argument order does not matter.
pub fn compute_pool_address(
    factory: Address,
    init_code_hash: H256,
    token_a: Address,
    token_b: Address,
    fee: FeeTier,
) -> Result<Address, EngineError> {
    let (token0, token1) = sort_tokens(token_a, token_b)?;
    let salt = keccak256(abi::encode(&[
        Token::Address(token0),
        Token::Address(token1),
        Token::Uint(U256::from(fee.fee_pips())),
    ]));
    Ok(get_create2_address_from_hash(factory, salt, init_code_hash))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolStatus {
    Missing,
    Uninitialized,
    Initialized(PoolState),
}

pub struct PoolLocator {
    ledger: Arc<ResilientLedger>,
    factory: Address,
    init_code_hash: H256,
}

impl PoolLocator {
    pub fn new(ledger: Arc<ResilientLedger>, factory: Address, init_code_hash: H256) -> Self {
        Self { ledger, factory, init_code_hash }
    }

    pub fn factory(&self) -> Address {
        self.factory
    }

    pub fn locate(&self, token_a: Address, token_b: Address, fee: FeeTier) -> Result<Address, EngineError> {
        compute_pool_address(self.factory, self.init_code_hash, token_a, token_b, fee)
    }

    pub async fn status(&self, token_a: Address, token_b: Address, fee: FeeTier) -> Result<PoolStatus, EngineError> {
        let (token0, token1) = sort_tokens(token_a, token_b)?;
        let pool = self.locate(token0, token1, fee)?;

        let code = self.ledger.code_at(pool).await?;
        if code.is_empty() {
            return Ok(PoolStatus::Missing);
        }

        let slot0_req = CallRequest::new(pool, contracts::slot0());
        let liquidity_req = CallRequest::new(pool, contracts::liquidity());
        let token0_req = CallRequest::new(pool, contracts::token0());
        let token1_req = CallRequest::new(pool, contracts::token1());
        let (slot0, liquidity, onchain0, onchain1) = tokio::try_join!(
            self.ledger.call(&slot0_req),
            self.ledger.call(&liquidity_req),
            self.ledger.call(&token0_req),
            self.ledger.call(&token1_req),
        )?;

        let decode = EngineError::from_chain_failure;
        let onchain0 = contracts::decode_address(contracts::TOKEN0, &onchain0).map_err(decode)?;
        let onchain1 = contracts::decode_address(contracts::TOKEN1, &onchain1).map_err(decode)?;
        if (onchain0, onchain1) != (token0, token1) {
            return Err(EngineError::Config(format!(
                "contract at {pool:?} holds ({onchain0:?}, {onchain1:?}), not the requested pair; check the pool init code hash"
            )));
        }

        let (sqrt_price_x96, tick) = contracts::decode_slot0(&slot0).map_err(decode)?;
        if sqrt_price_x96.is_zero() {
            return Ok(PoolStatus::Uninitialized);
        }
        let liquidity = contracts::decode_u128(contracts::LIQUIDITY, &liquidity).map_err(decode)?;
        Ok(PoolStatus::Initialized(PoolState {
            address: pool,
            token0,
            token1,
            fee,
            sqrt_price_x96,
            tick,
            liquidity,
        }))
    }

    /// `None` when the pool does not exist or has no price yet.
    pub async fn get_state(&self, token_a: Address, token_b: Address, fee: FeeTier) -> Result<Option<PoolState>, EngineError> {
        Ok(match self.status(token_a, token_b, fee).await? {
            PoolStatus::Initialized(state) => Some(state),
            _ => None,
        })
    }

    /// Returns the initialized pool, creating and/or initializing it at `sqrt_price_x96` first if needed.
    /// An already-initialized pool is returned unchanged, whatever its price.
    pub async fn ensure_pool(
        &self,
        submitter: &mut TransactionSubmitter,
        token_a: Address,
        token_b: Address,
        fee: FeeTier,
        sqrt_price_x96: U256,
    ) -> Result<PoolState, EngineError> {
        let (token0, token1) = sort_tokens(token_a, token_b)?;
        let pool = self.locate(token0, token1, fee)?;

        let mut status = self.status(token0, token1, fee).await?;
        if status == PoolStatus::Missing {
            log::info!("creating pool {pool:?} ({token0:?}/{token1:?} {fee})");
            let create = CallRequest::new(self.factory, contracts::create_pool(token0, token1, fee));
            status = match submitter.execute(create, "createPool").await {
                Ok(_) => self.status(token0, token1, fee).await?,
                Err(err) => self.recover(pool, token0, token1, fee, err, true).await?,
            };
        }

        if status == PoolStatus::Uninitialized {
            log::info!("initializing pool {pool:?} at sqrtPriceX96 {sqrt_price_x96}");
            let init = CallRequest::new(pool, contracts::initialize(sqrt_price_x96));
            status = match submitter.execute(init, "initialize").await {
                Ok(_) => self.status(token0, token1, fee).await?,
                Err(err) => self.recover(pool, token0, token1, fee, err, false).await?,
            };
        }

        match status {
            PoolStatus::Initialized(state) => {
                if state.sqrt_price_x96 != sqrt_price_x96 {
                    log::debug!("pool {pool:?} priced at {} (requested {sqrt_price_x96})", state.sqrt_price_x96);
                }
                Ok(state)
            }
            other => Err(EngineError::PoolCreationFailed {
                pool,
                reason: format!("pool is {other:?} after confirmed create/initialize"),
            }),
        }
    }

    // A failed create/initialize may just mean someone else got there first:
    // re-read and carry on from whatever state the pool is really in.
    async fn recover(
        &self,
        pool: Address,
        token0: Address,
        token1: Address,
        fee: FeeTier,
        err: EngineError,
        creating: bool,
    ) -> Result<PoolStatus, EngineError> {
        if matches!(err, EngineError::UserRejected) {
            return Err(err);
        }
        let status = self.status(token0, token1, fee).await?;
        match status {
            PoolStatus::Initialized(_) => {
                log::warn!("pool {pool:?} transaction failed ({err}) but the pool is initialized; continuing");
                Ok(status)
            }
            PoolStatus::Uninitialized if creating => {
                log::warn!("pool {pool:?} creation failed ({err}) but the pool exists; continuing");
                Ok(status)
            }
            _ if matches!(err, EngineError::UnknownOutcome { .. }) => Err(err),
            _ => Err(EngineError::PoolCreationFailed { pool, reason: err.to_string() }),
        }
    }
}
