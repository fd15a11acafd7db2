//! Receipt log decoding: a table of decoders keyed by event signature, each
//! producing a typed partial; partials are merged per transaction.

use ethers::abi::{self, ParamType};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;

use crate::chain::contracts::{take_address, take_u128, take_uint};
use crate::error::ChainError;

pub const TRANSFER: &str = "Transfer(address,address,uint256)";
pub const INCREASE_LIQUIDITY: &str = "IncreaseLiquidity(uint256,uint128,uint256,uint256)";
pub const DECREASE_LIQUIDITY: &str = "DecreaseLiquidity(uint256,uint128,uint256,uint256)";
pub const COLLECT: &str = "Collect(uint256,address,uint256,uint256)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    PositionMinted,
    LiquidityIncreased,
    LiquidityDecreased,
    FeesCollected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPartial {
    PositionMinted { token_id: U256, owner: Address },
    LiquidityIncreased { token_id: U256, liquidity: u128, amount0: U256, amount1: U256 },
    LiquidityDecreased { token_id: U256, liquidity: u128, amount0: U256, amount1: U256 },
    FeesCollected { token_id: U256, recipient: Address, amount0: U256, amount1: U256 },
}

impl EventPartial {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPartial::PositionMinted { .. } => EventKind::PositionMinted,
            EventPartial::LiquidityIncreased { .. } => EventKind::LiquidityIncreased,
            EventPartial::LiquidityDecreased { .. } => EventKind::LiquidityDecreased,
            EventPartial::FeesCollected { .. } => EventKind::FeesCollected,
        }
    }
}

type DecodeFn = fn(&Log) -> Result<Option<EventPartial>, ChainError>;

pub struct EventDecoder {
    pub topic0: H256,
    pub decode: DecodeFn,
}

pub fn topic(signature: &str) -> H256 {
    H256::from(keccak256(signature))
}

pub fn decoders() -> [EventDecoder; 4] {
    [
        EventDecoder { topic0: topic(TRANSFER), decode: decode_transfer },
        EventDecoder { topic0: topic(INCREASE_LIQUIDITY), decode: decode_increase },
        EventDecoder { topic0: topic(DECREASE_LIQUIDITY), decode: decode_decrease },
        EventDecoder { topic0: topic(COLLECT), decode: decode_collect },
    ]
}

fn topic_address(t: &H256) -> Address {
    Address::from_slice(&t.as_bytes()[12..])
}

fn topic_uint(t: &H256) -> U256 {
    U256::from_big_endian(t.as_bytes())
}

fn indexed_token_id(log: &Log) -> Result<U256, ChainError> {
    log.topics
        .get(1)
        .map(topic_uint)
        .ok_or_else(|| ChainError::decode("missing indexed tokenId"))
}

// ERC721 mint: Transfer(from = 0, to, tokenId) with all three arguments indexed.
// ERC20 transfers carry the amount in data (three topics) and are skipped.
fn decode_transfer(log: &Log) -> Result<Option<EventPartial>, ChainError> {
    if log.topics.len() != 4 {
        return Ok(None);
    }
    if topic_address(&log.topics[1]) != Address::zero() {
        return Ok(None);
    }
    Ok(Some(EventPartial::PositionMinted {
        owner: topic_address(&log.topics[2]),
        token_id: topic_uint(&log.topics[3]),
    }))
}

fn liquidity_change(log: &Log) -> Result<(U256, u128, U256, U256), ChainError> {
    let token_id = indexed_token_id(log)?;
    let mut data = abi::decode(&[ParamType::Uint(128), ParamType::Uint(256), ParamType::Uint(256)], &log.data)
        .map_err(|e| ChainError::decode(format!("liquidity event data: {e}")))?
        .into_iter();
    let mut next = || data.next().ok_or_else(|| ChainError::decode("liquidity event data too short"));
    let liquidity = take_u128(next()?)?;
    let amount0 = take_uint(next()?)?;
    let amount1 = take_uint(next()?)?;
    Ok((token_id, liquidity, amount0, amount1))
}

fn decode_increase(log: &Log) -> Result<Option<EventPartial>, ChainError> {
    let (token_id, liquidity, amount0, amount1) = liquidity_change(log)?;
    Ok(Some(EventPartial::LiquidityIncreased { token_id, liquidity, amount0, amount1 }))
}

fn decode_decrease(log: &Log) -> Result<Option<EventPartial>, ChainError> {
    let (token_id, liquidity, amount0, amount1) = liquidity_change(log)?;
    Ok(Some(EventPartial::LiquidityDecreased { token_id, liquidity, amount0, amount1 }))
}

fn decode_collect(log: &Log) -> Result<Option<EventPartial>, ChainError> {
    let token_id = indexed_token_id(log)?;
    let mut data = abi::decode(&[ParamType::Address, ParamType::Uint(256), ParamType::Uint(256)], &log.data)
        .map_err(|e| ChainError::decode(format!("Collect data: {e}")))?
        .into_iter();
    let mut next = || data.next().ok_or_else(|| ChainError::decode("Collect data too short"));
    let recipient = take_address(next()?)?;
    let amount0 = take_uint(next()?)?;
    let amount1 = take_uint(next()?)?;
    Ok(Some(EventPartial::FeesCollected { token_id, recipient, amount0, amount1 }))
}

/// Decodes every log emitted by `emitter` whose kind is in `wanted`.
/// Malformed logs are skipped with a warning.
pub fn decode_logs(logs: &[Log], emitter: Address, wanted: &[EventKind]) -> Vec<EventPartial> {
    let table = decoders();
    let mut partials = Vec::new();
    for log in logs.iter().filter(|l| l.address == emitter) {
        let Some(topic0) = log.topics.first() else { continue };
        let Some(decoder) = table.iter().find(|d| d.topic0 == *topic0) else { continue };
        match (decoder.decode)(log) {
            Ok(Some(partial)) if wanted.contains(&partial.kind()) => partials.push(partial),
            Ok(_) => {}
            Err(err) => log::warn!("skipping undecodable log {topic0:?} from {emitter:?}: {err}"),
        }
    }
    partials
}

/// What a transaction's logs say about the position it touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedOutcome {
    pub position_id: Option<U256>,
    pub owner: Option<Address>,
    pub liquidity: Option<u128>,
    pub amount0: Option<U256>,
    pub amount1: Option<U256>,
}

impl DecodedOutcome {
    /// Merges partials in log order; the first value seen for each field wins.
    pub fn merge(partials: &[EventPartial]) -> Self {
        let mut out = DecodedOutcome::default();
        for partial in partials {
            match partial {
                EventPartial::PositionMinted { token_id, owner } => {
                    out.position_id.get_or_insert(*token_id);
                    out.owner.get_or_insert(*owner);
                }
                EventPartial::LiquidityIncreased { token_id, liquidity, amount0, amount1 }
                | EventPartial::LiquidityDecreased { token_id, liquidity, amount0, amount1 } => {
                    out.position_id.get_or_insert(*token_id);
                    out.liquidity.get_or_insert(*liquidity);
                    out.amount0.get_or_insert(*amount0);
                    out.amount1.get_or_insert(*amount1);
                }
                EventPartial::FeesCollected { token_id, recipient, amount0, amount1 } => {
                    out.position_id.get_or_insert(*token_id);
                    out.owner.get_or_insert(*recipient);
                    out.amount0.get_or_insert(*amount0);
                    out.amount1.get_or_insert(*amount1);
                }
            }
        }
        out
    }

    pub fn from_logs(logs: &[Log], emitter: Address, wanted: &[EventKind]) -> Self {
        Self::merge(&decode_logs(logs, emitter, wanted))
    }
}
