//! Calldata encoders and return-data decoders for the factory, pool and
//! position manager, plus abigen bindings for ERC20.
//!
//! The position manager's entry points take struct arguments; they are
//! encoded here as ABI tuples so the exact on-chain signature is visible.

use ethers::abi::{self, ParamType, Token};
use ethers::contract::abigen;
use ethers::types::{Address, Bytes, I256, U256};
use ethers::utils::id;

use crate::error::ChainError;
use crate::models::{FeeTier, Position};

abigen!(
    Erc20,
    r#"[
        function decimals() external view returns (uint8)
        function symbol() external view returns (string)
        function name() external view returns (string)
        function balanceOf(address owner) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function approve(address spender, uint256 amount) external returns (bool)
    ]"#
);

pub const CREATE_POOL: &str = "createPool(address,address,uint24)";
pub const INITIALIZE: &str = "initialize(uint160)";
pub const SLOT0: &str = "slot0()";
pub const LIQUIDITY: &str = "liquidity()";
pub const TOKEN0: &str = "token0()";
pub const TOKEN1: &str = "token1()";
pub const POSITIONS: &str = "positions(uint256)";
pub const MINT: &str = "mint((address,address,uint24,int24,int24,uint256,uint256,uint256,uint256,address,uint256))";
pub const INCREASE_LIQUIDITY: &str = "increaseLiquidity((uint256,uint256,uint256,uint256,uint256,uint256))";
pub const DECREASE_LIQUIDITY: &str = "decreaseLiquidity((uint256,uint128,uint256,uint256,uint256))";
pub const COLLECT: &str = "collect((uint256,address,uint128,uint128))";
pub const MULTICALL: &str = "multicall(bytes[])";
pub const REFUND_ETH: &str = "refundETH()";

pub fn selector(signature: &str) -> [u8; 4] {
    id(signature)
}

pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

/// Decodes the arguments of `calldata` if it targets `signature`.
pub fn decode_call(signature: &str, types: &[ParamType], calldata: &[u8]) -> Result<Vec<Token>, ChainError> {
    if calldata.len() < 4 || calldata[..4] != selector(signature) {
        return Err(ChainError::decode(format!("calldata is not a {signature} call")));
    }
    abi::decode(types, &calldata[4..]).map_err(|e| ChainError::decode(format!("{signature} arguments: {e}")))
}

pub fn decode_output(what: &str, types: &[ParamType], data: &[u8]) -> Result<Vec<Token>, ChainError> {
    abi::decode(types, data).map_err(|e| ChainError::decode(format!("{what} output: {e}")))
}

// ---------------------------------------------------------------------------
// Token conversions

pub fn int24(tick: i32) -> Token {
    Token::Int(I256::from(tick).into_raw())
}

pub fn uint(v: impl Into<U256>) -> Token {
    Token::Uint(v.into())
}

pub fn take_address(token: Token) -> Result<Address, ChainError> {
    token.into_address().ok_or_else(|| ChainError::decode("expected address"))
}

pub fn take_uint(token: Token) -> Result<U256, ChainError> {
    token.into_uint().ok_or_else(|| ChainError::decode("expected uint"))
}

pub fn take_u128(token: Token) -> Result<u128, ChainError> {
    let v = take_uint(token)?;
    if v > U256::from(u128::MAX) {
        return Err(ChainError::decode(format!("{v} overflows uint128")));
    }
    Ok(v.low_u128())
}

pub fn take_int24(token: Token) -> Result<i32, ChainError> {
    let raw = token.into_int().ok_or_else(|| ChainError::decode("expected int"))?;
    let value = I256::from_raw(raw);
    let tick = value.low_i32();
    if I256::from(tick) != value || !(-(1 << 23)..(1 << 23)).contains(&tick) {
        return Err(ChainError::decode(format!("{value} overflows int24")));
    }
    Ok(tick)
}

pub fn take_fee(token: Token) -> Result<FeeTier, ChainError> {
    let pips = take_uint(token)?;
    if pips > U256::from(u32::MAX) {
        return Err(ChainError::decode(format!("fee {pips} overflows uint24")));
    }
    FeeTier::from_pips(pips.as_u32()).ok_or_else(|| ChainError::decode(format!("unknown fee tier {pips}")))
}

fn take_tuple(mut tokens: Vec<Token>, what: &str) -> Result<Vec<Token>, ChainError> {
    match tokens.pop() {
        Some(Token::Tuple(fields)) if tokens.is_empty() => Ok(fields),
        _ => Err(ChainError::decode(format!("{what}: expected a single tuple argument"))),
    }
}

/// Pulls exactly `N` tokens out of a decoded list, in order.
fn fields<const N: usize>(tokens: Vec<Token>, what: &str) -> Result<[Token; N], ChainError> {
    tokens
        .try_into()
        .map_err(|v: Vec<Token>| ChainError::decode(format!("{what}: expected {N} fields, got {}", v.len())))
}

// ---------------------------------------------------------------------------
// Factory and pool

pub fn create_pool(token0: Address, token1: Address, fee: FeeTier) -> Bytes {
    encode_call(CREATE_POOL, &[Token::Address(token0), Token::Address(token1), uint(fee.fee_pips())])
}

pub fn initialize(sqrt_price_x96: U256) -> Bytes {
    encode_call(INITIALIZE, &[Token::Uint(sqrt_price_x96)])
}

pub fn slot0() -> Bytes {
    encode_call(SLOT0, &[])
}

pub fn liquidity() -> Bytes {
    encode_call(LIQUIDITY, &[])
}

pub fn token0() -> Bytes {
    encode_call(TOKEN0, &[])
}

pub fn token1() -> Bytes {
    encode_call(TOKEN1, &[])
}

pub fn slot0_output_types() -> Vec<ParamType> {
    vec![
        ParamType::Uint(160),
        ParamType::Int(24),
        ParamType::Uint(16),
        ParamType::Uint(16),
        ParamType::Uint(16),
        ParamType::Uint(8),
        ParamType::Bool,
    ]
}

/// (sqrtPriceX96, tick) out of `slot0()`.
pub fn decode_slot0(data: &[u8]) -> Result<(U256, i32), ChainError> {
    let tokens = decode_output(SLOT0, &slot0_output_types(), data)?;
    let [sqrt, tick, _, _, _, _, _] = fields(tokens, SLOT0)?;
    Ok((take_uint(sqrt)?, take_int24(tick)?))
}

pub fn decode_u128(what: &str, data: &[u8]) -> Result<u128, ChainError> {
    let [value] = fields(decode_output(what, &[ParamType::Uint(128)], data)?, what)?;
    take_u128(value)
}

pub fn decode_address(what: &str, data: &[u8]) -> Result<Address, ChainError> {
    let [value] = fields(decode_output(what, &[ParamType::Address], data)?, what)?;
    take_address(value)
}

// ---------------------------------------------------------------------------
// Position manager

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintParams {
    pub token0: Address,
    pub token1: Address,
    pub fee: FeeTier,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub amount0_desired: U256,
    pub amount1_desired: U256,
    pub amount0_min: U256,
    pub amount1_min: U256,
    pub recipient: Address,
    pub deadline: U256,
}

fn mint_types() -> Vec<ParamType> {
    vec![ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(24),
        ParamType::Int(24),
        ParamType::Int(24),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Address,
        ParamType::Uint(256),
    ])]
}

impl MintParams {
    pub fn encode(&self) -> Bytes {
        encode_call(
            MINT,
            &[Token::Tuple(vec![
                Token::Address(self.token0),
                Token::Address(self.token1),
                uint(self.fee.fee_pips()),
                int24(self.tick_lower),
                int24(self.tick_upper),
                Token::Uint(self.amount0_desired),
                Token::Uint(self.amount1_desired),
                Token::Uint(self.amount0_min),
                Token::Uint(self.amount1_min),
                Token::Address(self.recipient),
                Token::Uint(self.deadline),
            ])],
        )
    }

    pub fn decode(calldata: &[u8]) -> Result<Self, ChainError> {
        let tuple = take_tuple(decode_call(MINT, &mint_types(), calldata)?, MINT)?;
        let [t0, t1, fee, lower, upper, a0, a1, m0, m1, recipient, deadline] = fields(tuple, MINT)?;
        Ok(Self {
            token0: take_address(t0)?,
            token1: take_address(t1)?,
            fee: take_fee(fee)?,
            tick_lower: take_int24(lower)?,
            tick_upper: take_int24(upper)?,
            amount0_desired: take_uint(a0)?,
            amount1_desired: take_uint(a1)?,
            amount0_min: take_uint(m0)?,
            amount1_min: take_uint(m1)?,
            recipient: take_address(recipient)?,
            deadline: take_uint(deadline)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncreaseLiquidityParams {
    pub token_id: U256,
    pub amount0_desired: U256,
    pub amount1_desired: U256,
    pub amount0_min: U256,
    pub amount1_min: U256,
    pub deadline: U256,
}

impl IncreaseLiquidityParams {
    pub fn encode(&self) -> Bytes {
        encode_call(
            INCREASE_LIQUIDITY,
            &[Token::Tuple(vec![
                Token::Uint(self.token_id),
                Token::Uint(self.amount0_desired),
                Token::Uint(self.amount1_desired),
                Token::Uint(self.amount0_min),
                Token::Uint(self.amount1_min),
                Token::Uint(self.deadline),
            ])],
        )
    }

    pub fn decode(calldata: &[u8]) -> Result<Self, ChainError> {
        let types = vec![ParamType::Tuple(vec![ParamType::Uint(256); 6])];
        let tuple = take_tuple(decode_call(INCREASE_LIQUIDITY, &types, calldata)?, INCREASE_LIQUIDITY)?;
        let [id, a0, a1, m0, m1, deadline] = fields(tuple, INCREASE_LIQUIDITY)?;
        Ok(Self {
            token_id: take_uint(id)?,
            amount0_desired: take_uint(a0)?,
            amount1_desired: take_uint(a1)?,
            amount0_min: take_uint(m0)?,
            amount1_min: take_uint(m1)?,
            deadline: take_uint(deadline)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecreaseLiquidityParams {
    pub token_id: U256,
    pub liquidity: u128,
    pub amount0_min: U256,
    pub amount1_min: U256,
    pub deadline: U256,
}

impl DecreaseLiquidityParams {
    pub fn encode(&self) -> Bytes {
        encode_call(
            DECREASE_LIQUIDITY,
            &[Token::Tuple(vec![
                Token::Uint(self.token_id),
                uint(self.liquidity),
                Token::Uint(self.amount0_min),
                Token::Uint(self.amount1_min),
                Token::Uint(self.deadline),
            ])],
        )
    }

    pub fn decode(calldata: &[u8]) -> Result<Self, ChainError> {
        let types = vec![ParamType::Tuple(vec![
            ParamType::Uint(256),
            ParamType::Uint(128),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
        ])];
        let tuple = take_tuple(decode_call(DECREASE_LIQUIDITY, &types, calldata)?, DECREASE_LIQUIDITY)?;
        let [id, liquidity, m0, m1, deadline] = fields(tuple, DECREASE_LIQUIDITY)?;
        Ok(Self {
            token_id: take_uint(id)?,
            liquidity: take_u128(liquidity)?,
            amount0_min: take_uint(m0)?,
            amount1_min: take_uint(m1)?,
            deadline: take_uint(deadline)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectParams {
    pub token_id: U256,
    pub recipient: Address,
    pub amount0_max: u128,
    pub amount1_max: u128,
}

impl CollectParams {
    /// Collects everything owed.
    pub fn all(token_id: U256, recipient: Address) -> Self {
        Self { token_id, recipient, amount0_max: u128::MAX, amount1_max: u128::MAX }
    }

    pub fn encode(&self) -> Bytes {
        encode_call(
            COLLECT,
            &[Token::Tuple(vec![
                Token::Uint(self.token_id),
                Token::Address(self.recipient),
                uint(self.amount0_max),
                uint(self.amount1_max),
            ])],
        )
    }

    pub fn decode(calldata: &[u8]) -> Result<Self, ChainError> {
        let types = vec![ParamType::Tuple(vec![
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::Uint(128),
            ParamType::Uint(128),
        ])];
        let tuple = take_tuple(decode_call(COLLECT, &types, calldata)?, COLLECT)?;
        let [id, recipient, max0, max1] = fields(tuple, COLLECT)?;
        Ok(Self {
            token_id: take_uint(id)?,
            recipient: take_address(recipient)?,
            amount0_max: take_u128(max0)?,
            amount1_max: take_u128(max1)?,
        })
    }
}

pub fn positions(token_id: U256) -> Bytes {
    encode_call(POSITIONS, &[Token::Uint(token_id)])
}

pub fn positions_output_types() -> Vec<ParamType> {
    vec![
        ParamType::Uint(96),
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(24),
        ParamType::Int(24),
        ParamType::Int(24),
        ParamType::Uint(128),
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(128),
        ParamType::Uint(128),
    ]
}

pub fn decode_position(id: U256, data: &[u8]) -> Result<Position, ChainError> {
    let tokens = decode_output(POSITIONS, &positions_output_types(), data)?;
    let [_nonce, _operator, token0, token1, fee, lower, upper, liquidity, _fg0, _fg1, owed0, owed1] =
        fields(tokens, POSITIONS)?;
    Ok(Position {
        id,
        token0: take_address(token0)?,
        token1: take_address(token1)?,
        fee: take_fee(fee)?,
        tick_lower: take_int24(lower)?,
        tick_upper: take_int24(upper)?,
        liquidity: take_u128(liquidity)?,
        tokens_owed0: take_u128(owed0)?,
        tokens_owed1: take_u128(owed1)?,
    })
}

/// Wraps several position-manager calls into one `multicall(bytes[])`.
pub fn multicall(calls: Vec<Bytes>) -> Bytes {
    encode_call(
        MULTICALL,
        &[Token::Array(calls.into_iter().map(|c| Token::Bytes(c.to_vec())).collect())],
    )
}

pub fn decode_multicall(calldata: &[u8]) -> Result<Vec<Bytes>, ChainError> {
    let types = [ParamType::Array(Box::new(ParamType::Bytes))];
    let [calls] = fields(decode_call(MULTICALL, &types, calldata)?, MULTICALL)?;
    calls
        .into_array()
        .ok_or_else(|| ChainError::decode("multicall: expected bytes[]"))?
        .into_iter()
        .map(|c| c.into_bytes().map(Bytes::from).ok_or_else(|| ChainError::decode("multicall: expected bytes")))
        .collect()
}

pub fn refund_eth() -> Bytes {
    encode_call(REFUND_ETH, &[])
}

// ---------------------------------------------------------------------------
// ERC20 helpers that go through the generated call structs

pub fn erc20_decimals() -> Bytes {
    ethers::abi::AbiEncode::encode(DecimalsCall).into()
}

pub fn erc20_symbol() -> Bytes {
    ethers::abi::AbiEncode::encode(SymbolCall).into()
}

pub fn erc20_name() -> Bytes {
    ethers::abi::AbiEncode::encode(NameCall).into()
}

pub fn erc20_balance_of(owner: Address) -> Bytes {
    ethers::abi::AbiEncode::encode(BalanceOfCall { owner }).into()
}

pub fn erc20_allowance(owner: Address, spender: Address) -> Bytes {
    ethers::abi::AbiEncode::encode(AllowanceCall { owner, spender }).into()
}

pub fn erc20_approve(spender: Address, amount: U256) -> Bytes {
    ethers::abi::AbiEncode::encode(ApproveCall { spender, amount }).into()
}

pub fn decode_uint(what: &str, data: &[u8]) -> Result<U256, ChainError> {
    let [value] = fields(decode_output(what, &[ParamType::Uint(256)], data)?, what)?;
    take_uint(value)
}

pub fn decode_decimals(data: &[u8]) -> Result<u8, ChainError> {
    let value = decode_uint("decimals()", data)?;
    if value > U256::from(u8::MAX) {
        return Err(ChainError::decode(format!("decimals {value} overflows uint8")));
    }
    Ok(value.low_u32() as u8)
}

/// `string` return, or a NUL-padded `bytes32` for legacy tokens.
pub fn decode_text(what: &str, data: &[u8]) -> Result<String, ChainError> {
    if let Ok(tokens) = abi::decode(&[ParamType::String], data) {
        if let Some(Token::String(s)) = tokens.into_iter().next() {
            return Ok(s.trim().to_string());
        }
    }
    if data.len() == 32 {
        let end = data.iter().position(|b| *b == 0).unwrap_or(32);
        if let Ok(s) = std::str::from_utf8(&data[..end]) {
            return Ok(s.trim().to_string());
        }
    }
    Err(ChainError::decode(format!("{what} returned neither string nor bytes32")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_selectors() {
        assert_eq!(hex::encode(selector(CREATE_POOL)), "a1671295");
        assert_eq!(hex::encode(selector(SLOT0)), "3850c7bd");
        assert_eq!(hex::encode(selector(MINT)), "88316456");
        assert_eq!(hex::encode(selector(INCREASE_LIQUIDITY)), "219f5d17");
        assert_eq!(hex::encode(selector(DECREASE_LIQUIDITY)), "0c49ccbe");
        assert_eq!(hex::encode(selector(COLLECT)), "fc6f7865");
        assert_eq!(hex::encode(selector(MULTICALL)), "ac9650d8");
        assert_eq!(hex::encode(selector(REFUND_ETH)), "12210e8a");
        assert_eq!(hex::encode(&erc20_approve(Address::zero(), U256::zero())[..4]), "095ea7b3");
    }

    #[test]
    fn test_negative_ticks_are_sign_extended() {
        let params = MintParams {
            token0: Address::from([1; 20]),
            token1: Address::from([2; 20]),
            fee: FeeTier::Medium,
            tick_lower: -887_220,
            tick_upper: 887_220,
            amount0_desired: U256::from(10u64),
            amount1_desired: U256::from(20u64),
            amount0_min: U256::zero(),
            amount1_min: U256::zero(),
            recipient: Address::from([3; 20]),
            deadline: U256::from(1_700_000_000u64),
        };
        let data = params.encode();
        // tick_lower is the fourth word after the selector
        let word = &data[4 + 3 * 32..4 + 4 * 32];
        assert!(word[..29].iter().all(|b| *b == 0xff));
        assert_eq!(MintParams::decode(&data).unwrap(), params);
    }

    #[test]
    fn test_int24_overflow_rejected() {
        assert!(take_int24(Token::Int(I256::from(1 << 23).into_raw())).is_err());
        assert_eq!(take_int24(int24(-(1 << 23))).unwrap(), -(1 << 23));
    }

    #[test]
    fn test_slot0_decoding() {
        let data = abi::encode(&[
            Token::Uint(U256::one() << 96),
            int24(-60),
            uint(0u8),
            uint(1u8),
            uint(1u8),
            uint(0u8),
            Token::Bool(true),
        ]);
        assert_eq!(decode_slot0(&data).unwrap(), (U256::one() << 96, -60));
        assert!(decode_slot0(&data[..64]).is_err());
    }

    #[test]
    fn test_multicall_wraps_calls_in_order() {
        let inner = vec![CollectParams::all(U256::from(7u8), Address::zero()).encode(), refund_eth()];
        let decoded = decode_multicall(&multicall(inner.clone())).unwrap();
        assert_eq!(decoded, inner);
    }

    #[test]
    fn test_symbol_decoding_falls_back_to_bytes32() {
        let as_string = abi::encode(&[Token::String("USDC".into())]);
        assert_eq!(decode_text("symbol()", &as_string).unwrap(), "USDC");

        let mut as_bytes32 = [0u8; 32];
        as_bytes32[..3].copy_from_slice(b"MKR");
        assert_eq!(decode_text("symbol()", &as_bytes32).unwrap(), "MKR");

        assert!(decode_text("symbol()", &[0xff; 7]).is_err());
    }
}
