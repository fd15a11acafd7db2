use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use ethers::types::{Address, TxHash, U256};
use num_bigint::BigInt;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::math::tick_math::bigint_to_u256;

/// What a caller hands in: an address on a chain, or the chain's native coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenReference {
    pub chain_id: u64,
    pub address: Address,
    pub is_native: bool,
}

impl TokenReference {
    pub fn erc20(chain_id: u64, address: Address) -> Self {
        Self { chain_id, address, is_native: false }
    }

    pub fn native(chain_id: u64) -> Self {
        Self { chain_id, address: Address::zero(), is_native: true }
    }
}

/// Resolved token metadata. Identity is (chain_id, canonical address) only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDescriptor {
    pub chain_id: u64,
    /// Canonical address: the wrapped-token address for native coins.
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
    pub name: String,
    pub is_native: bool,
}

impl TokenDescriptor {
    pub fn same_token(&self, other: &TokenDescriptor) -> bool {
        self.chain_id == other.chain_id && self.address == other.address
    }
}

impl PartialEq for TokenDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.same_token(other)
    }
}

impl Eq for TokenDescriptor {}

impl Hash for TokenDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.chain_id.hash(state);
        self.address.hash(state);
    }
}

/// Fee tiers and their tick spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeeTier {
    /// 0.01%
    Lowest,
    /// 0.05%
    Low,
    /// 0.30%
    Medium,
    /// 1.00%
    High,
}

impl FeeTier {
    pub const ALL: [FeeTier; 4] = [FeeTier::Lowest, FeeTier::Low, FeeTier::Medium, FeeTier::High];

    /// Fee in hundredths of a basis point, as the factory encodes it (uint24).
    pub fn fee_pips(self) -> u32 {
        match self {
            FeeTier::Lowest => 100,
            FeeTier::Low => 500,
            FeeTier::Medium => 3_000,
            FeeTier::High => 10_000,
        }
    }

    pub fn tick_spacing(self) -> i32 {
        match self {
            FeeTier::Lowest => 1,
            FeeTier::Low => 10,
            FeeTier::Medium => 60,
            FeeTier::High => 200,
        }
    }

    pub fn from_pips(pips: u32) -> Option<FeeTier> {
        FeeTier::ALL.into_iter().find(|tier| tier.fee_pips() == pips)
    }
}

impl TryFrom<u32> for FeeTier {
    type Error = EngineError;

    fn try_from(pips: u32) -> Result<Self, Self::Error> {
        FeeTier::from_pips(pips).ok_or_else(|| EngineError::InvalidParameter(format!("unsupported fee tier {pips}")))
    }
}

impl fmt::Display for FeeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.fee_pips() / 10_000, (self.fee_pips() % 10_000) / 100)
    }
}

/// On-chain pool snapshot. `sqrt_price_x96 == 0` means the pool is not initialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolState {
    pub address: Address,
    pub token0: Address,
    pub token1: Address,
    pub fee: FeeTier,
    pub sqrt_price_x96: U256,
    pub tick: i32,
    pub liquidity: u128,
}

impl PoolState {
    pub fn is_initialized(&self) -> bool {
        !self.sqrt_price_x96.is_zero()
    }
}

/// Position as stored by the position manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub id: U256,
    pub token0: Address,
    pub token1: Address,
    pub fee: FeeTier,
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub liquidity: u128,
    pub tokens_owed0: u128,
    pub tokens_owed1: u128,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub hash: TxHash,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
    pub position_id: Option<U256>,
    pub liquidity: Option<u128>,
    pub amount0: U256,
    pub amount1: U256,
}

/// Which side of the sorted pair an amount refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSide {
    Zero,
    One,
}

/// A deposit amount, either already in base units or as a display-unit decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAmount {
    BaseUnits(U256),
    Decimal(Decimal),
}

impl TokenAmount {
    /// Scales to base units; fractional dust below one base unit is dropped.
    pub fn to_base_units(&self, decimals: u8) -> Result<U256, EngineError> {
        match self {
            TokenAmount::BaseUnits(v) => Ok(*v),
            TokenAmount::Decimal(d) => {
                if d.is_sign_negative() {
                    return Err(EngineError::InvalidParameter(format!("negative amount {d}")));
                }
                let scaled = BigInt::from(d.mantissa()) * num_traits::pow(BigInt::from(10u8), decimals as usize)
                    / num_traits::pow(BigInt::from(10u8), d.scale() as usize);
                bigint_to_u256(&scaled)
            }
        }
    }
}

impl FromStr for TokenAmount {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim())
            .map(TokenAmount::Decimal)
            .map_err(|e| EngineError::InvalidParameter(format!("invalid amount {s:?}: {e}")))
    }
}

impl From<U256> for TokenAmount {
    fn from(v: U256) -> Self {
        TokenAmount::BaseUnits(v)
    }
}

/// How the caller describes the price range of a new position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    FullRange,
    /// Ticks in sorted (token0/token1) orientation.
    Ticks { lower: i32, upper: i32 },
    /// Display prices quoted as token B per token A.
    Prices { lower: Decimal, upper: Decimal },
}

/// Per-operation overrides; `None` falls back to the engine defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Fraction in [0, 1), e.g. 0.005 for 0.5%.
    pub slippage: Option<Decimal>,
    /// Absolute unix timestamp.
    pub deadline: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MintRequest {
    pub token_a: TokenReference,
    pub token_b: TokenReference,
    pub fee: FeeTier,
    pub amount_a: TokenAmount,
    pub amount_b: TokenAmount,
    pub range: RangeSpec,
    /// Token B per token A, used only when the pool has to be created or initialized.
    pub initial_price: Option<Decimal>,
    pub recipient: Option<Address>,
    pub options: TxOptions,
}

/// Amounts to add to an existing position, in the position's token0/token1 order.
#[derive(Debug, Clone, Copy)]
pub struct PositionAmounts {
    pub amount0: TokenAmount,
    pub amount1: TokenAmount,
    /// Pay the wrapped-native side with native value instead of the ERC20.
    pub use_native: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_fee_tier_table() {
        assert_eq!(FeeTier::Medium.fee_pips(), 3000);
        assert_eq!(FeeTier::Medium.tick_spacing(), 60);
        assert_eq!(FeeTier::from_pips(500), Some(FeeTier::Low));
        assert_eq!(FeeTier::from_pips(2500), None);
        assert!(FeeTier::try_from(42u32).is_err());
        assert_eq!(FeeTier::Medium.to_string(), "0.30%");
        assert_eq!(FeeTier::Lowest.to_string(), "0.01%");
        assert_eq!(FeeTier::High.to_string(), "1.00%");
    }

    #[test]
    fn test_descriptor_identity_ignores_metadata() {
        let a = TokenDescriptor {
            chain_id: 1,
            address: Address::from([0x11; 20]),
            decimals: 18,
            symbol: "WETH".into(),
            name: "Wrapped Ether".into(),
            is_native: false,
        };
        let mut b = a.clone();
        b.symbol = "ETH".into();
        b.is_native = true;
        assert_eq!(a, b);

        let mut other_chain = a.clone();
        other_chain.chain_id = 10;
        assert_ne!(a, other_chain);
    }

    #[test]
    fn test_amount_scaling_truncates() {
        let amount: TokenAmount = "10".parse().unwrap();
        assert_eq!(amount.to_base_units(6).unwrap(), U256::from(10_000_000u64));

        let dust = TokenAmount::Decimal(dec!(1.2345678));
        assert_eq!(dust.to_base_units(6).unwrap(), U256::from(1_234_567u64));

        let raw = TokenAmount::from(U256::from(42u8));
        assert_eq!(raw.to_base_units(18).unwrap(), U256::from(42u8));

        assert!(TokenAmount::Decimal(dec!(-1)).to_base_units(6).is_err());
        assert!("abc".parse::<TokenAmount>().is_err());
    }

    #[test]
    fn test_pool_initialization_flag() {
        let mut pool = PoolState {
            address: Address::zero(),
            token0: Address::from([1; 20]),
            token1: Address::from([2; 20]),
            fee: FeeTier::Low,
            sqrt_price_x96: U256::zero(),
            tick: 0,
            liquidity: 0,
        };
        assert!(!pool.is_initialized());
        pool.sqrt_price_x96 = U256::one() << 96;
        assert!(pool.is_initialized());
    }
}
