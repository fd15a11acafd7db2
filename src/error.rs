use ethers::abi::{self, ParamType, Token};
use ethers::providers::{JsonRpcError, MiddlewareError};
use ethers::types::{Address, Bytes, TxHash};
use thiserror::Error;

/// Selector of the Solidity `Error(string)` revert payload.
const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];

/// Normalized shape of a remote failure, decided once at the provider boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainErrorKind {
    Timeout,
    Transport,
    Rpc,
    Reverted,
    Rejected,
    Decode,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} error (code {code:?}): {message}")]
pub struct ChainError {
    pub kind: ChainErrorKind,
    pub code: Option<i64>,
    pub message: String,
    pub revert_data: Option<Bytes>,
}

impl ChainError {
    pub fn new(kind: ChainErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            revert_data: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ChainErrorKind::Timeout, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ChainErrorKind::Decode, message)
    }

    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self {
            kind: ChainErrorKind::Rpc,
            code: Some(code),
            message: message.into(),
            revert_data: None,
        }
    }

    /// Revert carrying an `Error(string)` payload, the way nodes report failed `eth_call`s.
    pub fn revert_with_reason(reason: &str) -> Self {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(abi::encode(&[Token::String(reason.to_string())]));
        Self {
            kind: ChainErrorKind::Reverted,
            code: Some(3),
            message: format!("execution reverted: {reason}"),
            revert_data: Some(Bytes::from(data)),
        }
    }

    pub fn from_json_rpc(resp: &JsonRpcError) -> Self {
        let lower = resp.message.to_lowercase();
        let revert_data = resp
            .data
            .as_ref()
            .and_then(|v| v.as_str())
            .and_then(|s| hex::decode(s.trim_start_matches("0x")).ok())
            .filter(|bytes| !bytes.is_empty())
            .map(Bytes::from);

        let kind = if resp.code == 4001 || is_rejection_text(&lower) {
            ChainErrorKind::Rejected
        } else if revert_data.is_some() || resp.code == 3 || lower.contains("execution reverted") {
            ChainErrorKind::Reverted
        } else {
            ChainErrorKind::Rpc
        };

        Self {
            kind,
            code: Some(resp.code),
            message: resp.message.clone(),
            revert_data,
        }
    }

    pub fn from_middleware<E: MiddlewareError>(err: E) -> Self {
        if let Some(resp) = err.as_error_response() {
            return Self::from_json_rpc(resp);
        }
        let message = err.to_string();
        let lower = message.to_lowercase();
        let kind = if lower.contains("timed out") || lower.contains("timeout") {
            ChainErrorKind::Timeout
        } else if is_rejection_text(&lower) {
            ChainErrorKind::Rejected
        } else {
            ChainErrorKind::Transport
        };
        Self::new(kind, message)
    }

    /// Human-readable revert reason, from the ABI payload or the node's message.
    pub fn revert_reason(&self) -> Option<String> {
        if let Some(data) = &self.revert_data {
            if let Some(reason) = decode_revert_reason(data) {
                return Some(reason);
            }
        }
        self.message
            .split_once("execution reverted: ")
            .map(|(_, reason)| reason.trim().to_string())
            .filter(|reason| !reason.is_empty())
    }
}

fn is_rejection_text(lower: &str) -> bool {
    lower.contains("user rejected") || lower.contains("user denied") || lower.contains("action_rejected")
}

pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    if data.len() < 4 || data[..4] != ERROR_STRING_SELECTOR {
        return None;
    }
    match abi::decode(&[ParamType::String], &data[4..]).ok()?.pop()? {
        Token::String(reason) => Some(reason),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("token {address:?} on chain {chain_id} could not be resolved")]
    UnresolvableToken { chain_id: u64, address: Address },

    #[error("invalid tick range [{lower}, {upper}]: {reason}")]
    InvalidRange { lower: i32, upper: i32, reason: String },

    #[error("insufficient approval or balance: {0}")]
    InsufficientApprovalOrBalance(String),

    #[error("pool {pool:?} could not be created: {reason}")]
    PoolCreationFailed { pool: Address, reason: String },

    #[error("slippage tolerance exceeded: {0}")]
    SlippageExceeded(String),

    #[error("request rejected by the signer")]
    UserRejected,

    #[error("node unavailable after {attempts} attempts: {last_error}")]
    NodeUnavailable { attempts: u32, last_error: ChainError },

    /// The transaction may or may not have landed. `hash` is `None` when the
    /// signer never answered with one.
    #[error(
        "outcome of transaction {} unknown; re-query state before acting again",
        .hash.map(|h| format!("{h:?}")).unwrap_or_else(|| "(not yet hashed)".into())
    )]
    UnknownOutcome { hash: Option<TxHash> },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("remote call failed: {0}")]
    Remote(ChainError),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Maps a non-retryable remote failure onto the caller-facing taxonomy.
    pub fn from_chain_failure(err: ChainError) -> Self {
        match err.kind {
            ChainErrorKind::Rejected => EngineError::UserRejected,
            ChainErrorKind::Reverted => {
                let reason = err.revert_reason().unwrap_or_else(|| err.message.clone());
                interpret_revert(reason)
            }
            ChainErrorKind::Decode => EngineError::Decode(err.message),
            _ => EngineError::Remote(err),
        }
    }

    /// The user has to change something (sign, fund, approve, fix input) before retrying.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            EngineError::UserRejected
                | EngineError::InsufficientApprovalOrBalance(_)
                | EngineError::InvalidRange { .. }
                | EngineError::InvalidParameter(_)
                | EngineError::SlippageExceeded(_)
                | EngineError::UnresolvableToken { .. }
        )
    }

    /// Infrastructure trouble: suggest waiting and re-querying.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::NodeUnavailable { .. } | EngineError::UnknownOutcome { .. })
    }
}

fn interpret_revert(reason: String) -> EngineError {
    let lower = reason.to_lowercase();
    if lower.contains("price slippage check") || lower.contains("too little received") {
        EngineError::SlippageExceeded(reason)
    } else if reason == "STF"
        || reason == "TF"
        || lower.contains("exceeds balance")
        || lower.contains("insufficient allowance")
        || lower.contains("exceeds allowance")
        || lower.contains("insufficient balance")
    {
        EngineError::InsufficientApprovalOrBalance(reason)
    } else {
        EngineError::Reverted(reason)
    }
}
