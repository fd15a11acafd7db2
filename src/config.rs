use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ethers::types::{Address, H256};
use rust_decimal::Decimal;

use crate::chain::resilience::RetryPolicy;
use crate::chain::submit::ConfirmationPolicy;
use crate::error::EngineError;

pub const DEFAULT_FACTORY: &str = "0x1F98431c8aD98523631AE4a59f267346ea31F984";
pub const DEFAULT_POSITION_MANAGER: &str = "0xC36442b4a4522E871399CD717aBDD847Ab11FE88";
pub const DEFAULT_POOL_INIT_CODE_HASH: &str = "0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54";

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub fallback_rpc_urls: Vec<String>,
    pub chain_id: u64,

    // Protocol addresses
    pub factory: Address,
    pub position_manager: Address,
    pub pool_init_code_hash: H256,
    /// Overrides the token table's wrapped-native entry for `chain_id`.
    pub wrapped_native: Option<Address>,
    pub fallback_tokens_path: Option<PathBuf>,

    // Resilience
    pub retry: RetryPolicy,
    pub confirmation: ConfirmationPolicy,

    // Per-operation defaults
    pub default_slippage: Decimal,
    pub default_deadline: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, EngineError> {
        // Load configuration files (secrets first, then public config)
        dotenv::from_filename("secrets.env").ok();
        dotenv::from_filename("config/addresses.env").ok();
        dotenv::dotenv().ok();

        let config = Self::from_lookup(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from any key/value source; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let rpc_url = get("RPC_URL").ok_or_else(|| EngineError::Config("RPC_URL must be set".into()))?;
        let fallback_rpc_urls = get("RPC_FALLBACK_URLS")
            .map(|raw| raw.split(',').map(str::trim).filter(|u| !u.is_empty()).map(String::from).collect())
            .unwrap_or_default();

        let retry = RetryPolicy {
            max_attempts: typed("RETRY_MAX_ATTEMPTS", &or("RETRY_MAX_ATTEMPTS", "3"))?,
            base_backoff: Duration::from_millis(typed("RETRY_BASE_BACKOFF_MS", &or("RETRY_BASE_BACKOFF_MS", "500"))?),
            multiplier: typed("RETRY_BACKOFF_MULTIPLIER", &or("RETRY_BACKOFF_MULTIPLIER", "2.0"))?,
            max_backoff: Duration::from_millis(typed("RETRY_MAX_BACKOFF_MS", &or("RETRY_MAX_BACKOFF_MS", "8000"))?),
            call_timeout: Duration::from_secs(typed("RPC_TIMEOUT_SECS", &or("RPC_TIMEOUT_SECS", "15"))?),
        };
        let confirmation = ConfirmationPolicy {
            timeout: Duration::from_secs(typed("CONFIRMATION_TIMEOUT_SECS", &or("CONFIRMATION_TIMEOUT_SECS", "180"))?),
            poll_interval: Duration::from_millis(typed("CONFIRMATION_POLL_MS", &or("CONFIRMATION_POLL_MS", "2000"))?),
            send_timeout: Duration::from_secs(typed("SIGNER_TIMEOUT_SECS", &or("SIGNER_TIMEOUT_SECS", "300"))?),
        };

        Ok(Config {
            rpc_url,
            fallback_rpc_urls,
            chain_id: typed("CHAIN_ID", &or("CHAIN_ID", "1"))?,

            factory: typed("UNISWAP_V3_FACTORY", &or("UNISWAP_V3_FACTORY", DEFAULT_FACTORY))?,
            position_manager: typed(
                "UNISWAP_V3_POSITION_MANAGER",
                &or("UNISWAP_V3_POSITION_MANAGER", DEFAULT_POSITION_MANAGER),
            )?,
            pool_init_code_hash: typed("POOL_INIT_CODE_HASH", &or("POOL_INIT_CODE_HASH", DEFAULT_POOL_INIT_CODE_HASH))?,
            wrapped_native: get("WRAPPED_NATIVE_ADDRESS").map(|v| typed("WRAPPED_NATIVE_ADDRESS", &v)).transpose()?,
            fallback_tokens_path: get("FALLBACK_TOKENS_PATH").map(PathBuf::from),

            retry,
            confirmation,

            default_slippage: typed("DEFAULT_SLIPPAGE", &or("DEFAULT_SLIPPAGE", "0.005"))?,
            default_deadline: Duration::from_secs(typed("DEFAULT_DEADLINE_SECS", &or("DEFAULT_DEADLINE_SECS", "1200"))?),
        })
    }

    /// Every RPC endpoint in priority order.
    pub fn rpc_urls(&self) -> Vec<String> {
        std::iter::once(self.rpc_url.clone()).chain(self.fallback_rpc_urls.iter().cloned()).collect()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for raw in self.rpc_urls() {
            let parsed = url::Url::parse(&raw).map_err(|e| EngineError::Config(format!("invalid RPC URL {raw:?}: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(EngineError::Config(format!("RPC URL {raw:?} must use http or https")));
            }
        }
        if self.default_slippage.is_sign_negative() || self.default_slippage >= Decimal::ONE {
            return Err(EngineError::Config(format!("DEFAULT_SLIPPAGE {} must be in [0, 1)", self.default_slippage)));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("RETRY_MAX_ATTEMPTS must be at least 1".into()));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(EngineError::Config(format!("RETRY_BACKOFF_MULTIPLIER {} must be >= 1", self.retry.multiplier)));
        }
        if self.retry.call_timeout.is_zero() || self.confirmation.timeout.is_zero() || self.confirmation.send_timeout.is_zero()
        {
            return Err(EngineError::Config("timeouts must be positive".into()));
        }
        if self.default_deadline.is_zero() {
            return Err(EngineError::Config("DEFAULT_DEADLINE_SECS must be positive".into()));
        }
        Ok(())
    }
}

fn typed<T>(key: &str, raw: &str) -> Result<T, EngineError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| EngineError::Config(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, EngineError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_apply() {
        let config = config(&[("RPC_URL", "https://eth.example.org")]).unwrap();
        assert_eq!(config.chain_id, 1);
        assert_eq!(config.factory, DEFAULT_FACTORY.parse::<Address>().unwrap());
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.confirmation, ConfirmationPolicy::default());
        assert_eq!(config.default_slippage, Decimal::new(5, 3));
        assert_eq!(config.default_deadline, Duration::from_secs(1200));
        assert!(config.wrapped_native.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rpc_url_is_required() {
        assert!(matches!(config(&[]), Err(EngineError::Config(_))));
        assert!(matches!(config(&[("RPC_URL", "  ")]), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_fallback_urls_keep_priority_order() {
        let config = config(&[
            ("RPC_URL", "https://primary.example.org"),
            ("RPC_FALLBACK_URLS", "https://a.example.org, ,https://b.example.org"),
        ])
        .unwrap();
        assert_eq!(
            config.rpc_urls(),
            vec!["https://primary.example.org", "https://a.example.org", "https://b.example.org"]
        );
    }

    #[test]
    fn test_malformed_values_are_reported_by_key() {
        match config(&[("RPC_URL", "https://x.example.org"), ("CHAIN_ID", "mainnet")]) {
            Err(EngineError::Config(msg)) => assert!(msg.contains("CHAIN_ID"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validation() {
        let bad_url = config(&[("RPC_URL", "not a url")]).unwrap();
        assert!(bad_url.validate().is_err());

        let ws = config(&[("RPC_URL", "wss://x.example.org")]).unwrap();
        assert!(ws.validate().is_err());

        let slippage = config(&[("RPC_URL", "https://x.example.org"), ("DEFAULT_SLIPPAGE", "1.5")]).unwrap();
        assert!(slippage.validate().is_err());

        let attempts = config(&[("RPC_URL", "https://x.example.org"), ("RETRY_MAX_ATTEMPTS", "0")]).unwrap();
        assert!(attempts.validate().is_err());

        let signer = config(&[("RPC_URL", "https://x.example.org"), ("SIGNER_TIMEOUT_SECS", "0")]).unwrap();
        assert!(signer.validate().is_err());
    }

    #[test]
    fn test_signer_timeout_is_separate_from_rpc_timeout() {
        let config = config(&[
            ("RPC_URL", "https://x.example.org"),
            ("RPC_TIMEOUT_SECS", "5"),
            ("SIGNER_TIMEOUT_SECS", "900"),
        ])
        .unwrap();
        assert_eq!(config.retry.call_timeout, Duration::from_secs(5));
        assert_eq!(config.confirmation.send_timeout, Duration::from_secs(900));
    }
}
