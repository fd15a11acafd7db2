use std::sync::Arc;

use anyhow::Context;

use crate::chain::ledger::TransactionSigner;
use crate::chain::providers;
use crate::chain::resilience::ResilientLedger;
use crate::chain::tokens::TokenTable;
use crate::config::Config;
use crate::engine::{EngineSettings, LiquidityEngine};

/// Token table for `config`: the file at `FALLBACK_TOKENS_PATH` or the built-in one,
/// with the configured wrapped-native override applied.
pub fn load_token_table(config: &Config) -> anyhow::Result<TokenTable> {
    let mut table = match &config.fallback_tokens_path {
        Some(path) => TokenTable::load(path)?,
        None => TokenTable::builtin().context("parsing built-in token table")?,
    };
    if let Some(wrapped) = config.wrapped_native {
        table.set_wrapped_native(config.chain_id, wrapped);
    }
    if table.wrapped_native(config.chain_id).is_none() {
        log::warn!("no wrapped-native token known for chain {}; native deposits will fail", config.chain_id);
    }
    Ok(table)
}

pub fn engine_settings(config: &Config) -> EngineSettings {
    EngineSettings {
        factory: config.factory,
        position_manager: config.position_manager,
        init_code_hash: config.pool_init_code_hash,
        default_slippage: config.default_slippage,
        default_deadline: config.default_deadline,
        confirmation: config.confirmation,
    }
}

/// Connects to the first healthy RPC endpoint and builds an engine that signs
/// through `signer`. Fails if the node serves a different chain than configured.
pub async fn build_engine(config: &Config, signer: Arc<dyn TransactionSigner>) -> anyhow::Result<LiquidityEngine> {
    config.validate()?;
    let table = load_token_table(config)?;

    let ledgers = providers::create_ledgers(&config.rpc_urls(), config.retry.call_timeout)?;
    let ledger = ResilientLedger::connect(ledgers, config.retry)
        .await
        .context("no RPC endpoint answered")?;

    let engine = LiquidityEngine::new(config.chain_id, Arc::new(ledger), signer, Arc::new(table), engine_settings(config));
    engine.verify_chain().await?;
    log::info!(
        "liquidity engine ready on chain {} for account {:?} (position manager {:?})",
        config.chain_id,
        engine.account(),
        engine.position_manager()
    );
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[test]
    fn test_wrapped_native_override() {
        let config = config(&[
            ("RPC_URL", "https://x.example.org"),
            ("CHAIN_ID", "31337"),
            ("WRAPPED_NATIVE_ADDRESS", "0x5FbDB2315678afecb367f032d93F642f64180aa3"),
        ]);
        let table = load_token_table(&config).unwrap();
        assert_eq!(table.wrapped_native(31337), config.wrapped_native);
    }

    #[test]
    fn test_missing_token_file_is_reported() {
        let config = config(&[("RPC_URL", "https://x.example.org"), ("FALLBACK_TOKENS_PATH", "/nonexistent/tokens.json")]);
        let err = load_token_table(&config).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/tokens.json"));
    }

    #[test]
    fn test_settings_follow_config() {
        let config = config(&[("RPC_URL", "https://x.example.org"), ("DEFAULT_SLIPPAGE", "0.01")]);
        let settings = engine_settings(&config);
        assert_eq!(settings.position_manager, config.position_manager);
        assert_eq!(settings.default_slippage, config.default_slippage);
    }
}
