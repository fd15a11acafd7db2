use std::sync::Arc;
use std::time::Duration;

use ethers::prelude::*;
use url::Url;

use crate::chain::ledger::{Ledger, ProviderLedger};
use crate::error::EngineError;

/// HTTP JSON-RPC provider whose every request is bounded by `timeout`.
pub fn create_provider(rpc_url: &str, timeout: Duration) -> Result<Arc<Provider<Http>>, EngineError> {
    let url = Url::parse(rpc_url).map_err(|e| EngineError::Config(format!("invalid RPC url {rpc_url:?}: {e}")))?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Config(format!("http client: {e}")))?;
    let provider = Provider::new(Http::new_with_client(url, client));
    Ok(Arc::new(provider))
}

/// One ledger per URL, primary first. The label is the URL host so logs never print API keys in paths.
pub fn create_ledgers(urls: &[String], timeout: Duration) -> Result<Vec<Arc<dyn Ledger>>, EngineError> {
    urls.iter()
        .map(|raw| {
            let provider = create_provider(raw, timeout)?;
            let label = Url::parse(raw)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| "rpc".to_string());
            Ok(Arc::new(ProviderLedger::new(label, provider)) as Arc<dyn Ledger>)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_url() {
        assert!(matches!(
            create_provider("not a url", Duration::from_secs(1)),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_labels_use_host_only() {
        let ledgers = create_ledgers(
            &[
                "https://mainnet.example.org/v3/secret-key".to_string(),
                "http://127.0.0.1:8545".to_string(),
            ],
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(ledgers.len(), 2);
        assert_eq!(ledgers[0].label(), "mainnet.example.org");
        assert_eq!(ledgers[1].label(), "127.0.0.1");
    }
}
