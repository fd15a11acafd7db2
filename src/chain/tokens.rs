use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::chain::contracts;
use crate::chain::ledger::CallRequest;
use crate::chain::resilience::ResilientLedger;
use crate::error::EngineError;
use crate::models::{TokenDescriptor, TokenReference};

const BUILTIN_TABLE: &str = include_str!("../../data/fallback_tokens.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub chain_id: u64,
    pub address: Address,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

/// Static token metadata used when on-chain queries fail. Versioned and swappable per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTable {
    pub version: String,
    #[serde(default)]
    pub wrapped_native: HashMap<u64, Address>,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

impl TokenTable {
    pub fn builtin() -> Result<Self, EngineError> {
        Self::from_json(BUILTIN_TABLE)
    }

    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        serde_json::from_str(raw).map_err(|e| EngineError::Config(format!("token table: {e}")))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading token table {}", path.display()))?;
        let table: TokenTable =
            serde_json::from_str(&raw).with_context(|| format!("parsing token table {}", path.display()))?;
        log::info!("loaded token table {} ({} tokens) from {}", table.version, table.tokens.len(), path.display());
        Ok(table)
    }

    pub fn empty(version: impl Into<String>) -> Self {
        Self { version: version.into(), wrapped_native: HashMap::new(), tokens: Vec::new() }
    }

    pub fn wrapped_native(&self, chain_id: u64) -> Option<Address> {
        self.wrapped_native.get(&chain_id).copied()
    }

    pub fn set_wrapped_native(&mut self, chain_id: u64, address: Address) {
        self.wrapped_native.insert(chain_id, address);
    }

    pub fn insert(&mut self, entry: TokenEntry) {
        self.tokens.retain(|t| !(t.chain_id == entry.chain_id && t.address == entry.address));
        self.tokens.push(entry);
    }

    pub fn lookup(&self, chain_id: u64, address: Address) -> Option<&TokenEntry> {
        self.tokens.iter().find(|t| t.chain_id == chain_id && t.address == address)
    }
}

/// Resolves token references to metadata: on-chain first, then the fallback table.
pub struct TokenResolver {
    ledger: Arc<ResilientLedger>,
    table: Arc<TokenTable>,
}

impl TokenResolver {
    pub fn new(ledger: Arc<ResilientLedger>, table: Arc<TokenTable>) -> Self {
        Self { ledger, table }
    }

    pub fn table(&self) -> &TokenTable {
        &self.table
    }

    /// Native references map to the chain's wrapped token.
    pub fn canonical_address(&self, reference: &TokenReference) -> Result<Address, EngineError> {
        if !reference.is_native {
            return Ok(reference.address);
        }
        self.table.wrapped_native(reference.chain_id).ok_or(EngineError::UnresolvableToken {
            chain_id: reference.chain_id,
            address: reference.address,
        })
    }

    pub async fn resolve(&self, reference: &TokenReference) -> Result<TokenDescriptor, EngineError> {
        let address = self.canonical_address(reference)?;
        let chain_id = reference.chain_id;

        let failure = match self.query_metadata(address).await {
            Ok((decimals, symbol, name)) => {
                return Ok(TokenDescriptor { chain_id, address, decimals, symbol, name, is_native: reference.is_native });
            }
            Err(failure) => failure,
        };

        match self.table.lookup(chain_id, address) {
            Some(entry) => {
                log::info!(
                    "token {address:?} on chain {chain_id}: {}; using fallback table {} ({})",
                    failure.reason,
                    self.table.version,
                    entry.symbol
                );
                Ok(TokenDescriptor {
                    chain_id,
                    address,
                    decimals: entry.decimals,
                    symbol: entry.symbol.clone(),
                    name: entry.name.clone(),
                    is_native: reference.is_native,
                })
            }
            None => {
                log::warn!("token {address:?} on chain {chain_id} unresolvable: {}", failure.reason);
                // An unreachable node is reported as such, not as a bad token.
                match failure.unavailable {
                    Some(err) => Err(err),
                    None => Err(EngineError::UnresolvableToken { chain_id, address }),
                }
            }
        }
    }

    pub async fn resolve_pair(
        &self,
        a: &TokenReference,
        b: &TokenReference,
    ) -> Result<(TokenDescriptor, TokenDescriptor), EngineError> {
        tokio::try_join!(self.resolve(a), self.resolve(b))
    }

    /// On-chain decimals, symbol and name.
    async fn query_metadata(&self, address: Address) -> Result<(u8, String, String), MetadataFailure> {
        let code = self.ledger.code_at(address).await.map_err(|e| MetadataFailure::remote("code lookup", e))?;
        if code.is_empty() {
            return Err(MetadataFailure::degenerate("no contract code"));
        }

        let decimals_req = CallRequest::new(address, contracts::erc20_decimals());
        let symbol_req = CallRequest::new(address, contracts::erc20_symbol());
        let name_req = CallRequest::new(address, contracts::erc20_name());
        let (decimals, symbol, name) = tokio::join!(
            self.ledger.call(&decimals_req),
            self.ledger.call(&symbol_req),
            self.ledger.call(&name_req),
        );

        let decimals = decimals
            .map_err(|e| MetadataFailure::remote("decimals()", e))
            .and_then(|raw| contracts::decode_decimals(&raw).map_err(|e| MetadataFailure::degenerate(e.to_string())))?;
        let symbol = symbol
            .map_err(|e| MetadataFailure::remote("symbol()", e))
            .and_then(|raw| {
                contracts::decode_text("symbol()", &raw).map_err(|e| MetadataFailure::degenerate(e.to_string()))
            })?;
        if symbol.is_empty() {
            return Err(MetadataFailure::degenerate("empty symbol"));
        }
        let name = name
            .ok()
            .and_then(|raw| contracts::decode_text("name()", &raw).ok())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| symbol.clone());
        Ok((decimals, symbol, name))
    }
}

/// Why on-chain metadata was not usable.
struct MetadataFailure {
    reason: String,
    /// Set when the node itself could not be reached.
    unavailable: Option<EngineError>,
}

impl MetadataFailure {
    fn degenerate(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), unavailable: None }
    }

    fn remote(what: &str, err: EngineError) -> Self {
        let reason = format!("{what} failed ({err})");
        let unavailable = matches!(err, EngineError::NodeUnavailable { .. }).then_some(err);
        Self { reason, unavailable }
    }
}
