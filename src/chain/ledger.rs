//! The two remote seams the engine consumes: a read-only ledger and a signer.
//!
//! Both are object safe so the resilience layer can hold an ordered list of
//! `Arc<dyn Ledger>` candidates and tests can swap in an in-memory chain.

use std::sync::Arc;

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, TransactionReceipt, TransactionRequest, TxHash, U256};

use crate::error::ChainError;

/// The only request shape the engine builds, for reads and writes alike.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

impl CallRequest {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self { from: None, to, data: data.into(), value: U256::zero() }
    }

    pub fn sender(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    /// First four bytes of calldata.
    pub fn selector(&self) -> Option<[u8; 4]> {
        self.data.get(..4).map(|s| [s[0], s[1], s[2], s[3]])
    }

    pub fn to_transaction(&self) -> TransactionRequest {
        let mut tx = TransactionRequest::new().to(self.to).data(self.data.clone());
        if let Some(from) = self.from {
            tx = tx.from(from);
        }
        if !self.value.is_zero() {
            tx = tx.value(self.value);
        }
        tx
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Short name used in logs (host of the RPC URL).
    fn label(&self) -> &str;
    async fn chain_id(&self) -> Result<u64, ChainError>;
    async fn block_number(&self) -> Result<u64, ChainError>;
    /// `eth_call` against the latest block.
    async fn call(&self, request: &CallRequest) -> Result<Bytes, ChainError>;
    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError>;
    async fn native_balance(&self, address: Address) -> Result<U256, ChainError>;
    async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError>;
}

#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> Address;
    /// Signs and broadcasts; returns as soon as the node accepted the transaction.
    async fn send_transaction(&self, request: &CallRequest) -> Result<TxHash, ChainError>;
}

/// `Ledger` over any ethers middleware stack.
#[derive(Debug)]
pub struct ProviderLedger<M> {
    label: String,
    client: Arc<M>,
}

impl<M> ProviderLedger<M> {
    pub fn new(label: impl Into<String>, client: Arc<M>) -> Self {
        Self { label: label.into(), client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> Ledger for ProviderLedger<M> {
    fn label(&self) -> &str {
        &self.label
    }

    async fn chain_id(&self) -> Result<u64, ChainError> {
        let id = self.client.get_chainid().await.map_err(ChainError::from_middleware)?;
        Ok(id.low_u64())
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let n = self.client.get_block_number().await.map_err(ChainError::from_middleware)?;
        Ok(n.as_u64())
    }

    async fn call(&self, request: &CallRequest) -> Result<Bytes, ChainError> {
        let tx = request.to_transaction().into();
        self.client.call(&tx, None).await.map_err(ChainError::from_middleware)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        self.client.get_code(address, None).await.map_err(ChainError::from_middleware)
    }

    async fn native_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.client.get_balance(address, None).await.map_err(ChainError::from_middleware)
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, ChainError> {
        self.client.get_transaction_receipt(hash).await.map_err(ChainError::from_middleware)
    }
}

/// `TransactionSigner` over a middleware that can sign for `from`, such as `SignerMiddleware`.
#[derive(Debug)]
pub struct MiddlewareSigner<M> {
    client: Arc<M>,
    from: Address,
}

impl<M> MiddlewareSigner<M> {
    pub fn new(client: Arc<M>, from: Address) -> Self {
        Self { client, from }
    }
}

#[async_trait]
impl<M: Middleware + 'static> TransactionSigner for MiddlewareSigner<M> {
    fn address(&self) -> Address {
        self.from
    }

    async fn send_transaction(&self, request: &CallRequest) -> Result<TxHash, ChainError> {
        let tx = request.clone().sender(self.from).to_transaction();
        let pending = self.client.send_transaction(tx, None).await.map_err(ChainError::from_middleware)?;
        Ok(pending.tx_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_shape() {
        let to = Address::from([7u8; 20]);
        let from = Address::from([9u8; 20]);
        let req = CallRequest::new(to, vec![0xde, 0xad, 0xbe, 0xef, 0x01]).sender(from);
        assert_eq!(req.selector(), Some([0xde, 0xad, 0xbe, 0xef]));

        let tx = req.to_transaction();
        assert_eq!(tx.from, Some(from));
        assert_eq!(tx.value, None);

        let tx = req.with_value(U256::from(5u8)).to_transaction();
        assert_eq!(tx.value, Some(U256::from(5u8)));
    }

    #[test]
    fn test_short_calldata_has_no_selector() {
        let req = CallRequest::new(Address::zero(), vec![0x01, 0x02]);
        assert_eq!(req.selector(), None);
    }
}
