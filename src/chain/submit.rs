use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, TransactionReceipt, TxHash};

use crate::chain::ledger::{CallRequest, TransactionSigner};
use crate::chain::resilience::{with_retry, ErrorClass, ErrorClassifier, ResilientLedger, RetryOutcome, RetryPolicy};
use crate::error::{ChainError, ChainErrorKind, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    /// Longest wait for a receipt before the outcome is reported as unknown.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Longest wait for the signer to hand back a hash. Wallets may be waiting
    /// on a human, so this is independent of the RPC read timeout.
    pub send_timeout: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(2),
            send_timeout: Duration::from_secs(300),
        }
    }
}

/// A send that timed out may still have reached the mempool, so it is not resent.
struct SendClassifier<'a>(&'a dyn ErrorClassifier);

impl ErrorClassifier for SendClassifier<'_> {
    fn classify(&self, err: &ChainError) -> ErrorClass {
        match err.kind {
            ChainErrorKind::Timeout => ErrorClass::Fatal,
            _ => self.0.classify(err),
        }
    }
}

/// Submits writes for one signing account.
///
/// Every write takes `&mut self`, so the borrow checker guarantees a single
/// transaction in flight per account: each one is confirmed (or reported as
/// unknown) before the next can be built.
pub struct TransactionSubmitter {
    ledger: Arc<ResilientLedger>,
    signer: Arc<dyn TransactionSigner>,
    confirmation: ConfirmationPolicy,
}

impl TransactionSubmitter {
    pub fn new(ledger: Arc<ResilientLedger>, signer: Arc<dyn TransactionSigner>, confirmation: ConfirmationPolicy) -> Self {
        Self { ledger, signer, confirmation }
    }

    pub fn account(&self) -> Address {
        self.signer.address()
    }

    /// Simulates, sends, and waits for the receipt of `request`.
    pub async fn execute(&mut self, request: CallRequest, what: &str) -> Result<TransactionReceipt, EngineError> {
        let request = request.sender(self.account());

        if let Err(err) = self.ledger.call(&request).await {
            log::warn!("{what} rejected in simulation: {err}");
            return Err(err);
        }

        let hash = self.send(&request, what).await?;
        log::info!("{what} submitted: {hash:?}");

        let receipt = match tokio::time::timeout(self.confirmation.timeout, self.wait_for_receipt(hash)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(err)) => {
                log::warn!("{what} {hash:?} sent but its receipt could not be read: {err}");
                return Err(EngineError::UnknownOutcome { hash: Some(hash) });
            }
            Err(_) => {
                log::warn!("{what} {hash:?} not confirmed within {:?}", self.confirmation.timeout);
                return Err(EngineError::UnknownOutcome { hash: Some(hash) });
            }
        };

        if receipt.status.map(|s| s.is_zero()).unwrap_or(false) {
            log::warn!("{what} {hash:?} reverted in block {:?}", receipt.block_number);
            return Err(EngineError::Reverted(format!("{what} transaction {hash:?} reverted")));
        }
        log::info!(
            "{what} {hash:?} confirmed in block {:?} (gas used {:?})",
            receipt.block_number.map(|b| b.as_u64()),
            receipt.gas_used
        );
        Ok(receipt)
    }

    /// Hands the request to the signer. A timed-out send may still be
    /// broadcast later, so it surfaces as an unknown outcome.
    async fn send(&self, request: &CallRequest, what: &str) -> Result<TxHash, EngineError> {
        let policy = RetryPolicy { call_timeout: self.confirmation.send_timeout, ..*self.ledger.policy() };
        let classifier = SendClassifier(self.ledger.classifier());
        let signer = &self.signer;
        match with_retry(&policy, &classifier, what, || signer.send_transaction(request)).await {
            RetryOutcome::Fatal(err) if err.kind == ChainErrorKind::Timeout => {
                log::warn!("{what} got no hash from the signer: {err}");
                Err(EngineError::UnknownOutcome { hash: None })
            }
            outcome => outcome.into_result(),
        }
    }

    async fn wait_for_receipt(&self, hash: TxHash) -> Result<TransactionReceipt, EngineError> {
        loop {
            match self.ledger.receipt(hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(err) if err.is_transient() => log::debug!("receipt poll for {hash:?} failed: {err}"),
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.confirmation.poll_interval).await;
        }
    }
}
