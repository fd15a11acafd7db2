use std::sync::Arc;

use ethers::types::{Address, U256};

use crate::chain::contracts;
use crate::chain::ledger::CallRequest;
use crate::chain::resilience::ResilientLedger;
use crate::chain::submit::TransactionSubmitter;
use crate::error::EngineError;
use crate::models::TokenDescriptor;

/// Balance and allowance checks against one spender (the position manager).
pub struct ApprovalManager {
    ledger: Arc<ResilientLedger>,
    spender: Address,
}

impl ApprovalManager {
    pub fn new(ledger: Arc<ResilientLedger>, spender: Address) -> Self {
        Self { ledger, spender }
    }

    pub fn spender(&self) -> Address {
        self.spender
    }

    /// Fails before anything is sent if `owner` holds less than `required`.
    /// Native sides are checked against the account's native balance.
    pub async fn ensure_balance(&self, owner: Address, token: &TokenDescriptor, required: U256) -> Result<(), EngineError> {
        if required.is_zero() {
            return Ok(());
        }
        let balance = if token.is_native {
            self.ledger.native_balance(owner).await?
        } else {
            let raw = self.ledger.call(&CallRequest::new(token.address, contracts::erc20_balance_of(owner))).await?;
            contracts::decode_uint("balanceOf()", &raw).map_err(EngineError::from_chain_failure)?
        };
        if balance < required {
            return Err(EngineError::InsufficientApprovalOrBalance(format!(
                "{} balance {balance} of {owner:?} is below the required {required}",
                token.symbol
            )));
        }
        Ok(())
    }

    pub async fn allowance(&self, owner: Address, token: &TokenDescriptor) -> Result<U256, EngineError> {
        let raw = self
            .ledger
            .call(&CallRequest::new(token.address, contracts::erc20_allowance(owner, self.spender)))
            .await?;
        contracts::decode_uint("allowance()", &raw).map_err(EngineError::from_chain_failure)
    }

    /// Approves exactly `required` when the current allowance falls short.
    /// Returns whether an approval transaction was sent.
    pub async fn ensure_allowance(
        &self,
        submitter: &mut TransactionSubmitter,
        token: &TokenDescriptor,
        required: U256,
    ) -> Result<bool, EngineError> {
        if token.is_native || required.is_zero() {
            return Ok(false);
        }
        let owner = submitter.account();
        let current = self.allowance(owner, token).await?;
        if current >= required {
            log::debug!("{} allowance {current} covers {required}; no approval needed", token.symbol);
            return Ok(false);
        }

        log::info!("approving {required} {} for {:?} (current allowance {current})", token.symbol, self.spender);
        let approve = CallRequest::new(token.address, contracts::erc20_approve(self.spender, required));
        submitter.execute(approve, "approve").await?;
        Ok(true)
    }
}
