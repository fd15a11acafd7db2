//! Retry, backoff and provider fallback around every remote call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, Bytes, TransactionReceipt, TxHash, U256};
use futures::future::join_all;

use crate::chain::ledger::{CallRequest, Ledger};
use crate::error::{ChainError, ChainErrorKind, EngineError};

/// Single retry policy consumed by [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    /// Upper bound for one attempt, independent of the transport timeout.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(8),
            call_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Sleep after failed attempt `attempt` (1-based): base * multiplier^(attempt-1), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_backoff.as_millis() as f64 * self.multiplier.max(1.0).powi(exp);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The signer's owner said no. Never retried.
    UserRejected,
    /// Node-side trouble that may clear on its own.
    Transient,
    /// Same request, same answer. Never retried.
    Fatal,
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, err: &ChainError) -> ErrorClass;
}

/// JSON-RPC codes that mean "try again later".
const TRANSIENT_RPC_CODES: [i64; 7] = [-32005, -32002, -32603, 429, 502, 503, 504];

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl ErrorClassifier for DefaultClassifier {
    fn classify(&self, err: &ChainError) -> ErrorClass {
        match err.kind {
            ChainErrorKind::Rejected => ErrorClass::UserRejected,
            ChainErrorKind::Timeout | ChainErrorKind::Transport => ErrorClass::Transient,
            ChainErrorKind::Reverted | ChainErrorKind::Decode => ErrorClass::Fatal,
            ChainErrorKind::Rpc => {
                let transient_code = err
                    .code
                    .map(|code| TRANSIENT_RPC_CODES.contains(&code) && err.revert_data.is_none())
                    .unwrap_or(false);
                if transient_code || err.message.to_lowercase().contains("circuit breaker") {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
        }
    }
}

/// Tagged result of [`with_retry`].
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    Exhausted { attempts: u32, last_error: ChainError },
    Fatal(ChainError),
    Rejected(ChainError),
}

impl<T> RetryOutcome<T> {
    pub fn into_result(self) -> Result<T, EngineError> {
        match self {
            RetryOutcome::Success(v) => Ok(v),
            RetryOutcome::Exhausted { attempts, last_error } => Err(EngineError::NodeUnavailable { attempts, last_error }),
            RetryOutcome::Fatal(err) => Err(EngineError::from_chain_failure(err)),
            RetryOutcome::Rejected(_) => Err(EngineError::UserRejected),
        }
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or the policy is exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, classifier: &dyn ErrorClassifier, what: &str, mut op: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::timeout(format!("{what} timed out after {:?}", policy.call_timeout))),
        };
        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("{what} succeeded on attempt {attempt}");
                }
                return RetryOutcome::Success(value);
            }
            Err(err) => err,
        };

        match classifier.classify(&err) {
            ErrorClass::UserRejected => return RetryOutcome::Rejected(err),
            ErrorClass::Fatal => return RetryOutcome::Fatal(err),
            ErrorClass::Transient if attempt >= max_attempts => {
                log::warn!("{what} failed after {attempt} attempts: {err}");
                return RetryOutcome::Exhausted { attempts: attempt, last_error: err };
            }
            ErrorClass::Transient => {
                let delay = policy.delay_for(attempt);
                log::debug!("{what} attempt {attempt}/{max_attempts} failed ({err}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Checks every candidate concurrently and returns the first healthy one in priority order.
pub async fn select_provider(
    candidates: &[Arc<dyn Ledger>],
    check_timeout: Duration,
) -> Result<Arc<dyn Ledger>, EngineError> {
    let checks = candidates.iter().map(|ledger| async move {
        match tokio::time::timeout(check_timeout, ledger.block_number()).await {
            Ok(Ok(block)) => {
                log::debug!("provider {} healthy at block {block}", ledger.label());
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ChainError::timeout(format!("{} health check timed out", ledger.label()))),
        }
    });
    let results = join_all(checks).await;

    let mut last_error = None;
    for (ledger, result) in candidates.iter().zip(results) {
        match result {
            Ok(()) => return Ok(ledger.clone()),
            Err(err) => {
                log::warn!("provider {} unhealthy: {err}", ledger.label());
                last_error = Some(err);
            }
        }
    }
    Err(EngineError::NodeUnavailable {
        attempts: candidates.len() as u32,
        last_error: last_error.unwrap_or_else(|| ChainError::new(ChainErrorKind::Transport, "no providers configured")),
    })
}

/// Ordered provider candidates behind one retrying, falling-back read interface.
pub struct ResilientLedger {
    candidates: Vec<Arc<dyn Ledger>>,
    policy: RetryPolicy,
    classifier: Arc<dyn ErrorClassifier>,
}

impl ResilientLedger {
    pub fn new(candidates: Vec<Arc<dyn Ledger>>, policy: RetryPolicy) -> Self {
        Self { candidates, policy, classifier: Arc::new(DefaultClassifier) }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Moves the first healthy candidate to the front; fails if none answers.
    pub async fn connect(candidates: Vec<Arc<dyn Ledger>>, policy: RetryPolicy) -> Result<Self, EngineError> {
        let healthy = select_provider(&candidates, policy.call_timeout).await?;
        let mut ordered = vec![healthy.clone()];
        ordered.extend(candidates.into_iter().filter(|c| !Arc::ptr_eq(c, &healthy)));
        log::info!("using provider {} ({} fallbacks)", healthy.label(), ordered.len() - 1);
        Ok(Self::new(ordered, policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &dyn ErrorClassifier {
        self.classifier.as_ref()
    }

    pub fn primary_label(&self) -> &str {
        self.candidates.first().map(|c| c.label()).unwrap_or("none")
    }

    async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T, EngineError>
    where
        F: Fn(Arc<dyn Ledger>) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut attempts = 0;
        let mut last_error = None;
        for ledger in &self.candidates {
            let label = format!("{what} via {}", ledger.label());
            match with_retry(&self.policy, self.classifier.as_ref(), &label, || op(ledger.clone())).await {
                RetryOutcome::Exhausted { attempts: n, last_error: err } => {
                    log::warn!("falling back from provider {}: {err}", ledger.label());
                    attempts += n;
                    last_error = Some(err);
                }
                outcome => return outcome.into_result(),
            }
        }
        Err(EngineError::NodeUnavailable {
            attempts,
            last_error: last_error.unwrap_or_else(|| ChainError::new(ChainErrorKind::Transport, "no providers configured")),
        })
    }

    pub async fn chain_id(&self) -> Result<u64, EngineError> {
        self.run("eth_chainId", |l| async move { l.chain_id().await }).await
    }

    pub async fn block_number(&self) -> Result<u64, EngineError> {
        self.run("eth_blockNumber", |l| async move { l.block_number().await }).await
    }

    pub async fn call(&self, request: &CallRequest) -> Result<Bytes, EngineError> {
        self.run("eth_call", |l| async move { l.call(request).await }).await
    }

    pub async fn code_at(&self, address: Address) -> Result<Bytes, EngineError> {
        self.run("eth_getCode", |l| async move { l.code_at(address).await }).await
    }

    pub async fn native_balance(&self, address: Address) -> Result<U256, EngineError> {
        self.run("eth_getBalance", |l| async move { l.native_balance(address).await }).await
    }

    pub async fn receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>, EngineError> {
        self.run("eth_getTransactionReceipt", |l| async move { l.receipt(hash).await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = fast_policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(1));
    }

    #[test]
    fn test_default_classifier() {
        let c = DefaultClassifier;
        assert_eq!(c.classify(&ChainError::timeout("slow")), ErrorClass::Transient);
        assert_eq!(c.classify(&ChainError::rpc(-32005, "limit exceeded")), ErrorClass::Transient);
        assert_eq!(c.classify(&ChainError::rpc(429, "too many requests")), ErrorClass::Transient);
        assert_eq!(c.classify(&ChainError::rpc(-32000, "circuit breaker is open")), ErrorClass::Transient);
        assert_eq!(c.classify(&ChainError::rpc(-32602, "invalid params")), ErrorClass::Fatal);
        assert_eq!(c.classify(&ChainError::revert_with_reason("STF")), ErrorClass::Fatal);
        assert_eq!(
            c.classify(&ChainError::new(ChainErrorKind::Rejected, "user rejected")),
            ErrorClass::UserRejected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt_after_two_backoffs() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let outcome = with_retry(&fast_policy(), &DefaultClassifier, "read", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(ChainError::rpc(-32005, "limit exceeded"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert!(matches!(outcome, RetryOutcome::Success(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_never_retried() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = with_retry(&fast_policy(), &DefaultClassifier, "send", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ChainError::new(ChainErrorKind::Rejected, "User denied transaction signature")) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome.into_result(), Err(EngineError::UserRejected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_carries_last_error() {
        let outcome: RetryOutcome<()> = with_retry(&fast_policy(), &DefaultClassifier, "read", || async {
            Err(ChainError::rpc(503, "service unavailable"))
        })
        .await;
        match outcome.into_result() {
            Err(EngineError::NodeUnavailable { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.code, Some(503));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_counts_as_timeout() {
        let policy = RetryPolicy { max_attempts: 1, call_timeout: Duration::from_millis(50), ..fast_policy() };
        let outcome: RetryOutcome<()> = with_retry(&policy, &DefaultClassifier, "hang", || std::future::pending()).await;
        match outcome {
            RetryOutcome::Exhausted { last_error, .. } => assert_eq!(last_error.kind, ChainErrorKind::Timeout),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_fall_back_to_next_provider() {
        use crate::chain::testing::{FakeChain, OfflineLedger};

        let dead: Arc<dyn Ledger> = Arc::new(OfflineLedger::new("dead", ChainError::rpc(502, "bad gateway")));
        let chain = FakeChain::new(10).with_label("backup");
        let ledger = ResilientLedger::new(vec![dead, chain.ledger()], fast_policy());
        assert_eq!(ledger.chain_id().await.unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_prefers_first_healthy_provider() {
        use crate::chain::testing::{FakeChain, OfflineLedger};

        let dead: Arc<dyn Ledger> = Arc::new(OfflineLedger::new("dead", ChainError::timeout("connect timed out")));
        let chain = FakeChain::new(1).with_label("healthy");
        let ledger = ResilientLedger::connect(vec![dead, chain.ledger()], fast_policy()).await.unwrap();
        assert_eq!(ledger.primary_label(), "healthy");

        let none = ResilientLedger::connect(vec![], fast_policy()).await;
        assert!(matches!(none, Err(EngineError::NodeUnavailable { attempts: 0, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_down_is_node_unavailable() {
        use crate::chain::testing::OfflineLedger;

        let a: Arc<dyn Ledger> = Arc::new(OfflineLedger::new("a", ChainError::rpc(503, "unavailable")));
        let b: Arc<dyn Ledger> = Arc::new(OfflineLedger::new("b", ChainError::rpc(429, "rate limited")));
        let ledger = ResilientLedger::new(vec![a, b], fast_policy());
        match ledger.block_number().await {
            Err(EngineError::NodeUnavailable { attempts, last_error }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last_error.code, Some(429));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
