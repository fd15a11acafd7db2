pub mod contracts;
pub mod events;
pub mod ledger;
pub mod pools;
pub mod providers;
pub mod resilience;
pub mod submit;
pub mod tokens;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
