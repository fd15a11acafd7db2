pub mod approvals;
pub mod orchestrator;
pub mod position;

pub use orchestrator::{EngineSettings, LiquidityEngine};
