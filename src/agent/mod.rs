pub mod prompt;
pub mod runner;

pub use runner::{AgentRunner, ApprovalDriver, RunConfig, RunOutcome, RunStatus, SurrenderDriver};
