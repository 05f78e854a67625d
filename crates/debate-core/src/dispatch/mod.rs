//! Agent work dispatch: idempotent enqueue, claimed execution, settlement.

pub mod dispatcher;
pub mod executor;
pub mod idempotency;
pub mod rate_limit;
pub mod signals;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use executor::{AgentExecutor, AgentFailure, AgentRequest, CommandExecutor, EXIT_TRANSIENT};
pub use idempotency::idempotency_key;
pub use rate_limit::RateLimiter;
pub use signals::{CancelRegistry, RoundSignals, RunSettled};
pub use worker::{ProcessOutcome, WorkerPool};
