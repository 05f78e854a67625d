//! Debate Core Library
//!
//! Coordinates independent agents through multi-round debates and decides
//! algorithmically whether they converged.
//!
//! ## Key Components
//!
//! - `coordinator`: task state machine, round loop, approvals, resume
//! - `dispatch`: idempotent enqueue, claimed execution, per-agent rate
//!   limits, dead-lettering
//! - `consensus`: weighted agreement score with per-factor breakdown
//! - `triage`: complexity tier from the request text
//! - `escalation`: continue / proceed / escalate policy
//! - `engine`: wiring of store, job stream, executor and workers

pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod obs;
pub mod retry;
pub mod telemetry;
pub mod triage;

pub use config::{
    ConsensusConfig, ConsensusWeights, EngineConfig, QueueConfig, RateLimitConfig, RetryConfig,
    RoleSettings, RoundConfig, RoundPolicy, TimeoutConfig, TriageConfig,
};
pub use consensus::{ConsensusEngine, ConsensusOutcome, Participant, ScoredFinding};
pub use coordinator::{
    ApprovalDecision, Coordinator, PeerReview, RoundContext, TaskRequest, TaskStatusView,
};
pub use dispatch::{
    AgentExecutor, AgentFailure, AgentRequest, CommandExecutor, Dispatcher, ProcessOutcome,
    RateLimiter, WorkerPool,
};
pub use domain::{AgentOutput, OutputError};
pub use engine::DebateEngine;
pub use error::{DebateError, Result};
pub use escalation::{decide, RoundVerdict};
pub use triage::{TriageClassifier, TriageVerdict};
