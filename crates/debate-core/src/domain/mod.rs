//! Domain rules that need no I/O.
//!
//! - `lifecycle`: task status graph and checkpoints
//! - `agent_output`: strict parsing of agent results
//! - `slug`: task slugs

pub mod agent_output;
pub mod lifecycle;
pub mod slug;

pub use agent_output::{AgentOutput, OutputError, OutputFinding};
pub use lifecycle::{can_transition, transition};
pub use slug::slugify;
