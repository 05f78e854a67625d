//! Round context handed to agents.

use serde::{Deserialize, Serialize};

use debate_state::{
    AgentRunRecord, AgreementRef, Complexity, FindingRecord, Role, TaskId, TaskRecord,
};

/// One role's output from the previous round, for cross-review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReview {
    pub role: Role,
    pub findings: Vec<FindingRecord>,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub explicit_agreements: Vec<AgreementRef>,
}

impl PeerReview {
    pub fn new(run: &AgentRunRecord, findings: Vec<FindingRecord>) -> Self {
        Self {
            role: run.role,
            findings,
            recommendations: run.recommendations.clone(),
            explicit_agreements: run.explicit_agreements.clone(),
        }
    }
}

/// JSON document stored in the context store and referenced by every job
/// envelope of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundContext {
    pub task_id: TaskId,
    pub task_slug: String,
    pub title: String,
    pub description: String,
    pub round_number: u32,
    pub complexity: Option<Complexity>,
    /// Explorer output, when the task was explored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exploration: Option<PeerReview>,
    /// Completed runs of the previous round.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_round: Vec<PeerReview>,
}

impl RoundContext {
    pub fn new(task: &TaskRecord, round_number: u32) -> Self {
        Self {
            task_id: task.id.clone(),
            task_slug: task.slug.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            round_number,
            complexity: task.complexity,
            exploration: None,
            previous_round: Vec::new(),
        }
    }
}
