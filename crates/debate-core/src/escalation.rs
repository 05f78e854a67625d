//! Round decision and tie-breaker policy.

use serde::{Deserialize, Serialize};

use debate_state::{Decision, EscalationReason};

use crate::config::RoundPolicy;
use crate::consensus::ConsensusOutcome;

/// What the coordinator does after a round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoundVerdict {
    pub decision: Decision,
    pub reason: Option<EscalationReason>,
}

impl RoundVerdict {
    fn proceed() -> Self {
        Self {
            decision: Decision::ProceedToApproval,
            reason: None,
        }
    }

    fn continue_debate() -> Self {
        Self {
            decision: Decision::ContinueDebate,
            reason: None,
        }
    }

    fn escalate(reason: EscalationReason) -> Self {
        Self {
            decision: Decision::Escalate,
            reason: Some(reason),
        }
    }
}

/// Decide the next step for a scored round.
///
/// Checks, in order:
/// 1. non-comparable round: escalate (`all_runs_failed` when nothing
///    completed, otherwise `insufficient_data`)
/// 2. `score >= threshold`: proceed
/// 3. `round_number >= max_rounds`: escalate, budget exhausted
/// 4. improvement over the previous round below `stagnation_delta`:
///    escalate (`regression` if the score dropped, else `stagnation`)
/// 5. otherwise continue
pub fn decide(
    outcome: &ConsensusOutcome,
    completed_runs: usize,
    round_number: u32,
    previous_score: Option<f64>,
    policy: &RoundPolicy,
) -> RoundVerdict {
    if !outcome.comparable {
        return RoundVerdict::escalate(if completed_runs == 0 {
            EscalationReason::AllRunsFailed
        } else {
            EscalationReason::InsufficientData
        });
    }
    if outcome.score >= policy.threshold {
        return RoundVerdict::proceed();
    }
    if round_number >= policy.max_rounds {
        return RoundVerdict::escalate(EscalationReason::RoundBudgetExhausted);
    }
    if let Some(prev) = previous_score {
        let delta = outcome.score - prev;
        if delta < 0.0 {
            return RoundVerdict::escalate(EscalationReason::Regression);
        }
        if delta < policy.stagnation_delta {
            return RoundVerdict::escalate(EscalationReason::Stagnation);
        }
    }
    RoundVerdict::continue_debate()
}

/// Verdict for a single-role fast-track round.
pub fn decide_fast_track(completed_runs: usize) -> RoundVerdict {
    if completed_runs == 0 {
        RoundVerdict::escalate(EscalationReason::AllRunsFailed)
    } else {
        RoundVerdict::proceed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(score: f64) -> ConsensusOutcome {
        ConsensusOutcome {
            score,
            breakdown: Vec::new(),
            participants: Vec::new(),
            comparable: true,
            disagreements: Vec::new(),
            agreed_items: Vec::new(),
        }
    }

    fn policy(max_rounds: u32) -> RoundPolicy {
        RoundPolicy {
            max_rounds,
            threshold: 80.0,
            stagnation_delta: 5.0,
            fast_track: false,
        }
    }

    #[test]
    fn threshold_reached_proceeds_even_on_last_round() {
        let v = decide(&outcome(80.0), 2, 2, Some(60.0), &policy(2));
        assert_eq!(v.decision, Decision::ProceedToApproval);
    }

    #[test]
    fn three_low_rounds_escalate_at_budget() {
        let p = policy(3);
        let scores = [38.3, 45.0, 40.0];
        let mut prev = None;
        let mut decisions = Vec::new();
        for (i, score) in scores.iter().enumerate() {
            let v = decide(&outcome(*score), 2, i as u32 + 1, prev, &p);
            decisions.push(v);
            prev = Some(*score);
        }
        assert_eq!(decisions[0].decision, Decision::ContinueDebate);
        assert_eq!(decisions[1].decision, Decision::ContinueDebate);
        assert_eq!(decisions[2].decision, Decision::Escalate);
        assert_eq!(
            decisions[2].reason,
            Some(EscalationReason::RoundBudgetExhausted)
        );
    }

    #[test]
    fn regression_escalates_before_budget() {
        let v = decide(&outcome(40.0), 2, 2, Some(45.0), &policy(4));
        assert_eq!(v.reason, Some(EscalationReason::Regression));
    }

    #[test]
    fn stagnation_escalates_before_budget() {
        let v = decide(&outcome(47.0), 2, 2, Some(45.0), &policy(4));
        assert_eq!(v.reason, Some(EscalationReason::Stagnation));
    }

    #[test]
    fn non_comparable_routes_to_insufficient_data() {
        let mut o = outcome(0.0);
        o.comparable = false;
        assert_eq!(
            decide(&o, 1, 1, None, &policy(2)).reason,
            Some(EscalationReason::InsufficientData)
        );
        assert_eq!(
            decide(&o, 0, 1, None, &policy(2)).reason,
            Some(EscalationReason::AllRunsFailed)
        );
    }

    #[test]
    fn fast_track_proceeds_when_the_run_completed() {
        assert_eq!(decide_fast_track(1).decision, Decision::ProceedToApproval);
        assert_eq!(
            decide_fast_track(0).reason,
            Some(EscalationReason::AllRunsFailed)
        );
    }
}
