//! Scoring and decision policy over the public API.

use debate_core::{
    decide, ConsensusConfig, ConsensusEngine, Participant, RoundPolicy, ScoredFinding,
};
use debate_state::{AgreementRef, ConsensusFactor, Decision, EscalationReason, Role, Severity, Stance};

fn finding(category: &str, file: &str, severity: Severity) -> ScoredFinding {
    ScoredFinding {
        category: category.into(),
        file_path: Some(file.into()),
        severity: Some(severity),
        agreement_refs: Vec::new(),
    }
}

fn participant(role: Role, findings: Vec<ScoredFinding>) -> Participant {
    Participant {
        role,
        findings,
        recommendations: Vec::new(),
        explicit_agreements: Vec::new(),
    }
}

fn engine() -> ConsensusEngine {
    ConsensusEngine::new(&ConsensusConfig::default())
}

fn policy(max_rounds: u32) -> RoundPolicy {
    RoundPolicy {
        max_rounds,
        threshold: 80.0,
        stagnation_delta: 5.0,
        fast_track: false,
    }
}

fn partial_overlap() -> Vec<Participant> {
    vec![
        participant(
            Role::PlannerPrimary,
            vec![
                finding("security", "auth.go", Severity::High),
                finding("performance", "auth.go", Severity::Medium),
            ],
        ),
        participant(
            Role::PlannerSecondary,
            vec![
                finding("security", "session.go", Severity::High),
                finding("architecture", "auth.go", Severity::Low),
            ],
        ),
    ]
}

fn raw(outcome: &debate_core::ConsensusOutcome, factor: ConsensusFactor) -> f64 {
    outcome.factor(factor).expect("factor present").raw
}

#[test]
fn partial_overlap_scores_each_factor() {
    let outcome = engine().score(&partial_overlap());

    assert!((raw(&outcome, ConsensusFactor::Category) - 100.0 / 3.0).abs() < 1e-9);
    assert!((raw(&outcome, ConsensusFactor::FilePath) - 50.0).abs() < 1e-9);
    // No (file, category) key is shared, so nothing can conflict.
    assert_eq!(raw(&outcome, ConsensusFactor::Severity), 100.0);
    assert_eq!(raw(&outcome, ConsensusFactor::Explicit), 0.0);
    assert!((outcome.score - 38.333_333_333).abs() < 1e-6);
    assert!(outcome.comparable);

    let categories = outcome
        .disagreements
        .iter()
        .find(|d| d.factor == ConsensusFactor::Category)
        .expect("category disagreement");
    assert_eq!(categories.items, vec!["architecture", "performance"]);
}

#[test]
fn weighted_contributions_sum_to_score() {
    let outcome = engine().score(&partial_overlap());
    let sum: f64 = outcome.breakdown.iter().map(|f| f.weighted).sum();
    assert!((sum - outcome.score).abs() < 1e-9);
    let weights: f64 = outcome.breakdown.iter().map(|f| f.weight).sum();
    assert!((weights - 1.0).abs() < 1e-9);
}

#[test]
fn identical_inputs_produce_identical_bytes() {
    let a = serde_json::to_vec(&engine().score(&partial_overlap())).unwrap();
    let b = serde_json::to_vec(&engine().score(&partial_overlap())).unwrap();
    assert_eq!(a, b);
}

#[test]
fn corroborated_agreement_lifts_identical_findings_over_threshold() {
    let agree = AgreementRef {
        topic: "rotate signing keys".into(),
        stance: Stance::Agree,
    };
    let mut a = participant(
        Role::PlannerPrimary,
        vec![finding("security", "auth.go", Severity::High)],
    );
    a.explicit_agreements = vec![agree.clone()];
    let mut b = participant(
        Role::PlannerSecondary,
        vec![finding("security", "auth.go", Severity::High)],
    );
    b.explicit_agreements = vec![agree];

    let outcome = engine().score(&[a, b]);
    assert!((outcome.score - 100.0).abs() < 1e-9);
    let verdict = decide(&outcome, 2, 1, None, &policy(2));
    assert_eq!(verdict.decision, Decision::ProceedToApproval);
}

#[test]
fn single_participant_escalates_for_insufficient_data() {
    let outcome = engine().score(&[participant(
        Role::PlannerPrimary,
        vec![finding("security", "auth.go", Severity::High)],
    )]);
    assert!(!outcome.comparable);

    let verdict = decide(&outcome, 1, 1, None, &policy(2));
    assert_eq!(verdict.decision, Decision::Escalate);
    assert_eq!(verdict.reason, Some(EscalationReason::InsufficientData));

    let verdict = decide(&engine().score(&[]), 0, 1, None, &policy(2));
    assert_eq!(verdict.reason, Some(EscalationReason::AllRunsFailed));
}

#[test]
fn low_score_continues_then_exhausts_budget() {
    let outcome = engine().score(&partial_overlap());
    let first = decide(&outcome, 2, 1, None, &policy(2));
    assert_eq!(first.decision, Decision::ContinueDebate);

    let last = decide(&outcome, 2, 2, Some(outcome.score), &policy(2));
    assert_eq!(last.decision, Decision::Escalate);
    assert_eq!(last.reason, Some(EscalationReason::RoundBudgetExhausted));
}

#[test]
fn flat_score_between_rounds_is_stagnation() {
    let outcome = engine().score(&partial_overlap());
    let verdict = decide(&outcome, 2, 2, Some(outcome.score - 1.0), &policy(3));
    assert_eq!(verdict.reason, Some(EscalationReason::Stagnation));

    let verdict = decide(&outcome, 2, 2, Some(outcome.score + 10.0), &policy(3));
    assert_eq!(verdict.reason, Some(EscalationReason::Regression));
}
