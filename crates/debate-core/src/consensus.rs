//! Weighted consensus scoring.
//!
//! [`ConsensusEngine::score`] is a pure function of the participants' persisted
//! findings, recommendations and explicit agreement references. Four factors
//! are scored on `0..=100` and blended with the configured weights:
//!
//! | factor    | measure                                                        |
//! |-----------|----------------------------------------------------------------|
//! | category  | mean pairwise Jaccard of distinct categories                   |
//! | file_path | mean pairwise Jaccard of distinct file paths                   |
//! | severity  | share of shared `(file, category)` keys with one severity; 100 when nothing is shared |
//! | explicit  | share of declared references that are corroborated agreements  |
//!
//! All collections are ordered (`BTreeSet`/`BTreeMap`) so identical inputs
//! produce bit-identical output.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use debate_state::{
    AgentRunRecord, AgreementRef, ConsensusFactor, Disagreement, FactorScore, FindingRecord,
    Role, Severity, Stance,
};

use crate::config::{ConsensusConfig, ConsensusWeights};

/// A finding as seen by the scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredFinding {
    pub category: String,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub agreement_refs: Vec<AgreementRef>,
}

impl From<&FindingRecord> for ScoredFinding {
    fn from(f: &FindingRecord) -> Self {
        Self {
            category: f.category.clone(),
            file_path: f.file_path.clone(),
            severity: f.severity,
            agreement_refs: f.agreement_refs.clone(),
        }
    }
}

/// One role's result set for a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub role: Role,
    #[serde(default)]
    pub findings: Vec<ScoredFinding>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub explicit_agreements: Vec<AgreementRef>,
}

impl Participant {
    /// Build from a completed agent run and its persisted findings.
    pub fn from_run(run: &AgentRunRecord, findings: &[FindingRecord]) -> Self {
        Self {
            role: run.role,
            findings: findings.iter().map(ScoredFinding::from).collect(),
            recommendations: run.recommendations.clone(),
            explicit_agreements: run.explicit_agreements.clone(),
        }
    }
}

/// Score, breakdown and synthesis of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub score: f64,
    pub breakdown: Vec<FactorScore>,
    pub participants: Vec<Role>,
    /// `false` when fewer than two participants produced output.
    pub comparable: bool,
    pub disagreements: Vec<Disagreement>,
    /// De-duplicated recommendations, sorted, capped.
    pub agreed_items: Vec<String>,
}

impl ConsensusOutcome {
    pub fn factor(&self, factor: ConsensusFactor) -> Option<&FactorScore> {
        self.breakdown.iter().find(|f| f.factor == factor)
    }

    /// The factor with the lowest raw agreement, first in factor order on ties.
    pub fn weakest_factor(&self) -> Option<&FactorScore> {
        self.breakdown.iter().fold(None, |acc: Option<&FactorScore>, f| match acc {
            Some(best) if best.raw <= f.raw => Some(best),
            _ => Some(f),
        })
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / union as f64 * 100.0
}

/// Mean Jaccard over every unordered pair of sets.
fn mean_pairwise_jaccard(sets: &[BTreeSet<String>]) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0u32;
    for (i, a) in sets.iter().enumerate() {
        for b in &sets[i + 1..] {
            total += jaccard(a, b);
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        total / f64::from(pairs)
    }
}

/// Values raised by some but not all participants.
fn partial_items(sets: &[BTreeSet<String>]) -> Vec<String> {
    let union: BTreeSet<&String> = sets.iter().flatten().collect();
    union
        .into_iter()
        .filter(|item| !sets.iter().all(|s| s.contains(*item)))
        .cloned()
        .collect()
}

type SeverityKey = (String, String);

fn severity_by_key(p: &Participant) -> BTreeMap<SeverityKey, Severity> {
    let mut out: BTreeMap<SeverityKey, Severity> = BTreeMap::new();
    for f in &p.findings {
        let Some(sev) = f.severity else { continue };
        let key = (
            f.file_path.as_deref().map(normalize).unwrap_or_default(),
            normalize(&f.category),
        );
        // Keep the most severe rating a participant gave the key.
        out.entry(key)
            .and_modify(|s| *s = (*s).min(sev))
            .or_insert(sev);
    }
    out
}

fn all_refs(p: &Participant) -> BTreeSet<(String, Stance)> {
    p.explicit_agreements
        .iter()
        .chain(p.findings.iter().flat_map(|f| f.agreement_refs.iter()))
        .map(|r| (normalize(&r.topic), r.stance))
        .collect()
}

/// Pure, deterministic consensus scorer.
#[derive(Debug, Clone)]
pub struct ConsensusEngine {
    weights: ConsensusWeights,
    max_agreed_items: usize,
}

impl ConsensusEngine {
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            weights: config.weights,
            max_agreed_items: config.max_agreed_items,
        }
    }

    fn weight(&self, factor: ConsensusFactor) -> f64 {
        match factor {
            ConsensusFactor::Category => self.weights.category,
            ConsensusFactor::FilePath => self.weights.file_path,
            ConsensusFactor::Severity => self.weights.severity,
            ConsensusFactor::Explicit => self.weights.explicit,
        }
    }

    fn agreed_items(&self, participants: &[Participant]) -> Vec<String> {
        let items: BTreeSet<String> = participants
            .iter()
            .flat_map(|p| p.recommendations.iter())
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        items.into_iter().take(self.max_agreed_items).collect()
    }

    /// Score a round from its participants' result sets.
    pub fn score(&self, participants: &[Participant]) -> ConsensusOutcome {
        let roles: Vec<Role> = participants.iter().map(|p| p.role).collect();
        let agreed_items = self.agreed_items(participants);

        let has_findings = participants.iter().any(|p| !p.findings.is_empty());
        if participants.len() < 2 || !has_findings {
            return ConsensusOutcome {
                score: 0.0,
                breakdown: self.breakdown(|_| 0.0),
                participants: roles,
                comparable: participants.len() >= 2,
                disagreements: Vec::new(),
                agreed_items,
            };
        }

        let categories: Vec<BTreeSet<String>> = participants
            .iter()
            .map(|p| p.findings.iter().map(|f| normalize(&f.category)).collect())
            .collect();
        let files: Vec<BTreeSet<String>> = participants
            .iter()
            .map(|p| {
                p.findings
                    .iter()
                    .filter_map(|f| f.file_path.as_deref().map(normalize))
                    .collect()
            })
            .collect();

        let (severity, severity_conflicts) = Self::severity_agreement(participants);
        let (explicit, explicit_conflicts) = Self::explicit_agreement(participants);
        let category = mean_pairwise_jaccard(&categories);
        let file_path = mean_pairwise_jaccard(&files);

        let breakdown = self.breakdown(|factor| match factor {
            ConsensusFactor::Category => category,
            ConsensusFactor::FilePath => file_path,
            ConsensusFactor::Severity => severity,
            ConsensusFactor::Explicit => explicit,
        });
        let score = breakdown
            .iter()
            .map(|f| f.weighted)
            .sum::<f64>()
            .clamp(0.0, 100.0);

        let disagreements = [
            (ConsensusFactor::Category, partial_items(&categories)),
            (ConsensusFactor::FilePath, partial_items(&files)),
            (ConsensusFactor::Severity, severity_conflicts),
            (ConsensusFactor::Explicit, explicit_conflicts),
        ]
        .into_iter()
        .filter(|(_, items)| !items.is_empty())
        .map(|(factor, items)| Disagreement { factor, items })
        .collect();

        ConsensusOutcome {
            score,
            breakdown,
            participants: roles,
            comparable: true,
            disagreements,
            agreed_items,
        }
    }

    fn breakdown(&self, raw: impl Fn(ConsensusFactor) -> f64) -> Vec<FactorScore> {
        ConsensusFactor::ALL
            .into_iter()
            .map(|factor| {
                let raw = raw(factor).clamp(0.0, 100.0);
                let weight = self.weight(factor);
                FactorScore {
                    factor,
                    raw,
                    weight,
                    weighted: raw * weight,
                }
            })
            .collect()
    }

    fn severity_agreement(participants: &[Participant]) -> (f64, Vec<String>) {
        let per_participant: Vec<BTreeMap<SeverityKey, Severity>> =
            participants.iter().map(severity_by_key).collect();

        let mut ratings: BTreeMap<&SeverityKey, BTreeSet<Severity>> = BTreeMap::new();
        let mut raised_by: BTreeMap<&SeverityKey, usize> = BTreeMap::new();
        for map in &per_participant {
            for (key, sev) in map {
                ratings.entry(key).or_default().insert(*sev);
                *raised_by.entry(key).or_default() += 1;
            }
        }

        let shared: Vec<&SeverityKey> = raised_by
            .iter()
            .filter(|(_, n)| **n >= 2)
            .map(|(k, _)| *k)
            .collect();
        if shared.is_empty() {
            return (100.0, Vec::new());
        }

        let mut conflicts = Vec::new();
        let mut agreeing = 0usize;
        for key in &shared {
            let sevs = &ratings[*key];
            if sevs.len() == 1 {
                agreeing += 1;
            } else {
                let listed: Vec<&str> = sevs.iter().map(|s| s.as_str()).collect();
                let (file, category) = key;
                conflicts.push(format!("{file}:{category} ({})", listed.join(" vs ")));
            }
        }
        (agreeing as f64 / shared.len() as f64 * 100.0, conflicts)
    }

    fn explicit_agreement(participants: &[Participant]) -> (f64, Vec<String>) {
        let refs: Vec<BTreeSet<(String, Stance)>> = participants.iter().map(all_refs).collect();
        let total: usize = refs.iter().map(BTreeSet::len).sum();
        if total == 0 {
            return (0.0, Vec::new());
        }

        let mut corroborated = 0usize;
        let mut contested: BTreeSet<String> = BTreeSet::new();
        for (i, own) in refs.iter().enumerate() {
            for (topic, stance) in own {
                let contradicted = refs
                    .iter()
                    .enumerate()
                    .any(|(j, other)| j != i && other.contains(&(topic.clone(), Stance::Disagree)));
                match stance {
                    Stance::Agree if !contradicted => corroborated += 1,
                    _ => {
                        contested.insert(topic.clone());
                    }
                }
            }
        }
        (
            corroborated as f64 / total as f64 * 100.0,
            contested.into_iter().collect(),
        )
    }
}
