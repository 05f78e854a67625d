//! Engine configuration.
//!
//! An [`EngineConfig`] is built once (defaults, then an optional TOML file,
//! then `DEBATE_*` environment overrides), validated, and handed to the
//! coordinator, consensus engine and workers behind an `Arc`. Nothing reads
//! configuration from ambient state after construction.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use debate_state::{Complexity, Role};

use crate::error::{DebateError, Result};

/// Factor weights of the consensus score. Must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusWeights {
    pub category: f64,
    pub file_path: f64,
    pub severity: f64,
    pub explicit: f64,
}

impl Default for ConsensusWeights {
    fn default() -> Self {
        Self {
            category: 0.40,
            file_path: 0.30,
            severity: 0.10,
            explicit: 0.20,
        }
    }
}

impl ConsensusWeights {
    pub fn validate(&self) -> Result<()> {
        let all = [self.category, self.file_path, self.severity, self.explicit];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(DebateError::Config(
                "consensus weights must be finite and non-negative".into(),
            ));
        }
        let sum: f64 = all.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(DebateError::Config(format!(
                "consensus weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Score at or above which a round proceeds to approval.
    pub threshold: f64,
    pub weights: ConsensusWeights,
    /// Minimum round-over-round improvement before a debate counts as stagnant.
    pub stagnation_delta: f64,
    /// Maximum recommendations carried into the synthesized plan.
    pub max_agreed_items: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: 80.0,
            weights: ConsensusWeights::default(),
            stagnation_delta: 5.0,
            max_agreed_items: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    pub standard_max_rounds: u32,
    /// Added to `standard_max_rounds` for complex tasks.
    pub complex_extra_rounds: u32,
    /// Multiplier on `stagnation_delta` for complex tasks.
    pub complex_delta_factor: f64,
    /// Roles dispatched in parallel every analysis round.
    pub analysis_roles: Vec<Role>,
    /// Run the explorer role before scoping.
    pub explore: bool,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            standard_max_rounds: 2,
            complex_extra_rounds: 1,
            complex_delta_factor: 2.0,
            analysis_roles: vec![Role::PlannerPrimary, Role::PlannerSecondary],
            explore: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Hard per-run limit on one executor call.
    pub agent_secs: u64,
    /// Round barrier deadline.
    pub round_secs: u64,
    /// Bound on the sum of all rounds of one debate window.
    pub debate_secs: u64,
    /// Added to the agent timeout to form the claim TTL.
    pub claim_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agent_secs: 300,
            round_secs: 720,
            debate_secs: 1800,
            claim_grace_secs: 30,
        }
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_depth: usize,
    /// How long a worker blocks on an empty stream before re-checking.
    pub poll_interval_ms: u64,
    /// Deliveries fetched per read.
    pub batch_size: usize,
    /// Cap on deliveries of one entry before it is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: 100,
            poll_interval_ms: 2_000,
            batch_size: 1,
            max_deliveries: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Classify and record, but route every task as `standard`.
    pub shadow_mode: bool,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self { shadow_mode: true }
    }
}

/// Fixed-window request budget per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_secs: u64,
    /// Budget for agents without an entry in `agents`.
    pub default_requests: u32,
    /// Requests per window, keyed by agent name.
    pub agents: BTreeMap<String, u32>,
    /// How long a claimed run waits for budget before it is retried later.
    pub wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 60,
            default_requests: 10,
            agents: BTreeMap::from([
                ("debate_gemini".to_string(), 60),
                ("debate_claude".to_string(), 40),
                ("debate_codex".to_string(), 60),
            ]),
            wait_secs: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn requests_for(&self, agent: &str) -> u32 {
        self.agents
            .get(agent)
            .copied()
            .unwrap_or(self.default_requests)
    }
}

/// Which agent and model fulfil a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSettings {
    pub agent: String,
    pub model: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Roles the engine dispatches: the analysis pair and the explorer.
fn default_roles() -> BTreeMap<Role, RoleSettings> {
    let gemini = |agent: &str| RoleSettings {
        agent: agent.to_string(),
        model: "google/gemini-3-pro-high".to_string(),
        timeout_secs: None,
    };
    let claude = RoleSettings {
        agent: "debate_claude".to_string(),
        model: "anthropic/claude-sonnet-4-5".to_string(),
        timeout_secs: None,
    };
    BTreeMap::from([
        (Role::PlannerPrimary, gemini("debate_gemini")),
        (Role::PlannerSecondary, claude),
        (Role::Explorer, gemini("debate_gemini")),
    ])
}

/// Role entries in a file overlay the defaults rather than replace them.
fn overlay_roles<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<Role, RoleSettings>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let overrides = BTreeMap::<Role, RoleSettings>::deserialize(deserializer)?;
    let mut roles = default_roles();
    roles.extend(overrides);
    Ok(roles)
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub consensus: ConsensusConfig,
    pub rounds: RoundConfig,
    pub timeouts: TimeoutConfig,
    /// Agent-run retries in the dispatcher.
    pub retry: RetryConfig,
    /// Store and queue call retries.
    pub storage_retry: RetryConfig,
    pub queue: QueueConfig,
    pub triage: TriageConfig,
    pub rate_limits: RateLimitConfig,
    pub workers: usize,
    #[serde(deserialize_with = "overlay_roles")]
    pub roles: BTreeMap<Role, RoleSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            consensus: ConsensusConfig::default(),
            rounds: RoundConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            storage_retry: RetryConfig {
                max_attempts: 5,
                base_delay_ms: 100,
                max_delay_ms: 5_000,
            },
            queue: QueueConfig::default(),
            triage: TriageConfig::default(),
            rate_limits: RateLimitConfig::default(),
            workers: 4,
            roles: default_roles(),
        }
    }
}

/// Round policy derived from a task's complexity tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundPolicy {
    pub max_rounds: u32,
    pub threshold: f64,
    pub stagnation_delta: f64,
    /// Trivial tasks get one single-role round.
    pub fast_track: bool,
}

fn env_value<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| DebateError::Config(format!("{key}: cannot parse {raw:?}"))),
        Err(_) => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(DebateError::Config(format!("{key}: expected a boolean, got {raw:?}"))),
        },
        Err(_) => Ok(None),
    }
}

impl EngineConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(raw).map_err(|e| DebateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overlaid with `path` (if given) and then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    DebateError::Config(format!("cannot read {}: {e}", p.display()))
                })?;
                toml::from_str(&raw).map_err(|e| DebateError::Config(e.to_string()))?
            }
            None => EngineConfig::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Apply `DEBATE_*` overrides.
    ///
    /// Reads:
    /// - DEBATE_CONSENSUS_THRESHOLD, DEBATE_STAGNATION_DELTA
    /// - DEBATE_MAX_ROUNDS (standard tier)
    /// - DEBATE_AGENT_TIMEOUT, DEBATE_ROUND_TIMEOUT, DEBATE_DEBATE_TIMEOUT (seconds)
    /// - DEBATE_MAX_RETRIES
    /// - DEBATE_TRIAGE_SHADOW_MODE
    /// - DEBATE_QUEUE_MAX_DEPTH, DEBATE_WORKERS
    /// - DEBATE_RATE_LIMIT_ENABLED
    /// - DEBATE_ROLE_<ROLE>_AGENT, DEBATE_ROLE_<ROLE>_MODEL
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_value("DEBATE_CONSENSUS_THRESHOLD")? {
            self.consensus.threshold = v;
        }
        if let Some(v) = env_value("DEBATE_STAGNATION_DELTA")? {
            self.consensus.stagnation_delta = v;
        }
        if let Some(v) = env_value("DEBATE_MAX_ROUNDS")? {
            self.rounds.standard_max_rounds = v;
        }
        if let Some(v) = env_value("DEBATE_AGENT_TIMEOUT")? {
            self.timeouts.agent_secs = v;
        }
        if let Some(v) = env_value("DEBATE_ROUND_TIMEOUT")? {
            self.timeouts.round_secs = v;
        }
        if let Some(v) = env_value("DEBATE_DEBATE_TIMEOUT")? {
            self.timeouts.debate_secs = v;
        }
        if let Some(v) = env_value("DEBATE_MAX_RETRIES")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_bool("DEBATE_TRIAGE_SHADOW_MODE")? {
            self.triage.shadow_mode = v;
        }
        if let Some(v) = env_value("DEBATE_QUEUE_MAX_DEPTH")? {
            self.queue.max_depth = v;
        }
        if let Some(v) = env_value("DEBATE_WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = env_bool("DEBATE_RATE_LIMIT_ENABLED")? {
            self.rate_limits.enabled = v;
        }
        for role in Role::ALL {
            let prefix = format!("DEBATE_ROLE_{}", role.as_str().to_ascii_uppercase());
            let agent = std::env::var(format!("{prefix}_AGENT")).ok();
            let model = std::env::var(format!("{prefix}_MODEL")).ok();
            if agent.is_none() && model.is_none() {
                continue;
            }
            let entry = self.roles.entry(role).or_insert_with(|| RoleSettings {
                agent: role.as_str().to_string(),
                model: String::new(),
                timeout_secs: None,
            });
            if let Some(agent) = agent {
                entry.agent = agent;
            }
            if let Some(model) = model {
                entry.model = model;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.consensus.weights.validate()?;
        if !(0.0..=100.0).contains(&self.consensus.threshold) {
            return Err(DebateError::Config(format!(
                "consensus threshold must be within 0..=100, got {}",
                self.consensus.threshold
            )));
        }
        if self.consensus.stagnation_delta < 0.0 || self.rounds.complex_delta_factor < 0.0 {
            return Err(DebateError::Config(
                "stagnation delta and its factor must be non-negative".into(),
            ));
        }
        if self.rounds.standard_max_rounds == 0 {
            return Err(DebateError::Config("max rounds must be at least 1".into()));
        }
        let mut roles = self.rounds.analysis_roles.clone();
        roles.sort();
        roles.dedup();
        if roles.len() < 2 || roles.len() != self.rounds.analysis_roles.len() {
            return Err(DebateError::Config(
                "analysis rounds need at least two distinct roles".into(),
            ));
        }
        for role in self.rounds.analysis_roles.iter().chain(
            self.rounds
                .explore
                .then_some(&Role::Explorer)
                .into_iter(),
        ) {
            match self.roles.get(role) {
                Some(s) if !s.model.is_empty() && !s.agent.is_empty() => {}
                _ => {
                    return Err(DebateError::Config(format!(
                        "role {role} has no agent/model configured"
                    )))
                }
            }
        }
        if self.timeouts.agent_secs == 0
            || self.timeouts.round_secs == 0
            || self.timeouts.debate_secs == 0
        {
            return Err(DebateError::Config("timeouts must be positive".into()));
        }
        if self.retry.max_attempts == 0 || self.storage_retry.max_attempts == 0 {
            return Err(DebateError::Config("retry attempts must be at least 1".into()));
        }
        if self.rate_limits.enabled
            && (self.rate_limits.window_secs == 0
                || self.rate_limits.default_requests == 0
                || self.rate_limits.agents.values().any(|n| *n == 0))
        {
            return Err(DebateError::Config(
                "rate limit windows and budgets must be positive".into(),
            ));
        }
        if self.workers == 0 || self.queue.batch_size == 0 || self.queue.max_depth == 0 {
            return Err(DebateError::Config(
                "workers, batch size and queue depth must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Policy for a task routed at `complexity`.
    pub fn round_policy(&self, complexity: Complexity) -> RoundPolicy {
        let base = RoundPolicy {
            max_rounds: self.rounds.standard_max_rounds,
            threshold: self.consensus.threshold,
            stagnation_delta: self.consensus.stagnation_delta,
            fast_track: false,
        };
        match complexity {
            Complexity::Trivial => RoundPolicy {
                max_rounds: 1,
                fast_track: true,
                ..base
            },
            Complexity::Standard => base,
            Complexity::Complex => RoundPolicy {
                max_rounds: base.max_rounds + self.rounds.complex_extra_rounds,
                stagnation_delta: base.stagnation_delta * self.rounds.complex_delta_factor,
                ..base
            },
        }
    }

    pub fn role(&self, role: Role) -> Option<&RoleSettings> {
        self.roles.get(&role)
    }

    /// Hard limit on one executor call for `role`.
    pub fn run_timeout(&self, role: Role) -> Duration {
        let secs = self
            .role(role)
            .and_then(|s| s.timeout_secs)
            .unwrap_or(self.timeouts.agent_secs);
        Duration::from_secs(secs)
    }

    /// Claim TTL: the longest run timeout plus grace, so a live run never
    /// loses its claim.
    pub fn claim_ttl(&self) -> Duration {
        let longest = Role::ALL
            .into_iter()
            .map(|r| self.run_timeout(r))
            .max()
            .unwrap_or(Duration::from_secs(self.timeouts.agent_secs));
        longest + Duration::from_secs(self.timeouts.claim_grace_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.round_secs)
    }

    pub fn debate_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.debate_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }
}
