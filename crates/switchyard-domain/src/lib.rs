#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub Ulid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of response-generating capabilities the planner may route to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRole {
    General,
    Retrieval,
    Critic,
}

impl CapabilityRole {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "general" | "general_agent" => Some(Self::General),
            "retrieval" | "retrieval_agent" => Some(Self::Retrieval),
            "critic" | "critic_agent" => Some(Self::Critic),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Retrieval => "retrieval",
            Self::Critic => "critic",
        }
    }
}

impl std::fmt::Display for CapabilityRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no capability found for role '{0}'")]
    NoCapability(CapabilityRole),
    #[error("no tool found named '{0}'")]
    NoTool(String),
    #[error("tool '{tool}' is not allow-listed for capability '{role}'")]
    ToolNotAllowed { role: CapabilityRole, tool: String },
}

/// Base routing decision. Produced exactly once per request, never revised.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RoutingDecision {
    pub role: CapabilityRole,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyHint {
    CostSensitive,
    QualitySensitive,
    LatencySensitive,
    ReviewRecommended,
    PreferCostEfficient,
    PreferQuality,
    PreferFast,
}

impl PolicyHint {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CostSensitive => "cost_sensitive",
            Self::QualitySensitive => "quality_sensitive",
            Self::LatencySensitive => "latency_sensitive",
            Self::ReviewRecommended => "review_recommended",
            Self::PreferCostEfficient => "prefer_cost_efficient",
            Self::PreferQuality => "prefer_quality",
            Self::PreferFast => "prefer_fast",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Standard,
    Premium,
}

impl Tier {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "free" => Some(Self::Free),
            "standard" => Some(Self::Standard),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Premium => "premium",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of an enforcement decision taken by the policy-hint layer.
/// Observational only; the routed capability is never changed by it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EnforcementRecord {
    pub rule_id: String,
    pub applied: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CanaryRecord {
    pub eligible: bool,
    pub sampled: bool,
    pub tier: Tier,
}

/// Routing decision enriched with policy hints and enforcement facts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedRoutingDecision {
    pub decision: RoutingDecision,
    pub policy_hint: Option<PolicyHint>,
    pub policy_influenced: bool,
    pub enforcement: Option<EnforcementRecord>,
    pub enforcement_skipped: bool,
    pub canary: Option<CanaryRecord>,
}

impl EnrichedRoutingDecision {
    #[must_use]
    pub fn unenriched(decision: RoutingDecision) -> Self {
        Self {
            decision,
            policy_hint: None,
            policy_influenced: false,
            enforcement: None,
            enforcement_skipped: false,
            canary: None,
        }
    }

    /// Routing metadata in the shape persisted on traces.
    #[must_use]
    pub fn to_metadata(&self) -> Value {
        let mut meta = json!({
            "selected_capability": self.decision.role.as_str(),
            "reason": self.decision.reason,
            "policy_hint": self.policy_hint.map(PolicyHint::as_str),
            "policy_influenced": self.policy_influenced,
            "enforcement_skipped": self.enforcement_skipped,
            "canary": self.canary,
        });
        if let (Some(map), Some(enforcement)) = (meta.as_object_mut(), &self.enforcement) {
            map.insert(
                "policy_enforcement".to_string(),
                json!({
                    "type": enforcement.rule_id,
                    "applied": enforcement.applied,
                    "reason": enforcement.reason,
                }),
            );
        }
        meta
    }
}

/// Write-once audit record of an enforcement or canary-skip decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnforcementAudit {
    pub rule_id: String,
    pub action: String,
    pub trigger_reason: String,
    pub applied: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: DateTimeUtc,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// One declared unit of work inside an [`ExecutionPlan`].
///
/// `depends_on` is recorded for audit but does not reorder execution;
/// steps run strictly in list order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub step_id: u32,
    pub role: CapabilityRole,
    pub intent: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub input: Option<Value>,
}

/// Immutable once constructed; created once per request, never mutated
/// by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub task_type: String,
    pub rationale: String,
    pub estimated_complexity: f64,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    #[must_use]
    pub fn new(task_type: &str, rationale: &str, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: Ulid::new().to_string(),
            task_type: task_type.to_string(),
            rationale: rationale.to_string(),
            estimated_complexity: 0.5,
            steps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step_id: u32,
    pub role: CapabilityRole,
    pub status: StepStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub metadata: Value,
}

/// Final output of one plan execution. The overall status is derived:
/// failed iff any step failed, completed otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub plan_id: String,
    pub status: StepStatus,
    pub step_results: Vec<StepResult>,
    pub final_output: Option<String>,
    #[serde(default)]
    pub trace: Value,
}

impl ExecutionResult {
    #[must_use]
    pub fn from_steps(
        plan_id: &str,
        step_results: Vec<StepResult>,
        final_output: Option<String>,
        trace: Value,
    ) -> Self {
        let status = if step_results
            .iter()
            .any(|step| step.status == StepStatus::Failed)
        {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        Self {
            plan_id: plan_id.to_string(),
            status,
            step_results,
            final_output,
            trace,
        }
    }
}

/// Canonical result of the simple execution flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityResult {
    pub capability: CapabilityRole,
    pub output: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Value,
}

impl CapabilityResult {
    /// Merge a metadata subtree under `key`, creating the object root
    /// if the current metadata is not an object.
    pub fn merge_metadata(&mut self, key: &str, value: Value) {
        if !self.metadata.is_object() {
            self.metadata = Value::Object(serde_json::Map::default());
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Proceed,
    Warn,
    Block,
}

impl Recommendation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Warn => "warn",
            Self::Block => "block",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidatedClaim {
    pub claim_text: String,
    pub is_grounded: bool,
    pub confidence: f64,
    pub supporting_chunk_ids: Vec<String>,
}

/// Structured verdict from the critic. `is_safe` is derived from the
/// recommendation at construction and is never an independent input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriticReport {
    pub is_safe: bool,
    pub risk_level: RiskLevel,
    pub issues: Vec<String>,
    pub recommendation: Recommendation,
    pub validated_claims: Vec<ValidatedClaim>,
    pub grounding_score: f64,
    pub confidence_score: f64,
}

impl CriticReport {
    #[must_use]
    pub fn new(
        risk_level: RiskLevel,
        issues: Vec<String>,
        recommendation: Recommendation,
        validated_claims: Vec<ValidatedClaim>,
        grounding_score: f64,
        confidence_score: f64,
    ) -> Self {
        Self {
            is_safe: recommendation == Recommendation::Proceed,
            risk_level,
            issues,
            recommendation,
            validated_claims,
            grounding_score,
            confidence_score,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyStatus {
    Pass,
    Warn,
    Fail,
    Error,
}

impl PolicyStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyViolation {
    HighCost,
    LowScore,
    HighLatency,
    InvalidOutput,
    EvaluationError,
}

impl PolicyViolation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HighCost => "high_cost",
            Self::LowScore => "low_score",
            Self::HighLatency => "high_latency",
            Self::InvalidOutput => "invalid_output",
            Self::EvaluationError => "evaluation_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyWarning {
    ElevatedCost,
    MarginalScore,
    ElevatedLatency,
}

impl PolicyWarning {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ElevatedCost => "elevated_cost",
            Self::MarginalScore => "marginal_score",
            Self::ElevatedLatency => "elevated_latency",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyResult {
    pub status: PolicyStatus,
    pub violations: Vec<PolicyViolation>,
    pub warnings: Vec<PolicyWarning>,
    pub checked_rules: u32,
}

impl PolicyResult {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            status: PolicyStatus::Pass,
            violations: Vec::new(),
            warnings: Vec::new(),
            checked_rules: 0,
        }
    }
}

/// Immutable trace of a single request execution. Created once after
/// execution completes (success or failure) and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTrace {
    pub request_id: String,
    pub capability_name: String,
    pub success: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: DateTimeUtc,
    #[serde(default)]
    pub metadata: Value,
    pub error: Option<String>,
}

impl ExecutionTrace {
    #[must_use]
    pub fn latency_ms(&self) -> u64 {
        let millis = (self.finished_at - self.started_at).whole_milliseconds();
        u64::try_from(millis).unwrap_or(0)
    }
}

/// One line of the append-only evaluation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationRecord {
    pub request_id: String,
    pub capability_name: String,
    pub timestamp: String,
    pub latency_ms: u64,
    pub model: String,
    pub evaluation_score: Option<f64>,
    pub validation_valid: Option<bool>,
    pub success: bool,
    pub routing_reason: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub estimated_cost_usd: Option<f64>,
    #[serde(default)]
    pub policy_status: Option<PolicyStatus>,
}

/// Offline comparison of simulated vs observed enforcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriftReport {
    pub tier: Tier,
    pub predicted_enforcements: u32,
    pub actual_enforcements: u32,
    pub cost_error_pct: f64,
    pub score_error: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GraduationRecommendation {
    Graduate,
    Hold,
    Rollback,
}

impl GraduationRecommendation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Graduate => "GRADUATE",
            Self::Hold => "HOLD",
            Self::Rollback => "ROLLBACK",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraduationResult {
    pub rule: String,
    pub tier: Tier,
    pub recommendation: GraduationRecommendation,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: DateTimeUtc,
}

impl Turn {
    #[must_use]
    pub fn to_prompt_format(&self) -> String {
        let prefix = match self.role {
            TurnRole::User => "User:",
            TurnRole::Assistant => "Assistant:",
        };
        format!("{prefix} {}", self.content)
    }
}

/// Per-session bounded conversation context. Owned exclusively by the
/// session store; nothing else holds a reference into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionContext {
    pub session_id: String,
    pub turns: Vec<Turn>,
    pub max_turns: usize,
}

impl SessionContext {
    #[must_use]
    pub fn new(session_id: &str, max_turns: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            turns: Vec::new(),
            max_turns,
        }
    }

    pub fn add_turn(&mut self, role: TurnRole, content: &str) {
        self.turns.push(Turn {
            role,
            content: content.to_string(),
            timestamp: now_utc(),
        });
        if self.turns.len() > self.max_turns {
            let excess = self.turns.len() - self.max_turns;
            self.turns.drain(..excess);
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    #[must_use]
    pub fn to_prompt_context(&self) -> String {
        if self.turns.is_empty() {
            return String::new();
        }
        let mut lines = vec!["[Previous conversation:]".to_string()];
        for turn in &self.turns {
            lines.push(turn.to_prompt_format());
        }
        lines.push("[Current request:]".to_string());
        lines.join("\n")
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Format a timestamp as RFC3339.
///
/// # Errors
/// Returns an error if the value cannot be formatted.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 value: {err}"))
}

#[must_use]
pub fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Deterministic 0..=99 bucket for a piece of text. Same input always
/// yields the same bucket; distinct inputs spread uniformly.
#[must_use]
pub fn stable_bucket(input: &str) -> u8 {
    let digest = Sha256::digest(input.as_bytes());
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u8::try_from(u64::from_be_bytes(prefix) % 100).unwrap_or(0)
}

/// Structured capture of a degraded optional operation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OpError {
    pub op: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct Recovered<T> {
    pub value: T,
    pub degraded: Option<OpError>,
}

/// Run a side computation that is optional to the primary answer,
/// falling back to a default on any error. The degradation is captured
/// with its operation name so callers can record it in metadata.
pub fn recover<T>(
    op: &'static str,
    fallback: impl FnOnce() -> T,
    action: impl FnOnce() -> Result<T>,
) -> Recovered<T> {
    match action() {
        Ok(value) => Recovered {
            value,
            degraded: None,
        },
        Err(err) => {
            let message = format!("{err:#}");
            tracing::warn!(op, error = %message, "optional step degraded to default");
            Recovered {
                value: fallback(),
                degraded: Some(OpError { op, message }),
            }
        }
    }
}
