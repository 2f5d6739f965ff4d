#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchyard_domain::{
    stable_bucket, CanaryRecord, DriftReport, EnforcementAudit, EvaluationRecord,
    GraduationRecommendation, GraduationResult, PolicyResult, PolicyStatus, PolicyViolation,
    PolicyWarning, Tier,
};

/// Tunable thresholds for the read-only policy evaluator. All values
/// can change through configuration without code changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_cost_usd: f64,
    pub warn_cost_usd: f64,
    pub min_evaluation_score: f64,
    pub warn_evaluation_score: f64,
    pub max_latency_ms: u64,
    pub warn_latency_ms: u64,
    pub require_valid_output: bool,
    pub enabled: bool,
    pub cost_policy_enabled: bool,
    pub score_policy_enabled: bool,
    pub latency_policy_enabled: bool,
    pub validation_policy_enabled: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: 0.001,
            warn_cost_usd: 0.0005,
            min_evaluation_score: 0.5,
            warn_evaluation_score: 0.6,
            max_latency_ms: 30_000,
            warn_latency_ms: 10_000,
            require_valid_output: true,
            enabled: true,
            cost_policy_enabled: true,
            score_policy_enabled: true,
            latency_policy_enabled: true,
            validation_policy_enabled: true,
        }
    }
}

impl PolicyConfig {
    /// Load thresholds from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy config {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse policy config {}", path.display()))
    }
}

/// Evaluate trace metadata against the configured thresholds.
///
/// Read-only and total: observes, never acts, never returns an error.
/// An internal fault degrades to an `error`-status result with a
/// synthetic violation so downstream consumers always see a value.
#[must_use]
pub fn evaluate_policy(metadata: &Value, config: &PolicyConfig) -> PolicyResult {
    if !config.enabled {
        return PolicyResult::pass();
    }

    match run_checks(metadata, config) {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "policy evaluation faulted");
            PolicyResult {
                status: PolicyStatus::Error,
                violations: vec![PolicyViolation::EvaluationError],
                warnings: Vec::new(),
                checked_rules: 0,
            }
        }
    }
}

fn run_checks(metadata: &Value, config: &PolicyConfig) -> Result<PolicyResult> {
    let mut violations = Vec::new();
    let mut warnings = Vec::new();
    let mut checked = 0_u32;

    if config.cost_policy_enabled {
        let cost = metadata
            .get("estimated_cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if cost > config.max_cost_usd {
            violations.push(PolicyViolation::HighCost);
        } else if cost > config.warn_cost_usd {
            warnings.push(PolicyWarning::ElevatedCost);
        }
        checked += 1;
    }

    if config.score_policy_enabled {
        let score = metadata
            .get("evaluation")
            .and_then(|evaluation| evaluation.get("score"))
            .and_then(Value::as_f64);
        if let Some(score) = score {
            if score < config.min_evaluation_score {
                violations.push(PolicyViolation::LowScore);
            } else if score < config.warn_evaluation_score {
                warnings.push(PolicyWarning::MarginalScore);
            }
        }
        checked += 1;
    }

    if config.latency_policy_enabled {
        let latency = metadata
            .get("latency_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if latency > config.max_latency_ms {
            violations.push(PolicyViolation::HighLatency);
        } else if latency > config.warn_latency_ms {
            warnings.push(PolicyWarning::ElevatedLatency);
        }
        checked += 1;
    }

    if config.validation_policy_enabled && config.require_valid_output {
        let is_valid = metadata
            .get("validation")
            .and_then(|validation| validation.get("is_valid"))
            .and_then(Value::as_bool);
        if is_valid == Some(false) {
            violations.push(PolicyViolation::InvalidOutput);
        }
        checked += 1;
    }

    let status = if violations.is_empty() {
        if warnings.is_empty() {
            PolicyStatus::Pass
        } else {
            PolicyStatus::Warn
        }
    } else {
        PolicyStatus::Fail
    };

    Ok(PolicyResult {
        status,
        violations,
        warnings,
        checked_rules: checked,
    })
}

/// Canary rollout parameters for a single enforcement rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CanaryConfig {
    pub enabled: bool,
    pub tier: Tier,
    pub percentage: u8,
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tier: Tier::Free,
            percentage: 5,
        }
    }
}

/// Enforcement switchboard: master kill switch, per-rule registry, and
/// the canary rollout configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnforcementConfig {
    pub enabled: bool,
    pub enabled_rules: BTreeSet<String>,
    pub canary: CanaryConfig,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        let mut enabled_rules = BTreeSet::new();
        enabled_rules.insert(COST_GUARD_RULE.to_string());
        Self {
            enabled: true,
            enabled_rules,
            canary: CanaryConfig::default(),
        }
    }
}

pub const COST_GUARD_RULE: &str = "cost_guard";

impl EnforcementConfig {
    /// A rule is active only when the master switch is on and the rule
    /// is registered.
    #[must_use]
    pub fn is_enabled(&self, rule_id: &str) -> bool {
        self.enabled && self.enabled_rules.contains(rule_id)
    }

    #[must_use]
    pub fn is_globally_disabled(&self) -> bool {
        !self.enabled
    }

    /// Load enforcement settings from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read enforcement config {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse enforcement config {}", path.display()))
    }
}

/// Decide canary admission for one request.
///
/// With the canary disabled every request is admitted. With it enabled
/// the request must match the target tier and fall into the sampled
/// percentage. Sampling hashes the prompt, so the same prompt always
/// lands in the same cohort.
#[must_use]
pub fn canary_decision(canary: &CanaryConfig, tier: Tier, prompt: &str) -> CanaryRecord {
    if !canary.enabled {
        return CanaryRecord {
            eligible: true,
            sampled: true,
            tier,
        };
    }
    if tier != canary.tier {
        return CanaryRecord {
            eligible: false,
            sampled: false,
            tier,
        };
    }
    let sampled = stable_bucket(prompt) < canary.percentage;
    CanaryRecord {
        eligible: true,
        sampled,
        tier,
    }
}

/// Limits associated with an SLA tier. `max_cost_usd == None` means
/// unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SlaLimits {
    pub max_cost_usd: Option<f64>,
}

#[must_use]
pub fn limits_for_tier(tier: Tier) -> SlaLimits {
    match tier {
        Tier::Free => SlaLimits {
            max_cost_usd: Some(0.000_05),
        },
        Tier::Standard => SlaLimits {
            max_cost_usd: Some(0.000_2),
        },
        Tier::Premium => SlaLimits { max_cost_usd: None },
    }
}

/// Classify a request into an SLA tier from its metadata. Unknown or
/// missing tiers default to free. Deterministic and fast.
#[must_use]
pub fn classify_tier(metadata: &Value) -> (Tier, SlaLimits) {
    let tier = metadata
        .get("tier")
        .and_then(Value::as_str)
        .and_then(Tier::parse)
        .unwrap_or(Tier::Free);
    (tier, limits_for_tier(tier))
}

/// Offline impact of applying one tier's cost limit to past traffic.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TierImpact {
    pub tier: Tier,
    pub total_requests: u32,
    pub would_warn: u32,
    pub would_enforce: u32,
    pub avg_cost_saved_usd: f64,
}

/// Replay evaluation records against a tier's cost limit.
///
/// A record is enforced only when it exceeds the limit AND its
/// recorded policy status was already warn or fail (selective
/// enforcement). Premium's unlimited tier never enforces.
#[must_use]
pub fn simulate_tier(records: &[EvaluationRecord], tier: Tier) -> TierImpact {
    let total = u32::try_from(records.len()).unwrap_or(u32::MAX);
    let Some(limit) = limits_for_tier(tier).max_cost_usd else {
        return TierImpact {
            tier,
            total_requests: total,
            would_warn: 0,
            would_enforce: 0,
            avg_cost_saved_usd: 0.0,
        };
    };

    let mut would_warn = 0_u32;
    let mut would_enforce = 0_u32;
    let mut total_savings = 0.0_f64;

    for record in records {
        let cost = record.estimated_cost_usd.unwrap_or(0.0);
        if cost > limit {
            would_warn += 1;
            if matches!(
                record.policy_status,
                Some(PolicyStatus::Warn | PolicyStatus::Fail)
            ) {
                would_enforce += 1;
                total_savings += cost - limit;
            }
        }
    }

    let avg_cost_saved_usd = if would_enforce > 0 {
        total_savings / f64::from(would_enforce)
    } else {
        0.0
    };

    TierImpact {
        tier,
        total_requests: total,
        would_warn,
        would_enforce,
        avg_cost_saved_usd,
    }
}

/// Compare predicted enforcement (simulation over canary-eligible
/// records) against enforcement that actually happened.
#[derive(Debug, Default)]
pub struct OutcomeValidator;

impl OutcomeValidator {
    #[must_use]
    pub fn validate(&self, records: &[EvaluationRecord], tier: Tier) -> DriftReport {
        let eligible: Vec<EvaluationRecord> = records
            .iter()
            .filter(|record| record.policy_status == Some(PolicyStatus::Warn))
            .cloned()
            .collect();

        if eligible.is_empty() {
            return DriftReport {
                tier,
                predicted_enforcements: 0,
                actual_enforcements: 0,
                cost_error_pct: 0.0,
                score_error: 0.0,
            };
        }

        let predicted = simulate_tier(&eligible, tier).would_enforce;
        let actual = eligible
            .iter()
            .filter(|record| {
                record
                    .routing_reason
                    .as_deref()
                    .is_some_and(|reason| reason.to_ascii_lowercase().contains("cost"))
            })
            .count();
        let actual = u32::try_from(actual).unwrap_or(u32::MAX);

        let cost_error_pct = if predicted > 0 {
            (f64::from(predicted) - f64::from(actual)) / f64::from(predicted) * 100.0
        } else {
            0.0
        };

        DriftReport {
            tier,
            predicted_enforcements: predicted,
            actual_enforcements: actual,
            // Actual-vs-expected scores are not persisted yet.
            cost_error_pct,
            score_error: 0.0,
        }
    }
}

/// Readiness thresholds for scaling enforcement up.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraduationThresholds {
    pub max_drift_pct: f64,
    pub min_success_rate: f64,
    pub max_score_delta: f64,
    pub max_critical_audits: u32,
}

impl Default for GraduationThresholds {
    fn default() -> Self {
        Self {
            max_drift_pct: 10.0,
            min_success_rate: 0.99,
            max_score_delta: 0.05,
            max_critical_audits: 0,
        }
    }
}

/// Offline evaluator deciding whether canary enforcement may graduate.
#[derive(Debug, Default)]
pub struct GraduationEvaluator {
    thresholds: GraduationThresholds,
}

impl GraduationEvaluator {
    #[must_use]
    pub fn new(thresholds: GraduationThresholds) -> Self {
        Self { thresholds }
    }

    /// Zero failed criteria graduates, exactly one holds, two or more
    /// roll back. Total over all inputs.
    #[must_use]
    pub fn evaluate(
        &self,
        drift_report: &DriftReport,
        audit_records: &[EnforcementAudit],
    ) -> GraduationResult {
        let mut reasons = Vec::new();

        if drift_report.cost_error_pct.abs() > self.thresholds.max_drift_pct {
            reasons.push(format!(
                "drift_exceeded ({:.1}% > {}%)",
                drift_report.cost_error_pct, self.thresholds.max_drift_pct
            ));
        }

        if drift_report.score_error.abs() > self.thresholds.max_score_delta {
            reasons.push(format!(
                "score_delta_exceeded ({:.3} > {})",
                drift_report.score_error, self.thresholds.max_score_delta
            ));
        }

        let critical_count = audit_records
            .iter()
            .filter(|audit| audit.action == "rollback" || audit.trigger_reason == "critical")
            .count();
        let critical_count = u32::try_from(critical_count).unwrap_or(u32::MAX);
        if critical_count > self.thresholds.max_critical_audits {
            reasons.push(format!(
                "critical_audits ({critical_count} > {})",
                self.thresholds.max_critical_audits
            ));
        }

        let recommendation = match reasons.len() {
            0 => GraduationRecommendation::Graduate,
            1 => GraduationRecommendation::Hold,
            _ => GraduationRecommendation::Rollback,
        };

        GraduationResult {
            rule: COST_GUARD_RULE.to_string(),
            tier: drift_report.tier,
            recommendation,
            reasons,
        }
    }
}

/// Outcome of replaying the evaluation log under a candidate policy.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SimulationResult {
    pub total_requests: u32,
    pub would_pass: u32,
    pub would_warn: u32,
    pub would_block: u32,
    pub total_cost_usd: f64,
    pub blocked_cost_usd: f64,
    pub avg_cost_blocked_usd: f64,
    pub avg_score_all: f64,
    pub avg_score_blocked: f64,
    pub avg_score_passed: f64,
    pub block_rate: f64,
    pub warn_rate: f64,
    pub quality_loss: f64,
    pub violations_by_rule: BTreeMap<String, u32>,
}

impl SimulationResult {
    fn empty() -> Self {
        Self {
            total_requests: 0,
            would_pass: 0,
            would_warn: 0,
            would_block: 0,
            total_cost_usd: 0.0,
            blocked_cost_usd: 0.0,
            avg_cost_blocked_usd: 0.0,
            avg_score_all: 0.0,
            avg_score_blocked: 0.0,
            avg_score_passed: 0.0,
            block_rate: 0.0,
            warn_rate: 0.0,
            quality_loss: 0.0,
            violations_by_rule: BTreeMap::new(),
        }
    }

    /// Human-readable report for the CLI.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = vec![
            "=".repeat(50),
            "POLICY SIMULATION RESULTS".to_string(),
            "=".repeat(50),
            format!("Total requests:     {}", self.total_requests),
            format!(
                "Would pass:         {} ({:.1}%)",
                self.would_pass,
                percentage(self.would_pass, self.total_requests)
            ),
            format!(
                "Would warn:         {} ({:.1}%)",
                self.would_warn,
                self.warn_rate * 100.0
            ),
            format!(
                "Would block:        {} ({:.1}%)",
                self.would_block,
                self.block_rate * 100.0
            ),
            String::new(),
            "COST ANALYSIS".to_string(),
            format!("Total cost:         ${:.6}", self.total_cost_usd),
            format!("Blocked cost:       ${:.6}", self.blocked_cost_usd),
            format!("Avg cost (blocked): ${:.6}", self.avg_cost_blocked_usd),
            String::new(),
            "QUALITY ANALYSIS".to_string(),
            format!("Avg score (all):    {:.3}", self.avg_score_all),
            format!("Avg score (blocked):{:.3}", self.avg_score_blocked),
            format!("Avg score (passed): {:.3}", self.avg_score_passed),
            format!("Quality delta:      {:+.3}", self.quality_loss),
            String::new(),
            "VIOLATIONS BY RULE".to_string(),
        ];
        for (rule, count) in &self.violations_by_rule {
            lines.push(format!("  {rule}: {count}"));
        }
        lines.push("=".repeat(50));
        lines.join("\n")
    }
}

fn percentage(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(total) * 100.0
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / usize_as_f64(values.len()))
    }
}

fn usize_as_f64(value: usize) -> f64 {
    u32::try_from(value).map_or(f64::MAX, f64::from)
}

/// Replay historical evaluation records under a candidate policy.
/// Offline only and idempotent.
#[must_use]
pub fn simulate(records: &[EvaluationRecord], config: &PolicyConfig) -> SimulationResult {
    if records.is_empty() {
        return SimulationResult::empty();
    }

    let mut pass_list: Vec<&EvaluationRecord> = Vec::new();
    let mut warn_list: Vec<&EvaluationRecord> = Vec::new();
    let mut block_list: Vec<&EvaluationRecord> = Vec::new();
    let mut violations_by_rule: BTreeMap<String, u32> = BTreeMap::new();

    for record in records {
        let mut violations: Vec<PolicyViolation> = Vec::new();
        let mut warnings = 0_u32;

        let cost = record.estimated_cost_usd.unwrap_or(0.0);
        let latency = record.latency_ms;

        if config.cost_policy_enabled {
            if cost > config.max_cost_usd {
                violations.push(PolicyViolation::HighCost);
            } else if cost > config.warn_cost_usd {
                warnings += 1;
            }
        }

        if config.score_policy_enabled {
            if let Some(score) = record.evaluation_score {
                if score < config.min_evaluation_score {
                    violations.push(PolicyViolation::LowScore);
                } else if score < config.warn_evaluation_score {
                    warnings += 1;
                }
            }
        }

        if config.latency_policy_enabled {
            if latency > config.max_latency_ms {
                violations.push(PolicyViolation::HighLatency);
            } else if latency > config.warn_latency_ms {
                warnings += 1;
            }
        }

        if config.validation_policy_enabled && record.validation_valid == Some(false) {
            violations.push(PolicyViolation::InvalidOutput);
        }

        for violation in &violations {
            *violations_by_rule
                .entry(violation.as_str().to_string())
                .or_insert(0) += 1;
        }

        if !violations.is_empty() {
            block_list.push(record);
        } else if warnings > 0 {
            warn_list.push(record);
        } else {
            pass_list.push(record);
        }
    }

    let total = u32::try_from(records.len()).unwrap_or(u32::MAX);
    let scores = |subset: &[&EvaluationRecord]| -> Vec<f64> {
        subset
            .iter()
            .filter_map(|record| record.evaluation_score)
            .collect()
    };
    let all_refs: Vec<&EvaluationRecord> = records.iter().collect();
    let all_scores = scores(&all_refs);
    let blocked_scores = scores(&block_list);
    let passed_scores = scores(&pass_list);

    let avg_score_all = mean(&all_scores).unwrap_or(0.0);
    let avg_score_blocked = mean(&blocked_scores).unwrap_or(0.0);
    let avg_score_passed = mean(&passed_scores).unwrap_or(avg_score_all);

    let total_cost_usd: f64 = records
        .iter()
        .map(|record| record.estimated_cost_usd.unwrap_or(0.0))
        .sum();
    let blocked_costs: Vec<f64> = block_list
        .iter()
        .map(|record| record.estimated_cost_usd.unwrap_or(0.0))
        .collect();
    let blocked_cost_usd: f64 = blocked_costs.iter().sum();

    let would_pass = u32::try_from(pass_list.len()).unwrap_or(u32::MAX);
    let would_warn = u32::try_from(warn_list.len()).unwrap_or(u32::MAX);
    let would_block = u32::try_from(block_list.len()).unwrap_or(u32::MAX);

    SimulationResult {
        total_requests: total,
        would_pass,
        would_warn,
        would_block,
        total_cost_usd,
        blocked_cost_usd,
        avg_cost_blocked_usd: mean(&blocked_costs).unwrap_or(0.0),
        avg_score_all,
        avg_score_blocked,
        avg_score_passed,
        block_rate: f64::from(would_block) / f64::from(total.max(1)),
        warn_rate: f64::from(would_warn) / f64::from(total.max(1)),
        quality_loss: avg_score_blocked - avg_score_passed,
        violations_by_rule,
    }
}

/// Impact analysis of switching from one policy to another.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PolicyComparison {
    pub current: SimulationResult,
    pub proposed: SimulationResult,
    pub block_rate_change: f64,
    pub blocked_cost_change_usd: f64,
    pub quality_loss_change: f64,
}

#[must_use]
pub fn compare_policies(
    records: &[EvaluationRecord],
    current: &PolicyConfig,
    proposed: &PolicyConfig,
) -> PolicyComparison {
    let current_result = simulate(records, current);
    let proposed_result = simulate(records, proposed);

    PolicyComparison {
        block_rate_change: proposed_result.block_rate - current_result.block_rate,
        blocked_cost_change_usd: proposed_result.blocked_cost_usd - current_result.blocked_cost_usd,
        quality_loss_change: proposed_result.quality_loss - current_result.quality_loss,
        current: current_result,
        proposed: proposed_result,
    }
}
