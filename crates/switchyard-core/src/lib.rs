#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchyard_capability::{
    CalculatorTool, CapabilityAdapter, CapabilityInput, CapabilityRegistry, DocumentLookupTool,
    ToolRegistry,
};
use switchyard_domain::{
    clamp_unit, now_utc, recover, CanaryRecord, CapabilityResult, CapabilityRole, CriticReport,
    DateTimeUtc, EnforcementRecord, EnrichedRoutingDecision, ExecutionPlan, ExecutionResult,
    OpError, PolicyHint, PolicyResult, PolicyStatus, PolicyViolation, PolicyWarning,
    Recommendation, RequestId, RiskLevel, RoutingDecision, SessionContext, StepResult, StepStatus,
    Tier, TurnRole, ValidatedClaim,
};
use switchyard_observe::TraceCollector;
use switchyard_policy::{
    canary_decision, evaluate_policy, EnforcementConfig, PolicyConfig, COST_GUARD_RULE,
};

const RETRIEVAL_KEYWORDS: &[&str] = &["search", "find", "lookup", "retrieve", "document"];
const VALIDATION_KEYWORDS: &[&str] = &["validate", "verify", "check", "review", "critique"];

pub const DEFAULT_ROUTING_REASON: &str = "default routing for general queries";

/// Classification-only planner. Inspects the prompt and names a
/// capability; it never executes anything and never fails — unknown
/// or empty input falls through to the general capability.
#[derive(Debug, Default, Clone)]
pub struct Planner;

impl Planner {
    #[must_use]
    pub fn plan(&self, prompt: &str) -> RoutingDecision {
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            return RoutingDecision {
                role: CapabilityRole::General,
                reason: DEFAULT_ROUTING_REASON.to_string(),
            };
        }

        let prompt_lower = trimmed.to_lowercase();
        if RETRIEVAL_KEYWORDS
            .iter()
            .any(|keyword| prompt_lower.contains(keyword))
        {
            return RoutingDecision {
                role: CapabilityRole::Retrieval,
                reason: "contains retrieval-related keywords".to_string(),
            };
        }
        if VALIDATION_KEYWORDS
            .iter()
            .any(|keyword| prompt_lower.contains(keyword))
        {
            return RoutingDecision {
                role: CapabilityRole::Critic,
                reason: "contains validation-related keywords".to_string(),
            };
        }
        RoutingDecision {
            role: CapabilityRole::General,
            reason: DEFAULT_ROUTING_REASON.to_string(),
        }
    }
}

/// Policy influence layer wrapping the base planner.
///
/// Hints only; the routed capability is never changed. The one
/// permitted enforcement, the cost guard, is record-only and gated by
/// the kill switch, the per-rule registry, and the canary rollout.
#[derive(Debug, Clone)]
pub struct HintedPlanner {
    planner: Planner,
    enforcement: EnforcementConfig,
    policy_influence_enabled: bool,
}

impl HintedPlanner {
    #[must_use]
    pub fn new(enforcement: EnforcementConfig) -> Self {
        Self {
            planner: Planner,
            enforcement,
            policy_influence_enabled: true,
        }
    }

    #[must_use]
    pub fn with_policy_influence(mut self, enabled: bool) -> Self {
        self.policy_influence_enabled = enabled;
        self
    }

    #[must_use]
    pub fn plan(
        &self,
        prompt: &str,
        prior: Option<&PolicyResult>,
        tier: Tier,
    ) -> EnrichedRoutingDecision {
        let base = self.planner.plan(prompt);
        let mut enriched = EnrichedRoutingDecision::unenriched(base);

        let Some(prior) = prior else {
            return enriched;
        };
        if !self.policy_influence_enabled {
            return enriched;
        }

        match prior.status {
            PolicyStatus::Fail => {
                let hint = if prior.violations.contains(&PolicyViolation::HighCost) {
                    PolicyHint::CostSensitive
                } else if prior.violations.contains(&PolicyViolation::LowScore) {
                    PolicyHint::QualitySensitive
                } else if prior.violations.contains(&PolicyViolation::HighLatency) {
                    PolicyHint::LatencySensitive
                } else {
                    PolicyHint::ReviewRecommended
                };
                enriched.policy_hint = Some(hint);
                enriched.policy_influenced = true;
            }
            PolicyStatus::Warn => {
                if prior.warnings.contains(&PolicyWarning::ElevatedCost) {
                    enriched.policy_hint = Some(PolicyHint::PreferCostEfficient);
                    enriched.policy_influenced = true;
                    self.apply_cost_guard(prompt, tier, &mut enriched);
                } else if prior.warnings.contains(&PolicyWarning::MarginalScore) {
                    enriched.policy_hint = Some(PolicyHint::PreferQuality);
                    enriched.policy_influenced = true;
                } else if prior.warnings.contains(&PolicyWarning::ElevatedLatency) {
                    enriched.policy_hint = Some(PolicyHint::PreferFast);
                    enriched.policy_influenced = true;
                }
            }
            PolicyStatus::Pass | PolicyStatus::Error => {}
        }

        enriched
    }

    fn apply_cost_guard(&self, prompt: &str, tier: Tier, enriched: &mut EnrichedRoutingDecision) {
        if !self.enforcement.is_enabled(COST_GUARD_RULE) {
            enriched.enforcement_skipped = true;
            return;
        }

        let should_enforce = if self.enforcement.canary.enabled {
            let decision: CanaryRecord = canary_decision(&self.enforcement.canary, tier, prompt);
            let admit = decision.eligible && decision.sampled;
            enriched.canary = Some(decision);
            if !admit {
                enriched.enforcement_skipped = true;
            }
            admit
        } else {
            true
        };

        if should_enforce {
            enriched.enforcement = Some(EnforcementRecord {
                rule_id: COST_GUARD_RULE.to_string(),
                applied: true,
                reason: "policy_warn_high_cost".to_string(),
            });
        }
    }
}

const DEFAULT_MAX_TURNS: usize = 10;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

struct SessionEntry {
    context: SessionContext,
    last_access: DateTimeUtc,
}

/// In-memory session-scoped conversation storage. Not persistent,
/// never shared across sessions. Idle sessions are evicted lazily on
/// the next access; the lock is never held across a capability call.
pub struct SessionStore {
    sessions: Mutex<BTreeMap<String, SessionEntry>>,
    max_turns: usize,
    idle_timeout: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS, DEFAULT_IDLE_TIMEOUT)
    }
}

impl SessionStore {
    #[must_use]
    pub fn new(max_turns: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            max_turns,
            idle_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cleanup_expired(sessions: &mut BTreeMap<String, SessionEntry>, idle_timeout: Duration) {
        let cutoff = now_utc() - idle_timeout;
        sessions.retain(|_, entry| entry.last_access >= cutoff);
    }

    #[must_use]
    pub fn get_prompt_context(&self, session_id: &str) -> String {
        let mut sessions = self.lock();
        Self::cleanup_expired(&mut sessions, self.idle_timeout);
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                context: SessionContext::new(session_id, self.max_turns),
                last_access: now_utc(),
            });
        entry.last_access = now_utc();
        entry.context.to_prompt_context()
    }

    pub fn add_turn(&self, session_id: &str, role: TurnRole, content: &str) {
        let mut sessions = self.lock();
        Self::cleanup_expired(&mut sessions, self.idle_timeout);
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                context: SessionContext::new(session_id, self.max_turns),
                last_access: now_utc(),
            });
        entry.last_access = now_utc();
        entry.context.add_turn(role, content);
    }

    pub fn clear_session(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        let mut sessions = self.lock();
        Self::cleanup_expired(&mut sessions, self.idle_timeout);
        sessions.len()
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("max_turns", &self.max_turns)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

/// Reasoning decomposition scorer. Speaks to the system, never to
/// users; its output lands in result metadata.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalystReport {
    pub analysis_steps: Vec<String>,
    pub complexity_score: f64,
    pub query_type: String,
}

#[derive(Debug, Default, Clone)]
pub struct Analyst;

const FACTUAL_KEYWORDS: &[&str] = &["what is", "who is", "when", "where", "define", "explain"];
const REASONING_KEYWORDS: &[&str] = &["why", "how does", "compare", "analyze", "evaluate"];
const CREATIVE_KEYWORDS: &[&str] = &["write", "create", "generate", "imagine", "story"];
const CALCULATION_KEYWORDS: &[&str] = &[
    "calculate", "compute", "how much", "how many", "+", "-", "*", "/",
];

impl Analyst {
    #[must_use]
    pub fn analyze(&self, output: &str, prompt: &str) -> AnalystReport {
        let mut analysis_steps = Vec::new();
        let prompt_lower = prompt.to_lowercase();
        let output_lower = output.to_lowercase();

        let query_type = Self::classify_query(&prompt_lower);
        analysis_steps.push(format!("query classified as: {query_type}"));

        let complexity_score = Self::estimate_complexity(prompt, output);
        analysis_steps.push(format!("complexity estimated: {complexity_score:.2}"));

        let word_count = output.split_whitespace().count();
        analysis_steps.push(format!("response contains {word_count} words"));

        if ["1.", "2.", "\u{2022}", "-", "*"]
            .iter()
            .any(|marker| output.contains(marker))
        {
            analysis_steps.push("response contains structured/list content".to_string());
        }
        if output.contains("```") || output_lower.contains("def ") || output_lower.contains("function")
        {
            analysis_steps.push("response contains code elements".to_string());
        }

        AnalystReport {
            analysis_steps,
            complexity_score,
            query_type,
        }
    }

    fn classify_query(prompt_lower: &str) -> String {
        let matched = if CALCULATION_KEYWORDS
            .iter()
            .any(|keyword| prompt_lower.contains(keyword))
        {
            "calculation"
        } else if CREATIVE_KEYWORDS
            .iter()
            .any(|keyword| prompt_lower.contains(keyword))
        {
            "creative"
        } else if REASONING_KEYWORDS
            .iter()
            .any(|keyword| prompt_lower.contains(keyword))
        {
            "reasoning"
        } else if FACTUAL_KEYWORDS
            .iter()
            .any(|keyword| prompt_lower.contains(keyword))
        {
            "factual"
        } else {
            "general"
        };
        matched.to_string()
    }

    fn estimate_complexity(prompt: &str, output: &str) -> f64 {
        let mut complexity: f64 = 0.3;

        let prompt_words = prompt.split_whitespace().count();
        if prompt_words > 20 {
            complexity += 0.2;
        } else if prompt_words > 10 {
            complexity += 0.1;
        }

        let output_words = output.split_whitespace().count();
        if output_words > 100 {
            complexity += 0.2;
        } else if output_words > 50 {
            complexity += 0.1;
        }

        if prompt.contains('?') {
            complexity += 0.1;
        }

        complexity.min(1.0)
    }
}

/// Heuristic output validation: completeness, uncertainty and error
/// signals, placeholder detection. The signed confidence delta is
/// applied to the capability's base confidence, then clamped to
/// [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub confidence_delta: f64,
}

#[derive(Debug, Default, Clone)]
pub struct Validator;

const MIN_RESPONSE_LENGTH: usize = 10;
const UNCERTAINTY_KEYWORDS: &[&str] = &["i don't know", "i'm not sure", "i cannot", "i can't"];
const ERROR_KEYWORDS: &[&str] = &["error:", "exception:", "failed to"];
const QUESTION_WORDS: &[&str] = &["what", "how", "why", "when", "where", "who"];

impl Validator {
    #[must_use]
    pub fn validate(&self, output: &str, prompt: &str) -> ValidationReport {
        let mut issues = Vec::new();
        let mut confidence_delta = 0.0_f64;
        let output_lower = output.to_lowercase();

        if output.trim().len() < MIN_RESPONSE_LENGTH {
            issues.push("response too short".to_string());
            confidence_delta -= 0.3;
        }

        if let Some(keyword) = UNCERTAINTY_KEYWORDS
            .iter()
            .find(|keyword| output_lower.contains(*keyword))
        {
            issues.push(format!("contains uncertainty signal: '{keyword}'"));
            confidence_delta -= 0.1;
        }

        if let Some(keyword) = ERROR_KEYWORDS
            .iter()
            .find(|keyword| output_lower.contains(*keyword))
        {
            issues.push(format!("contains error signal: '{keyword}'"));
            confidence_delta -= 0.2;
        }

        if output_lower.contains("[retrieval]") || output_lower.contains("[placeholder]") {
            issues.push("contains placeholder content".to_string());
            confidence_delta -= 0.2;
        }

        let prompt_lower = prompt.to_lowercase();
        if QUESTION_WORDS
            .iter()
            .any(|word| prompt_lower.contains(word))
            && output.split_whitespace().count() < 5
        {
            issues.push("question asked but response very brief".to_string());
            confidence_delta -= 0.1;
        }

        if output.split_whitespace().count() > 50 {
            confidence_delta += 0.1;
        }

        ValidationReport {
            is_valid: issues.is_empty(),
            issues,
            confidence_delta: confidence_delta.clamp(-1.0, 1.0),
        }
    }
}

/// Weighted quality signals: completeness, clarity, conciseness, and
/// apparent response confidence.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationReport {
    pub score: f64,
    pub signals: BTreeMap<String, f64>,
}

#[derive(Debug, Default, Clone)]
pub struct Evaluator;

impl Evaluator {
    #[must_use]
    pub fn evaluate(&self, output: &str, prompt: &str) -> EvaluationReport {
        let mut signals = BTreeMap::new();
        signals.insert(
            "completeness".to_string(),
            Self::score_completeness(output, prompt),
        );
        signals.insert("clarity".to_string(), Self::score_clarity(output));
        signals.insert(
            "conciseness".to_string(),
            Self::score_conciseness(output, prompt),
        );
        signals.insert(
            "response_confidence".to_string(),
            Self::score_response_confidence(output),
        );

        let weights: BTreeMap<&str, f64> = BTreeMap::from([
            ("completeness", 0.35),
            ("clarity", 0.25),
            ("conciseness", 0.20),
            ("response_confidence", 0.20),
        ]);

        let score: f64 = signals
            .iter()
            .map(|(key, value)| value * weights.get(key.as_str()).copied().unwrap_or(0.25))
            .sum();

        EvaluationReport {
            score: clamp_unit(score),
            signals,
        }
    }

    fn score_completeness(output: &str, prompt: &str) -> f64 {
        let mut score = 0.5;
        let prompt_words = prompt.split_whitespace().count();
        let output_words = output.split_whitespace().count();

        if prompt_words > 10 && output_words > 30 {
            score += 0.3;
        } else if output_words > 10 {
            score += 0.2;
        }
        if prompt.contains('?') && output_words > 5 {
            score += 0.1;
        }
        if output_words < 5 && prompt_words > 3 {
            score -= 0.3;
        }
        clamp_unit(score)
    }

    fn score_clarity(output: &str) -> f64 {
        let mut score = 0.7;
        if ["1.", "2.", "\u{2022}", "-", ":", "\n"]
            .iter()
            .any(|marker| output.contains(marker))
        {
            score += 0.2;
        }

        let sentences: Vec<&str> = output.split('.').collect();
        let total_words: usize = sentences
            .iter()
            .map(|sentence| sentence.split_whitespace().count())
            .sum();
        let avg_sentence_words = total_words as f64 / sentences.len().max(1) as f64;
        if avg_sentence_words > 30.0 {
            score -= 0.2;
        }
        clamp_unit(score)
    }

    fn score_conciseness(output: &str, prompt: &str) -> f64 {
        let prompt_words = prompt.split_whitespace().count();
        let output_words = output.split_whitespace().count();

        if prompt_words < 10 {
            if (5..=50).contains(&output_words) {
                0.9
            } else if output_words < 5 {
                0.5
            } else {
                0.7
            }
        } else if (20..=150).contains(&output_words) {
            0.9
        } else if output_words < 20 {
            0.6
        } else {
            0.7
        }
    }

    fn score_response_confidence(output: &str) -> f64 {
        let output_lower = output.to_lowercase();
        let mut score = 0.8;

        let uncertainty_phrases = [
            "i think",
            "maybe",
            "perhaps",
            "possibly",
            "i'm not sure",
            "i don't know",
            "it could be",
        ];
        for phrase in uncertainty_phrases {
            if output_lower.contains(phrase) {
                score -= 0.1;
            }
        }

        let confident_phrases = ["is", "are", "equals", "the answer is"];
        if confident_phrases
            .iter()
            .any(|phrase| output_lower.contains(phrase))
        {
            score += 0.05;
        }
        clamp_unit(score)
    }
}

const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CAPABILITY_CONFIDENCE: f64 = 0.6;
const TIMEOUT_APOLOGY: &str =
    "The request could not be completed in time. Please try again.";

/// The engine. Reads bounded session context, invokes the routed
/// capability under a wall-clock deadline, writes session turns, and
/// runs the post-hoc scorers. Scorer and memory failures degrade the
/// annotations, never the answer.
pub struct Executor {
    registry: CapabilityRegistry,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    analyst: Analyst,
    validator: Validator,
    evaluator: Evaluator,
    invoke_timeout: Duration,
    enable_analysis: bool,
    enable_validation: bool,
    enable_evaluation: bool,
}

impl Executor {
    #[must_use]
    pub fn new(registry: CapabilityRegistry, sessions: Arc<SessionStore>) -> Self {
        Self {
            registry,
            tools: Arc::new(default_tool_registry()),
            sessions,
            analyst: Analyst,
            validator: Validator,
            evaluator: Evaluator,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
            enable_analysis: true,
            enable_validation: true,
            enable_evaluation: true,
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_scorers(mut self, analysis: bool, validation: bool, evaluation: bool) -> Self {
        self.enable_analysis = analysis;
        self.enable_validation = validation;
        self.enable_evaluation = evaluation;
        self
    }

    /// Simple execution path: resolve the capability and invoke it
    /// under the deadline. Dispatch and invocation failures produce a
    /// degraded result, never an error.
    #[must_use]
    pub fn execute(&self, role: CapabilityRole, input: CapabilityInput) -> CapabilityResult {
        let adapter = match self.registry.resolve(role) {
            Ok(adapter) => adapter,
            Err(err) => {
                return CapabilityResult {
                    capability: role,
                    output: format!("Error: {err}"),
                    confidence: 0.0,
                    metadata: json!({"error": "capability_not_found"}),
                };
            }
        };
        self.invoke_with_deadline(role, adapter, input)
    }

    /// Invoke on a dedicated worker thread and bound the wait. On
    /// timeout the worker is left to finish on its own; only the wait
    /// is cancelled and a synthetic degraded result is returned.
    fn invoke_with_deadline(
        &self,
        role: CapabilityRole,
        adapter: Arc<dyn CapabilityAdapter>,
        input: CapabilityInput,
    ) -> CapabilityResult {
        let (sender, receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let outcome = adapter.invoke(&input);
            let _ = sender.send(outcome);
        });

        match receiver.recv_timeout(self.invoke_timeout) {
            Ok(Ok(response)) => CapabilityResult {
                capability: role,
                output: response.text,
                confidence: DEFAULT_CAPABILITY_CONFIDENCE,
                metadata: json!({
                    "model": response.metadata.model,
                    "tokens_used": response.metadata.tokens_used,
                    "invocation_latency_ms": response.metadata.latency_ms,
                }),
            },
            Ok(Err(err)) => CapabilityResult {
                capability: role,
                output: format!("Error: capability invocation failed: {err:#}"),
                confidence: 0.0,
                metadata: json!({"error": format!("{err:#}")}),
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    role = %role,
                    timeout_ms = u64::try_from(self.invoke_timeout.as_millis()).unwrap_or(u64::MAX),
                    "capability invocation timed out"
                );
                CapabilityResult {
                    capability: role,
                    output: TIMEOUT_APOLOGY.to_string(),
                    confidence: 0.0,
                    metadata: json!({"error": "timeout"}),
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                tracing::warn!(role = %role, "capability worker exited without a result");
                CapabilityResult {
                    capability: role,
                    output: "Error: capability invocation failed: worker exited without a result"
                        .to_string(),
                    confidence: 0.0,
                    metadata: json!({"error": "capability_failed"}),
                }
            }
        }
    }

    /// Full simple flow: bounded session context, capability
    /// invocation, session writes, routing metadata merge, and the
    /// three post-hoc scorers.
    #[must_use]
    pub fn orchestrate(
        &self,
        prompt: &str,
        session_id: Option<&str>,
        decision: &EnrichedRoutingDecision,
    ) -> CapabilityResult {
        let mut degraded: Vec<OpError> = Vec::new();

        let context = if let Some(session_id) = session_id {
            let read = recover("session_read", String::new, || {
                Ok(self.sessions.get_prompt_context(session_id))
            });
            if let Some(op) = read.degraded {
                degraded.push(op);
            }
            read.value
        } else {
            String::new()
        };

        let final_prompt = if context.is_empty() {
            prompt.to_string()
        } else {
            format!("{context}\n\n{prompt}")
        };

        let role = decision.decision.role;
        let mut input = CapabilityInput::from_prompt(&final_prompt);
        let mut retrieved_chunks: Vec<String> = Vec::new();
        if role == CapabilityRole::Retrieval {
            let lookup = recover("document_lookup", Vec::new, || {
                let outcome = self.tools.run_for_role(
                    CapabilityRole::Retrieval,
                    "document_lookup",
                    &json!({"query": prompt}),
                )?;
                let chunks = outcome
                    .output
                    .get("documents")
                    .and_then(Value::as_array)
                    .map(|documents| {
                        documents
                            .iter()
                            .filter_map(|document| document.get("content"))
                            .filter_map(Value::as_str)
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(chunks)
            });
            if let Some(op) = lookup.degraded {
                degraded.push(op);
            }
            retrieved_chunks = lookup.value;
            input.context_documents.clone_from(&retrieved_chunks);
        }

        let mut result = self.execute(role, input);

        if let Some(session_id) = session_id {
            let write = recover("session_write", || (), || {
                self.sessions.add_turn(session_id, TurnRole::User, prompt);
                self.sessions
                    .add_turn(session_id, TurnRole::Assistant, &result.output);
                Ok(())
            });
            if let Some(op) = write.degraded {
                degraded.push(op);
            }
            result.merge_metadata("session_id", json!(session_id));
        }

        result.merge_metadata("routing", decision.to_metadata());
        if !retrieved_chunks.is_empty() {
            result.merge_metadata(
                "retrieval",
                json!({
                    "chunks": retrieved_chunks,
                    "total_retrieved": retrieved_chunks.len(),
                }),
            );
        }

        if self.enable_analysis {
            let analysis = recover(
                "analysis",
                || AnalystReport {
                    analysis_steps: Vec::new(),
                    complexity_score: 0.5,
                    query_type: "general".to_string(),
                },
                || Ok(self.analyst.analyze(&result.output, prompt)),
            );
            if let Some(op) = analysis.degraded {
                degraded.push(op);
            }
            result.merge_metadata("analysis", json!(analysis.value));
        }

        if self.enable_validation {
            let validation = recover(
                "validation",
                || ValidationReport {
                    is_valid: true,
                    issues: Vec::new(),
                    confidence_delta: 0.0,
                },
                || Ok(self.validator.validate(&result.output, prompt)),
            );
            if let Some(op) = validation.degraded {
                degraded.push(op);
            }
            result.confidence = clamp_unit(result.confidence + validation.value.confidence_delta);
            result.merge_metadata("validation", json!(validation.value));
        }

        if self.enable_evaluation {
            let evaluation = recover(
                "evaluation",
                || EvaluationReport {
                    score: 0.5,
                    signals: BTreeMap::new(),
                },
                || Ok(self.evaluator.evaluate(&result.output, prompt)),
            );
            if let Some(op) = evaluation.degraded {
                degraded.push(op);
            }
            result.merge_metadata("evaluation", json!(evaluation.value));
        }

        if !degraded.is_empty() {
            result.merge_metadata("degraded_ops", json!(degraded));
        }

        result
    }

    /// Legacy plan executor: strict declared order, prior step outputs
    /// accumulated into the next step's context, fail-fast on the
    /// first failed step.
    ///
    /// # Errors
    /// Returns an error only on an infrastructure fault inside the
    /// execution loop; step failures are values, not errors.
    pub fn execute_plan(&self, plan: &ExecutionPlan, prompt: &str) -> Result<ExecutionResult> {
        tracing::info!(plan_id = %plan.plan_id, task_type = %plan.task_type, "starting plan execution");

        let mut step_results: Vec<StepResult> = Vec::new();
        let mut failed = false;

        for step in &plan.steps {
            tracing::info!(step_id = step.step_id, role = %step.role, intent = %step.intent, "executing step");
            let step_result = self.execute_step(step.step_id, step.role, prompt, step, &step_results);
            let step_failed = step_result.status == StepStatus::Failed;
            step_results.push(step_result);
            if step_failed {
                tracing::error!(step_id = step.step_id, "step failed, aborting plan");
                failed = true;
                break;
            }
        }

        let final_output = if failed {
            None
        } else {
            step_results
                .iter()
                .rev()
                .find(|step| step.status == StepStatus::Completed)
                .and_then(|step| step.output.clone())
        };

        Ok(ExecutionResult::from_steps(
            &plan.plan_id,
            step_results,
            final_output,
            json!({
                "task_type": plan.task_type,
                "complexity": plan.estimated_complexity,
            }),
        ))
    }

    fn execute_step(
        &self,
        step_id: u32,
        role: CapabilityRole,
        prompt: &str,
        step: &switchyard_domain::PlanStep,
        previous: &[StepResult],
    ) -> StepResult {
        let started = std::time::Instant::now();

        let adapter = match self.registry.resolve(role) {
            Ok(adapter) => adapter,
            Err(err) => {
                return StepResult {
                    step_id,
                    role,
                    status: StepStatus::Failed,
                    output: None,
                    error: Some(err.to_string()),
                    duration_ms: 0,
                    metadata: json!({"intent": step.intent}),
                };
            }
        };

        let step_prompt = step
            .input
            .as_ref()
            .and_then(|input| input.get("query"))
            .and_then(Value::as_str)
            .unwrap_or(prompt);
        let context_documents: Vec<String> = previous
            .iter()
            .filter_map(|prev| prev.output.as_ref())
            .map(|output| format!("[step output] {output}"))
            .collect();
        let input = CapabilityInput {
            prompt: step_prompt.to_string(),
            context_documents,
        };

        let invoked = self.invoke_with_deadline(role, adapter, input);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let invocation_error = invoked
            .metadata
            .get("error")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        if let Some(error) = invocation_error {
            return StepResult {
                step_id,
                role,
                status: StepStatus::Failed,
                output: None,
                error: Some(error),
                duration_ms,
                metadata: json!({"intent": step.intent}),
            };
        }

        StepResult {
            step_id,
            role,
            status: StepStatus::Completed,
            output: Some(invoked.output),
            error: None,
            duration_ms,
            metadata: invoked.metadata,
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("registry", &self.registry)
            .field("invoke_timeout", &self.invoke_timeout)
            .finish()
    }
}

#[must_use]
pub fn default_tool_registry() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(CalculatorTool), &[CapabilityRole::General]);
    tools.register(Arc::new(DocumentLookupTool), &[CapabilityRole::Retrieval]);
    tools
}

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "could", "should", "may", "might", "must", "shall",
    "can", "need", "dare", "ought", "used", "to", "of", "in", "for", "on", "with", "at", "by",
    "from", "as", "into", "through", "during", "before", "after", "above", "below", "between",
    "under", "again", "further", "then", "once", "and", "but", "or", "nor", "so", "yet", "both",
    "either", "neither", "not", "only", "own", "same", "than", "too", "very", "just", "also",
];

const CRITICAL_ISSUE_KEYWORDS: &[&str] = &["no grounding", "no output", "no extractable"];
const SEVERE_ISSUE_KEYWORDS: &[&str] = &["no grounding", "no output", "unsupported"];

/// The last line of defense before user exposure. Evaluates outputs
/// for grounding and risk; never rewrites content, never re-plans.
/// Conservative by construction: when uncertain, escalate risk.
#[derive(Debug, Default, Clone)]
pub struct Critic;

impl Critic {
    /// Validate a proposed output against its retrieved context.
    #[must_use]
    pub fn validate_output(
        &self,
        proposed_output: Option<&str>,
        retrieved_chunks: &[String],
        metadata: &Value,
    ) -> CriticReport {
        let mut issues: Vec<String> = Vec::new();
        let mut validated_claims: Vec<ValidatedClaim> = Vec::new();

        if retrieved_chunks.is_empty() {
            issues.push("No grounding context available".to_string());
        }
        if proposed_output.is_none() {
            issues.push("No output to evaluate".to_string());
        }

        let mut grounding_score = 0.0;
        if let Some(output) = proposed_output {
            if !retrieved_chunks.is_empty() {
                let (score, grounding_issues, claims) =
                    Self::check_grounding(output, retrieved_chunks);
                grounding_score = score;
                issues.extend(grounding_issues);
                validated_claims = claims;
            }
        }

        issues.extend(Self::check_metadata_completeness(metadata));

        let confidence_score =
            Self::compute_confidence(grounding_score, retrieved_chunks.len(), issues.len());
        let risk_level = Self::assess_risk(&issues, grounding_score, confidence_score);
        let recommendation = Self::compute_recommendation(risk_level, &issues);

        CriticReport::new(
            risk_level,
            issues,
            recommendation,
            validated_claims,
            grounding_score,
            confidence_score,
        )
    }

    /// Validate an aggregated plan execution: retrieval step outputs
    /// become the grounding context, the generation step's output is
    /// the claim under test.
    #[must_use]
    pub fn validate_execution(&self, execution: &ExecutionResult) -> CriticReport {
        let mut issues: Vec<String> = Vec::new();
        if execution.status == StepStatus::Failed {
            issues.push("Execution failed".to_string());
        }

        let mut retrieved_chunks: Vec<String> = Vec::new();
        let mut proposed_output: Option<String> = None;
        let mut metadata = serde_json::Map::new();

        for step in &execution.step_results {
            match step.role {
                CapabilityRole::Retrieval => {
                    if let Some(output) = &step.output {
                        retrieved_chunks.push(output.clone());
                    }
                }
                CapabilityRole::General => {
                    proposed_output.clone_from(&step.output);
                }
                CapabilityRole::Critic => {}
            }
            if let Some(map) = step.metadata.as_object() {
                for (key, value) in map {
                    metadata.insert(key.clone(), value.clone());
                }
            }
        }

        if proposed_output.is_none() {
            proposed_output.clone_from(&execution.final_output);
        }

        let mut report = self.validate_output(
            proposed_output.as_deref(),
            &retrieved_chunks,
            &Value::Object(metadata),
        );
        if !issues.is_empty() {
            issues.extend(report.issues);
            let confidence_score = Self::compute_confidence(
                report.grounding_score,
                retrieved_chunks.len(),
                issues.len(),
            );
            let risk_level = Self::assess_risk(&issues, report.grounding_score, confidence_score);
            let recommendation = Self::compute_recommendation(risk_level, &issues);
            report = CriticReport::new(
                risk_level,
                issues,
                recommendation,
                report.validated_claims,
                report.grounding_score,
                confidence_score,
            );
        }
        report
    }

    fn substantive_tokens(text: &str) -> std::collections::BTreeSet<String> {
        text.to_lowercase()
            .split_whitespace()
            .filter(|token| !STOP_WORDS.contains(token))
            .map(ToString::to_string)
            .collect()
    }

    fn check_grounding(
        output: &str,
        retrieved_chunks: &[String],
    ) -> (f64, Vec<String>, Vec<ValidatedClaim>) {
        let mut issues = Vec::new();
        let mut claims = Vec::new();

        let corpus = retrieved_chunks.join(" ");
        if corpus.trim().is_empty() {
            issues.push("Retrieved chunks contain no extractable text".to_string());
            return (0.0, issues, claims);
        }

        let output_text = output.to_lowercase();
        let output_keywords = Self::substantive_tokens(&output_text);
        if output_keywords.is_empty() {
            issues.push("Output contains no substantive content to evaluate".to_string());
            return (0.5, issues, claims);
        }
        let context_keywords = Self::substantive_tokens(&corpus);

        let overlap = output_keywords.intersection(&context_keywords).count();
        let grounding_score = overlap as f64 / output_keywords.len() as f64;

        let claim_text = if output_text.chars().count() > 200 {
            let truncated: String = output_text.chars().take(200).collect();
            format!("{truncated}...")
        } else {
            output_text.clone()
        };
        claims.push(ValidatedClaim {
            claim_text,
            is_grounded: grounding_score >= 0.3,
            confidence: grounding_score,
            supporting_chunk_ids: (0..retrieved_chunks.len())
                .map(|index| index.to_string())
                .collect(),
        });

        if grounding_score < 0.3 {
            issues.push(format!(
                "Low grounding score ({grounding_score:.2}): output may not be supported by context"
            ));
        } else if grounding_score < 0.5 {
            issues.push(format!(
                "Moderate grounding score ({grounding_score:.2}): some claims may be unsupported"
            ));
        }

        (grounding_score, issues, claims)
    }

    fn check_metadata_completeness(metadata: &Value) -> Vec<String> {
        let mut issues = Vec::new();
        for field in ["source", "timestamp"] {
            if metadata.get(field).is_none() {
                issues.push(format!("Missing metadata: {field}"));
            }
        }
        issues
    }

    fn compute_confidence(grounding_score: f64, num_chunks: usize, num_issues: usize) -> f64 {
        let mut confidence = grounding_score * 0.6;
        if num_chunks >= 3 {
            confidence += 0.2;
        } else if num_chunks >= 1 {
            confidence += 0.1;
        }
        let issue_penalty = (num_issues as f64 * 0.1).min(0.3);
        clamp_unit(confidence - issue_penalty)
    }

    fn assess_risk(issues: &[String], grounding_score: f64, confidence_score: f64) -> RiskLevel {
        for issue in issues {
            let issue_lower = issue.to_lowercase();
            if CRITICAL_ISSUE_KEYWORDS
                .iter()
                .any(|keyword| issue_lower.contains(keyword))
            {
                return RiskLevel::High;
            }
        }
        if grounding_score < 0.2 {
            return RiskLevel::High;
        }
        if issues.len() > 2 || grounding_score < 0.5 {
            return RiskLevel::Medium;
        }
        if confidence_score >= 0.6 && issues.len() <= 1 {
            return RiskLevel::Low;
        }
        RiskLevel::Medium
    }

    fn compute_recommendation(risk_level: RiskLevel, issues: &[String]) -> Recommendation {
        match risk_level {
            RiskLevel::High => Recommendation::Block,
            RiskLevel::Medium => {
                for issue in issues {
                    let issue_lower = issue.to_lowercase();
                    if SEVERE_ISSUE_KEYWORDS
                        .iter()
                        .any(|keyword| issue_lower.contains(keyword))
                    {
                        return Recommendation::Block;
                    }
                }
                Recommendation::Warn
            }
            RiskLevel::Low => Recommendation::Proceed,
        }
    }
}

/// Final structured response from the pipeline.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FinalResponse {
    pub request_id: RequestId,
    pub answer: String,
    pub is_safe: bool,
    pub recommendation: Recommendation,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub prompt: String,
    pub session_id: Option<String>,
    pub tier: Tier,
    pub prior_policy: Option<PolicyResult>,
}

impl PipelineRequest {
    #[must_use]
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            session_id: None,
            tier: Tier::Free,
            prior_policy: None,
        }
    }
}

/// The front door. Glue, not brain: coordinates planner, executor,
/// critic, policy evaluator, and trace collector in a single forward
/// pass. The planner runs exactly once, the critic runs after
/// execution, and there are no back-edges.
pub struct Pipeline {
    planner: HintedPlanner,
    executor: Executor,
    critic: Critic,
    policy_config: PolicyConfig,
    collector: TraceCollector,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        planner: HintedPlanner,
        executor: Executor,
        policy_config: PolicyConfig,
        collector: TraceCollector,
    ) -> Self {
        Self {
            planner,
            executor,
            critic: Critic,
            policy_config,
            collector,
        }
    }

    /// Execute the complete flow for one request. Total: every
    /// internal failure degrades into the response metadata.
    #[must_use]
    pub fn handle(&self, request: &PipelineRequest) -> FinalResponse {
        let request_id = RequestId::new();
        let started_at = now_utc();
        tracing::info!(request_id = %request_id, "starting orchestration flow");

        let decision = self.planner.plan(
            &request.prompt,
            request.prior_policy.as_ref(),
            request.tier,
        );
        tracing::info!(
            request_id = %request_id,
            capability = %decision.decision.role,
            policy_influenced = decision.policy_influenced,
            "routing decided"
        );

        let mut result =
            self.executor
                .orchestrate(&request.prompt, request.session_id.as_deref(), &decision);
        result.merge_metadata("tier", json!(request.tier.as_str()));

        let retrieved_chunks: Vec<String> = result
            .metadata
            .get("retrieval")
            .and_then(|retrieval| retrieval.get("chunks"))
            .and_then(Value::as_array)
            .map(|chunks| {
                chunks
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let report = self.critic.validate_output(
            Some(&result.output),
            &retrieved_chunks,
            &result.metadata,
        );
        result.merge_metadata("critic", json!(report));
        tracing::info!(
            request_id = %request_id,
            recommendation = report.recommendation.as_str(),
            risk = report.risk_level.as_str(),
            "validation complete"
        );

        let policy = evaluate_policy(&result.metadata, &self.policy_config);
        result.merge_metadata("policy", json!(policy));

        let success = !result
            .metadata
            .get("error")
            .and_then(Value::as_str)
            .is_some_and(|error| !error.is_empty());
        let error = result
            .metadata
            .get("error")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        self.collector.capture(
            &request_id.to_string(),
            &result,
            started_at,
            success,
            error.as_deref(),
        );

        tracing::info!(request_id = %request_id, is_safe = report.is_safe, "flow complete");
        FinalResponse {
            request_id,
            answer: result.output,
            is_safe: report.is_safe,
            recommendation: report.recommendation,
            metadata: result.metadata,
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("planner", &self.planner)
            .field("executor", &self.executor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        default_tool_registry, Analyst, Critic, Evaluator, Executor, FinalResponse, HintedPlanner,
        Pipeline, PipelineRequest, Planner, SessionStore, Validator, DEFAULT_ROUTING_REASON,
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use switchyard_capability::{
        CapabilityAdapter, CapabilityInput, CapabilityRegistry, CapabilityResponse,
        DeterministicCapability, InvocationMetadata,
    };
    use switchyard_domain::{
        CapabilityRole, ExecutionPlan, PlanStep, PolicyResult, PolicyStatus, PolicyViolation,
        PolicyWarning, Recommendation, RiskLevel, StepStatus, Tier, TurnRole,
    };
    use switchyard_observe::{LogTraceSink, TraceCollector};
    use switchyard_policy::{CanaryConfig, EnforcementConfig, PolicyConfig};

    struct EchoCapability;

    impl CapabilityAdapter for EchoCapability {
        fn capability_name(&self) -> &'static str {
            "echo"
        }

        fn invoke(&self, input: &CapabilityInput) -> anyhow::Result<CapabilityResponse> {
            Ok(CapabilityResponse {
                text: format!("echo: {}", input.prompt),
                metadata: InvocationMetadata {
                    model: "deterministic-v1".to_string(),
                    tokens_used: 100,
                    latency_ms: 1,
                },
            })
        }
    }

    struct SlowCapability;

    impl CapabilityAdapter for SlowCapability {
        fn capability_name(&self) -> &'static str {
            "slow"
        }

        fn invoke(&self, _input: &CapabilityInput) -> anyhow::Result<CapabilityResponse> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(CapabilityResponse {
                text: "late".to_string(),
                metadata: InvocationMetadata {
                    model: "deterministic-v1".to_string(),
                    tokens_used: 1,
                    latency_ms: 300,
                },
            })
        }
    }

    struct CrashingCapability;

    impl CapabilityAdapter for CrashingCapability {
        fn capability_name(&self) -> &'static str {
            "crashing"
        }

        fn invoke(&self, _input: &CapabilityInput) -> anyhow::Result<CapabilityResponse> {
            panic!("worker crash");
        }
    }

    fn registry_with(role: CapabilityRole) -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(role, Arc::new(EchoCapability));
        registry
    }

    fn full_registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityRole::General, Arc::new(EchoCapability));
        registry.register(CapabilityRole::Retrieval, Arc::new(EchoCapability));
        registry.register(CapabilityRole::Critic, Arc::new(DeterministicCapability::new()));
        registry
    }

    fn warn_policy() -> PolicyResult {
        PolicyResult {
            status: PolicyStatus::Warn,
            violations: Vec::new(),
            warnings: vec![PolicyWarning::ElevatedCost],
            checked_rules: 4,
        }
    }

    #[test]
    fn planner_routes_on_keywords_in_order() {
        let planner = Planner;
        assert_eq!(
            planner.plan("please search the docs").role,
            CapabilityRole::Retrieval
        );
        assert_eq!(
            planner.plan("verify this claim").role,
            CapabilityRole::Critic
        );
        // Retrieval vocabulary wins when both are present.
        assert_eq!(
            planner.plan("search and verify").role,
            CapabilityRole::Retrieval
        );
        let default = planner.plan("hello there");
        assert_eq!(default.role, CapabilityRole::General);
        assert_eq!(default.reason, DEFAULT_ROUTING_REASON);
    }

    #[test]
    fn planner_defaults_on_empty_and_blank_input() {
        let planner = Planner;
        for prompt in ["", "   ", "\n\t"] {
            let decision = planner.plan(prompt);
            assert_eq!(decision.role, CapabilityRole::General);
            assert_eq!(decision.reason, DEFAULT_ROUTING_REASON);
        }
    }

    #[test]
    fn hint_layer_maps_violations_and_warnings() {
        let planner = HintedPlanner::new(EnforcementConfig::default());

        let fail = PolicyResult {
            status: PolicyStatus::Fail,
            violations: vec![PolicyViolation::HighCost],
            warnings: Vec::new(),
            checked_rules: 4,
        };
        let enriched = planner.plan("hello", Some(&fail), Tier::Free);
        assert_eq!(
            enriched.policy_hint,
            Some(switchyard_domain::PolicyHint::CostSensitive)
        );
        assert!(enriched.policy_influenced);
        // Fail status never enforces; hints only.
        assert!(enriched.enforcement.is_none());

        let marginal = PolicyResult {
            status: PolicyStatus::Warn,
            violations: Vec::new(),
            warnings: vec![PolicyWarning::MarginalScore],
            checked_rules: 4,
        };
        let enriched = planner.plan("hello", Some(&marginal), Tier::Free);
        assert_eq!(
            enriched.policy_hint,
            Some(switchyard_domain::PolicyHint::PreferQuality)
        );
    }

    #[test]
    fn no_prior_policy_means_no_enrichment() {
        let planner = HintedPlanner::new(EnforcementConfig::default());
        let enriched = planner.plan("hello", None, Tier::Free);
        assert!(enriched.policy_hint.is_none());
        assert!(!enriched.policy_influenced);
        assert!(enriched.canary.is_none());
    }

    #[test]
    fn cost_guard_enforces_without_canary_and_skips_on_kill_switch() {
        let no_canary = EnforcementConfig {
            canary: CanaryConfig {
                enabled: false,
                ..CanaryConfig::default()
            },
            ..EnforcementConfig::default()
        };
        let planner = HintedPlanner::new(no_canary);
        let enriched = planner.plan("hello", Some(&warn_policy()), Tier::Free);
        let enforcement = enriched.enforcement.as_ref();
        assert!(enforcement.is_some_and(|record| record.applied));
        assert!(!enriched.enforcement_skipped);

        let killed = EnforcementConfig {
            enabled: false,
            ..EnforcementConfig::default()
        };
        let planner = HintedPlanner::new(killed);
        let enriched = planner.plan("hello", Some(&warn_policy()), Tier::Free);
        assert!(enriched.enforcement.is_none());
        assert!(enriched.enforcement_skipped);
    }

    #[test]
    fn canary_gates_enforcement_deterministically() {
        let full_rollout = EnforcementConfig {
            canary: CanaryConfig {
                enabled: true,
                tier: Tier::Free,
                percentage: 100,
            },
            ..EnforcementConfig::default()
        };
        let planner = HintedPlanner::new(full_rollout);
        let enriched = planner.plan("hello", Some(&warn_policy()), Tier::Free);
        let canary = enriched.canary.unwrap_or_else(|| unreachable!());
        assert!(canary.eligible);
        assert!(canary.sampled);
        assert!(enriched.enforcement.is_some());

        let zero_rollout = EnforcementConfig {
            canary: CanaryConfig {
                enabled: true,
                tier: Tier::Free,
                percentage: 0,
            },
            ..EnforcementConfig::default()
        };
        let planner = HintedPlanner::new(zero_rollout);
        let enriched = planner.plan("hello", Some(&warn_policy()), Tier::Free);
        let canary = enriched.canary.unwrap_or_else(|| unreachable!());
        assert!(canary.eligible);
        assert!(!canary.sampled);
        assert!(enriched.enforcement.is_none());
        assert!(enriched.enforcement_skipped);
    }

    #[test]
    fn canary_records_tier_mismatch_as_ineligible() {
        let planner = HintedPlanner::new(EnforcementConfig::default());
        let enriched = planner.plan("hello", Some(&warn_policy()), Tier::Premium);
        let canary = enriched.canary.unwrap_or_else(|| unreachable!());
        assert!(!canary.eligible);
        assert_eq!(canary.tier, Tier::Premium);
        assert!(enriched.enforcement.is_none());
        assert!(enriched.enforcement_skipped);
    }

    #[test]
    fn session_store_trims_and_expires() {
        let store = SessionStore::new(3, Duration::from_millis(20));
        for index in 0..5 {
            store.add_turn("s1", TurnRole::User, &format!("turn {index}"));
        }
        let context = store.get_prompt_context("s1");
        assert!(context.contains("turn 4"));
        assert!(!context.contains("turn 0"));
        assert_eq!(store.session_count(), 1);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.session_count(), 0);
        assert!(store.get_prompt_context("s1").is_empty());
    }

    #[test]
    fn executor_degrades_on_unregistered_capability() {
        let executor = Executor::new(
            registry_with(CapabilityRole::Retrieval),
            Arc::new(SessionStore::default()),
        );
        let result = executor.execute(
            CapabilityRole::General,
            CapabilityInput::from_prompt("hello"),
        );
        assert!((result.confidence).abs() < f64::EPSILON);
        assert!(result.output.contains("no capability found for role 'general'"));
    }

    #[test]
    fn executor_times_out_and_degrades() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityRole::General, Arc::new(SlowCapability));
        let executor = Executor::new(registry, Arc::new(SessionStore::default()))
            .with_invoke_timeout(Duration::from_millis(30));

        let result = executor.execute(
            CapabilityRole::General,
            CapabilityInput::from_prompt("hello"),
        );
        assert!((result.confidence).abs() < f64::EPSILON);
        assert_eq!(result.metadata["error"], "timeout");
        assert!(result.output.contains("could not be completed in time"));
    }

    #[test]
    fn executor_distinguishes_crashed_capability_from_timeout() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityRole::General, Arc::new(CrashingCapability));
        let executor = Executor::new(registry, Arc::new(SessionStore::default()));

        let result = executor.execute(
            CapabilityRole::General,
            CapabilityInput::from_prompt("hello"),
        );
        assert!((result.confidence).abs() < f64::EPSILON);
        assert_eq!(result.metadata["error"], "capability_failed");
        assert!(result.output.contains("worker exited without a result"));
        assert!(!result.output.contains("could not be completed in time"));
    }

    #[test]
    fn orchestrate_merges_routing_and_scorer_metadata() {
        let planner = HintedPlanner::new(EnforcementConfig::default());
        let executor = Executor::new(
            registry_with(CapabilityRole::General),
            Arc::new(SessionStore::default()),
        );
        let decision = planner.plan("hello there friend", None, Tier::Free);
        let result = executor.orchestrate("hello there friend", Some("s1"), &decision);

        assert_eq!(result.metadata["routing"]["selected_capability"], "general");
        assert_eq!(result.metadata["session_id"], "s1");
        assert!(result.metadata.get("analysis").is_some());
        assert!(result.metadata.get("validation").is_some());
        assert!(result.metadata["evaluation"]["score"].is_f64());
        assert!(result.confidence >= 0.0 && result.confidence <= 1.0);
    }

    #[test]
    fn orchestrate_injects_session_context_into_prompt() {
        let sessions = Arc::new(SessionStore::default());
        sessions.add_turn("s2", TurnRole::User, "earlier question");
        let executor = Executor::new(registry_with(CapabilityRole::General), Arc::clone(&sessions));
        let planner = HintedPlanner::new(EnforcementConfig::default());

        let decision = planner.plan("hello again", None, Tier::Free);
        let result = executor.orchestrate("hello again", Some("s2"), &decision);
        assert!(result.output.contains("[Previous conversation:]"));
        assert!(result.output.contains("earlier question"));
    }

    #[test]
    fn retrieval_route_attaches_chunks() {
        let executor = Executor::new(full_registry(), Arc::new(SessionStore::default()))
            .with_tools(Arc::new(default_tool_registry()));
        let planner = HintedPlanner::new(EnforcementConfig::default());

        let decision = planner.plan("search for python documents", None, Tier::Free);
        assert_eq!(decision.decision.role, CapabilityRole::Retrieval);
        let result = executor.orchestrate("search for python documents", None, &decision);
        assert!(result.metadata["retrieval"]["total_retrieved"]
            .as_u64()
            .is_some_and(|count| count >= 1));
    }

    #[test]
    fn plan_execution_fails_fast_on_unresolved_role() {
        let executor = Executor::new(
            registry_with(CapabilityRole::General),
            Arc::new(SessionStore::default()),
        );
        let plan = ExecutionPlan::new(
            "knowledge_query",
            "two-step fixture",
            vec![
                PlanStep {
                    step_id: 1,
                    role: CapabilityRole::General,
                    intent: "draft_answer".to_string(),
                    description: "Draft an answer.".to_string(),
                    depends_on: Vec::new(),
                    input: None,
                },
                PlanStep {
                    step_id: 2,
                    role: CapabilityRole::Critic,
                    intent: "validate_answer".to_string(),
                    description: "Validate the answer.".to_string(),
                    depends_on: vec![1],
                    input: None,
                },
            ],
        );

        let result = executor.execute_plan(&plan, "hello");
        assert!(result.is_ok());
        let result = result.unwrap_or_else(|_| unreachable!());
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(result.step_results[0].status, StepStatus::Completed);
        assert_eq!(result.step_results[1].status, StepStatus::Failed);
        let error = result.step_results[1].error.as_deref().unwrap_or_default();
        assert!(error.contains("no capability found for role 'critic'"));
        assert!(result.final_output.is_none());
    }

    #[test]
    fn plan_execution_accumulates_context_and_final_output() {
        let executor = Executor::new(full_registry(), Arc::new(SessionStore::default()));
        let plan = ExecutionPlan::new(
            "knowledge_query",
            "fixture",
            vec![
                PlanStep {
                    step_id: 1,
                    role: CapabilityRole::Retrieval,
                    intent: "fetch_context".to_string(),
                    description: "Retrieve relevant documents.".to_string(),
                    depends_on: Vec::new(),
                    input: Some(json!({"query": "find the answer"})),
                },
                PlanStep {
                    step_id: 2,
                    role: CapabilityRole::General,
                    intent: "draft_answer".to_string(),
                    description: "Draft the answer.".to_string(),
                    depends_on: vec![1],
                    input: None,
                },
            ],
        );

        let result = executor.execute_plan(&plan, "original prompt");
        assert!(result.is_ok());
        let result = result.unwrap_or_else(|_| unreachable!());
        assert_eq!(result.status, StepStatus::Completed);
        let final_output = result.final_output.as_deref().unwrap_or_default();
        assert!(final_output.starts_with("echo: original prompt"));
    }

    #[test]
    fn critic_blocks_when_no_grounding_context() {
        let report = Critic.validate_output(Some("some answer text"), &[], &json!({}));
        assert!(!report.is_safe);
        assert_eq!(report.risk_level, RiskLevel::High);
        assert_eq!(report.recommendation, Recommendation::Block);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue == "No grounding context available"));
    }

    #[test]
    fn critic_accepts_fully_grounded_output() {
        let chunks = vec![
            "Paris is the capital of France and its largest city".to_string(),
            "France is a country in Western Europe".to_string(),
            "The Seine river flows through Paris".to_string(),
        ];
        let report = Critic.validate_output(
            Some("Paris is the capital of France"),
            &chunks,
            &json!({"source": "doc", "timestamp": "2026-08-01T00:00:00Z"}),
        );
        assert!((report.grounding_score - 1.0).abs() < f64::EPSILON);
        assert!(report.is_safe);
        assert_eq!(report.recommendation, Recommendation::Proceed);
        assert_eq!(report.validated_claims.len(), 1);
        assert!(report.validated_claims[0].is_grounded);
    }

    #[test]
    fn critic_warns_on_missing_metadata() {
        let chunks = vec!["Paris is the capital of France and its largest city".to_string()];
        let report = Critic.validate_output(
            Some("Paris is the capital of France"),
            &chunks,
            &json!({}),
        );
        // Two missing-metadata issues push risk to medium.
        assert_eq!(report.risk_level, RiskLevel::Medium);
        assert_eq!(report.recommendation, Recommendation::Warn);
        assert!(!report.is_safe);
    }

    #[test]
    fn critic_neutral_score_for_stop_word_only_output() {
        let chunks = vec!["Paris is the capital of France".to_string()];
        let report = Critic.validate_output(Some("it is the very same"), &chunks, &json!({}));
        assert!((report.grounding_score - 0.5).abs() < f64::EPSILON);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.contains("no substantive content")));
    }

    #[test]
    fn critic_flags_failed_execution() {
        let execution = switchyard_domain::ExecutionResult::from_steps(
            "p1",
            vec![switchyard_domain::StepResult {
                step_id: 1,
                role: CapabilityRole::General,
                status: StepStatus::Failed,
                output: None,
                error: Some("boom".to_string()),
                duration_ms: 5,
                metadata: json!({}),
            }],
            None,
            json!({}),
        );
        let report = Critic.validate_execution(&execution);
        assert!(!report.is_safe);
        assert!(report.issues.iter().any(|issue| issue == "Execution failed"));
    }

    #[test]
    fn failed_execution_lowers_critic_confidence() {
        let steps = vec![
            switchyard_domain::StepResult {
                step_id: 1,
                role: CapabilityRole::Retrieval,
                status: StepStatus::Completed,
                output: Some("Paris is the capital of France".to_string()),
                error: None,
                duration_ms: 5,
                metadata: json!({"source": "doc", "timestamp": "2026-08-01T00:00:00Z"}),
            },
            switchyard_domain::StepResult {
                step_id: 2,
                role: CapabilityRole::General,
                status: StepStatus::Completed,
                output: Some("Paris is the capital of France".to_string()),
                error: None,
                duration_ms: 5,
                metadata: json!({}),
            },
            switchyard_domain::StepResult {
                step_id: 3,
                role: CapabilityRole::Critic,
                status: StepStatus::Failed,
                output: None,
                error: Some("boom".to_string()),
                duration_ms: 5,
                metadata: json!({}),
            },
        ];
        let execution = switchyard_domain::ExecutionResult::from_steps("p2", steps, None, json!({}));

        let report = Critic.validate_execution(&execution);
        assert!(report.issues.iter().any(|issue| issue == "Execution failed"));
        // Perfect grounding over one chunk scores 0.7; the failure
        // issue carries a 0.1 penalty.
        assert!((report.confidence_score - 0.6).abs() < 1e-9);
        assert_eq!(report.risk_level, RiskLevel::Low);
    }

    #[test]
    fn validator_flags_uncertainty_and_brevity() {
        let validator = Validator;
        let report = validator.validate("i don't know", "what is the answer?");
        assert!(!report.is_valid);
        assert!(report.confidence_delta < 0.0);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.contains("uncertainty signal")));

        let long_output = "word ".repeat(60);
        let report = validator.validate(&long_output, "tell me everything");
        assert!(report.is_valid);
        assert!(report.confidence_delta > 0.0);
    }

    #[test]
    fn analyst_classifies_query_types() {
        let analyst = Analyst;
        assert_eq!(
            analyst.analyze("out", "calculate 2 + 2").query_type,
            "calculation"
        );
        assert_eq!(
            analyst.analyze("out", "write a story about rust").query_type,
            "creative"
        );
        assert_eq!(
            analyst.analyze("out", "what is rust").query_type,
            "factual"
        );
        assert_eq!(analyst.analyze("out", "hello").query_type, "general");
    }

    #[test]
    fn evaluator_scores_are_weighted_and_clamped() {
        let evaluator = Evaluator;
        let report = evaluator.evaluate(
            "Paris is the capital of France. It is known for the Eiffel Tower.",
            "what is the capital of france?",
        );
        assert!(report.score > 0.0 && report.score <= 1.0);
        assert_eq!(report.signals.len(), 4);
        assert!(report.signals.contains_key("completeness"));
    }

    fn fixture_pipeline() -> Pipeline {
        let planner = HintedPlanner::new(EnforcementConfig::default());
        let executor = Executor::new(full_registry(), Arc::new(SessionStore::default()));
        let collector = TraceCollector::new(Arc::new(LogTraceSink), PolicyConfig::default());
        Pipeline::new(planner, executor, PolicyConfig::default(), collector)
    }

    #[test]
    fn pipeline_produces_final_response_with_policy_snapshot() {
        let pipeline = fixture_pipeline();
        let response: FinalResponse = pipeline.handle(&PipelineRequest::new("hello there"));

        assert!(!response.answer.is_empty());
        assert_eq!(
            response.metadata["routing"]["selected_capability"],
            "general"
        );
        assert!(response.metadata.get("critic").is_some());
        assert!(response.metadata.get("policy").is_some());
        assert_eq!(response.metadata["tier"], "free");
        // No grounding context on the general route: conservative block.
        assert!(!response.is_safe);
        assert_eq!(response.recommendation, Recommendation::Block);
    }

    #[test]
    fn pipeline_retrieval_route_can_proceed() {
        let pipeline = fixture_pipeline();
        let response = pipeline.handle(&PipelineRequest::new("search for python documents"));
        assert_eq!(
            response.metadata["routing"]["selected_capability"],
            "retrieval"
        );
        assert!(response.metadata["retrieval"]["total_retrieved"]
            .as_u64()
            .is_some_and(|count| count >= 1));
    }
}
