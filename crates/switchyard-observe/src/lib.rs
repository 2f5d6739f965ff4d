#![forbid(unsafe_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use switchyard_domain::{
    format_rfc3339, now_utc, recover, CapabilityResult, DateTimeUtc, EnforcementAudit,
    EvaluationRecord, ExecutionTrace, PolicyStatus,
};
use switchyard_policy::{classify_tier, evaluate_policy, PolicyConfig, COST_GUARD_RULE};

/// Side-effect-only destination for execution traces. Implementations
/// must not influence execution; the collector swallows their errors.
pub trait TraceSink: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn emit(&self, trace: &ExecutionTrace) -> Result<()>;
}

/// Default sink: one structured log event per trace.
#[derive(Debug, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn emit(&self, trace: &ExecutionTrace) -> Result<()> {
        tracing::info!(
            request_id = %trace.request_id,
            capability = %trace.capability_name,
            success = trace.success,
            latency_ms = trace.latency_ms(),
            error = trace.error.as_deref(),
            "execution trace"
        );
        Ok(())
    }
}

/// Persistence seam for evaluation signals extracted from traces.
pub trait EvaluationStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn save(&self, trace: &ExecutionTrace) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn read_all(&self) -> Result<Vec<EvaluationRecord>>;
}

/// Append-only JSONL evaluation storage. Human-readable, one record
/// per line, no external services.
#[derive(Debug, Clone)]
pub struct FileEvaluationStore {
    path: PathBuf,
}

impl FileEvaluationStore {
    /// # Errors
    /// Returns an error if the parent directory cannot be created.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Flatten a trace into the JSONL evaluation shape.
#[must_use]
pub fn extract_record(trace: &ExecutionTrace) -> EvaluationRecord {
    let metadata = &trace.metadata;
    let evaluation_score = metadata
        .get("evaluation")
        .and_then(|evaluation| evaluation.get("score"))
        .and_then(Value::as_f64);
    let validation_valid = metadata
        .get("validation")
        .and_then(|validation| validation.get("is_valid"))
        .and_then(Value::as_bool);
    let model = metadata
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let routing_reason = metadata
        .get("routing")
        .and_then(|routing| routing.get("reason"))
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let estimated_cost_usd = metadata.get("estimated_cost_usd").and_then(Value::as_f64);
    let policy_status = metadata
        .get("policy")
        .and_then(|policy| policy.get("status"))
        .and_then(|status| serde_json::from_value::<PolicyStatus>(status.clone()).ok());

    EvaluationRecord {
        request_id: trace.request_id.clone(),
        capability_name: trace.capability_name.clone(),
        timestamp: format_rfc3339(trace.started_at).unwrap_or_default(),
        latency_ms: trace.latency_ms(),
        model,
        evaluation_score,
        validation_valid,
        success: trace.success,
        routing_reason,
        error: trace.error.clone(),
        estimated_cost_usd,
        policy_status,
    }
}

impl EvaluationStore for FileEvaluationStore {
    fn save(&self, trace: &ExecutionTrace) -> Result<()> {
        let record = extract_record(trace);
        let line = serde_json::to_string(&record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<EvaluationRecord>> {
        load_records(&self.path, None)
    }
}

/// Load evaluation records from a JSONL file. A missing file is an
/// empty history, not an error. Unparseable lines are skipped with a
/// warning so one bad line cannot poison offline analysis.
///
/// # Errors
/// Returns an error if an existing file cannot be read.
pub fn load_records(path: &Path, limit: Option<usize>) -> Result<Vec<EvaluationRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut records = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<EvaluationRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed evaluation record");
            }
        }
        if let Some(limit) = limit {
            if records.len() >= limit {
                break;
            }
        }
    }
    Ok(records)
}

/// Criteria for offline record filtering. All fields are optional and
/// combine conjunctively.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub capability_name: Option<String>,
    pub success_only: bool,
    pub min_score: Option<f64>,
    pub max_cost_usd: Option<f64>,
}

#[must_use]
pub fn filter_records(records: &[EvaluationRecord], filter: &RecordFilter) -> Vec<EvaluationRecord> {
    records
        .iter()
        .filter(|record| {
            if let Some(name) = &filter.capability_name {
                if &record.capability_name != name {
                    return false;
                }
            }
            if filter.success_only && !record.success {
                return false;
            }
            if let Some(min_score) = filter.min_score {
                match record.evaluation_score {
                    Some(score) if score >= min_score => {}
                    _ => return false,
                }
            }
            if let Some(max_cost) = filter.max_cost_usd {
                match record.estimated_cost_usd {
                    Some(cost) if cost <= max_cost => {}
                    _ => return false,
                }
            }
            true
        })
        .cloned()
        .collect()
}

/// Aggregate statistics over a record set.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EvaluationSummary {
    pub count: usize,
    pub avg_score: Option<f64>,
    pub avg_cost_usd: Option<f64>,
    pub total_cost_usd: f64,
    pub avg_latency_ms: Option<f64>,
    pub success_rate: f64,
}

#[must_use]
pub fn summarize(records: &[EvaluationRecord]) -> EvaluationSummary {
    if records.is_empty() {
        return EvaluationSummary {
            count: 0,
            avg_score: None,
            avg_cost_usd: None,
            total_cost_usd: 0.0,
            avg_latency_ms: None,
            success_rate: 0.0,
        };
    }

    let scores: Vec<f64> = records
        .iter()
        .filter_map(|record| record.evaluation_score)
        .collect();
    let costs: Vec<f64> = records
        .iter()
        .filter_map(|record| record.estimated_cost_usd)
        .collect();
    let latencies: Vec<f64> = records
        .iter()
        .map(|record| record.latency_ms as f64)
        .collect();
    let successes = records.iter().filter(|record| record.success).count();

    let average = |values: &[f64]| -> Option<f64> {
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    };

    EvaluationSummary {
        count: records.len(),
        avg_score: average(&scores),
        avg_cost_usd: average(&costs),
        total_cost_usd: costs.iter().sum(),
        avg_latency_ms: average(&latencies),
        success_rate: successes as f64 / records.len() as f64,
    }
}

/// Append-only JSONL log of enforcement decisions.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// # Errors
    /// Returns an error if the parent directory cannot be created.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// # Errors
    /// Returns an error if the line cannot be appended.
    pub fn append(&self, audit: &EnforcementAudit) -> Result<()> {
        let line = serde_json::to_string(audit)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn read_all(&self) -> Result<Vec<EnforcementAudit>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let mut records = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }
}

/// Per-model prices in USD per 1K tokens. Configuration, not logic.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

const MODEL_PRICING: &[(&str, ModelPricing)] = &[
    (
        "gpt-4o-mini",
        ModelPricing {
            input_per_1k: 0.000_15,
            output_per_1k: 0.000_6,
        },
    ),
    (
        "gpt-4o",
        ModelPricing {
            input_per_1k: 0.002_5,
            output_per_1k: 0.01,
        },
    ),
    (
        "gpt-4-turbo",
        ModelPricing {
            input_per_1k: 0.01,
            output_per_1k: 0.03,
        },
    ),
    (
        "gpt-3.5-turbo",
        ModelPricing {
            input_per_1k: 0.000_5,
            output_per_1k: 0.001_5,
        },
    ),
    (
        "deterministic-v1",
        ModelPricing {
            input_per_1k: 0.000_15,
            output_per_1k: 0.000_6,
        },
    ),
];

const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input_per_1k: 0.001,
    output_per_1k: 0.002,
};

/// Look up pricing for a model, tolerating deployment-name variants.
/// Unknown models get a conservative default.
#[must_use]
pub fn pricing_for(model: &str) -> ModelPricing {
    let model_lower = model.to_ascii_lowercase();
    for (known, pricing) in MODEL_PRICING {
        if *known == model_lower || model_lower.contains(known) || known.contains(&*model_lower) {
            return *pricing;
        }
    }
    DEFAULT_PRICING
}

/// Estimate request cost from trace metadata. Total function: missing
/// or malformed data yields 0.0, never an error.
///
/// The metadata carries one total token count, so input/output are
/// estimated at the typical 70/30 chat split.
#[must_use]
pub fn estimate_cost(metadata: &Value) -> f64 {
    let model = metadata
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let pricing = pricing_for(model);
    let total_tokens = metadata
        .get("tokens_used")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
        .max(0.0);

    let input_tokens = (total_tokens * 0.7).floor();
    let output_tokens = (total_tokens * 0.3).floor();
    let input_cost = input_tokens / 1000.0 * pricing.input_per_1k;
    let output_cost = output_tokens / 1000.0 * pricing.output_per_1k;
    round8(input_cost + output_cost)
}

/// Detailed cost breakdown for inspection and tooling.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CostBreakdown {
    pub estimated_cost_usd: f64,
    pub model: String,
    pub total_tokens: u64,
    pub input_tokens_est: u64,
    pub output_tokens_est: u64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub pricing: ModelPricing,
}

#[must_use]
pub fn estimate_cost_detailed(metadata: &Value) -> CostBreakdown {
    let model = metadata
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let pricing = pricing_for(&model);
    let total_tokens = metadata
        .get("tokens_used")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let total = total_tokens as f64;
    let input_tokens_est = (total * 0.7).floor();
    let output_tokens_est = (total * 0.3).floor();
    let input_cost_usd = round8(input_tokens_est / 1000.0 * pricing.input_per_1k);
    let output_cost_usd = round8(output_tokens_est / 1000.0 * pricing.output_per_1k);

    CostBreakdown {
        estimated_cost_usd: round8(input_cost_usd + output_cost_usd),
        model,
        total_tokens,
        input_tokens_est: input_tokens_est as u64,
        output_tokens_est: output_tokens_est as u64,
        input_cost_usd,
        output_cost_usd,
        pricing,
    }
}

fn round8(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// Telemetry endpoint configuration. Disabled by default so a missing
/// backend never affects local runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8001".to_string(),
            timeout_ms: 500,
        }
    }
}

impl TelemetryConfig {
    /// Load telemetry settings from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read telemetry config {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse telemetry config {}", path.display()))
    }
}

/// Transport seam for telemetry delivery, so the worker can be
/// exercised without a network.
pub trait TelemetryTransport: Send {
    #[allow(clippy::missing_errors_doc)]
    fn post(&self, endpoint: &str, payload: &Value) -> Result<()>;
}

struct HttpTransport {
    base_url: String,
    timeout_ms: u64,
}

impl TelemetryTransport for HttpTransport {
    fn post(&self, endpoint: &str, payload: &Value) -> Result<()> {
        let url = format!("{}{endpoint}", self.base_url);
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build();
        agent
            .request("POST", &url)
            .set("content-type", "application/json")
            .send_json(payload)
            .map_err(|err| anyhow!("telemetry POST to {endpoint} failed: {err}"))?;
        Ok(())
    }
}

const TELEMETRY_QUEUE_DEPTH: usize = 256;

/// Fire-and-forget publisher of execution facts.
///
/// Payloads go through a bounded queue drained by a dedicated worker
/// thread. A full queue drops the payload and counts the drop; the
/// request path never blocks on telemetry.
pub struct TelemetryPublisher {
    enabled: bool,
    sender: Option<SyncSender<(String, Value)>>,
    worker: Option<JoinHandle<()>>,
    sent: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryPublisher {
    #[must_use]
    pub fn new(config: &TelemetryConfig) -> Self {
        let transport = HttpTransport {
            base_url: config.base_url.clone(),
            timeout_ms: config.timeout_ms,
        };
        Self::with_transport(config.enabled, Box::new(transport))
    }

    #[must_use]
    pub fn with_transport(enabled: bool, transport: Box<dyn TelemetryTransport>) -> Self {
        let sent = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));

        if !enabled {
            return Self {
                enabled,
                sender: None,
                worker: None,
                sent,
                dropped,
            };
        }

        let (sender, receiver) = sync_channel::<(String, Value)>(TELEMETRY_QUEUE_DEPTH);
        let worker_sent = Arc::clone(&sent);
        let worker = std::thread::spawn(move || {
            while let Ok((endpoint, payload)) = receiver.recv() {
                match transport.post(&endpoint, &payload) {
                    Ok(()) => {
                        worker_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        tracing::warn!(endpoint, error = %format!("{err:#}"), "telemetry post failed");
                    }
                }
            }
        });

        Self {
            enabled,
            sender: Some(sender),
            worker: Some(worker),
            sent,
            dropped,
        }
    }

    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, endpoint: &str, payload: Value) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send((endpoint.to_string(), payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(endpoint, "telemetry queue full, payload dropped");
            }
        }
    }

    /// Publish all payload types derived from one trace.
    /// Order: trace, cost, evaluation, policy, sla.
    pub fn publish_all(&self, trace: &ExecutionTrace) {
        if !self.enabled {
            return;
        }
        self.enqueue("/ingest/trace", build_trace_payload(trace));
        self.enqueue("/ingest/cost", build_cost_payload(trace));
        self.enqueue("/ingest/evaluation", build_evaluation_payload(trace));
        if let Some(payload) = build_policy_payload(trace) {
            self.enqueue("/ingest/policy", payload);
        }
        if let Some(payload) = build_sla_payload(trace) {
            self.enqueue("/ingest/sla", payload);
        }
    }

    /// Drain the queue and stop the worker.
    pub fn shutdown(&mut self) {
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("telemetry worker panicked during shutdown");
            }
        }
    }
}

impl Drop for TelemetryPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TelemetryPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryPublisher")
            .field("enabled", &self.enabled)
            .field("sent", &self.sent_count())
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[must_use]
pub fn build_trace_payload(trace: &ExecutionTrace) -> Value {
    json!({
        "request_id": trace.request_id,
        "capability_name": trace.capability_name,
        "success": trace.success,
        "started_at": format_rfc3339(trace.started_at).unwrap_or_default(),
        "finished_at": format_rfc3339(trace.finished_at).unwrap_or_default(),
        "latency_ms": trace.latency_ms(),
        "metadata": trace.metadata,
        "session_id": trace.metadata.get("session_id"),
        "error": trace.error,
    })
}

#[must_use]
pub fn build_cost_payload(trace: &ExecutionTrace) -> Value {
    let metadata = &trace.metadata;
    let total_tokens = metadata
        .get("tokens_used")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    json!({
        "request_id": trace.request_id,
        "model": metadata.get("model").and_then(Value::as_str).unwrap_or("unknown"),
        "total_tokens": total_tokens,
        "estimated_cost_usd": metadata.get("estimated_cost_usd").and_then(Value::as_f64).unwrap_or(0.0),
        "session_id": metadata.get("session_id"),
        "capability_name": trace.capability_name,
    })
}

#[must_use]
pub fn build_evaluation_payload(trace: &ExecutionTrace) -> Value {
    let validation = trace.metadata.get("validation").cloned().unwrap_or(json!({}));
    let evaluation = trace.metadata.get("evaluation").cloned().unwrap_or(json!({}));
    let score = evaluation
        .get("score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let is_valid = validation
        .get("is_valid")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    json!({
        "request_id": trace.request_id,
        "score": score,
        "passed": trace.success && is_valid,
        "evaluator": "critic",
        "details": {
            "validation": validation,
            "evaluation": evaluation,
        },
        "session_id": trace.metadata.get("session_id"),
    })
}

#[must_use]
pub fn build_policy_payload(trace: &ExecutionTrace) -> Option<Value> {
    let policy = trace.metadata.get("policy")?;
    Some(json!({
        "request_id": trace.request_id,
        "status": policy.get("status").and_then(Value::as_str).unwrap_or("pass"),
        "violations": policy.get("violations").cloned().unwrap_or(json!([])),
        "warnings": policy.get("warnings").cloned().unwrap_or(json!([])),
        "checked_rules": policy.get("checked_rules").and_then(Value::as_u64).unwrap_or(0),
        "session_id": trace.metadata.get("session_id"),
    }))
}

#[must_use]
pub fn build_sla_payload(trace: &ExecutionTrace) -> Option<Value> {
    let sla = trace.metadata.get("sla")?;
    Some(json!({
        "request_id": trace.request_id,
        "tier": sla.get("tier").and_then(Value::as_str).unwrap_or("unknown"),
        "limits": sla.get("limits").cloned().unwrap_or(json!({})),
        "session_id": trace.metadata.get("session_id"),
    }))
}

/// Coordinates the trace lifecycle: annotate, emit, persist, audit,
/// publish. `capture` never returns an error and never panics; every
/// downstream failure is logged and swallowed so observability cannot
/// break a user-visible response.
pub struct TraceCollector {
    sink: Arc<dyn TraceSink>,
    store: Option<Arc<dyn EvaluationStore>>,
    audit_log: Option<AuditLog>,
    publisher: Option<Arc<TelemetryPublisher>>,
    policy_config: PolicyConfig,
    enabled: bool,
}

impl TraceCollector {
    #[must_use]
    pub fn new(sink: Arc<dyn TraceSink>, policy_config: PolicyConfig) -> Self {
        Self {
            sink,
            store: None,
            audit_log: None,
            publisher: None,
            policy_config,
            enabled: true,
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn EvaluationStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_audit_log(mut self, audit_log: AuditLog) -> Self {
        self.audit_log = Some(audit_log);
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<TelemetryPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Capture a trace for a completed execution.
    pub fn capture(
        &self,
        request_id: &str,
        result: &CapabilityResult,
        started_at: DateTimeUtc,
        success: bool,
        error: Option<&str>,
    ) {
        if !self.enabled {
            return;
        }
        let trace = self.build_trace(
            request_id,
            result.capability.as_str(),
            result.metadata.clone(),
            started_at,
            success,
            error,
        );
        self.dispatch(&trace);
    }

    /// Capture a trace for a failure that happened before a result
    /// existed.
    pub fn capture_failure(
        &self,
        request_id: &str,
        capability_name: &str,
        started_at: DateTimeUtc,
        error: &str,
        metadata: Value,
    ) {
        if !self.enabled {
            return;
        }
        let trace =
            self.build_trace(request_id, capability_name, metadata, started_at, false, Some(error));
        self.dispatch(&trace);
    }

    fn build_trace(
        &self,
        request_id: &str,
        capability_name: &str,
        metadata: Value,
        started_at: DateTimeUtc,
        success: bool,
        error: Option<&str>,
    ) -> ExecutionTrace {
        let finished_at = now_utc();
        let mut trace = ExecutionTrace {
            request_id: request_id.to_string(),
            capability_name: capability_name.to_string(),
            success,
            started_at,
            finished_at,
            metadata,
            error: error.map(ToString::to_string),
        };
        self.annotate(&mut trace);
        trace
    }

    /// Attach derived annotations. Each sub-call is isolated: a fault
    /// in one degrades that annotation to a neutral default and leaves
    /// the others intact.
    fn annotate(&self, trace: &mut ExecutionTrace) {
        if !trace.metadata.is_object() {
            trace.metadata = Value::Object(serde_json::Map::default());
        }
        let latency_ms = trace.latency_ms();
        if let Some(map) = trace.metadata.as_object_mut() {
            map.insert("latency_ms".to_string(), json!(latency_ms));
        }

        let cost = recover("cost_estimate", || 0.0, || Ok(estimate_cost(&trace.metadata)));
        if let Some(map) = trace.metadata.as_object_mut() {
            map.insert("estimated_cost_usd".to_string(), json!(cost.value));
        }

        let policy = recover(
            "policy_snapshot",
            switchyard_domain::PolicyResult::pass,
            || Ok(evaluate_policy(&trace.metadata, &self.policy_config)),
        );
        let sla = recover(
            "sla_classification",
            || classify_tier(&json!({})),
            || Ok(classify_tier(&trace.metadata)),
        );
        if let Some(map) = trace.metadata.as_object_mut() {
            map.insert("policy".to_string(), json!(policy.value));
            map.insert(
                "sla".to_string(),
                json!({
                    "tier": sla.value.0.as_str(),
                    "limits": {"max_cost_usd": sla.value.1.max_cost_usd},
                }),
            );
        }
    }

    fn dispatch(&self, trace: &ExecutionTrace) {
        if let Err(err) = self.sink.emit(trace) {
            tracing::warn!(error = %format!("{err:#}"), "trace sink emit failed");
        }

        if let Some(store) = &self.store {
            if let Err(err) = store.save(trace) {
                tracing::warn!(error = %format!("{err:#}"), "evaluation store save failed");
            }
        }

        self.write_audit_lines(trace);

        if let Some(publisher) = &self.publisher {
            publisher.publish_all(trace);
        }
    }

    /// One audit line when enforcement was applied, another when the
    /// canary excluded an otherwise eligible request.
    fn write_audit_lines(&self, trace: &ExecutionTrace) {
        let Some(audit_log) = &self.audit_log else {
            return;
        };
        let routing = trace.metadata.get("routing");

        let enforcement = routing.and_then(|value| value.get("policy_enforcement"));
        if let Some(enforcement) = enforcement {
            let applied = enforcement
                .get("applied")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if applied {
                let audit = EnforcementAudit {
                    rule_id: enforcement
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or(COST_GUARD_RULE)
                        .to_string(),
                    action: "enforce".to_string(),
                    trigger_reason: enforcement
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    applied: true,
                    timestamp: trace.finished_at,
                    request_id: Some(trace.request_id.clone()),
                };
                if let Err(err) = audit_log.append(&audit) {
                    tracing::warn!(error = %format!("{err:#}"), "audit append failed");
                }
            }
        }

        let canary = routing.and_then(|value| value.get("canary"));
        if let Some(canary) = canary {
            let eligible = canary
                .get("eligible")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let sampled = canary
                .get("sampled")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if eligible && !sampled {
                let audit = EnforcementAudit {
                    rule_id: COST_GUARD_RULE.to_string(),
                    action: "skip".to_string(),
                    trigger_reason: "canary_not_sampled".to_string(),
                    applied: false,
                    timestamp: trace.finished_at,
                    request_id: Some(trace.request_id.clone()),
                };
                if let Err(err) = audit_log.append(&audit) {
                    tracing::warn!(error = %format!("{err:#}"), "audit append failed");
                }
            }
        }
    }
}

impl std::fmt::Debug for TraceCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceCollector")
            .field("enabled", &self.enabled)
            .field("has_store", &self.store.is_some())
            .field("has_audit_log", &self.audit_log.is_some())
            .field("has_publisher", &self.publisher.is_some())
            .finish()
    }
}
