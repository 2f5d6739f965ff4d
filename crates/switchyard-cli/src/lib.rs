//! Command surface for the request orchestration control plane.
//!
//! Host processes should embed behavior through [`run_cli`] with a
//! parsed [`Cli`], or reach for the individual `run_*` helpers when a
//! single command group is wanted.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use switchyard_capability::{CapabilityRegistry, DeterministicCapability};
use switchyard_core::{
    default_tool_registry, Executor, HintedPlanner, Pipeline, PipelineRequest, SessionStore,
};
use switchyard_domain::{CapabilityRole, PolicyResult, Tier};
use switchyard_observe::{
    filter_records, load_records, summarize, AuditLog, FileEvaluationStore, LogTraceSink,
    RecordFilter, TelemetryConfig, TelemetryPublisher, TraceCollector,
};
use switchyard_policy::{
    compare_policies, simulate, EnforcementConfig, GraduationEvaluator, GraduationThresholds,
    OutcomeValidator, PolicyConfig,
};

#[derive(Debug, Parser)]
#[command(name = "switchyard")]
#[command(about = "Request orchestration control plane")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute one request through the full orchestration flow.
    Run(RunArgs),
    /// Summarize the evaluation log.
    Stats(StatsArgs),
    /// Replay the evaluation log under a candidate policy.
    Simulate(SimulateArgs),
    /// Decide whether canary enforcement may graduate.
    Graduate(GraduateArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    pub prompt: String,
    #[arg(long)]
    pub session: Option<String>,
    #[arg(long, value_enum, default_value_t = TierArg::Free)]
    pub tier: TierArg,
    #[arg(long, default_value = "./switchyard_evaluations.jsonl")]
    pub evaluations: PathBuf,
    #[arg(long)]
    pub audit_log: Option<PathBuf>,
    #[arg(long)]
    pub policy_config: Option<PathBuf>,
    #[arg(long)]
    pub enforcement_config: Option<PathBuf>,
    #[arg(long)]
    pub telemetry_config: Option<PathBuf>,
    /// Policy result from the previous request, as JSON. Feeds the
    /// policy-hint layer the way a resident caller would.
    #[arg(long)]
    pub prior_policy_json: Option<String>,
    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct StatsArgs {
    #[arg(long)]
    pub evaluations: PathBuf,
    #[arg(long)]
    pub capability: Option<String>,
    #[arg(long)]
    pub success_only: bool,
    #[arg(long)]
    pub min_score: Option<f64>,
    #[arg(long)]
    pub max_cost_usd: Option<f64>,
    #[arg(long)]
    pub limit: Option<usize>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct SimulateArgs {
    #[arg(long)]
    pub evaluations: PathBuf,
    #[arg(long)]
    pub policy_config: Option<PathBuf>,
    #[arg(long)]
    pub max_cost_usd: Option<f64>,
    #[arg(long)]
    pub min_score: Option<f64>,
    #[arg(long)]
    pub max_latency_ms: Option<u64>,
    /// Also simulate the unmodified base policy and report the delta.
    #[arg(long)]
    pub compare: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct GraduateArgs {
    #[arg(long)]
    pub evaluations: PathBuf,
    #[arg(long)]
    pub audit_log: PathBuf,
    #[arg(long, value_enum, default_value_t = TierArg::Free)]
    pub tier: TierArg,
    #[arg(long)]
    pub max_drift_pct: Option<f64>,
    #[arg(long)]
    pub max_critical_audits: Option<u32>,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    Free,
    Standard,
    Premium,
}

impl From<TierArg> for Tier {
    fn from(value: TierArg) -> Self {
        match value {
            TierArg::Free => Tier::Free,
            TierArg::Standard => Tier::Standard,
            TierArg::Premium => Tier::Premium,
        }
    }
}

/// Executes the parsed top-level command graph.
///
/// # Errors
/// Returns an error when configuration loading, log access, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => run_request(&args),
        Command::Stats(args) => run_stats(&args),
        Command::Simulate(args) => run_simulate(&args),
        Command::Graduate(args) => run_graduate(&args),
    }
}

/// Executes one request end to end and prints the final response.
///
/// # Errors
/// Returns an error when a config file cannot be loaded or the
/// evaluation store cannot be opened.
pub fn run_request(args: &RunArgs) -> Result<()> {
    let policy_config = load_policy_config(args.policy_config.as_deref())?;
    let enforcement = load_enforcement_config(args.enforcement_config.as_deref())?;
    let prior_policy = parse_prior_policy(args.prior_policy_json.as_deref())?;

    let mut registry = CapabilityRegistry::new();
    for role in [
        CapabilityRole::General,
        CapabilityRole::Retrieval,
        CapabilityRole::Critic,
    ] {
        registry.register(role, Arc::new(DeterministicCapability::new()));
    }

    let executor = Executor::new(registry, Arc::new(SessionStore::default()))
        .with_tools(Arc::new(default_tool_registry()))
        .with_invoke_timeout(Duration::from_millis(args.timeout_ms));

    let store = FileEvaluationStore::new(&args.evaluations)?;
    let mut collector = TraceCollector::new(Arc::new(LogTraceSink), policy_config.clone())
        .with_store(Arc::new(store));
    if let Some(path) = &args.audit_log {
        collector = collector.with_audit_log(AuditLog::new(path)?);
    }
    if let Some(path) = &args.telemetry_config {
        let telemetry = TelemetryConfig::from_yaml_file(path)?;
        collector = collector.with_publisher(Arc::new(TelemetryPublisher::new(&telemetry)));
    }

    let pipeline = Pipeline::new(
        HintedPlanner::new(enforcement),
        executor,
        policy_config,
        collector,
    );
    let request = PipelineRequest {
        prompt: args.prompt.clone(),
        session_id: args.session.clone(),
        tier: args.tier.into(),
        prior_policy,
    };
    let response = pipeline.handle(&request);
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// # Errors
/// Returns an error when the evaluation log cannot be read.
pub fn run_stats(args: &StatsArgs) -> Result<()> {
    let records = load_records(&args.evaluations, args.limit)?;
    let filter = RecordFilter {
        capability_name: args.capability.clone(),
        success_only: args.success_only,
        min_score: args.min_score,
        max_cost_usd: args.max_cost_usd,
    };
    let filtered = filter_records(&records, &filter);
    let summary = summarize(&filtered);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("records:        {}", summary.count);
        println!(
            "avg_score:      {}",
            summary
                .avg_score
                .map_or_else(|| "n/a".to_string(), |value| format!("{value:.3}"))
        );
        println!(
            "avg_cost_usd:   {}",
            summary
                .avg_cost_usd
                .map_or_else(|| "n/a".to_string(), |value| format!("{value:.8}"))
        );
        println!("total_cost_usd: {:.8}", summary.total_cost_usd);
        println!(
            "avg_latency_ms: {}",
            summary
                .avg_latency_ms
                .map_or_else(|| "n/a".to_string(), |value| format!("{value:.1}"))
        );
        println!("success_rate:   {:.1}%", summary.success_rate * 100.0);
    }
    Ok(())
}

/// # Errors
/// Returns an error when the evaluation log or the base policy config
/// cannot be loaded.
pub fn run_simulate(args: &SimulateArgs) -> Result<()> {
    let records = load_records(&args.evaluations, None)?;
    let base = load_policy_config(args.policy_config.as_deref())?;
    let proposed = apply_policy_overrides(base.clone(), args);

    if args.compare {
        let comparison = compare_policies(&records, &base, &proposed);
        println!("{}", serde_json::to_string_pretty(&comparison)?);
        return Ok(());
    }

    let result = simulate(&records, &proposed);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.summary());
    }
    Ok(())
}

/// # Errors
/// Returns an error when the evaluation or audit log cannot be read.
pub fn run_graduate(args: &GraduateArgs) -> Result<()> {
    let records = load_records(&args.evaluations, None)?;
    let audits = AuditLog::new(&args.audit_log)?.read_all()?;

    let tier: Tier = args.tier.into();
    let drift = OutcomeValidator.validate(&records, tier);

    let mut thresholds = GraduationThresholds::default();
    if let Some(value) = args.max_drift_pct {
        thresholds.max_drift_pct = value;
    }
    if let Some(value) = args.max_critical_audits {
        thresholds.max_critical_audits = value;
    }
    let result = GraduationEvaluator::new(thresholds).evaluate(&drift, &audits);

    if args.json {
        let payload = serde_json::json!({
            "drift": drift,
            "graduation": result,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("rule:            {}", result.rule);
        println!("tier:            {}", result.tier);
        println!(
            "predicted/actual: {}/{}",
            drift.predicted_enforcements, drift.actual_enforcements
        );
        println!("cost_error_pct:  {:.1}", drift.cost_error_pct);
        println!("recommendation:  {}", result.recommendation.as_str());
        for reason in &result.reasons {
            println!("reason:          {reason}");
        }
    }
    Ok(())
}

fn load_policy_config(path: Option<&Path>) -> Result<PolicyConfig> {
    match path {
        Some(path) => PolicyConfig::from_yaml_file(path),
        None => Ok(PolicyConfig::default()),
    }
}

fn load_enforcement_config(path: Option<&Path>) -> Result<EnforcementConfig> {
    match path {
        Some(path) => EnforcementConfig::from_yaml_file(path),
        None => Ok(EnforcementConfig::default()),
    }
}

fn parse_prior_policy(raw: Option<&str>) -> Result<Option<PolicyResult>> {
    match raw {
        Some(raw) => {
            let parsed = serde_json::from_str(raw)
                .with_context(|| format!("prior policy must be valid JSON: {raw}"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn apply_policy_overrides(mut config: PolicyConfig, args: &SimulateArgs) -> PolicyConfig {
    if let Some(value) = args.max_cost_usd {
        config.max_cost_usd = value;
    }
    if let Some(value) = args.min_score {
        config.min_evaluation_score = value;
    }
    if let Some(value) = args.max_latency_ms {
        config.max_latency_ms = value;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::{apply_policy_overrides, parse_prior_policy, Cli, SimulateArgs, TierArg};
    use clap::Parser;
    use switchyard_domain::{PolicyStatus, PolicyWarning, Tier};
    use switchyard_policy::PolicyConfig;

    fn must<T>(result: anyhow::Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn tier_arg_maps_onto_domain_tier() {
        assert_eq!(Tier::from(TierArg::Free), Tier::Free);
        assert_eq!(Tier::from(TierArg::Premium), Tier::Premium);
    }

    #[test]
    fn prior_policy_parses_from_json() {
        let parsed = must(parse_prior_policy(Some(
            r#"{"status":"warn","violations":[],"warnings":["elevated_cost"],"checked_rules":4}"#,
        )));
        let Some(parsed) = parsed else { unreachable!() };
        assert_eq!(parsed.status, PolicyStatus::Warn);
        assert_eq!(parsed.warnings, vec![PolicyWarning::ElevatedCost]);

        assert!(must(parse_prior_policy(None)).is_none());
        assert!(parse_prior_policy(Some("{")).is_err());
    }

    #[test]
    fn simulate_overrides_replace_only_named_thresholds() {
        let args = SimulateArgs {
            evaluations: "unused.jsonl".into(),
            policy_config: None,
            max_cost_usd: Some(0.002),
            min_score: None,
            max_latency_ms: Some(1_000),
            compare: false,
            json: false,
        };
        let config = apply_policy_overrides(PolicyConfig::default(), &args);
        assert!((config.max_cost_usd - 0.002).abs() < f64::EPSILON);
        assert_eq!(config.max_latency_ms, 1_000);
        assert!(
            (config.min_evaluation_score - PolicyConfig::default().min_evaluation_score).abs()
                < f64::EPSILON
        );
    }

    #[test]
    fn cli_rejects_run_without_prompt() {
        let parsed = Cli::try_parse_from(vec!["switchyard", "run"]);
        assert!(parsed.is_err());
    }
}
