use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use switchyard_cli::{run_cli, Cli};
use switchyard_domain::{now_utc, EnforcementAudit};
use switchyard_observe::{load_records, AuditLog};
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("switchyard-cli-{}-{name}", Ulid::new()))
}

fn execute(args: &[&str]) -> Result<()> {
    let cli = Cli::try_parse_from(args)?;
    run_cli(cli)
}

fn write_jsonl(path: &Path, lines: &[Value]) {
    let mut file = match std::fs::File::create(path) {
        Ok(file) => file,
        Err(err) => panic!("failed to create fixture file: {err}"),
    };
    for line in lines {
        if let Err(err) = writeln!(file, "{line}") {
            panic!("failed to write fixture line: {err}");
        }
    }
}

fn fixture_record(cost: f64, score: f64, policy_status: &str, routing_reason: &str) -> Value {
    json!({
        "request_id": Ulid::new().to_string(),
        "capability_name": "general",
        "timestamp": "2026-08-01T00:00:00Z",
        "latency_ms": 20,
        "model": "gpt-4o-mini",
        "evaluation_score": score,
        "validation_valid": true,
        "success": true,
        "routing_reason": routing_reason,
        "error": null,
        "estimated_cost_usd": cost,
        "policy_status": policy_status,
    })
}

#[test]
fn run_writes_an_evaluation_record() {
    let evaluations = temp_path("run-evals.jsonl");
    let evaluations_str = evaluations.display().to_string();

    must(execute(&[
        "switchyard",
        "run",
        "--prompt",
        "search for python documents",
        "--session",
        "s1",
        "--evaluations",
        &evaluations_str,
    ]));

    let records = must(load_records(&evaluations, None));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].capability_name, "retrieval");
    assert!(records[0].estimated_cost_usd.is_some());
    assert!(records[0].policy_status.is_some());
    assert!(records[0].success);

    let _ = std::fs::remove_file(&evaluations);
}

#[test]
fn run_with_prior_warn_enforces_and_audits() {
    let evaluations = temp_path("enforce-evals.jsonl");
    let audit_path = temp_path("enforce-audit.jsonl");
    let enforcement_path = temp_path("enforcement.yaml");
    // Canary off: an eligible warn enforces unconditionally.
    if let Err(err) = std::fs::write(
        &enforcement_path,
        "enabled: true\nenabled_rules:\n  - cost_guard\ncanary:\n  enabled: false\n  tier: free\n  percentage: 5\n",
    ) {
        panic!("failed to write enforcement config: {err}");
    }

    let evaluations_str = evaluations.display().to_string();
    let audit_str = audit_path.display().to_string();
    let enforcement_str = enforcement_path.display().to_string();
    must(execute(&[
        "switchyard",
        "run",
        "--prompt",
        "hello there",
        "--evaluations",
        &evaluations_str,
        "--audit-log",
        &audit_str,
        "--enforcement-config",
        &enforcement_str,
        "--prior-policy-json",
        r#"{"status":"warn","violations":[],"warnings":["elevated_cost"],"checked_rules":4}"#,
    ]));

    let audits = must(must(AuditLog::new(&audit_path)).read_all());
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].rule_id, "cost_guard");
    assert_eq!(audits[0].action, "enforce");
    assert!(audits[0].applied);

    let _ = std::fs::remove_file(&evaluations);
    let _ = std::fs::remove_file(&audit_path);
    let _ = std::fs::remove_file(&enforcement_path);
}

#[test]
fn stats_and_simulate_read_the_fixture_log() {
    let evaluations = temp_path("sim-evals.jsonl");
    write_jsonl(
        &evaluations,
        &[
            fixture_record(0.000_01, 0.9, "pass", "default routing for general queries"),
            fixture_record(0.000_7, 0.8, "warn", "default routing for general queries"),
            fixture_record(0.002, 0.3, "fail", "default routing for general queries"),
        ],
    );
    let evaluations_str = evaluations.display().to_string();

    must(execute(&[
        "switchyard",
        "stats",
        "--evaluations",
        &evaluations_str,
        "--json",
    ]));
    must(execute(&[
        "switchyard",
        "stats",
        "--evaluations",
        &evaluations_str,
        "--success-only",
        "--min-score",
        "0.5",
    ]));
    must(execute(&[
        "switchyard",
        "simulate",
        "--evaluations",
        &evaluations_str,
        "--max-cost-usd",
        "0.0005",
        "--json",
    ]));
    must(execute(&[
        "switchyard",
        "simulate",
        "--evaluations",
        &evaluations_str,
        "--max-cost-usd",
        "0.0005",
        "--compare",
    ]));

    let _ = std::fs::remove_file(&evaluations);
}

#[test]
fn simulate_tolerates_a_missing_log() {
    let absent = temp_path("absent.jsonl");
    let absent_str = absent.display().to_string();
    must(execute(&[
        "switchyard",
        "simulate",
        "--evaluations",
        &absent_str,
    ]));
}

#[test]
fn graduate_reads_drift_and_audit_history() {
    let evaluations = temp_path("grad-evals.jsonl");
    let audit_path = temp_path("grad-audit.jsonl");
    write_jsonl(
        &evaluations,
        &[
            fixture_record(0.000_1, 0.8, "warn", "cost guard applied"),
            fixture_record(0.000_2, 0.7, "warn", "cost guard applied"),
            fixture_record(0.000_01, 0.9, "pass", "default routing for general queries"),
        ],
    );

    let audit_log = must(AuditLog::new(&audit_path));
    must(audit_log.append(&EnforcementAudit {
        rule_id: "cost_guard".to_string(),
        action: "enforce".to_string(),
        trigger_reason: "policy_warn_high_cost".to_string(),
        applied: true,
        timestamp: now_utc(),
        request_id: Some(Ulid::new().to_string()),
    }));

    let evaluations_str = evaluations.display().to_string();
    let audit_str = audit_path.display().to_string();
    must(execute(&[
        "switchyard",
        "graduate",
        "--evaluations",
        &evaluations_str,
        "--audit-log",
        &audit_str,
        "--tier",
        "free",
        "--json",
    ]));
    must(execute(&[
        "switchyard",
        "graduate",
        "--evaluations",
        &evaluations_str,
        "--audit-log",
        &audit_str,
    ]));

    let _ = std::fs::remove_file(&evaluations);
    let _ = std::fs::remove_file(&audit_path);
}
