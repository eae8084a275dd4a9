//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{DeployPlan, StatusSummary, UninstallReport};
use crate::deploy::{
    DeployError, DeployOutcome, DeploymentReport, ReconciliationDecision, SessionReport,
    StreamOutcome,
};
use crate::module::{ClusterModuleState, UnloadReport};

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    // Calculate column widths
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();

    for (i, header) in headers.iter().enumerate() {
        if i > 0 {
            output.push_str("   ");
        }
        output.push_str(&format!(
            "{:width$}",
            header.to_uppercase(),
            width = widths[i]
        ));
    }
    output.push('\n');

    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    }

    output
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}

// ============================================================================
// Cluster state display
// ============================================================================

/// Per-node module table
pub fn format_cluster_state(state: &ClusterModuleState) -> String {
    let headers = &["NODE", "READY", "LOADED", "VERSION", "BASE"];
    let rows: Vec<Vec<String>> = state
        .nodes
        .iter()
        .map(|(name, node)| {
            vec![
                name.clone(),
                yes_no(node.reachable),
                yes_no(node.module.loaded),
                node.module.display_version(),
                node.module.base_version.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();

    let mut output = format_table(headers, rows);
    output.push_str(&format!(
        "\nActive: {}/{} nodes\n",
        state.active_count(),
        state.total_count()
    ));
    for failure in &state.probe_failures {
        output.push_str(&format!("  ! {}: {}\n", failure.node, failure.reason));
    }
    output
}

pub fn format_status(summary: &StatusSummary) -> String {
    let mut output = format_cluster_state(&summary.state);
    if let Some((version, matches)) = &summary.expectation {
        if *matches {
            output.push_str(&format!("All nodes run {}\n", version));
        } else {
            output.push_str(&format!("Not all nodes run {}\n", version));
        }
    }
    output
}

pub fn format_plan(plan: &DeployPlan, target: &str) -> String {
    let mut output = format_cluster_state(&plan.state);
    output.push_str(&format!("\nTarget version: {}\n", target));
    let action = match plan.decision {
        ReconciliationDecision::Install => "apply the workload (fresh install)".to_string(),
        ReconciliationDecision::UpgradeViaUnloadThenInstall => format!(
            "unload on {} node(s), then apply the workload",
            plan.state.nodes.values().filter(|n| n.reachable).count()
        ),
        ReconciliationDecision::NoOpAlreadyCurrent => "nothing".to_string(),
    };
    output.push_str(&format!("Would: {}\n", action));
    output.push_str("Dry run, no changes made. Remove --dry-run to execute.\n");
    output
}

// ============================================================================
// Unload display
// ============================================================================

pub fn format_unload_reports(reports: &[UnloadReport]) -> String {
    let headers = &["NODE", "STEPS", "RESULT"];
    let rows: Vec<Vec<String>> = reports
        .iter()
        .map(|r| {
            vec![
                r.node.clone(),
                r.steps_run.to_string(),
                if r.is_clean() {
                    "clean".to_string()
                } else {
                    format!("{} warning(s)", r.warnings.len())
                },
            ]
        })
        .collect();

    let mut output = format_table(headers, rows);
    for warning in reports.iter().flat_map(|r| &r.warnings) {
        output.push_str(&format!("  ! {}\n", warning));
    }
    output
}

pub fn format_uninstall_report(report: &UninstallReport) -> String {
    let mut output = match &report.delete_error {
        None => "Workload deleted.\n\n".to_string(),
        Some(e) => format!("Workload delete failed: {}\n\n", e),
    };
    output.push_str(&format_unload_reports(&report.unload_reports));
    output
}

// ============================================================================
// Deploy display
// ============================================================================

/// Final summary of a deployment
pub fn format_deploy_report(report: &DeploymentReport) -> String {
    let mut output = String::new();

    output.push_str(&format!("Target version: {}\n", report.target_version));
    output.push_str(&format!(
        "Before:         {}/{} nodes loaded\n",
        report.initial_state.active_count(),
        report.initial_state.total_count()
    ));
    output.push_str(&format!("Decision:       {}\n", report.decision));
    if !report.unload_reports.is_empty() {
        let clean = report.unload_reports.iter().filter(|r| r.is_clean()).count();
        output.push_str(&format!(
            "Unload:         {}/{} nodes clean\n",
            clean,
            report.unload_reports.len()
        ));
    }
    if !report.workers.is_empty() {
        output.push_str(&format!("Workers:        {}\n", report.workers.join(", ")));
    }
    let elapsed = report.finished_at - report.started_at;
    output.push_str(&format!("Elapsed:        {}s\n", elapsed.num_seconds()));

    if !report.warnings.is_empty() {
        output.push_str(&format!("\nWarnings ({}):\n", report.warnings.len()));
        for warning in &report.warnings {
            output.push_str(&format!("  - {}\n", warning));
        }
    }
    if report.interrupted {
        output.push_str("\nLog streaming interrupted; the deployment keeps running.\n");
    }

    let marker = match report.outcome {
        DeployOutcome::AppliedWithUnloadWarnings => "!",
        _ => "✓",
    };
    output.push_str(&format!("\n{} {}\n", marker, report.outcome));
    output
}

/// Summary line for a deployment that was not applied
pub fn format_deploy_failure(error: &DeployError) -> String {
    match error {
        DeployError::Precondition(reason) => {
            format!("✗ deployment not applied due to precondition: {}\n", reason)
        }
        DeployError::Apply(reason) => format!("✗ deployment not applied, apply failed: {}\n", reason),
        DeployError::NodeListing(e) => format!("✗ deployment not applied, cannot list nodes: {}\n", e),
    }
}

// ============================================================================
// Logs display
// ============================================================================

pub fn format_session_report(report: &SessionReport) -> String {
    if report.outcomes.is_empty() {
        return "No workers found.\n".to_string();
    }
    let headers = &["WORKER", "STREAM"];
    let rows: Vec<Vec<String>> = report
        .outcomes
        .iter()
        .map(|(worker, outcome)| {
            let status = match outcome {
                StreamOutcome::Completed => "completed".to_string(),
                StreamOutcome::Cancelled => "interrupted".to_string(),
                StreamOutcome::RetryExhausted { attempts, last_error } => {
                    format!("gave up after {} attempts: {}", attempts, last_error)
                }
            };
            vec![worker.clone(), status]
        })
        .collect();
    format_table(headers, rows)
}
