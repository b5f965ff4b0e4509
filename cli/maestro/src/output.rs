//! Output formatting for CLI commands.

use colored::Colorize;
use maestro_deployer::health::HealthVerdict;
use maestro_deployer::orchestrator::DeployReport;
use maestro_deployer::reconciler::ReconcileOutcome;
use serde::Serialize;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// JSON document on stdout.
    Json,
}

/// Print a single item as pretty JSON.
pub fn print_json<T: Serialize>(data: &T) {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    println!("{}", json);
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "Warning:".yellow().bold(), message);
}

pub fn outcome_str(outcome: ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Created => "created",
        ReconcileOutcome::Updated => "updated",
        ReconcileOutcome::NoChange => "no_change",
    }
}

#[derive(Debug, Serialize)]
pub struct StackView {
    pub stack: String,
    pub outcome: &'static str,
}

/// Serializable summary of a [`DeployReport`].
#[derive(Debug, Serialize)]
pub struct DeployReportView {
    pub deploy_id: String,
    pub cluster: String,
    pub version: String,
    pub state: &'static str,
    pub reconciled: Vec<StackView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<HealthVerdict>,
    pub deactivated: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub exit_code: i32,
}

impl From<&DeployReport> for DeployReportView {
    fn from(report: &DeployReport) -> Self {
        Self {
            deploy_id: report.deploy_id.to_string(),
            cluster: report.cluster.to_string(),
            version: report.version.to_string(),
            state: report.state.as_str(),
            reconciled: report
                .reconciled
                .iter()
                .map(|r| StackView {
                    stack: r.stack.to_string(),
                    outcome: outcome_str(r.outcome),
                })
                .collect(),
            verdict: report.verdict,
            deactivated: report.deactivated.iter().map(ToString::to_string).collect(),
            failure: report.failure.as_ref().map(ToString::to_string),
            exit_code: report.exit_code(),
        }
    }
}

/// Print a deploy report in the requested format.
pub fn print_report(report: &DeployReport, format: OutputFormat) {
    let view = DeployReportView::from(report);

    if format == OutputFormat::Json {
        print_json(&view);
        return;
    }

    print_info(&format!("Deploy {} of {}/{}", view.deploy_id, view.cluster, view.version));
    for stack in &view.reconciled {
        println!("  {} {}", stack.stack, stack.outcome.dimmed());
    }
    if let Some(verdict) = view.verdict {
        println!(
            "  health: {} running sightings in {} checks",
            verdict.hits, verdict.attempts
        );
    }
    for stack in &view.deactivated {
        println!("  {} {}", stack, "inactive".dimmed());
    }

    match (&view.failure, view.exit_code) {
        (None, 0) => print_success(&format!("{} promoted", view.version)),
        (Some(failure), _) => print_warning(&format!("{} {}: {}", view.version, view.state, failure)),
        (None, _) => print_warning(&format!("{} {}", view.version, view.state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_strings() {
        assert_eq!(outcome_str(ReconcileOutcome::Created), "created");
        assert_eq!(outcome_str(ReconcileOutcome::NoChange), "no_change");
    }
}
