//! Run report: the outbound artifacts of one derivation

use anyhow::{Context, Result};
use colored::Colorize;
use procflow_core::{
    BalanceReviewResult, BalanceStatus, DecisionRecord, DerivationState, Operation,
    PlaceholderReport, ProcessDataset, PublicationRecord, Stage,
};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub flow: &'a str,
    pub operation: Operation,
    pub completed: &'a [Stage],
    pub finished: bool,
    pub datasets: &'a [ProcessDataset],
    pub placeholder_reports: &'a [PlaceholderReport],
    pub balance_results: &'a [BalanceReviewResult],
    pub publications: &'a [PublicationRecord],
    pub decisions: &'a [DecisionRecord],
}

impl<'a> RunReport<'a> {
    pub fn from_state(state: &'a DerivationState) -> Self {
        Self {
            run_id: &state.run_id,
            flow: state.flow.name(),
            operation: state.operation,
            completed: &state.completed,
            finished: state.next_stage().is_none(),
            datasets: &state.datasets,
            placeholder_reports: &state.placeholder_reports,
            balance_results: &state.balance_results,
            publications: &state.publications,
            decisions: &state.decisions,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize run report")
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let body = self.to_json()?;
        std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Human summary on stderr.
pub fn print_summary(state: &DerivationState) {
    let finished = state.next_stage().is_none();
    eprintln!(
        "{} {} ({}) run {}",
        if finished { "Derived".green().bold() } else { "Stopped".yellow().bold() },
        state.flow.name().bold(),
        state.operation,
        state.run_id
    );
    match state.last_completed() {
        Some(stage) => eprintln!("  last stage: {}", stage.as_str()),
        None => eprintln!("  last stage: none"),
    }
    if let Some(next) = state.next_stage() {
        eprintln!("  next stage: {}", next.as_str().cyan());
    }
    if let Some(coverage) = state.last_coverage() {
        eprintln!(
            "  coverage: processes {:.2}, exchange values {:.2} after {} iteration(s)",
            coverage.process_coverage,
            coverage.exchange_value_coverage,
            state.evidence_iterations()
        );
    }

    let matched = state.match_results.values().filter(|r| r.is_matched()).count();
    eprintln!(
        "  processes: {}  exchanges: {}  matched: {}  datasets: {}",
        state.processes.len(),
        state.exchanges.len(),
        matched,
        state.datasets.len()
    );

    if !state.placeholder_reports.is_empty() {
        eprintln!("  {} {}", "placeholders:".yellow(), state.placeholder_reports.len());
        for report in &state.placeholder_reports {
            eprintln!(
                "    - {} {} ({}, {} attempt(s))",
                report.exchange_id,
                report.exchange_name,
                report.reason.code(),
                report.attempts
            );
        }
    }
    for result in &state.balance_results {
        let status = match result.status {
            BalanceStatus::Ok => "ok".green(),
            BalanceStatus::Check => "check".yellow(),
            BalanceStatus::Insufficient => "insufficient".red(),
        };
        eprintln!(
            "  balance {} {:?}: {} (ratio {:.3})",
            result.process_id, result.basis, status, result.imbalance_ratio
        );
    }
    for record in &state.publications {
        match (&record.persisted_id, &record.failure) {
            (Some(id), _) => eprintln!("  published {} as {}", record.process_id, id),
            (None, Some(failure)) => eprintln!("  {} {}: {}", "not published".red(), record.process_id, failure),
            (None, None) => eprintln!("  {} {}", "not published".red(), record.process_id),
        }
    }
}
