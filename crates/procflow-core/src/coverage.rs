//! Coverage & Stop-Rule Engine
//!
//! Measures how much of the current plan is backed by usable evidence and
//! decides whether another evidence iteration is worth running. The
//! decision itself ([`decide`]) is a pure function of the last two
//! snapshots; [`CoverageEngine::evaluate`] only measures, decides, appends,
//! and applies the expert-judgement downgrade when asked to.

use crate::config::CoverageConfig;
use crate::model::{
    CoverageDelta, CoverageSnapshot, ExchangeLineItem, SourceType, StopAction, StopRuleDecision,
    UnitProcess,
};
use crate::state::{DerivationState, Stage};

// ============================================================================
// Metrics
// ============================================================================

/// A process counts when it is not expert judgement and cites at least one
/// usable evidence item.
pub fn process_is_covered(state: &DerivationState, process: &UnitProcess) -> bool {
    process.source_type != SourceType::ExpertJudgement
        && process
            .evidence_refs
            .iter()
            .any(|id| state.is_usable_evidence(id))
}

/// An amount citation: a known amount backed by a usable literature source.
pub fn exchange_is_cited(state: &DerivationState, exchange: &ExchangeLineItem) -> bool {
    exchange.amount.value().is_some()
        && exchange.source_type == SourceType::Literature
        && exchange
            .evidence_ref
            .as_deref()
            .is_some_and(|id| state.is_usable_evidence(id))
}

/// Explicitly flagged key exchanges, or every exchange when none is flagged.
pub fn key_exchanges(state: &DerivationState) -> Vec<&ExchangeLineItem> {
    let planned: Vec<&ExchangeLineItem> = state
        .exchanges
        .iter()
        .filter(|e| state.process(&e.process_id).is_some())
        .collect();
    if planned.iter().any(|e| e.is_key) {
        planned.into_iter().filter(|e| e.is_key).collect()
    } else {
        planned
    }
}

fn ratio(hit: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hit as f64 / total as f64
    }
}

pub fn measure(state: &DerivationState, iteration: u32, supporting_info_pending: bool) -> CoverageSnapshot {
    let covered = state
        .processes
        .iter()
        .filter(|p| process_is_covered(state, p))
        .count();
    let keys = key_exchanges(state);
    let cited = keys.iter().filter(|e| exchange_is_cited(state, e)).count();

    CoverageSnapshot {
        iteration,
        process_coverage: ratio(covered, state.processes.len()),
        exchange_value_coverage: ratio(cited, keys.len()),
        usable_evidence: state.usable_evidence_count(),
        supporting_info_pending,
    }
}

// ============================================================================
// Stop rule
// ============================================================================

/// Stop-rule decision for `current` given the snapshot before it.
///
/// Order: thresholds met → stop; iteration cap reached → expert judgement
/// when nothing new is usable and nothing is pending, otherwise stop;
/// plateau → stop; else continue. Expert judgement is only ever the
/// outcome of an exhausted cap.
pub fn decide(
    previous: Option<&CoverageSnapshot>,
    current: &CoverageSnapshot,
    config: &CoverageConfig,
) -> StopRuleDecision {
    let delta = previous.map(|prev| CoverageDelta {
        process: current.process_coverage - prev.process_coverage,
        exchange_value: current.exchange_value_coverage - prev.exchange_value_coverage,
    });
    let no_new_usable = current.usable_evidence == 0
        || previous.is_some_and(|prev| prev.usable_evidence >= current.usable_evidence);
    let coverage = format!(
        "process coverage {:.3}, exchange value coverage {:.3}",
        current.process_coverage, current.exchange_value_coverage
    );

    let (action, reason) = if current.process_coverage >= config.process_threshold
        && current.exchange_value_coverage >= config.exchange_value_threshold
    {
        (StopAction::Stop, format!("thresholds met ({coverage})"))
    } else if current.iteration >= config.max_iterations {
        if no_new_usable && !current.supporting_info_pending {
            (
                StopAction::ExpertJudgement,
                format!(
                    "iteration cap {} reached without new usable evidence ({coverage})",
                    config.max_iterations
                ),
            )
        } else {
            (
                StopAction::Stop,
                format!("iteration cap {} reached ({coverage})", config.max_iterations),
            )
        }
    } else if let Some(d) = delta.filter(|d| {
        d.process < config.plateau_delta && d.exchange_value < config.plateau_delta
    }) {
        let plateau = format!(
            "coverage plateau (Δprocess {:+.3}, Δexchange value {:+.3})",
            d.process, d.exchange_value
        );
        (StopAction::Stop, plateau)
    } else if previous.is_none() {
        (
            StopAction::Continue,
            format!("first iteration below thresholds ({coverage})"),
        )
    } else {
        (
            StopAction::Continue,
            format!("coverage still improving ({coverage})"),
        )
    };

    StopRuleDecision {
        iteration: current.iteration,
        should_stop: action != StopAction::Continue,
        action,
        reason,
        coverage_delta: delta,
    }
}

// ============================================================================
// CoverageEngine
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CoverageEngine {
    config: CoverageConfig,
}

impl CoverageEngine {
    pub fn new(config: CoverageConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    /// Measure, decide, append snapshot and decision, and apply the
    /// expert-judgement downgrade when the decision calls for it.
    pub fn evaluate(&self, state: &mut DerivationState, supporting_info_pending: bool) -> StopRuleDecision {
        let iteration = state
            .coverage_history
            .last()
            .map_or(1, |last| last.iteration + 1);
        let snapshot = measure(state, iteration, supporting_info_pending);
        let decision = decide(state.coverage_history.last(), &snapshot, &self.config);

        tracing::info!(
            iteration,
            process_coverage = snapshot.process_coverage,
            exchange_value_coverage = snapshot.exchange_value_coverage,
            usable_evidence = snapshot.usable_evidence,
            action = ?decision.action,
            "coverage evaluated"
        );

        state.coverage_history.push(snapshot);
        state.stop_decisions.push(decision.clone());
        if decision.action == StopAction::ExpertJudgement {
            apply_expert_judgement(state, &decision.reason);
        }
        decision
    }
}

/// Mark every uncovered process and uncited key exchange as expert
/// judgement, one decision record each.
pub fn apply_expert_judgement(state: &mut DerivationState, reason: &str) {
    let uncovered: Vec<String> = state
        .processes
        .iter()
        .filter(|p| !process_is_covered(state, p))
        .map(|p| p.process_id.clone())
        .collect();
    let uncited: Vec<String> = key_exchanges(state)
        .into_iter()
        .filter(|e| !exchange_is_cited(state, e))
        .map(|e| e.exchange_id.clone())
        .collect();

    for process_id in &uncovered {
        if let Some(process) = state.processes.iter_mut().find(|p| &p.process_id == process_id) {
            process.source_type = SourceType::ExpertJudgement;
        }
        tracing::warn!(process = %process_id, %reason, "process downgraded to expert judgement");
        state.record_decision(
            Stage::GatherEvidence,
            process_id,
            format!("expert judgement: {reason}"),
        );
    }
    for exchange_id in &uncited {
        if let Some(exchange) = state.exchanges.iter_mut().find(|e| &e.exchange_id == exchange_id) {
            exchange.source_type = SourceType::ExpertJudgement;
        }
        tracing::warn!(exchange = %exchange_id, %reason, "exchange value downgraded to expert judgement");
        state.record_decision(
            Stage::GatherEvidence,
            exchange_id,
            format!("expert judgement (no amount citation): {reason}"),
        );
    }
}
