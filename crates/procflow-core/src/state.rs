//! State Store
//!
//! One explicit record threaded through every stage. A stage receives the
//! prior state, works on a clone, and returns the new state, so any stage
//! boundary is a valid snapshot to stop at or resume from.

use crate::assembly::ProcessDataset;
use crate::error::DerivationError;
use crate::flow::ReferenceFlow;
use crate::model::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Stages
// ============================================================================

/// Named stage boundaries, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    GatherEvidence,
    MatchFlows,
    ReconcileUnits,
    AssembleDatasets,
    ResolvePlaceholders,
    ReviewBalance,
    Summarize,
    Publish,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::GatherEvidence,
        Stage::MatchFlows,
        Stage::ReconcileUnits,
        Stage::AssembleDatasets,
        Stage::ResolvePlaceholders,
        Stage::ReviewBalance,
        Stage::Summarize,
        Stage::Publish,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::GatherEvidence => "gather_evidence",
            Stage::MatchFlows => "match_flows",
            Stage::ReconcileUnits => "reconcile_units",
            Stage::AssembleDatasets => "assemble_datasets",
            Stage::ResolvePlaceholders => "resolve_placeholders",
            Stage::ReviewBalance => "review_balance",
            Stage::Summarize => "summarize",
            Stage::Publish => "publish",
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// The stage that must have completed before this one may run.
    pub fn prerequisite(self) -> Option<Stage> {
        self.index().checked_sub(1).map(|i| Stage::ALL[i])
    }

    pub fn describe(self) -> &'static str {
        match self {
            Stage::GatherEvidence => "one evidence iteration: gather, regenerate plan, evaluate coverage",
            Stage::MatchFlows => "primary flow-matching pass over every exchange",
            Stage::ReconcileUnits => "unit reconciliation for every matched exchange",
            Stage::AssembleDatasets => "chain check and process dataset assembly",
            Stage::ResolvePlaceholders => "secondary matching pass and placeholder reports",
            Stage::ReviewBalance => "mass/energy balance review per process",
            Stage::Summarize => "completeness narrative per process",
            Stage::Publish => "schema validation and publication",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = Stage::ALL.iter().map(|s| s.as_str()).collect();
                format!("unknown stage '{s}' (expected one of: {})", names.join(", "))
            })
    }
}

// ============================================================================
// Decision log
// ============================================================================

/// One entry of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub stage: Stage,
    /// Process or exchange id the decision applies to.
    pub subject: String,
    pub reason: String,
}

// ============================================================================
// DerivationState
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationState {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub operation: Operation,
    pub flow: ReferenceFlow,

    pub evidence: Vec<EvidenceItem>,
    pub routes: Vec<TechnologyRoute>,
    pub selected_route: Option<String>,
    pub processes: Vec<UnitProcess>,
    pub exchanges: Vec<ExchangeLineItem>,

    pub coverage_history: Vec<CoverageSnapshot>,
    pub stop_decisions: Vec<StopRuleDecision>,

    pub match_results: BTreeMap<String, MatchResult>,
    pub unit_checks: BTreeMap<String, UnitCheckResult>,
    pub datasets: Vec<ProcessDataset>,
    pub placeholder_reports: Vec<PlaceholderReport>,
    pub balance_results: Vec<BalanceReviewResult>,
    pub narratives: Vec<ProcessNarrative>,
    pub publications: Vec<PublicationRecord>,

    pub decisions: Vec<DecisionRecord>,
    pub completed: Vec<Stage>,
}

impl DerivationState {
    pub fn new(flow: ReferenceFlow, operation: Operation) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            operation,
            flow,
            evidence: Vec::new(),
            routes: Vec::new(),
            selected_route: None,
            processes: Vec::new(),
            exchanges: Vec::new(),
            coverage_history: Vec::new(),
            stop_decisions: Vec::new(),
            match_results: BTreeMap::new(),
            unit_checks: BTreeMap::new(),
            datasets: Vec::new(),
            placeholder_reports: Vec::new(),
            balance_results: Vec::new(),
            narratives: Vec::new(),
            publications: Vec::new(),
            decisions: Vec::new(),
            completed: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Stage bookkeeping
    // ------------------------------------------------------------------------

    pub fn has_completed(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    pub fn last_completed(&self) -> Option<Stage> {
        self.completed.iter().copied().max()
    }

    /// The stage a resumed run would execute next, `None` when finished.
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::ALL.iter().copied().find(|s| !self.has_completed(*s))
    }

    pub fn evidence_iterations(&self) -> usize {
        self.coverage_history.len()
    }

    /// Fails with [`DerivationError::StageOrder`] naming the earliest
    /// missing stage, or [`DerivationError::EvidenceLoopConcluded`] when
    /// another evidence iteration is requested after the loop stopped.
    pub fn check_can_run(&self, stage: Stage) -> Result<(), DerivationError> {
        if let Some(missing) = Stage::ALL[..stage.index()]
            .iter()
            .copied()
            .find(|s| !self.has_completed(*s))
        {
            return Err(DerivationError::StageOrder {
                requested: stage,
                missing,
            });
        }
        if stage == Stage::GatherEvidence && self.has_completed(Stage::GatherEvidence) {
            return Err(DerivationError::EvidenceLoopConcluded {
                iterations: self.evidence_iterations(),
            });
        }
        Ok(())
    }

    /// Forget every completed stage at or after `stage`; their artifacts are
    /// rebuilt when they run again.
    pub(crate) fn reset_from(&mut self, stage: Stage) {
        self.completed.retain(|s| *s < stage);
    }

    pub(crate) fn mark_completed(&mut self, stage: Stage) {
        if !self.has_completed(stage) {
            self.completed.push(stage);
            self.completed.sort();
        }
    }

    pub(crate) fn record_decision(&mut self, stage: Stage, subject: &str, reason: impl Into<String>) {
        self.decisions.push(DecisionRecord {
            stage,
            subject: subject.to_string(),
            reason: reason.into(),
        });
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    pub fn process(&self, process_id: &str) -> Option<&UnitProcess> {
        self.processes.iter().find(|p| p.process_id == process_id)
    }

    pub fn exchange(&self, exchange_id: &str) -> Option<&ExchangeLineItem> {
        self.exchanges.iter().find(|e| e.exchange_id == exchange_id)
    }

    pub fn exchanges_for<'a>(
        &'a self,
        process_id: &'a str,
    ) -> impl Iterator<Item = &'a ExchangeLineItem> + 'a {
        self.exchanges
            .iter()
            .filter(move |e| e.process_id == process_id)
    }

    /// Processes of the selected route in chain order.
    pub fn ordered_processes(&self) -> Vec<&UnitProcess> {
        let mut ordered: Vec<&UnitProcess> = self
            .processes
            .iter()
            .filter(|p| match &self.selected_route {
                Some(route) => &p.route_id == route,
                None => true,
            })
            .collect();
        ordered.sort_by_key(|p| p.order);
        ordered
    }

    pub fn terminal_process(&self) -> Option<&UnitProcess> {
        let ordered = self.ordered_processes();
        ordered
            .iter()
            .find(|p| p.is_reference_flow_process)
            .or_else(|| ordered.last())
            .copied()
    }

    pub fn evidence_item(&self, source_id: &str) -> Option<&EvidenceItem> {
        self.evidence.iter().find(|e| e.source_id == source_id)
    }

    pub fn is_usable_evidence(&self, source_id: &str) -> bool {
        self.evidence_item(source_id).is_some_and(|e| e.usable)
    }

    pub fn usable_evidence_count(&self) -> usize {
        self.evidence.iter().filter(|e| e.usable).count()
    }

    pub fn last_coverage(&self) -> Option<&CoverageSnapshot> {
        self.coverage_history.last()
    }

    pub fn placeholder_report(&self, exchange_id: &str) -> Option<&PlaceholderReport> {
        self.placeholder_reports
            .iter()
            .find(|r| r.exchange_id == exchange_id)
    }

    /// Merge evidence by source id; later copies replace earlier ones.
    pub(crate) fn merge_evidence(&mut self, items: Vec<EvidenceItem>) -> usize {
        let mut added = 0;
        for item in items {
            match self
                .evidence
                .iter_mut()
                .find(|existing| existing.source_id == item.source_id)
            {
                Some(existing) => *existing = item,
                None => {
                    self.evidence.push(item);
                    added += 1;
                }
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> DerivationState {
        DerivationState::new(
            ReferenceFlow::named("f-1", "Methanol", Some("kg")),
            Operation::Produce,
        )
    }

    #[test]
    fn stage_names_round_trip() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>().unwrap(), stage);
        }
        assert_eq!("review-balance".parse::<Stage>().unwrap(), Stage::ReviewBalance);
        assert!("bake".parse::<Stage>().is_err());
    }

    #[test]
    fn later_stage_requires_every_earlier_one() {
        let mut st = state();
        let err = st.check_can_run(Stage::ReconcileUnits).unwrap_err();
        assert!(matches!(
            err,
            DerivationError::StageOrder {
                requested: Stage::ReconcileUnits,
                missing: Stage::GatherEvidence
            }
        ));

        st.mark_completed(Stage::GatherEvidence);
        st.mark_completed(Stage::MatchFlows);
        assert!(st.check_can_run(Stage::ReconcileUnits).is_ok());
        assert_eq!(st.next_stage(), Some(Stage::ReconcileUnits));
    }

    #[test]
    fn gather_after_conclusion_is_rejected() {
        let mut st = state();
        st.mark_completed(Stage::GatherEvidence);
        assert!(matches!(
            st.check_can_run(Stage::GatherEvidence),
            Err(DerivationError::EvidenceLoopConcluded { .. })
        ));
    }

    #[test]
    fn reset_drops_later_stages() {
        let mut st = state();
        for stage in &Stage::ALL[..4] {
            st.mark_completed(*stage);
        }
        st.reset_from(Stage::MatchFlows);
        assert_eq!(st.completed, vec![Stage::GatherEvidence]);
    }

    #[test]
    fn merge_evidence_dedupes_by_source() {
        let mut st = state();
        let item = |id: &str, usable| EvidenceItem {
            source_id: id.to_string(),
            title: None,
            usable,
            scope: vec![],
        };
        assert_eq!(st.merge_evidence(vec![item("a", false), item("b", true)]), 2);
        assert_eq!(st.merge_evidence(vec![item("a", true)]), 0);
        assert_eq!(st.usable_evidence_count(), 2);
    }
}
