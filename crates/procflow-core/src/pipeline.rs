//! Stage function and run driver
//!
//! [`Pipeline::advance`] is the pure `(prior_state, stage) -> new_state`
//! step: it works on a clone of the prior state, so a failed stage leaves
//! the caller's state exactly as it was. [`Pipeline::run`] drives the stages
//! in order, holds the collaborator session, and reports every boundary to
//! an optional [`StageObserver`].

use crate::assembly::DatasetAssembler;
use crate::balance::BalanceReviewer;
use crate::collaborators::{Collaborators, EvidenceBatch, EvidenceRequest};
use crate::config::EngineConfig;
use crate::coverage::{self, CoverageEngine};
use crate::error::{Degradation, DerivationError};
use crate::generation::{PlanGenerator, PlanOrigin};
use crate::matching::FlowMatcher;
use crate::model::*;
use crate::narrative::{NarrativeCounts, NarrativeGenerator};
use crate::retry::call_with_retry;
use crate::state::{DerivationState, Stage};
use crate::units::UnitReconciler;
use async_trait::async_trait;

/// Called after every stage boundary, e.g. to write a snapshot. An error
/// aborts the run with [`DerivationError::Checkpoint`].
#[async_trait]
pub trait StageObserver: Send + Sync {
    async fn on_stage(&self, state: &DerivationState, stage: Stage) -> anyhow::Result<()>;
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct Pipeline {
    collaborators: Collaborators,
    config: EngineConfig,
    planner: PlanGenerator,
    coverage: CoverageEngine,
    matcher: FlowMatcher,
    reconciler: UnitReconciler,
    balance: BalanceReviewer,
    narrator: NarrativeGenerator,
}

impl Pipeline {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Result<Self, DerivationError> {
        config.validate()?;
        let calls = config.calls.clone();
        Ok(Self {
            planner: PlanGenerator::new(collaborators.text.clone(), calls.clone()),
            coverage: CoverageEngine::new(config.coverage.clone()),
            matcher: FlowMatcher::from_collaborators(&collaborators, &config),
            reconciler: UnitReconciler::new(
                collaborators.units.clone(),
                collaborators.density.clone(),
                config.units.clone(),
                calls.clone(),
            ),
            balance: BalanceReviewer::new(config.balance.clone()),
            narrator: NarrativeGenerator::new(collaborators.text.clone(), calls),
            collaborators,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one stage against a copy of `prior`.
    ///
    /// Every earlier stage must have completed. Re-running a completed stage
    /// forgets the completion of every later one. `gather_evidence` is only
    /// marked complete once the stop rule says stop, so it is called
    /// repeatedly until then.
    pub async fn advance(
        &self,
        prior: &DerivationState,
        stage: Stage,
    ) -> Result<DerivationState, DerivationError> {
        prior.check_can_run(stage)?;
        let mut state = prior.clone();
        state.reset_from(stage);

        tracing::info!(stage = %stage, run = %state.run_id, "stage started");
        let concluded = match stage {
            Stage::GatherEvidence => self.gather_evidence(&mut state).await,
            Stage::MatchFlows => {
                self.match_flows(&mut state).await;
                true
            }
            Stage::ReconcileUnits => {
                self.reconcile_units(&mut state).await;
                true
            }
            Stage::AssembleDatasets => {
                DatasetAssembler::assemble(&mut state)?;
                true
            }
            Stage::ResolvePlaceholders => {
                self.resolve_placeholders(&mut state).await;
                true
            }
            Stage::ReviewBalance => {
                self.review_balance(&mut state);
                true
            }
            Stage::Summarize => {
                self.summarize(&mut state).await;
                true
            }
            Stage::Publish => {
                self.publish(&mut state).await;
                true
            }
        };

        if concluded {
            state.mark_completed(stage);
        }
        tracing::info!(stage = %stage, concluded, decisions = state.decisions.len(), "stage finished");
        Ok(state)
    }

    /// Drive stages in order until the state is finished or `stop_after`
    /// has completed. The session is opened once and closed exactly once,
    /// whether the run succeeds or aborts.
    pub async fn run(
        &self,
        state: DerivationState,
        stop_after: Option<Stage>,
        observer: Option<&dyn StageObserver>,
    ) -> Result<DerivationState, DerivationError> {
        let session = match &self.collaborators.session {
            Some(session) => {
                match call_with_retry(&self.config.calls, "open_session", || session.open()).await {
                    Ok(()) => Some(session),
                    Err(err) => {
                        tracing::warn!(error = %err, "session unavailable, continuing without it");
                        None
                    }
                }
            }
            None => None,
        };

        let outcome = self.run_stages(state, stop_after, observer).await;

        if let Some(session) = session {
            if let Err(err) = session.close().await {
                tracing::warn!(error = %err, "session close failed");
            }
        }
        outcome
    }

    async fn run_stages(
        &self,
        mut state: DerivationState,
        stop_after: Option<Stage>,
        observer: Option<&dyn StageObserver>,
    ) -> Result<DerivationState, DerivationError> {
        while let Some(stage) = state.next_stage() {
            state = self.advance(&state, stage).await?;
            if let Some(observer) = observer {
                observer
                    .on_stage(&state, stage)
                    .await
                    .map_err(|err| DerivationError::Checkpoint {
                        stage,
                        message: format!("{err:#}"),
                    })?;
            }
            if stop_after == Some(stage) && state.has_completed(stage) {
                tracing::info!(stage = %stage, "stopping at requested boundary");
                break;
            }
        }
        Ok(state)
    }

    // ------------------------------------------------------------------------
    // Stages
    // ------------------------------------------------------------------------

    async fn gather_evidence(&self, state: &mut DerivationState) -> bool {
        let iteration = state.evidence_iterations() as u32 + 1;
        let batch = match &self.collaborators.literature {
            Some(literature) => {
                let request = EvidenceRequest {
                    flow_name: state.flow.name().to_string(),
                    operation: state.operation,
                    iteration,
                    uncovered_processes: state
                        .processes
                        .iter()
                        .filter(|p| !coverage::process_is_covered(state, p))
                        .map(|p| p.process_id.clone())
                        .collect(),
                    known_sources: state.evidence.iter().map(|e| e.source_id.clone()).collect(),
                };
                match call_with_retry(&self.config.calls, "gather_evidence", || {
                    literature.gather_evidence(&request)
                })
                .await
                {
                    Ok(batch) => batch,
                    Err(err) => {
                        let subject = state.flow.name().to_string();
                        state.record_decision(
                            Stage::GatherEvidence,
                            &subject,
                            format!("{}: literature search failed: {err}", Degradation::CollaboratorUnavailable),
                        );
                        EvidenceBatch::default()
                    }
                }
            }
            None => EvidenceBatch::default(),
        };

        let added = state.merge_evidence(batch.items);
        tracing::info!(iteration, added, total = state.evidence.len(), "evidence merged");

        let plan = self
            .planner
            .generate(&state.flow, state.operation, &state.evidence)
            .await;
        if plan.origin == PlanOrigin::Fallback {
            let subject = state.flow.name().to_string();
            let note = plan.note.clone().unwrap_or_default();
            state.record_decision(
                Stage::GatherEvidence,
                &subject,
                format!("single-process fallback plan: {note}"),
            );
        }
        state.routes = plan.routes;
        state.selected_route = Some(plan.selected_route);
        state.processes = plan.processes;
        state.exchanges = plan.exchanges;

        self.coverage
            .evaluate(state, batch.supporting_info_pending)
            .should_stop
    }

    async fn match_flows(&self, state: &mut DerivationState) {
        restore_extracted(state);
        state.match_results.clear();
        state.unit_checks.clear();
        state.placeholder_reports.clear();

        let items: Vec<(ExchangeLineItem, Option<UnitProcess>)> = state
            .exchanges
            .iter()
            .map(|e| (e.clone(), state.process(&e.process_id).cloned()))
            .collect();
        let results = self.matcher.match_all(items).await;

        let mut matched = 0usize;
        for result in results {
            if result.is_matched() {
                matched += 1;
            } else if let Some(reason) = result.reason {
                state.record_decision(
                    Stage::MatchFlows,
                    &result.exchange_id,
                    format!("{reason}: placeholder kept after query '{}'", result.query),
                );
            }
            state.match_results.insert(result.exchange_id.clone(), result);
        }
        tracing::info!(matched, total = state.exchanges.len(), "primary pass complete");
    }

    async fn reconcile_units(&self, state: &mut DerivationState) {
        restore_extracted(state);
        state.unit_checks.clear();

        let targets: Vec<(ExchangeLineItem, FlowCandidate, Option<String>)> = state
            .exchanges
            .iter()
            .filter_map(|e| {
                let candidate = state
                    .match_results
                    .get(&e.exchange_id)
                    .filter(|m| m.is_matched())?
                    .selected
                    .clone()?;
                let technology = state.process(&e.process_id).map(|p| p.technology.clone());
                Some((e.clone(), candidate, technology))
            })
            .collect();

        for (exchange, candidate, technology) in targets {
            let check = self
                .reconciler
                .reconcile(&exchange, &candidate, None, technology.as_deref())
                .await;
            apply_unit_check(state, Stage::ReconcileUnits, check);
        }
    }

    async fn resolve_placeholders(&self, state: &mut DerivationState) {
        let targets: Vec<ExchangeLineItem> = state
            .ordered_processes()
            .into_iter()
            .flat_map(|p| state.exchanges_for(&p.process_id))
            .filter(|e| {
                state
                    .match_results
                    .get(&e.exchange_id)
                    .map_or(true, |m| !m.is_matched())
            })
            .cloned()
            .collect();

        for exchange in targets {
            let process = state.process(&exchange.process_id).cloned();
            let result = self.matcher.resolve(&exchange, process.as_ref()).await;

            match result.selected.clone().filter(|_| result.is_matched()) {
                Some(candidate) => {
                    let technology = process.as_ref().map(|p| p.technology.as_str());
                    let check = self
                        .reconciler
                        .reconcile(&exchange, &candidate, None, technology)
                        .await;
                    apply_unit_check(state, Stage::ResolvePlaceholders, check);
                    state
                        .placeholder_reports
                        .retain(|r| r.exchange_id != exchange.exchange_id);
                    state.record_decision(
                        Stage::ResolvePlaceholders,
                        &exchange.exchange_id,
                        format!("matched to {} in secondary pass (query '{}')", candidate.id, result.query),
                    );
                }
                None => {
                    let reason = result.reason.unwrap_or(Degradation::NoCandidatesFound);
                    match state
                        .placeholder_reports
                        .iter_mut()
                        .find(|r| r.exchange_id == exchange.exchange_id)
                    {
                        Some(report) => {
                            report.attempts += 1;
                            report.status = result.status;
                            report.reason = reason;
                            report.last_query = result.query.clone();
                        }
                        None => state.placeholder_reports.push(PlaceholderReport {
                            exchange_id: exchange.exchange_id.clone(),
                            process_id: exchange.process_id.clone(),
                            exchange_name: exchange.name.clone(),
                            status: result.status,
                            reason,
                            attempts: 1,
                            last_query: result.query.clone(),
                        }),
                    }
                    state.record_decision(
                        Stage::ResolvePlaceholders,
                        &exchange.exchange_id,
                        format!("{reason}: unresolved after query '{}'", result.query),
                    );
                }
            }
            state.match_results.insert(exchange.exchange_id.clone(), result);
        }

        DatasetAssembler::refresh(state);
        tracing::info!(unresolved = state.placeholder_reports.len(), "secondary pass complete");
    }

    fn review_balance(&self, state: &mut DerivationState) {
        let results: Vec<BalanceReviewResult> = state
            .ordered_processes()
            .into_iter()
            .flat_map(|process| {
                let exchanges: Vec<&ExchangeLineItem> = state.exchanges_for(&process.process_id).collect();
                self.balance.review(process, &exchanges, &state.unit_checks)
            })
            .collect();

        for result in &results {
            match result.status {
                BalanceStatus::Insufficient => {
                    tracing::warn!(process = %result.process_id, basis = %result.basis, counted = result.counted, "balance data insufficient");
                    state.record_decision(
                        Stage::ReviewBalance,
                        &result.process_id,
                        format!(
                            "{}: {} basis, {} counted exchange(s)",
                            Degradation::InsufficientBalanceData,
                            result.basis,
                            result.counted
                        ),
                    );
                }
                BalanceStatus::Check => {
                    tracing::warn!(process = %result.process_id, basis = %result.basis, ratio = result.imbalance_ratio, "balance needs checking");
                }
                BalanceStatus::Ok => {}
            }
        }
        state.balance_results = results;
    }

    async fn summarize(&self, state: &mut DerivationState) {
        let processes: Vec<UnitProcess> = state.ordered_processes().into_iter().cloned().collect();
        let mut narratives = Vec::with_capacity(processes.len());

        for process in &processes {
            let counts = {
                let pid = process.process_id.as_str();
                let exchanges: Vec<&ExchangeLineItem> = state.exchanges_for(pid).collect();
                let reports: Vec<&PlaceholderReport> =
                    state.placeholder_reports.iter().filter(|r| r.process_id == pid).collect();
                let checks: Vec<&UnitCheckResult> = exchanges
                    .iter()
                    .filter_map(|e| state.unit_checks.get(&e.exchange_id))
                    .collect();
                let balance: Vec<&BalanceReviewResult> =
                    state.balance_results.iter().filter(|b| b.process_id == pid).collect();
                NarrativeCounts::collect(&exchanges, &reports, &checks, &balance)
            };
            narratives.push(self.narrator.summarize(process, &counts).await);
        }

        state.narratives = narratives;
        DatasetAssembler::refresh(state);
    }

    async fn publish(&self, state: &mut DerivationState) {
        state.publications.clear();
        let validator = self.collaborators.validator.as_ref();
        let publisher = self.collaborators.publisher.as_ref();
        if validator.is_none() && publisher.is_none() {
            tracing::info!("no downstream collaborators configured, nothing published");
            return;
        }

        for dataset in state.datasets.clone() {
            let mut record = PublicationRecord {
                process_id: dataset.process_id.clone(),
                valid: None,
                errors: Vec::new(),
                persisted_id: None,
                persisted_version: None,
                failure: None,
            };
            let document = match serde_json::to_value(&dataset) {
                Ok(document) => document,
                Err(err) => {
                    record.failure = Some(format!("serialization failed: {err}"));
                    state.publications.push(record);
                    continue;
                }
            };

            if let Some(validator) = validator {
                match call_with_retry(&self.config.calls, "validate_schema", || {
                    validator.validate_schema(&document)
                })
                .await
                {
                    Ok(report) => {
                        record.valid = Some(report.valid);
                        record.errors = report.errors;
                    }
                    Err(err) => record.failure = Some(format!("validation failed: {err}")),
                }
            }

            if record.valid != Some(false) && record.failure.is_none() {
                if let Some(publisher) = publisher {
                    match call_with_retry(&self.config.calls, "publish", || publisher.publish(&document)).await {
                        Ok(persisted) => {
                            record.persisted_id = Some(persisted.id);
                            record.persisted_version = Some(persisted.version);
                        }
                        Err(err) => record.failure = Some(format!("publish failed: {err}")),
                    }
                }
            }

            if let Some(failure) = &record.failure {
                tracing::warn!(process = %record.process_id, %failure, "dataset not published");
            }
            state.publications.push(record);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Put extracted units and amounts back before unit checks are rebuilt.
fn restore_extracted(state: &mut DerivationState) {
    for check in state.unit_checks.values().filter(|c| c.status.is_converted()) {
        if let Some(exchange) = state
            .exchanges
            .iter_mut()
            .find(|e| e.exchange_id == check.exchange_id)
        {
            exchange.unit = check.original_unit.clone();
            exchange.amount = check.original_amount;
        }
    }
}

/// Store a unit check; converted values are written onto the exchange, the
/// extracted ones stay on the check.
fn apply_unit_check(state: &mut DerivationState, stage: Stage, check: UnitCheckResult) {
    if check.status.is_converted() {
        if let Some(exchange) = state
            .exchanges
            .iter_mut()
            .find(|e| e.exchange_id == check.exchange_id)
        {
            exchange.unit = check.resolved_unit.clone();
            exchange.amount = check.resolved_amount;
        }
    }
    if let Some(reason) = check.reason {
        let note = check.note.clone().unwrap_or_default();
        state.record_decision(stage, &check.exchange_id, format!("{reason}: {note}"));
    }
    state.unit_checks.insert(check.exchange_id.clone(), check);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::ReferenceFlow;

    fn pipeline() -> Pipeline {
        let mut config = EngineConfig::default();
        config.calls = crate::retry::CallPolicy::immediate(1_000);
        Pipeline::new(Collaborators::new(), config).unwrap()
    }

    fn fresh() -> DerivationState {
        DerivationState::new(ReferenceFlow::named("f-1", "Cement", Some("kg")), Operation::Produce)
    }

    #[tokio::test]
    async fn out_of_order_stage_is_rejected_without_change() {
        let prior = fresh();
        let err = pipeline().advance(&prior, Stage::ReviewBalance).await.unwrap_err();
        assert!(matches!(
            err,
            DerivationError::StageOrder {
                missing: Stage::GatherEvidence,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn offline_run_degrades_to_placeholders() {
        let state = pipeline().run(fresh(), None, None).await.unwrap();
        assert_eq!(state.next_stage(), None);
        assert_eq!(state.processes.len(), 1);
        assert_eq!(state.datasets.len(), 1);
        assert!(state.exchanges.iter().all(|e| e.amount.is_placeholder()));
        assert!(state
            .datasets
            .iter()
            .flat_map(|d| &d.exchanges)
            .all(|e| e.flow.is_placeholder()));
        assert!(!state.placeholder_reports.is_empty());
        assert!(state.unit_checks.is_empty());
        assert_eq!(state.narratives.len(), 1);
        assert_eq!(state.narratives[0].origin, "template");
        assert!(state.publications.is_empty());
    }

    #[tokio::test]
    async fn stop_after_halts_at_the_boundary() {
        let state = pipeline()
            .run(fresh(), Some(Stage::ReconcileUnits), None)
            .await
            .unwrap();
        assert_eq!(state.last_completed(), Some(Stage::ReconcileUnits));
        assert_eq!(state.next_stage(), Some(Stage::AssembleDatasets));
        assert!(state.datasets.is_empty());
    }

    struct FailingObserver;

    #[async_trait]
    impl StageObserver for FailingObserver {
        async fn on_stage(&self, _: &DerivationState, _: Stage) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[tokio::test]
    async fn observer_failure_aborts_with_checkpoint_error() {
        let err = pipeline()
            .run(fresh(), None, Some(&FailingObserver))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DerivationError::Checkpoint {
                stage: Stage::GatherEvidence,
                ..
            }
        ));
    }
}
