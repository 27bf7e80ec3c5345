//! End-to-end scenarios over the stage function with in-memory collaborators.
//!
//! Run with: cargo test -p procflow-core --test scenario_tests

mod common;

use approx::assert_relative_eq;
use common::*;
use procflow_core::*;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn literature_with(sources: &[&str]) -> Arc<QueuedLiterature> {
    Arc::new(QueuedLiterature::new(vec![EvidenceBatch {
        items: sources.iter().map(|s| evidence(s, true)).collect(),
        supporting_info_pending: false,
    }]))
}

/// One cited process on route R1 with the given exchanges.
fn single_process_text(exchanges: Value) -> Arc<ScriptedText> {
    Arc::new(ScriptedText::plan(
        json!({
            "selected_route_id": "R1",
            "routes": [{
                "route_id": "R1",
                "summary": "single step",
                "processes": [{
                    "process_id": "P1",
                    "base_name": "Main process",
                    "technology": "Rotary kiln, dry process",
                    "boundary": "grid",
                    "evidence_refs": ["S1"]
                }]
            }]
        }),
        json!({ "processes": [{ "process_id": "P1", "exchanges": exchanges }] }),
    ))
}

fn cited(direction: &str, name: &str, amount: f64, unit: &str) -> Value {
    json!({
        "direction": direction,
        "name": name,
        "flow_type": "product",
        "unit": unit,
        "amount": amount,
        "evidence_ref": "S1"
    })
}

fn flow(name: &str, unit: &str) -> ReferenceFlow {
    ReferenceFlow::named("ref-1", name, Some(unit))
}

/// Three planned processes, only P1 cited.
fn cement_plan_text() -> Arc<ScriptedText> {
    Arc::new(ScriptedText::plan(
        json!({
            "routes": [{
                "route_id": "R1",
                "processes": [
                    {"process_id": "P1", "reference_flow_name": "Limestone", "outputs": ["Limestone"], "evidence_refs": ["S1"]},
                    {"process_id": "P2", "reference_flow_name": "Clinker", "inputs": ["Limestone"], "outputs": ["Clinker"]},
                    {"process_id": "P3", "inputs": ["Clinker"], "outputs": ["Cement"]}
                ]
            }]
        }),
        json!({ "processes": [
            {"process_id": "P1", "exchanges": [{"direction": "output", "name": "Limestone", "unit": "kg"}]},
            {"process_id": "P3", "exchanges": [{"direction": "output", "name": "Cement", "unit": "kg", "is_reference_flow": true}]}
        ]}),
    ))
}

// ============================================================================
// Scenario A: coverage loop
// ============================================================================

#[tokio::test]
async fn scenario_a_partial_evidence_continues_then_falls_back() {
    let text = cement_plan_text();
    let literature = literature_with(&["S1"]);
    let mut config = fast_config();
    config.coverage.max_iterations = 2;
    let pipeline = Pipeline::new(
        Collaborators::new()
            .with_text(text)
            .with_literature(literature.clone()),
        config,
    )
    .unwrap();

    let first = pipeline
        .advance(&DerivationState::new(flow("Cement", "kg"), Operation::Produce), Stage::GatherEvidence)
        .await
        .unwrap();
    assert_eq!(first.processes.len(), 3);
    assert_relative_eq!(first.coverage_history[0].process_coverage, 1.0 / 3.0, epsilon = 1e-9);
    assert_eq!(first.stop_decisions[0].action, StopAction::Continue);
    assert!(!first.has_completed(Stage::GatherEvidence));

    let second = pipeline.advance(&first, Stage::GatherEvidence).await.unwrap();
    assert_eq!(second.coverage_history.len(), 2);
    assert_eq!(second.coverage_history[1].iteration, 2);
    assert_eq!(second.stop_decisions[1].action, StopAction::ExpertJudgement);
    assert!(second.has_completed(Stage::GatherEvidence));
    for id in ["P2", "P3"] {
        assert_eq!(second.process(id).unwrap().source_type, SourceType::ExpertJudgement);
        assert!(second.decisions.iter().any(|d| d.subject == id));
    }
    assert_eq!(second.process("P1").unwrap().source_type, SourceType::Literature);

    let requests = literature.requests.lock();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].iteration, 2);
    assert_eq!(requests[1].uncovered_processes, vec!["P2".to_string(), "P3".to_string()]);
    assert_eq!(requests[1].known_sources, vec!["S1".to_string()]);
    drop(requests);

    assert!(matches!(
        pipeline.advance(&second, Stage::GatherEvidence).await,
        Err(DerivationError::EvidenceLoopConcluded { iterations: 2 })
    ));
}

#[tokio::test]
async fn scenario_a_plateau_under_default_cap_stops_without_downgrade() {
    let pipeline = Pipeline::new(
        Collaborators::new()
            .with_text(cement_plan_text())
            .with_literature(literature_with(&["S1"])),
        fast_config(),
    )
    .unwrap();
    assert_eq!(pipeline.config().coverage.max_iterations, 3);

    let first = pipeline
        .advance(&DerivationState::new(flow("Cement", "kg"), Operation::Produce), Stage::GatherEvidence)
        .await
        .unwrap();
    assert_eq!(first.stop_decisions[0].action, StopAction::Continue);

    let second = pipeline.advance(&first, Stage::GatherEvidence).await.unwrap();
    assert_eq!(second.stop_decisions[1].action, StopAction::Stop);
    assert!(second.stop_decisions[1].reason.contains("plateau"));
    assert!(second.has_completed(Stage::GatherEvidence));
    // no downgrade records for the uncovered processes
    assert!(second.decisions.iter().all(|d| d.subject != "P2" && d.subject != "P3"));
    assert_eq!(second.process("P1").unwrap().source_type, SourceType::Literature);
}

// ============================================================================
// Scenario B: placeholder resolved in the secondary pass
// ============================================================================

#[tokio::test]
async fn scenario_b_secondary_pass_broadens_with_boundary() {
    let text = single_process_text(json!([
        cited("input", "Electricity, medium voltage", 90.0, "kWh"),
        {"direction": "output", "name": "Cement", "unit": "kg", "amount": 1.0,
         "evidence_ref": "S1", "is_reference_flow": true}
    ]));
    let search = Arc::new(
        MockSearch::default()
            .answer(
                "Electricity, medium voltage, grid",
                vec![candidate("el-mv", "Electricity, medium voltage", "MJ", FlowType::Product)],
            )
            .answer("Cement", vec![candidate("cem", "Cement", "kg", FlowType::Product)]),
    );
    let units = Arc::new(MockUnits::default().reference("el-mv", "MJ").reference("cem", "kg"));
    let pipeline = Pipeline::new(
        Collaborators::new()
            .with_text(text)
            .with_literature(literature_with(&["S1"]))
            .with_search(search.clone())
            .with_units(units),
        fast_config(),
    )
    .unwrap();

    let after_primary = pipeline
        .run(
            DerivationState::new(flow("Cement", "kg"), Operation::Produce),
            Some(Stage::MatchFlows),
            None,
        )
        .await
        .unwrap();
    let primary = &after_primary.match_results["P1-E1"];
    assert_eq!(primary.status, MatchStatus::Placeholder);
    assert_eq!(primary.reason, Some(Degradation::NoCandidatesFound));
    assert!(primary.selected.is_none());

    let done = pipeline.run(after_primary, None, None).await.unwrap();
    let secondary = &done.match_results["P1-E1"];
    assert_eq!(secondary.status, MatchStatus::Matched);
    assert_eq!(secondary.pass, MatchPass::Secondary);
    assert_eq!(secondary.query, "Electricity, medium voltage, grid");
    assert_eq!(secondary.candidate_id(), Some("el-mv"));
    assert!(done.placeholder_reports.is_empty());

    // matched implies a unit check, applied right after the secondary match
    let check = &done.unit_checks["P1-E1"];
    assert_eq!(check.status, UnitStatus::Converted);
    assert_relative_eq!(check.resolved_amount.value().unwrap(), 324.0, epsilon = 1e-9);
    let exchange = done.exchange("P1-E1").unwrap();
    assert_eq!(exchange.unit.as_deref(), Some("MJ"));

    let dataset_exchange = done.datasets[0]
        .exchanges
        .iter()
        .find(|e| e.exchange_id == "P1-E1")
        .unwrap();
    assert_eq!(dataset_exchange.flow.id(), Some("el-mv"));
    assert_eq!(dataset_exchange.original_unit.as_deref(), Some("kWh"));

    assert_eq!(
        search.seen.lock().iter().filter(|q| q.as_str() == "Electricity, medium voltage").count(),
        1
    );
}

#[tokio::test]
async fn unresolved_exchange_gets_a_placeholder_report() {
    let text = single_process_text(json!([
        cited("input", "Unobtainium", 2.0, "kg"),
        {"direction": "output", "name": "Cement", "unit": "kg", "amount": 1.0,
         "evidence_ref": "S1", "is_reference_flow": true}
    ]));
    let search = Arc::new(
        MockSearch::default().answer("Cement", vec![candidate("cem", "Cement", "kg", FlowType::Product)]),
    );
    let pipeline = Pipeline::new(
        Collaborators::new()
            .with_text(text)
            .with_literature(literature_with(&["S1"]))
            .with_search(search)
            .with_units(Arc::new(MockUnits::default().reference("cem", "kg"))),
        fast_config(),
    )
    .unwrap();

    let done = pipeline
        .run(DerivationState::new(flow("Cement", "kg"), Operation::Produce), None, None)
        .await
        .unwrap();
    let report = done.placeholder_report("P1-E1").unwrap();
    assert_eq!(report.status, MatchStatus::Unresolved);
    assert_eq!(report.reason, Degradation::NoCandidatesFound);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.last_query, "Unobtainium");
    assert!(!done.unit_checks.contains_key("P1-E1"));

    let dataset_exchange = &done.datasets[0].exchanges[0];
    assert!(dataset_exchange.flow.is_placeholder());
    assert_eq!(dataset_exchange.amount, Amount::Value(2.0));

    // a second secondary pass increments the same report
    let again = pipeline.advance(&done, Stage::ResolvePlaceholders).await.unwrap();
    assert_eq!(again.placeholder_report("P1-E1").unwrap().attempts, 2);
    assert_eq!(again.next_stage(), Some(Stage::ReviewBalance));
}

// ============================================================================
// Scenarios C and D: unit reconciliation through the pipeline
// ============================================================================

#[tokio::test]
async fn scenarios_c_and_d_linear_and_density_conversion() {
    let text = single_process_text(json!([
        cited("input", "Steel", 10.0, "t"),
        cited("input", "Diesel", 5.0, "m3"),
        cited("input", "Sand", 3.0, "bushel"),
        {"direction": "output", "name": "Concrete", "unit": "m3", "amount": 1.0,
         "evidence_ref": "S1", "is_reference_flow": true}
    ]));
    let search = Arc::new(
        MockSearch::default()
            .answer("Steel", vec![candidate("steel", "Steel", "kg", FlowType::Product)])
            .answer("Diesel", vec![candidate("diesel", "Diesel", "kg", FlowType::Product)])
            .answer("Sand", vec![candidate("sand", "Sand", "kg", FlowType::Product)])
            .answer("Concrete", vec![candidate("concrete", "Concrete", "m3", FlowType::Product)]),
    );
    let units = Arc::new(
        MockUnits::default()
            .reference("steel", "kg")
            .reference("diesel", "kg")
            .reference("sand", "kg")
            .reference("concrete", "m3"),
    );
    let density = Arc::new(FixedDensity::new(800.0, "kg/m3"));
    let pipeline = Pipeline::new(
        Collaborators::new()
            .with_text(text)
            .with_literature(literature_with(&["S1"]))
            .with_search(search)
            .with_units(units)
            .with_density(density.clone()),
        fast_config(),
    )
    .unwrap();

    let state = pipeline
        .run(
            DerivationState::new(flow("Concrete", "m3"), Operation::Produce),
            Some(Stage::AssembleDatasets),
            None,
        )
        .await
        .unwrap();

    let steel = &state.unit_checks["P1-E1"];
    assert_eq!(steel.status, UnitStatus::Converted);
    assert_eq!(steel.factor, Some(1000.0));
    assert_eq!(state.exchange("P1-E1").unwrap().amount, Amount::Value(10_000.0));
    assert_eq!(state.exchange("P1-E1").unwrap().unit.as_deref(), Some("kg"));

    let diesel = &state.unit_checks["P1-E2"];
    assert_eq!(diesel.status, UnitStatus::ConvertedByDensity);
    assert_relative_eq!(diesel.resolved_amount.value().unwrap(), 4000.0, epsilon = 1e-9);
    let used = diesel.density_used.as_ref().unwrap();
    assert_eq!(used.source_type, SourceType::ExpertJudgement);
    assert_eq!(used.value, 800.0);
    assert_eq!(diesel.original_amount, Amount::Value(5.0));
    assert_eq!(density.calls.load(Ordering::SeqCst), 1);

    let sand = &state.unit_checks["P1-E3"];
    assert_eq!(sand.status, UnitStatus::Review);
    assert_eq!(sand.reason, Some(Degradation::UnknownUnitDimension));
    assert_eq!(state.exchange("P1-E3").unwrap().amount, Amount::Value(3.0));

    let dataset = &state.datasets[0];
    assert_eq!(dataset.functional_unit, "1 m3 of Concrete");
    let diesel_out = dataset.exchanges.iter().find(|e| e.name == "Diesel").unwrap();
    assert_eq!(diesel_out.original_amount, Some(Amount::Value(5.0)));
    assert_eq!(diesel_out.unit_status, Some(UnitStatus::ConvertedByDensity));

    // re-running reconciliation starts from the extracted values
    let rerun = pipeline.advance(&state, Stage::ReconcileUnits).await.unwrap();
    assert_eq!(rerun.exchange("P1-E1").unwrap().amount, Amount::Value(10_000.0));
    assert_eq!(rerun.unit_checks["P1-E1"].original_amount, Amount::Value(10.0));
    assert_eq!(rerun.next_stage(), Some(Stage::AssembleDatasets));
}

// ============================================================================
// Scenario E: balance review, publication, session lifecycle
// ============================================================================

#[tokio::test]
async fn scenario_e_balance_ok_with_catalyst_excluded() {
    let text = single_process_text(json!([
        cited("input", "Iron ore", 60.0, "kg"),
        cited("input", "Coke", 40.0, "kg"),
        {"direction": "input", "name": "Catalyst", "unit": "kg", "amount": 4.0,
         "evidence_ref": "S1", "material_role": "catalyst"},
        {"direction": "output", "name": "Pig iron", "unit": "kg", "amount": 90.0,
         "evidence_ref": "S1", "is_reference_flow": true},
        cited("output", "Slag", 6.0, "kg")
    ]));
    let mut search = MockSearch::default();
    let mut units = MockUnits::default();
    for (id, name) in [("ore", "Iron ore"), ("coke", "Coke"), ("cat", "Catalyst"), ("pig", "Pig iron"), ("slag", "Slag")] {
        search = search.answer(name, vec![candidate(id, name, "kg", FlowType::Product)]);
        units = units.reference(id, "kg");
    }
    let session = Arc::new(CountingSession::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let pipeline = Pipeline::new(
        Collaborators::new()
            .with_text(text)
            .with_literature(literature_with(&["S1"]))
            .with_search(Arc::new(search))
            .with_units(Arc::new(units))
            .with_session(session.clone())
            .with_validator(Arc::new(AcceptAll))
            .with_publisher(publisher.clone()),
        fast_config(),
    )
    .unwrap();

    let done = pipeline
        .run(DerivationState::new(flow("Pig iron", "kg"), Operation::Produce), None, None)
        .await
        .unwrap();

    assert_eq!(done.balance_results.len(), 1);
    let mass = &done.balance_results[0];
    assert_eq!(mass.basis, Basis::Mass);
    assert_relative_eq!(mass.total_input, 100.0);
    assert_relative_eq!(mass.total_output, 96.0);
    assert_relative_eq!(mass.imbalance_ratio, 0.04, epsilon = 1e-12);
    assert_eq!(mass.status, BalanceStatus::Ok);
    assert!(mass.warnings.is_empty());

    assert_eq!(done.narratives.len(), 1);
    assert_eq!(done.narratives[0].origin, "template");
    assert!(done.datasets[0].narrative.is_some());

    assert_eq!(done.publications.len(), 1);
    assert_eq!(done.publications[0].valid, Some(true));
    assert_eq!(done.publications[0].persisted_id.as_deref(), Some("persisted-1"));
    assert_eq!(publisher.documents.lock()[0]["version"], "01.01.000");

    assert_eq!(session.opened.load(Ordering::SeqCst), 1);
    assert_eq!(session.closed.load(Ordering::SeqCst), 1);
    assert_eq!(done.next_stage(), None);
}

// ============================================================================
// Fatal chain violation
// ============================================================================

#[tokio::test]
async fn broken_chain_is_fatal_and_state_does_not_advance() {
    let text = Arc::new(ScriptedText::plan(
        json!({
            "routes": [{
                "route_id": "R1",
                "processes": [
                    {"process_id": "P1", "reference_flow_name": "Clinker", "evidence_refs": ["S1"]},
                    {"process_id": "P2", "inputs": ["Fly ash"], "evidence_refs": ["S1"]}
                ]
            }]
        }),
        json!({ "processes": [] }),
    ));
    let session = Arc::new(CountingSession::default());
    let pipeline = Pipeline::new(
        Collaborators::new()
            .with_text(text)
            .with_literature(literature_with(&["S1"]))
            .with_session(session.clone()),
        fast_config(),
    )
    .unwrap();

    let before = pipeline
        .run(
            DerivationState::new(flow("Cement", "kg"), Operation::Produce),
            Some(Stage::ReconcileUnits),
            None,
        )
        .await
        .unwrap();
    let err = pipeline
        .advance(&before, Stage::AssembleDatasets)
        .await
        .unwrap_err();
    match err {
        DerivationError::ScheduleBoundaryViolation {
            route_id,
            upstream,
            downstream,
            ..
        } => {
            assert_eq!(route_id, "R1");
            assert_eq!(upstream, "P1");
            assert_eq!(downstream, "P2");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(before.next_stage(), Some(Stage::AssembleDatasets));
    assert!(before.datasets.is_empty());

    assert!(pipeline.run(before, None, None).await.is_err());
    assert_eq!(session.opened.load(Ordering::SeqCst), 2);
    assert_eq!(session.closed.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Resume from a serialized boundary
// ============================================================================

#[tokio::test]
async fn serialized_state_resumes_where_it_stopped() {
    let text = single_process_text(json!([
        {"direction": "output", "name": "Cement", "unit": "kg", "amount": 1.0,
         "evidence_ref": "S1", "is_reference_flow": true}
    ]));
    let pipeline = Pipeline::new(
        Collaborators::new()
            .with_text(text)
            .with_literature(literature_with(&["S1"]))
            .with_search(Arc::new(
                MockSearch::default().answer("Cement", vec![candidate("cem", "Cement", "kg", FlowType::Product)]),
            ))
            .with_units(Arc::new(MockUnits::default().reference("cem", "kg"))),
        fast_config(),
    )
    .unwrap();

    let stopped = pipeline
        .run(
            DerivationState::new(flow("Cement", "kg"), Operation::Produce),
            Some(Stage::MatchFlows),
            None,
        )
        .await
        .unwrap();
    let json = serde_json::to_string(&stopped).unwrap();
    let restored: DerivationState = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.completed, stopped.completed);
    assert_eq!(restored.match_results.len(), 1);

    let done = pipeline.run(restored, None, None).await.unwrap();
    assert_eq!(done.run_id, stopped.run_id);
    assert_eq!(done.next_stage(), None);
    assert_eq!(done.unit_checks["P1-E1"].status, UnitStatus::Ok);
}
