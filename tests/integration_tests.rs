//! Integration tests for the complete procflow pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - Plan generation → matching against a LocalCatalogue → unit reconciliation
//! - Stage snapshots → resume from the newest verified snapshot
//! - Offline runs degrade to placeholders instead of invented values
//!
//! Run with: cargo test --test integration_tests

use async_trait::async_trait;
use procflow_core::*;
use procflow_storage::SnapshotStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::tempdir;

// ============================================================================
// Collaborators
// ============================================================================

const CATALOGUE: &str = r#"{
    "flows": [
        {"id": "el-mv", "name": "Electricity, medium voltage", "version": "03.00.003",
         "reference_unit": "MJ", "units": [{"name": "kWh", "factor": 3.6}, {"name": "MJ", "factor": 1.0}],
         "flow_type": "product"},
        {"id": "limestone", "name": "Limestone", "reference_unit": "kg", "flow_type": "product"},
        {"id": "quicklime", "name": "Quicklime", "reference_unit": "kg", "flow_type": "product"},
        {"id": "co2", "name": "Carbon dioxide", "reference_unit": "kg", "flow_type": "elementary"}
    ]
}"#;

/// Canned planning replies keyed by prompt task.
struct Planner(HashMap<PromptTask, String>);

impl Planner {
    fn lime_kiln() -> Self {
        let routes = json!({
            "selected_route_id": "R1",
            "routes": [{
                "route_id": "R1",
                "summary": "quarrying then calcination",
                "processes": [
                    {"process_id": "P1", "base_name": "Limestone quarrying",
                     "reference_flow_name": "Limestone", "outputs": ["Limestone"], "evidence_refs": ["S1"]},
                    {"process_id": "P2", "base_name": "Calcination",
                     "technology": "Shaft kiln", "reference_flow_name": "Quicklime",
                     "inputs": ["Limestone"], "outputs": ["Quicklime"], "evidence_refs": ["S1"]}
                ]
            }]
        });
        let exchanges = json!({
            "processes": [
                {"process_id": "P1", "exchanges": [
                    exchange("input", "Electricity, medium voltage", "product", 10.0, "kWh"),
                    {"direction": "output", "name": "Limestone", "flow_type": "product",
                     "unit": "kg", "amount": 1000.0, "evidence_ref": "S1", "is_reference_flow": true}
                ]},
                {"process_id": "P2", "exchanges": [
                    exchange("input", "Limestone", "product", 1.78, "t"),
                    exchange("input", "Electricity, medium voltage", "product", 0.5, "kWh"),
                    {"direction": "output", "name": "Quicklime", "flow_type": "product",
                     "unit": "kg", "amount": 1000.0, "evidence_ref": "S1", "is_reference_flow": true},
                    exchange("output", "Carbon dioxide", "elementary", 785.0, "kg")
                ]}
            ]
        });
        let mut replies = HashMap::new();
        replies.insert(PromptTask::Routes, routes.to_string());
        replies.insert(PromptTask::Exchanges, exchanges.to_string());
        Self(replies)
    }
}

fn exchange(direction: &str, name: &str, flow_type: &str, amount: f64, unit: &str) -> Value {
    json!({
        "direction": direction,
        "name": name,
        "flow_type": flow_type,
        "unit": unit,
        "amount": amount,
        "evidence_ref": "S1"
    })
}

#[async_trait]
impl TextGenerator for Planner {
    async fn generate_text(&self, prompt: &PromptContext) -> Result<LanguageTaggedText, CollaboratorError> {
        self.0
            .get(&prompt.task)
            .map(|text| LanguageTaggedText::en(text.clone()))
            .ok_or_else(|| CollaboratorError::Unavailable(format!("no reply for {}", prompt.task)))
    }
}

struct OneSource;

#[async_trait]
impl LiteratureSearch for OneSource {
    async fn gather_evidence(&self, _: &EvidenceRequest) -> Result<EvidenceBatch, CollaboratorError> {
        Ok(EvidenceBatch {
            items: vec![EvidenceItem {
                source_id: "S1".to_string(),
                title: Some("Lime production survey".to_string()),
                usable: true,
                scope: vec![EvidenceScope::Route, EvidenceScope::ExchangeValues],
            }],
            supporting_info_pending: false,
        })
    }
}

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.matching.selector = SelectorKind::Similarity;
    config.calls = CallPolicy::immediate(2_000);
    config
}

fn pipeline() -> Pipeline {
    let catalogue = Arc::new(LocalCatalogue::from_json_str(CATALOGUE).unwrap());
    let collaborators = Collaborators::new()
        .with_search(catalogue.clone())
        .with_units(catalogue)
        .with_text(Arc::new(Planner::lime_kiln()))
        .with_literature(Arc::new(OneSource));
    Pipeline::new(collaborators, config()).unwrap()
}

fn quicklime() -> DerivationState {
    DerivationState::new(ReferenceFlow::named("ref-ql", "Quicklime", Some("kg")), Operation::Produce)
}

// ============================================================================
// Full run
// ============================================================================

#[tokio::test]
async fn test_full_run_against_local_catalogue() {
    let done = pipeline().run(quicklime(), None, None).await.unwrap();

    assert_eq!(done.next_stage(), None);
    assert_eq!(done.selected_route.as_deref(), Some("R1"));
    assert_eq!(done.processes.len(), 2);
    assert_eq!(done.evidence_iterations(), 1);

    // every exchange resolves in the primary pass
    assert_eq!(done.match_results.len(), done.exchanges.len());
    assert!(done.match_results.values().all(|r| r.is_matched()));
    assert!(done.placeholder_reports.is_empty());

    // 1.78 t limestone and 10 kWh electricity land in catalogue units
    let limestone = done
        .exchanges
        .iter()
        .find(|e| e.process_id == "P2" && e.name == "Limestone")
        .unwrap();
    assert_eq!(limestone.unit.as_deref(), Some("kg"));
    assert!((limestone.amount.value().unwrap() - 1780.0).abs() < 1e-9);
    let electricity = done
        .exchanges
        .iter()
        .find(|e| e.process_id == "P1" && e.name.starts_with("Electricity"))
        .unwrap();
    assert_eq!(electricity.unit.as_deref(), Some("MJ"));
    assert!((electricity.amount.value().unwrap() - 36.0).abs() < 1e-9);

    // two datasets, terminal one carries the reference flow
    assert_eq!(done.datasets.len(), 2);
    let terminal = done.datasets.iter().find(|d| d.process_id == "P2").unwrap();
    assert_eq!(terminal.functional_unit, "1 kg of Quicklime");
    assert!(terminal.exchanges.iter().any(|e| e.is_reference_flow && !e.flow.is_placeholder()));
    let converted = terminal.exchanges.iter().find(|e| e.name == "Limestone").unwrap();
    assert_eq!(converted.original_unit.as_deref(), Some("t"));
    assert!(terminal.narrative.is_some());

    // calcination balances on mass: 1780 in, 1785 out
    let mass = done
        .balance_results
        .iter()
        .find(|r| r.process_id == "P2" && r.basis == Basis::Mass)
        .unwrap();
    assert_eq!(mass.status, BalanceStatus::Ok);
    assert!(mass.imbalance_ratio < 0.01);

    // nothing to publish to
    assert!(done.publications.is_empty());
}

// ============================================================================
// Snapshots and resume
// ============================================================================

#[tokio::test]
async fn test_stop_snapshot_and_resume() {
    let dir = tempdir().unwrap();
    let state_dir = dir.path().join("run");

    let stopped = {
        let store = SnapshotStore::open(&state_dir).unwrap();
        pipeline()
            .run(quicklime(), Some(Stage::AssembleDatasets), Some(&store as &dyn StageObserver))
            .await
            .unwrap()
    };
    assert_eq!(stopped.last_completed(), Some(Stage::AssembleDatasets));
    assert_eq!(stopped.next_stage(), Some(Stage::ResolvePlaceholders));

    // a fresh process picks up where the first one stopped
    let store = SnapshotStore::open(&state_dir).unwrap();
    let snapshot = store.latest().unwrap().unwrap();
    assert_eq!(snapshot.stage, Stage::AssembleDatasets);
    assert_eq!(snapshot.state.run_id, stopped.run_id);

    let resumed = pipeline()
        .run(snapshot.state, None, Some(&store as &dyn StageObserver))
        .await
        .unwrap();
    assert_eq!(resumed.next_stage(), None);
    assert_eq!(resumed.run_id, stopped.run_id);

    let uninterrupted = pipeline().run(quicklime(), None, None).await.unwrap();
    assert_eq!(resumed.datasets.len(), uninterrupted.datasets.len());
    assert_eq!(resumed.balance_results.len(), uninterrupted.balance_results.len());
    assert_eq!(resumed.match_results.len(), uninterrupted.match_results.len());

    let stages: Vec<Stage> = store.entries().unwrap().iter().map(|e| e.stage).collect();
    assert_eq!(stages.first(), Some(&Stage::GatherEvidence));
    assert_eq!(stages.last(), Some(&Stage::Publish));

    store.cleanup().unwrap();
    assert!(!state_dir.exists());
}

#[tokio::test]
async fn test_resume_rejects_out_of_order_stage() {
    let stopped = pipeline()
        .run(quicklime(), Some(Stage::MatchFlows), None)
        .await
        .unwrap();
    let err = pipeline()
        .advance(&stopped, Stage::AssembleDatasets)
        .await
        .unwrap_err();
    assert!(matches!(err, DerivationError::StageOrder { .. }));
}

// ============================================================================
// Offline degradation
// ============================================================================

#[tokio::test]
async fn test_offline_run_degrades_without_fabrication() {
    let pipeline = Pipeline::new(Collaborators::new(), config()).unwrap();
    let done = pipeline.run(quicklime(), None, None).await.unwrap();

    assert_eq!(done.next_stage(), None);
    assert!(!done.datasets.is_empty());
    for dataset in &done.datasets {
        for exchange in &dataset.exchanges {
            assert!(exchange.flow.is_placeholder(), "{} was bound to a catalogue flow", exchange.name);
        }
    }
    assert!(!done.placeholder_reports.is_empty());
    assert!(done
        .decisions
        .iter()
        .any(|d| d.reason.contains("fallback") || d.reason.contains("unavailable")));
}

#[tokio::test]
async fn test_catalogue_loaded_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("catalogue.json");
    std::fs::write(&path, CATALOGUE).unwrap();

    let catalogue = LocalCatalogue::load(&path).unwrap();
    assert_eq!(catalogue.len(), 4);
    let info = catalogue.lookup_reference_unit("el-mv").await.unwrap();
    assert_eq!(info.reference_unit, "MJ");
    assert!(catalogue.lookup_reference_unit("missing").await.is_err());
}
