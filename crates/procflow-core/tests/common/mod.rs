//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use procflow_core::*;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// Flow search / units / density
// ============================================================================

/// Answers by exact query text and records every query it sees.
#[derive(Default)]
pub struct MockSearch {
    answers: HashMap<String, Vec<FlowCandidate>>,
    pub seen: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn answer(mut self, query: &str, candidates: Vec<FlowCandidate>) -> Self {
        self.answers.insert(query.to_string(), candidates);
        self
    }
}

#[async_trait]
impl FlowSearch for MockSearch {
    async fn search_flows(&self, query: &FlowQuery) -> Result<Vec<FlowCandidate>, CollaboratorError> {
        self.seen.lock().push(query.text.clone());
        Ok(self.answers.get(&query.text).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MockUnits {
    groups: HashMap<String, UnitGroupInfo>,
}

impl MockUnits {
    pub fn reference(mut self, flow_id: &str, unit: &str) -> Self {
        self.groups
            .insert(flow_id.to_string(), UnitGroupInfo::reference(unit));
        self
    }
}

#[async_trait]
impl UnitCatalog for MockUnits {
    async fn lookup_reference_unit(&self, flow_id: &str) -> Result<UnitGroupInfo, CollaboratorError> {
        self.groups
            .get(flow_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::Unavailable(format!("no unit group for {flow_id}")))
    }
}

pub struct FixedDensity {
    pub value: f64,
    pub unit: &'static str,
    pub calls: AtomicUsize,
}

impl FixedDensity {
    pub fn new(value: f64, unit: &'static str) -> Self {
        Self {
            value,
            unit,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DensityEstimator for FixedDensity {
    async fn estimate_density(&self, material: &MaterialContext) -> Result<DensityEstimate, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(DensityEstimate {
            value: self.value,
            unit: self.unit.to_string(),
            assumption: format!("typical {}", material.flow_name),
        })
    }
}

// ============================================================================
// Text generation / literature
// ============================================================================

/// Fixed reply per prompt task; tasks without a reply are unavailable.
#[derive(Default)]
pub struct ScriptedText {
    replies: HashMap<PromptTask, String>,
    pub asked: Mutex<Vec<PromptTask>>,
}

impl ScriptedText {
    pub fn reply(mut self, task: PromptTask, reply: impl Into<String>) -> Self {
        self.replies.insert(task, reply.into());
        self
    }

    pub fn plan(routes: Value, exchanges: Value) -> Self {
        Self::default()
            .reply(PromptTask::Routes, routes.to_string())
            .reply(PromptTask::Exchanges, exchanges.to_string())
    }
}

#[async_trait]
impl TextGenerator for ScriptedText {
    async fn generate_text(&self, prompt: &PromptContext) -> Result<LanguageTaggedText, CollaboratorError> {
        self.asked.lock().push(prompt.task);
        self.replies
            .get(&prompt.task)
            .map(|text| LanguageTaggedText::en(text.clone()))
            .ok_or_else(|| CollaboratorError::Unavailable(format!("no scripted {} reply", prompt.task)))
    }
}

/// Hands out queued batches, then empty ones.
#[derive(Default)]
pub struct QueuedLiterature {
    batches: Mutex<VecDeque<EvidenceBatch>>,
    pub requests: Mutex<Vec<EvidenceRequest>>,
}

impl QueuedLiterature {
    pub fn new(batches: Vec<EvidenceBatch>) -> Self {
        Self {
            batches: Mutex::new(batches.into()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LiteratureSearch for QueuedLiterature {
    async fn gather_evidence(&self, request: &EvidenceRequest) -> Result<EvidenceBatch, CollaboratorError> {
        self.requests.lock().push(request.clone());
        Ok(self.batches.lock().pop_front().unwrap_or_default())
    }
}

pub fn evidence(source_id: &str, usable: bool) -> EvidenceItem {
    EvidenceItem {
        source_id: source_id.to_string(),
        title: Some(format!("Source {source_id}")),
        usable,
        scope: vec![EvidenceScope::Route],
    }
}

// ============================================================================
// Downstream
// ============================================================================

#[derive(Default)]
pub struct CountingSession {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

#[async_trait]
impl SessionLifecycle for CountingSession {
    async fn open(&self) -> Result<(), CollaboratorError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), CollaboratorError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct AcceptAll;

#[async_trait]
impl SchemaValidator for AcceptAll {
    async fn validate_schema(&self, _: &Value) -> Result<ValidationReport, CollaboratorError> {
        Ok(ValidationReport {
            valid: true,
            errors: vec![],
        })
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub documents: Mutex<Vec<Value>>,
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, document: &Value) -> Result<PersistResult, CollaboratorError> {
        let mut documents = self.documents.lock();
        documents.push(document.clone());
        Ok(PersistResult {
            id: format!("persisted-{}", documents.len()),
            version: "01.01.000".to_string(),
        })
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn candidate(id: &str, name: &str, unit: &str, flow_type: FlowType) -> FlowCandidate {
    FlowCandidate {
        id: id.to_string(),
        name: name.to_string(),
        version: Some("01.00.000".to_string()),
        unit: Some(unit.to_string()),
        classification: vec![],
        flow_type: Some(flow_type),
        score: None,
        rationale: None,
    }
}

/// Similarity selection, no retry delays.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.matching.selector = SelectorKind::Similarity;
    config.calls = CallPolicy::immediate(2_000);
    config
}
