//! External collaborator interfaces
//!
//! Everything the engines consume from the outside world sits behind one of
//! these async traits. Every method may fail with a [`CollaboratorError`];
//! the engines wrap each call in [`crate::retry::call_with_retry`] and turn
//! the final failure into a recorded degradation.

use crate::error::CollaboratorError;
use crate::flow::LanguageTaggedText;
use crate::model::{EvidenceItem, FlowCandidate, FlowType, Operation, SearchHints};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Flow search
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowQuery {
    /// Free-text query, already enriched with hints by the matcher.
    pub text: String,
    pub hints: SearchHints,
    pub flow_type: Option<FlowType>,
    pub limit: usize,
}

#[async_trait]
pub trait FlowSearch: Send + Sync {
    /// Ranked candidates, best first. An empty list is a valid answer.
    async fn search_flows(&self, query: &FlowQuery) -> Result<Vec<FlowCandidate>, CollaboratorError>;
}

// ============================================================================
// Units
// ============================================================================

/// One unit of a catalogue unit group. `factor` converts an amount in this
/// unit to the group's reference unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFactor {
    pub name: String,
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitGroupInfo {
    pub reference_unit: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub units: Vec<UnitFactor>,
}

impl UnitGroupInfo {
    pub fn reference(unit: &str) -> Self {
        Self {
            reference_unit: unit.to_string(),
            group_name: None,
            units: Vec::new(),
        }
    }
}

#[async_trait]
pub trait UnitCatalog: Send + Sync {
    async fn lookup_reference_unit(&self, flow_id: &str) -> Result<UnitGroupInfo, CollaboratorError>;
}

// ============================================================================
// Density estimation
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialContext {
    pub exchange_name: String,
    pub flow_name: String,
    pub flow_type: FlowType,
    pub classification: Vec<String>,
    pub technology: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityEstimate {
    pub value: f64,
    /// One of kg/m3, g/cm3, kg/L, g/L, t/m3.
    pub unit: String,
    pub assumption: String,
}

#[async_trait]
pub trait DensityEstimator: Send + Sync {
    async fn estimate_density(
        &self,
        material: &MaterialContext,
    ) -> Result<DensityEstimate, CollaboratorError>;
}

// ============================================================================
// Text generation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTask {
    Routes,
    Exchanges,
    SelectCandidate,
    EstimateDensity,
    Narrative,
}

impl PromptTask {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptTask::Routes => "routes",
            PromptTask::Exchanges => "exchanges",
            PromptTask::SelectCandidate => "select_candidate",
            PromptTask::EstimateDensity => "estimate_density",
            PromptTask::Narrative => "narrative",
        }
    }
}

impl fmt::Display for PromptTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prompt is a task tag, short instructions, and a JSON context. Prompt
/// wording beyond that belongs to the generator backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptContext {
    pub task: PromptTask,
    pub instructions: String,
    pub context: Value,
    pub lang: String,
}

impl PromptContext {
    pub fn new(task: PromptTask, instructions: impl Into<String>, context: Value) -> Self {
        Self {
            task,
            instructions: instructions.into(),
            context,
            lang: "en".to_string(),
        }
    }

    /// Instructions and context rendered as one prompt string.
    pub fn render(&self) -> String {
        let context = serde_json::to_string_pretty(&self.context).unwrap_or_default();
        format!(
            "Task: {}\n{}\n\nContext (JSON):\n{}",
            self.task, self.instructions, context
        )
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(&self, prompt: &PromptContext)
        -> Result<LanguageTaggedText, CollaboratorError>;
}

// ============================================================================
// Literature
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRequest {
    pub flow_name: String,
    pub operation: Operation,
    pub iteration: u32,
    /// Processes without usable evidence so far.
    pub uncovered_processes: Vec<String>,
    pub known_sources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBatch {
    pub items: Vec<EvidenceItem>,
    /// The source points at supporting information not yet retrieved.
    #[serde(default)]
    pub supporting_info_pending: bool,
}

#[async_trait]
pub trait LiteratureSearch: Send + Sync {
    async fn gather_evidence(&self, request: &EvidenceRequest) -> Result<EvidenceBatch, CollaboratorError>;
}

// ============================================================================
// Downstream
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistResult {
    pub id: String,
    pub version: String,
}

#[async_trait]
pub trait SchemaValidator: Send + Sync {
    async fn validate_schema(&self, document: &Value) -> Result<ValidationReport, CollaboratorError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, document: &Value) -> Result<PersistResult, CollaboratorError>;
}

/// Acquired once per run and released exactly once.
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    async fn open(&self) -> Result<(), CollaboratorError>;
    async fn close(&self) -> Result<(), CollaboratorError>;
}

// ============================================================================
// Bundle
// ============================================================================

/// The collaborators available to a run. Every slot is optional; an empty
/// slot behaves like a collaborator that is permanently unavailable.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub search: Option<Arc<dyn FlowSearch>>,
    pub units: Option<Arc<dyn UnitCatalog>>,
    pub density: Option<Arc<dyn DensityEstimator>>,
    pub text: Option<Arc<dyn TextGenerator>>,
    pub literature: Option<Arc<dyn LiteratureSearch>>,
    pub validator: Option<Arc<dyn SchemaValidator>>,
    pub publisher: Option<Arc<dyn Publisher>>,
    pub session: Option<Arc<dyn SessionLifecycle>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, search: Arc<dyn FlowSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_units(mut self, units: Arc<dyn UnitCatalog>) -> Self {
        self.units = Some(units);
        self
    }

    pub fn with_density(mut self, density: Arc<dyn DensityEstimator>) -> Self {
        self.density = Some(density);
        self
    }

    pub fn with_text(mut self, text: Arc<dyn TextGenerator>) -> Self {
        self.text = Some(text);
        self
    }

    pub fn with_literature(mut self, literature: Arc<dyn LiteratureSearch>) -> Self {
        self.literature = Some(literature);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_session(mut self, session: Arc<dyn SessionLifecycle>) -> Self {
        self.session = Some(session);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("search", &self.search.is_some())
            .field("units", &self.units.is_some())
            .field("density", &self.density.is_some())
            .field("text", &self.text.is_some())
            .field("literature", &self.literature.is_some())
            .field("validator", &self.validator.is_some())
            .field("publisher", &self.publisher.is_some())
            .field("session", &self.session.is_some())
            .finish()
    }
}
