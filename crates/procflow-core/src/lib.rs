//! procflow core: derive a chain of unit processes from one reference flow
//!
//! The engine turns a single reference product/waste flow into a chain of
//! unit-process records whose exchanges are resolved against a flow
//! catalogue, unit-reconciled, balance-checked, and annotated with an audit
//! narrative. Evidence may be partial or missing; every gap degrades to an
//! explicit placeholder or review status instead of an invented value.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        DERIVATION PIPELINE                               │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  ReferenceFlow ──► ┌────────────────────┐   literature / text generator  │
//! │                    │  gather_evidence   │◄──────────────────────────────│
//! │                    │  (coverage loop)   │──┐                             │
//! │                    └─────────┬──────────┘  │ continue                    │
//! │                              │ stop ◄──────┘                             │
//! │                    ┌─────────▼──────────┐                                │
//! │                    │  match_flows (1st) │◄──── search_flows / select     │
//! │                    └─────────┬──────────┘                                │
//! │                    ┌─────────▼──────────┐                                │
//! │                    │  reconcile_units   │◄──── unit lookup / density     │
//! │                    └─────────┬──────────┘                                │
//! │                    ┌─────────▼──────────┐                                │
//! │                    │ assemble_datasets  │──── chain invariant check      │
//! │                    └─────────┬──────────┘                                │
//! │                    ┌─────────▼──────────┐                                │
//! │                    │ resolve_placeholders│◄─── broadened search (2nd)    │
//! │                    └─────────┬──────────┘                                │
//! │                    ┌─────────▼──────────┐                                │
//! │                    │  review_balance    │                                │
//! │                    └─────────┬──────────┘                                │
//! │                    ┌─────────▼──────────┐                                │
//! │                    │  summarize/publish │──► datasets + audit artifacts  │
//! │                    └────────────────────┘                                │
//! │                                                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every arrow into a box is an external collaborator call with a timeout,
//! bounded retries, and a graceful-degradation path. Every box is a stage
//! boundary: [`Pipeline::advance`] maps `(prior_state, stage)` to a new
//! [`DerivationState`] so callers can stop, snapshot, and resume anywhere.

pub mod assembly;
pub mod balance;
pub mod collaborators;
pub mod config;
pub mod coverage;
pub mod error;
pub mod flow;
pub mod generation;
pub mod matching;
pub mod model;
pub mod narrative;
pub mod pipeline;
pub mod providers;
pub mod retry;
pub mod selector;
pub mod state;
pub mod units;

// ============================================================================
// Re-exports
// ============================================================================

pub use assembly::{DatasetAssembler, DatasetExchange, FlowReference, ProcessDataset};
pub use balance::BalanceReviewer;
pub use collaborators::{
    Collaborators, DensityEstimate, DensityEstimator, EvidenceBatch, EvidenceRequest, FlowQuery,
    FlowSearch, LiteratureSearch, MaterialContext, PersistResult, PromptContext, PromptTask,
    Publisher, SchemaValidator, SessionLifecycle, TextGenerator, UnitCatalog, UnitFactor,
    UnitGroupInfo, ValidationReport,
};
pub use config::{
    BalanceConfig, ConfigError, CoverageConfig, EngineConfig, MatchingConfig, SelectorKind,
    UnitConfig,
};
pub use error::{CollaboratorError, Degradation, DerivationError};
pub use flow::{LanguageTaggedText, MultiLangText, ReferenceFlow};
pub use matching::{FlowMatcher, Medium};
pub use model::*;
pub use narrative::{NarrativeCounts, NarrativeGenerator};
pub use pipeline::{Pipeline, StageObserver};
pub use providers::{CatalogueFlow, LocalCatalogue, ModelDensityEstimator};
#[cfg(feature = "openai")]
pub use providers::{LlmConfig, OpenAiTextGenerator};
pub use retry::CallPolicy;
pub use selector::{
    CandidateSelector, ModelSelector, SelectionContext, SelectionResult, SimilaritySelector,
};
pub use state::{DecisionRecord, DerivationState, Stage};
pub use units::{Dimension, UnitReconciler};
