//! Provided collaborator backends
//!
//! - [`LocalCatalogue`]: an in-memory flow catalogue loaded from JSON,
//!   serving flow search and unit-group lookup.
//! - [`ModelDensityEstimator`]: density estimates through a text generator.
//! - `OpenAiTextGenerator` (feature `openai`): chat-completions client.

use crate::collaborators::{
    DensityEstimate, DensityEstimator, FlowQuery, FlowSearch, MaterialContext, PromptContext,
    PromptTask, TextGenerator, UnitCatalog, UnitFactor, UnitGroupInfo,
};
use crate::error::CollaboratorError;
use crate::generation::extract_json_object;
use crate::model::{FlowCandidate, FlowType};
use crate::selector::normalize_tokens;
use crate::units::density_to_kg_per_m3;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "openai")]
pub use openai::{LlmConfig, OpenAiTextGenerator};

const MAX_RESULTS: usize = 10;

// ============================================================================
// Local catalogue
// ============================================================================

/// One catalogue entry with its unit group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogueFlow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub reference_unit: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub units: Vec<UnitFactor>,
    #[serde(default)]
    pub classification: Vec<String>,
    #[serde(default)]
    pub flow_type: Option<FlowType>,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

impl CatalogueFlow {
    fn tokens(&self) -> BTreeSet<String> {
        std::iter::once(self.name.as_str())
            .chain(self.synonyms.iter().map(String::as_str))
            .flat_map(normalize_tokens)
            .collect()
    }

    fn candidate(&self, score: f64) -> FlowCandidate {
        FlowCandidate {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            unit: Some(self.reference_unit.clone()),
            classification: self.classification.clone(),
            flow_type: self.flow_type,
            score: Some(score),
            rationale: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogueDocument {
    Wrapped { flows: Vec<CatalogueFlow> },
    Bare(Vec<CatalogueFlow>),
}

#[derive(Debug, Clone, Default)]
pub struct LocalCatalogue {
    flows: Vec<CatalogueFlow>,
}

impl LocalCatalogue {
    pub fn new(flows: Vec<CatalogueFlow>) -> Self {
        Self { flows }
    }

    /// Accepts `{"flows": [...]}` or a bare array.
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let document: CatalogueDocument =
            serde_json::from_str(text).context("failed to parse flow catalogue")?;
        let flows = match document {
            CatalogueDocument::Wrapped { flows } | CatalogueDocument::Bare(flows) => flows,
        };
        Ok(Self::new(flows))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalogue {}", path.display()))?;
        let catalogue = Self::from_json_str(&text)
            .with_context(|| format!("invalid catalogue {}", path.display()))?;
        tracing::info!(path = %path.display(), flows = catalogue.len(), "catalogue loaded");
        Ok(catalogue)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CatalogueFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// Token overlap between the query (plus synonym hints) and each flow's
    /// name and synonyms, as a share of the query tokens.
    pub fn rank(&self, query: &FlowQuery) -> Vec<FlowCandidate> {
        let wanted: BTreeSet<String> = std::iter::once(query.text.as_str())
            .chain(query.hints.synonyms.iter().map(String::as_str))
            .flat_map(normalize_tokens)
            .collect();
        if wanted.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(f64, &CatalogueFlow)> = self
            .flows
            .iter()
            .filter(|f| match (query.flow_type, f.flow_type) {
                (Some(want), Some(have)) => want == have,
                _ => true,
            })
            .filter_map(|flow| {
                let overlap = flow.tokens().intersection(&wanted).count();
                (overlap > 0).then(|| (overlap as f64 / wanted.len() as f64, flow))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.name.cmp(&b.1.name)));

        let limit = query.limit.clamp(1, MAX_RESULTS);
        scored
            .into_iter()
            .take(limit)
            .map(|(score, flow)| flow.candidate(score))
            .collect()
    }
}

#[async_trait]
impl FlowSearch for LocalCatalogue {
    async fn search_flows(&self, query: &FlowQuery) -> Result<Vec<FlowCandidate>, CollaboratorError> {
        Ok(self.rank(query))
    }
}

#[async_trait]
impl UnitCatalog for LocalCatalogue {
    async fn lookup_reference_unit(&self, flow_id: &str) -> Result<UnitGroupInfo, CollaboratorError> {
        let flow = self.get(flow_id).ok_or_else(|| {
            CollaboratorError::Unavailable(format!("flow {flow_id} is not in the local catalogue"))
        })?;
        Ok(UnitGroupInfo {
            reference_unit: flow.reference_unit.clone(),
            group_name: flow.group_name.clone(),
            units: flow.units.clone(),
        })
    }
}

// ============================================================================
// Density through the text generator
// ============================================================================

const DENSITY_INSTRUCTIONS: &str = "Estimate the bulk density of the material described in the \
context. Reply with JSON: {\"value\": number, \"unit\": one of \"kg/m3\", \"g/cm3\", \"kg/L\", \
\"g/L\", \"t/m3\", \"assumption\": short text naming the material grade or condition assumed}.";

#[derive(Clone)]
pub struct ModelDensityEstimator {
    text: Arc<dyn TextGenerator>,
}

impl ModelDensityEstimator {
    pub fn new(text: Arc<dyn TextGenerator>) -> Self {
        Self { text }
    }
}

#[derive(Deserialize)]
struct DensityReply {
    value: f64,
    unit: String,
    #[serde(default)]
    assumption: String,
}

#[async_trait]
impl DensityEstimator for ModelDensityEstimator {
    async fn estimate_density(&self, material: &MaterialContext) -> Result<DensityEstimate, CollaboratorError> {
        let prompt = PromptContext::new(
            PromptTask::EstimateDensity,
            DENSITY_INSTRUCTIONS,
            json!({ "material": material }),
        );
        let reply = self.text.generate_text(&prompt).await?;
        let value = extract_json_object(&reply.text).ok_or_else(|| {
            CollaboratorError::InvalidResponse("density reply contains no JSON object".to_string())
        })?;
        let parsed: DensityReply = serde_json::from_value(value)
            .map_err(|e| CollaboratorError::InvalidResponse(format!("density reply: {e}")))?;

        if density_to_kg_per_m3(parsed.value, &parsed.unit).is_none() {
            return Err(CollaboratorError::InvalidResponse(format!(
                "unusable density {} {}",
                parsed.value, parsed.unit
            )));
        }
        let assumption = if parsed.assumption.trim().is_empty() {
            format!("typical density of {}", material.flow_name)
        } else {
            parsed.assumption.trim().to_string()
        };
        Ok(DensityEstimate {
            value: parsed.value,
            unit: parsed.unit,
            assumption,
        })
    }
}

// ============================================================================
// OpenAI-compatible text generation
// ============================================================================

#[cfg(feature = "openai")]
mod openai {
    use super::*;
    use crate::config::ConfigError;
    use crate::flow::LanguageTaggedText;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub struct LlmConfig {
        pub api_key: String,
        pub model: String,
        pub base_url: Option<String>,
        pub timeout_secs: u64,
    }

    impl LlmConfig {
        /// `OPENAI_API_KEY` is required; `OPENAI_MODEL` and
        /// `OPENAI_BASE_URL` are optional.
        pub fn from_env() -> Result<Self, ConfigError> {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| ConfigError::Invalid("OPENAI_API_KEY is not set".to_string()))?;
            Ok(Self {
                api_key,
                model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                base_url: std::env::var("OPENAI_BASE_URL").ok(),
                timeout_secs: 60,
            })
        }
    }

    pub struct OpenAiTextGenerator {
        client: reqwest::Client,
        config: LlmConfig,
    }

    impl OpenAiTextGenerator {
        pub fn new(config: LlmConfig) -> Result<Self, CollaboratorError> {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .map_err(|e| CollaboratorError::Unavailable(format!("http client: {e}")))?;
            Ok(Self { client, config })
        }
    }

    #[async_trait]
    impl TextGenerator for OpenAiTextGenerator {
        async fn generate_text(&self, prompt: &PromptContext) -> Result<LanguageTaggedText, CollaboratorError> {
            let url = format!(
                "{}/chat/completions",
                self.config
                    .base_url
                    .as_deref()
                    .unwrap_or("https://api.openai.com/v1")
                    .trim_end_matches('/')
            );
            let body = json!({
                "model": self.config.model,
                "messages": [
                    { "role": "system", "content": prompt.instructions },
                    { "role": "user", "content": prompt.render() },
                ],
                "temperature": 0.0,
            });

            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| CollaboratorError::Transport(e.to_string()))?;

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(CollaboratorError::Transport(format!("chat completions returned {status}")));
            }
            if !status.is_success() {
                let detail = response.text().await.unwrap_or_default();
                return Err(CollaboratorError::Unavailable(format!("chat completions returned {status}: {detail}")));
            }

            let data: serde_json::Value = response
                .json()
                .await
                .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
            let content = data["choices"][0]["message"]["content"]
                .as_str()
                .ok_or_else(|| CollaboratorError::InvalidResponse("reply has no message content".to_string()))?;
            Ok(LanguageTaggedText::new(prompt.lang.clone(), content))
        }
    }
}
