//! Candidate selection
//!
//! One interface, two strategies picked at construction:
//!
//! - [`ModelSelector`] asks the text generator for `{best_index, confidence,
//!   reason}`. A `null` index is an explicit rejection. Anything else that
//!   goes wrong falls back to similarity.
//! - [`SimilaritySelector`] scores normalized names and rejects below a
//!   floor.

use crate::collaborators::{PromptContext, PromptTask, TextGenerator};
use crate::generation::extract_json_object;
use crate::model::{Direction, FlowCandidate, FlowType};
use crate::retry::{call_with_retry, CallPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// What the selector knows about the exchange being matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionContext {
    pub exchange_name: String,
    pub direction: Direction,
    pub flow_type: FlowType,
    pub unit: Option<String>,
    pub process_name: Option<String>,
    pub technology: Option<String>,
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    /// Index into the candidate slice; `None` means rejected.
    pub index: Option<usize>,
    pub confidence: Option<f64>,
    pub rationale: String,
    pub strategy: String,
}

impl SelectionResult {
    pub fn is_rejected(&self) -> bool {
        self.index.is_none()
    }

    fn rejected(strategy: &str, rationale: impl Into<String>) -> Self {
        Self {
            index: None,
            confidence: None,
            rationale: rationale.into(),
            strategy: strategy.to_string(),
        }
    }
}

// ============================================================================
// CandidateSelector
// ============================================================================

#[derive(Clone)]
pub enum CandidateSelector {
    Model(ModelSelector),
    Similarity(SimilaritySelector),
}

impl CandidateSelector {
    pub async fn select_candidate(
        &self,
        context: &SelectionContext,
        candidates: &[FlowCandidate],
    ) -> SelectionResult {
        match self {
            CandidateSelector::Model(selector) => selector.select(context, candidates).await,
            CandidateSelector::Similarity(selector) => selector.select(context, candidates),
        }
    }

    pub fn strategy(&self) -> &'static str {
        match self {
            CandidateSelector::Model(_) => "model",
            CandidateSelector::Similarity(_) => "similarity",
        }
    }
}

impl std::fmt::Debug for CandidateSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CandidateSelector::{}", self.strategy())
    }
}

// ============================================================================
// Similarity
// ============================================================================

#[derive(Debug, Clone)]
pub struct SimilaritySelector {
    floor: f64,
}

impl SimilaritySelector {
    pub fn new(floor: f64) -> Self {
        Self { floor }
    }

    pub fn select(&self, context: &SelectionContext, candidates: &[FlowCandidate]) -> SelectionResult {
        let best = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (i, similarity(&context.exchange_name, &c.name)))
            .fold(None::<(usize, f64)>, |best, (i, score)| match best {
                Some((_, best_score)) if best_score >= score => best,
                _ => Some((i, score)),
            });

        match best {
            None => SelectionResult::rejected("similarity", "no candidates to score"),
            Some((_, score)) if score < self.floor => SelectionResult {
                confidence: Some(score),
                ..SelectionResult::rejected(
                    "similarity",
                    format!("best similarity {score:.3} is below floor {:.3}", self.floor),
                )
            },
            Some((index, score)) => SelectionResult {
                index: Some(index),
                confidence: Some(score),
                rationale: format!("name similarity {score:.3}"),
                strategy: "similarity".to_string(),
            },
        }
    }
}

/// Lowercase alphanumeric tokens.
pub(crate) fn normalize_tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Max of edit-distance ratio and token Dice overlap, in `[0, 1]`.
pub fn similarity(left: &str, right: &str) -> f64 {
    let left_tokens = normalize_tokens(left);
    let right_tokens = normalize_tokens(right);
    if left_tokens.is_empty() || right_tokens.is_empty() {
        return 0.0;
    }

    let a = left_tokens.join(" ");
    let b = right_tokens.join(" ");
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let longest = a_chars.len().max(b_chars.len());
    let edit_ratio = 1.0 - levenshtein(&a_chars, &b_chars) as f64 / longest as f64;

    let a_set: BTreeSet<&str> = left_tokens.iter().map(String::as_str).collect();
    let b_set: BTreeSet<&str> = right_tokens.iter().map(String::as_str).collect();
    let shared = a_set.intersection(&b_set).count();
    let dice = 2.0 * shared as f64 / (a_set.len() + b_set.len()) as f64;

    edit_ratio.max(dice)
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    // Two DP rows over `b`.
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr: Vec<usize> = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for j in 1..=b.len() {
            let cost = usize::from(*ca != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ============================================================================
// Model-backed
// ============================================================================

const SELECT_INSTRUCTIONS: &str = "Match the inventory exchange to the best catalogue flow. \
Prefer candidates whose name, classification and unit align with the exchange. \
Reply with strict JSON: {\"best_index\": <0-based index or null>, \
\"confidence\": <0..1>, \"reason\": \"<short justification>\"}. \
Use null when no candidate is appropriate.";

#[derive(Clone)]
pub struct ModelSelector {
    text: Arc<dyn TextGenerator>,
    policy: CallPolicy,
    fallback: SimilaritySelector,
}

impl ModelSelector {
    pub fn new(text: Arc<dyn TextGenerator>, policy: CallPolicy, fallback: SimilaritySelector) -> Self {
        Self {
            text,
            policy,
            fallback,
        }
    }

    pub async fn select(&self, context: &SelectionContext, candidates: &[FlowCandidate]) -> SelectionResult {
        if candidates.is_empty() {
            return SelectionResult::rejected("model", "no candidates to choose from");
        }

        let prompt = PromptContext::new(
            PromptTask::SelectCandidate,
            SELECT_INSTRUCTIONS,
            json!({
                "exchange": context,
                "candidates": candidates
                    .iter()
                    .enumerate()
                    .map(|(index, c)| json!({
                        "index": index,
                        "name": c.name,
                        "unit": c.unit,
                        "classification": c.classification,
                        "flow_type": c.flow_type,
                    }))
                    .collect::<Vec<_>>(),
            }),
        );

        let reply = call_with_retry(&self.policy, "select_candidate", || {
            self.text.generate_text(&prompt)
        })
        .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(exchange = %context.exchange_name, error = %err, "model selection failed, using similarity");
                return self.fallback.select(context, candidates);
            }
        };

        let Some(parsed) = extract_json_object(&reply.text) else {
            tracing::warn!(exchange = %context.exchange_name, "model selection reply is not JSON, using similarity");
            return self.fallback.select(context, candidates);
        };

        let confidence = parsed.get("confidence").and_then(Value::as_f64);
        let reason = parsed
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match parsed.get("best_index") {
            None | Some(Value::Null) => SelectionResult {
                confidence,
                ..SelectionResult::rejected(
                    "model",
                    if reason.is_empty() {
                        "selector found no appropriate candidate".to_string()
                    } else {
                        reason
                    },
                )
            },
            Some(index) => match index.as_u64().map(|i| i as usize) {
                Some(i) if i < candidates.len() => SelectionResult {
                    index: Some(i),
                    confidence,
                    rationale: reason,
                    strategy: "model".to_string(),
                },
                _ => {
                    tracing::warn!(
                        exchange = %context.exchange_name,
                        index = %index,
                        candidates = candidates.len(),
                        "model selected an invalid index, using similarity"
                    );
                    self.fallback.select(context, candidates)
                }
            },
        }
    }
}
