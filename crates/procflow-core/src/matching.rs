//! Flow-Matching Engine
//!
//! Two passes over the exchanges of a plan:
//!
//! - **primary** ([`FlowMatcher::match_exchange`]): query = exchange name plus
//!   search hints, search, select. Nothing found or selection rejected
//!   leaves a placeholder.
//! - **secondary** ([`FlowMatcher::resolve`]): for placeholders only, after
//!   dataset assembly. Broadens the query with process context, filters by
//!   flow type and emission medium, selects again. Failure is terminal
//!   (`unresolved`).
//!
//! A catalogue identifier only ever comes from a candidate returned by
//! search; the matcher never builds one.

use crate::collaborators::{Collaborators, FlowQuery, FlowSearch};
use crate::config::{EngineConfig, MatchingConfig, SelectorKind};
use crate::error::Degradation;
use crate::model::{
    ExchangeLineItem, FlowCandidate, FlowType, MatchPass, MatchResult, MatchStatus, UnitProcess,
};
use crate::retry::{call_with_retry, CallPolicy};
use crate::selector::{CandidateSelector, ModelSelector, SelectionContext, SimilaritySelector};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tokio::sync::Semaphore;

// ============================================================================
// Emission medium
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Medium {
    Air,
    Water,
    Soil,
}

fn medium_patterns() -> &'static [(Medium, Regex)] {
    static PATTERNS: OnceLock<Vec<(Medium, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (Medium::Air, r"(?i)\b(air|atmosphere|atmospheric|stack)\b"),
            (
                Medium::Water,
                r"(?i)\b(ground\s*water|water|waters|river|lake|sea|ocean|freshwater|surface water)\b",
            ),
            // bare "ground" is left out so "ground water" stays water
            (Medium::Soil, r"(?i)\b(soil|land|agricultural)\b"),
        ]
        .into_iter()
        .filter_map(|(medium, pattern)| Regex::new(pattern).ok().map(|re| (medium, re)))
        .collect()
    })
}

impl Medium {
    /// Medium named earliest in `text`, if any.
    pub fn infer(text: &str) -> Option<Medium> {
        medium_patterns()
            .iter()
            .filter_map(|(medium, re)| re.find(text).map(|m| (m.start(), *medium)))
            .min_by_key(|(start, _)| *start)
            .map(|(_, medium)| medium)
    }
}

// ============================================================================
// FlowMatcher
// ============================================================================

#[derive(Clone)]
pub struct FlowMatcher {
    search: Option<Arc<dyn FlowSearch>>,
    selector: CandidateSelector,
    config: MatchingConfig,
    policy: CallPolicy,
}

impl FlowMatcher {
    pub fn new(
        search: Option<Arc<dyn FlowSearch>>,
        selector: CandidateSelector,
        config: MatchingConfig,
        policy: CallPolicy,
    ) -> Self {
        Self {
            search,
            selector,
            config,
            policy,
        }
    }

    /// Model selection when configured and a text generator exists,
    /// similarity otherwise.
    pub fn from_collaborators(collaborators: &Collaborators, config: &EngineConfig) -> Self {
        let similarity = SimilaritySelector::new(config.matching.similarity_floor);
        let selector = match (&config.matching.selector, &collaborators.text) {
            (SelectorKind::Model, Some(text)) => CandidateSelector::Model(ModelSelector::new(
                Arc::clone(text),
                config.calls.clone(),
                similarity,
            )),
            _ => CandidateSelector::Similarity(similarity),
        };
        Self::new(
            collaborators.search.clone(),
            selector,
            config.matching.clone(),
            config.calls.clone(),
        )
    }

    pub fn selector(&self) -> &CandidateSelector {
        &self.selector
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Exchange name enriched with synonyms, formula/identifier and usage.
    pub fn primary_query(exchange: &ExchangeLineItem) -> String {
        let mut query = exchange.name.trim().to_string();
        let hints = &exchange.hints;
        if !hints.synonyms.is_empty() {
            query.push_str("; synonyms: ");
            query.push_str(&hints.synonyms.join(", "));
        }
        let formula: Vec<&str> = [hints.formula.as_deref(), hints.identifier.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        if !formula.is_empty() {
            query.push_str("; formula: ");
            query.push_str(&formula.join(", "));
        }
        if let Some(usage) = hints.usage_context.as_deref() {
            query.push_str("; usage: ");
            query.push_str(usage);
        }
        query
    }

    /// Broadened secondary-pass queries, most specific first, bare name last.
    pub fn broadened_queries(exchange: &ExchangeLineItem, process: Option<&UnitProcess>) -> Vec<String> {
        let name = exchange.name.trim();
        let technology_clause = process.and_then(|p| {
            p.technology
                .split(|c| matches!(c, ',' | ';' | '.' | '\n'))
                .next()
                .map(str::trim)
        });
        let qualifiers = [
            exchange.hints.usage_context.as_deref().map(str::trim),
            process.map(|p| p.boundary.trim()),
            technology_clause,
        ];

        let mut queries: Vec<String> = Vec::new();
        for qualifier in qualifiers.into_iter().flatten() {
            if qualifier.is_empty() {
                continue;
            }
            let query = format!("{name}, {qualifier}");
            if !queries.contains(&query) {
                queries.push(query);
            }
        }
        queries.push(name.to_string());
        queries
    }

    /// Keep candidates of the exchange's flow type and, for elementary
    /// flows, of a compatible emission medium.
    pub fn filter_candidates(exchange: &ExchangeLineItem, candidates: Vec<FlowCandidate>) -> Vec<FlowCandidate> {
        let medium = (exchange.flow_type == FlowType::Elementary)
            .then(|| Medium::infer(&exchange.name))
            .flatten();
        candidates
            .into_iter()
            .filter(|c| c.flow_type.map_or(true, |t| t == exchange.flow_type))
            .filter(|c| match medium {
                None => true,
                Some(wanted) => {
                    let text = format!("{} {}", c.name, c.classification.join(" "));
                    Medium::infer(&text).map_or(true, |found| found == wanted)
                }
            })
            .collect()
    }

    fn selection_context(exchange: &ExchangeLineItem, process: Option<&UnitProcess>, query: &str) -> SelectionContext {
        SelectionContext {
            exchange_name: exchange.name.clone(),
            direction: exchange.direction,
            flow_type: exchange.flow_type,
            unit: exchange.unit.clone(),
            process_name: process.map(|p| p.name.base.clone()),
            technology: process
                .map(|p| p.technology.clone())
                .filter(|t| !t.is_empty()),
            query: query.to_string(),
        }
    }

    /// Search with retry; any failure is an empty result.
    async fn search(&self, text: &str, exchange: &ExchangeLineItem) -> Vec<FlowCandidate> {
        let Some(search) = &self.search else {
            tracing::warn!(exchange = %exchange.exchange_id, "no flow search configured");
            return Vec::new();
        };
        let query = FlowQuery {
            text: text.to_string(),
            hints: exchange.hints.clone(),
            flow_type: Some(exchange.flow_type),
            limit: self.config.max_candidates,
        };
        match call_with_retry(&self.policy, "search_flows", || search.search_flows(&query)).await {
            Ok(mut candidates) => {
                candidates.truncate(self.config.max_candidates);
                candidates
            }
            Err(err) => {
                tracing::warn!(exchange = %exchange.exchange_id, query = %text, error = %err, "flow search failed, treating as no candidates");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------------
    // Primary pass
    // ------------------------------------------------------------------------

    pub async fn match_exchange(&self, exchange: &ExchangeLineItem, process: Option<&UnitProcess>) -> MatchResult {
        let enriched = Self::primary_query(exchange);
        let mut query = enriched.clone();
        let mut candidates = self.search(&enriched, exchange).await;
        if candidates.is_empty() && enriched != exchange.name.trim() {
            query = exchange.name.trim().to_string();
            candidates = self.search(&query, exchange).await;
        }

        if candidates.is_empty() {
            tracing::warn!(exchange = %exchange.exchange_id, name = %exchange.name, "no candidates, placeholder kept");
            return MatchResult::degraded(
                &exchange.exchange_id,
                MatchStatus::Placeholder,
                MatchPass::Primary,
                Degradation::NoCandidatesFound,
                query,
                candidates,
            );
        }

        let context = Self::selection_context(exchange, process, &query);
        self.finish(exchange, context, query, candidates, MatchPass::Primary, MatchStatus::Placeholder)
            .await
    }

    /// Primary pass over many exchanges with bounded parallel search.
    /// Results come back in input order.
    pub async fn match_all(&self, items: Vec<(ExchangeLineItem, Option<UnitProcess>)>) -> Vec<MatchResult> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel_searches.max(1)));
        let mut handles = Vec::with_capacity(items.len());

        for (exchange, process) in items {
            let matcher = self.clone();
            let permits = Arc::clone(&permits);
            let exchange_id = exchange.exchange_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                matcher.match_exchange(&exchange, process.as_ref()).await
            });
            handles.push((exchange_id, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (exchange_id, handle) in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(err) => {
                    tracing::warn!(exchange = %exchange_id, error = %err, "matching task failed");
                    results.push(MatchResult::degraded(
                        &exchange_id,
                        MatchStatus::Placeholder,
                        MatchPass::Primary,
                        Degradation::CollaboratorUnavailable,
                        String::new(),
                        Vec::new(),
                    ));
                }
            }
        }
        results
    }

    // ------------------------------------------------------------------------
    // Secondary pass
    // ------------------------------------------------------------------------

    pub async fn resolve(&self, exchange: &ExchangeLineItem, process: Option<&UnitProcess>) -> MatchResult {
        let queries = Self::broadened_queries(exchange, process);
        let mut last_query = String::new();
        let mut found: Vec<FlowCandidate> = Vec::new();

        for query in queries {
            let candidates = Self::filter_candidates(exchange, self.search(&query, exchange).await);
            last_query = query;
            if !candidates.is_empty() {
                found = candidates;
                break;
            }
        }

        if found.is_empty() {
            tracing::warn!(exchange = %exchange.exchange_id, query = %last_query, "secondary pass found nothing, unresolved");
            return MatchResult::degraded(
                &exchange.exchange_id,
                MatchStatus::Unresolved,
                MatchPass::Secondary,
                Degradation::NoCandidatesFound,
                last_query,
                found,
            );
        }

        let context = Self::selection_context(exchange, process, &last_query);
        self.finish(exchange, context, last_query, found, MatchPass::Secondary, MatchStatus::Unresolved)
            .await
    }

    async fn finish(
        &self,
        exchange: &ExchangeLineItem,
        context: SelectionContext,
        query: String,
        candidates: Vec<FlowCandidate>,
        pass: MatchPass,
        on_reject: MatchStatus,
    ) -> MatchResult {
        let selection = self.selector.select_candidate(&context, &candidates).await;
        let Some(selected) = selection.index.and_then(|i| candidates.get(i)).cloned() else {
            tracing::warn!(
                exchange = %exchange.exchange_id,
                strategy = %selection.strategy,
                reason = %selection.rationale,
                "selection rejected"
            );
            let mut result = MatchResult::degraded(
                &exchange.exchange_id,
                on_reject,
                pass,
                Degradation::SelectionRejected,
                query,
                candidates,
            );
            result.rationale = Some(selection.rationale);
            result.strategy = Some(selection.strategy);
            return result;
        };

        tracing::debug!(
            exchange = %exchange.exchange_id,
            flow = %selected.id,
            pass = ?pass,
            strategy = %selection.strategy,
            "exchange matched"
        );
        MatchResult {
            exchange_id: exchange.exchange_id.clone(),
            status: MatchStatus::Matched,
            pass,
            selected: Some(selected),
            rationale: Some(selection.rationale),
            reason: None,
            query,
            candidates,
            strategy: Some(selection.strategy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollaboratorError;
    use crate::model::{Direction, SearchHints};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Answers by exact query text; records every query.
    #[derive(Default)]
    struct ByQuery {
        answers: HashMap<String, Vec<FlowCandidate>>,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl FlowSearch for ByQuery {
        async fn search_flows(&self, query: &FlowQuery) -> Result<Vec<FlowCandidate>, CollaboratorError> {
            self.seen.lock().unwrap().push(query.text.clone());
            if self.fail {
                return Err(CollaboratorError::Transport("connection reset".into()));
            }
            Ok(self.answers.get(&query.text).cloned().unwrap_or_default())
        }
    }

    fn candidate(id: &str, name: &str, flow_type: FlowType) -> FlowCandidate {
        FlowCandidate {
            id: id.to_string(),
            name: name.to_string(),
            version: Some("01.00.000".into()),
            unit: Some("MJ".into()),
            classification: vec![],
            flow_type: Some(flow_type),
            score: None,
            rationale: None,
        }
    }

    fn matcher(search: ByQuery) -> (FlowMatcher, Arc<ByQuery>) {
        let search = Arc::new(search);
        let matcher = FlowMatcher::new(
            Some(search.clone()),
            CandidateSelector::Similarity(SimilaritySelector::new(0.35)),
            MatchingConfig::default(),
            CallPolicy::immediate(1_000),
        );
        (matcher, search)
    }

    fn electricity() -> ExchangeLineItem {
        let mut ex = ExchangeLineItem::new("P1", "P1-E2", Direction::Input, "Electricity, medium voltage");
        ex.hints.usage_context = Some("grid".into());
        ex
    }

    #[test]
    fn medium_inference_uses_word_boundaries() {
        assert_eq!(Medium::infer("Carbon dioxide, to air"), Some(Medium::Air));
        assert_eq!(Medium::infer("Ammonia, to water"), Some(Medium::Water));
        assert_eq!(Medium::infer("Cadmium, to soil"), Some(Medium::Soil));
        assert_eq!(Medium::infer("Repair work"), None);
        assert_eq!(Medium::infer("Chair"), None);
    }

    #[test]
    fn primary_query_appends_hints() {
        let mut ex = ExchangeLineItem::new("P1", "P1-E1", Direction::Input, "Sodium hydroxide");
        ex.hints = SearchHints {
            synonyms: vec!["caustic soda".into(), "lye".into()],
            formula: Some("NaOH".into()),
            identifier: Some("1310-73-2".into()),
            usage_context: Some("neutralization".into()),
        };
        assert_eq!(
            FlowMatcher::primary_query(&ex),
            "Sodium hydroxide; synonyms: caustic soda, lye; formula: NaOH, 1310-73-2; usage: neutralization"
        );
    }

    #[test]
    fn broadened_queries_follow_qualifier_order() {
        let process = UnitProcess {
            boundary: "gate to gate".into(),
            technology: "Electric arc furnace, scrap based".into(),
            ..UnitProcess::default()
        };
        let queries = FlowMatcher::broadened_queries(&electricity(), Some(&process));
        assert_eq!(
            queries,
            vec![
                "Electricity, medium voltage, grid",
                "Electricity, medium voltage, gate to gate",
                "Electricity, medium voltage, Electric arc furnace",
                "Electricity, medium voltage",
            ]
        );
    }

    #[test]
    fn filter_drops_wrong_type_and_medium() {
        let ex = ExchangeLineItem::new("P1", "P1-E3", Direction::Output, "Nitrogen oxides, to air")
            .with_flow_type(FlowType::Elementary);
        let kept = FlowMatcher::filter_candidates(
            &ex,
            vec![
                candidate("a", "Nitrogen oxides, to air", FlowType::Elementary),
                candidate("b", "Nitrogen oxides, to water", FlowType::Elementary),
                candidate("c", "Nitrogen oxides", FlowType::Product),
                candidate("d", "Nitrogen oxides", FlowType::Elementary),
            ],
        );
        let ids: Vec<&str> = kept.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
    }

    #[test]
    fn ground_water_is_water() {
        assert_eq!(Medium::infer("Nitrate, to ground water"), Some(Medium::Water));
        assert_eq!(Medium::infer("Ammonium, emission to ground water"), Some(Medium::Water));
        assert_eq!(Medium::infer("Phosphate, groundwater"), Some(Medium::Water));
        assert_eq!(Medium::infer("Zinc, to agricultural soil"), Some(Medium::Soil));
    }

    #[test]
    fn ground_water_exchange_keeps_water_compartment() {
        let ex = ExchangeLineItem::new("P1", "P1-E4", Direction::Output, "Nitrate, to ground water")
            .with_flow_type(FlowType::Elementary);
        let mut water = candidate("w", "Nitrate", FlowType::Elementary);
        water.classification = vec!["Emissions to water".into(), "Emissions to ground water".into()];
        let mut soil = candidate("s", "Nitrate", FlowType::Elementary);
        soil.classification = vec!["Emissions to soil".into()];
        let kept = FlowMatcher::filter_candidates(&ex, vec![water, soil]);
        let ids: Vec<&str> = kept.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["w"]);
    }

    #[tokio::test]
    async fn primary_retries_with_name_only() {
        let mut search = ByQuery::default();
        search.answers.insert(
            "Electricity, medium voltage".into(),
            vec![candidate("e1", "Electricity, medium voltage", FlowType::Product)],
        );
        let (matcher, search) = matcher(search);
        let result = matcher.match_exchange(&electricity(), None).await;
        assert_eq!(result.status, MatchStatus::Matched);
        assert_eq!(result.query, "Electricity, medium voltage");
        assert_eq!(search.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn scenario_b_placeholder_then_secondary_match() {
        let mut search = ByQuery::default();
        search.answers.insert(
            "Electricity, medium voltage, grid".into(),
            vec![candidate("grid-mv", "Electricity, medium voltage, grid mix", FlowType::Product)],
        );
        let (matcher, _) = matcher(search);
        let ex = electricity();

        let primary = matcher.match_exchange(&ex, None).await;
        assert_eq!(primary.status, MatchStatus::Placeholder);
        assert_eq!(primary.reason, Some(Degradation::NoCandidatesFound));
        assert!(primary.selected.is_none());

        let secondary = matcher.resolve(&ex, None).await;
        assert_eq!(secondary.status, MatchStatus::Matched);
        assert_eq!(secondary.pass, MatchPass::Secondary);
        assert_eq!(secondary.candidate_id(), Some("grid-mv"));
        assert_eq!(secondary.query, "Electricity, medium voltage, grid");
    }

    #[tokio::test]
    async fn search_failure_is_empty_candidates() {
        let (matcher, _) = matcher(ByQuery {
            fail: true,
            ..ByQuery::default()
        });
        let result = matcher.match_exchange(&electricity(), None).await;
        assert_eq!(result.status, MatchStatus::Placeholder);
        assert_eq!(result.reason, Some(Degradation::NoCandidatesFound));

        let result = matcher.resolve(&electricity(), None).await;
        assert_eq!(result.status, MatchStatus::Unresolved);
        assert_eq!(result.query, "Electricity, medium voltage");
    }

    #[tokio::test]
    async fn rejected_selection_is_placeholder() {
        let mut search = ByQuery::default();
        search.answers.insert(
            "Electricity, medium voltage".into(),
            vec![candidate("x", "Crude oil", FlowType::Product)],
        );
        let (matcher, _) = matcher(search);
        let result = matcher.match_exchange(&electricity(), None).await;
        assert_eq!(result.status, MatchStatus::Placeholder);
        assert_eq!(result.reason, Some(Degradation::SelectionRejected));
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.strategy.as_deref(), Some("similarity"));
    }

    #[tokio::test]
    async fn match_all_keeps_input_order() {
        let mut search = ByQuery::default();
        for name in ["Water", "Steam", "Sand"] {
            search
                .answers
                .insert(name.into(), vec![candidate(&name.to_lowercase(), name, FlowType::Product)]);
        }
        let (matcher, _) = matcher(search);
        let items = ["Water", "Steam", "Unknown thing", "Sand"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                (
                    ExchangeLineItem::new("P1", &format!("P1-E{}", i + 1), Direction::Input, name),
                    None,
                )
            })
            .collect();
        let results = matcher.match_all(items).await;
        let ids: Vec<&str> = results.iter().map(|r| r.exchange_id.as_str()).collect();
        assert_eq!(ids, vec!["P1-E1", "P1-E2", "P1-E3", "P1-E4"]);
        assert_eq!(results[2].status, MatchStatus::Placeholder);
        assert_eq!(results[3].candidate_id(), Some("sand"));
    }
}
