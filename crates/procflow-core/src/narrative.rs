//! Completeness Narrative Generator
//!
//! Per-process audit summary. The text generator writes it when available;
//! otherwise, or when its reply fails the shape check, a deterministic
//! template renders the same counts.

use crate::collaborators::{PromptContext, PromptTask, TextGenerator};
use crate::flow::LanguageTaggedText;
use crate::model::{
    BalanceReviewResult, BalanceStatus, Basis, ExchangeLineItem, PlaceholderReport,
    ProcessNarrative, SourceType, UnitCheckResult, UnitProcess, UnitStatus,
};
use crate::retry::{call_with_retry, CallPolicy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceLine {
    pub basis: Basis,
    pub status: BalanceStatus,
    pub imbalance_ratio: f64,
}

/// Everything the narrative reports on, in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeCounts {
    pub exchanges: usize,
    pub unresolved_placeholders: usize,
    pub placeholder_amounts: usize,
    pub expert_judgement_values: usize,
    pub conversions: usize,
    pub density_conversions: usize,
    pub mismatches: usize,
    pub reviews: usize,
    pub balance: Vec<BalanceLine>,
}

impl NarrativeCounts {
    pub fn collect(
        exchanges: &[&ExchangeLineItem],
        placeholder_reports: &[&PlaceholderReport],
        unit_checks: &[&UnitCheckResult],
        balance_results: &[&BalanceReviewResult],
    ) -> Self {
        let status_count = |status: UnitStatus| unit_checks.iter().filter(|c| c.status == status).count();
        Self {
            exchanges: exchanges.len(),
            unresolved_placeholders: placeholder_reports.len(),
            placeholder_amounts: exchanges.iter().filter(|e| e.amount.is_placeholder()).count(),
            expert_judgement_values: exchanges
                .iter()
                .filter(|e| e.source_type == SourceType::ExpertJudgement)
                .count(),
            conversions: status_count(UnitStatus::Converted),
            density_conversions: status_count(UnitStatus::ConvertedByDensity),
            mismatches: status_count(UnitStatus::Mismatch),
            reviews: status_count(UnitStatus::Review),
            balance: balance_results
                .iter()
                .map(|b| BalanceLine {
                    basis: b.basis,
                    status: b.status,
                    imbalance_ratio: b.imbalance_ratio,
                })
                .collect(),
        }
    }
}

fn status_word(status: BalanceStatus) -> &'static str {
    match status {
        BalanceStatus::Ok => "ok",
        BalanceStatus::Check => "check",
        BalanceStatus::Insufficient => "insufficient data",
    }
}

/// Deterministic rendering of the counts.
pub fn template(process: &UnitProcess, counts: &NarrativeCounts) -> LanguageTaggedText {
    let name = if process.name.base.is_empty() {
        process.process_id.as_str()
    } else {
        process.name.base.as_str()
    };
    let balance = if counts.balance.is_empty() {
        "not reviewed".to_string()
    } else {
        counts
            .balance
            .iter()
            .map(|b| format!("{} {} (ratio {:.3})", b.basis, status_word(b.status), b.imbalance_ratio))
            .collect::<Vec<_>>()
            .join("; ")
    };
    LanguageTaggedText::en(format!(
        "{name} ({id}): {exchanges} exchange(s). Flow matching: {unresolved} unresolved placeholder(s). \
Units: {conversions} converted, {density} converted by density, {mismatches} mismatch(es), \
{reviews} pending review. Amounts: {amounts} placeholder amount(s), {expert} expert-judgement value(s). \
Balance: {balance}.",
        id = process.process_id,
        exchanges = counts.exchanges,
        unresolved = counts.unresolved_placeholders,
        conversions = counts.conversions,
        density = counts.density_conversions,
        mismatches = counts.mismatches,
        reviews = counts.reviews,
        amounts = counts.placeholder_amounts,
        expert = counts.expert_judgement_values,
    ))
}

#[derive(Clone)]
pub struct NarrativeGenerator {
    text: Option<Arc<dyn TextGenerator>>,
    policy: CallPolicy,
}

impl NarrativeGenerator {
    pub fn new(text: Option<Arc<dyn TextGenerator>>, policy: CallPolicy) -> Self {
        Self { text, policy }
    }

    pub async fn summarize(&self, process: &UnitProcess, counts: &NarrativeCounts) -> ProcessNarrative {
        if let Some(text) = &self.text {
            let prompt = PromptContext::new(
                PromptTask::Narrative,
                "Write a short completeness summary of this unit process for data reviewers. \
Mention every non-zero count and the balance status. Plain text, no JSON.",
                json!({
                    "process_id": process.process_id,
                    "process_name": process.name.base,
                    "counts": counts,
                }),
            );
            match call_with_retry(&self.policy, "narrative", || text.generate_text(&prompt)).await {
                Ok(reply) if reply.is_well_formed() => {
                    return ProcessNarrative {
                        process_id: process.process_id.clone(),
                        text: LanguageTaggedText::new(reply.lang.trim(), reply.text.trim()),
                        origin: "model".to_string(),
                    };
                }
                Ok(_) => {
                    tracing::warn!(process = %process.process_id, "narrative reply failed shape check, using template");
                }
                Err(err) => {
                    tracing::warn!(process = %process.process_id, error = %err, "narrative generation failed, using template");
                }
            }
        }

        ProcessNarrative {
            process_id: process.process_id.clone(),
            text: template(process, counts),
            origin: "template".to_string(),
        }
    }
}
