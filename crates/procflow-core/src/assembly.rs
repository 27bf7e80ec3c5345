//! Dataset assembly
//!
//! Checks the chain invariant of the selected route, makes sure the terminal
//! process carries a reference exchange, and builds one output document per
//! process. A broken chain is fatal and leaves the state untouched.

use crate::error::DerivationError;
use crate::flow::LanguageTaggedText;
use crate::model::*;
use crate::selector::normalize_tokens;
use crate::state::{DerivationState, Stage};
use serde::{Deserialize, Serialize};

pub const DATASET_VERSION: &str = "01.01.000";

// ============================================================================
// Output documents
// ============================================================================

/// Either a real catalogue flow or an explicit placeholder without an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlowReference {
    Catalogue {
        id: String,
        version: String,
        name: String,
    },
    Placeholder {
        name: String,
        placeholder: bool,
    },
}

impl FlowReference {
    pub fn placeholder(name: &str) -> Self {
        FlowReference::Placeholder {
            name: name.to_string(),
            placeholder: true,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, FlowReference::Placeholder { .. })
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            FlowReference::Catalogue { id, .. } => Some(id),
            FlowReference::Placeholder { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetExchange {
    pub exchange_id: String,
    pub direction: Direction,
    pub name: String,
    pub flow: FlowReference,
    pub unit: Option<String>,
    pub amount: Amount,
    /// Extracted values, kept next to converted ones.
    pub original_unit: Option<String>,
    pub original_amount: Option<Amount>,
    pub source_type: SourceType,
    pub is_reference_flow: bool,
    pub comment: Option<String>,
    pub unit_status: Option<UnitStatus>,
    pub density_used: Option<DensityUsed>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDataset {
    pub dataset_id: String,
    pub version: String,
    pub process_id: String,
    pub route_id: String,
    pub name: ProcessNameParts,
    pub functional_unit: String,
    pub classification: Vec<String>,
    pub technology: String,
    pub boundary: String,
    pub assumptions: Vec<String>,
    pub source_type: SourceType,
    pub evidence_refs: Vec<String>,
    pub exchanges: Vec<DatasetExchange>,
    pub narrative: Option<LanguageTaggedText>,
}

// ============================================================================
// Assembler
// ============================================================================

fn same_flow_name(a: &str, b: &str) -> bool {
    let a = normalize_tokens(a);
    !a.is_empty() && a == normalize_tokens(b)
}

pub struct DatasetAssembler;

impl DatasetAssembler {
    /// process[i] feeds process[i+1]; the terminal process (the flagged
    /// reference-flow process, else the last one) produces or treats the
    /// reference flow.
    pub fn check_chain(state: &DerivationState) -> Result<(), DerivationError> {
        let route_id = state
            .selected_route
            .clone()
            .unwrap_or_else(|| "<none>".to_string());
        let ordered = state.ordered_processes();
        let Some(terminal) = state.terminal_process() else {
            return Err(DerivationError::EmptyRoute(route_id));
        };

        for pair in ordered.windows(2) {
            let (upstream, downstream) = (pair[0], pair[1]);
            if !downstream
                .inputs
                .iter()
                .any(|input| same_flow_name(input, &upstream.reference_flow_name))
            {
                return Err(DerivationError::ScheduleBoundaryViolation {
                    route_id,
                    upstream: upstream.process_id.clone(),
                    downstream: downstream.process_id.clone(),
                    detail: format!(
                        "'{}' produced by {} is not an input of {}",
                        upstream.reference_flow_name, upstream.process_id, downstream.process_id
                    ),
                });
            }
        }

        let flow_name = state.flow.name();
        let listed = match state.operation {
            Operation::Produce => &terminal.outputs,
            Operation::Treat => &terminal.inputs,
        };
        let direct = same_flow_name(&terminal.reference_flow_name, flow_name)
            || listed.iter().any(|name| same_flow_name(name, flow_name));
        if !direct {
            return Err(DerivationError::ScheduleBoundaryViolation {
                route_id,
                upstream: terminal.process_id.clone(),
                downstream: "reference flow".to_string(),
                detail: format!(
                    "terminal process does not {} '{flow_name}'",
                    state.operation
                ),
            });
        }
        Ok(())
    }

    /// Chain check, reference exchange, datasets. Nothing is mutated when
    /// the chain check fails.
    pub fn assemble(state: &mut DerivationState) -> Result<(), DerivationError> {
        Self::check_chain(state)?;
        Self::ensure_reference_exchange(state);

        let datasets: Vec<ProcessDataset> = state
            .ordered_processes()
            .into_iter()
            .map(|process| ProcessDataset {
                dataset_id: uuid::Uuid::new_v4().to_string(),
                version: DATASET_VERSION.to_string(),
                process_id: process.process_id.clone(),
                route_id: process.route_id.clone(),
                name: process.name.clone(),
                functional_unit: functional_unit(state, process),
                classification: state.flow.classification.clone(),
                technology: process.technology.clone(),
                boundary: process.boundary.clone(),
                assumptions: process.assumptions.clone(),
                source_type: process.source_type,
                evidence_refs: process.evidence_refs.clone(),
                exchanges: dataset_exchanges(state, &process.process_id),
                narrative: None,
            })
            .collect();

        tracing::info!(
            route = ?state.selected_route,
            datasets = datasets.len(),
            "datasets assembled"
        );
        state.datasets = datasets;
        Ok(())
    }

    /// Re-derive exchange references and narratives on existing datasets.
    pub fn refresh(state: &mut DerivationState) {
        let exchanges: Vec<Vec<DatasetExchange>> = state
            .datasets
            .iter()
            .map(|d| dataset_exchanges(state, &d.process_id))
            .collect();
        let narratives: Vec<Option<LanguageTaggedText>> = state
            .datasets
            .iter()
            .map(|d| {
                state
                    .narratives
                    .iter()
                    .find(|n| n.process_id == d.process_id)
                    .map(|n| n.text.clone())
            })
            .collect();
        for ((dataset, exchanges), narrative) in state.datasets.iter_mut().zip(exchanges).zip(narratives) {
            dataset.exchanges = exchanges;
            dataset.narrative = narrative;
        }
    }

    fn ensure_reference_exchange(state: &mut DerivationState) {
        let Some(terminal) = state.terminal_process().map(|p| p.process_id.clone()) else {
            return;
        };
        let direction = state.operation.reference_direction();

        if let Some(existing) = state
            .exchanges
            .iter_mut()
            .find(|e| e.process_id == terminal && e.is_reference_flow)
        {
            if existing.direction != direction {
                existing.direction = direction;
                let subject = existing.exchange_id.clone();
                state.record_decision(
                    Stage::AssembleDatasets,
                    &subject,
                    format!("reference exchange direction set to {direction:?} for {}", state.operation),
                );
            }
            return;
        }

        let taken = state.exchanges_for(&terminal).count();
        let mut n = taken + 1;
        while state.exchange(&format!("{terminal}-E{n}")).is_some() {
            n += 1;
        }
        let exchange_id = format!("{terminal}-E{n}");
        let mut reference = ExchangeLineItem::new(&terminal, &exchange_id, direction, state.flow.name());
        reference.is_reference_flow = true;
        reference.is_key = true;
        reference.unit = state.flow.unit.clone();
        reference.source_type = SourceType::ExpertJudgement;
        reference.flow_type = match state.operation {
            Operation::Produce => FlowType::Product,
            Operation::Treat => FlowType::Waste,
        };

        tracing::warn!(process = %terminal, exchange = %exchange_id, "reference exchange missing, placeholder appended");
        state.exchanges.push(reference);
        state.record_decision(
            Stage::AssembleDatasets,
            &exchange_id,
            "reference exchange appended with a placeholder amount",
        );
    }
}

fn functional_unit(state: &DerivationState, process: &UnitProcess) -> String {
    let is_terminal = state
        .terminal_process()
        .is_some_and(|t| t.process_id == process.process_id);
    let unit = state.flow.unit_or_default();
    let flow = if is_terminal {
        state.flow.name().to_string()
    } else {
        process.reference_flow_name.clone()
    };
    match (is_terminal, state.operation) {
        (true, Operation::Treat) => format!("1 {unit} of {flow} treated"),
        _ => format!("1 {unit} of {flow}"),
    }
}

fn dataset_exchanges(state: &DerivationState, process_id: &str) -> Vec<DatasetExchange> {
    state
        .exchanges_for(process_id)
        .map(|exchange| {
            let flow = match state
                .match_results
                .get(&exchange.exchange_id)
                .filter(|m| m.is_matched())
                .and_then(|m| m.selected.as_ref())
            {
                Some(candidate) => FlowReference::Catalogue {
                    id: candidate.id.clone(),
                    version: candidate.version.clone().unwrap_or_default(),
                    name: candidate.name.clone(),
                },
                None => FlowReference::placeholder(&exchange.name),
            };
            let check = state.unit_checks.get(&exchange.exchange_id);
            let converted = check.filter(|c| c.status.is_converted());
            DatasetExchange {
                exchange_id: exchange.exchange_id.clone(),
                direction: exchange.direction,
                name: exchange.name.clone(),
                flow,
                unit: exchange.unit.clone(),
                amount: exchange.amount,
                original_unit: converted.and_then(|c| c.original_unit.clone()),
                original_amount: converted.map(|c| c.original_amount),
                source_type: exchange.source_type,
                is_reference_flow: exchange.is_reference_flow,
                comment: exchange.comment.clone(),
                unit_status: check.map(|c| c.status),
                density_used: check.and_then(|c| c.density_used.clone()),
            }
        })
        .collect()
}
