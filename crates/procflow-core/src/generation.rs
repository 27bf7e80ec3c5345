//! Plan generation
//!
//! Routes, unit processes and exchanges come from the text generator. The
//! engine only prompts, parses and normalizes; when the generator is missing,
//! fails, or replies with something unusable, a deterministic single-process
//! expert plan takes its place.

use crate::collaborators::{PromptContext, PromptTask, TextGenerator};
use crate::flow::ReferenceFlow;
use crate::model::*;
use crate::retry::{call_with_retry, CallPolicy};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

// ============================================================================
// JSON extraction
// ============================================================================

/// First balanced JSON object in free text. Tolerates code fences and
/// surrounding prose.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text[open..=close]) {
                return Some(value);
            }
        }
        start = open + 1;
    }
    None
}

fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

// ============================================================================
// Plan
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    Model,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedPlan {
    pub routes: Vec<TechnologyRoute>,
    pub selected_route: String,
    pub processes: Vec<UnitProcess>,
    pub exchanges: Vec<ExchangeLineItem>,
    pub origin: PlanOrigin,
    /// Why the fallback was used, when it was.
    pub note: Option<String>,
}

const ROUTES_INSTRUCTIONS: &str = "Propose technology routes that produce (or treat) the reference flow \
and break the selected route into an ordered chain of unit processes. Each process outputs the \
flow consumed by the next; the last process produces or treats the reference flow. Cite evidence \
source ids where they support a process. Reply with JSON: {\"selected_route_id\": str, \"routes\": \
[{\"route_id\", \"summary\", \"key_inputs\", \"key_outputs\", \"assumptions\", \"scope\", \
\"evidence_ids\", \"processes\": [{\"process_id\", \"base_name\", \"treatment\", \
\"mix_and_location\", \"reference_flow_name\", \"technology\", \"boundary\", \"assumptions\", \
\"inputs\", \"outputs\", \"evidence_refs\", \"is_reference_flow_process\"}]}]}";

const EXCHANGES_INSTRUCTIONS: &str = "List the input and output exchanges of every unit process. \
Give amounts only when a cited source supports them; otherwise use null. Reply with JSON: \
{\"processes\": [{\"process_id\", \"exchanges\": [{\"direction\", \"name\", \"flow_type\", \
\"material_role\", \"unit\", \"amount\", \"evidence_ref\", \"is_key\", \"is_reference_flow\", \
\"balance_exclude\", \"comment\", \"synonyms\", \"formula\", \"identifier\", \"usage_context\"}]}]}";

#[derive(Clone)]
pub struct PlanGenerator {
    text: Option<Arc<dyn TextGenerator>>,
    policy: CallPolicy,
}

impl PlanGenerator {
    pub fn new(text: Option<Arc<dyn TextGenerator>>, policy: CallPolicy) -> Self {
        Self { text, policy }
    }

    pub async fn generate(
        &self,
        flow: &ReferenceFlow,
        operation: Operation,
        evidence: &[EvidenceItem],
    ) -> GeneratedPlan {
        let Some(text) = &self.text else {
            return fallback_plan(flow, operation, "no text generator configured");
        };

        let flow_context = flow_context(flow, operation);
        let routes_prompt = PromptContext::new(
            PromptTask::Routes,
            ROUTES_INSTRUCTIONS,
            json!({ "flow": flow_context.clone(), "evidence": evidence }),
        );
        let routes_reply = match self.ask(text, &routes_prompt).await {
            Ok(value) => value,
            Err(note) => return fallback_plan(flow, operation, &note),
        };
        let Some((routes, selected_route, mut processes)) =
            parse_routes(&routes_reply, flow, operation)
        else {
            return fallback_plan(flow, operation, "routes reply has no usable processes");
        };

        let exchanges_prompt = PromptContext::new(
            PromptTask::Exchanges,
            EXCHANGES_INSTRUCTIONS,
            json!({ "flow": flow_context, "processes": processes, "evidence": evidence }),
        );
        let (exchanges, note) = match self.ask(text, &exchanges_prompt).await {
            Ok(value) => (parse_exchanges(&value, &processes), None),
            Err(note) => {
                tracing::warn!(flow = %flow.name(), %note, "exchange generation failed, keeping process plan");
                (Vec::new(), Some(note))
            }
        };

        for process in &mut processes {
            process.source_type = if process.evidence_refs.is_empty() {
                SourceType::ExpertJudgement
            } else {
                SourceType::Literature
            };
        }

        tracing::info!(
            flow = %flow.name(),
            routes = routes.len(),
            selected = %selected_route,
            processes = processes.len(),
            exchanges = exchanges.len(),
            "plan generated"
        );
        GeneratedPlan {
            routes,
            selected_route,
            processes,
            exchanges,
            origin: PlanOrigin::Model,
            note,
        }
    }

    async fn ask(&self, text: &Arc<dyn TextGenerator>, prompt: &PromptContext) -> Result<Value, String> {
        let reply = call_with_retry(&self.policy, prompt.task.as_str(), || text.generate_text(prompt))
            .await
            .map_err(|err| format!("{} generation failed: {err}", prompt.task))?;
        extract_json_object(&reply.text).ok_or_else(|| format!("{} reply is not a JSON object", prompt.task))
    }
}

fn flow_context(flow: &ReferenceFlow, operation: Operation) -> Value {
    json!({
        "id": flow.id,
        "name": flow.name(),
        "treatment": flow.treatment.pick("en"),
        "mix_and_location": flow.mix_and_location.pick("en"),
        "classification": flow.classification,
        "unit": flow.unit_or_default(),
        "operation": operation,
    })
}

/// Single-process expert plan used whenever generation is unavailable.
pub fn fallback_plan(flow: &ReferenceFlow, operation: Operation, why: &str) -> GeneratedPlan {
    tracing::warn!(flow = %flow.name(), reason = why, "using fallback expert plan");
    let name = flow.name().to_string();
    let base = match operation {
        Operation::Produce => format!("Production of {name}"),
        Operation::Treat => format!("Treatment of {name}"),
    };
    let (inputs, outputs) = match operation {
        Operation::Produce => (Vec::new(), vec![name.clone()]),
        Operation::Treat => (vec![name.clone()], Vec::new()),
    };

    let process = UnitProcess {
        process_id: "P1".to_string(),
        route_id: "R1".to_string(),
        order: 0,
        reference_flow_name: name.clone(),
        technology: String::new(),
        boundary: String::new(),
        assumptions: vec!["No literature-backed process plan was available.".to_string()],
        inputs,
        outputs,
        name: ProcessNameParts {
            base,
            treatment: flow.treatment.pick("en").unwrap_or_default().to_string(),
            mix_and_location: flow.mix_and_location.pick("en").unwrap_or_default().to_string(),
            quantitative_reference: String::new(),
        },
        evidence_refs: Vec::new(),
        is_reference_flow_process: true,
        source_type: SourceType::ExpertJudgement,
    };

    let mut reference =
        ExchangeLineItem::new("P1", "P1-E1", operation.reference_direction(), &name);
    reference.is_reference_flow = true;
    reference.is_key = true;
    reference.unit = flow.unit.clone();
    reference.source_type = SourceType::ExpertJudgement;
    reference.material_role = match operation {
        Operation::Produce => MaterialRole::Product,
        Operation::Treat => MaterialRole::Waste,
    };
    reference.flow_type = match operation {
        Operation::Produce => FlowType::Product,
        Operation::Treat => FlowType::Waste,
    };

    GeneratedPlan {
        routes: vec![TechnologyRoute {
            route_id: "R1".to_string(),
            summary: format!("Expert-judgement route for {name}"),
            scope: "fallback".to_string(),
            ..TechnologyRoute::default()
        }],
        selected_route: "R1".to_string(),
        processes: vec![process],
        exchanges: vec![reference],
        origin: PlanOrigin::Fallback,
        note: Some(why.to_string()),
    }
}

// ============================================================================
// Reply parsing
// ============================================================================

fn str_of(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn strings_of(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn bool_of(value: &Value, key: &str) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn parse_routes(
    reply: &Value,
    flow: &ReferenceFlow,
    operation: Operation,
) -> Option<(Vec<TechnologyRoute>, String, Vec<UnitProcess>)> {
    let raw_routes = reply.get("routes")?.as_array()?;
    if raw_routes.is_empty() {
        return None;
    }

    let routes: Vec<TechnologyRoute> = raw_routes
        .iter()
        .enumerate()
        .map(|(i, r)| TechnologyRoute {
            route_id: str_of(r, "route_id").unwrap_or_else(|| format!("R{}", i + 1)),
            summary: str_of(r, "summary").unwrap_or_default(),
            key_inputs: strings_of(r, "key_inputs"),
            key_outputs: strings_of(r, "key_outputs"),
            assumptions: strings_of(r, "assumptions"),
            scope: str_of(r, "scope").unwrap_or_default(),
            evidence_ids: strings_of(r, "evidence_ids"),
        })
        .collect();

    let selected_index = str_of(reply, "selected_route_id")
        .and_then(|id| routes.iter().position(|r| r.route_id == id))
        .unwrap_or(0);
    let selected = routes[selected_index].route_id.clone();

    let raw_processes = raw_routes[selected_index]
        .get("processes")
        .and_then(Value::as_array)?;
    let count = raw_processes.len();
    if count == 0 {
        return None;
    }

    let mut processes: Vec<UnitProcess> = raw_processes
        .iter()
        .enumerate()
        .map(|(order, p)| {
            let outputs = strings_of(p, "outputs");
            let inputs = strings_of(p, "inputs");
            let is_last = order + 1 == count;
            let reference_flow_name = str_of(p, "reference_flow_name")
                .or_else(|| {
                    if is_last {
                        Some(flow.name().to_string())
                    } else {
                        outputs.first().cloned()
                    }
                })
                .unwrap_or_default();
            let base = str_of(p, "base_name")
                .or_else(|| str_of(p, "name"))
                .unwrap_or_else(|| reference_flow_name.clone());
            UnitProcess {
                process_id: str_of(p, "process_id").unwrap_or_else(|| format!("P{}", order + 1)),
                route_id: selected.clone(),
                order,
                reference_flow_name,
                technology: str_of(p, "technology").unwrap_or_default(),
                boundary: str_of(p, "boundary").unwrap_or_default(),
                assumptions: strings_of(p, "assumptions"),
                inputs,
                outputs,
                name: ProcessNameParts {
                    base,
                    treatment: str_of(p, "treatment").unwrap_or_default(),
                    mix_and_location: str_of(p, "mix_and_location").unwrap_or_default(),
                    quantitative_reference: String::new(),
                },
                evidence_refs: strings_of(p, "evidence_refs"),
                is_reference_flow_process: bool_of(p, "is_reference_flow_process"),
                source_type: SourceType::Literature,
            }
        })
        .collect();

    // Exactly one terminal process; the last one unless the reply marked
    // exactly one.
    let marked = processes.iter().filter(|p| p.is_reference_flow_process).count();
    if marked != 1 {
        for (i, p) in processes.iter_mut().enumerate() {
            p.is_reference_flow_process = i + 1 == count;
        }
    }
    let unit = flow.unit_or_default().to_string();
    for p in &mut processes {
        if p.is_reference_flow_process {
            p.name.quantitative_reference = match operation {
                Operation::Produce => format!("1 {unit} of {}", flow.name()),
                Operation::Treat => format!("1 {unit} of {} treated", flow.name()),
            };
        }
    }

    Some((routes, selected, processes))
}

fn parse_exchanges(reply: &Value, processes: &[UnitProcess]) -> Vec<ExchangeLineItem> {
    let Some(entries) = reply.get("processes").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut exchanges = Vec::new();
    for entry in entries {
        let Some(process_id) = str_of(entry, "process_id") else {
            continue;
        };
        if !processes.iter().any(|p| p.process_id == process_id) {
            tracing::warn!(process = %process_id, "exchanges for unknown process ignored");
            continue;
        }
        let Some(items) = entry.get("exchanges").and_then(Value::as_array) else {
            continue;
        };

        let mut n = 0;
        for item in items {
            let Some(name) = str_of(item, "name") else {
                continue;
            };
            let Some(direction) = item
                .get("direction")
                .and_then(Value::as_str)
                .and_then(Direction::parse)
            else {
                tracing::warn!(process = %process_id, exchange = %name, "exchange without direction ignored");
                continue;
            };
            n += 1;
            let evidence_ref = str_of(item, "evidence_ref");
            let source_type = match str_of(item, "source_type").as_deref() {
                Some("expert_judgement") => SourceType::ExpertJudgement,
                Some("literature") => SourceType::Literature,
                _ if evidence_ref.is_some() => SourceType::Literature,
                _ => SourceType::ExpertJudgement,
            };
            exchanges.push(ExchangeLineItem {
                exchange_id: format!("{process_id}-E{n}"),
                process_id: process_id.clone(),
                direction,
                name,
                flow_type: item
                    .get("flow_type")
                    .and_then(Value::as_str)
                    .and_then(FlowType::parse)
                    .unwrap_or_default(),
                material_role: item
                    .get("material_role")
                    .and_then(Value::as_str)
                    .map(MaterialRole::parse)
                    .unwrap_or_default(),
                balance_exclude: bool_of(item, "balance_exclude"),
                is_key: bool_of(item, "is_key"),
                is_reference_flow: bool_of(item, "is_reference_flow"),
                unit: str_of(item, "unit"),
                amount: Amount::from_json(item.get("amount")),
                evidence_ref,
                source_type,
                comment: str_of(item, "comment"),
                hints: SearchHints {
                    synonyms: strings_of(item, "synonyms"),
                    formula: str_of(item, "formula"),
                    identifier: str_of(item, "identifier"),
                    usage_context: str_of(item, "usage_context"),
                },
            });
        }
    }
    exchanges
}
