//! Records carried by the State Store.

use crate::error::Degradation;
use crate::units::Dimension;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Enumerations
// ============================================================================

/// Operation mode of the terminal process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    #[default]
    Produce,
    Treat,
}

impl Operation {
    /// Produce → the reference flow is an output; treat → an input.
    pub fn reference_direction(self) -> Direction {
        match self {
            Operation::Produce => Direction::Output,
            Operation::Treat => Direction::Input,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Produce => "produce",
            Operation::Treat => "treat",
        }
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "produce" | "production" => Ok(Operation::Produce),
            "treat" | "treatment" | "dispose" | "disposal" => Ok(Operation::Treat),
            other => Err(format!("unknown operation '{other}' (expected produce or treat)")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "input" | "in" => Some(Direction::Input),
            "output" | "out" => Some(Direction::Output),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    #[default]
    Product,
    Elementary,
    Waste,
    Service,
}

impl FlowType {
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "product" | "product flow" => Some(FlowType::Product),
            "elementary" | "elementary flow" => Some(FlowType::Elementary),
            "waste" | "waste flow" => Some(FlowType::Waste),
            "service" | "other flow" => Some(FlowType::Service),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterialRole {
    RawMaterial,
    Auxiliary,
    Catalyst,
    Energy,
    Emission,
    Product,
    Waste,
    Service,
    #[default]
    Unknown,
}

impl MaterialRole {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "raw_material" => MaterialRole::RawMaterial,
            "auxiliary" => MaterialRole::Auxiliary,
            "catalyst" => MaterialRole::Catalyst,
            "energy" => MaterialRole::Energy,
            "emission" => MaterialRole::Emission,
            "product" => MaterialRole::Product,
            "waste" => MaterialRole::Waste,
            "service" => MaterialRole::Service,
            _ => MaterialRole::Unknown,
        }
    }
}

/// Where a value or a process description comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Literature,
    ExpertJudgement,
}

// ============================================================================
// Evidence & Plan
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceScope {
    Route,
    Split,
    ExchangeValues,
    BackgroundOnly,
}

/// One literature source returned by the evidence collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub source_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub usable: bool,
    #[serde(default)]
    pub scope: Vec<EvidenceScope>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnologyRoute {
    pub route_id: String,
    pub summary: String,
    pub key_inputs: Vec<String>,
    pub key_outputs: Vec<String>,
    pub assumptions: Vec<String>,
    pub scope: String,
    pub evidence_ids: Vec<String>,
}

/// Name parts of a unit process dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessNameParts {
    pub base: String,
    pub treatment: String,
    pub mix_and_location: String,
    pub quantitative_reference: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitProcess {
    pub process_id: String,
    pub route_id: String,
    /// Position in the route, 0-based. The last process is terminal.
    pub order: usize,
    /// Name of the flow this process outputs to the next process
    /// (or the reference flow for the terminal process).
    pub reference_flow_name: String,
    pub technology: String,
    pub boundary: String,
    pub assumptions: Vec<String>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub name: ProcessNameParts,
    pub evidence_refs: Vec<String>,
    pub is_reference_flow_process: bool,
    pub source_type: SourceType,
}

// ============================================================================
// Exchanges
// ============================================================================

/// Exchange amount: a number or an explicit placeholder sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Amount {
    Value(f64),
    Placeholder,
}

impl Amount {
    pub fn value(&self) -> Option<f64> {
        match self {
            Amount::Value(v) => Some(*v),
            Amount::Placeholder => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Amount::Placeholder)
    }

    /// Numbers and numeric strings become values; anything else a placeholder.
    pub fn from_json(value: Option<&Value>) -> Self {
        let parsed = match value {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().replace(',', "").parse::<f64>().ok(),
            _ => None,
        };
        match parsed {
            Some(v) if v.is_finite() => Amount::Value(v),
            _ => Amount::Placeholder,
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        match self {
            Amount::Value(v) => Amount::Value(v * factor),
            Amount::Placeholder => Amount::Placeholder,
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Amount::Value(v) => write!(f, "{v}"),
            Amount::Placeholder => f.write_str("placeholder"),
        }
    }
}

/// Search hints attached to an exchange by generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHints {
    pub synonyms: Vec<String>,
    pub formula: Option<String>,
    pub identifier: Option<String>,
    pub usage_context: Option<String>,
}

impl SearchHints {
    pub fn is_empty(&self) -> bool {
        self.synonyms.is_empty()
            && self.formula.is_none()
            && self.identifier.is_none()
            && self.usage_context.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeLineItem {
    pub exchange_id: String,
    pub process_id: String,
    pub direction: Direction,
    pub name: String,
    pub flow_type: FlowType,
    pub material_role: MaterialRole,
    pub balance_exclude: bool,
    /// Explicitly flagged as a key exchange for value coverage.
    pub is_key: bool,
    pub is_reference_flow: bool,
    pub unit: Option<String>,
    pub amount: Amount,
    pub evidence_ref: Option<String>,
    pub source_type: SourceType,
    pub comment: Option<String>,
    pub hints: SearchHints,
}

impl ExchangeLineItem {
    pub fn new(process_id: &str, exchange_id: &str, direction: Direction, name: &str) -> Self {
        Self {
            exchange_id: exchange_id.to_string(),
            process_id: process_id.to_string(),
            direction,
            name: name.to_string(),
            flow_type: FlowType::Product,
            material_role: MaterialRole::Unknown,
            balance_exclude: false,
            is_key: false,
            is_reference_flow: false,
            unit: None,
            amount: Amount::Placeholder,
            evidence_ref: None,
            source_type: SourceType::Literature,
            comment: None,
            hints: SearchHints::default(),
        }
    }

    pub fn with_amount(mut self, amount: f64, unit: &str) -> Self {
        self.amount = Amount::Value(amount);
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_flow_type(mut self, flow_type: FlowType) -> Self {
        self.flow_type = flow_type;
        self
    }

    pub fn with_role(mut self, role: MaterialRole) -> Self {
        self.material_role = role;
        self
    }

    pub fn with_evidence(mut self, source_id: &str) -> Self {
        self.evidence_ref = Some(source_id.to_string());
        self
    }

    /// Excluded from balance totals either explicitly or by role.
    pub fn excluded_from_balance(&self) -> bool {
        self.balance_exclude
            || matches!(
                self.material_role,
                MaterialRole::Auxiliary | MaterialRole::Catalyst
            )
    }
}

// ============================================================================
// Flow matching
// ============================================================================

/// A catalogue flow returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowCandidate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub classification: Vec<String>,
    #[serde(default)]
    pub flow_type: Option<FlowType>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPass {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Placeholder,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub exchange_id: String,
    pub status: MatchStatus,
    pub pass: MatchPass,
    /// Always one of `candidates` when set.
    pub selected: Option<FlowCandidate>,
    pub rationale: Option<String>,
    pub reason: Option<Degradation>,
    pub query: String,
    pub candidates: Vec<FlowCandidate>,
    pub strategy: Option<String>,
}

impl MatchResult {
    pub fn candidate_id(&self) -> Option<&str> {
        self.selected.as_ref().map(|c| c.id.as_str())
    }

    pub fn is_matched(&self) -> bool {
        self.status == MatchStatus::Matched
    }

    pub(crate) fn degraded(
        exchange_id: &str,
        status: MatchStatus,
        pass: MatchPass,
        reason: Degradation,
        query: String,
        candidates: Vec<FlowCandidate>,
    ) -> Self {
        Self {
            exchange_id: exchange_id.to_string(),
            status,
            pass,
            selected: None,
            rationale: None,
            reason: Some(reason),
            query,
            candidates,
            strategy: None,
        }
    }
}

// ============================================================================
// Unit reconciliation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Ok,
    Converted,
    ConvertedByDensity,
    Mismatch,
    Review,
}

impl UnitStatus {
    pub fn is_converted(self) -> bool {
        matches!(self, UnitStatus::Converted | UnitStatus::ConvertedByDensity)
    }
}

/// Provenance of a density-based conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityUsed {
    pub value: f64,
    pub unit: String,
    pub assumption: String,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitCheckResult {
    pub exchange_id: String,
    pub status: UnitStatus,
    pub original_unit: Option<String>,
    pub original_amount: Amount,
    pub resolved_unit: Option<String>,
    pub resolved_amount: Amount,
    /// resolved = original × factor, whenever a conversion happened.
    pub factor: Option<f64>,
    /// Resolved unit → kilograms (mass) or megajoules (energy).
    pub basis_factor: Option<f64>,
    pub dimension: Option<Dimension>,
    pub density_used: Option<DensityUsed>,
    pub reason: Option<Degradation>,
    pub note: Option<String>,
}

// ============================================================================
// Coverage
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    /// 1-based, strictly increasing.
    pub iteration: u32,
    pub process_coverage: f64,
    pub exchange_value_coverage: f64,
    pub usable_evidence: usize,
    pub supporting_info_pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    Continue,
    Stop,
    ExpertJudgement,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageDelta {
    pub process: f64,
    pub exchange_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopRuleDecision {
    pub iteration: u32,
    pub should_stop: bool,
    pub action: StopAction,
    pub reason: String,
    pub coverage_delta: Option<CoverageDelta>,
}

// ============================================================================
// Balance review
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Basis {
    Mass,
    Energy,
}

impl Basis {
    pub fn unit(self) -> &'static str {
        match self {
            Basis::Mass => "kg",
            Basis::Energy => "MJ",
        }
    }
}

impl fmt::Display for Basis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Basis::Mass => "mass",
            Basis::Energy => "energy",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStatus {
    Ok,
    Check,
    Insufficient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReviewResult {
    pub process_id: String,
    pub basis: Basis,
    pub total_input: f64,
    pub total_output: f64,
    pub imbalance_ratio: f64,
    pub status: BalanceStatus,
    /// Exchanges that carried a usable basis value.
    pub counted: usize,
    pub warnings: Vec<String>,
    pub unmatched_units: Vec<String>,
}

// ============================================================================
// Audit artifacts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderReport {
    pub exchange_id: String,
    pub process_id: String,
    pub exchange_name: String,
    pub status: MatchStatus,
    pub reason: Degradation,
    pub attempts: u32,
    pub last_query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessNarrative {
    pub process_id: String,
    pub text: crate::flow::LanguageTaggedText,
    /// `model` or `template`.
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationRecord {
    pub process_id: String,
    pub valid: Option<bool>,
    pub errors: Vec<String>,
    pub persisted_id: Option<String>,
    pub persisted_version: Option<String>,
    pub failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn amount_parses_numbers_and_numeric_strings() {
        assert_eq!(Amount::from_json(Some(&json!(2.5))), Amount::Value(2.5));
        assert_eq!(Amount::from_json(Some(&json!("1,200"))), Amount::Value(1200.0));
        assert_eq!(Amount::from_json(Some(&json!("n/a"))), Amount::Placeholder);
        assert_eq!(Amount::from_json(Some(&Value::Null)), Amount::Placeholder);
        assert_eq!(Amount::from_json(None), Amount::Placeholder);
    }

    #[test]
    fn operation_parse_accepts_aliases() {
        assert_eq!("Disposal".parse::<Operation>().unwrap(), Operation::Treat);
        assert_eq!("produce".parse::<Operation>().unwrap(), Operation::Produce);
        assert!("grow".parse::<Operation>().is_err());
        assert_eq!(Operation::Treat.reference_direction(), Direction::Input);
    }

    #[test]
    fn catalyst_and_flagged_exchanges_are_excluded() {
        let base = ExchangeLineItem::new("P1", "P1-E1", Direction::Input, "Nickel catalyst");
        assert!(base.clone().with_role(MaterialRole::Catalyst).excluded_from_balance());
        assert!(base.clone().with_role(MaterialRole::Auxiliary).excluded_from_balance());
        let mut flagged = base.clone().with_role(MaterialRole::RawMaterial);
        assert!(!flagged.excluded_from_balance());
        flagged.balance_exclude = true;
        assert!(flagged.excluded_from_balance());
    }

    #[test]
    fn direction_parse_is_lenient() {
        assert_eq!(Direction::parse(" Input "), Some(Direction::Input));
        assert_eq!(Direction::parse("OUT"), Some(Direction::Output));
        assert_eq!(Direction::parse("sideways"), None);
    }
}
