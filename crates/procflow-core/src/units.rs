//! Unit Reconciliation Engine
//!
//! Validates each matched exchange's unit against the catalogue flow's
//! reference unit and converts when the physics allow it:
//!
//! 1. same dimension: static linear factor (catalogue unit group first,
//!    built-in table second);
//! 2. mass ↔ volume on a product or waste flow: density estimate, recorded
//!    as an expert-judgement assumption;
//! 3. anything else: `mismatch` or `review`, amount untouched.
//!
//! Every converted amount carries its factor or its density provenance.

use crate::collaborators::{DensityEstimator, MaterialContext, UnitCatalog, UnitGroupInfo};
use crate::config::UnitConfig;
use crate::error::{CollaboratorError, Degradation};
use crate::model::{
    Amount, DensityUsed, ExchangeLineItem, FlowCandidate, FlowType, SourceType, UnitCheckResult,
    UnitStatus,
};
use crate::retry::{call_with_retry, CallPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Dimensions & built-in table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Mass,
    Energy,
    Volume,
    Area,
    Length,
    Items,
    MassDistance,
    Time,
}

impl Dimension {
    /// Unit every factor in the table converts to.
    pub fn reference_unit(self) -> &'static str {
        match self {
            Dimension::Mass => "kg",
            Dimension::Energy => "MJ",
            Dimension::Volume => "m3",
            Dimension::Area => "m2",
            Dimension::Length => "m",
            Dimension::Items => "item",
            Dimension::MassDistance => "t*km",
            Dimension::Time => "h",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dimension::Mass => "mass",
            Dimension::Energy => "energy",
            Dimension::Volume => "volume",
            Dimension::Area => "area",
            Dimension::Length => "length",
            Dimension::Items => "items",
            Dimension::MassDistance => "mass*distance",
            Dimension::Time => "time",
        };
        f.write_str(name)
    }
}

const UNIT_TABLE: &[(&str, Dimension, f64)] = &[
    // mass -> kg
    ("kg", Dimension::Mass, 1.0),
    ("kilogram", Dimension::Mass, 1.0),
    ("g", Dimension::Mass, 1e-3),
    ("gram", Dimension::Mass, 1e-3),
    ("t", Dimension::Mass, 1e3),
    ("tonne", Dimension::Mass, 1e3),
    ("ton", Dimension::Mass, 1e3),
    ("metricton", Dimension::Mass, 1e3),
    ("kt", Dimension::Mass, 1e6),
    ("lb", Dimension::Mass, 0.453_592_37),
    // energy -> MJ
    ("mj", Dimension::Energy, 1.0),
    ("kj", Dimension::Energy, 1e-3),
    ("j", Dimension::Energy, 1e-6),
    ("gj", Dimension::Energy, 1e3),
    ("tj", Dimension::Energy, 1e6),
    ("wh", Dimension::Energy, 0.0036),
    ("kwh", Dimension::Energy, 3.6),
    ("mwh", Dimension::Energy, 3_600.0),
    ("gwh", Dimension::Energy, 3_600_000.0),
    ("kcal", Dimension::Energy, 0.004_186_8),
    ("btu", Dimension::Energy, 0.001_055_06),
    // volume -> m3
    ("m3", Dimension::Volume, 1.0),
    ("nm3", Dimension::Volume, 1.0),
    ("dm3", Dimension::Volume, 1e-3),
    ("cm3", Dimension::Volume, 1e-6),
    ("l", Dimension::Volume, 1e-3),
    ("litre", Dimension::Volume, 1e-3),
    ("liter", Dimension::Volume, 1e-3),
    ("ml", Dimension::Volume, 1e-6),
    // area -> m2
    ("m2", Dimension::Area, 1.0),
    ("cm2", Dimension::Area, 1e-4),
    ("ha", Dimension::Area, 1e4),
    ("km2", Dimension::Area, 1e6),
    // length -> m
    ("m", Dimension::Length, 1.0),
    ("mm", Dimension::Length, 1e-3),
    ("cm", Dimension::Length, 1e-2),
    ("km", Dimension::Length, 1e3),
    // items
    ("item", Dimension::Items, 1.0),
    ("items", Dimension::Items, 1.0),
    ("item(s)", Dimension::Items, 1.0),
    ("pcs", Dimension::Items, 1.0),
    ("piece", Dimension::Items, 1.0),
    ("unit", Dimension::Items, 1.0),
    // mass * distance -> t*km
    ("t*km", Dimension::MassDistance, 1.0),
    ("tkm", Dimension::MassDistance, 1.0),
    ("kg*km", Dimension::MassDistance, 1e-3),
    // time -> h
    ("h", Dimension::Time, 1.0),
    ("hr", Dimension::Time, 1.0),
    ("hour", Dimension::Time, 1.0),
    ("min", Dimension::Time, 1.0 / 60.0),
    ("s", Dimension::Time, 1.0 / 3600.0),
    ("d", Dimension::Time, 24.0),
    ("day", Dimension::Time, 24.0),
    ("a", Dimension::Time, 8760.0),
    ("yr", Dimension::Time, 8760.0),
    ("year", Dimension::Time, 8760.0),
];

/// Symbols whose meaning depends on case. Matched exactly, never folded.
const CASE_SENSITIVE_UNITS: &[(&str, Dimension, f64)] = &[
    ("Mg", Dimension::Mass, 1e3),
    ("mg", Dimension::Mass, 1e-6),
    ("Gg", Dimension::Mass, 1e6),
];

/// Superscripts flattened, multiplication signs and spaces unified to `*`;
/// case is kept.
fn canonical_unit(unit: &str) -> String {
    let mut out = String::with_capacity(unit.len());
    for c in unit.trim().chars() {
        match c {
            '³' => out.push('3'),
            '²' => out.push('2'),
            '·' | '×' | '⋅' | ' ' => {
                if !out.ends_with('*') {
                    out.push('*');
                }
            }
            '^' => {}
            other => out.push(other),
        }
    }
    out
}

/// Canonical spelling used for case-insensitive table lookups.
pub fn normalize_unit(unit: &str) -> String {
    canonical_unit(unit).to_lowercase().replace("metric*ton", "metricton")
}

/// A folded spelling that only a case-sensitive symbol could resolve,
/// e.g. `MG` for either `Mg` or `mg`.
fn is_case_ambiguous(folded: &str) -> bool {
    CASE_SENSITIVE_UNITS
        .iter()
        .any(|(name, _, _)| name.to_lowercase() == folded)
}

/// Dimension and factor to the dimension's reference unit.
pub fn lookup_unit(unit: &str) -> Option<(Dimension, f64)> {
    let exact = canonical_unit(unit);
    if let Some((_, dimension, factor)) = CASE_SENSITIVE_UNITS.iter().find(|(name, _, _)| *name == exact) {
        return Some((*dimension, *factor));
    }
    let key = normalize_unit(unit);
    if is_case_ambiguous(&key) {
        return None;
    }
    UNIT_TABLE
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, dimension, factor)| (*dimension, *factor))
}

pub fn dimension_of(unit: &str) -> Option<Dimension> {
    lookup_unit(unit).map(|(dimension, _)| dimension)
}

/// Factor taking `amount` in `unit` to kilograms or megajoules.
pub fn basis_factor(unit: &str, dimension: Dimension) -> Option<f64> {
    lookup_unit(unit)
        .filter(|(d, _)| *d == dimension)
        .map(|(_, factor)| factor)
}

/// Parse `<mass>/<volume>` density units into a factor to kg/m3.
pub fn density_to_kg_per_m3(value: f64, unit: &str) -> Option<f64> {
    let (mass, volume) = unit.split_once('/')?;
    let (mass_dim, mass_factor) = lookup_unit(mass)?;
    let (volume_dim, volume_factor) = lookup_unit(volume)?;
    if mass_dim != Dimension::Mass || volume_dim != Dimension::Volume {
        return None;
    }
    let density = value * mass_factor / volume_factor;
    (density.is_finite() && density > 0.0).then_some(density)
}

// ============================================================================
// Conversion planning (pure)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum Conversion {
    /// Same dimension; resolved = original × factor.
    Linear { factor: f64, dimension: Option<Dimension> },
    /// Known but different dimensions. Factors go to each dimension's
    /// table reference unit.
    Cross {
        from: Dimension,
        from_factor: f64,
        to: Dimension,
        to_factor: f64,
    },
    Unknown,
}

fn group_factor(group: &UnitGroupInfo, unit: &str) -> Option<f64> {
    let positive = |f: f64| (f.is_finite() && f > 0.0).then_some(f);
    let exact = canonical_unit(unit);
    if canonical_unit(&group.reference_unit) == exact {
        return Some(1.0);
    }
    if let Some(u) = group.units.iter().find(|u| canonical_unit(&u.name) == exact) {
        return positive(u.factor);
    }

    let key = normalize_unit(unit);
    if is_case_ambiguous(&key) {
        return None;
    }
    if normalize_unit(&group.reference_unit) == key {
        return Some(1.0);
    }
    group
        .units
        .iter()
        .find(|u| normalize_unit(&u.name) == key)
        .and_then(|u| positive(u.factor))
}

fn plan_conversion(unit: &str, group: &UnitGroupInfo) -> Conversion {
    let reference_dimension = dimension_of(&group.reference_unit);
    if let (Some(from), Some(to)) = (group_factor(group, unit), group_factor(group, &group.reference_unit)) {
        return Conversion::Linear {
            factor: from / to,
            dimension: reference_dimension,
        };
    }

    match (lookup_unit(unit), lookup_unit(&group.reference_unit)) {
        (Some((d1, f1)), Some((d2, f2))) if d1 == d2 => Conversion::Linear {
            factor: f1 / f2,
            dimension: Some(d1),
        },
        (Some((from, from_factor)), Some((to, to_factor))) => Conversion::Cross {
            from,
            from_factor,
            to,
            to_factor,
        },
        _ => Conversion::Unknown,
    }
}

// ============================================================================
// UnitReconciler
// ============================================================================

#[derive(Clone)]
pub struct UnitReconciler {
    units: Option<Arc<dyn UnitCatalog>>,
    density: Option<Arc<dyn DensityEstimator>>,
    config: UnitConfig,
    policy: CallPolicy,
}

impl UnitReconciler {
    pub fn new(
        units: Option<Arc<dyn UnitCatalog>>,
        density: Option<Arc<dyn DensityEstimator>>,
        config: UnitConfig,
        policy: CallPolicy,
    ) -> Self {
        Self {
            units,
            density,
            config,
            policy,
        }
    }

    /// Reconcile `exchange` against the flow it was matched to.
    ///
    /// `original` overrides the exchange's current unit and amount, so a
    /// re-run starts from the extracted values rather than a previous
    /// conversion.
    pub async fn reconcile(
        &self,
        exchange: &ExchangeLineItem,
        matched: &FlowCandidate,
        original: Option<(Option<String>, Amount)>,
        technology: Option<&str>,
    ) -> UnitCheckResult {
        let (original_unit, original_amount) =
            original.unwrap_or_else(|| (exchange.unit.clone(), exchange.amount));
        let mut result = UnitCheckResult {
            exchange_id: exchange.exchange_id.clone(),
            status: UnitStatus::Review,
            original_unit: original_unit.clone(),
            original_amount,
            resolved_unit: original_unit.clone(),
            resolved_amount: original_amount,
            factor: None,
            basis_factor: None,
            dimension: None,
            density_used: None,
            reason: None,
            note: None,
        };

        let Some(unit) = original_unit.filter(|u| !u.trim().is_empty()) else {
            result.reason = Some(Degradation::MissingUnit);
            result.note = Some("exchange has no unit".to_string());
            tracing::warn!(exchange = %exchange.exchange_id, "unit review: missing unit");
            return result;
        };

        let group = match self.lookup(&matched.id).await {
            Ok(group) => group,
            Err(err) => {
                result.reason = Some(Degradation::CollaboratorUnavailable);
                result.note = Some(format!("reference unit lookup failed: {err}"));
                tracing::warn!(exchange = %exchange.exchange_id, flow = %matched.id, error = %err, "unit review: lookup failed");
                return result;
            }
        };

        match plan_conversion(&unit, &group) {
            Conversion::Linear { factor, dimension } => {
                result.status = if (factor - 1.0).abs() < 1e-12 {
                    UnitStatus::Ok
                } else {
                    UnitStatus::Converted
                };
                result.factor = Some(factor);
                result.dimension = dimension;
                result.resolved_unit = Some(group.reference_unit.clone());
                result.resolved_amount = original_amount.scaled(factor);
                result.basis_factor = resolved_basis_factor(&group.reference_unit, dimension);
            }
            Conversion::Cross {
                from,
                from_factor,
                to,
                to_factor,
            } => {
                let mass_volume = matches!(
                    (from, to),
                    (Dimension::Mass, Dimension::Volume) | (Dimension::Volume, Dimension::Mass)
                );
                let eligible_flow = matches!(exchange.flow_type, FlowType::Product | FlowType::Waste);
                if mass_volume && eligible_flow && self.config.density_conversion {
                    self.convert_by_density(
                        &mut result,
                        exchange,
                        matched,
                        &group.reference_unit,
                        (from, from_factor, to, to_factor),
                        technology,
                    )
                    .await;
                } else {
                    result.status = UnitStatus::Mismatch;
                    result.dimension = Some(from);
                    result.reason = Some(Degradation::UnitDimensionMismatch);
                    result.note = Some(format!(
                        "{unit} ({from}) cannot be converted to {} ({to})",
                        group.reference_unit
                    ));
                    tracing::warn!(
                        exchange = %exchange.exchange_id,
                        unit = %unit,
                        reference_unit = %group.reference_unit,
                        "unit dimension mismatch"
                    );
                }
            }
            Conversion::Unknown => {
                result.reason = Some(Degradation::UnknownUnitDimension);
                result.note = Some(format!(
                    "cannot determine the dimension of {unit} or {}",
                    group.reference_unit
                ));
                tracing::warn!(exchange = %exchange.exchange_id, unit = %unit, "unit review: unknown dimension");
            }
        }
        result
    }

    async fn lookup(&self, flow_id: &str) -> Result<UnitGroupInfo, CollaboratorError> {
        let Some(units) = &self.units else {
            return Err(CollaboratorError::Unavailable("no unit catalogue configured".to_string()));
        };
        call_with_retry(&self.policy, "lookup_reference_unit", || {
            units.lookup_reference_unit(flow_id)
        })
        .await
    }

    async fn convert_by_density(
        &self,
        result: &mut UnitCheckResult,
        exchange: &ExchangeLineItem,
        matched: &FlowCandidate,
        reference_unit: &str,
        (from, from_factor, to, to_factor): (Dimension, f64, Dimension, f64),
        technology: Option<&str>,
    ) {
        let material = MaterialContext {
            exchange_name: exchange.name.clone(),
            flow_name: matched.name.clone(),
            flow_type: exchange.flow_type,
            classification: matched.classification.clone(),
            technology: technology.map(str::to_string),
        };

        let estimate = match &self.density {
            Some(density) => {
                call_with_retry(&self.policy, "estimate_density", || {
                    density.estimate_density(&material)
                })
                .await
            }
            None => Err(CollaboratorError::Unavailable("no density estimator configured".to_string())),
        };

        let density = estimate.as_ref().ok().and_then(|e| {
            density_to_kg_per_m3(e.value, &e.unit).map(|kg_per_m3| (e, kg_per_m3))
        });
        let Some((estimate, kg_per_m3)) = density else {
            result.status = UnitStatus::Review;
            result.dimension = Some(from);
            result.reason = Some(Degradation::DensityEstimationFailed);
            result.note = Some(match &estimate {
                Err(err) => format!("density estimation failed: {err}"),
                Ok(e) => format!("unusable density {} {}", e.value, e.unit),
            });
            tracing::warn!(exchange = %exchange.exchange_id, "density estimation failed, unit left for review");
            return;
        };

        let factor = match from {
            Dimension::Volume => from_factor * kg_per_m3 / to_factor,
            _ => from_factor / (kg_per_m3 * to_factor),
        };
        result.status = UnitStatus::ConvertedByDensity;
        result.factor = Some(factor);
        result.dimension = Some(to);
        result.resolved_unit = Some(reference_unit.to_string());
        result.resolved_amount = result.original_amount.scaled(factor);
        result.basis_factor = resolved_basis_factor(reference_unit, Some(to));
        result.density_used = Some(DensityUsed {
            value: estimate.value,
            unit: estimate.unit.clone(),
            assumption: estimate.assumption.clone(),
            source_type: SourceType::ExpertJudgement,
        });
        tracing::info!(
            exchange = %exchange.exchange_id,
            density_kg_m3 = kg_per_m3,
            factor,
            "converted by density"
        );
    }
}

fn resolved_basis_factor(unit: &str, dimension: Option<Dimension>) -> Option<f64> {
    match dimension {
        Some(d @ (Dimension::Mass | Dimension::Energy)) => basis_factor(unit, d),
        _ => None,
    }
}
