//! Balance Review Engine
//!
//! Pure and non-mutating: sums a process's counted exchanges per basis
//! (kg for mass, MJ for energy) and reports the imbalance. Never fails;
//! missing data yields `insufficient`.

use crate::config::BalanceConfig;
use crate::model::{
    BalanceReviewResult, BalanceStatus, Basis, Direction, ExchangeLineItem, UnitCheckResult,
    UnitProcess,
};
use crate::units::{lookup_unit, Dimension};
use std::collections::BTreeMap;

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Default)]
pub struct BalanceReviewer {
    config: BalanceConfig,
}

impl BalanceReviewer {
    pub fn new(config: BalanceConfig) -> Self {
        Self { config }
    }

    /// Mass result always; energy result only when the process has an
    /// energy-dimension exchange that counts toward the balance.
    pub fn review(
        &self,
        process: &UnitProcess,
        exchanges: &[&ExchangeLineItem],
        unit_checks: &BTreeMap<String, UnitCheckResult>,
    ) -> Vec<BalanceReviewResult> {
        let mut results = vec![self.review_basis(process, Basis::Mass, exchanges, unit_checks)];
        let has_energy = exchanges
            .iter()
            .filter(|e| !e.excluded_from_balance())
            .any(|e| exchange_dimension(e, unit_checks.get(&e.exchange_id)) == Some(Dimension::Energy));
        if has_energy {
            results.push(self.review_basis(process, Basis::Energy, exchanges, unit_checks));
        }
        results
    }

    fn review_basis(
        &self,
        process: &UnitProcess,
        basis: Basis,
        exchanges: &[&ExchangeLineItem],
        unit_checks: &BTreeMap<String, UnitCheckResult>,
    ) -> BalanceReviewResult {
        let dimension = match basis {
            Basis::Mass => Dimension::Mass,
            Basis::Energy => Dimension::Energy,
        };
        let mut total_input = 0.0;
        let mut total_output = 0.0;
        let mut counted = 0usize;
        let mut unmatched_units = Vec::new();

        for exchange in exchanges.iter().filter(|e| !e.excluded_from_balance()) {
            match basis_value(exchange, unit_checks.get(&exchange.exchange_id), dimension) {
                BasisValue::Value(v) => {
                    counted += 1;
                    match exchange.direction {
                        Direction::Input => total_input += v,
                        Direction::Output => total_output += v,
                    }
                }
                BasisValue::OtherDimension => {}
                BasisValue::Unmatched(note) => unmatched_units.push(format!("{}: {note}", exchange.name)),
            }
        }

        let imbalance_ratio = (total_input - total_output).abs() / total_input.max(total_output).max(EPSILON);
        let unit = basis.unit();
        let mut warnings = Vec::new();
        let status = if counted < self.config.min_counted {
            warnings.push(format!(
                "insufficient {basis} data: {counted} exchange(s) with a usable {unit} value"
            ));
            BalanceStatus::Insufficient
        } else if imbalance_ratio <= self.config.ok_ratio {
            BalanceStatus::Ok
        } else {
            warnings.push(format!(
                "{basis} imbalance {:.1}%: inputs {total_input:.4} {unit}, outputs {total_output:.4} {unit}",
                imbalance_ratio * 100.0
            ));
            if imbalance_ratio > self.config.check_ratio {
                warnings.push(format!(
                    "large imbalance: ratio {imbalance_ratio:.3} exceeds {:.3}",
                    self.config.check_ratio
                ));
            }
            BalanceStatus::Check
        };

        BalanceReviewResult {
            process_id: process.process_id.clone(),
            basis,
            total_input,
            total_output,
            imbalance_ratio,
            status,
            counted,
            warnings,
            unmatched_units,
        }
    }
}

enum BasisValue {
    Value(f64),
    OtherDimension,
    Unmatched(String),
}

fn exchange_dimension(exchange: &ExchangeLineItem, check: Option<&UnitCheckResult>) -> Option<Dimension> {
    check
        .and_then(|c| c.dimension)
        .or_else(|| exchange.unit.as_deref().and_then(lookup_unit).map(|(d, _)| d))
}

/// (a) reconciled amount × basis factor, (b) built-in table on the
/// exchange's unit, (c) an unmatched-unit note.
fn basis_value(exchange: &ExchangeLineItem, check: Option<&UnitCheckResult>, dimension: Dimension) -> BasisValue {
    if let Some(check) = check {
        if let (Some(value), Some(factor), Some(d)) =
            (check.resolved_amount.value(), check.basis_factor, check.dimension)
        {
            return if d == dimension {
                BasisValue::Value(value * factor)
            } else {
                BasisValue::OtherDimension
            };
        }
    }

    let Some(unit) = exchange.unit.as_deref() else {
        return BasisValue::Unmatched("no unit".to_string());
    };
    match lookup_unit(unit) {
        Some((d, factor)) if d == dimension => match exchange.amount.value() {
            Some(value) => BasisValue::Value(value * factor),
            None => BasisValue::Unmatched("amount is a placeholder".to_string()),
        },
        Some(_) => BasisValue::OtherDimension,
        None => BasisValue::Unmatched(format!("unit '{unit}' has no {dimension} factor")),
    }
}
