//! Target collateral allocation across open positions.

use std::collections::{BTreeMap, HashMap};

use crate::domain::{Decimal, Position};

/// Split `budget` across positions proportionally to notional × risk weight.
///
/// The targets always sum to the budget (within decimal division rounding)
/// and are never negative. When every weighted value is zero, the budget is
/// split equally. Input order does not affect the result.
pub fn target_margins(
    positions: &[Position],
    weights: &HashMap<String, f64>,
    budget: Decimal,
) -> BTreeMap<String, Decimal> {
    if positions.is_empty() {
        return BTreeMap::new();
    }

    let weighted: BTreeMap<&str, Decimal> = positions
        .iter()
        .map(|pos| {
            let weight = weights.get(&pos.symbol).copied().unwrap_or(1.0);
            (
                pos.symbol.as_str(),
                pos.notional() * Decimal::from_f64_lossy(weight),
            )
        })
        .collect();

    let total: Decimal = weighted.values().copied().sum();

    if total.is_zero() {
        let count = Decimal::from(positions.len() as u32);
        let share = budget / count;
        return positions
            .iter()
            .map(|pos| (pos.symbol.clone(), share))
            .collect();
    }

    weighted
        .into_iter()
        .map(|(symbol, value)| (symbol.to_string(), budget * value / total))
        .collect()
}
