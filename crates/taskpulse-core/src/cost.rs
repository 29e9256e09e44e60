use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostUpdatePayload {
    #[serde(default)]
    pub current_cost: Option<f64>,
    #[serde(default)]
    pub phase_cost: Option<f64>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub breakdown: Option<BTreeMap<String, f64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CostSnapshot {
    pub current_cost: f64,
    pub phase_cost: f64,
    pub phase: String,
    pub breakdown: BTreeMap<String, f64>,
}

pub fn sanitize_cost_update(update: CostUpdatePayload) -> Option<CostSnapshot> {
    let current_cost = update.current_cost.filter(|cost| cost.is_finite())?;
    let breakdown = update.breakdown?;
    Some(CostSnapshot {
        current_cost: current_cost.max(0.0),
        phase_cost: clamp_figure(update.phase_cost.unwrap_or(0.0)),
        phase: update.phase.unwrap_or_default(),
        breakdown: breakdown
            .into_iter()
            .map(|(source, amount)| (source, clamp_figure(amount)))
            .collect(),
    })
}

fn clamp_figure(amount: f64) -> f64 {
    if amount.is_finite() {
        amount.max(0.0)
    } else {
        0.0
    }
}
