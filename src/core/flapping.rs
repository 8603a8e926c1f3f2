// src/core/flapping.rs

//! Flap detection: a sliding window over recent state transitions where newer
//! entries weigh more than older ones.

/// Number of transition flags kept per checkable.
pub const FLAP_WINDOW: usize = 21;

const WEIGHT_LOW: f64 = 0.8;
const WEIGHT_HIGH: f64 = 1.2;

/// Pushes a transition flag into the window, evicting the oldest entry once
/// the window is full.
pub fn push_transition(history: &mut Vec<bool>, changed: bool) {
    history.push(changed);
    if history.len() > FLAP_WINDOW {
        let excess = history.len() - FLAP_WINDOW;
        history.drain(..excess);
    }
}

/// The weighted change ratio in percent. Entry weights rise linearly from 0.8
/// (oldest) to 1.2 (newest), so recent oscillation dominates.
pub fn change_ratio(history: &[bool]) -> f64 {
    if history.len() < 2 {
        return 0.0;
    }
    let n = history.len() as f64;
    let mut weighted_changes = 0.0;
    let mut total_weight = 0.0;
    for (i, &changed) in history.iter().enumerate() {
        let weight = WEIGHT_LOW + (WEIGHT_HIGH - WEIGHT_LOW) * (i as f64) / (n - 1.0);
        total_weight += weight;
        if changed {
            weighted_changes += weight;
        }
    }
    weighted_changes / total_weight * 100.0
}

/// Hysteresis: enter flapping above `high`, leave below `low`.
/// Returns the new flapping flag.
pub fn update_flapping(current: bool, ratio: f64, high: f64, low: f64) -> bool {
    if current { ratio >= low } else { ratio > high }
}
