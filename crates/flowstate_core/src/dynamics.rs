//! Energy Dynamics: the decay/recovery model applied on every store tick
//!
//! ΔE = rate · Δt · efficiency_factor, where Δt is elapsed minutes since the
//! last transition. Efficiency then drifts with the energy ratio and with how
//! long the entity has been in its current phase.
//!
//! Variant behaviour (different rates, thresholds) is data on `EnergyDynamics`,
//! never a separate type.

use crate::state::{sanitize_f64, EnergyPhase, EnergyState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trait for implementing energy evolution
pub trait Dynamics: Send + Sync {
    /// Advance `state` to `now`. `decay_divisor` scales decay down (flow bonus).
    /// Returns false when the state was left untouched.
    fn step(&self, state: &mut EnergyState, now: DateTime<Utc>, decay_divisor: f64) -> bool;
}

/// Parameters of the decay/recovery model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyDynamics {
    /// Efficiency at or above this counts as "efficient"
    pub efficiency_threshold: f64,
    /// Recovery multiplier when efficient / inefficient
    pub charge_efficient: f64,
    pub charge_inefficient: f64,
    /// Decay multiplier when efficient / inefficient (inverted: inefficiency hurts)
    pub discharge_efficient: f64,
    pub discharge_inefficient: f64,
    /// Weight of the energy ratio in the efficiency update
    pub ratio_weight: f64,
    /// Weight of the time factor in the efficiency update
    pub time_weight: f64,
    /// Minutes after which the time factor saturates at 1
    pub time_saturation_minutes: f64,
}

impl Default for EnergyDynamics {
    fn default() -> Self {
        Self {
            efficiency_threshold: 0.8,
            charge_efficient: 1.2,
            charge_inefficient: 0.8,
            discharge_efficient: 0.8,
            discharge_inefficient: 1.2,
            ratio_weight: 0.7,
            time_weight: 0.3,
            time_saturation_minutes: 8.0 * 60.0,
        }
    }
}

impl EnergyDynamics {
    /// Energy delta for `dt_minutes` in the state's current phase.
    pub fn energy_delta(&self, state: &EnergyState, dt_minutes: f64, decay_divisor: f64) -> f64 {
        let efficient = state.efficiency >= self.efficiency_threshold;
        match state.phase {
            EnergyPhase::Charging => {
                let factor = if efficient {
                    self.charge_efficient
                } else {
                    self.charge_inefficient
                };
                state.recovery_rate * dt_minutes * factor
            }
            EnergyPhase::Discharging => {
                let factor = if efficient {
                    self.discharge_efficient
                } else {
                    self.discharge_inefficient
                };
                let divisor = if decay_divisor.is_finite() && decay_divisor > 0.0 {
                    decay_divisor
                } else {
                    1.0
                };
                -(state.decay_rate / divisor) * dt_minutes * factor
            }
            EnergyPhase::Stable => 0.0,
        }
    }

    /// `min(1, dt / saturation)`
    pub fn time_factor(&self, dt_minutes: f64) -> f64 {
        if self.time_saturation_minutes <= 0.0 {
            return 1.0;
        }
        (dt_minutes / self.time_saturation_minutes).clamp(0.0, 1.0)
    }

    /// `min(1, (ratio·w_r + time·w_t) · old)`
    pub fn next_efficiency(&self, energy_ratio: f64, time_factor: f64, old: f64) -> f64 {
        let e = (energy_ratio * self.ratio_weight + time_factor * self.time_weight) * old;
        sanitize_f64(e, old).clamp(0.0, 1.0)
    }
}

/// Elapsed minutes between two instants, never negative.
pub fn elapsed_minutes(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let ms = (now - since).num_milliseconds().max(0);
    ms as f64 / 60_000.0
}

impl Dynamics for EnergyDynamics {
    fn step(&self, state: &mut EnergyState, now: DateTime<Utc>, decay_divisor: f64) -> bool {
        // Stable entities are inert: no energy change, no efficiency drift.
        if state.phase == EnergyPhase::Stable {
            return false;
        }

        let dt = elapsed_minutes(state.last_transition, now);
        let delta = self.energy_delta(state, dt, decay_divisor);
        state.current = sanitize_f64(state.current + delta, state.current).clamp(0.0, state.max);

        let ratio = state.current / state.max;
        let time_factor = self.time_factor(dt);
        state.efficiency = self.next_efficiency(ratio, time_factor, state.efficiency);

        state.last_transition = now;
        state.normalize();

        tracing::trace!(
            "Energy step: phase={:?}, dt={:.3}min, delta={:.4}, current={:.4}, efficiency={:.4}",
            state.phase,
            dt,
            delta,
            state.current,
            state.efficiency
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state_at(phase: EnergyPhase, now: DateTime<Utc>) -> EnergyState {
        let mut s = EnergyState::new(100.0, 0.2, 0.05, now);
        s.phase = phase;
        s
    }

    #[test]
    fn test_discharge_with_high_efficiency() {
        let t0 = Utc::now();
        let mut s = state_at(EnergyPhase::Discharging, t0);
        let d = EnergyDynamics::default();
        assert!(d.step(&mut s, t0 + Duration::minutes(1), 1.0));
        // 100 - 0.05 * 1 * 0.8
        assert!((s.current - 99.96).abs() < 1e-9);
    }

    #[test]
    fn test_discharge_with_low_efficiency_is_faster() {
        let t0 = Utc::now();
        let mut s = state_at(EnergyPhase::Discharging, t0);
        s.efficiency = 0.5;
        let d = EnergyDynamics::default();
        d.step(&mut s, t0 + Duration::minutes(1), 1.0);
        // 100 - 0.05 * 1 * 1.2
        assert!((s.current - 99.94).abs() < 1e-9);
    }

    #[test]
    fn test_charge_factors() {
        let t0 = Utc::now();
        let d = EnergyDynamics::default();

        let mut s = state_at(EnergyPhase::Charging, t0);
        s.current = 50.0;
        d.step(&mut s, t0 + Duration::minutes(10), 1.0);
        // 50 + 0.2 * 10 * 1.2
        assert!((s.current - 52.4).abs() < 1e-9);

        let mut s = state_at(EnergyPhase::Charging, t0);
        s.current = 50.0;
        s.efficiency = 0.5;
        d.step(&mut s, t0 + Duration::minutes(10), 1.0);
        // 50 + 0.2 * 10 * 0.8
        assert!((s.current - 51.6).abs() < 1e-9);
    }

    #[test]
    fn test_stable_is_inert() {
        let t0 = Utc::now();
        let mut s = state_at(EnergyPhase::Stable, t0);
        let before = s.clone();
        let d = EnergyDynamics::default();
        assert!(!d.step(&mut s, t0 + Duration::hours(3), 1.0));
        assert_eq!(s, before);
    }

    #[test]
    fn test_efficiency_update_formula() {
        let t0 = Utc::now();
        let mut s = state_at(EnergyPhase::Discharging, t0);
        let d = EnergyDynamics::default();
        d.step(&mut s, t0 + Duration::minutes(1), 1.0);
        let expected = (0.9996 * 0.7 + (1.0 / 480.0) * 0.3) * 1.0;
        assert!((s.efficiency - expected).abs() < 1e-9);
    }

    #[test]
    fn test_time_factor_saturates() {
        let d = EnergyDynamics::default();
        assert_eq!(d.time_factor(480.0), 1.0);
        assert_eq!(d.time_factor(10_000.0), 1.0);
        assert!((d.time_factor(240.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_decay_divisor_applies_to_discharge_only() {
        let t0 = Utc::now();
        let d = EnergyDynamics::default();
        let s = state_at(EnergyPhase::Discharging, t0);
        let base = d.energy_delta(&s, 1.0, 1.0);
        let flow = d.energy_delta(&s, 1.0, 1.5);
        assert!((flow - base / 1.5).abs() < 1e-12);

        let c = state_at(EnergyPhase::Charging, t0);
        assert_eq!(d.energy_delta(&c, 1.0, 1.0), d.energy_delta(&c, 1.0, 1.5));
    }

    #[test]
    fn test_clamped_at_zero() {
        let t0 = Utc::now();
        let mut s = state_at(EnergyPhase::Discharging, t0);
        s.current = 0.01;
        let d = EnergyDynamics::default();
        d.step(&mut s, t0 + Duration::hours(10), 1.0);
        assert_eq!(s.current, 0.0);
        assert!(s.efficiency >= 0.0);
    }

    #[test]
    fn test_clock_going_backwards_is_zero_elapsed() {
        let t0 = Utc::now();
        assert_eq!(elapsed_minutes(t0, t0 - Duration::minutes(5)), 0.0);
    }
}
