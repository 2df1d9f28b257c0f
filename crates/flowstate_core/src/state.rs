//! Flowstate Data Model
//!
//! Every value the engine publishes lives here:
//! - `EnergyState`: one developer's bounded energy resource plus live context
//! - `FlowRecord`: the flow state machine's current mode, metrics and protection
//! - `Pattern`: a reinforced association between context tags and an energy signature
//! - `IntegrationMetrics` / `AggregatedSnapshot`: what the dashboard reads
//!
//! All `[0,1]` fields are clamped on write through the `normalize` methods.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Guard against NaN and Infinity in state values.
/// If the value is NaN or Inf, replace with the provided fallback.
#[inline]
pub fn sanitize_f64(v: f64, fallback: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        tracing::warn!("NaN/Inf detected in state, resetting to fallback {}", fallback);
        fallback
    }
}

/// Upper bound on `EnergyState::resonance`. The pattern feedback loop only
/// settles because nudges saturate here.
pub const RESONANCE_CAP: f64 = 1.0;

/// Sanitize then clamp into `[0, 1]`.
#[inline]
pub fn unit(v: f64) -> f64 {
    sanitize_f64(v, 0.0).clamp(0.0, 1.0)
}

// =============================================================================
// Identifiers
// =============================================================================

/// Identifies one tracked energy state inside an `EnergyStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Energy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyPhase {
    Charging,
    Discharging,
    Stable,
}

/// A bounded energy resource with a phase and an efficiency modifier.
///
/// `context` and `resonance` are the live signature the pattern matcher
/// compares against and reinforces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyState {
    /// Current energy (0.0 to max)
    pub current: f64,
    /// Capacity, always > 0
    pub max: f64,
    /// 0.0 to 1.0; low efficiency accelerates loss and slows recovery
    pub efficiency: f64,
    pub phase: EnergyPhase,
    /// Energy regained per minute while charging (also the per-second rest increment)
    pub recovery_rate: f64,
    /// Energy lost per minute while discharging
    pub decay_rate: f64,
    pub last_transition: DateTime<Utc>,
    /// Context tags describing what the developer is doing right now
    pub context: BTreeSet<String>,
    /// 0.0 to 1.0
    pub resonance: f64,
}

impl EnergyState {
    pub fn new(max: f64, recovery_rate: f64, decay_rate: f64, now: DateTime<Utc>) -> Self {
        let max = if max.is_finite() && max > 0.0 { max } else { 100.0 };
        Self {
            current: max,
            max,
            efficiency: 1.0,
            phase: EnergyPhase::Stable,
            recovery_rate,
            decay_rate,
            last_transition: now,
            context: BTreeSet::new(),
            resonance: 0.0,
        }
    }

    /// Normalized energy level in `[0, 1]`.
    pub fn level(&self) -> f64 {
        if self.max > 0.0 {
            unit(self.current / self.max)
        } else {
            0.0
        }
    }

    /// Clamp all bounded fields into their documented ranges.
    pub fn normalize(&mut self) {
        if !(self.max.is_finite() && self.max > 0.0) {
            tracing::warn!("Invalid energy max {}, resetting to 100", self.max);
            self.max = 100.0;
        }
        self.current = sanitize_f64(self.current, 0.0).clamp(0.0, self.max);
        self.efficiency = unit(self.efficiency);
        self.resonance = unit(self.resonance);
        self.recovery_rate = sanitize_f64(self.recovery_rate, 0.0).max(0.0);
        self.decay_rate = sanitize_f64(self.decay_rate, 0.0).max(0.0);
    }

    /// True when the change from `prev` is worth pattern-matching on: energy,
    /// resonance or context moved. Efficiency and timestamps are timer noise.
    pub fn materially_differs(&self, prev: &EnergyState) -> bool {
        (self.current - prev.current).abs() > f64::EPSILON
            || (self.resonance - prev.resonance).abs() > f64::EPSILON
            || self.context != prev.context
    }
}

// =============================================================================
// Flow
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    #[default]
    Normal,
    Flow,
    Recovering,
    Focus,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowKind::Normal => "normal",
            FlowKind::Flow => "flow",
            FlowKind::Recovering => "recovering",
            FlowKind::Focus => "focus",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FlowMetrics {
    pub quality: f64,
    pub stability: f64,
    pub focus: f64,
    pub clarity: f64,
    pub depth: f64,
    pub energy: f64,
}

impl FlowMetrics {
    pub fn normalize(&mut self) {
        self.quality = unit(self.quality);
        self.stability = unit(self.stability);
        self.focus = unit(self.focus);
        self.clarity = unit(self.clarity);
        self.depth = unit(self.depth);
        self.energy = unit(self.energy);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionKind {
    #[default]
    None,
    Soft,
    Deep,
}

/// Interruption shielding around a focused mode.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Protection {
    /// Target strength for the current mode
    pub level: f64,
    pub kind: ProtectionKind,
    /// Current strength, converging toward `level`
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub kind: FlowKind,
    pub metrics: FlowMetrics,
    pub protection: Protection,
    /// Trigger of the last transition, or the reason it ended
    pub cause: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FlowRecord {
    pub fn normalize(&mut self) {
        self.metrics.normalize();
        self.protection.level = unit(self.protection.level);
        self.protection.strength = unit(self.protection.strength);
    }
}

/// A timestamped line in the flow controller's journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNote {
    pub at: DateTime<Utc>,
    pub text: String,
}

// =============================================================================
// Patterns
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatternEvolution {
    pub created: DateTime<Utc>,
    /// Always >= created
    pub modified: DateTime<Utc>,
    /// 0.0 to 1.0
    pub strength: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub signature: BTreeSet<String>,
    pub state_snapshot: EnergyState,
    pub evolution: PatternEvolution,
}

impl Pattern {
    pub fn new(state: &EnergyState, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            signature: state.context.clone(),
            state_snapshot: state.clone(),
            evolution: PatternEvolution {
                created: now,
                modified: now,
                strength: 1.0,
            },
        }
    }

    /// Energy level the pattern was last observed at.
    pub fn level(&self) -> f64 {
        self.state_snapshot.level()
    }

    pub fn strength(&self) -> f64 {
        unit(self.evolution.strength)
    }

    pub fn overlaps(&self, context: &BTreeSet<String>) -> bool {
        self.signature.intersection(context).next().is_some()
    }

    /// Record a repeat observation. `modified` never moves before `created`.
    pub fn reinforce(&mut self, state: &EnergyState, increment: f64, now: DateTime<Utc>) {
        self.evolution.strength = unit(self.evolution.strength + increment);
        self.evolution.modified = now.max(self.evolution.created);
        self.state_snapshot = state.clone();
    }
}

/// Summary of the pattern set, published on every change.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternDigest {
    /// The pattern most recently created or reinforced
    pub latest: Option<Pattern>,
    pub strongest: Option<Pattern>,
    pub count: usize,
}

// =============================================================================
// Aggregation
// =============================================================================

/// Composite metrics. Each aggregator cycle owns a subset of the fields,
/// so the struct is never written as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IntegrationMetrics {
    pub harmony: f64,
    pub presence: f64,
    pub clarity: f64,
    pub resonance: f64,
    pub coherence: f64,
    pub alignment: f64,
}

impl IntegrationMetrics {
    pub fn normalize(&mut self) {
        self.harmony = unit(self.harmony);
        self.presence = unit(self.presence);
        self.clarity = unit(self.clarity);
        self.resonance = unit(self.resonance);
        self.coherence = unit(self.coherence);
        self.alignment = unit(self.alignment);
    }
}

/// Everything the dashboard needs in one pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSnapshot {
    pub energy: EnergyState,
    pub flow: FlowRecord,
    pub pattern: Option<Pattern>,
    pub metrics: IntegrationMetrics,
    pub updated_at: DateTime<Utc>,
}
