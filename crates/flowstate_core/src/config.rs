use crate::dynamics::EnergyDynamics;
use crate::error::FlowstateError;
use crate::state::{FlowKind, ProtectionKind};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FlowstateConfig {
    pub energy: EnergyConfig,
    pub flow: FlowConfig,
    pub patterns: PatternConfig,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig,
}

impl FlowstateConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: FlowstateConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        config.validate().with_context(|| "Config failed validation")?;
        Ok(config)
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({:#}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                if let Err(e) = cfg.validate() {
                    tracing::warn!(
                        "Env overrides produced an invalid config ({}), ignoring them",
                        e
                    );
                    cfg = Self::default();
                }
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_parse("FLOWSTATE_MAX_ENERGY") {
            self.energy.max = n;
        }
        if let Some(n) = env_parse("FLOWSTATE_DECAY_RATE") {
            self.energy.decay_rate = n;
        }
        if let Some(n) = env_parse("FLOWSTATE_RECOVERY_RATE") {
            self.energy.recovery_rate = n;
        }
        if let Some(n) = env_parse("FLOWSTATE_ENERGY_TICK_MS") {
            self.schedule.energy_tick_ms = n;
        }
        if let Ok(v) = std::env::var("FLOWSTATE_LOG") {
            self.logging.filter = v;
        }
        if let Some(b) = env_parse("FLOWSTATE_LOG_JSON") {
            self.logging.json = b;
        }
    }

    pub fn validate(&self) -> std::result::Result<(), FlowstateError> {
        let e = &self.energy;
        if !(e.max.is_finite() && e.max > 0.0) {
            return Err(FlowstateError::InvalidConfig(format!(
                "energy.max must be > 0, got {}",
                e.max
            )));
        }
        if !(e.decay_rate >= 0.0 && e.recovery_rate >= 0.0) {
            return Err(FlowstateError::InvalidConfig(
                "energy rates must be non-negative".to_string(),
            ));
        }
        if !(self.flow.bonus_multiplier.is_finite() && self.flow.bonus_multiplier >= 1.0) {
            return Err(FlowstateError::InvalidConfig(format!(
                "flow.bonus_multiplier must be >= 1, got {}",
                self.flow.bonus_multiplier
            )));
        }
        if !(self.patterns.resonance_nudge >= 0.0 && self.patterns.resonance_nudge <= 1.0) {
            return Err(FlowstateError::InvalidConfig(
                "patterns.resonance_nudge must be within [0, 1]".to_string(),
            ));
        }
        if let Some(name) = self.schedule.first_zero_period() {
            return Err(FlowstateError::InvalidConfig(format!(
                "schedule.{} must be > 0",
                name
            )));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    pub max: f64,
    /// Per minute while charging; also the per-second rest increment
    pub recovery_rate: f64,
    /// Per minute while discharging
    pub decay_rate: f64,
    pub dynamics: EnergyDynamics,
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            max: 100.0,
            recovery_rate: 0.2,
            decay_rate: 0.05,
            dynamics: EnergyDynamics::default(),
        }
    }
}

/// Target metrics and protection for one flow mode.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FlowProfile {
    pub quality: f64,
    pub stability: f64,
    pub focus: f64,
    pub clarity: f64,
    pub depth: f64,
    pub protection_level: f64,
    pub protection_kind: ProtectionKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowProfiles {
    pub normal: FlowProfile,
    pub flow: FlowProfile,
    pub recovering: FlowProfile,
    pub focus: FlowProfile,
}

impl FlowProfiles {
    pub fn get(&self, kind: FlowKind) -> &FlowProfile {
        match kind {
            FlowKind::Normal => &self.normal,
            FlowKind::Flow => &self.flow,
            FlowKind::Recovering => &self.recovering,
            FlowKind::Focus => &self.focus,
        }
    }
}

impl Default for FlowProfiles {
    fn default() -> Self {
        Self {
            normal: FlowProfile {
                quality: 0.6,
                stability: 0.6,
                focus: 0.5,
                clarity: 0.6,
                depth: 0.4,
                protection_level: 0.0,
                protection_kind: ProtectionKind::None,
            },
            flow: FlowProfile {
                quality: 0.9,
                stability: 0.8,
                focus: 0.9,
                clarity: 0.85,
                depth: 0.9,
                protection_level: 0.9,
                protection_kind: ProtectionKind::Deep,
            },
            recovering: FlowProfile {
                quality: 0.55,
                stability: 0.5,
                focus: 0.3,
                clarity: 0.5,
                depth: 0.2,
                protection_level: 0.3,
                protection_kind: ProtectionKind::Soft,
            },
            focus: FlowProfile {
                quality: 0.75,
                stability: 0.7,
                focus: 0.8,
                clarity: 0.75,
                depth: 0.6,
                protection_level: 0.6,
                protection_kind: ProtectionKind::Soft,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Decay divisor and boost multiplier while in Flow
    pub bonus_multiplier: f64,
    /// Fraction of the gap to the protection level closed per maintenance tick
    pub protection_gain: f64,
    /// Fraction of the gap to the target stability closed per stabilization tick
    pub stabilize_gain: f64,
    /// Journal size
    pub note_capacity: usize,
    pub profiles: FlowProfiles,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            bonus_multiplier: 1.5,
            protection_gain: 0.1,
            stabilize_gain: 0.1,
            note_capacity: 64,
            profiles: FlowProfiles::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Max |pattern.level - state.level| for a match (exclusive)
    pub level_tolerance: f64,
    pub reinforce_increment: f64,
    /// Patterns above this strength feed their tags back into the live context
    pub strong_threshold: f64,
    /// "Recent" for the feedback pass
    pub recent_window_secs: i64,
    pub resonance_nudge: f64,
    /// Patterns untouched for this long start losing strength
    pub stale_window_secs: i64,
    pub stale_decay: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            level_tolerance: 0.2,
            reinforce_increment: 0.1,
            strong_threshold: 0.7,
            recent_window_secs: 3600,
            resonance_nudge: 0.05,
            stale_window_secs: 24 * 3600,
            stale_decay: 0.95,
        }
    }
}

/// Timer periods, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub energy_tick_ms: u64,
    pub fast_cycle_ms: u64,
    pub medium_cycle_ms: u64,
    pub slow_cycle_ms: u64,
    pub protection_ms: u64,
    pub stabilize_ms: u64,
    pub rest_tick_ms: u64,
    pub pattern_aging_ms: u64,
    pub validate_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            energy_tick_ms: 60_000,
            fast_cycle_ms: 5_000,
            medium_cycle_ms: 8_000,
            slow_cycle_ms: 13_000,
            protection_ms: 100,
            stabilize_ms: 150,
            rest_tick_ms: 1_000,
            pattern_aging_ms: 60_000,
            validate_ms: 5_000,
        }
    }
}

impl ScheduleConfig {
    fn first_zero_period(&self) -> Option<&'static str> {
        [
            ("energy_tick_ms", self.energy_tick_ms),
            ("fast_cycle_ms", self.fast_cycle_ms),
            ("medium_cycle_ms", self.medium_cycle_ms),
            ("slow_cycle_ms", self.slow_cycle_ms),
            ("protection_ms", self.protection_ms),
            ("stabilize_ms", self.stabilize_ms),
            ("rest_tick_ms", self.rest_tick_ms),
            ("pattern_aging_ms", self.pattern_aging_ms),
            ("validate_ms", self.validate_ms),
        ]
        .into_iter()
        .find(|(_, ms)| *ms == 0)
        .map(|(name, _)| name)
    }

    pub fn energy_tick(&self) -> Duration {
        Duration::from_millis(self.energy_tick_ms)
    }
    pub fn fast_cycle(&self) -> Duration {
        Duration::from_millis(self.fast_cycle_ms)
    }
    pub fn medium_cycle(&self) -> Duration {
        Duration::from_millis(self.medium_cycle_ms)
    }
    pub fn slow_cycle(&self) -> Duration {
        Duration::from_millis(self.slow_cycle_ms)
    }
    pub fn protection(&self) -> Duration {
        Duration::from_millis(self.protection_ms)
    }
    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }
    pub fn rest_tick(&self) -> Duration {
        Duration::from_millis(self.rest_tick_ms)
    }
    pub fn pattern_aging(&self) -> Duration {
        Duration::from_millis(self.pattern_aging_ms)
    }
    pub fn validate(&self) -> Duration {
        Duration::from_millis(self.validate_ms)
    }

    /// Compressed periods for simulations and tests.
    pub fn testing() -> Self {
        Self {
            energy_tick_ms: 100,
            fast_cycle_ms: 50,
            medium_cycle_ms: 80,
            slow_cycle_ms: 130,
            protection_ms: 10,
            stabilize_ms: 15,
            rest_tick_ms: 1_000,
            pattern_aging_ms: 100,
            validate_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when RUST_LOG is unset
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
