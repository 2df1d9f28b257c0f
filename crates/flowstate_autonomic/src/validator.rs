//! Validator - soft health checks over the aggregated snapshot
//!
//! Failing checks never become errors for the caller: they are reported as
//! `is_valid = false` plus one insight per failed check.

use flowstate_core::{AggregatedSnapshot, FlowKind, ProtectionKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub insights: Vec<String>,
}

impl ValidationReport {
    fn invalid(insight: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            insights: vec![insight.into()],
        }
    }
}

/// A snapshot the checks themselves cannot evaluate.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("non-finite value in {field}: {value}")]
    NonFinite { field: &'static str, value: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Validator {
    /// flow.quality must exceed this
    pub min_flow_quality: f64,
    /// Below this the report carries a low-energy note (still valid)
    pub low_energy: f64,
    /// Harmony above this is worth mentioning
    pub high_harmony: f64,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            min_flow_quality: 0.5,
            low_energy: 0.2,
            high_harmony: 0.25,
        }
    }
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `snapshot`. `None` means the aggregator has no data yet.
    pub fn validate(&self, snapshot: Option<&AggregatedSnapshot>) -> ValidationReport {
        match self.check(snapshot) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Validator: {}", e);
                ValidationReport::invalid(format!("validation could not run: {}", e))
            }
        }
    }

    fn check(
        &self,
        snapshot: Option<&AggregatedSnapshot>,
    ) -> Result<ValidationReport, ValidationError> {
        let Some(s) = snapshot else {
            return Ok(ValidationReport::invalid("no aggregated state available yet"));
        };
        finite("energy.current", s.energy.current)?;
        finite("energy.max", s.energy.max)?;
        finite("flow.quality", s.flow.metrics.quality)?;
        finite("metrics.harmony", s.metrics.harmony)?;

        let mut failures = Vec::new();
        let level = s.energy.level();
        if level <= 0.0 {
            failures.push("energy depleted".to_string());
        }
        let quality = s.flow.metrics.quality;
        if quality <= self.min_flow_quality {
            failures.push(format!(
                "flow quality {:.2} is not above {:.2}",
                quality, self.min_flow_quality
            ));
        }
        match &s.pattern {
            Some(p) if !p.id.is_empty() => {}
            _ => failures.push("no active pattern".to_string()),
        }

        if !failures.is_empty() {
            return Ok(ValidationReport {
                is_valid: false,
                insights: failures,
            });
        }

        let mut insights = Vec::new();
        if s.flow.kind == FlowKind::Flow {
            insights.push("flow state active".to_string());
        }
        if s.flow.protection.kind == ProtectionKind::Deep {
            insights.push(format!(
                "deep protection at {:.0}%",
                s.flow.protection.strength * 100.0
            ));
        }
        if level < self.low_energy {
            insights.push(format!("energy low ({:.0}%), consider resting", level * 100.0));
        }
        if s.metrics.harmony > self.high_harmony {
            insights.push(format!("harmony {:.2}", s.metrics.harmony));
        }
        if let Some(p) = &s.pattern {
            let tags: Vec<&str> = p.signature.iter().map(String::as_str).collect();
            insights.push(format!("pattern [{}] strength {:.2}", tags.join(", "), p.strength()));
        }

        Ok(ValidationReport {
            is_valid: true,
            insights,
        })
    }
}

fn finite(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::NonFinite { field, value })
    }
}
