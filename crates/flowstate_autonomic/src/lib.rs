//! # Flowstate Autonomic
//!
//! The slow, read-only layer on top of the energy and pattern components:
//!
//! - **Aggregator**: three cycles at different rates compose upstream
//!   snapshots into `IntegrationMetrics`
//! - **Validator**: soft health checks over the latest snapshot
//! - **FlowSystem**: one tracked developer, wired end to end
//!
//! ## Cycle Rates
//!
//! - Fast (5 s): presence, clarity
//! - Medium (8 s): resonance, coherence
//! - Slow (13 s): harmony, alignment

mod aggregator;
mod system;
mod validator;

pub use aggregator::{Aggregator, AggregatorStatus, PHI_1, PHI_2, PHI_3};
pub use system::FlowSystem;
pub use validator::{ValidationError, ValidationReport, Validator};
