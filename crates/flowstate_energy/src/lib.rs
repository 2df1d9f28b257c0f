//! # Flowstate Energy
//!
//! The timer-driven half of the engine:
//!
//! - **EnergyStore**: owns every tracked energy state and applies the decay /
//!   recovery dynamics once per tick
//! - **FlowController**: the Normal / Flow / Recovering / Focus state machine
//!   layered on one entity, including protection maintenance and `rest`
//!
//! ## Time Scales
//!
//! - Fast (100-150 ms): protection maintenance and stabilization
//! - Medium (1 s): rest increments
//! - Slow (1 min): energy decay/recovery tick

mod flow;
mod rest;
mod store;

pub use flow::FlowController;
pub use rest::{RestCanceller, RestHandle, RestOutcome};
pub use store::EnergyStore;
