//! # Flowstate Core
//!
//! Shared vocabulary for the Flowstate engine: the data model every component
//! publishes, the energy decay/recovery dynamics, the publish/subscribe
//! primitive components communicate through, and the clock/timer abstraction
//! that lets tests drive time by hand.

pub mod clock;
pub mod config;
pub mod dynamics;
pub mod error;
pub mod observable;
pub mod state;

pub use clock::{nonzero_period, Clock, ManualClock, SystemClock, TimerSet};
pub use config::{
    EnergyConfig, FlowConfig, FlowProfile, FlowProfiles, FlowstateConfig, LoggingConfig,
    PatternConfig, ScheduleConfig,
};
pub use dynamics::{Dynamics, EnergyDynamics};
pub use error::FlowstateError;
pub use observable::{Observable, Subscription};
pub use state::{
    AggregatedSnapshot, EnergyPhase, EnergyState, EntityId, FlowKind, FlowMetrics, FlowNote,
    FlowRecord, IntegrationMetrics, Pattern, PatternDigest, PatternEvolution, Protection,
    ProtectionKind, RESONANCE_CAP,
};
