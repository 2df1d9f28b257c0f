//! # Flowstate Patterns
//!
//! Learns which context tags go with which energy levels. Every material
//! change of the watched entity either reinforces the patterns it resembles
//! or starts a new one; a slower aging pass feeds strong, recent patterns
//! back into the live context and lets stale ones fade.

mod matcher;

pub use matcher::{AgingReport, PatternMatcher};
