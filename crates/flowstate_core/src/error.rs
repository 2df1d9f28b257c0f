use crate::state::EntityId;
use thiserror::Error;

/// Internal failure kinds. Public operations turn these into safe defaults
/// plus a log line rather than handing them to callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowstateError {
    #[error("unknown energy entity {0}")]
    UnknownEntity(EntityId),

    #[error("component has been disposed")]
    Disposed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, FlowstateError>;
