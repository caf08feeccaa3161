//! Error types for structured decomposition.

use thiserror::Error;

use crate::engine::collection::{ComponentId, ProblemId};
use crate::model::ElementId;

/// Errors that can occur while building or refining a structured problem.
///
/// Range and factory failures are passed through unchanged as
/// [`StructuredError::UnsupportedConstruct`]. A dependency that is simply not
/// registered yet is never an error; it reads as the unknown value.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking changes.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StructuredError {
    /// The model uses a construct the range or factor services cannot handle
    /// (e.g., infinite support with no sample budget).
    #[error("unsupported model construct: {0}")]
    UnsupportedConstruct(String),

    #[error("unknown element {0:?}")]
    UnknownElement(ElementId),

    #[error("unknown component {0:?}")]
    UnknownComponent(ComponentId),

    #[error("unknown problem {0:?}")]
    UnknownProblem(ProblemId),

    /// An expansion was requested on an element without conditional structure.
    #[error("element {0:?} is not expandable")]
    NotExpandable(ElementId),

    /// An expansion key that the governing parent cannot currently produce.
    #[error("invalid expansion: {0}")]
    InvalidExpansion(String),

    /// Invalid configuration or model construction arguments.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Internal error (programmer error, not user error).
    #[error("internal error: {0}")]
    Internal(String),
}
