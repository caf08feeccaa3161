//! # Strata Core
//!
//! Structured decomposition of probabilistic models into nested problems with
//! incrementally refined ranges.

pub mod engine;
pub mod model;

// Re-export commonly used types
pub use engine::collection::{ComponentCollection, ComponentId, ProblemFactors, ProblemId};
pub use engine::errors::StructuredError;
pub use engine::factor::{Bounds, Factor};
pub use engine::strategy::{refine, refine_with_config, RefinementConfig, RefinementReport};
pub use engine::value_set::{Extended, ValueSet};
pub use engine::variable::{Variable, VariableId};
pub use model::{ElementId, Model, Value};
