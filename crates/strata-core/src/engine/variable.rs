//! Identity-bearing variables over value sets.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::engine::value_set::ValueSet;

/// A unique identifier for a variable, minted by a component collection.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariableId(pub u64);

/// A factor variable.
///
/// Equality and hashing use the id only: two variables over equal domains are
/// still different variables unless one is a clone of the other.
#[derive(Clone)]
pub struct Variable {
    id: VariableId,
    domain: Arc<ValueSet>,
}

impl Variable {
    pub(crate) fn new(id: VariableId, domain: Arc<ValueSet>) -> Self {
        Self { id, domain }
    }

    pub fn id(&self) -> VariableId {
        self.id
    }

    pub fn domain(&self) -> &Arc<ValueSet> {
        &self.domain
    }

    /// Number of extended values (star counts as one).
    pub fn size(&self) -> usize {
        self.domain.size()
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Variable#{}{}", self.id.0, self.domain)
    }
}
