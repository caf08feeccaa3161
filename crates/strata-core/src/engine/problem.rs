//! Problems: the nodes of the decomposition tree.

use rustc_hash::FxHashSet;

use crate::engine::collection::{ComponentId, ProblemId};
use crate::engine::factor::Factor;
use crate::model::{ElementId, FunctionId, Value};

/// Where a problem came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProblemKind {
    /// Created directly by the caller.
    Top,
    /// Created by expanding a chain for one parent value.
    Nested(NestedOrigin),
}

/// The expansion key and target of a nested problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedOrigin {
    pub owner: ComponentId,
    pub function: FunctionId,
    pub parent_value: Value,
    pub target: ElementId,
}

/// A set of components solved together.
///
/// A component belongs to exactly one problem, the first one that added its
/// element. Other problems reach it as a global.
#[derive(Debug, Clone)]
pub struct Problem {
    id: ProblemId,
    kind: ProblemKind,
    depth: usize,
    targets: Vec<ElementId>,
    components: Vec<ComponentId>,
    owned: FxHashSet<ComponentId>,
    solution: Option<Vec<Factor>>,
}

impl Problem {
    pub(crate) fn top(id: ProblemId, targets: &[ElementId]) -> Self {
        Self {
            id,
            kind: ProblemKind::Top,
            depth: 0,
            targets: targets.to_vec(),
            components: Vec::new(),
            owned: FxHashSet::default(),
            solution: None,
        }
    }

    pub(crate) fn nested(id: ProblemId, origin: NestedOrigin, depth: usize) -> Self {
        Self {
            id,
            depth,
            targets: vec![origin.target],
            kind: ProblemKind::Nested(origin),
            components: Vec::new(),
            owned: FxHashSet::default(),
            solution: None,
        }
    }

    pub fn id(&self) -> ProblemId {
        self.id
    }

    pub fn kind(&self) -> &ProblemKind {
        &self.kind
    }

    /// Nesting depth; top-level problems are at 0.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn targets(&self) -> &[ElementId] {
        &self.targets
    }

    /// The outcome element of a nested problem.
    pub fn target(&self) -> Option<ElementId> {
        match &self.kind {
            ProblemKind::Nested(origin) => Some(origin.target),
            ProblemKind::Top => None,
        }
    }

    /// Components owned by this problem, in insertion order.
    pub fn components(&self) -> &[ComponentId] {
        &self.components
    }

    pub fn owns(&self, component: ComponentId) -> bool {
        self.owned.contains(&component)
    }

    pub fn is_solved(&self) -> bool {
        self.solution.is_some()
    }

    pub fn solution(&self) -> Option<&[Factor]> {
        self.solution.as_deref()
    }

    pub(crate) fn push_component(&mut self, component: ComponentId) {
        if self.owned.insert(component) {
            self.components.push(component);
        }
    }

    pub(crate) fn set_solution(&mut self, factors: Vec<Factor>) {
        self.solution = Some(factors);
    }
}
