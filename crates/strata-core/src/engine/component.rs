//! Per-element components.
//!
//! A [`ProblemComponent`] wraps one model element inside one problem. It owns
//! the element's current range and the variable minted for it, plus two
//! monotone status flags. Elements with conditional structure carry an
//! [`Expandable`] record, a tagged union over the two closed variants:
//!
//! - **Chain**: one nested problem per parent value
//! - **MakeArray**: array slots added to the array's own problem up to a
//!   high-water mark
//!
//! Components are plain records. All mutation goes through
//! [`ComponentCollection`](crate::engine::collection::ComponentCollection),
//! which keeps the range, the variable and the variable registry in step.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::engine::collection::{ComponentId, ProblemId};
use crate::engine::value_set::ValueSet;
use crate::engine::variable::Variable;
use crate::model::{ElementId, ElementKind, FunctionId, Value};

#[derive(Debug, Clone)]
pub struct ProblemComponent {
    id: ComponentId,
    problem: ProblemId,
    element: ElementId,
    range: Arc<ValueSet>,
    variable: Variable,
    fully_enumerated: bool,
    fully_refined: bool,
    sampled: bool,
    kind: ComponentKind,
}

#[derive(Debug, Clone)]
pub enum ComponentKind {
    Plain,
    Expandable(Expandable),
}

/// State shared by every expandable component.
#[derive(Debug, Clone)]
pub struct Expandable {
    /// Nested problem per parent value. Only grows.
    pub(crate) subproblems: BTreeMap<Value, ProblemId>,
    pub(crate) variant: ExpansionVariant,
}

#[derive(Debug, Clone)]
pub enum ExpansionVariant {
    Chain(ChainExpansion),
    MakeArray(MakeArrayExpansion),
}

#[derive(Debug, Clone)]
pub struct ChainExpansion {
    pub(crate) parent: ElementId,
    pub(crate) function: FunctionId,
    /// Context elements already materialized in some subproblem.
    pub(crate) elements_created: FxHashSet<ElementId>,
    /// Outcome variable of each subproblem as seen from this chain.
    pub(crate) actual_subproblem_variables: BTreeMap<Value, Variable>,
}

#[derive(Debug, Clone)]
pub struct MakeArrayExpansion {
    pub(crate) count: ElementId,
    pub(crate) max_expanded: usize,
}

impl ProblemComponent {
    pub(crate) fn new(
        id: ComponentId,
        problem: ProblemId,
        element: ElementId,
        element_kind: &ElementKind,
        variable: Variable,
    ) -> Self {
        let kind = match element_kind {
            ElementKind::Chain { parent, function } => ComponentKind::Expandable(Expandable {
                subproblems: BTreeMap::new(),
                variant: ExpansionVariant::Chain(ChainExpansion {
                    parent: *parent,
                    function: *function,
                    elements_created: FxHashSet::default(),
                    actual_subproblem_variables: BTreeMap::new(),
                }),
            }),
            ElementKind::MakeArray { count, .. } => ComponentKind::Expandable(Expandable {
                subproblems: BTreeMap::new(),
                variant: ExpansionVariant::MakeArray(MakeArrayExpansion {
                    count: *count,
                    max_expanded: 0,
                }),
            }),
            _ => ComponentKind::Plain,
        };
        Self {
            id,
            problem,
            element,
            range: Arc::clone(variable.domain()),
            variable,
            fully_enumerated: false,
            fully_refined: false,
            sampled: element_kind.is_sampled(),
            kind,
        }
    }

    pub fn id(&self) -> ComponentId {
        self.id
    }

    /// The problem that owns this component.
    pub fn problem(&self) -> ProblemId {
        self.problem
    }

    pub fn element(&self) -> ElementId {
        self.element
    }

    pub fn range(&self) -> &Arc<ValueSet> {
        &self.range
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    pub fn fully_enumerated(&self) -> bool {
        self.fully_enumerated
    }

    pub fn fully_refined(&self) -> bool {
        self.fully_refined
    }

    /// Whether the range comes from sampling a continuous or unbounded support.
    pub fn sampled(&self) -> bool {
        self.sampled
    }

    pub fn kind(&self) -> &ComponentKind {
        &self.kind
    }

    pub fn as_expandable(&self) -> Option<&Expandable> {
        match &self.kind {
            ComponentKind::Expandable(e) => Some(e),
            ComponentKind::Plain => None,
        }
    }

    pub fn is_expandable(&self) -> bool {
        self.as_expandable().is_some()
    }

    /// Nested problems keyed by parent value; empty for plain components.
    pub fn subproblems(&self) -> Option<&BTreeMap<Value, ProblemId>> {
        self.as_expandable().map(|e| &e.subproblems)
    }

    pub fn as_chain(&self) -> Option<&ChainExpansion> {
        match &self.as_expandable()?.variant {
            ExpansionVariant::Chain(c) => Some(c),
            ExpansionVariant::MakeArray(_) => None,
        }
    }

    pub fn as_make_array(&self) -> Option<&MakeArrayExpansion> {
        match &self.as_expandable()?.variant {
            ExpansionVariant::MakeArray(m) => Some(m),
            ExpansionVariant::Chain(_) => None,
        }
    }

    /// Swaps range and variable as one unit.
    pub(crate) fn replace_range(&mut self, range: Arc<ValueSet>, variable: Variable) {
        debug_assert!(
            range.extends(&self.range),
            "range of {:?} shrank from {} to {}",
            self.element,
            self.range,
            range
        );
        debug_assert!(Arc::ptr_eq(&range, variable.domain()) || *range == **variable.domain());
        self.range = range;
        self.variable = variable;
        if !self.range.has_star() {
            self.fully_enumerated = true;
        }
    }

    pub(crate) fn mark_fully_refined(&mut self) {
        debug_assert!(self.fully_enumerated, "refined before enumerated");
        self.fully_refined = true;
    }

    pub(crate) fn expandable_mut(&mut self) -> Option<&mut Expandable> {
        match &mut self.kind {
            ComponentKind::Expandable(e) => Some(e),
            ComponentKind::Plain => None,
        }
    }
}

impl Expandable {
    pub fn subproblems(&self) -> &BTreeMap<Value, ProblemId> {
        &self.subproblems
    }

    pub fn variant(&self) -> &ExpansionVariant {
        &self.variant
    }

    /// The element whose value governs the expansion.
    pub fn governing_parent(&self) -> ElementId {
        match &self.variant {
            ExpansionVariant::Chain(c) => c.parent,
            ExpansionVariant::MakeArray(m) => m.count,
        }
    }
}

impl ChainExpansion {
    pub fn parent(&self) -> ElementId {
        self.parent
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    pub fn elements_created(&self) -> &FxHashSet<ElementId> {
        &self.elements_created
    }

    pub fn actual_subproblem_variables(&self) -> &BTreeMap<Value, Variable> {
        &self.actual_subproblem_variables
    }
}

impl MakeArrayExpansion {
    pub fn count(&self) -> ElementId {
        self.count
    }

    pub fn max_expanded(&self) -> usize {
        self.max_expanded
    }
}
