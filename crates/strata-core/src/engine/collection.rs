//! # Component collection
//!
//! The arena shared by every problem of one decomposition:
//!
//! - **components**: one [`ProblemComponent`] per registered element
//! - **problems**: the top-level problems plus every nested problem created
//!   by chain expansion
//! - **registries**: element -> component and variable -> component
//! - **expansion memo**: `(component, function, parent value)` -> nested
//!   problem, never evicted
//!
//! Every operation takes the collection by reference, so a component's range,
//! its variable and the variable registry are always updated together under
//! one `&mut` borrow.

use std::fmt;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::engine::component::{ExpansionVariant, ProblemComponent};
use crate::engine::errors::StructuredError;
use crate::engine::factor::{Bounds, Factor};
use crate::engine::factory::{FactorFactory, StandardFactory};
use crate::engine::problem::{NestedOrigin, Problem};
use crate::engine::range::{RangeService, StandardRanges};
use crate::engine::value_set::ValueSet;
use crate::engine::variable::{Variable, VariableId};
use crate::model::{ElementId, FunctionId, Model, Value};

/// A unique identifier for a problem within a collection.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProblemId(pub u32);

/// A unique identifier for a component within a collection.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComponentId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExpansionKey {
    component: ComponentId,
    function: FunctionId,
    parent_value: Value,
}

/// Constraint and non-constraint factors of every component a problem owns.
#[derive(Debug, Clone, Default)]
pub struct ProblemFactors {
    pub constraints: Vec<Factor>,
    pub non_constraints: Vec<Factor>,
}

pub struct ComponentCollection {
    problems: Vec<Problem>,
    components: Vec<ProblemComponent>,
    by_element: FxHashMap<ElementId, ComponentId>,
    by_variable: FxHashMap<VariableId, ComponentId>,
    expansions: FxHashMap<ExpansionKey, ProblemId>,
    next_variable: u64,
    ranges: Arc<dyn RangeService>,
    factory: Arc<dyn FactorFactory>,
}

impl fmt::Debug for ComponentCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentCollection")
            .field("problems", &self.problems.len())
            .field("components", &self.components.len())
            .field("expansions", &self.expansions.len())
            .field("variables_minted", &self.next_variable)
            .finish()
    }
}

impl Default for ComponentCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentCollection {
    /// A collection using the standard range and factor rules.
    pub fn new() -> Self {
        Self::with_services(Arc::new(StandardRanges), Arc::new(StandardFactory))
    }

    pub fn with_services(ranges: Arc<dyn RangeService>, factory: Arc<dyn FactorFactory>) -> Self {
        Self {
            problems: Vec::new(),
            components: Vec::new(),
            by_element: FxHashMap::default(),
            by_variable: FxHashMap::default(),
            expansions: FxHashMap::default(),
            next_variable: 0,
            ranges,
            factory,
        }
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Creates a top-level problem and adds `targets` to it.
    pub fn create_problem(
        &mut self,
        model: &Model,
        targets: &[ElementId],
    ) -> Result<ProblemId, StructuredError> {
        for &target in targets {
            model.element(target)?;
        }
        let id = ProblemId(self.problems.len() as u32);
        self.problems.push(Problem::top(id, targets));
        for &target in targets {
            self.add(id, model, target)?;
        }
        Ok(id)
    }

    /// Registers `element` in `problem`, or returns the existing component if
    /// the element is already registered anywhere in the collection.
    pub fn add(
        &mut self,
        problem: ProblemId,
        model: &Model,
        element: ElementId,
    ) -> Result<ComponentId, StructuredError> {
        self.problem(problem)?;
        let kind = model.kind(element)?;
        if let Some(&existing) = self.by_element.get(&element) {
            return Ok(existing);
        }

        let id = ComponentId(self.components.len() as u32);
        let variable = self.mint_variable(Arc::new(ValueSet::star_only()));
        self.by_variable.insert(variable.id(), id);
        self.components
            .push(ProblemComponent::new(id, problem, element, kind, variable));
        self.by_element.insert(element, id);
        self.problems[problem.0 as usize].push_component(id);

        #[cfg(feature = "tracing")]
        tracing::trace!("registered {:?} ({}) in {:?}", element, kind.name(), problem);

        Ok(id)
    }

    pub fn problem(&self, id: ProblemId) -> Result<&Problem, StructuredError> {
        self.problems
            .get(id.0 as usize)
            .ok_or(StructuredError::UnknownProblem(id))
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    pub fn component(&self, id: ComponentId) -> Result<&ProblemComponent, StructuredError> {
        self.components
            .get(id.0 as usize)
            .ok_or(StructuredError::UnknownComponent(id))
    }

    pub fn components(&self) -> &[ProblemComponent] {
        &self.components
    }

    pub fn component_of(&self, element: ElementId) -> Option<ComponentId> {
        self.by_element.get(&element).copied()
    }

    pub fn contains(&self, element: ElementId) -> bool {
        self.by_element.contains_key(&element)
    }

    /// The component a variable was minted for. Variables replaced by a later
    /// range change still resolve.
    pub fn component_for_variable(&self, variable: VariableId) -> Option<ComponentId> {
        self.by_variable.get(&variable).copied()
    }

    /// Current range of `element`, star-only if it is not registered.
    pub fn range_of(&self, element: ElementId) -> Arc<ValueSet> {
        match self.by_element.get(&element) {
            Some(&c) => Arc::clone(self.components[c.0 as usize].range()),
            None => Arc::new(ValueSet::star_only()),
        }
    }

    pub fn variable_of(&self, element: ElementId) -> Option<&Variable> {
        self.by_element
            .get(&element)
            .map(|&c| self.components[c.0 as usize].variable())
    }

    /// True if `component` is reachable from `problem` but owned elsewhere.
    pub fn is_global(
        &self,
        problem: ProblemId,
        component: ComponentId,
    ) -> Result<bool, StructuredError> {
        self.problem(problem)?;
        Ok(self.component(component)?.problem() != problem)
    }

    /// Records the solver's result for `problem`.
    pub fn record_solution(
        &mut self,
        problem: ProblemId,
        factors: Vec<Factor>,
    ) -> Result<(), StructuredError> {
        self.problem(problem)?;
        self.problems[problem.0 as usize].set_solution(factors);
        Ok(())
    }

    fn mint_variable(&mut self, domain: Arc<ValueSet>) -> Variable {
        let id = VariableId(self.next_variable);
        self.next_variable += 1;
        Variable::new(id, domain)
    }

    // ------------------------------------------------------------------
    // Ranges
    // ------------------------------------------------------------------

    /// Recomputes the range of `component`.
    ///
    /// Returns whether the range changed. A change swaps range and variable
    /// together; an unchanged candidate leaves the current variable in place.
    /// For chains the outcome variable of every subproblem is refreshed
    /// afterwards.
    pub fn generate_range(
        &mut self,
        component: ComponentId,
        model: &Model,
        sample_budget: usize,
    ) -> Result<bool, StructuredError> {
        let current = self.component(component)?;
        let mut changed = false;

        if !current.fully_enumerated() {
            let ranges = Arc::clone(&self.ranges);
            let candidate = ranges.range(self, model, component, sample_budget)?;
            let current = &self.components[component.0 as usize];
            let next = current.range().grown_by(&candidate);

            if next != **current.range() {
                let range = Arc::new(next);
                let variable = self.mint_variable(Arc::clone(&range));
                self.by_variable.insert(variable.id(), component);

                let comp = &mut self.components[component.0 as usize];
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "range of {:?} grew from {} to {}",
                    comp.element(),
                    comp.range(),
                    range
                );
                comp.replace_range(range, variable);
                changed = true;
            }
        }

        if self.components[component.0 as usize].as_chain().is_some() {
            self.refresh_actual_variables(component)?;
        }
        Ok(changed)
    }

    /// Points each chain subproblem at the variable its outcome has from the
    /// chain's side: the outer variable itself for a global target, a private
    /// variable with the same domain otherwise.
    fn refresh_actual_variables(&mut self, component: ComponentId) -> Result<(), StructuredError> {
        let comp = self.component(component)?;
        let (Some(subproblems), Some(chain)) = (comp.subproblems(), comp.as_chain()) else {
            return Ok(());
        };

        let mut pending = Vec::with_capacity(subproblems.len());
        for (parent_value, &subproblem) in subproblems {
            let Some(target) = self.problem(subproblem)?.target() else {
                continue;
            };
            let Some(target_component) = self.component_of(target) else {
                continue;
            };
            let target_comp = &self.components[target_component.0 as usize];
            let formal = target_comp.variable().clone();
            let global = target_comp.problem() != subproblem;
            let previous = chain.actual_subproblem_variables.get(parent_value).cloned();
            pending.push((parent_value.clone(), formal, global, previous));
        }

        let mut refreshed = Vec::with_capacity(pending.len());
        for (parent_value, formal, global, previous) in pending {
            let actual = if global {
                formal
            } else {
                match previous {
                    Some(prev) if prev != formal && **prev.domain() == **formal.domain() => prev,
                    _ => {
                        let private = self.mint_variable(Arc::clone(formal.domain()));
                        self.by_variable.insert(private.id(), component);
                        private
                    }
                }
            };
            refreshed.push((parent_value, actual));
        }

        if let Some(ExpansionVariant::Chain(chain)) = self.components[component.0 as usize]
            .expandable_mut()
            .map(|e| &mut e.variant)
        {
            chain.actual_subproblem_variables.extend(refreshed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------

    /// Expands `component` against the current range of its governing parent.
    ///
    /// For a chain, creates a subproblem for every regular parent value that
    /// has none yet and returns how many were created. For an array, grows the
    /// slots to the largest count and returns how many slots were added. If
    /// the parent is not registered nothing happens.
    pub fn expand(&mut self, component: ComponentId, model: &mut Model) -> Result<usize, StructuredError> {
        let comp = self.component(component)?;
        let expandable = comp
            .as_expandable()
            .ok_or(StructuredError::NotExpandable(comp.element()))?;
        let Some(parent) = self.component_of(expandable.governing_parent()) else {
            return Ok(0);
        };
        let parent_range = Arc::clone(self.components[parent.0 as usize].range());

        let is_array = matches!(expandable.variant(), ExpansionVariant::MakeArray(_));
        if is_array {
            return match parent_range.max_int() {
                Some(n) => self.expand_array(component, model, n),
                None => Ok(0),
            };
        }

        let fresh: Vec<Value> = parent_range
            .regular_values()
            .iter()
            .filter(|v| !expandable.subproblems().contains_key(*v))
            .cloned()
            .collect();
        for value in &fresh {
            self.expand_chain_value(component, model, value)?;
        }
        debug_assert!(
            self.components[component.0 as usize]
                .subproblems()
                .map_or(true, |subs| subs.keys().all(|k| parent_range.contains(k))),
            "subproblem key outside the parent range"
        );
        Ok(fresh.len())
    }

    /// Expands `component` for one parent value.
    ///
    /// A chain value must be in the parent's current range; repeating a value
    /// is a no-op. For an array the value is the slot count.
    pub fn expand_value(
        &mut self,
        component: ComponentId,
        model: &mut Model,
        value: &Value,
    ) -> Result<(), StructuredError> {
        let comp = self.component(component)?;
        let expandable = comp
            .as_expandable()
            .ok_or(StructuredError::NotExpandable(comp.element()))?;

        match expandable.variant() {
            ExpansionVariant::Chain(chain) => {
                if expandable.subproblems().contains_key(value) {
                    return Ok(());
                }
                if !self.range_of(chain.parent()).contains(value) {
                    return Err(StructuredError::InvalidExpansion(format!(
                        "{} is not in the current range of parent {:?}",
                        value,
                        chain.parent()
                    )));
                }
                self.expand_chain_value(component, model, value)
            }
            ExpansionVariant::MakeArray(_) => {
                let n = value.as_int().ok_or_else(|| {
                    StructuredError::InvalidExpansion(format!("array count {} is not an integer", value))
                })?;
                self.expand_array(component, model, n).map(|_| ())
            }
        }
    }

    fn expand_chain_value(
        &mut self,
        component: ComponentId,
        model: &mut Model,
        value: &Value,
    ) -> Result<(), StructuredError> {
        let comp = self.component(component)?;
        let element = comp.element();
        let chain = comp
            .as_chain()
            .ok_or(StructuredError::NotExpandable(element))?;
        let function = chain.function();

        let subproblem = self.expansion(component, function, value, model)?;

        let created = self.components[component.0 as usize]
            .as_chain()
            .map(|c| c.elements_created().clone())
            .unwrap_or_default();
        let new_elements: Vec<ElementId> = model
            .context_contents(element)
            .iter()
            .copied()
            .filter(|e| !created.contains(e))
            .collect();
        for &e in &new_elements {
            self.add(subproblem, model, e)?;
        }

        if let Some(expandable) = self.components[component.0 as usize].expandable_mut() {
            expandable.subproblems.insert(value.clone(), subproblem);
            if let ExpansionVariant::Chain(chain) = &mut expandable.variant {
                chain.elements_created.extend(new_elements);
            }
        }
        Ok(())
    }

    /// The nested problem for `(component, function, value)`, created on the
    /// first request. Later requests with the same key return the same
    /// problem.
    ///
    /// `function` must be the chain's own selector and `value` must be in the
    /// parent's current range. A target declared outside the chain's lexical
    /// context is registered in the chain's own problem first, so every branch
    /// that selects it sees it as a global.
    pub fn expansion(
        &mut self,
        component: ComponentId,
        function: FunctionId,
        value: &Value,
        model: &mut Model,
    ) -> Result<ProblemId, StructuredError> {
        let key = ExpansionKey {
            component,
            function,
            parent_value: value.clone(),
        };
        if let Some(&existing) = self.expansions.get(&key) {
            return Ok(existing);
        }

        let comp = self.component(component)?;
        let element = comp.element();
        let owner = comp.problem();
        let chain = comp
            .as_chain()
            .ok_or(StructuredError::NotExpandable(element))?;
        if chain.function() != function {
            return Err(StructuredError::InvalidExpansion(format!(
                "{:?} selects with {:?}, not {:?}",
                element,
                chain.function(),
                function
            )));
        }
        let parent = chain.parent();
        if !self.range_of(parent).contains(value) {
            return Err(StructuredError::InvalidExpansion(format!(
                "{} is not in the current range of parent {:?}",
                value, parent
            )));
        }
        let depth = self.problem(owner)?.depth() + 1;
        let target = model.resolve_chain(element, value)?;
        if model.element(target)?.context != Some(element) {
            self.add(owner, model, target)?;
        }

        let id = ProblemId(self.problems.len() as u32);
        let origin = NestedOrigin {
            owner: component,
            function,
            parent_value: value.clone(),
            target,
        };
        self.problems.push(Problem::nested(id, origin, depth));
        self.expansions.insert(key, id);
        self.add(id, model, target)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "expanded {:?} for {} into {:?} (depth {}, target {:?})",
            element,
            value,
            id,
            depth,
            target
        );

        Ok(id)
    }

    /// Grows an array to `n` slots. Slots live in the array's own problem.
    /// Returns the number of slot components added.
    pub fn expand_array(
        &mut self,
        component: ComponentId,
        model: &mut Model,
        n: i64,
    ) -> Result<usize, StructuredError> {
        let comp = self.component(component)?;
        let element = comp.element();
        let problem = comp.problem();
        let start = comp
            .as_make_array()
            .ok_or(StructuredError::NotExpandable(element))?
            .max_expanded();
        if n < 0 {
            return Err(StructuredError::UnsupportedConstruct(format!(
                "array {:?} has negative length {}",
                element, n
            )));
        }
        let n = n as usize;

        let mut added = 0;
        for index in start..n {
            let slot = model.array_item(element, index)?;
            if !self.contains(slot) {
                self.add(problem, model, slot)?;
                added += 1;
            }
        }

        if let Some(ExpansionVariant::MakeArray(array)) = self.components[component.0 as usize]
            .expandable_mut()
            .map(|e| &mut e.variant)
        {
            array.max_expanded = array.max_expanded.max(n);
        }

        #[cfg(feature = "tracing")]
        if added > 0 {
            tracing::debug!("array {:?} grew by {} slots to {}", element, added, n);
        }

        Ok(added)
    }

    // ------------------------------------------------------------------
    // Factors
    // ------------------------------------------------------------------

    pub fn constraint_factors(
        &self,
        component: ComponentId,
        model: &Model,
        bounds: Bounds,
    ) -> Result<Vec<Factor>, StructuredError> {
        self.factory
            .constraint_factors(self, model, component, bounds)
    }

    pub fn non_constraint_factors(
        &self,
        component: ComponentId,
        model: &Model,
        parameterized: bool,
    ) -> Result<Vec<Factor>, StructuredError> {
        self.factory
            .non_constraint_factors(self, model, component, parameterized)
    }

    /// Factors of every component owned by `problem`, in component order.
    pub fn problem_factors(
        &self,
        problem: ProblemId,
        model: &Model,
        bounds: Bounds,
        parameterized: bool,
    ) -> Result<ProblemFactors, StructuredError> {
        let components = self.problem(problem)?.components();

        #[cfg(feature = "parallel")]
        let per_component: Vec<_> = components
            .par_iter()
            .map(|&c| self.component_factors(c, model, bounds, parameterized))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let per_component: Vec<_> = components
            .iter()
            .map(|&c| self.component_factors(c, model, bounds, parameterized))
            .collect();

        let mut out = ProblemFactors::default();
        for result in per_component {
            let (constraints, non_constraints) = result?;
            out.constraints.extend(constraints);
            out.non_constraints.extend(non_constraints);
        }
        Ok(out)
    }

    fn component_factors(
        &self,
        component: ComponentId,
        model: &Model,
        bounds: Bounds,
        parameterized: bool,
    ) -> Result<(Vec<Factor>, Vec<Factor>), StructuredError> {
        Ok((
            self.constraint_factors(component, model, bounds)?,
            self.non_constraint_factors(component, model, parameterized)?,
        ))
    }

    /// The solution of a chain subproblem rewritten over the chain's outcome
    /// variable for `value`.
    pub fn raised_subproblem_factors(
        &self,
        component: ComponentId,
        value: &Value,
    ) -> Result<Vec<Factor>, StructuredError> {
        let comp = self.component(component)?;
        let chain = comp
            .as_chain()
            .ok_or(StructuredError::NotExpandable(comp.element()))?;
        let subproblem = comp
            .subproblems()
            .and_then(|subs| subs.get(value))
            .copied()
            .ok_or_else(|| {
                StructuredError::InvalidExpansion(format!(
                    "{:?} has no subproblem for {}",
                    comp.element(),
                    value
                ))
            })?;
        let problem = self.problem(subproblem)?;
        let solution = problem.solution().ok_or_else(|| {
            StructuredError::InvalidExpansion(format!("subproblem {:?} is not solved", subproblem))
        })?;
        let actual = chain.actual_subproblem_variables().get(value).ok_or_else(|| {
            StructuredError::InvalidExpansion(format!(
                "range of {:?} not generated since expanding {}",
                comp.element(),
                value
            ))
        })?;
        let formal = problem
            .target()
            .and_then(|t| self.variable_of(t))
            .ok_or_else(|| {
                StructuredError::Internal(format!("subproblem {:?} has no registered target", subproblem))
            })?;

        Ok(solution
            .iter()
            .map(|f| f.substitute(formal, actual))
            .collect())
    }

    /// Whether every subproblem of `component` was solved into factors that
    /// mention only its own components, with a target it owns. Callers use it
    /// to fold subproblem solutions directly instead of raising them.
    pub fn all_subproblems_eliminated_completely(
        &self,
        component: ComponentId,
    ) -> Result<bool, StructuredError> {
        let comp = self.component(component)?;
        let subproblems = comp
            .subproblems()
            .ok_or(StructuredError::NotExpandable(comp.element()))?;

        for &subproblem in subproblems.values() {
            let problem = self.problem(subproblem)?;
            let Some(solution) = problem.solution() else {
                return Ok(false);
            };
            let target_owned = problem
                .target()
                .and_then(|t| self.component_of(t))
                .map_or(false, |c| problem.owns(c));
            if !target_owned {
                return Ok(false);
            }
            let self_contained = solution.iter().all(|factor| {
                factor.variables().iter().all(|v| {
                    self.component_for_variable(v.id())
                        .map_or(false, |c| problem.owns(c))
                })
            });
            if !self_contained {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Refinement status
    // ------------------------------------------------------------------

    /// Sets the fully-refined flag of `component` if it now qualifies.
    /// Returns whether the flag was newly set.
    pub fn refresh_refinement(
        &mut self,
        component: ComponentId,
        model: &Model,
    ) -> Result<bool, StructuredError> {
        let comp = self.component(component)?;
        if comp.fully_refined() {
            return Ok(false);
        }
        if !comp.fully_enumerated() || comp.sampled() {
            return Ok(false);
        }
        for dep in model.dependencies(comp.element())? {
            if !self.is_refined(dep) {
                return Ok(false);
            }
        }

        let ready = match comp.as_expandable().map(|e| (e, e.variant())) {
            None => true,
            Some((expandable, ExpansionVariant::Chain(chain))) => {
                let parent_range = self.range_of(chain.parent());
                parent_range.regular_values().iter().all(|v| {
                    expandable
                        .subproblems()
                        .get(v)
                        .map_or(false, |&sp| self.subproblem_refined(sp))
                })
            }
            Some((_, ExpansionVariant::MakeArray(array))) => {
                let n = self
                    .range_of(array.count())
                    .max_int()
                    .unwrap_or(0)
                    .max(0) as usize;
                array.max_expanded() >= n
                    && (0..n).all(|i| {
                        model
                            .existing_array_item(comp.element(), i)
                            .map_or(false, |slot| self.is_refined(slot))
                    })
            }
        };

        if ready {
            self.components[component.0 as usize].mark_fully_refined();
        }
        Ok(ready)
    }

    /// Whether every component `problem` owns is fully refined.
    pub fn problem_fully_refined(&self, problem: ProblemId) -> Result<bool, StructuredError> {
        let problem = self.problem(problem)?;
        Ok(problem
            .components()
            .iter()
            .all(|&c| self.components[c.0 as usize].fully_refined()))
    }

    fn is_refined(&self, element: ElementId) -> bool {
        self.component_of(element)
            .map_or(false, |c| self.components[c.0 as usize].fully_refined())
    }

    fn subproblem_refined(&self, subproblem: ProblemId) -> bool {
        let Ok(problem) = self.problem(subproblem) else {
            return false;
        };
        problem.target().map_or(false, |t| self.is_refined(t))
            && problem
                .components()
                .iter()
                .all(|&c| self.components[c.0 as usize].fully_refined())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::value_set::Extended;

    const BUDGET: usize = 4;

    fn range_all(collection: &mut ComponentCollection, model: &Model, problem: ProblemId) {
        let ids = collection.problem(problem).unwrap().components().to_vec();
        for c in ids {
            collection.generate_range(c, model, BUDGET).unwrap();
        }
    }

    #[test]
    fn new_component_starts_star_only() {
        let mut model = Model::new();
        let x = model.flip(0.5).unwrap();
        let mut collection = ComponentCollection::new();
        collection.create_problem(&model, &[x]).unwrap();
        let comp = collection.component(collection.component_of(x).unwrap()).unwrap();
        assert_eq!(**comp.range(), ValueSet::star_only());
        assert!(!comp.fully_enumerated());
        assert!(!comp.fully_refined());
    }

    #[test]
    fn range_change_swaps_variable_and_registry() {
        let mut model = Model::new();
        let x = model.flip(0.5).unwrap();
        let mut collection = ComponentCollection::new();
        collection.create_problem(&model, &[x]).unwrap();
        let c = collection.component_of(x).unwrap();
        let before = collection.component(c).unwrap().variable().clone();

        assert!(collection.generate_range(c, &model, BUDGET).unwrap());
        let comp = collection.component(c).unwrap();
        assert_ne!(comp.variable(), &before);
        assert_eq!(**comp.variable().domain(), **comp.range());
        assert!(comp.fully_enumerated());
        assert_eq!(collection.component_for_variable(comp.variable().id()), Some(c));
        assert_eq!(collection.component_for_variable(before.id()), Some(c));
    }

    #[test]
    fn unchanged_range_keeps_variable() {
        let mut model = Model::new();
        let g = model.geometric(0.3).unwrap();
        let mut collection = ComponentCollection::new();
        collection.create_problem(&model, &[g]).unwrap();
        let c = collection.component_of(g).unwrap();

        collection.generate_range(c, &model, BUDGET).unwrap();
        let var = collection.component(c).unwrap().variable().clone();
        assert!(!collection.generate_range(c, &model, BUDGET).unwrap());
        assert_eq!(collection.component(c).unwrap().variable(), &var);
    }

    #[test]
    fn smaller_budget_never_drops_values() {
        let mut model = Model::new();
        let g = model.geometric(0.3).unwrap();
        let mut collection = ComponentCollection::new();
        collection.create_problem(&model, &[g]).unwrap();
        let c = collection.component_of(g).unwrap();

        collection.generate_range(c, &model, 5).unwrap();
        let var = collection.component(c).unwrap().variable().clone();
        assert!(!collection.generate_range(c, &model, 2).unwrap());
        assert_eq!(collection.component(c).unwrap().variable(), &var);
        assert_eq!(collection.component(c).unwrap().range().len(), 5);
    }

    #[test]
    fn unsupported_construct_propagates() {
        let mut model = Model::new();
        let b = model.beta(1.0, 1.0).unwrap();
        let mut collection = ComponentCollection::new();
        collection.create_problem(&model, &[b]).unwrap();
        let c = collection.component_of(b).unwrap();
        let err = collection.generate_range(c, &model, 0).unwrap_err();
        assert!(matches!(err, StructuredError::UnsupportedConstruct(_)));
        assert_eq!(**collection.component(c).unwrap().range(), ValueSet::star_only());
    }

    #[test]
    fn add_is_idempotent_and_first_owner_wins() {
        let mut model = Model::new();
        let x = model.flip(0.5).unwrap();
        let mut collection = ComponentCollection::new();
        let p1 = collection.create_problem(&model, &[x]).unwrap();
        let p2 = collection.create_problem(&model, &[]).unwrap();
        let c1 = collection.component_of(x).unwrap();
        let c2 = collection.add(p2, &model, x).unwrap();
        assert_eq!(c1, c2);
        assert!(!collection.is_global(p1, c1).unwrap());
        assert!(collection.is_global(p2, c1).unwrap());
        assert!(collection.problem(p2).unwrap().components().is_empty());
    }

    #[test]
    fn plain_component_is_not_expandable() {
        let mut model = Model::new();
        let x = model.flip(0.5).unwrap();
        let mut collection = ComponentCollection::new();
        collection.create_problem(&model, &[x]).unwrap();
        let c = collection.component_of(x).unwrap();
        assert!(matches!(
            collection.expand(c, &mut model),
            Err(StructuredError::NotExpandable(e)) if e == x
        ));
    }

    #[test]
    fn chain_value_outside_parent_range_is_rejected() {
        let mut model = Model::new();
        let parent = model.flip(0.5).unwrap();
        let chain = model.chain_fn(parent, |v, m| m.constant(v.clone())).unwrap();
        let mut collection = ComponentCollection::new();
        let problem = collection.create_problem(&model, &[parent, chain]).unwrap();
        range_all(&mut collection, &model, problem);
        let c = collection.component_of(chain).unwrap();

        let err = collection
            .expand_value(c, &mut model, &Value::Int(3))
            .unwrap_err();
        assert!(matches!(err, StructuredError::InvalidExpansion(_)));
        collection.expand_value(c, &mut model, &Value::Bool(true)).unwrap();
        assert_eq!(collection.component(c).unwrap().subproblems().unwrap().len(), 1);
    }

    #[test]
    fn chain_range_covers_expanded_outcomes() {
        let mut model = Model::new();
        let parent = model.flip(0.5).unwrap();
        let chain = model
            .chain_fn(parent, |v, m| match v.as_bool() {
                Some(true) => m.constant(1i64),
                _ => m.uniform_int(2, 3).unwrap(),
            })
            .unwrap();
        let mut collection = ComponentCollection::new();
        let problem = collection.create_problem(&model, &[parent, chain]).unwrap();
        range_all(&mut collection, &model, problem);
        let c = collection.component_of(chain).unwrap();
        assert!(collection.component(c).unwrap().range().has_star());

        assert_eq!(collection.expand(c, &mut model).unwrap(), 2);
        let sps: Vec<ProblemId> = collection.component(c).unwrap().subproblems().unwrap().values().copied().collect();
        for sp in sps {
            range_all(&mut collection, &model, sp);
        }
        collection.generate_range(c, &model, BUDGET).unwrap();

        let range = collection.component(c).unwrap().range();
        assert!(!range.has_star());
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn chain_selector_factors_tie_outcome_to_chain() {
        let mut model = Model::new();
        let parent = model.flip(0.5).unwrap();
        let chain = model
            .chain_fn(parent, |v, m| match v.as_bool() {
                Some(true) => m.constant(1i64),
                _ => m.constant(2i64),
            })
            .unwrap();
        let mut collection = ComponentCollection::new();
        let problem = collection.create_problem(&model, &[parent, chain]).unwrap();
        range_all(&mut collection, &model, problem);
        let c = collection.component_of(chain).unwrap();
        collection.expand(c, &mut model).unwrap();
        let sps: Vec<ProblemId> = collection.component(c).unwrap().subproblems().unwrap().values().copied().collect();
        for sp in sps {
            range_all(&mut collection, &model, sp);
        }
        collection.generate_range(c, &model, BUDGET).unwrap();

        let factors = collection.non_constraint_factors(c, &model, false).unwrap();
        assert_eq!(factors.len(), 2);
        let t = Extended::Regular(Value::Bool(true));
        let one = Extended::Regular(Value::Int(1));
        let two = Extended::Regular(Value::Int(2));
        let when_true = &factors[1];
        assert_eq!(when_true.variables().len(), 3);
        assert_eq!(when_true.weight(&[t.clone(), one.clone(), one.clone()]), 1.0);
        assert_eq!(when_true.weight(&[t, one.clone(), two]), 0.0);
    }

    #[test]
    fn problem_factors_cover_owned_components() {
        let mut model = Model::new();
        let x = model.flip(0.5).unwrap();
        let y = model.apply(&[x], |vs| vs[0].clone());
        model.condition(y, |v| v.as_bool() == Some(true)).unwrap();
        let mut collection = ComponentCollection::new();
        let problem = collection.create_problem(&model, &[x, y]).unwrap();
        range_all(&mut collection, &model, problem);

        let factors = collection
            .problem_factors(problem, &model, Bounds::Lower, false)
            .unwrap();
        assert_eq!(factors.constraints.len(), 1);
        assert_eq!(factors.non_constraints.len(), 2);
    }

    fn expanded_chain(
        model: &mut Model,
        select: impl Fn(&Value, &mut Model) -> ElementId + Send + Sync + 'static,
        extra: &[ElementId],
    ) -> (ComponentCollection, ProblemId, ComponentId) {
        let parent = model.flip(0.5).unwrap();
        let chain = model.chain_fn(parent, select).unwrap();
        let mut targets = vec![parent];
        targets.extend_from_slice(extra);
        targets.push(chain);
        let mut collection = ComponentCollection::new();
        let problem = collection.create_problem(model, &targets).unwrap();
        range_all(&mut collection, model, problem);
        let c = collection.component_of(chain).unwrap();
        collection.expand(c, model).unwrap();
        let subs: Vec<_> = collection
            .component(c)
            .unwrap()
            .subproblems()
            .unwrap()
            .values()
            .copied()
            .collect();
        for sp in subs {
            range_all(&mut collection, model, sp);
        }
        collection.generate_range(c, model, BUDGET).unwrap();
        (collection, problem, c)
    }

    #[test]
    fn expand_twice_is_idempotent() {
        let mut model = Model::new();
        let (mut collection, _, c) = expanded_chain(&mut model, |v, m| m.constant(v.clone()), &[]);
        let before = collection.component(c).unwrap().subproblems().unwrap().clone();
        let problems = collection.problems().len();

        assert_eq!(collection.expand(c, &mut model).unwrap(), 0);
        assert_eq!(collection.component(c).unwrap().subproblems().unwrap(), &before);
        assert_eq!(collection.problems().len(), problems);
    }

    #[test]
    fn expansion_is_memoized_per_parent_value() {
        let mut model = Model::new();
        let (mut collection, problem, c) =
            expanded_chain(&mut model, |v, m| m.constant(v.clone()), &[]);
        let function = collection.component(c).unwrap().as_chain().unwrap().function();

        let t1 = collection.expansion(c, function, &Value::Bool(true), &mut model).unwrap();
        let t2 = collection.expansion(c, function, &Value::Bool(true), &mut model).unwrap();
        let f = collection.expansion(c, function, &Value::Bool(false), &mut model).unwrap();
        assert_eq!(t1, t2);
        assert_ne!(t1, f);
        assert_eq!(collection.component(c).unwrap().subproblems().unwrap()[&Value::Bool(true)], t1);
        assert_eq!(collection.problem(t1).unwrap().depth(), collection.problem(problem).unwrap().depth() + 1);
    }

    #[test]
    fn global_target_shares_outer_variable() {
        let mut model = Model::new();
        let shared = model.uniform_int(1, 2).unwrap();
        let (collection, problem, c) = expanded_chain(&mut model, move |_, _| shared, &[shared]);

        let outer = collection.variable_of(shared).unwrap();
        let chain = collection.component(c).unwrap().as_chain().unwrap();
        assert_eq!(chain.actual_subproblem_variables().len(), 2);
        for actual in chain.actual_subproblem_variables().values() {
            assert_eq!(actual, outer);
        }
        let sc = collection.component_of(shared).unwrap();
        assert!(!collection.is_global(problem, sc).unwrap());
        let sps: Vec<ProblemId> = collection.component(c).unwrap().subproblems().unwrap().values().copied().collect();
        for sp in sps {
            assert!(collection.is_global(sp, sc).unwrap());
        }
    }

    #[test]
    fn local_target_gets_private_variable() {
        let mut model = Model::new();
        let (mut collection, _, c) = expanded_chain(&mut model, |v, m| m.constant(v.clone()), &[]);
        let comp = collection.component(c).unwrap();
        let chain = comp.as_chain().unwrap();
        let mut privates = Vec::new();
        for (value, &sp) in comp.subproblems().unwrap() {
            let target = collection.problem(sp).unwrap().target().unwrap();
            let formal = collection.variable_of(target).unwrap();
            let actual = &chain.actual_subproblem_variables()[value];
            assert_ne!(actual, formal);
            assert_eq!(**actual.domain(), **formal.domain());
            privates.push(actual.clone());
        }

        collection.generate_range(c, &model, BUDGET).unwrap();
        let chain = collection.component(c).unwrap().as_chain().unwrap();
        let again: Vec<_> = chain.actual_subproblem_variables().values().cloned().collect();
        assert_eq!(again, privates);
    }

    #[test]
    fn target_declared_outside_chain_is_global_in_every_branch() {
        let mut model = Model::new();
        let shared = model.uniform_int(1, 2).unwrap();
        let (collection, problem, c) = expanded_chain(&mut model, move |_, _| shared, &[]);

        let sc = collection.component_of(shared).unwrap();
        assert_eq!(collection.component(sc).unwrap().problem(), problem);
        let outer = collection.variable_of(shared).unwrap();
        let chain = collection.component(c).unwrap().as_chain().unwrap();
        assert_eq!(chain.actual_subproblem_variables().len(), 2);
        for actual in chain.actual_subproblem_variables().values() {
            assert_eq!(actual, outer);
        }
    }

    #[test]
    fn private_outcome_variables_map_back_to_chain() {
        let mut model = Model::new();
        let (collection, _, c) = expanded_chain(&mut model, |v, m| m.constant(v.clone()), &[]);
        let chain = collection.component(c).unwrap().as_chain().unwrap();
        for actual in chain.actual_subproblem_variables().values() {
            assert_eq!(collection.component_for_variable(actual.id()), Some(c));
        }
    }

    #[test]
    fn expansion_rejects_foreign_function_and_unreachable_value() {
        let mut model = Model::new();
        let (mut collection, _, c) = expanded_chain(&mut model, |v, m| m.constant(v.clone()), &[]);
        let function = collection.component(c).unwrap().as_chain().unwrap().function();
        let problems = collection.problems().len();

        let err = collection
            .expansion(c, FunctionId(77), &Value::Bool(true), &mut model)
            .unwrap_err();
        assert!(matches!(err, StructuredError::InvalidExpansion(_)));
        let err = collection
            .expansion(c, function, &Value::Int(42), &mut model)
            .unwrap_err();
        assert!(matches!(err, StructuredError::InvalidExpansion(_)));

        assert_eq!(collection.problems().len(), problems);
        assert_eq!(collection.component(c).unwrap().subproblems().unwrap().len(), 2);
    }

    #[test]
    fn context_elements_land_in_their_own_subproblem_once() {
        let mut model = Model::new();
        let parent = model.flip(0.5).unwrap();
        let chain = model
            .chain_fn(parent, |_, m| {
                let noise = m.flip(0.5).unwrap();
                m.apply(&[noise], |vs| vs[0].clone())
            })
            .unwrap();
        let mut collection = ComponentCollection::new();
        let problem = collection.create_problem(&model, &[parent, chain]).unwrap();
        range_all(&mut collection, &model, problem);
        let c = collection.component_of(chain).unwrap();
        let created = |collection: &ComponentCollection| {
            collection.component(c).unwrap().as_chain().unwrap().elements_created().len()
        };

        collection.expand_value(c, &mut model, &Value::Bool(false)).unwrap();
        let f = collection.component(c).unwrap().subproblems().unwrap()[&Value::Bool(false)];
        assert_eq!(collection.problem(f).unwrap().components().len(), 2);
        assert_eq!(created(&collection), 2);

        collection.expand_value(c, &mut model, &Value::Bool(true)).unwrap();
        let t = collection.component(c).unwrap().subproblems().unwrap()[&Value::Bool(true)];
        assert_eq!(collection.problem(t).unwrap().components().len(), 2);
        assert_eq!(collection.problem(f).unwrap().components().len(), 2);
        assert_eq!(created(&collection), 4);

        let contents = model.context_contents(chain).to_vec();
        assert_eq!(contents.len(), 4);
        for (i, e) in contents.iter().enumerate() {
            let owner = collection.component(collection.component_of(*e).unwrap()).unwrap().problem();
            assert_eq!(owner, if i < 2 { f } else { t });
        }

        assert_eq!(collection.expand(c, &mut model).unwrap(), 0);
        assert_eq!(created(&collection), 4);
        assert_eq!(collection.problem(problem).unwrap().components().len(), 2);
    }

    #[test]
    fn raised_factors_use_the_actual_variable() {
        let mut model = Model::new();
        let (mut collection, _, c) = expanded_chain(&mut model, |v, m| m.constant(v.clone()), &[]);
        let value = Value::Bool(true);
        let sp = collection.component(c).unwrap().subproblems().unwrap()[&value];
        let target = collection.problem(sp).unwrap().target().unwrap();
        let formal = collection.variable_of(target).unwrap().clone();
        let mut solution = Factor::new(vec![formal.clone()]);
        solution.push_row([Extended::Regular(value.clone())], 1.0);
        collection.record_solution(sp, vec![solution]).unwrap();

        let raised = collection.raised_subproblem_factors(c, &value).unwrap();
        let actual = &collection.component(c).unwrap().as_chain().unwrap().actual_subproblem_variables()[&value];
        assert_eq!(raised[0].variables(), &[actual.clone()]);
        assert!(!raised[0].contains_variable(formal.id()));
    }

    #[test]
    fn elimination_requires_solved_self_contained_subproblems() {
        let mut model = Model::new();
        let (mut collection, _, c) = expanded_chain(&mut model, |v, m| m.constant(v.clone()), &[]);
        assert!(!collection.all_subproblems_eliminated_completely(c).unwrap());

        let parent = collection.component(c).unwrap().as_chain().unwrap().parent();
        let outside = collection.variable_of(parent).unwrap().clone();
        let subs: Vec<_> = collection.component(c).unwrap().subproblems().unwrap().values().copied().collect();
        for &sp in &subs {
            let target = collection.problem(sp).unwrap().target().unwrap();
            let formal = collection.variable_of(target).unwrap().clone();
            collection
                .record_solution(sp, vec![Factor::new(vec![formal, outside.clone()])])
                .unwrap();
        }
        assert!(!collection.all_subproblems_eliminated_completely(c).unwrap());

        for &sp in &subs {
            let target = collection.problem(sp).unwrap().target().unwrap();
            let formal = collection.variable_of(target).unwrap().clone();
            collection.record_solution(sp, vec![Factor::new(vec![formal])]).unwrap();
        }
        assert!(collection.all_subproblems_eliminated_completely(c).unwrap());
    }

    #[test]
    fn elimination_rejects_global_target() {
        let mut model = Model::new();
        let shared = model.uniform_int(1, 2).unwrap();
        let (mut collection, _, c) = expanded_chain(&mut model, move |_, _| shared, &[shared]);
        let subs: Vec<_> = collection.component(c).unwrap().subproblems().unwrap().values().copied().collect();
        for sp in subs {
            collection.record_solution(sp, Vec::new()).unwrap();
        }
        assert!(!collection.all_subproblems_eliminated_completely(c).unwrap());
    }

    #[test]
    fn array_high_water_mark_never_shrinks() {
        let mut model = Model::new();
        let count = model.uniform_int(0, 7).unwrap();
        let array = model.make_array(count, |i, m| m.constant(i as i64)).unwrap();
        let mut collection = ComponentCollection::new();
        let problem = collection.create_problem(&model, &[count, array]).unwrap();
        let c = collection.component_of(array).unwrap();

        assert_eq!(collection.expand_array(c, &mut model, 5).unwrap(), 5);
        assert_eq!(collection.expand_array(c, &mut model, 3).unwrap(), 0);
        assert_eq!(collection.component(c).unwrap().as_make_array().unwrap().max_expanded(), 5);
        assert_eq!(collection.problem(problem).unwrap().components().len(), 7);

        // count not ranged yet: nothing is forced
        assert_eq!(collection.expand(c, &mut model).unwrap(), 0);

        let cc = collection.component_of(count).unwrap();
        collection.generate_range(cc, &model, BUDGET).unwrap();
        assert_eq!(collection.expand(c, &mut model).unwrap(), 2);
        assert_eq!(collection.expand(c, &mut model).unwrap(), 0);
        assert_eq!(collection.component(c).unwrap().as_make_array().unwrap().max_expanded(), 7);
        assert_eq!(collection.problem(problem).unwrap().components().len(), 9);
        assert!(collection.component(c).unwrap().subproblems().unwrap().is_empty());
    }

    #[test]
    fn negative_array_count_is_unsupported() {
        let mut model = Model::new();
        let count = model.uniform_int(0, 2).unwrap();
        let array = model.make_array(count, |i, m| m.constant(i as i64)).unwrap();
        let mut collection = ComponentCollection::new();
        collection.create_problem(&model, &[count, array]).unwrap();
        let c = collection.component_of(array).unwrap();
        assert!(matches!(
            collection.expand_array(c, &mut model, -1),
            Err(StructuredError::UnsupportedConstruct(_))
        ));
    }

    #[test]
    fn refinement_flags_follow_dependencies() {
        let mut model = Model::new();
        let g = model.geometric(0.5).unwrap();
        let x = model.flip(0.5).unwrap();
        let y = model.apply(&[x], |vs| vs[0].clone());
        let mut collection = ComponentCollection::new();
        let problem = collection.create_problem(&model, &[g, x, y]).unwrap();
        range_all(&mut collection, &model, problem);
        let (gc, xc, yc) = (
            collection.component_of(g).unwrap(),
            collection.component_of(x).unwrap(),
            collection.component_of(y).unwrap(),
        );

        assert!(!collection.refresh_refinement(yc, &model).unwrap());
        assert!(collection.refresh_refinement(xc, &model).unwrap());
        assert!(collection.refresh_refinement(yc, &model).unwrap());
        assert!(!collection.refresh_refinement(yc, &model).unwrap());
        assert!(!collection.refresh_refinement(gc, &model).unwrap());
        assert!(!collection.problem_fully_refined(problem).unwrap());
    }
}
