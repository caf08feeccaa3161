//! Range computation.
//!
//! The [`RangeService`] trait is the seam through which a component asks for a
//! candidate range. [`StandardRanges`] implements it for every element kind in
//! [`crate::model`]. Dependencies that are not registered in the collection
//! read as star-only; that is the normal state early in refinement, not an
//! error.

use std::collections::BTreeSet;

use crate::engine::collection::{ComponentCollection, ComponentId};
use crate::engine::errors::StructuredError;
use crate::engine::factor::cartesian;
use crate::engine::value_set::ValueSet;
use crate::model::{ArrayRef, ElementId, ElementKind, Model, Real, Value};

/// Sample budget used when the caller does not configure one.
pub const DEFAULT_SAMPLE_BUDGET: usize = 10;

/// Computes candidate ranges for components.
pub trait RangeService: Send + Sync {
    fn range(
        &self,
        collection: &ComponentCollection,
        model: &Model,
        component: ComponentId,
        sample_budget: usize,
    ) -> Result<ValueSet, StructuredError>;
}

/// Range rules for the built-in element kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardRanges;

impl RangeService for StandardRanges {
    fn range(
        &self,
        collection: &ComponentCollection,
        model: &Model,
        component: ComponentId,
        sample_budget: usize,
    ) -> Result<ValueSet, StructuredError> {
        let comp = collection.component(component)?;
        let element = model.element(comp.element())?;

        match &element.kind {
            ElementKind::Constant(v) => Ok(ValueSet::without_star([v.clone()])),
            ElementKind::Flip(_) => Ok(ValueSet::without_star([
                Value::Bool(false),
                Value::Bool(true),
            ])),
            ElementKind::Select(choices) => Ok(ValueSet::without_star(
                choices.iter().map(|(_, v)| v.clone()),
            )),
            ElementKind::UniformInt { low, high } => {
                Ok(ValueSet::without_star((*low..=*high).map(Value::Int)))
            }
            ElementKind::Geometric { .. } => {
                require_budget(element.id, "Geometric", sample_budget)?;
                Ok(ValueSet::with_star(
                    (1..=sample_budget as i64).map(Value::Int),
                ))
            }
            ElementKind::Beta { .. } => {
                require_budget(element.id, "Beta", sample_budget)?;
                Ok(ValueSet::without_star(beta_grid(sample_budget).map(Value::Real)))
            }
            ElementKind::Apply { args, func } => {
                let ranges: Vec<_> = args.iter().map(|a| collection.range_of(*a)).collect();
                let has_star = ranges.iter().any(|r| r.has_star());
                let lists: Vec<Vec<Value>> = ranges
                    .iter()
                    .map(|r| r.regular_values().iter().cloned().collect())
                    .collect();
                let values: BTreeSet<Value> = cartesian(&lists)
                    .into_iter()
                    .map(|combo| func(combo.as_slice()))
                    .collect();
                Ok(ValueSet::new(values, has_star))
            }
            ElementKind::Chain { parent, .. } => {
                let parent_range = collection.range_of(*parent);
                let subproblems = comp.subproblems().ok_or_else(|| {
                    StructuredError::Internal(format!("chain {:?} has no expansion state", element.id))
                })?;
                let mut has_star = parent_range.has_star();
                let mut values = BTreeSet::new();
                for parent_value in parent_range.regular_values() {
                    let Some(&subproblem) = subproblems.get(parent_value) else {
                        has_star = true;
                        continue;
                    };
                    match collection.problem(subproblem)?.target() {
                        Some(target) => {
                            let outcome = collection.range_of(target);
                            values.extend(outcome.regular_values().iter().cloned());
                            has_star |= outcome.has_star();
                        }
                        None => has_star = true,
                    }
                }
                Ok(ValueSet::new(values, has_star))
            }
            ElementKind::MakeArray { count, .. } => {
                let counts = collection.range_of(*count);
                let mut values = BTreeSet::new();
                for n in counts.regular_values() {
                    let len = array_length(element.id, n)?;
                    values.insert(Value::Array(ArrayRef {
                        source: element.id,
                        len,
                    }));
                }
                Ok(ValueSet::new(values, counts.has_star()))
            }
        }
    }
}

/// Converts a count value into an array length.
pub(crate) fn array_length(array: ElementId, count: &Value) -> Result<usize, StructuredError> {
    match count.as_int() {
        Some(n) if n >= 0 => Ok(n as usize),
        Some(n) => Err(StructuredError::UnsupportedConstruct(format!(
            "array {:?} has negative length {}",
            array, n
        ))),
        None => Err(StructuredError::UnsupportedConstruct(format!(
            "array {:?} has non-integer length {}",
            array, count
        ))),
    }
}

fn require_budget(id: ElementId, kind: &str, sample_budget: usize) -> Result<(), StructuredError> {
    if sample_budget == 0 {
        return Err(StructuredError::UnsupportedConstruct(format!(
            "{} element {:?} has infinite support and no sample budget",
            kind, id
        )));
    }
    Ok(())
}

/// `n` midpoints of an even partition of `[0, 1]`.
fn beta_grid(n: usize) -> impl Iterator<Item = Real> {
    (0..n).map(move |i| Real((i as f64 + 0.5) / n as f64))
}
