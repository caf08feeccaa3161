//! Factor construction.
//!
//! [`FactorFactory`] is the seam through which components obtain their
//! factors; [`StandardFactory`] covers the built-in element kinds. Factors are
//! built over the variables current at call time, so they must be rebuilt
//! after a range change.

use std::collections::BTreeMap;

use crate::engine::collection::{ComponentCollection, ComponentId};
use crate::engine::component::ProblemComponent;
use crate::engine::errors::StructuredError;
use crate::engine::factor::{cartesian, Bounds, Factor};
use crate::engine::range::array_length;
use crate::engine::value_set::Extended;
use crate::engine::variable::Variable;
use crate::model::{ArrayRef, Element, ElementId, ElementKind, Model, Probability, Value};

/// Builds constraint and non-constraint factors for components.
pub trait FactorFactory: Send + Sync {
    /// Factors for the evidence attached to the element.
    fn constraint_factors(
        &self,
        collection: &ComponentCollection,
        model: &Model,
        component: ComponentId,
        bounds: Bounds,
    ) -> Result<Vec<Factor>, StructuredError>;

    /// Factors relating the element to its dependencies. With
    /// `parameterized`, parameter dependencies are replaced by a point
    /// estimate.
    fn non_constraint_factors(
        &self,
        collection: &ComponentCollection,
        model: &Model,
        component: ComponentId,
        parameterized: bool,
    ) -> Result<Vec<Factor>, StructuredError>;
}

/// Factor rules for the built-in element kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardFactory;

impl FactorFactory for StandardFactory {
    fn constraint_factors(
        &self,
        collection: &ComponentCollection,
        model: &Model,
        component: ComponentId,
        bounds: Bounds,
    ) -> Result<Vec<Factor>, StructuredError> {
        let comp = collection.component(component)?;
        let element = model.element(comp.element())?;
        let variable = comp.variable();

        let factors = element
            .constraints
            .iter()
            .map(|constraint| {
                let mut factor = Factor::new(vec![variable.clone()]);
                for value in variable.domain().extended_values() {
                    let weight = match &value {
                        Extended::Regular(v) => constraint.weight(v),
                        Extended::Star => bounds.star_weight(),
                    };
                    factor.push_row([value], weight);
                }
                factor
            })
            .collect();
        Ok(factors)
    }

    fn non_constraint_factors(
        &self,
        collection: &ComponentCollection,
        model: &Model,
        component: ComponentId,
        parameterized: bool,
    ) -> Result<Vec<Factor>, StructuredError> {
        let comp = collection.component(component)?;
        let element = model.element(comp.element())?;
        let variable = comp.variable();

        let factors = match &element.kind {
            ElementKind::Constant(c) => {
                vec![atomic_factor(variable, |v| if v == c { 1.0 } else { 0.0 })]
            }
            ElementKind::Flip(Probability::Fixed(p)) => vec![flip_factor(variable, *p)],
            ElementKind::Flip(Probability::Parameter(param)) => {
                if parameterized {
                    vec![flip_factor(variable, model.parameter_mean(*param)?)]
                } else {
                    match collection.variable_of(*param) {
                        Some(param_var) => vec![parameter_flip_factor(param_var, variable)],
                        None => vec![unknown_factor(variable)],
                    }
                }
            }
            ElementKind::Select(choices) => {
                let mut weights: BTreeMap<&Value, f64> = BTreeMap::new();
                for (p, v) in choices {
                    *weights.entry(v).or_insert(0.0) += p;
                }
                vec![atomic_factor(variable, |v| weights.get(v).copied().unwrap_or(0.0))]
            }
            ElementKind::UniformInt { low, high } => {
                vec![atomic_factor(variable, |v| uniform_weight(*low, *high, v))]
            }
            ElementKind::Geometric { p } => {
                vec![atomic_factor(variable, |v| match v.as_int() {
                    Some(k) if k >= 1 => p * (1.0 - p).powi((k - 1) as i32),
                    _ => 0.0,
                })]
            }
            ElementKind::Beta { .. } => {
                let n = variable.domain().len().max(1) as f64;
                vec![atomic_factor(variable, |_| 1.0 / n)]
            }
            ElementKind::Apply { args, func } => {
                vec![apply_factor(collection, variable, args, |values| func(values))]
            }
            ElementKind::Chain { .. } => chain_factors(collection, comp, variable)?,
            ElementKind::MakeArray { count, .. } => {
                vec![array_factor(collection, element, *count, variable)?]
            }
        };

        Ok(factors
            .into_iter()
            .map(|mut f| {
                f.dedup_rows();
                f
            })
            .collect())
    }
}

/// Single-variable factor. Star carries whatever mass the enumerated values
/// do not cover.
fn atomic_factor<F>(variable: &Variable, weight: F) -> Factor
where
    F: Fn(&Value) -> f64,
{
    let mut factor = Factor::new(vec![variable.clone()]);
    let mut covered = 0.0;
    for value in variable.domain().regular_values() {
        let w = weight(value);
        covered += w;
        if w > 0.0 {
            factor.push_row([Extended::Regular(value.clone())], w);
        }
    }
    if variable.domain().has_star() {
        let tail = (1.0 - covered).max(0.0);
        if tail > 0.0 {
            factor.push_row([Extended::Star], tail);
        }
    }
    factor
}

/// Probability of `value` under a uniform over `low..=high`. The width is
/// taken in `f64` so the full `i64` span does not overflow.
fn uniform_weight(low: i64, high: i64, value: &Value) -> f64 {
    match value.as_int() {
        Some(i) if (low..=high).contains(&i) => 1.0 / (high as f64 - low as f64 + 1.0),
        _ => 0.0,
    }
}

fn flip_factor(variable: &Variable, p: f64) -> Factor {
    atomic_factor(variable, |v| match v.as_bool() {
        Some(true) => p,
        Some(false) => 1.0 - p,
        None => 0.0,
    })
}

/// `[parameter, flip]`: each sampled parameter value acts as the flip
/// probability.
fn parameter_flip_factor(param: &Variable, variable: &Variable) -> Factor {
    let mut factor = Factor::new(vec![param.clone(), variable.clone()]);
    for p in param.domain().extended_values() {
        for outcome in variable.domain().extended_values() {
            let weight = match (&p, outcome.value().and_then(Value::as_bool)) {
                (Extended::Star, _) => 1.0,
                (Extended::Regular(pv), Some(b)) => {
                    let prob = pv.as_real().unwrap_or(0.0);
                    if b {
                        prob
                    } else {
                        1.0 - prob
                    }
                }
                (Extended::Regular(_), None) => 0.0,
            };
            if weight > 0.0 {
                factor.push_row([p.clone(), outcome], weight);
            }
        }
    }
    factor
}

/// Only the unknown value is possible.
fn unknown_factor(variable: &Variable) -> Factor {
    let mut factor = Factor::new(vec![variable.clone()]);
    if variable.domain().has_star() {
        factor.push_row([Extended::Star], 1.0);
    }
    factor
}

/// Deterministic factor over `[args.., result]`. Repeated arguments share one
/// variable column.
fn apply_factor<F>(
    collection: &ComponentCollection,
    variable: &Variable,
    args: &[ElementId],
    func: F,
) -> Factor
where
    F: Fn(&[Value]) -> Value,
{
    let mut columns: Vec<Variable> = Vec::with_capacity(args.len());
    let mut positions = Vec::with_capacity(args.len());
    for arg in args {
        let Some(arg_var) = collection.variable_of(*arg) else {
            return unknown_factor(variable);
        };
        let pos = match columns.iter().position(|c| c == arg_var) {
            Some(pos) => pos,
            None => {
                columns.push(arg_var.clone());
                columns.len() - 1
            }
        };
        positions.push(pos);
    }

    let domains: Vec<Vec<Extended>> = columns
        .iter()
        .map(|c| c.domain().extended_values().collect())
        .collect();

    let mut all = columns.clone();
    all.push(variable.clone());
    let mut factor = Factor::new(all);

    for combo in cartesian(&domains) {
        let result = if combo.iter().any(Extended::is_star) {
            Extended::Star
        } else {
            let values: Vec<Value> = positions
                .iter()
                .filter_map(|&pos| combo[pos].value().cloned())
                .collect();
            Extended::Regular(func(values.as_slice()))
        };
        if variable.domain().contains_extended(&result) {
            let mut row = combo;
            row.push(result);
            factor.push_row(row, 1.0);
        }
    }
    factor
}

/// One selector factor per expanded parent value over
/// `[parent, outcome, chain]`, plus a factor sending every unexpanded parent
/// value to star.
fn chain_factors(
    collection: &ComponentCollection,
    comp: &ProblemComponent,
    variable: &Variable,
) -> Result<Vec<Factor>, StructuredError> {
    let chain = comp.as_chain().ok_or_else(|| {
        StructuredError::Internal(format!("chain {:?} has no expansion state", comp.element()))
    })?;
    let Some(parent_var) = collection.variable_of(chain.parent()) else {
        return Ok(vec![unknown_factor(variable)]);
    };

    let mut factors = Vec::new();
    for (parent_value, actual) in chain.actual_subproblem_variables() {
        factors.push(selector_factor(parent_var, parent_value, actual, variable));
    }

    let unexpanded: Vec<Extended> = parent_var
        .domain()
        .extended_values()
        .filter(|p| match p {
            Extended::Regular(v) => !chain.actual_subproblem_variables().contains_key(v),
            Extended::Star => true,
        })
        .collect();
    if !unexpanded.is_empty() && variable.domain().has_star() {
        let mut factor = Factor::new(vec![parent_var.clone(), variable.clone()]);
        for p in unexpanded {
            factor.push_row([p, Extended::Star], 1.0);
        }
        factors.push(factor);
    }
    Ok(factors)
}

/// When the parent equals `selected`, the chain takes the outcome's value;
/// otherwise the factor is indifferent.
fn selector_factor(
    parent: &Variable,
    selected: &Value,
    outcome: &Variable,
    chain: &Variable,
) -> Factor {
    let mut columns: Vec<Variable> = Vec::with_capacity(3);
    let mut column_of = |v: &Variable| match columns.iter().position(|c| c == v) {
        Some(pos) => pos,
        None => {
            columns.push(v.clone());
            columns.len() - 1
        }
    };
    let (p_col, o_col, c_col) = (column_of(parent), column_of(outcome), column_of(chain));

    let domains: Vec<Vec<Extended>> = columns
        .iter()
        .map(|c| c.domain().extended_values().collect())
        .collect();
    let selected = Extended::Regular(selected.clone());

    let mut factor = Factor::new(columns.clone());
    for combo in cartesian(&domains) {
        let matches = combo[p_col] != selected || combo[o_col] == combo[c_col];
        if matches {
            factor.push_row(combo, 1.0);
        }
    }
    factor
}

/// `[count, array]`: a count of `n` yields the array of the first `n` slots.
fn array_factor(
    collection: &ComponentCollection,
    element: &Element,
    count: ElementId,
    variable: &Variable,
) -> Result<Factor, StructuredError> {
    let Some(count_var) = collection.variable_of(count) else {
        return Ok(unknown_factor(variable));
    };
    let mut factor = Factor::new(vec![count_var.clone(), variable.clone()]);
    for n in count_var.domain().extended_values() {
        let result = match &n {
            Extended::Regular(v) => Extended::Regular(Value::Array(ArrayRef {
                source: element.id,
                len: array_length(element.id, v)?,
            })),
            Extended::Star => Extended::Star,
        };
        if variable.domain().contains_extended(&result) {
            factor.push_row([n, result], 1.0);
        }
    }
    Ok(factor)
}
