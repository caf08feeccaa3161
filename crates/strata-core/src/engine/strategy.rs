//! Refinement driver.
//!
//! Repeatedly grows ranges and expands expandable components across a problem
//! and every subproblem reachable from it, until a sweep changes nothing or the
//! pass limit is hit. Each sweep visits every problem at most once. Chains stop
//! expanding at `max_depth`, which bounds recursive models.

use rustc_hash::FxHashSet;

use crate::engine::collection::{ComponentCollection, ComponentId, ProblemId};
use crate::engine::errors::StructuredError;
use crate::engine::range::DEFAULT_SAMPLE_BUDGET;
use crate::model::{ElementId, Model};

/// Configuration for [`refine_with_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RefinementConfig {
    /// Values enumerated for infinite or continuous supports.
    pub sample_budget: usize,
    /// Deepest nested problem a chain may create.
    pub max_depth: usize,
    /// Maximum number of sweeps.
    pub max_passes: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            sample_budget: DEFAULT_SAMPLE_BUDGET,
            max_depth: 16,
            max_passes: 64,
        }
    }
}

impl RefinementConfig {
    pub fn validate(self) -> Result<Self, StructuredError> {
        if self.max_passes == 0 {
            return Err(StructuredError::ValidationError(
                "refine: max_passes must be > 0".into(),
            ));
        }
        Ok(self)
    }
}

/// What a refinement run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RefinementReport {
    /// Sweep limit configured for this run.
    pub max_passes: usize,
    /// Sweeps actually executed.
    pub passes_run: usize,
    /// Whether the last sweep changed nothing.
    pub converged: bool,
    /// Range changes across all components.
    pub ranges_changed: usize,
    pub subproblems_created: usize,
    pub slots_added: usize,
    /// Whether some chain was left unexpanded because of `max_depth`.
    pub depth_limited: bool,
    /// Whether every component of the root problem ended fully refined.
    pub fully_refined: bool,
}

/// Refines `problem` with the default configuration.
pub fn refine(
    collection: &mut ComponentCollection,
    model: &mut Model,
    problem: ProblemId,
) -> Result<RefinementReport, StructuredError> {
    refine_with_config(collection, model, problem, RefinementConfig::default())
}

/// Refines `problem` with an explicit configuration.
pub fn refine_with_config(
    collection: &mut ComponentCollection,
    model: &mut Model,
    problem: ProblemId,
    config: RefinementConfig,
) -> Result<RefinementReport, StructuredError> {
    let config = config.validate()?;
    collection.problem(problem)?;

    let mut report = RefinementReport {
        max_passes: config.max_passes,
        ..RefinementReport::default()
    };

    for pass in 0..config.max_passes {
        let mut visited = FxHashSet::default();
        let changed = sweep(collection, model, problem, &config, &mut report, &mut visited)?;
        report.passes_run = pass + 1;
        if !changed {
            report.converged = true;
            break;
        }
    }

    while refresh_all(collection, model)? {}
    report.fully_refined = collection.problem_fully_refined(problem)?;

    #[cfg(feature = "tracing")]
    tracing::debug!(
        "refinement of {:?}: {} passes, converged={}, fully_refined={}",
        problem,
        report.passes_run,
        report.converged,
        report.fully_refined
    );

    Ok(report)
}

fn sweep(
    collection: &mut ComponentCollection,
    model: &mut Model,
    problem: ProblemId,
    config: &RefinementConfig,
    report: &mut RefinementReport,
    visited: &mut FxHashSet<ProblemId>,
) -> Result<bool, StructuredError> {
    if !visited.insert(problem) {
        return Ok(false);
    }
    let mut changed = add_dependencies(collection, model, problem)?;
    let depth = collection.problem(problem)?.depth();
    let components = collection.problem(problem)?.components().to_vec();

    for component in components {
        let element = collection.component(component)?.element();
        for dep in model.dependencies(element)? {
            let Some(dc) = collection.component_of(dep) else {
                continue;
            };
            if collection.is_global(problem, dc)? {
                changed |= range(collection, model, dc, config, report)?;
            }
        }
        changed |= range(collection, model, component, config, report)?;

        let comp = collection.component(component)?;
        if !comp.is_expandable() {
            continue;
        }
        if comp.as_chain().is_some() {
            if depth + 1 > config.max_depth {
                report.depth_limited = true;
            } else {
                let created = collection.expand(component, model)?;
                report.subproblems_created += created;
                changed |= created > 0;
            }
        } else {
            let added = collection.expand(component, model)?;
            report.slots_added += added;
            changed |= added > 0;
        }

        let subproblems: Vec<ProblemId> = collection
            .component(component)?
            .subproblems()
            .map(|subs| subs.values().copied().collect())
            .unwrap_or_default();
        for subproblem in subproblems {
            changed |= sweep(collection, model, subproblem, config, report, visited)?;
        }
        changed |= range(collection, model, component, config, report)?;
    }
    Ok(changed)
}

fn range(
    collection: &mut ComponentCollection,
    model: &Model,
    component: ComponentId,
    config: &RefinementConfig,
    report: &mut RefinementReport,
) -> Result<bool, StructuredError> {
    let changed = collection.generate_range(component, model, config.sample_budget)?;
    if changed {
        report.ranges_changed += 1;
    }
    Ok(changed)
}

/// Registers every dependency reachable from `problem`'s components that is
/// not yet in the collection.
fn add_dependencies(
    collection: &mut ComponentCollection,
    model: &Model,
    problem: ProblemId,
) -> Result<bool, StructuredError> {
    let mut worklist: Vec<ElementId> = collection
        .problem(problem)?
        .components()
        .iter()
        .map(|&c| collection.components()[c.0 as usize].element())
        .collect();
    let mut added = false;
    while let Some(element) = worklist.pop() {
        for dep in model.dependencies(element)? {
            if !collection.contains(dep) {
                collection.add(problem, model, dep)?;
                worklist.push(dep);
                added = true;
            }
        }
    }
    Ok(added)
}

fn refresh_all(collection: &mut ComponentCollection, model: &Model) -> Result<bool, StructuredError> {
    let mut any = false;
    for index in 0..collection.components().len() {
        any |= collection.refresh_refinement(ComponentId(index as u32), model)?;
    }
    Ok(any)
}
