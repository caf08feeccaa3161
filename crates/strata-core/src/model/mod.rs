//! # Model
//!
//! A small declarative front end: an arena of elements whose values depend on
//! other elements. The structured engine only reads from it, except for two
//! lazy operations that grow the model on demand:
//!
//! - **resolve_chain**: runs a chain's selector for one parent value. Every
//!   element created during that call is recorded in the chain's lexical
//!   context, which the engine later materializes inside the matching
//!   subproblem.
//! - **array_item**: creates one slot of a variable-length collection.
//!
//! Both are memoized, so asking twice for the same chain value or the same
//! slot returns the same element.

pub mod value;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::engine::errors::StructuredError;

pub use value::{ArrayRef, Real, Value};

/// A unique identifier for an element of a [`Model`].
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ElementId(pub u32);

/// Identity of a chain selector function. Two chains built from the same
/// function share this id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionId(pub u32);

pub type ApplyFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;
pub type ChainFn = Arc<dyn Fn(&Value, &mut Model) -> ElementId + Send + Sync>;
pub type ItemFn = Arc<dyn Fn(usize, &mut Model) -> ElementId + Send + Sync>;

/// Success probability of a [`ElementKind::Flip`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Probability {
    Fixed(f64),
    /// Learned parameter; must refer to a `Beta` element.
    Parameter(ElementId),
}

/// The kind of computation an element performs.
#[derive(Clone)]
pub enum ElementKind {
    Constant(Value),
    Flip(Probability),
    /// Discrete choice among weighted values.
    Select(Vec<(f64, Value)>),
    /// Uniform over the integers in `low..=high`.
    UniformInt { low: i64, high: i64 },
    /// Number of trials until the first success; infinite support `1..`.
    Geometric { p: f64 },
    /// Continuous parameter on `[0, 1]`.
    Beta { alpha: f64, beta: f64 },
    Apply {
        args: SmallVec<[ElementId; 4]>,
        func: ApplyFn,
    },
    Chain {
        parent: ElementId,
        function: FunctionId,
    },
    MakeArray { count: ElementId, item: ItemFn },
}

impl ElementKind {
    /// Short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ElementKind::Constant(_) => "Constant",
            ElementKind::Flip(_) => "Flip",
            ElementKind::Select(_) => "Select",
            ElementKind::UniformInt { .. } => "UniformInt",
            ElementKind::Geometric { .. } => "Geometric",
            ElementKind::Beta { .. } => "Beta",
            ElementKind::Apply { .. } => "Apply",
            ElementKind::Chain { .. } => "Chain",
            ElementKind::MakeArray { .. } => "MakeArray",
        }
    }

    /// Whether the range of this kind is produced by sampling rather than
    /// enumeration. Sampled ranges can become complete but never final.
    pub fn is_sampled(&self) -> bool {
        matches!(self, ElementKind::Beta { .. } | ElementKind::Geometric { .. })
    }
}

impl fmt::Debug for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            ElementKind::Flip(p) => f.debug_tuple("Flip").field(p).finish(),
            ElementKind::Select(choices) => f.debug_tuple("Select").field(choices).finish(),
            ElementKind::UniformInt { low, high } => f
                .debug_struct("UniformInt")
                .field("low", low)
                .field("high", high)
                .finish(),
            ElementKind::Geometric { p } => f.debug_struct("Geometric").field("p", p).finish(),
            ElementKind::Beta { alpha, beta } => f
                .debug_struct("Beta")
                .field("alpha", alpha)
                .field("beta", beta)
                .finish(),
            ElementKind::Apply { args, .. } => {
                f.debug_struct("Apply").field("args", args).finish_non_exhaustive()
            }
            ElementKind::Chain { parent, function } => f
                .debug_struct("Chain")
                .field("parent", parent)
                .field("function", function)
                .finish(),
            ElementKind::MakeArray { count, .. } => f
                .debug_struct("MakeArray")
                .field("count", count)
                .finish_non_exhaustive(),
        }
    }
}

/// An observation or soft preference attached to an element.
#[derive(Clone)]
pub enum Constraint {
    /// Hard evidence: values failing the predicate get weight 0.
    Condition(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
    /// Soft evidence: arbitrary non-negative weight per value.
    Weight(Arc<dyn Fn(&Value) -> f64 + Send + Sync>),
}

impl Constraint {
    pub fn weight(&self, value: &Value) -> f64 {
        match self {
            Constraint::Condition(pred) => {
                if pred(value) {
                    1.0
                } else {
                    0.0
                }
            }
            Constraint::Weight(w) => w(value),
        }
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Condition(_) => f.write_str("Condition(..)"),
            Constraint::Weight(_) => f.write_str("Weight(..)"),
        }
    }
}

/// A node of the model graph.
#[derive(Debug, Clone)]
pub struct Element {
    pub id: ElementId,
    pub name: Option<Arc<str>>,
    pub kind: ElementKind,
    pub constraints: Vec<Constraint>,
    /// Chain whose selector created this element, if any.
    pub context: Option<ElementId>,
}

/// Arena of model elements plus the memo tables for lazily created structure.
#[derive(Default)]
pub struct Model {
    elements: Vec<Element>,
    functions: Vec<ChainFn>,
    chain_results: FxHashMap<(ElementId, Value), ElementId>,
    array_items: FxHashMap<(ElementId, usize), ElementId>,
    context_contents: FxHashMap<ElementId, Vec<ElementId>>,
    context_stack: Vec<ElementId>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("elements", &self.elements.len())
            .field("functions", &self.functions.len())
            .field("chain_results", &self.chain_results.len())
            .field("array_items", &self.array_items.len())
            .finish()
    }
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn element(&self, id: ElementId) -> Result<&Element, StructuredError> {
        self.elements
            .get(id.0 as usize)
            .ok_or(StructuredError::UnknownElement(id))
    }

    pub fn kind(&self, id: ElementId) -> Result<&ElementKind, StructuredError> {
        self.element(id).map(|e| &e.kind)
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }

    /// Adds an element, recording it in the innermost active chain context.
    pub fn add(&mut self, kind: ElementKind) -> ElementId {
        let id = ElementId(self.elements.len() as u32);
        let context = self.context_stack.last().copied();
        if let Some(chain) = context {
            self.context_contents.entry(chain).or_default().push(id);
        }
        self.elements.push(Element {
            id,
            name: None,
            kind,
            constraints: Vec::new(),
            context,
        });
        id
    }

    pub fn constant(&mut self, value: impl Into<Value>) -> ElementId {
        self.add(ElementKind::Constant(value.into()))
    }

    pub fn flip(&mut self, p: f64) -> Result<ElementId, StructuredError> {
        check_probability("flip", p)?;
        Ok(self.add(ElementKind::Flip(Probability::Fixed(p))))
    }

    /// A flip whose probability is the `Beta` element `parameter`.
    pub fn flip_parameterized(&mut self, parameter: ElementId) -> Result<ElementId, StructuredError> {
        match self.kind(parameter)? {
            ElementKind::Beta { .. } => {
                Ok(self.add(ElementKind::Flip(Probability::Parameter(parameter))))
            }
            other => Err(StructuredError::ValidationError(format!(
                "flip parameter {:?} must be a Beta element, found {}",
                parameter,
                other.name()
            ))),
        }
    }

    pub fn select(&mut self, choices: Vec<(f64, Value)>) -> Result<ElementId, StructuredError> {
        for (p, _) in &choices {
            check_probability("select", *p)?;
        }
        Ok(self.add(ElementKind::Select(choices)))
    }

    pub fn uniform_int(&mut self, low: i64, high: i64) -> Result<ElementId, StructuredError> {
        if low > high {
            return Err(StructuredError::ValidationError(format!(
                "uniform_int: empty interval {}..={}",
                low, high
            )));
        }
        Ok(self.add(ElementKind::UniformInt { low, high }))
    }

    pub fn geometric(&mut self, p: f64) -> Result<ElementId, StructuredError> {
        if !(p > 0.0 && p <= 1.0) {
            return Err(StructuredError::ValidationError(format!(
                "geometric: p must be in (0, 1], got {}",
                p
            )));
        }
        Ok(self.add(ElementKind::Geometric { p }))
    }

    pub fn beta(&mut self, alpha: f64, beta: f64) -> Result<ElementId, StructuredError> {
        if !(alpha > 0.0 && beta > 0.0 && alpha.is_finite() && beta.is_finite()) {
            return Err(StructuredError::ValidationError(format!(
                "beta: parameters must be finite and > 0, got ({}, {})",
                alpha, beta
            )));
        }
        Ok(self.add(ElementKind::Beta { alpha, beta }))
    }

    pub fn apply<F>(&mut self, args: &[ElementId], func: F) -> ElementId
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.add(ElementKind::Apply {
            args: args.iter().copied().collect(),
            func: Arc::new(func),
        })
    }

    /// Registers a selector so several chains can share it.
    pub fn register_function<F>(&mut self, func: F) -> FunctionId
    where
        F: Fn(&Value, &mut Model) -> ElementId + Send + Sync + 'static,
    {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(Arc::new(func));
        id
    }

    pub fn chain(&mut self, parent: ElementId, function: FunctionId) -> Result<ElementId, StructuredError> {
        self.element(parent)?;
        if function.0 as usize >= self.functions.len() {
            return Err(StructuredError::ValidationError(format!(
                "chain: unknown selector function {:?}",
                function
            )));
        }
        Ok(self.add(ElementKind::Chain { parent, function }))
    }

    /// Registers `func` and builds a chain over it in one step.
    pub fn chain_fn<F>(&mut self, parent: ElementId, func: F) -> Result<ElementId, StructuredError>
    where
        F: Fn(&Value, &mut Model) -> ElementId + Send + Sync + 'static,
    {
        let function = self.register_function(func);
        self.chain(parent, function)
    }

    pub fn make_array<F>(&mut self, count: ElementId, item: F) -> Result<ElementId, StructuredError>
    where
        F: Fn(usize, &mut Model) -> ElementId + Send + Sync + 'static,
    {
        self.element(count)?;
        Ok(self.add(ElementKind::MakeArray {
            count,
            item: Arc::new(item),
        }))
    }

    pub fn set_name(&mut self, id: ElementId, name: &str) -> Result<(), StructuredError> {
        self.element_mut(id)?.name = Some(Arc::from(name));
        Ok(())
    }

    /// Hard evidence on `id`.
    pub fn condition<F>(&mut self, id: ElementId, pred: F) -> Result<(), StructuredError>
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.element_mut(id)?
            .constraints
            .push(Constraint::Condition(Arc::new(pred)));
        Ok(())
    }

    /// Soft evidence on `id`.
    pub fn constrain<F>(&mut self, id: ElementId, weight: F) -> Result<(), StructuredError>
    where
        F: Fn(&Value) -> f64 + Send + Sync + 'static,
    {
        self.element_mut(id)?
            .constraints
            .push(Constraint::Weight(Arc::new(weight)));
        Ok(())
    }

    /// Elements whose values `id` directly depends on.
    pub fn dependencies(&self, id: ElementId) -> Result<SmallVec<[ElementId; 4]>, StructuredError> {
        let deps = match &self.element(id)?.kind {
            ElementKind::Flip(Probability::Parameter(p)) => SmallVec::from_slice(&[*p]),
            ElementKind::Apply { args, .. } => args.clone(),
            ElementKind::Chain { parent, .. } => SmallVec::from_slice(&[*parent]),
            ElementKind::MakeArray { count, .. } => SmallVec::from_slice(&[*count]),
            _ => SmallVec::new(),
        };
        Ok(deps)
    }

    /// Posterior mean of a `Beta` parameter element.
    pub fn parameter_mean(&self, id: ElementId) -> Result<f64, StructuredError> {
        match self.kind(id)? {
            ElementKind::Beta { alpha, beta } => Ok(alpha / (alpha + beta)),
            other => Err(StructuredError::UnsupportedConstruct(format!(
                "{:?} is a {}, not a parameter",
                id,
                other.name()
            ))),
        }
    }

    /// The element a chain selects for `value`, creating it on first use.
    ///
    /// Elements created while the selector runs are recorded as the chain's
    /// context contents.
    pub fn resolve_chain(&mut self, chain: ElementId, value: &Value) -> Result<ElementId, StructuredError> {
        let function = match &self.element(chain)?.kind {
            ElementKind::Chain { function, .. } => *function,
            _ => return Err(StructuredError::NotExpandable(chain)),
        };
        if let Some(&target) = self.chain_results.get(&(chain, value.clone())) {
            return Ok(target);
        }
        let func = self
            .functions
            .get(function.0 as usize)
            .cloned()
            .ok_or_else(|| StructuredError::Internal(format!("missing selector {:?}", function)))?;

        self.context_contents.entry(chain).or_default();
        self.context_stack.push(chain);
        let target = func(value, self);
        self.context_stack.pop();

        self.element(target)?;
        self.chain_results.insert((chain, value.clone()), target);
        Ok(target)
    }

    /// Elements created so far inside `chain`'s selector, in creation order.
    pub fn context_contents(&self, chain: ElementId) -> &[ElementId] {
        self.context_contents
            .get(&chain)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Slot `index` of the array element `array`, creating it on first use.
    pub fn array_item(&mut self, array: ElementId, index: usize) -> Result<ElementId, StructuredError> {
        let item = match &self.element(array)?.kind {
            ElementKind::MakeArray { item, .. } => Arc::clone(item),
            _ => return Err(StructuredError::NotExpandable(array)),
        };
        if let Some(&slot) = self.array_items.get(&(array, index)) {
            return Ok(slot);
        }
        // Slots belong to the array, not to whichever chain happens to be
        // resolving when they are first requested.
        let saved = std::mem::take(&mut self.context_stack);
        let slot = item(index, self);
        self.context_stack = saved;

        self.element(slot)?;
        self.array_items.insert((array, index), slot);
        Ok(slot)
    }

    /// Slot `index` of `array` if it has already been created.
    pub fn existing_array_item(&self, array: ElementId, index: usize) -> Option<ElementId> {
        self.array_items.get(&(array, index)).copied()
    }

    fn element_mut(&mut self, id: ElementId) -> Result<&mut Element, StructuredError> {
        self.elements
            .get_mut(id.0 as usize)
            .ok_or(StructuredError::UnknownElement(id))
    }
}

fn check_probability(what: &str, p: f64) -> Result<(), StructuredError> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(StructuredError::ValidationError(format!(
            "{}: probability must be in [0, 1], got {}",
            what, p
        )))
    }
}
