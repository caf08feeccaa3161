//! Sparse factor tables handed to the elimination stage.
//!
//! The engine only builds and rewrites factors. Rows not listed have weight
//! zero; combining, marginalising and normalising belong to the solver.

use smallvec::SmallVec;

use crate::engine::value_set::Extended;
use crate::engine::variable::{Variable, VariableId};

/// Which side of a bound to produce when a domain still contains star.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Bounds {
    /// Conservative: the unknown value gets weight 0.
    Lower,
    /// Optimistic: the unknown value gets weight 1.
    Upper,
}

impl Bounds {
    /// Weight assigned to the star entry of a constraint.
    pub fn star_weight(self) -> f64 {
        match self {
            Bounds::Lower => 0.0,
            Bounds::Upper => 1.0,
        }
    }
}

/// One assignment of the factor's variables and its weight.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorRow {
    pub values: SmallVec<[Extended; 4]>,
    pub weight: f64,
}

#[derive(Debug, Clone)]
pub struct Factor {
    variables: Vec<Variable>,
    rows: Vec<FactorRow>,
}

impl Factor {
    pub fn new(variables: Vec<Variable>) -> Self {
        Self {
            variables,
            rows: Vec::new(),
        }
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn rows(&self) -> &[FactorRow] {
        &self.rows
    }

    pub fn contains_variable(&self, id: VariableId) -> bool {
        self.variables.iter().any(|v| v.id() == id)
    }

    /// Appends a row. Arity must match the variable list.
    pub fn push_row<I>(&mut self, values: I, weight: f64)
    where
        I: IntoIterator<Item = Extended>,
    {
        let values: SmallVec<[Extended; 4]> = values.into_iter().collect();
        assert_eq!(
            values.len(),
            self.variables.len(),
            "factor row arity does not match its variables"
        );
        self.rows.push(FactorRow { values, weight });
    }

    /// Weight of an exact assignment, zero if absent.
    pub fn weight(&self, values: &[Extended]) -> f64 {
        self.rows
            .iter()
            .find(|r| r.values.as_slice() == values)
            .map_or(0.0, |r| r.weight)
    }

    /// Removes rows identical (same assignment, same weight) to an earlier row.
    pub fn dedup_rows(&mut self) {
        let mut kept: Vec<FactorRow> = Vec::with_capacity(self.rows.len());
        for row in self.rows.drain(..) {
            let duplicate = kept
                .iter()
                .any(|k| k.values == row.values && k.weight.to_bits() == row.weight.to_bits());
            if !duplicate {
                kept.push(row);
            }
        }
        self.rows = kept;
    }

    /// Copy of this factor with `old` replaced by `new`.
    pub fn substitute(&self, old: &Variable, new: &Variable) -> Factor {
        Factor {
            variables: self
                .variables
                .iter()
                .map(|v| if v == old { new.clone() } else { v.clone() })
                .collect(),
            rows: self.rows.clone(),
        }
    }
}

/// Every combination picking one item from each list, in odometer order.
pub(crate) fn cartesian<T: Clone>(lists: &[Vec<T>]) -> Vec<SmallVec<[T; 4]>> {
    let mut combos: Vec<SmallVec<[T; 4]>> = vec![SmallVec::new()];
    for list in lists {
        let mut next = Vec::with_capacity(combos.len() * list.len());
        for prefix in &combos {
            for item in list {
                let mut row = prefix.clone();
                row.push(item.clone());
                next.push(row);
            }
        }
        combos = next;
    }
    combos
}
