//! Domain snapshots with an abstract "unknown" member.
//!
//! A [`ValueSet`] is the current best-known range of a component: the values
//! enumerated so far plus a star flag meaning "some value not listed here may
//! also occur". Value sets are immutable; a component that learns more
//! replaces its set wholesale.

use std::collections::BTreeSet;
use std::fmt;

use crate::model::Value;

/// A concrete value or the unknown sentinel.
///
/// Star sorts after every regular value, so extended iteration lists regular
/// values first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Extended {
    Regular(Value),
    Star,
}

impl Extended {
    pub fn is_star(&self) -> bool {
        matches!(self, Extended::Star)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Extended::Regular(v) => Some(v),
            Extended::Star => None,
        }
    }
}

impl From<Value> for Extended {
    fn from(v: Value) -> Self {
        Extended::Regular(v)
    }
}

/// An immutable set of regular values plus the star flag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValueSet {
    regular: BTreeSet<Value>,
    has_star: bool,
}

impl ValueSet {
    /// The initial range of every component: nothing known, anything possible.
    pub fn star_only() -> Self {
        Self {
            regular: BTreeSet::new(),
            has_star: true,
        }
    }

    pub fn without_star<I: IntoIterator<Item = Value>>(values: I) -> Self {
        Self {
            regular: values.into_iter().collect(),
            has_star: false,
        }
    }

    pub fn with_star<I: IntoIterator<Item = Value>>(values: I) -> Self {
        Self {
            regular: values.into_iter().collect(),
            has_star: true,
        }
    }

    pub fn new(regular: BTreeSet<Value>, has_star: bool) -> Self {
        Self { regular, has_star }
    }

    pub fn regular_values(&self) -> &BTreeSet<Value> {
        &self.regular
    }

    pub fn has_star(&self) -> bool {
        self.has_star
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.regular.contains(value)
    }

    pub fn contains_extended(&self, value: &Extended) -> bool {
        match value {
            Extended::Regular(v) => self.regular.contains(v),
            Extended::Star => self.has_star,
        }
    }

    /// Number of regular values, excluding star.
    pub fn len(&self) -> usize {
        self.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regular.is_empty() && !self.has_star
    }

    /// Number of extended values, counting star as one.
    pub fn size(&self) -> usize {
        self.regular.len() + usize::from(self.has_star)
    }

    /// Regular values in order, then star if present.
    pub fn extended_values(&self) -> impl Iterator<Item = Extended> + '_ {
        self.regular
            .iter()
            .cloned()
            .map(Extended::Regular)
            .chain(self.has_star.then_some(Extended::Star))
    }

    /// Largest integer among the regular values.
    pub fn max_int(&self) -> Option<i64> {
        self.regular.iter().filter_map(Value::as_int).max()
    }

    /// Union of regular values; star only if both sides have it.
    ///
    /// Used when a component that still has a star recomputes its range: what
    /// was already enumerated stays, and the star survives only if the fresh
    /// candidate still has one.
    pub fn grown_by(&self, candidate: &ValueSet) -> ValueSet {
        let mut regular = self.regular.clone();
        regular.extend(candidate.regular.iter().cloned());
        ValueSet {
            regular,
            has_star: candidate.has_star,
        }
    }

    /// True if `self` could be a later snapshot of `earlier`: no regular value
    /// lost and the star never reappearing.
    pub fn extends(&self, earlier: &ValueSet) -> bool {
        earlier.regular.is_subset(&self.regular) && (earlier.has_star || !self.has_star)
    }
}

impl fmt::Display for ValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, v) in self.regular.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        if self.has_star {
            if !self.regular.is_empty() {
                write!(f, ", ")?;
            }
            write!(f, "*")?;
        }
        write!(f, "}}")
    }
}
