//! Lattice structure of value states, and the merge and stop operators built
//! on it.

use std::fmt::Debug;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::state::ValueState;

/// Abstract domain interface.
///
/// `le(a, b)` reads "`a` is at least as precise as `b`": every concrete state
/// described by `a` is also described by `b`.
///
/// # Lattice Properties
///
/// - Reflexivity: `∀a. a ⊑ a`
/// - Join is an upper bound: `a ⊑ a ⊔ b` and `b ⊑ a ⊔ b`
/// - Join is idempotent and commutative
pub trait AbstractDomain {
    type Element: Clone + Debug + PartialEq;

    /// The element carrying no information.
    fn top(&self) -> Self::Element;

    fn is_top(&self, elem: &Self::Element) -> bool;

    /// Partial order: `elem1 ⊑ elem2`.
    fn le(&self, elem1: &Self::Element, elem2: &Self::Element) -> bool;

    /// Join (`⊔`): over-approximation of both inputs.
    fn join(&self, elem1: &Self::Element, elem2: &Self::Element) -> Self::Element;

    /// Check equality of abstract elements.
    fn eq(&self, elem1: &Self::Element, elem2: &Self::Element) -> bool {
        self.le(elem1, elem2) && self.le(elem2, elem1)
    }

    /// Join of all elements, `None` for an empty input.
    fn join_many<'a, I>(&self, elems: I) -> Option<Self::Element>
    where
        I: IntoIterator<Item = &'a Self::Element>,
        Self::Element: 'a,
    {
        let mut elems = elems.into_iter();
        let first = elems.next()?.clone();
        Some(elems.fold(first, |acc, e| self.join(&acc, e)))
    }
}

/// The explicit-value domain: constant propagation over [`ValueState`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueDomain;

impl AbstractDomain for ValueDomain {
    type Element = ValueState;

    fn top(&self) -> ValueState {
        ValueState::new()
    }

    fn is_top(&self, elem: &ValueState) -> bool {
        elem.is_empty()
    }

    /// States from different call contexts are incomparable.
    fn le(&self, elem1: &ValueState, elem2: &ValueState) -> bool {
        if elem1.previous() != elem2.previous() {
            return false;
        }
        if elem1.len() < elem2.len() {
            return false;
        }
        elem2.iter().all(|(location, value)| elem1.value_of(location) == Some(value))
    }

    /// Keeps the entries both inputs agree on. The call context is taken from
    /// `elem1`.
    fn join(&self, elem1: &ValueState, elem2: &ValueState) -> ValueState {
        let mut joined = elem1.clone();
        let disagreeing: Vec<_> = elem1
            .iter()
            .filter(|(location, value)| elem2.value_of(location) != Some(*value))
            .map(|(location, _)| location.clone())
            .collect();
        for location in &disagreeing {
            joined.forget(location);
        }
        joined.clear_delta();
        joined
    }
}

/// How a new state is combined with a state already reached at its location.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum MergeOperator {
    /// Keep both states.
    #[default]
    Sep,
    /// Replace the reached state by the join, within one call context.
    Join,
}

impl MergeOperator {
    /// State that replaces `reached` after `state` arrives.
    pub fn merge(self, state: &ValueState, reached: &ValueState) -> ValueState {
        match self {
            MergeOperator::Sep => reached.clone(),
            MergeOperator::Join if state.previous() == reached.previous() => ValueDomain.join(state, reached),
            MergeOperator::Join => reached.clone(),
        }
    }
}

impl FromStr for MergeOperator {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SEP" => Ok(MergeOperator::Sep),
            "JOIN" => Ok(MergeOperator::Join),
            _ => Err(ConfigError::InvalidValue {
                option: "cpa.value.merge".to_string(),
                value: s.to_string(),
                expected: "SEP or JOIN",
            }),
        }
    }
}

/// When a new state is considered covered by the reached set.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum StopOperator {
    /// Covered by a single reached state.
    #[default]
    Sep,
    /// Covered by the join of all reached states.
    Join,
    /// Never covered.
    Never,
}

impl StopOperator {
    pub fn stop<'a>(self, state: &ValueState, reached: impl IntoIterator<Item = &'a ValueState>) -> bool {
        let domain = ValueDomain;
        match self {
            StopOperator::Sep => reached.into_iter().any(|r| domain.le(state, r)),
            StopOperator::Join => domain.join_many(reached).is_some_and(|joined| domain.le(state, &joined)),
            StopOperator::Never => false,
        }
    }
}

impl FromStr for StopOperator {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SEP" => Ok(StopOperator::Sep),
            "JOIN" => Ok(StopOperator::Join),
            "NEVER" => Ok(StopOperator::Never),
            _ => Err(ConfigError::InvalidValue {
                option: "cpa.value.stop".to_string(),
                value: s.to_string(),
                expected: "SEP, JOIN or NEVER",
            }),
        }
    }
}
