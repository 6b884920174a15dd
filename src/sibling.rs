//! Sibling analyses consulted by `strengthen`.
//!
//! When the value analysis runs next to other analyses (pointer aliasing,
//! runtime types, a shape/memory graph), their states for the same edge can
//! answer questions the value analysis cannot: where a pointer points, which
//! object a member access belongs to, which enumerator an object holds.

use crate::expr::Expression;
use crate::location::MemoryLocation;

/// An abstract state of a sibling analysis, seen through the questions the
/// value analysis may ask. Every question defaults to "don't know".
pub trait SiblingState {
    /// Cell that `pointer` (evaluated in `function`) points to.
    fn points_to(&self, _pointer: &Expression, _function: &str) -> Option<MemoryLocation> {
        None
    }

    /// Cell denoted by a member access through a pointer (`p->f`).
    fn field_location(&self, _access: &Expression, _function: &str) -> Option<MemoryLocation> {
        None
    }

    /// Enumerator value held by the object at `location`.
    fn enum_value(&self, _location: &MemoryLocation) -> Option<i64> {
        None
    }
}

/// First answer any sibling gives.
pub(crate) fn ask<T>(siblings: &[&dyn SiblingState], question: impl Fn(&dyn SiblingState) -> Option<T>) -> Option<T> {
    siblings.iter().find_map(|s| question(*s))
}
