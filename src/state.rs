//! Abstract state of the value analysis.
//!
//! A [`ValueState`] maps memory locations to the single concrete value they are
//! known to hold. A missing entry means "unknown" (top for that variable);
//! there is no sentinel value. The maps are persistent (`im::OrdMap`), so
//! cloning a state for a successor is cheap and states kept in a reached set
//! stay valid.
//!
//! Call contexts are linked through a [`FrameId`]: a handle into the
//! [`CallFrames`] arena that stores the caller's state at the moment of the
//! call. Two states with different handles belong to different call contexts
//! and are never comparable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use im::{OrdMap, OrdSet};

use crate::eval::ValueLookup;
use crate::location::MemoryLocation;

/// Handle of a stored caller state.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameId(usize);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Explicit-value abstract state.
#[derive(Debug, Clone, Default)]
pub struct ValueState {
    values: OrdMap<MemoryLocation, i64>,
    /// Number of distinct writes seen per variable (reference-count threshold).
    references: OrdMap<MemoryLocation, u32>,
    previous: Option<FrameId>,
    /// Locations changed since the last abstraction point.
    delta: OrdSet<MemoryLocation>,
}

impl ValueState {
    /// Empty state: nothing known, no enclosing call frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty state for a callee whose caller state is stored under `previous`.
    pub fn in_frame(previous: FrameId) -> Self {
        ValueState {
            previous: Some(previous),
            ..Self::default()
        }
    }

    pub fn previous(&self) -> Option<FrameId> {
        self.previous
    }

    pub fn contains(&self, location: &MemoryLocation) -> bool {
        self.values.contains_key(location)
    }

    pub fn value_of(&self, location: &MemoryLocation) -> Option<i64> {
        self.values.get(location).copied()
    }

    /// Number of known locations.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MemoryLocation, i64)> {
        self.values.iter().map(|(k, v)| (k, *v))
    }

    pub fn locations(&self) -> impl Iterator<Item = &MemoryLocation> {
        self.values.keys()
    }

    /// Writes recorded for `location` so far.
    pub fn references(&self, location: &MemoryLocation) -> u32 {
        self.references.get(location).copied().unwrap_or(0)
    }

    /// Stores `value` unconditionally, as if it were the first write.
    pub fn assign(&mut self, location: MemoryLocation, value: i64) {
        self.references.insert(location.clone(), 1);
        self.delta.insert(location.clone());
        self.values.insert(location, value);
    }

    /// Stores `value` unless that would exceed `threshold` distinct writes for
    /// `location`, in which case the location is forgotten instead. Re-storing
    /// the value already held is not a write. Returns whether the value is held
    /// afterwards.
    pub fn assign_counted(&mut self, location: MemoryLocation, value: i64, threshold: Option<u32>) -> bool {
        if self.values.get(&location) == Some(&value) {
            return true;
        }
        let count = self.references(&location);
        if threshold.is_some_and(|limit| count >= limit) {
            log::debug!("Reference threshold reached for {}, forgetting it", location);
            self.forget(&location);
            return false;
        }
        self.references.insert(location.clone(), count + 1);
        self.delta.insert(location.clone());
        self.values.insert(location, value);
        true
    }

    /// Raises `location` to unknown. Returns the value it held.
    pub fn forget(&mut self, location: &MemoryLocation) -> Option<i64> {
        let old = self.values.remove(location);
        if old.is_some() {
            self.delta.insert(location.clone());
        }
        old
    }

    /// Forgets every cell of the variable `location` belongs to.
    pub fn forget_variable(&mut self, location: &MemoryLocation) {
        let cells: Vec<MemoryLocation> = self.values.keys().filter(|l| l.same_variable(location)).cloned().collect();
        for cell in cells {
            self.forget(&cell);
        }
    }

    /// Removes everything scoped to `function`, including write counts.
    pub fn drop_function(&mut self, function: &str) {
        let locals: Vec<MemoryLocation> = self
            .values
            .keys()
            .chain(self.references.keys())
            .filter(|l| l.function() == Some(function))
            .cloned()
            .collect();
        for location in locals {
            self.values.remove(&location);
            self.references.remove(&location);
            self.delta.remove(&location);
        }
    }

    /// Makes `location` hold in `self` exactly what it holds in `other`,
    /// write count included.
    pub fn copy_cell_from(&mut self, other: &ValueState, location: &MemoryLocation) {
        match other.value_of(location) {
            Some(value) => {
                if self.value_of(location) != Some(value) {
                    self.delta.insert(location.clone());
                }
                self.values.insert(location.clone(), value);
            }
            None => {
                self.forget(location);
            }
        }
        match other.references.get(location) {
            Some(&count) => {
                self.references.insert(location.clone(), count);
            }
            None => {
                self.references.remove(location);
            }
        }
    }

    /// Global locations that are known or have been written.
    pub fn global_locations(&self) -> Vec<MemoryLocation> {
        let mut globals: Vec<MemoryLocation> = self
            .values
            .keys()
            .chain(self.references.keys())
            .filter(|l| l.is_global())
            .cloned()
            .collect();
        globals.sort();
        globals.dedup();
        globals
    }

    pub fn delta(&self) -> &OrdSet<MemoryLocation> {
        &self.delta
    }

    pub fn clear_delta(&mut self) {
        self.delta = OrdSet::new();
    }
}

impl ValueLookup for ValueState {
    fn lookup(&self, location: &MemoryLocation) -> Option<i64> {
        self.value_of(location)
    }
}

// Write counts and delta are bookkeeping, not information about the program.
impl PartialEq for ValueState {
    fn eq(&self, other: &Self) -> bool {
        self.previous == other.previous && self.values == other.values
    }
}

impl Eq for ValueState {}

impl Hash for ValueState {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.previous.hash(state);
        self.values.hash(state);
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (location, value)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", location, value)?;
        }
        write!(f, "]")?;
        if let Some(previous) = self.previous {
            write!(f, " in frame {}", previous)?;
        }
        Ok(())
    }
}

/// Arena of caller states, owned by one analysis run.
///
/// Identical caller states share one handle, so states reached through the
/// same call context stay comparable across re-exploration. Write counts are
/// part of the identity: a frame is restored with the counts it was pushed
/// with.
#[derive(Debug, Default)]
pub struct CallFrames {
    frames: RefCell<Vec<ValueState>>,
    index: RefCell<HashMap<(ValueState, OrdMap<MemoryLocation, u32>), FrameId>>,
}

impl CallFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the caller state and returns its handle.
    pub fn push(&self, caller: &ValueState) -> FrameId {
        let mut caller = caller.clone();
        caller.clear_delta();
        let references = caller.references.clone();
        let key = (caller, references);
        if let Some(&id) = self.index.borrow().get(&key) {
            return id;
        }
        let mut frames = self.frames.borrow_mut();
        let id = FrameId(frames.len());
        frames.push(key.0.clone());
        self.index.borrow_mut().insert(key, id);
        id
    }

    pub fn get(&self, id: FrameId) -> Option<ValueState> {
        self.frames.borrow().get(id.0).cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn x() -> MemoryLocation {
        MemoryLocation::local("main", "x")
    }

    #[test]
    fn test_assign_and_forget() {
        let mut state = ValueState::new();
        assert!(!state.contains(&x()));

        state.assign(x(), 5);
        assert_eq!(state.value_of(&x()), Some(5));
        assert!(state.delta().contains(&x()));

        state.clear_delta();
        assert_eq!(state.forget(&x()), Some(5));
        assert!(!state.contains(&x()));
        assert!(state.delta().contains(&x()));
        assert_eq!(state.forget(&x()), None);
    }

    #[test]
    fn test_reference_threshold() {
        let mut state = ValueState::new();
        assert!(state.assign_counted(x(), 1, Some(2)));
        // same value: not a write
        assert!(state.assign_counted(x(), 1, Some(2)));
        assert!(state.assign_counted(x(), 2, Some(2)));
        assert_eq!(state.references(&x()), 2);
        assert!(!state.assign_counted(x(), 3, Some(2)));
        assert!(!state.contains(&x()));
        assert!(!state.assign_counted(x(), 4, Some(2)));

        // force-assign bypasses the threshold
        state.assign(x(), 7);
        assert_eq!(state.value_of(&x()), Some(7));
    }

    #[test]
    fn test_zero_threshold_never_stores() {
        let mut state = ValueState::new();
        assert!(!state.assign_counted(x(), 1, Some(0)));
        assert!(state.is_empty());
    }

    #[test]
    fn test_unlimited_threshold() {
        let mut state = ValueState::new();
        for i in 0..100 {
            assert!(state.assign_counted(x(), i, None));
        }
        assert_eq!(state.value_of(&x()), Some(99));
    }

    #[test]
    fn test_forget_variable_cells() {
        let s = MemoryLocation::local("main", "s");
        let mut state = ValueState::new();
        state.assign(s.clone(), 1);
        state.assign(s.with_offset(4), 2);
        state.assign(x(), 3);
        state.forget_variable(&s.with_offset(4));
        assert_eq!(state.len(), 1);
        assert!(state.contains(&x()));
    }

    #[test]
    fn test_drop_function() {
        let mut state = ValueState::new();
        state.assign(MemoryLocation::local("f", "a"), 1);
        state.assign(MemoryLocation::local("main", "b"), 2);
        state.assign(MemoryLocation::global("g"), 3);
        state.drop_function("f");
        assert_eq!(state.len(), 2);
        assert_eq!(state.references(&MemoryLocation::local("f", "a")), 0);
    }

    #[test]
    fn test_equality_ignores_bookkeeping() {
        let mut a = ValueState::new();
        a.assign(x(), 1);
        let mut b = ValueState::new();
        b.assign_counted(x(), 0, None);
        b.assign_counted(x(), 1, None);
        b.clear_delta();
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_includes_frame() {
        let frames = CallFrames::new();
        let f1 = frames.push(&ValueState::new());
        let mut caller = ValueState::new();
        caller.assign(x(), 1);
        let f2 = frames.push(&caller);
        assert_ne!(f1, f2);
        assert_ne!(ValueState::in_frame(f1), ValueState::in_frame(f2));
    }

    #[test]
    fn test_frames_are_interned() {
        let frames = CallFrames::new();
        let mut caller = ValueState::new();
        caller.assign(x(), 1);
        let a = frames.push(&caller);
        caller.clear_delta();
        let b = frames.push(&caller);
        assert_eq!(a, b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames.get(a), Some(caller));
    }

    #[test]
    fn test_frames_keep_write_counts() {
        let frames = CallFrames::new();
        let mut once = ValueState::new();
        once.assign_counted(x(), 1, None);
        let mut thrice = ValueState::new();
        thrice.assign_counted(x(), 3, None);
        thrice.assign_counted(x(), 2, None);
        thrice.assign_counted(x(), 1, None);
        assert_eq!(once, thrice);

        let a = frames.push(&once);
        let b = frames.push(&thrice);
        assert_ne!(a, b);
        assert_eq!(frames.get(a).unwrap().references(&x()), 1);
        assert_eq!(frames.get(b).unwrap().references(&x()), 3);
    }

    #[test]
    fn test_display() {
        let mut state = ValueState::new();
        state.assign(MemoryLocation::global("g"), 0);
        state.assign(MemoryLocation::local("f", "x"), 1);
        assert_eq!(state.to_string(), "[g=0, f::x=1]");
    }
}
