//! Ad-hoc queries and modifications against a single [`ValueState`].
//!
//! | form                 | effect                                  |
//! |----------------------|-----------------------------------------|
//! | `contains(f::x)`     | whether the location is known           |
//! | `f::x==5`            | whether the location holds `5`          |
//! | `f::x`               | the value, error if unknown             |
//! | `deletevalues(f::x)` | forget the location                     |
//! | `setvalue(f::x:=5)`  | force-assign, bypassing write counting  |

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::error::{AnalysisError, Result};
use crate::location::MemoryLocation;
use crate::state::ValueState;

fn pattern(cell: &'static OnceLock<Option<Regex>>, source: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

fn captures<'t>(regex: Option<&Regex>, text: &'t str) -> Option<Captures<'t>> {
    regex.and_then(|r| r.captures(text))
}

fn contains_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"^contains\(\s*([^()\s]+)\s*\)$")
}

fn equals_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"^([^=\s]+)\s*==\s*(-?\d+)$")
}

fn delete_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"^deletevalues\(\s*([^()\s]+)\s*\)$")
}

fn set_pattern() -> Option<&'static Regex> {
    static CELL: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&CELL, r"^setvalue\(\s*([^()\s:]+(?:::[^()\s:]+)?)\s*:=\s*(-?\d+)\s*\)$")
}

fn parse_value(text: &str) -> Result<i64> {
    text.parse::<i64>()
        .map_err(|_| AnalysisError::query(format!("'{}' is not a 64-bit integer", text)))
}

/// Answers a boolean query (`contains(..)` or `name==value`).
pub fn check_property(state: &ValueState, property: &str) -> Result<bool> {
    let property = property.trim();
    if let Some(caps) = captures(contains_pattern(), property) {
        let location: MemoryLocation = caps[1].parse()?;
        return Ok(state.contains(&location));
    }
    if let Some(caps) = captures(equals_pattern(), property) {
        let location: MemoryLocation = caps[1].parse()?;
        let expected = parse_value(&caps[2])?;
        return Ok(state.value_of(&location) == Some(expected));
    }
    Err(AnalysisError::query(format!("cannot check '{}'", property)))
}

/// Value of a location named by `property`.
pub fn evaluate_property(state: &ValueState, property: &str) -> Result<i64> {
    let location: MemoryLocation = property.parse()?;
    state
        .value_of(&location)
        .ok_or_else(|| AnalysisError::query(format!("no value known for '{}'", location)))
}

/// Applies `deletevalues(..)` or `setvalue(..:=..)` to `state`.
pub fn modify_property(state: &mut ValueState, modification: &str) -> Result<()> {
    let modification = modification.trim();
    if let Some(caps) = captures(delete_pattern(), modification) {
        let location: MemoryLocation = caps[1].parse()?;
        log::debug!("Query forgets {}", location);
        state.forget(&location);
        return Ok(());
    }
    if let Some(caps) = captures(set_pattern(), modification) {
        let location: MemoryLocation = caps[1].parse()?;
        let value = parse_value(&caps[2])?;
        log::debug!("Query sets {} to {}", location, value);
        state.assign(location, value);
        return Ok(());
    }
    Err(AnalysisError::query(format!("cannot apply '{}'", modification)))
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn state() -> ValueState {
        let mut s = ValueState::new();
        s.assign(MemoryLocation::local("main", "x"), 5);
        s.assign(MemoryLocation::global("g"), -1);
        s
    }

    #[test]
    fn test_check() {
        let s = state();
        assert!(check_property(&s, "contains(main::x)").unwrap());
        assert!(!check_property(&s, "contains(main::y)").unwrap());
        assert!(check_property(&s, "main::x==5").unwrap());
        assert!(!check_property(&s, "main::x==6").unwrap());
        assert!(check_property(&s, "g == -1").unwrap());
        assert!(check_property(&s, "frobnicate").is_err());
    }

    #[test]
    fn test_evaluate() {
        let s = state();
        assert_eq!(evaluate_property(&s, "main::x").unwrap(), 5);
        assert!(evaluate_property(&s, "main::y").is_err());
        assert!(evaluate_property(&s, "::").is_err());
    }

    #[test]
    fn test_modify() {
        let mut s = state();
        modify_property(&mut s, "deletevalues(main::x)").unwrap();
        assert!(!s.contains(&MemoryLocation::local("main", "x")));

        modify_property(&mut s, "setvalue(main::y:=42)").unwrap();
        assert_eq!(evaluate_property(&s, "main::y").unwrap(), 42);
        modify_property(&mut s, "setvalue(g:=7)").unwrap();
        assert_eq!(evaluate_property(&s, "g").unwrap(), 7);

        assert!(modify_property(&mut s, "setvalue(g=7)").is_err());
        assert!(modify_property(&mut s, "setvalue(g:=99999999999999999999)").is_err());
    }

    #[test]
    fn test_setvalue_bypasses_threshold() {
        let mut s = ValueState::new();
        let x = MemoryLocation::local("main", "x");
        s.assign_counted(x.clone(), 1, Some(1));
        assert!(!s.assign_counted(x.clone(), 2, Some(1)));
        modify_property(&mut s, "setvalue(main::x:=3)").unwrap();
        assert_eq!(s.value_of(&x), Some(3));
    }
}
