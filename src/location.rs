//! Canonical names of trackable storage cells.
//!
//! A [`MemoryLocation`] is either global (`g`) or scoped to a function
//! (`f::x`), and may carry a byte offset for a sub-object (`f::s/4` is the
//! cell four bytes into `s`). The textual form is the one used by the initial
//! precision file and the query language.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::AnalysisError;

/// Where a variable lives.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Scope {
    Global,
    Function(String),
}

/// Identity of a trackable cell.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryLocation {
    scope: Scope,
    identifier: String,
    offset: u64,
}

impl MemoryLocation {
    pub fn global(identifier: impl Into<String>) -> Self {
        MemoryLocation {
            scope: Scope::Global,
            identifier: identifier.into(),
            offset: 0,
        }
    }

    pub fn local(function: impl Into<String>, identifier: impl Into<String>) -> Self {
        MemoryLocation {
            scope: Scope::Function(function.into()),
            identifier: identifier.into(),
            offset: 0,
        }
    }

    /// The same variable, `offset` bytes further in. Saturates at
    /// `u64::MAX`; use [`MemoryLocation::checked_offset`] for offsets
    /// computed from program values.
    pub fn with_offset(&self, offset: u64) -> Self {
        MemoryLocation {
            scope: self.scope.clone(),
            identifier: self.identifier.clone(),
            offset: self.offset.saturating_add(offset),
        }
    }

    /// The same variable, `offset` bytes further in, or `None` if the offset
    /// does not fit.
    pub fn checked_offset(&self, offset: u64) -> Option<Self> {
        Some(MemoryLocation {
            scope: self.scope.clone(),
            identifier: self.identifier.clone(),
            offset: self.offset.checked_add(offset)?,
        })
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_global(&self) -> bool {
        self.scope == Scope::Global
    }

    /// Function the location is scoped to, `None` for globals.
    pub fn function(&self) -> Option<&str> {
        match &self.scope {
            Scope::Global => None,
            Scope::Function(name) => Some(name),
        }
    }

    /// Whether `other` is a cell of the same variable (any offset).
    pub fn same_variable(&self, other: &MemoryLocation) -> bool {
        self.scope == other.scope && self.identifier == other.identifier
    }

    /// Fully scoped variable name without offset: `f::x` or `g`.
    pub fn scoped_name(&self) -> String {
        match &self.scope {
            Scope::Global => self.identifier.clone(),
            Scope::Function(function) => format!("{}::{}", function, self.identifier),
        }
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Scope::Function(function) = &self.scope {
            write!(f, "{}::", function)?;
        }
        write!(f, "{}", self.identifier)?;
        if self.offset != 0 {
            write!(f, "/{}", self.offset)?;
        }
        Ok(())
    }
}

impl FromStr for MemoryLocation {
    type Err = AnalysisError;

    /// Parses `name`, `function::name`, optionally followed by `/offset`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AnalysisError::InvalidLocation(s.to_string());
        let s = s.trim();
        let (name, offset) = match s.rsplit_once('/') {
            Some((name, offset)) => (name, offset.trim().parse::<u64>().map_err(|_| invalid())?),
            None => (s, 0),
        };
        let location = match name.split_once("::") {
            Some((function, identifier)) => {
                if function.is_empty() || identifier.is_empty() || identifier.contains("::") {
                    return Err(invalid());
                }
                MemoryLocation::local(function.trim(), identifier.trim())
            }
            None => MemoryLocation::global(name.trim()),
        };
        if location.identifier.is_empty() || location.identifier.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(location.with_offset(offset))
    }
}

/// Resolves plain identifiers to locations for code in one function.
///
/// A name is global iff it was registered by a global declaration; every other
/// name belongs to the function being analyzed.
#[derive(Debug, Clone, Copy)]
pub struct Scoping<'a> {
    function: &'a str,
    globals: &'a BTreeSet<String>,
}

impl<'a> Scoping<'a> {
    pub fn new(function: &'a str, globals: &'a BTreeSet<String>) -> Self {
        Scoping { function, globals }
    }

    pub fn function(&self) -> &'a str {
        self.function
    }

    pub fn resolve(&self, name: &str) -> MemoryLocation {
        if self.globals.contains(name) {
            MemoryLocation::global(name)
        } else {
            MemoryLocation::local(self.function, name)
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(MemoryLocation::global("g").to_string(), "g");
        assert_eq!(MemoryLocation::local("main", "x").to_string(), "main::x");
        assert_eq!(MemoryLocation::local("main", "s").with_offset(4).to_string(), "main::s/4");
    }

    #[test]
    fn test_parse() {
        let loc: MemoryLocation = "main::x".parse().unwrap();
        assert_eq!(loc, MemoryLocation::local("main", "x"));

        let loc: MemoryLocation = "g".parse().unwrap();
        assert!(loc.is_global());

        let loc: MemoryLocation = " f::s/8 ".parse().unwrap();
        assert_eq!(loc.function(), Some("f"));
        assert_eq!(loc.identifier(), "s");
        assert_eq!(loc.offset(), 8);
    }

    #[test]
    fn test_parse_display_agree() {
        for text in ["g", "f::x", "f::s/12", "arr/4"] {
            let loc: MemoryLocation = text.parse().unwrap();
            assert_eq!(loc.to_string(), text);
        }
    }

    #[test]
    fn test_parse_invalid() {
        assert!("".parse::<MemoryLocation>().is_err());
        assert!("::x".parse::<MemoryLocation>().is_err());
        assert!("f::".parse::<MemoryLocation>().is_err());
        assert!("f::x/abc".parse::<MemoryLocation>().is_err());
        assert!("a b".parse::<MemoryLocation>().is_err());
    }

    #[test]
    fn test_equality_needs_all_fields() {
        let a = MemoryLocation::local("f", "x");
        assert_ne!(a, MemoryLocation::local("g", "x"));
        assert_ne!(a, MemoryLocation::global("x"));
        assert_ne!(a, a.with_offset(4));
        assert!(a.same_variable(&a.with_offset(4)));
    }

    #[test]
    fn test_checked_offset() {
        let s = MemoryLocation::local("f", "s").with_offset(4);
        assert_eq!(s.checked_offset(8), Some(MemoryLocation::local("f", "s").with_offset(12)));
        assert_eq!(s.checked_offset(u64::MAX - 4), None);
    }

    #[test]
    fn test_scoping() {
        let globals: BTreeSet<String> = ["g".to_string()].into_iter().collect();
        let scoping = Scoping::new("f", &globals);
        assert_eq!(scoping.resolve("g"), MemoryLocation::global("g"));
        assert_eq!(scoping.resolve("x"), MemoryLocation::local("f", "x"));
    }
}
