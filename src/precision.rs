//! Which memory locations are worth tracking, and where.
//!
//! A location is tracked at a CFA node iff
//!
//! - its scoped name does not match the blacklist,
//! - the reached-set threshold has not marked it as exceeded, and
//! - the node has no tracked set (or an empty one), or the set contains it.
//!
//! Refinement only ever adds to the per-node sets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use im::{OrdMap, OrdSet};
use regex::Regex;

use crate::cfa::NodeId;
use crate::config::ValueAnalysisOptions;
use crate::error::{AnalysisError, ConfigError, Result};
use crate::location::MemoryLocation;

/// Per-node sets of locations, as produced by refinement or read from a file.
pub type TrackedSets = BTreeMap<NodeId, BTreeSet<MemoryLocation>>;

/// A limit on how often something may happen to a variable before it is
/// abstracted away, plus the variables that already went over it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThresholdPolicy {
    limit: Option<u32>,
    exceeded: OrdSet<MemoryLocation>,
}

impl ThresholdPolicy {
    pub fn new(limit: Option<u32>) -> Self {
        ThresholdPolicy {
            limit,
            exceeded: OrdSet::new(),
        }
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn is_enabled(&self) -> bool {
        self.limit.is_some()
    }

    /// Whether `count` goes over the limit.
    pub fn exceeds(&self, count: usize) -> bool {
        self.limit.is_some_and(|limit| count > limit as usize)
    }

    pub fn is_exceeded(&self, location: &MemoryLocation) -> bool {
        self.exceeded.contains(location)
    }

    pub fn set_exceeded(&mut self, location: MemoryLocation) {
        self.exceeded.insert(location);
    }
}

/// Precision of the value analysis.
#[derive(Debug, Clone, Default)]
pub struct ValuePrecision {
    blacklist: Option<Regex>,
    tracked: OrdMap<NodeId, OrdSet<MemoryLocation>>,
    soft_path_threshold: ThresholdPolicy,
    hard_path_threshold: ThresholdPolicy,
    reached_set_threshold: ThresholdPolicy,
}

impl ValuePrecision {
    /// Precision tracking everything, with no thresholds.
    pub fn full() -> Self {
        Self::default()
    }

    /// Precision described by `options`, seeded from the initial precision
    /// file when one is configured.
    pub fn from_options(options: &ValueAnalysisOptions) -> Result<Self> {
        let blacklist = match options.variable_blacklist.as_deref() {
            Some(source) if !source.is_empty() => Some(Regex::new(source).map_err(ConfigError::from)?),
            _ => None,
        };
        let mut precision = ValuePrecision {
            blacklist,
            tracked: OrdMap::new(),
            soft_path_threshold: ThresholdPolicy::new(options.path_threshold_soft),
            hard_path_threshold: ThresholdPolicy::new(options.path_threshold_hard),
            reached_set_threshold: ThresholdPolicy::new(options.reached_set_threshold),
        };
        if let Some(path) = &options.initial_precision_file {
            let sets = read_precision_file(path)?;
            log::info!(
                "Seeded precision with {} locations from {}",
                sets.values().map(BTreeSet::len).sum::<usize>(),
                path.display()
            );
            precision = precision.refine(&sets);
        }
        Ok(precision)
    }

    pub fn with_blacklist(mut self, blacklist: Regex) -> Self {
        self.blacklist = Some(blacklist);
        self
    }

    pub fn with_path_thresholds(mut self, soft: Option<u32>, hard: Option<u32>) -> Self {
        self.soft_path_threshold = ThresholdPolicy::new(soft);
        self.hard_path_threshold = ThresholdPolicy::new(hard);
        self
    }

    pub fn with_reached_set_threshold(mut self, limit: Option<u32>) -> Self {
        self.reached_set_threshold = ThresholdPolicy::new(limit);
        self
    }

    pub fn is_blacklisted(&self, location: &MemoryLocation) -> bool {
        self.blacklist
            .as_ref()
            .is_some_and(|blacklist| blacklist.is_match(&location.scoped_name()))
    }

    /// Whether refinement (or the initial file) named `location` at `node`.
    pub fn is_explicitly_tracked(&self, location: &MemoryLocation, node: NodeId) -> bool {
        self.tracked.get(&node).is_some_and(|set| set.contains(location))
    }

    pub fn is_tracking(&self, location: &MemoryLocation, node: NodeId) -> bool {
        if self.is_blacklisted(location) || self.reached_set_threshold.is_exceeded(location) {
            return false;
        }
        match self.tracked.get(&node) {
            Some(set) if !set.is_empty() => set.contains(location),
            _ => true,
        }
    }

    /// Tracked set at `node`, if any.
    pub fn tracked_at(&self, node: NodeId) -> Option<&OrdSet<MemoryLocation>> {
        self.tracked.get(&node)
    }

    /// Total number of (node, location) pairs named explicitly.
    pub fn tracked_len(&self) -> usize {
        self.tracked.values().map(OrdSet::len).sum()
    }

    /// This precision extended by `increment`.
    pub fn refine(&self, increment: &TrackedSets) -> Self {
        let mut refined = self.clone();
        for (node, locations) in increment {
            let mut set = refined.tracked.get(node).cloned().unwrap_or_default();
            set.extend(locations.iter().cloned());
            refined.tracked.insert(*node, set);
        }
        refined
    }

    pub fn soft_path_threshold(&self) -> &ThresholdPolicy {
        &self.soft_path_threshold
    }

    pub fn hard_path_threshold(&self) -> &ThresholdPolicy {
        &self.hard_path_threshold
    }

    pub fn reached_set_threshold(&self) -> &ThresholdPolicy {
        &self.reached_set_threshold
    }

    pub fn reached_set_threshold_mut(&mut self) -> &mut ThresholdPolicy {
        &mut self.reached_set_threshold
    }

    /// Per-node sets in the initial precision file format.
    pub fn to_precision_file(&self) -> String {
        let mut out = String::new();
        for (node, locations) in &self.tracked {
            if locations.is_empty() {
                continue;
            }
            let _ = writeln!(out, "{}:", node);
            for location in locations {
                let _ = writeln!(out, "{}", location);
            }
            out.push('\n');
        }
        out
    }
}

/// Parses the initial precision format: `N<id>:` opens the section of a node,
/// every other non-blank line names a location tracked there.
pub fn parse_precision(text: &str) -> Result<TrackedSets> {
    let mut sets = TrackedSets::new();
    let mut current = None;
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let error = |message: String| AnalysisError::PrecisionFile {
            line: index + 1,
            message,
        };
        if let Some(header) = line.strip_suffix(':') {
            let id = header
                .strip_prefix('N')
                .and_then(|id| id.parse::<u32>().ok())
                .ok_or_else(|| error(format!("'{}' is not a node header", line)))?;
            current = Some(NodeId(id));
            sets.entry(NodeId(id)).or_default();
            continue;
        }
        let node = current.ok_or_else(|| error(format!("location '{}' before any node header", line)))?;
        let location: MemoryLocation = line.parse().map_err(|_| error(format!("invalid location '{}'", line)))?;
        sets.entry(node).or_default().insert(location);
    }
    Ok(sets)
}

pub fn read_precision_file(path: &Path) -> Result<TrackedSets> {
    let text = std::fs::read_to_string(path)?;
    parse_precision(&text)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn x() -> MemoryLocation {
        MemoryLocation::local("main", "x")
    }

    fn y() -> MemoryLocation {
        MemoryLocation::local("main", "y")
    }

    #[test]
    fn test_full_precision_tracks_everything() {
        let p = ValuePrecision::full();
        assert!(p.is_tracking(&x(), NodeId(1)));
        assert!(!p.is_explicitly_tracked(&x(), NodeId(1)));
    }

    #[test]
    fn test_blacklist() {
        let p = ValuePrecision::full().with_blacklist(Regex::new("^main::tmp").unwrap());
        assert!(!p.is_tracking(&MemoryLocation::local("main", "tmp1"), NodeId(1)));
        assert!(p.is_tracking(&x(), NodeId(1)));
        // offsets do not hide a blacklisted variable
        assert!(p.is_blacklisted(&MemoryLocation::local("main", "tmp").with_offset(4)));
    }

    #[test]
    fn test_tracked_sets_restrict_their_node() {
        let increment: TrackedSets = [(NodeId(3), [x()].into_iter().collect())].into_iter().collect();
        let p = ValuePrecision::full().refine(&increment);
        assert!(p.is_tracking(&x(), NodeId(3)));
        assert!(!p.is_tracking(&y(), NodeId(3)));
        assert!(p.is_tracking(&y(), NodeId(4)));
        assert!(p.is_explicitly_tracked(&x(), NodeId(3)));
    }

    #[test]
    fn test_refine_is_monotone() {
        let first: TrackedSets = [(NodeId(1), [x()].into_iter().collect())].into_iter().collect();
        let second: TrackedSets = [(NodeId(1), [y()].into_iter().collect())].into_iter().collect();
        let p = ValuePrecision::full().refine(&first).refine(&second);
        assert_eq!(p.tracked_len(), 2);
        let p = p.refine(&first);
        assert_eq!(p.tracked_len(), 2);
    }

    #[test]
    fn test_reached_set_exceeded_is_never_tracked() {
        let mut p = ValuePrecision::full().with_reached_set_threshold(Some(2));
        assert!(p.reached_set_threshold().exceeds(3));
        assert!(!p.reached_set_threshold().exceeds(2));
        p.reached_set_threshold_mut().set_exceeded(x());
        assert!(!p.is_tracking(&x(), NodeId(1)));
    }

    #[test]
    fn test_parse_precision() {
        let text = "N1:\nmain::x\ng\n\nN7:\nf::s/4\n";
        let sets = parse_precision(text).unwrap();
        assert_eq!(sets.len(), 2);
        assert!(sets[&NodeId(1)].contains(&x()));
        assert!(sets[&NodeId(1)].contains(&MemoryLocation::global("g")));
        assert!(sets[&NodeId(7)].contains(&MemoryLocation::local("f", "s").with_offset(4)));
    }

    #[test]
    fn test_parse_precision_errors() {
        let err = parse_precision("main::x\n").unwrap_err();
        assert!(matches!(err, AnalysisError::PrecisionFile { line: 1, .. }));
        let err = parse_precision("N1:\nmain::x\nloop:\n").unwrap_err();
        assert!(matches!(err, AnalysisError::PrecisionFile { line: 3, .. }));
        assert!(parse_precision("N1:\nf::\n").is_err());
    }

    #[test]
    fn test_precision_file_is_reloadable() {
        let sets = parse_precision("N2:\nmain::y\nmain::x\nN1:\ng\n").unwrap();
        let p = ValuePrecision::full().refine(&sets);
        let text = p.to_precision_file();
        assert_eq!(text, "N1:\ng\n\nN2:\nmain::x\nmain::y\n\n");
        assert_eq!(parse_precision(&text).unwrap(), sets);
    }
}
