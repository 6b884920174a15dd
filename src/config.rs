//! Options of the value analysis.
//!
//! Options are read from properties text (`key = value`, `#` or `//`
//! comments). Keys outside the `cpa.value.` namespace belong to other analyses
//! and are skipped; unknown keys inside it are rejected.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::adjustment::AbstractionPoints;
use crate::domain::{MergeOperator, StopOperator};
use crate::error::{ConfigError, Result};
use crate::machine::MachineModel;

const PREFIX: &str = "cpa.value.";

#[derive(Debug, Clone, PartialEq)]
pub struct ValueAnalysisOptions {
    pub merge: MergeOperator,
    pub stop: StopOperator,
    /// Regex over scoped names (`f::x`, `g`) that are never tracked.
    pub variable_blacklist: Option<String>,
    /// Distinct writes kept per variable before it is forgotten.
    pub reference_threshold: Option<u32>,
    pub path_threshold_soft: Option<u32>,
    pub path_threshold_hard: Option<u32>,
    pub reached_set_threshold: Option<u32>,
    pub initial_precision_file: Option<PathBuf>,
    pub abstraction: AbstractionPoints,
    /// Learn `x = 1` on the branch asserting `x != 0`.
    pub init_assumption_vars: bool,
    pub unsupported_functions: BTreeSet<String>,
    pub machine: MachineModel,
}

impl Default for ValueAnalysisOptions {
    fn default() -> Self {
        ValueAnalysisOptions {
            merge: MergeOperator::Sep,
            stop: StopOperator::Sep,
            variable_blacklist: None,
            reference_threshold: None,
            path_threshold_soft: None,
            path_threshold_hard: None,
            reached_set_threshold: None,
            initial_precision_file: None,
            abstraction: AbstractionPoints::default(),
            init_assumption_vars: false,
            unsupported_functions: ["pthread_create".to_string()].into_iter().collect(),
            machine: MachineModel::LINUX32,
        }
    }
}

fn invalid(option: &str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
        expected,
    }
}

/// `-1` means "no limit".
fn parse_limit(option: &str, value: &str) -> std::result::Result<Option<u32>, ConfigError> {
    match value.parse::<i64>() {
        Ok(-1) => Ok(None),
        Ok(n) => u32::try_from(n)
            .map(Some)
            .map_err(|_| invalid(option, value, "-1 or a non-negative integer")),
        Err(_) => Err(invalid(option, value, "-1 or a non-negative integer")),
    }
}

fn parse_bool(option: &str, value: &str) -> std::result::Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(option, value, "true or false")),
    }
}

impl ValueAnalysisOptions {
    /// Applies one option. `key` is the full key, including the namespace.
    pub fn set(&mut self, key: &str, value: &str) -> std::result::Result<(), ConfigError> {
        let Some(name) = key.strip_prefix(PREFIX) else {
            log::debug!("Skipping option '{}' of another analysis", key);
            return Ok(());
        };
        let value = value.trim();
        match name {
            "merge" => self.merge = value.parse()?,
            "stop" => self.stop = value.parse()?,
            "variableBlacklist" => {
                self.variable_blacklist = if value.is_empty() { None } else { Some(value.to_string()) }
            }
            "threshold" => self.reference_threshold = parse_limit(key, value)?,
            "precision.pathThreshold.soft" => self.path_threshold_soft = parse_limit(key, value)?,
            "precision.pathThreshold.hard" => self.path_threshold_hard = parse_limit(key, value)?,
            "precision.reachedSetThreshold" => self.reached_set_threshold = parse_limit(key, value)?,
            "initialPrecisionFile" => {
                self.initial_precision_file = if value.is_empty() { None } else { Some(PathBuf::from(value)) }
            }
            "abstraction.atAssumes" => self.abstraction.at_assumes = parse_bool(key, value)?,
            "abstraction.atJoins" => self.abstraction.at_joins = parse_bool(key, value)?,
            "abstraction.atFunctions" => self.abstraction.at_functions = parse_bool(key, value)?,
            "abstraction.atLoops" => self.abstraction.at_loops = parse_bool(key, value)?,
            "initAssumptionVars" => self.init_assumption_vars = parse_bool(key, value)?,
            "unsupportedFunctions" => {
                self.unsupported_functions = value
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            "machineModel" => {
                self.machine = match value.to_ascii_uppercase().as_str() {
                    "LINUX32" => MachineModel::LINUX32,
                    "LINUX64" => MachineModel::LINUX64,
                    _ => return Err(invalid(key, value, "LINUX32 or LINUX64")),
                }
            }
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }

    /// Options from properties text, on top of the defaults.
    pub fn from_properties(text: &str) -> std::result::Result<Self, ConfigError> {
        let mut options = Self::default();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine {
                    line: index + 1,
                    text: line.to_string(),
                });
            };
            options.set(key.trim(), value)?;
        }
        Ok(options)
    }

    /// Options from a properties file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let options = Self::from_properties(&text)?;
        log::info!("Loaded value analysis options from {}", path.display());
        Ok(options)
    }
}
