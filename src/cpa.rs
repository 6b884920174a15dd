//! The value analysis as one configurable program analysis.

use crate::adjustment::PrecisionAdjustment;
use crate::cfa::CfaEdge;
use crate::config::ValueAnalysisOptions;
use crate::domain::{MergeOperator, StopOperator, ValueDomain};
use crate::error::Result;
use crate::precision::ValuePrecision;
use crate::refiner::ValueRefiner;
use crate::sibling::SiblingState;
use crate::state::ValueState;
use crate::transfer::{TransferRelation, ValueTransferRelation};

/// Domain, transfer relation, operators and initial elements of the value
/// analysis, configured from one set of options.
pub struct ValueAnalysis {
    options: ValueAnalysisOptions,
    domain: ValueDomain,
    transfer: ValueTransferRelation,
    adjustment: PrecisionAdjustment,
    initial_precision: ValuePrecision,
}

impl ValueAnalysis {
    pub fn new(options: ValueAnalysisOptions) -> Result<Self> {
        let initial_precision = ValuePrecision::from_options(&options)?;
        log::debug!(
            "Value analysis with merge {:?}, stop {:?}, {} initially tracked locations",
            options.merge,
            options.stop,
            initial_precision.tracked_len()
        );
        Ok(ValueAnalysis {
            domain: ValueDomain,
            transfer: ValueTransferRelation::new(&options),
            adjustment: PrecisionAdjustment::new(options.abstraction),
            initial_precision,
            options,
        })
    }

    pub fn options(&self) -> &ValueAnalysisOptions {
        &self.options
    }

    pub fn domain(&self) -> &ValueDomain {
        &self.domain
    }

    pub fn transfer(&self) -> &ValueTransferRelation {
        &self.transfer
    }

    pub fn merge(&self) -> MergeOperator {
        self.options.merge
    }

    pub fn stop(&self) -> StopOperator {
        self.options.stop
    }

    pub fn adjustment(&self) -> &PrecisionAdjustment {
        &self.adjustment
    }

    pub fn initial_state(&self) -> ValueState {
        ValueState::new()
    }

    pub fn initial_precision(&self) -> ValuePrecision {
        self.initial_precision.clone()
    }

    /// A refiner for this configuration.
    pub fn refiner(&self) -> ValueRefiner {
        ValueRefiner::new(&self.options)
    }

    /// Transfer followed by strengthening with `siblings`.
    pub fn successor(
        &self,
        state: &ValueState,
        precision: &ValuePrecision,
        edge: &CfaEdge,
        siblings: &[&dyn SiblingState],
    ) -> Result<Option<ValueState>> {
        let transfer = self.transfer.transfer(state, precision, edge)?;
        Ok(transfer.successor.and_then(|next| {
            if transfer.missing.is_empty() {
                Some(next)
            } else {
                self.transfer.strengthen(&next, precision, siblings, &transfer.missing)
            }
        }))
    }
}
