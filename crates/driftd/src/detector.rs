//! Drift decision rule.
//!
//! A prediction has drifted when it is not a finite number, or when it
//! misses the realized value by more than the threshold. An error exactly
//! equal to the threshold is still `Ok`.

use drift_common::{DriftVerdict, MonitorError, MonitorResult, Prediction};

/// Reference tolerance on the absolute prediction error.
pub const DEFAULT_THRESHOLD: f64 = 0.05;

#[derive(Debug, Clone, Copy)]
pub struct DriftDetector {
    threshold: f64,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl DriftDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Compare `predicted` with the value that actually materialized.
    ///
    /// A non-finite `actual` says nothing about the model, so it is reported
    /// as `MonitorError::NonFiniteActual` rather than as a verdict.
    pub fn evaluate(&self, predicted: f64, actual: f64) -> MonitorResult<DriftVerdict> {
        if !actual.is_finite() {
            return Err(MonitorError::NonFiniteActual(actual));
        }

        let absolute_error = (predicted - actual).abs();

        if !predicted.is_finite() || absolute_error > self.threshold {
            return Ok(DriftVerdict::Drifted {
                predicted,
                actual,
                absolute_error,
            });
        }

        Ok(DriftVerdict::Ok {
            predicted,
            actual,
            absolute_error,
        })
    }

    /// Judge a scored window against the value that followed it.
    pub fn judge(&self, prediction: &Prediction, actual: f64) -> MonitorResult<DriftVerdict> {
        self.evaluate(prediction.value, actual)
    }
}
