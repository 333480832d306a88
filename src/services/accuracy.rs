//! Accuracy gate for incoming location samples

use crate::domain::error::EngineError;
use crate::domain::types::LocationSample;

pub const DEFAULT_ACCURACY_THRESHOLD_M: f64 = 10.0;

/// Admits a sample only if its reported accuracy radius is within the threshold
#[derive(Debug, Clone, Copy)]
pub struct AccuracyGate {
    threshold_m: f64,
}

impl AccuracyGate {
    pub fn new(threshold_m: f64) -> Self {
        Self { threshold_m }
    }

    pub fn threshold_m(&self) -> f64 {
        self.threshold_m
    }

    /// Accept or reject a sample; the sample itself is never modified
    ///
    /// A non-finite accuracy is treated as exceeding the threshold. Coordinates
    /// out of range are rejected as `InvalidLocation`.
    pub fn admit(&self, sample: &LocationSample) -> Result<(), EngineError> {
        if !sample.accuracy.is_finite() || sample.accuracy > self.threshold_m {
            return Err(EngineError::LocationAccuracy {
                accuracy_m: sample.accuracy,
                threshold_m: self.threshold_m,
            });
        }
        if !sample.position().is_valid() {
            return Err(EngineError::InvalidLocation { lat: sample.lat, lng: sample.lng });
        }
        Ok(())
    }
}

impl Default for AccuracyGate {
    fn default() -> Self {
        Self::new(DEFAULT_ACCURACY_THRESHOLD_M)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_at_or_below_threshold() {
        let gate = AccuracyGate::default();
        assert!(gate.admit(&LocationSample::new(24.8, 120.9, 5.0)).is_ok());
        assert!(gate.admit(&LocationSample::new(24.8, 120.9, 10.0)).is_ok());
        assert!(gate.admit(&LocationSample::new(24.8, 120.9, 0.0)).is_ok());
    }

    #[test]
    fn test_rejects_above_threshold_with_values() {
        let gate = AccuracyGate::default();
        match gate.admit(&LocationSample::new(24.8, 120.9, 15.0)) {
            Err(EngineError::LocationAccuracy { accuracy_m, threshold_m }) => {
                assert_eq!(accuracy_m, 15.0);
                assert_eq!(threshold_m, 10.0);
            }
            other => panic!("expected accuracy error, got {other:?}"),
        }
        assert!(gate.admit(&LocationSample::new(24.8, 120.9, 10.01)).is_err());
    }

    #[test]
    fn test_rejects_nan_accuracy() {
        let gate = AccuracyGate::default();
        assert!(matches!(
            gate.admit(&LocationSample::new(24.8, 120.9, f64::NAN)),
            Err(EngineError::LocationAccuracy { .. })
        ));
    }

    #[test]
    fn test_rejects_out_of_range_coordinates() {
        let gate = AccuracyGate::default();
        assert!(matches!(
            gate.admit(&LocationSample::new(95.0, 120.9, 5.0)),
            Err(EngineError::InvalidLocation { .. })
        ));
    }

    #[test]
    fn test_custom_threshold() {
        let gate = AccuracyGate::new(25.0);
        assert!(gate.admit(&LocationSample::new(0.0, 0.0, 20.0)).is_ok());
        assert_eq!(gate.threshold_m(), 25.0);
    }
}
