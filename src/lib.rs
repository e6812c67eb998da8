//! # vitalwatch-rs
//!
//! Multi-method ensemble anomaly detection engine for personal health metrics.
//!
//! This crate provides the detection core of a desktop health dashboard:
//! statistical, density-based, and temporal detectors combined through a
//! voting ensemble, with feedback-driven adaptive thresholds and an optional
//! background realtime mode.

pub mod config;
pub mod detectors;
pub mod ensemble;
pub mod error;
pub mod feedback;
pub mod logging;
pub mod realtime;
pub mod series;
pub mod source;
pub mod storage;
pub mod system;
pub mod temporal;
pub mod types;

pub use config::DetectionConfig;
pub use ensemble::EnsembleDetector;
pub use error::{Error, Result};
pub use feedback::{FeedbackProcessor, FeedbackType, PersonalThreshold, UserFeedback};
pub use series::{DataPoint, MetricFrame, MetricSeries};
pub use system::AnomalyDetectionSystem;
pub use temporal::HybridTemporalDetector;
pub use types::{Anomaly, DetectionMethod, DetectionResult, MetricValue, Severity};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("empty method set".to_string());
        assert!(err.to_string().contains("empty method set"));
    }

    #[test]
    fn test_ml_capability_matches_feature() {
        assert_eq!(
            detectors::MlCapability::available(),
            cfg!(feature = "ml")
        );
    }
}
