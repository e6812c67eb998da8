//! IQR Detector
//!
//! 四分位範囲のフェンスによる外れ値検知。スコアは最寄りフェンスからの
//! 距離をIQRで正規化した値（下側は負、上側は正）。

use serde_json::json;
use tracing::debug;

use super::{require_points, stats, Detector, MIN_SERIES_POINTS};
use crate::error::Result;
use crate::series::MetricSeries;
use crate::types::{Anomaly, DetectionMethod, MetricValue};

/// IQR検知器
#[derive(Debug, Clone)]
pub struct IqrDetector {
    /// フェンス幅の倍率
    multiplier: f64,
}

impl IqrDetector {
    /// 新しいIQR検知器を作成
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }
}

impl Default for IqrDetector {
    fn default() -> Self {
        Self::new(1.5)
    }
}

impl Detector for IqrDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Iqr
    }

    fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        let values = require_points(series, MIN_SERIES_POINTS)?;

        let (q1, q3) = stats::quartiles(&values);
        let iqr = q3 - q1;

        if iqr < f64::EPSILON {
            debug!("Zero IQR in series '{}', no anomalies", series.metric);
            return Ok(Vec::new());
        }

        let lower_bound = q1 - self.multiplier * iqr;
        let upper_bound = q3 + self.multiplier * iqr;

        let mut anomalies = Vec::new();
        for point in series.valid_points() {
            let score = if point.value < lower_bound {
                -(lower_bound - point.value) / iqr
            } else if point.value > upper_bound {
                (point.value - upper_bound) / iqr
            } else {
                continue;
            };

            let confidence = (score.abs() / (self.multiplier * 2.0)).min(1.0);
            let anomaly = Anomaly::new(
                point.timestamp,
                series.metric.clone(),
                MetricValue::Scalar(point.value),
                score,
                DetectionMethod::Iqr,
                self.multiplier,
                confidence,
            )
            .with_context("q1", json!(q1))
            .with_context("q3", json!(q3))
            .with_context("iqr", json!(iqr))
            .with_context("lower_bound", json!(lower_bound))
            .with_context("upper_bound", json!(upper_bound));
            anomalies.push(anomaly);
        }
        Ok(anomalies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chrono::{Duration, Utc};

    #[test]
    fn test_iqr_flags_both_tails() {
        let mut values: Vec<f64> = (0..40).map(|i| 50.0 + (i % 10) as f64).collect();
        values.push(200.0);
        values.push(-100.0);
        let series = MetricSeries::from_values("steps", Utc::now(), Duration::hours(1), &values);

        let anomalies = IqrDetector::default().detect(&series).unwrap();
        assert_eq!(anomalies.len(), 2);

        let high = anomalies
            .iter()
            .find(|a| a.value.as_scalar() == Some(200.0))
            .unwrap();
        let low = anomalies
            .iter()
            .find(|a| a.value.as_scalar() == Some(-100.0))
            .unwrap();
        assert!(high.score > 0.0);
        assert!(low.score < 0.0);
    }

    #[test]
    fn test_iqr_constant_series_empty() {
        let series =
            MetricSeries::from_values("sleep", Utc::now(), Duration::hours(1), &[7.5; 30]);
        let anomalies = IqrDetector::default().detect(&series).unwrap();
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_iqr_insufficient_data() {
        let series = MetricSeries::from_values("steps", Utc::now(), Duration::hours(1), &[1.0]);
        assert!(matches!(
            IqrDetector::default().detect(&series),
            Err(Error::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_iqr_normal_values_not_flagged() {
        let values: Vec<f64> = (0..50).map(|i| 60.0 + (i % 8) as f64).collect();
        let series = MetricSeries::from_values("heart_rate", Utc::now(), Duration::hours(1), &values);
        let anomalies = IqrDetector::default().detect(&series).unwrap();
        assert!(anomalies.is_empty());
    }
}
