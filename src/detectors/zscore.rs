//! Z-Score Detectors
//!
//! 平均・標準偏差によるZ-スコア法と、中央値・MADによる修正Z-スコア法。
//! 修正版は順序統計量を使うため外れ値の混入に対して頑健。

use serde_json::json;
use tracing::debug;

use super::{require_points, stats, Detector, MIN_SERIES_POINTS};
use crate::error::Result;
use crate::series::MetricSeries;
use crate::types::{Anomaly, DetectionMethod, MetricValue};

/// 修正Z-スコアの正規化定数（標準正規分布のMAD逆数）
const MAD_SCALE: f64 = 0.6745;

/// Z-スコア検知器
#[derive(Debug, Clone)]
pub struct ZScoreDetector {
    /// しきい値（標準偏差の倍数）
    threshold: f64,
}

impl ZScoreDetector {
    /// 新しいZ-スコア検知器を作成
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for ZScoreDetector {
    fn default() -> Self {
        Self::new(3.0)
    }
}

impl Detector for ZScoreDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Zscore
    }

    fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        let values = require_points(series, MIN_SERIES_POINTS)?;

        let mean = stats::mean(&values);
        let std_dev = stats::std_dev(&values);

        // 分散ゼロの退化した分布は異常なし（エラーではない）
        if std_dev < f64::EPSILON {
            debug!("Zero variance in series '{}', no anomalies", series.metric);
            return Ok(Vec::new());
        }

        let mut anomalies = Vec::new();
        for point in series.valid_points() {
            let z = (point.value - mean) / std_dev;
            if z.abs() > self.threshold {
                let confidence = (z.abs() / (self.threshold * 2.0)).min(1.0);
                let anomaly = Anomaly::new(
                    point.timestamp,
                    series.metric.clone(),
                    MetricValue::Scalar(point.value),
                    z,
                    DetectionMethod::Zscore,
                    self.threshold,
                    confidence,
                )
                .with_context("mean", json!(mean))
                .with_context("std_dev", json!(std_dev));
                anomalies.push(anomaly);
            }
        }
        Ok(anomalies)
    }
}

/// 修正Z-スコア検知器（MADベース）
#[derive(Debug, Clone)]
pub struct ModifiedZScoreDetector {
    /// しきい値
    threshold: f64,
}

impl ModifiedZScoreDetector {
    /// 新しい修正Z-スコア検知器を作成
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for ModifiedZScoreDetector {
    fn default() -> Self {
        Self::new(3.5)
    }
}

impl Detector for ModifiedZScoreDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::ModifiedZscore
    }

    fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        let values = require_points(series, MIN_SERIES_POINTS)?;

        let median = stats::median(&values);
        let mad = stats::mad(&values);

        if mad < f64::EPSILON {
            debug!("Zero MAD in series '{}', no anomalies", series.metric);
            return Ok(Vec::new());
        }

        let mut anomalies = Vec::new();
        for point in series.valid_points() {
            let modified = MAD_SCALE * (point.value - median) / mad;
            if modified.abs() > self.threshold {
                let confidence = (modified.abs() / (self.threshold * 2.0)).min(1.0);
                let anomaly = Anomaly::new(
                    point.timestamp,
                    series.metric.clone(),
                    MetricValue::Scalar(point.value),
                    modified,
                    DetectionMethod::ModifiedZscore,
                    self.threshold,
                    confidence,
                )
                .with_context("median", json!(median))
                .with_context("mad", json!(mad));
                anomalies.push(anomaly);
            }
        }
        Ok(anomalies)
    }
}
