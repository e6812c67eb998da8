//! Seasonal-Trend Decomposition Detector
//!
//! 時系列をトレンド・季節・残差成分に分解し、残差成分のみにIQR検知を
//! 適用する。周期的な山谷を異常と誤認せず、期待パターンからの不規則な
//! 逸脱だけを拾う。分解に失敗した場合は生値へのIQR検知にフォールバック
//! し、その経路をログとコンテキストに必ず記録する。

use serde_json::json;
use tracing::{debug, warn};

use super::{require_points, stats, Detector};
use crate::error::Result;
use crate::series::{DataPoint, MetricSeries};
use crate::types::{Anomaly, DetectionMethod, MetricValue};

/// 季節分解検知器
#[derive(Debug, Clone)]
pub struct StlDetector {
    /// 季節周期（点数）
    period: usize,
    /// 残差IQRフェンスの倍率
    multiplier: f64,
}

/// 分解結果
struct Decomposition {
    trend: Vec<f64>,
    seasonal: Vec<f64>,
    residual: Vec<f64>,
}

impl StlDetector {
    /// 新しい季節分解検知器を作成
    pub fn new(period: usize, multiplier: f64) -> Self {
        Self { period, multiplier }
    }

    /// 古典的分解: 中心移動平均トレンド＋周期平均の季節成分
    fn decompose(&self, values: &[f64]) -> Option<Decomposition> {
        let n = values.len();
        let window = if self.period % 2 == 0 {
            self.period + 1
        } else {
            self.period
        };
        let half = window / 2;
        if n < window {
            return None;
        }

        // トレンド: 内側は中心移動平均、端は最近傍の値で埋める
        let mut trend = vec![f64::NAN; n];
        for i in half..(n - half) {
            trend[i] = stats::mean(&values[i - half..=i + half]);
        }
        for i in 0..half {
            trend[i] = trend[half];
        }
        for i in (n - half)..n {
            trend[i] = trend[n - half - 1];
        }
        if trend.iter().any(|v| !v.is_finite()) {
            return None;
        }

        // 季節成分: 位相ごとの平均をゼロ中心化
        let detrended: Vec<f64> = values.iter().zip(trend.iter()).map(|(v, t)| v - t).collect();
        let mut phase_sums = vec![0.0; self.period];
        let mut phase_counts = vec![0usize; self.period];
        for (i, &d) in detrended.iter().enumerate() {
            phase_sums[i % self.period] += d;
            phase_counts[i % self.period] += 1;
        }
        let mut phase_means: Vec<f64> = phase_sums
            .iter()
            .zip(phase_counts.iter())
            .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
            .collect();
        let phase_center = stats::mean(&phase_means);
        for m in phase_means.iter_mut() {
            *m -= phase_center;
        }

        let seasonal: Vec<f64> = (0..n).map(|i| phase_means[i % self.period]).collect();
        let residual: Vec<f64> = (0..n)
            .map(|i| values[i] - trend[i] - seasonal[i])
            .collect();

        if residual.iter().any(|v| !v.is_finite()) {
            return None;
        }
        Some(Decomposition {
            trend,
            seasonal,
            residual,
        })
    }

    /// 残差列（または生値列）へのIQR検知
    fn detect_on_component(
        &self,
        series: &MetricSeries,
        points: &[&DataPoint],
        component: &[f64],
        decomposition: Option<&Decomposition>,
    ) -> Vec<Anomaly> {
        let (q1, q3) = stats::quartiles(component);
        let iqr = q3 - q1;
        if iqr < f64::EPSILON {
            debug!(
                "Zero IQR on decomposed component of '{}', no anomalies",
                series.metric
            );
            return Vec::new();
        }

        let lower_bound = q1 - self.multiplier * iqr;
        let upper_bound = q3 + self.multiplier * iqr;

        let mut anomalies = Vec::new();
        for (i, point) in points.iter().enumerate() {
            let v = component[i];
            let score = if v < lower_bound {
                -(lower_bound - v) / iqr
            } else if v > upper_bound {
                (v - upper_bound) / iqr
            } else {
                continue;
            };

            let confidence = (score.abs() / (self.multiplier * 2.0)).min(1.0);
            let mut anomaly = Anomaly::new(
                point.timestamp,
                series.metric.clone(),
                MetricValue::Scalar(point.value),
                score,
                DetectionMethod::Stl,
                self.multiplier,
                confidence,
            )
            .with_context("seasonal_period", json!(self.period));

            match decomposition {
                Some(parts) => {
                    anomaly = anomaly
                        .with_context("decomposition", json!("stl"))
                        .with_context("residual", json!(parts.residual[i]))
                        .with_context("seasonal", json!(parts.seasonal[i]))
                        .with_context("trend", json!(parts.trend[i]));
                }
                None => {
                    anomaly = anomaly.with_context("decomposition", json!("fallback_iqr"));
                }
            }
            anomalies.push(anomaly);
        }
        anomalies
    }
}

impl Default for StlDetector {
    fn default() -> Self {
        Self::new(7, 1.5)
    }
}

impl Detector for StlDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Stl
    }

    fn min_points(&self) -> usize {
        self.period * 2
    }

    fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        let values = require_points(series, self.min_points())?;
        let points: Vec<&DataPoint> = series.valid_points().collect();

        match self.decompose(&values) {
            Some(parts) => {
                let residual = parts.residual.clone();
                Ok(self.detect_on_component(series, &points, &residual, Some(&parts)))
            }
            None => {
                // フォールバック経路は必ず記録する
                warn!(
                    "Seasonal decomposition failed for '{}', falling back to raw IQR",
                    series.metric
                );
                Ok(self.detect_on_component(series, &points, &values, None))
            }
        }
    }
}
