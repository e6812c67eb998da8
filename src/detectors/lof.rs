//! Local Outlier Factor Detector
//!
//! k近傍の局所到達可能密度と自身の密度の比で外れ値を判定する
//! 多変量検知器。LOF ≈ 1 が正常、1を大きく超えるほど異常。

use ndarray::Array2;
use serde_json::json;
use tracing::debug;

use super::{Detector, MultivariateDetector};
use crate::error::{Error, Result};
use crate::series::{MetricFrame, MetricSeries};
use crate::types::{Anomaly, DetectionMethod, MetricValue};

/// 密度計算の分母を保護する微小値
const DENSITY_EPSILON: f64 = 1e-12;

/// LOF検知器
#[derive(Debug, Clone)]
pub struct LofDetector {
    /// 近傍数
    neighbors: usize,
    /// 異常点の期待割合
    contamination: f64,
}

impl LofDetector {
    /// 新しいLOF検知器を作成
    pub fn new(neighbors: usize, contamination: f64) -> Self {
        Self {
            neighbors,
            contamination,
        }
    }

    /// 必要な最小行数
    fn required_rows(&self) -> usize {
        (self.neighbors + 1).max(5)
    }

    /// 全行のLOF値を計算
    fn lof_scores(&self, data: &Array2<f64>) -> Vec<f64> {
        let n = data.nrows();
        let k = self.neighbors.min(n - 1);

        // 全点間距離
        let mut distances = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let mut sum = 0.0;
                for f in 0..data.ncols() {
                    let d = data[[i, f]] - data[[j, f]];
                    sum += d * d;
                }
                let dist = sum.sqrt();
                distances[i][j] = dist;
                distances[j][i] = dist;
            }
        }

        // 各点のk近傍とk距離
        let mut neighbor_sets: Vec<Vec<usize>> = Vec::with_capacity(n);
        let mut k_distances = vec![0.0; n];
        for i in 0..n {
            let mut order: Vec<usize> = (0..n).filter(|&j| j != i).collect();
            order.sort_by(|&a, &b| {
                distances[i][a]
                    .partial_cmp(&distances[i][b])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            order.truncate(k);
            k_distances[i] = order
                .last()
                .map(|&j| distances[i][j])
                .unwrap_or(0.0);
            neighbor_sets.push(order);
        }

        // 局所到達可能密度
        let lrd: Vec<f64> = (0..n)
            .map(|i| {
                let reach_sum: f64 = neighbor_sets[i]
                    .iter()
                    .map(|&j| distances[i][j].max(k_distances[j]))
                    .sum();
                k as f64 / (reach_sum + DENSITY_EPSILON)
            })
            .collect();

        // LOF: 近傍の平均密度と自身の密度の比
        (0..n)
            .map(|i| {
                let neighbor_density: f64 = neighbor_sets[i].iter().map(|&j| lrd[j]).sum::<f64>()
                    / neighbor_sets[i].len().max(1) as f64;
                neighbor_density / lrd[i].max(DENSITY_EPSILON)
            })
            .collect()
    }
}

impl Default for LofDetector {
    fn default() -> Self {
        Self::new(20, 0.01)
    }
}

impl MultivariateDetector for LofDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Lof
    }

    fn detect_frame(&self, frame: &MetricFrame) -> Result<Vec<Anomaly>> {
        let (matrix, names, row_indices) = frame.to_matrix();
        let required = self.required_rows();
        if matrix.nrows() < required {
            return Err(Error::insufficient(required, matrix.nrows()));
        }

        // 退化したデータ（全点同一）は異常なし
        let standardized = super::isolation_forest::IsolationForestDetector::standardize(&matrix);
        if standardized.iter().all(|v| v.abs() < f64::EPSILON) {
            debug!("Degenerate frame (no spread), no LOF anomalies");
            return Ok(Vec::new());
        }

        let scores = self.lof_scores(&standardized);
        let quantile_cut = super::stats::quantile(&scores, 1.0 - self.contamination);
        let threshold = quantile_cut.max(1.0);

        let mut anomalies = Vec::new();
        for (i, &score) in scores.iter().enumerate() {
            if score <= threshold {
                continue;
            }
            let frame_row = row_indices[i];
            let timestamp = frame.timestamps[frame_row];
            let (metric, value) = if names.len() == 1 {
                (names[0].clone(), MetricValue::Scalar(matrix[[i, 0]]))
            } else {
                (
                    "multivariate".to_string(),
                    MetricValue::Vector(frame.row_map(frame_row)),
                )
            };

            let confidence = (score - 1.0).clamp(0.0, 1.0);
            let anomaly = Anomaly::new(
                timestamp,
                metric,
                value,
                score,
                DetectionMethod::Lof,
                threshold,
                confidence,
            )
            .with_context("neighbors", json!(self.neighbors))
            .with_context("contamination", json!(self.contamination));
            anomalies.push(anomaly);
        }
        Ok(anomalies)
    }
}

impl Detector for LofDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Lof
    }

    fn min_points(&self) -> usize {
        self.required_rows()
    }

    /// 単変量入力は1列のテーブルに包んで検知する
    fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        self.detect_frame(&MetricFrame::from_series(series))
    }
}
