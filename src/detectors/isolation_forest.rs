//! Isolation Forest Detector
//!
//! 標準化した特徴量上にランダム分離木を構築し、平均パス長から
//! 異常スコア 2^(-E[h(x)]/c(ψ)) を計算する多変量検知器。
//! 再現性のためシードは固定する。

use ndarray::Array2;
use rand::prelude::*;
use serde_json::json;
use tracing::debug;

use super::{Detector, MultivariateDetector};
use crate::error::{Error, Result};
use crate::series::{MetricFrame, MetricSeries};
use crate::types::{Anomaly, DetectionMethod, MetricValue};

/// オイラー・マスケローニ定数（調和数の近似用）
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// 最小有効行数
const MIN_ROWS: usize = 5;

/// サブサンプリングサイズの上限
const MAX_SAMPLE_SIZE: usize = 256;

/// Isolation Forest検知器
#[derive(Debug, Clone)]
pub struct IsolationForestDetector {
    /// ツリー数
    n_trees: usize,
    /// 異常点の期待割合（運用しきい値を決める）
    contamination: f64,
    /// 乱数シード
    seed: u64,
}

/// 分離木のノード
#[derive(Debug)]
enum IsolationNode {
    /// 葉（残った点数を保持）
    Leaf { size: usize },
    /// 分割ノード
    Split {
        feature: usize,
        value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
}

impl IsolationForestDetector {
    /// 新しいIsolation Forest検知器を作成
    pub fn new(n_trees: usize, contamination: f64) -> Self {
        Self {
            n_trees,
            contamination,
            seed: 42,
        }
    }

    /// 乱数シードを指定
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 未分割時の平均パス長 c(n)
    fn average_path_length(n: usize) -> f64 {
        match n {
            0 | 1 => 0.0,
            2 => 1.0,
            _ => {
                let n = n as f64;
                2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
            }
        }
    }

    /// 列ごとに標準化した行列を作成
    pub(crate) fn standardize(matrix: &Array2<f64>) -> Array2<f64> {
        let (rows, cols) = matrix.dim();
        let mut standardized = Array2::zeros((rows, cols));
        for j in 0..cols {
            let column: Vec<f64> = (0..rows).map(|i| matrix[[i, j]]).collect();
            let mean = super::stats::mean(&column);
            let std_dev = super::stats::std_dev(&column);
            for i in 0..rows {
                standardized[[i, j]] = if std_dev > f64::EPSILON {
                    (matrix[[i, j]] - mean) / std_dev
                } else {
                    0.0
                };
            }
        }
        standardized
    }

    /// 分離木を構築
    fn build_tree(
        data: &Array2<f64>,
        rows: &[usize],
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> IsolationNode {
        if rows.len() <= 1 || depth >= max_depth {
            return IsolationNode::Leaf { size: rows.len() };
        }

        // 値に幅のある特徴量だけが分割候補
        let n_features = data.ncols();
        let mut candidates = Vec::new();
        for feature in 0..n_features {
            let mut min = f64::INFINITY;
            let mut max = f64::NEG_INFINITY;
            for &row in rows {
                let v = data[[row, feature]];
                min = min.min(v);
                max = max.max(v);
            }
            if max - min > f64::EPSILON {
                candidates.push((feature, min, max));
            }
        }
        if candidates.is_empty() {
            return IsolationNode::Leaf { size: rows.len() };
        }

        let (feature, min, max) = candidates[rng.gen_range(0..candidates.len())];
        let value = rng.gen_range(min..max);

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.iter().partition(|&&row| data[[row, feature]] < value);

        IsolationNode::Split {
            feature,
            value,
            left: Box::new(Self::build_tree(data, &left_rows, depth + 1, max_depth, rng)),
            right: Box::new(Self::build_tree(
                data,
                &right_rows,
                depth + 1,
                max_depth,
                rng,
            )),
        }
    }

    /// 1行のパス長を計算
    fn path_length(node: &IsolationNode, data: &Array2<f64>, row: usize, depth: f64) -> f64 {
        match node {
            IsolationNode::Leaf { size } => depth + Self::average_path_length(*size),
            IsolationNode::Split {
                feature,
                value,
                left,
                right,
            } => {
                if data[[row, *feature]] < *value {
                    Self::path_length(left, data, row, depth + 1.0)
                } else {
                    Self::path_length(right, data, row, depth + 1.0)
                }
            }
        }
    }

    /// 全行の異常スコアを計算
    fn score_rows(&self, data: &Array2<f64>) -> Vec<f64> {
        let n = data.nrows();
        let sample_size = n.min(MAX_SAMPLE_SIZE);
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let c_norm = Self::average_path_length(sample_size).max(f64::EPSILON);
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut totals = vec![0.0; n];
        for _ in 0..self.n_trees {
            let sample: Vec<usize> = rand::seq::index::sample(&mut rng, n, sample_size).into_vec();
            let tree = Self::build_tree(data, &sample, 0, max_depth, &mut rng);
            for (row, total) in totals.iter_mut().enumerate() {
                *total += Self::path_length(&tree, data, row, 0.0);
            }
        }

        totals
            .into_iter()
            .map(|total| {
                let expected = total / self.n_trees as f64;
                2f64.powf(-expected / c_norm)
            })
            .collect()
    }
}

impl Default for IsolationForestDetector {
    fn default() -> Self {
        Self::new(100, 0.01)
    }
}

impl MultivariateDetector for IsolationForestDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::IsolationForest
    }

    fn detect_frame(&self, frame: &MetricFrame) -> Result<Vec<Anomaly>> {
        let (matrix, names, row_indices) = frame.to_matrix();
        if matrix.nrows() < MIN_ROWS {
            return Err(Error::insufficient(MIN_ROWS, matrix.nrows()));
        }

        let standardized = Self::standardize(&matrix);
        let scores = self.score_rows(&standardized);

        // 運用しきい値: スコア分布の (1 - contamination) 分位点
        let threshold = super::stats::quantile(&scores, 1.0 - self.contamination);
        debug!(
            "Isolation forest threshold {:.4} over {} rows",
            threshold,
            scores.len()
        );

        let mut anomalies = Vec::new();
        for (i, &score) in scores.iter().enumerate() {
            if score <= threshold {
                continue;
            }
            let frame_row = row_indices[i];
            let timestamp = frame.timestamps[frame_row];
            let (metric, value) = if names.len() == 1 {
                (
                    names[0].clone(),
                    MetricValue::Scalar(matrix[[i, 0]]),
                )
            } else {
                (
                    "multivariate".to_string(),
                    MetricValue::Vector(frame.row_map(frame_row)),
                )
            };

            let anomaly = Anomaly::new(
                timestamp,
                metric,
                value,
                score,
                DetectionMethod::IsolationForest,
                threshold,
                score.clamp(0.0, 1.0),
            )
            .with_context("contamination", json!(self.contamination))
            .with_context("n_trees", json!(self.n_trees));
            anomalies.push(anomaly);
        }
        Ok(anomalies)
    }
}

impl Detector for IsolationForestDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::IsolationForest
    }

    fn min_points(&self) -> usize {
        MIN_ROWS
    }

    /// 単変量入力は1列のテーブルに包んで検知する
    fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        self.detect_frame(&MetricFrame::from_series(series))
    }
}
