//! Time Series Inputs
//!
//! 検知対象となる時系列データの表現。単変量の`MetricSeries`と、
//! タイムスタンプ軸を共有する多変量の`MetricFrame`を提供する。
//! NaNは欠損値として扱い、検知器はスキップする。

use chrono::{DateTime, Duration, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

/// 時系列の1観測点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// 観測時刻
    pub timestamp: DateTime<Utc>,
    /// 観測値（NaNは欠損）
    pub value: f64,
}

/// 単変量メトリクス時系列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSeries {
    /// メトリクス名
    pub metric: String,
    /// 観測点（時刻昇順を前提）
    pub points: Vec<DataPoint>,
}

impl MetricSeries {
    /// 空の時系列を作成
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            points: Vec::new(),
        }
    }

    /// 等間隔の値列から時系列を構築
    pub fn from_values(
        metric: impl Into<String>,
        start: DateTime<Utc>,
        step: Duration,
        values: &[f64],
    ) -> Self {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, &v)| DataPoint {
                timestamp: start + step * i as i32,
                value: v,
            })
            .collect();
        Self {
            metric: metric.into(),
            points,
        }
    }

    /// 観測点を追加
    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64) {
        self.points.push(DataPoint { timestamp, value });
    }

    /// 観測点数（欠損含む）
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// 欠損を除いた観測点のイテレータ
    pub fn valid_points(&self) -> impl Iterator<Item = &DataPoint> {
        self.points.iter().filter(|p| p.value.is_finite())
    }

    /// 欠損を除いた観測点数
    pub fn valid_len(&self) -> usize {
        self.valid_points().count()
    }

    /// 欠損を除いた値のベクタ
    pub fn values(&self) -> Vec<f64> {
        self.valid_points().map(|p| p.value).collect()
    }

    /// 末尾n点の値（欠損除外、古い順）
    pub fn tail_values(&self, n: usize) -> Vec<f64> {
        let values = self.values();
        let skip = values.len().saturating_sub(n);
        values[skip..].to_vec()
    }
}

/// 多変量メトリクステーブル（共有タイムスタンプ軸＋名前付き数値列）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricFrame {
    /// タイムスタンプ軸
    pub timestamps: Vec<DateTime<Utc>>,
    /// 列名→値列（BTreeMapで列順を決定的に保つ）
    pub columns: BTreeMap<String, Vec<f64>>,
}

impl MetricFrame {
    /// タイムスタンプ軸からフレームを作成
    pub fn new(timestamps: Vec<DateTime<Utc>>) -> Self {
        Self {
            timestamps,
            columns: BTreeMap::new(),
        }
    }

    /// 単変量時系列を1列のフレームに変換
    pub fn from_series(series: &MetricSeries) -> Self {
        let timestamps = series.points.iter().map(|p| p.timestamp).collect();
        let values = series.points.iter().map(|p| p.value).collect();
        let mut columns = BTreeMap::new();
        columns.insert(series.metric.clone(), values);
        Self {
            timestamps,
            columns,
        }
    }

    /// 列を追加。長さがタイムスタンプ軸と一致しない場合はエラー
    pub fn insert_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        if values.len() != self.timestamps.len() {
            return Err(Error::InvalidConfig(format!(
                "Column length {} does not match timestamp axis {}",
                values.len(),
                self.timestamps.len()
            )));
        }
        self.columns.insert(name.into(), values);
        Ok(())
    }

    /// 行数
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty() || self.columns.is_empty()
    }

    /// 列数
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// 1列を単変量時系列として取り出す
    pub fn column_series(&self, name: &str) -> Option<MetricSeries> {
        let values = self.columns.get(name)?;
        let points = self
            .timestamps
            .iter()
            .zip(values.iter())
            .map(|(&timestamp, &value)| DataPoint { timestamp, value })
            .collect();
        Some(MetricSeries {
            metric: name.to_string(),
            points,
        })
    }

    /// 全列を単変量時系列として列挙
    pub fn series_iter(&self) -> impl Iterator<Item = MetricSeries> + '_ {
        self.columns.keys().filter_map(|name| self.column_series(name))
    }

    /// 全列が有限値の行だけを行列化する。
    /// 戻り値は (行列, 列名, 元の行インデックス)
    pub fn to_matrix(&self) -> (Array2<f64>, Vec<String>, Vec<usize>) {
        let names: Vec<String> = self.columns.keys().cloned().collect();
        let mut rows: Vec<f64> = Vec::new();
        let mut row_indices = Vec::new();

        for i in 0..self.timestamps.len() {
            let row: Vec<f64> = names
                .iter()
                .map(|n| self.columns[n].get(i).copied().unwrap_or(f64::NAN))
                .collect();
            if row.iter().all(|v| v.is_finite()) {
                rows.extend_from_slice(&row);
                row_indices.push(i);
            }
        }

        let matrix = Array2::from_shape_vec((row_indices.len(), names.len()), rows)
            .unwrap_or_else(|_| Array2::zeros((0, names.len())));
        (matrix, names, row_indices)
    }

    /// 指定行を特徴量名→値のマップとして取り出す
    pub fn row_map(&self, index: usize) -> HashMap<String, f64> {
        self.columns
            .iter()
            .filter_map(|(name, values)| values.get(index).map(|&v| (name.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_series_skips_missing_values() {
        let series =
            MetricSeries::from_values("steps", base_time(), Duration::hours(1), &[1.0, f64::NAN, 3.0]);
        assert_eq!(series.len(), 3);
        assert_eq!(series.valid_len(), 2);
        assert_eq!(series.values(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_frame_column_round_trip() {
        let mut frame = MetricFrame::new(vec![base_time(), base_time() + Duration::hours(1)]);
        frame.insert_column("heart_rate", vec![60.0, 62.0]).unwrap();
        frame.insert_column("steps", vec![100.0, 200.0]).unwrap();

        let series = frame.column_series("heart_rate").unwrap();
        assert_eq!(series.metric, "heart_rate");
        assert_eq!(series.values(), vec![60.0, 62.0]);
        assert!(frame.insert_column("bad", vec![1.0]).is_err());
    }

    #[test]
    fn test_to_matrix_drops_rows_with_missing() {
        let mut frame = MetricFrame::new(vec![
            base_time(),
            base_time() + Duration::hours(1),
            base_time() + Duration::hours(2),
        ]);
        frame
            .insert_column("a", vec![1.0, f64::NAN, 3.0])
            .unwrap();
        frame.insert_column("b", vec![4.0, 5.0, 6.0]).unwrap();

        let (matrix, names, rows) = frame.to_matrix();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(rows, vec![0, 2]);
        assert_eq!(matrix.nrows(), 2);
        assert_eq!(matrix[[1, 0]], 3.0);
    }

    #[test]
    fn test_tail_values() {
        let series = MetricSeries::from_values(
            "sleep",
            base_time(),
            Duration::days(1),
            &[1.0, 2.0, 3.0, 4.0, 5.0],
        );
        assert_eq!(series.tail_values(3), vec![3.0, 4.0, 5.0]);
        assert_eq!(series.tail_values(10).len(), 5);
    }
}
