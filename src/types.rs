//! Core Detection Types
//!
//! 異常検知エンジンの型定義。検知結果の`Anomaly`はパイプラインの各段階
//! （検知器 → アンサンブル → フィードバックフィルタ → コンテキスト付与）で
//! 新しい値として生成され、共有可変状態として扱わない。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// 検知手法タグ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Z-スコア法
    Zscore,
    /// 修正Z-スコア法（MADベース）
    ModifiedZscore,
    /// IQR法（四分位範囲）
    Iqr,
    /// Isolation Forest
    IsolationForest,
    /// Local Outlier Factor
    Lof,
    /// 季節トレンド分解＋IQR（時系列）
    Stl,
    /// LSTMオートエンコーダ（時系列、オプション）
    Lstm,
    /// アンサンブル（複数手法の合議）
    Ensemble,
    /// ハイブリッド時系列（統計＋ML）
    Hybrid,
}

impl DetectionMethod {
    /// 永続化キー用の文字列表現を取得
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionMethod::Zscore => "zscore",
            DetectionMethod::ModifiedZscore => "modified_zscore",
            DetectionMethod::Iqr => "iqr",
            DetectionMethod::IsolationForest => "isolation_forest",
            DetectionMethod::Lof => "lof",
            DetectionMethod::Stl => "stl",
            DetectionMethod::Lstm => "lstm",
            DetectionMethod::Ensemble => "ensemble",
            DetectionMethod::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DetectionMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "zscore" => Ok(DetectionMethod::Zscore),
            "modified_zscore" => Ok(DetectionMethod::ModifiedZscore),
            "iqr" => Ok(DetectionMethod::Iqr),
            "isolation_forest" => Ok(DetectionMethod::IsolationForest),
            "lof" => Ok(DetectionMethod::Lof),
            "stl" => Ok(DetectionMethod::Stl),
            "lstm" => Ok(DetectionMethod::Lstm),
            "ensemble" => Ok(DetectionMethod::Ensemble),
            "hybrid" => Ok(DetectionMethod::Hybrid),
            _ => Err(format!("Unknown detection method: {}", s)),
        }
    }
}

/// 深刻度（全順序: Low < Medium < High < Critical）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// 低
    Low,
    /// 中
    Medium,
    /// 高
    High,
    /// 緊急
    Critical,
}

impl Severity {
    /// スコアとしきい値の比率から深刻度を導出
    pub fn from_ratio(ratio: f64) -> Self {
        let r = ratio.abs();
        if r >= 2.0 {
            Severity::Critical
        } else if r >= 1.5 {
            Severity::High
        } else if r >= 1.2 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// 観測値（単変量スカラー、または特徴量名→値のマップ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// 単変量の観測値
    Scalar(f64),
    /// 多変量検知の行（特徴量名→値）
    Vector(HashMap<String, f64>),
}

impl MetricValue {
    /// スカラー値を取得（多変量の場合はNone）
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MetricValue::Scalar(v) => Some(*v),
            MetricValue::Vector(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Scalar(v)
    }
}

/// 検知された異常
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    /// 発生時刻
    pub timestamp: DateTime<Utc>,
    /// メトリクス名
    pub metric: String,
    /// 観測値
    pub value: MetricValue,
    /// 異常スコア（符号付き、意味は手法依存）
    pub score: f64,
    /// 検知手法
    pub method: DetectionMethod,
    /// 深刻度
    pub severity: Severity,
    /// 検知時に有効だったしきい値
    pub threshold: f64,
    /// 信頼度（0.0-1.0）
    pub confidence: f64,
    /// 診断用の補助情報（段階間でマージされ、上書きされない）
    pub context: HashMap<String, Value>,
}

impl Anomaly {
    /// 新しい異常を作成。深刻度は |score|/threshold の比率から導出
    pub fn new(
        timestamp: DateTime<Utc>,
        metric: impl Into<String>,
        value: MetricValue,
        score: f64,
        method: DetectionMethod,
        threshold: f64,
        confidence: f64,
    ) -> Self {
        let ratio = if threshold.abs() > f64::EPSILON {
            score / threshold
        } else {
            0.0
        };
        Self {
            timestamp,
            metric: metric.into(),
            value,
            score,
            method,
            severity: Severity::from_ratio(ratio),
            threshold,
            confidence: confidence.clamp(0.0, 1.0),
            context: HashMap::new(),
        }
    }

    /// コンテキストを追加したビルダー
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// 既存のエントリを残したままコンテキストをマージ
    pub fn merge_context(&mut self, other: &HashMap<String, Value>) {
        for (k, v) in other {
            self.context.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }

    /// フィードバック用の安定キー（timestamp + metric + method）
    pub fn feedback_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.timestamp.to_rfc3339(),
            self.metric,
            self.method
        )
    }
}

/// 検知バッチのサマリ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    /// 検知された異常（深刻度降順）
    pub anomalies: Vec<Anomaly>,
    /// 入力データ点数
    pub total_points: usize,
    /// 検知所要時間
    pub detection_time: Duration,
    /// 検知手法
    pub method: DetectionMethod,
    /// 実行時パラメータ
    pub parameters: HashMap<String, Value>,
    /// 検知時刻
    pub detected_at: DateTime<Utc>,
}

impl DetectionResult {
    /// 異常率を計算（入力が空なら0）
    pub fn anomaly_rate(&self) -> f64 {
        if self.total_points == 0 {
            0.0
        } else {
            self.anomalies.len() as f64 / self.total_points as f64
        }
    }
}

/// 検知統計情報
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionStats {
    /// 総実行回数
    pub total_runs: u64,
    /// 総異常検知数
    pub total_anomalies: u64,
    /// 手法別の検知数
    pub anomalies_by_method: HashMap<String, u64>,
    /// 最終検知時刻
    pub last_detection: Option<DateTime<Utc>>,
}
