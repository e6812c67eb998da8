//! Hybrid Temporal Detector
//!
//! 統計的な季節分解検知器（常時利用可）と、オプションのシーケンス
//! オートエンコーダを組み合わせる2者専用のコンバイナ。MLが未搭載・
//! 未学習の場合は統計のみへ劣化し、ML側の実行時例外は捕捉して
//! 統計のみの結果にフォールバックする（呼び出し元へは伝播しない）。

use serde_json::json;

use crate::config::DetectionConfig;
use crate::detectors::{stats, Detector, MlCapability, StlDetector};
use crate::error::Result;
use crate::series::MetricSeries;
use crate::types::{Anomaly, DetectionMethod};

#[cfg(feature = "ml")]
use std::collections::BTreeMap;
#[cfg(feature = "ml")]
use tracing::warn;

#[cfg(feature = "ml")]
use crate::detectors::{LstmDetector, TrainingReport};

/// 両検知器が合意した場合の信頼度
const CONFIDENCE_BOTH: f64 = 0.9;
/// MLのみが検知した場合の信頼度
const CONFIDENCE_ML_ONLY: f64 = 0.7;
/// 統計のみが検知した場合の信頼度
const CONFIDENCE_STATISTICAL_ONLY: f64 = 0.6;

/// 直近トレンドの判定ウィンドウ（点数）
const TREND_WINDOW: usize = 7;

/// 正規化スロープの安定判定しきい値
const TREND_STABLE: f64 = 0.02;
/// 正規化スロープの急変判定しきい値
const TREND_SHARP: f64 = 0.15;

/// 直近ウィンドウのトレンドラベルを導出。
/// 回帰直線の傾きをウィンドウの値域で正規化して分類する
pub(crate) fn trend_label(values: &[f64]) -> &'static str {
    if values.len() < 2 {
        return "flat";
    }
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    if range < f64::EPSILON {
        return "flat";
    }
    let slope = match stats::linear_slope(values) {
        Some(s) => s,
        None => return "flat",
    };
    let normalized = slope / range;
    if normalized.abs() < TREND_STABLE {
        "stable"
    } else if normalized >= TREND_SHARP {
        "sharply_increasing"
    } else if normalized > 0.0 {
        "increasing"
    } else if normalized <= -TREND_SHARP {
        "sharply_decreasing"
    } else {
        "decreasing"
    }
}

/// ハイブリッド時系列検知器
pub struct HybridTemporalDetector {
    /// 統計的検知器（季節分解）
    statistical: StlDetector,
    /// オプションのシーケンスモデル
    #[cfg(feature = "ml")]
    ml: Option<LstmDetector>,
    /// 統計側の合成重み
    statistical_weight: f64,
    /// ML側の合成重み
    ml_weight: f64,
}

impl HybridTemporalDetector {
    /// 新しいハイブリッド検知器を作成
    pub fn new(period: usize, multiplier: f64) -> Self {
        Self {
            statistical: StlDetector::new(period, multiplier),
            #[cfg(feature = "ml")]
            ml: None,
            statistical_weight: 0.6,
            ml_weight: 0.4,
        }
    }

    /// 設定からハイブリッド検知器を組み立てる
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(config.stl_period, config.iqr_multiplier)
    }

    /// 合成重みを設定
    pub fn with_weights(mut self, statistical: f64, ml: f64) -> Self {
        self.statistical_weight = statistical;
        self.ml_weight = ml;
        self
    }

    /// シーケンスモデルを組み込む
    #[cfg(feature = "ml")]
    pub fn with_ml(mut self, detector: LstmDetector) -> Self {
        self.ml = Some(detector);
        self
    }

    /// MLモデルを学習する（搭載されている場合のみ）
    #[cfg(feature = "ml")]
    pub fn train_ml(&mut self, series: &MetricSeries) -> Result<Option<TrainingReport>> {
        match self.ml.as_mut() {
            Some(ml) => Ok(Some(ml.train(series)?)),
            None => Ok(None),
        }
    }

    /// MLパスが実際に使えるか（ケイパビリティ＋搭載＋学習済み）
    pub fn ml_active(&self) -> bool {
        if !MlCapability::available() {
            return false;
        }
        #[cfg(feature = "ml")]
        {
            return self.ml.as_ref().map(|m| m.is_trained()).unwrap_or(false);
        }
        #[cfg(not(feature = "ml"))]
        false
    }

    /// 時系列パターン異常を検知
    pub fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        // 統計検知は常に実行する
        let statistical = self.statistical.detect(series)?;
        let trend = trend_label(&series.tail_values(TREND_WINDOW));

        // 学習済みチェックで分岐する（例外を捕るのではなく）
        if !self.ml_active() {
            return Ok(self.statistical_only(statistical, trend));
        }

        #[cfg(feature = "ml")]
        {
            let ml_result = match self.ml.as_ref().unwrap().detect(series) {
                Ok(anomalies) => anomalies,
                Err(e) => {
                    // ML側の失敗はこの呼び出しを統計のみへ劣化させるだけ
                    warn!(
                        "ML temporal detector failed on '{}', falling back to statistical only: {}",
                        series.metric, e
                    );
                    return Ok(self.statistical_only(statistical, trend));
                }
            };
            Ok(self.merge(statistical, ml_result, trend))
        }
        #[cfg(not(feature = "ml"))]
        unreachable!("ml_active() is always false without the ml feature")
    }

    /// 統計のみの結果をハイブリッド形式に包む
    fn statistical_only(&self, statistical: Vec<Anomaly>, trend: &str) -> Vec<Anomaly> {
        statistical
            .into_iter()
            .map(|mut anomaly| {
                anomaly.method = DetectionMethod::Hybrid;
                anomaly
                    .context
                    .insert("detection_agreement".to_string(), json!("Statistical only"));
                anomaly
                    .context
                    .insert("recent_trend".to_string(), json!(trend));
                anomaly
            })
            .collect()
    }

    /// 統計・ML双方の結果をタイムスタンプ単位で重み付き合成する
    #[cfg(feature = "ml")]
    fn merge(
        &self,
        statistical: Vec<Anomaly>,
        ml: Vec<Anomaly>,
        trend: &str,
    ) -> Vec<Anomaly> {
        let mut by_timestamp: BTreeMap<chrono::DateTime<chrono::Utc>, (Option<Anomaly>, Option<Anomaly>)> =
            BTreeMap::new();
        for anomaly in statistical {
            let ts = anomaly.timestamp;
            by_timestamp.entry(ts).or_default().0 = Some(anomaly);
        }
        for anomaly in ml {
            let ts = anomaly.timestamp;
            by_timestamp.entry(ts).or_default().1 = Some(anomaly);
        }

        let weight_sum = self.statistical_weight + self.ml_weight;
        by_timestamp
            .into_values()
            .map(|pair| match pair {
                (Some(stat), Some(ml)) => {
                    let score = (stat.score * self.statistical_weight
                        + ml.score * self.ml_weight)
                        / weight_sum;
                    let threshold = (stat.threshold * self.statistical_weight
                        + ml.threshold * self.ml_weight)
                        / weight_sum;
                    let severity = stat.severity.max(ml.severity);
                    let mut combined = Anomaly {
                        timestamp: stat.timestamp,
                        metric: stat.metric.clone(),
                        value: stat.value.clone(),
                        score,
                        method: DetectionMethod::Hybrid,
                        severity,
                        threshold,
                        confidence: CONFIDENCE_BOTH,
                        context: std::collections::HashMap::new(),
                    };
                    combined
                        .context
                        .insert("detection_agreement".to_string(), json!("Statistical + ML"));
                    combined.context.insert(
                        "stl".to_string(),
                        json!({
                            "score": stat.score,
                            "context": stat.context,
                        }),
                    );
                    combined.context.insert(
                        "lstm".to_string(),
                        json!({
                            "score": ml.score,
                            "context": ml.context,
                        }),
                    );
                    combined
                        .context
                        .insert("recent_trend".to_string(), json!(trend));
                    combined
                }
                (None, Some(mut ml)) => {
                    ml.method = DetectionMethod::Hybrid;
                    ml.confidence = CONFIDENCE_ML_ONLY;
                    ml.context
                        .insert("detection_agreement".to_string(), json!("ML only"));
                    ml.context.insert("recent_trend".to_string(), json!(trend));
                    ml
                }
                (Some(mut stat), None) => {
                    stat.method = DetectionMethod::Hybrid;
                    stat.confidence = CONFIDENCE_STATISTICAL_ONLY;
                    stat.context
                        .insert("detection_agreement".to_string(), json!("Statistical only"));
                    stat.context.insert("recent_trend".to_string(), json!(trend));
                    stat
                }
                (None, None) => unreachable!("empty merge entry"),
            })
            .collect()
    }
}
