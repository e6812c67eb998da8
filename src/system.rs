//! Anomaly Detection System
//!
//! 検知器・アンサンブル・フィードバックプロセッサを束ねる最上位の
//! ファサード。単変量・多変量のディスパッチ、個人しきい値フィルタ、
//! コンテキスト付与、結果履歴の記録を行う。検知呼び出しの失敗が
//! ホストアプリケーションに波及することはなく、最悪でも空の結果と
//! ログ診断に収まる。

use chrono::{Datelike, Timelike, Utc};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::DetectionConfig;
use crate::detectors::stats;
use crate::ensemble::EnsembleDetector;
use crate::error::{Error, Result};
use crate::feedback::{FeedbackProcessor, FeedbackType, UserFeedback};
use crate::series::{MetricFrame, MetricSeries};
use crate::source::NotificationSink;
use crate::storage::{FeedbackLog, ThresholdStore};
use crate::temporal::trend_label;
use crate::types::{
    Anomaly, DetectionMethod, DetectionResult, DetectionStats, MetricValue, Severity,
};

/// 保持する検知履歴の上限（古いものから破棄）
const HISTORY_LIMIT: usize = 100;

/// トレンド付与に使う直近ウィンドウ
const ENRICH_TREND_WINDOW: usize = 7;

/// 異常検知システム
pub struct AnomalyDetectionSystem {
    /// グローバル設定（フィードバックで変化する）
    config: Arc<RwLock<DetectionConfig>>,
    /// フィードバックプロセッサ
    feedback: FeedbackProcessor,
    /// 検知履歴（直近100件）
    history: Arc<RwLock<VecDeque<DetectionResult>>>,
    /// 検知統計
    stats: Arc<RwLock<DetectionStats>>,
    /// メトリクス別の深刻度重み（ドメイン固有の後処理デコレータ）
    severity_weights: HashMap<String, f64>,
    /// 通知シンク（任意）
    sink: Option<Arc<dyn NotificationSink>>,
}

impl AnomalyDetectionSystem {
    /// 設定を検証してシステムを構築
    pub fn new(config: DetectionConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(RwLock::new(config));
        let feedback = FeedbackProcessor::new(config.clone());
        info!("Anomaly detection system initialized");
        Ok(Self {
            config,
            feedback,
            history: Arc::new(RwLock::new(VecDeque::with_capacity(HISTORY_LIMIT))),
            stats: Arc::new(RwLock::new(DetectionStats::default())),
            severity_weights: HashMap::new(),
            sink: None,
        })
    }

    /// 個人しきい値の永続ストアを設定
    pub fn with_threshold_store(mut self, store: Arc<dyn ThresholdStore>) -> Self {
        self.feedback = self.feedback.with_store(store);
        self
    }

    /// フィードバックログを設定
    pub fn with_feedback_log(mut self, log: Arc<dyn FeedbackLog>) -> Self {
        self.feedback = self.feedback.with_log(log);
        self
    }

    /// 通知シンクを設定
    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// メトリクス別の深刻度重みを設定（例: heart_rate → 1.2）。
    /// 検知コアの外側で適用される後処理であり、未指定メトリクスには
    /// 何もしない
    pub fn with_severity_weights(mut self, weights: HashMap<String, f64>) -> Self {
        self.severity_weights = weights;
        self
    }

    /// フィードバックプロセッサへの参照
    pub fn feedback(&self) -> &FeedbackProcessor {
        &self.feedback
    }

    /// 現在の設定スナップショット
    pub async fn config(&self) -> DetectionConfig {
        self.config.read().await.clone()
    }

    /// 異常へのフィードバックを処理する
    pub async fn process_feedback(
        &self,
        anomaly: &Anomaly,
        feedback_type: FeedbackType,
        comment: Option<String>,
        suggested_threshold: Option<f64>,
    ) -> Result<UserFeedback> {
        self.feedback
            .process_feedback(anomaly, feedback_type, comment, suggested_threshold)
            .await
    }

    /// 単変量時系列の異常検知。失敗は空の結果に変換される
    pub async fn detect_anomalies(&self, series: &MetricSeries) -> Vec<Anomaly> {
        self.detect_series_result(series).await.anomalies
    }

    /// 多変量テーブルの異常検知。失敗は空の結果に変換される
    pub async fn detect_anomalies_frame(&self, frame: &MetricFrame) -> Vec<Anomaly> {
        self.detect_frame_result(frame).await.anomalies
    }

    /// 単変量検知の実行とバッチサマリの記録
    pub async fn detect_series_result(&self, series: &MetricSeries) -> DetectionResult {
        let start = Instant::now();
        let config = self.config.read().await.clone();
        let total_points = series.len();

        let raw = if series.is_empty() {
            debug!("Empty series '{}', returning empty result", series.metric);
            Vec::new()
        } else {
            let ensemble = EnsembleDetector::from_config(&config);
            self.run_guarded(|| ensemble.detect(series), &series.metric)
        };

        let filtered = self.feedback.filter_anomalies(raw).await;
        let enriched: Vec<Anomaly> = filtered
            .into_iter()
            .map(|a| {
                let enriched = self.enrich(a, series);
                self.apply_severity_weight(enriched)
            })
            .collect();

        let result = self
            .record(enriched, total_points, start, &config)
            .await;
        self.notify_all(&result.anomalies).await;
        result
    }

    /// 多変量検知の実行とバッチサマリの記録
    pub async fn detect_frame_result(&self, frame: &MetricFrame) -> DetectionResult {
        let start = Instant::now();
        let config = self.config.read().await.clone();
        let total_points = frame.len();

        let raw = if frame.is_empty() {
            debug!("Empty frame, returning empty result");
            Vec::new()
        } else {
            let ensemble = EnsembleDetector::from_config(&config);
            self.run_guarded(|| ensemble.detect_frame(frame), "frame")
        };

        let filtered = self.feedback.filter_anomalies(raw).await;
        let enriched: Vec<Anomaly> = filtered
            .into_iter()
            .map(|a| {
                let series = frame.column_series(&a.metric);
                let enriched = match &series {
                    Some(series) => self.enrich(a, series),
                    None => self.enrich_timestamp_only(a),
                };
                self.apply_severity_weight(enriched)
            })
            .collect();

        let result = self
            .record(enriched, total_points, start, &config)
            .await;
        self.notify_all(&result.anomalies).await;
        result
    }

    /// 検知実行の失敗をログ付きで空結果に変換する
    fn run_guarded<F>(&self, run: F, target: &str) -> Vec<Anomaly>
    where
        F: FnOnce() -> Result<Vec<Anomaly>>,
    {
        match run() {
            Ok(anomalies) => anomalies,
            Err(Error::InsufficientData { required, actual }) => {
                // データ不足は日常的な状態であり、エラーとして表面化させない
                debug!(
                    "Insufficient data for '{}': {} points (need {})",
                    target, actual, required
                );
                Vec::new()
            }
            Err(e) => {
                error!("Detection failed for '{}': {}", target, e);
                Vec::new()
            }
        }
    }

    /// 導出コンテキストを付与する（系列内パーセンタイル、曜日、時刻、トレンド）
    fn enrich(&self, mut anomaly: Anomaly, series: &MetricSeries) -> Anomaly {
        if let MetricValue::Scalar(value) = &anomaly.value {
            let value = *value;
            let values = series.values();
            if !values.is_empty() {
                anomaly.context.insert(
                    "percentile_rank".to_string(),
                    json!(stats::percentile_rank(&values, value)),
                );
            }
        }
        anomaly.context.insert(
            "recent_trend".to_string(),
            json!(trend_label(&series.tail_values(ENRICH_TREND_WINDOW))),
        );
        self.enrich_timestamp_only(anomaly)
    }

    /// タイムスタンプ由来のコンテキストのみ付与
    fn enrich_timestamp_only(&self, mut anomaly: Anomaly) -> Anomaly {
        anomaly.context.insert(
            "day_of_week".to_string(),
            json!(anomaly.timestamp.weekday().to_string()),
        );
        anomaly
            .context
            .insert("hour_of_day".to_string(), json!(anomaly.timestamp.hour()));
        anomaly
    }

    /// ドメイン固有の深刻度重みを適用する後処理
    fn apply_severity_weight(&self, mut anomaly: Anomaly) -> Anomaly {
        let Some(&weight) = self.severity_weights.get(&anomaly.metric) else {
            return anomaly;
        };
        anomaly.score *= weight;
        if anomaly.threshold.abs() > f64::EPSILON {
            anomaly.severity = Severity::from_ratio(anomaly.score / anomaly.threshold);
        }
        anomaly
            .context
            .insert("severity_weight".to_string(), json!(weight));
        anomaly
    }

    /// バッチサマリを履歴と統計に記録
    async fn record(
        &self,
        anomalies: Vec<Anomaly>,
        total_points: usize,
        start: Instant,
        config: &DetectionConfig,
    ) -> DetectionResult {
        let mut parameters = HashMap::new();
        parameters.insert(
            "enabled_methods".to_string(),
            json!(config
                .enabled_methods
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()),
        );
        parameters.insert(
            "ensemble_min_votes".to_string(),
            json!(config.ensemble_min_votes),
        );
        parameters.insert(
            "weight_by_confidence".to_string(),
            json!(config.ensemble_weight_by_confidence),
        );

        let result = DetectionResult {
            anomalies,
            total_points,
            detection_time: start.elapsed(),
            method: DetectionMethod::Ensemble,
            parameters,
            detected_at: Utc::now(),
        };

        {
            let mut history = self.history.write().await;
            if history.len() >= HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(result.clone());
        }
        {
            let mut stats = self.stats.write().await;
            stats.total_runs += 1;
            stats.total_anomalies += result.anomalies.len() as u64;
            for anomaly in &result.anomalies {
                *stats
                    .anomalies_by_method
                    .entry(anomaly.method.to_string())
                    .or_insert(0) += 1;
            }
            if !result.anomalies.is_empty() {
                stats.last_detection = Some(result.detected_at);
            }
        }
        result
    }

    /// フィルタ済みの異常を通知シンクへ引き渡す
    async fn notify_all(&self, anomalies: &[Anomaly]) {
        if let Some(sink) = &self.sink {
            for anomaly in anomalies {
                sink.notify(anomaly).await;
            }
        }
    }

    /// 検知履歴を取得（新しい順）
    pub async fn detection_history(&self, limit: usize) -> Vec<DetectionResult> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    /// 検知統計を取得
    pub async fn detection_stats(&self) -> DetectionStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn system_with(methods: &[DetectionMethod], min_votes: usize) -> AnomalyDetectionSystem {
        let config = DetectionConfig {
            enabled_methods: methods.iter().copied().collect::<BTreeSet<_>>(),
            ensemble_min_votes: min_votes,
            ..Default::default()
        };
        AnomalyDetectionSystem::new(config).unwrap()
    }

    fn outlier_series() -> MetricSeries {
        let mut values: Vec<f64> = (0..95).map(|i| 50.0 + (i % 10) as f64).collect();
        values.push(250.0);
        MetricSeries::from_values("heart_rate", Utc::now(), Duration::hours(1), &values)
    }

    #[tokio::test]
    async fn test_detection_enriches_context() {
        let system = system_with(&[DetectionMethod::Zscore, DetectionMethod::Iqr], 2);
        let anomalies = system.detect_anomalies(&outlier_series()).await;

        assert!(!anomalies.is_empty());
        for anomaly in &anomalies {
            assert!(anomaly.context.contains_key("percentile_rank"));
            assert!(anomaly.context.contains_key("day_of_week"));
            assert!(anomaly.context.contains_key("hour_of_day"));
            assert!(anomaly.context.contains_key("recent_trend"));
        }
    }

    #[tokio::test]
    async fn test_empty_input_never_errors() {
        let system = system_with(&[DetectionMethod::Zscore], 1);
        let empty = MetricSeries::new("steps");
        let anomalies = system.detect_anomalies(&empty).await;
        assert!(anomalies.is_empty());

        // データ不足も空の結果になる
        let tiny =
            MetricSeries::from_values("steps", Utc::now(), Duration::hours(1), &[1.0, 2.0]);
        let anomalies = system.detect_anomalies(&tiny).await;
        assert!(anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let system = system_with(&[DetectionMethod::Zscore], 1);
        let series =
            MetricSeries::from_values("steps", Utc::now(), Duration::hours(1), &[1.0, 2.0, 3.0]);

        for _ in 0..110 {
            system.detect_anomalies(&series).await;
        }
        let history = system.detection_history(usize::MAX).await;
        assert_eq!(history.len(), HISTORY_LIMIT);

        let stats = system.detection_stats().await;
        assert_eq!(stats.total_runs, 110);
    }

    #[tokio::test]
    async fn test_severity_weight_decorator() {
        let mut weights = HashMap::new();
        weights.insert("heart_rate".to_string(), 1.2);
        let system = system_with(&[DetectionMethod::Zscore, DetectionMethod::Iqr], 2)
            .with_severity_weights(weights);

        let weighted = system.detect_anomalies(&outlier_series()).await;
        assert!(!weighted.is_empty());
        for anomaly in &weighted {
            assert_eq!(anomaly.context["severity_weight"], json!(1.2));
        }

        // 重み指定のないメトリクスはそのまま
        let plain_system = system_with(&[DetectionMethod::Zscore, DetectionMethod::Iqr], 2);
        let mut series = outlier_series();
        series.metric = "steps".to_string();
        let plain = plain_system.detect_anomalies(&series).await;
        assert!(plain.iter().all(|a| !a.context.contains_key("severity_weight")));
    }

    #[tokio::test]
    async fn test_feedback_filters_future_detections() {
        let system = system_with(&[DetectionMethod::Zscore, DetectionMethod::Iqr], 1);
        let series = outlier_series();

        let first = system.detect_anomalies(&series).await;
        assert!(!first.is_empty());

        // アンサンブル異常に偽陽性フィードバックを大量に与える
        for _ in 0..20 {
            system
                .process_feedback(&first[0], FeedbackType::FalsePositive, None, None)
                .await
                .unwrap();
        }

        let after = system.detect_anomalies(&series).await;
        assert!(
            after.len() < first.len()
                || after.iter().all(|a| a.feedback_key() != first[0].feedback_key()),
            "heavily reported anomaly should be suppressed"
        );
    }

    #[tokio::test]
    async fn test_frame_detection_records_history() {
        let system = system_with(&[DetectionMethod::Zscore, DetectionMethod::Iqr], 2);
        let timestamps: Vec<_> = (0..50).map(|i| Utc::now() + Duration::hours(i)).collect();
        let mut frame = MetricFrame::new(timestamps);
        let mut hr: Vec<f64> = (0..50).map(|i| 60.0 + (i % 9) as f64).collect();
        hr[25] = 300.0;
        frame.insert_column("heart_rate", hr).unwrap();

        let anomalies = system.detect_anomalies_frame(&frame).await;
        assert!(!anomalies.is_empty());

        let history = system.detection_history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_points, 50);
        assert!(history[0].anomaly_rate() > 0.0);
    }
}
