//! Ensemble Detector
//!
//! 有効化された検知器群を実行し、(タイムスタンプ, メトリクス)単位で
//! 投票を集計して合議結果を合成する二段構成のコンバイナ。
//! 検知と合成を分離しているため、新しい手法の追加は合成ロジックに
//! 影響せず、最小投票数や重み付けの調整は検知器に影響しない。
//!
//! 個々の検知器の失敗はこの境界で捕捉・ログされ、その実行の寄与が
//! 空になるだけで兄弟の検知器を中断しない。

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::DetectionConfig;
use crate::detectors::{
    Detector, IqrDetector, IsolationForestDetector, LofDetector, ModifiedZScoreDetector,
    MultivariateDetector, StlDetector, ZScoreDetector, MIN_SERIES_POINTS,
};
use crate::error::{Error, Result};
use crate::series::{MetricFrame, MetricSeries};
use crate::types::{Anomaly, DetectionMethod, Severity};

/// アンサンブル検知器
pub struct EnsembleDetector {
    config: DetectionConfig,
}

impl EnsembleDetector {
    /// 設定から検知器セットを組み立てる
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// 有効な単変量検知器を生成
    fn build_univariate(&self) -> Vec<Box<dyn Detector>> {
        let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
        for method in &self.config.enabled_methods {
            match method {
                DetectionMethod::Zscore => {
                    detectors.push(Box::new(ZScoreDetector::new(self.config.zscore_threshold)))
                }
                DetectionMethod::ModifiedZscore => detectors.push(Box::new(
                    ModifiedZScoreDetector::new(self.config.modified_zscore_threshold),
                )),
                DetectionMethod::Iqr => {
                    detectors.push(Box::new(IqrDetector::new(self.config.iqr_multiplier)))
                }
                DetectionMethod::Stl => detectors.push(Box::new(StlDetector::new(
                    self.config.stl_period,
                    self.config.iqr_multiplier,
                ))),
                _ => {}
            }
        }
        detectors
    }

    /// 有効な多変量検知器を生成
    fn build_multivariate(&self) -> Vec<Box<dyn MultivariateDetector>> {
        let mut detectors: Vec<Box<dyn MultivariateDetector>> = Vec::new();
        for method in &self.config.enabled_methods {
            match method {
                DetectionMethod::IsolationForest => {
                    detectors.push(Box::new(IsolationForestDetector::new(
                        self.config.isolation_trees,
                        self.config.contamination,
                    )))
                }
                DetectionMethod::Lof => detectors.push(Box::new(LofDetector::new(
                    self.config.lof_neighbors,
                    self.config.contamination,
                ))),
                _ => {}
            }
        }
        detectors
    }

    /// 単変量時系列に対してアンサンブル検知を実行
    pub fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        self.config.validate()?;
        if series.valid_len() < MIN_SERIES_POINTS {
            return Err(Error::insufficient(MIN_SERIES_POINTS, series.valid_len()));
        }

        let univariate = self.build_univariate();
        let multivariate = self.build_multivariate();
        let active_count = univariate.len() + multivariate.len();

        let mut raw = Vec::new();
        for detector in &univariate {
            match detector.detect(series) {
                Ok(mut anomalies) => raw.append(&mut anomalies),
                Err(e) => warn!(
                    "Detector {} failed on '{}': {}",
                    detector.method(),
                    series.metric,
                    e
                ),
            }
        }
        // 多変量検知器は1列のテーブルとして実行する
        let frame = MetricFrame::from_series(series);
        for detector in &multivariate {
            match detector.detect_frame(&frame) {
                Ok(mut anomalies) => raw.append(&mut anomalies),
                Err(e) => warn!(
                    "Detector {} failed on '{}': {}",
                    detector.method(),
                    series.metric,
                    e
                ),
            }
        }

        Ok(self.combine(raw, active_count))
    }

    /// 多変量テーブルに対してアンサンブル検知を実行。
    /// 多変量検知器はテーブル全体、単変量検知器は数値列ごとに実行する
    pub fn detect_frame(&self, frame: &MetricFrame) -> Result<Vec<Anomaly>> {
        self.config.validate()?;
        if frame.is_empty() {
            return Err(Error::insufficient(MIN_SERIES_POINTS, 0));
        }

        let univariate = self.build_univariate();
        let multivariate = self.build_multivariate();
        let active_count = univariate.len() + multivariate.len();

        let mut raw = Vec::new();
        for detector in &multivariate {
            match detector.detect_frame(frame) {
                Ok(mut anomalies) => raw.append(&mut anomalies),
                Err(e) => warn!("Detector {} failed on frame: {}", detector.method(), e),
            }
        }
        for series in frame.series_iter() {
            for detector in &univariate {
                match detector.detect(&series) {
                    Ok(mut anomalies) => raw.append(&mut anomalies),
                    Err(e) => warn!(
                        "Detector {} failed on column '{}': {}",
                        detector.method(),
                        series.metric,
                        e
                    ),
                }
            }
        }

        Ok(self.combine(raw, active_count))
    }

    /// (タイムスタンプ, メトリクス)で投票を集計し、合議結果を合成
    fn combine(&self, raw: Vec<Anomaly>, active_count: usize) -> Vec<Anomaly> {
        let mut groups: HashMap<(chrono::DateTime<chrono::Utc>, String), Vec<Anomaly>> =
            HashMap::new();
        for anomaly in raw {
            groups
                .entry((anomaly.timestamp, anomaly.metric.clone()))
                .or_default()
                .push(anomaly);
        }

        let mut combined: Vec<Anomaly> = groups
            .into_values()
            .filter(|members| members.len() >= self.config.ensemble_min_votes)
            .map(|members| self.synthesize(members, active_count))
            .collect();

        // 再現性のある決定的な順序: 深刻度降順 → |スコア|降順 → 時刻 → メトリクス
        combined.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| {
                    b.score
                        .abs()
                        .partial_cmp(&a.score.abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.metric.cmp(&b.metric))
        });

        debug!("Ensemble produced {} combined anomalies", combined.len());
        combined
    }

    /// 1グループの投票から合議異常を合成
    fn synthesize(&self, members: Vec<Anomaly>, active_count: usize) -> Anomaly {
        let votes = members.len();
        let confidence_sum: f64 = members.iter().map(|m| m.confidence).sum();

        let (score, threshold) = if self.config.ensemble_weight_by_confidence
            && confidence_sum > f64::EPSILON
        {
            (
                members.iter().map(|m| m.score * m.confidence).sum::<f64>() / confidence_sum,
                members
                    .iter()
                    .map(|m| m.threshold * m.confidence)
                    .sum::<f64>()
                    / confidence_sum,
            )
        } else {
            (
                members.iter().map(|m| m.score).sum::<f64>() / votes as f64,
                members.iter().map(|m| m.threshold).sum::<f64>() / votes as f64,
            )
        };

        let severity = members
            .iter()
            .map(|m| m.severity)
            .max()
            .unwrap_or(Severity::Low);
        let confidence = (votes as f64 / active_count.max(1) as f64).clamp(0.0, 1.0);

        let mut method_votes = serde_json::Map::new();
        let mut sub_contexts = serde_json::Map::new();
        for member in &members {
            let name = member.method.to_string();
            let count = method_votes
                .get(&name)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            method_votes.insert(name.clone(), json!(count + 1));
            sub_contexts.insert(
                name,
                json!({
                    "score": member.score,
                    "threshold": member.threshold,
                    "confidence": member.confidence,
                    "context": member.context,
                }),
            );
        }

        let first = &members[0];
        let mut context = HashMap::new();
        context.insert("method_votes".to_string(), Value::Object(method_votes));
        context.insert("methods".to_string(), Value::Object(sub_contexts));
        context.insert(
            "agreement_level".to_string(),
            json!(votes as f64 / active_count.max(1) as f64),
        );

        Anomaly {
            timestamp: first.timestamp,
            metric: first.metric.clone(),
            value: first.value.clone(),
            score,
            method: DetectionMethod::Ensemble,
            severity,
            threshold,
            confidence,
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::BTreeSet;

    fn config_with(methods: &[DetectionMethod], min_votes: usize) -> DetectionConfig {
        DetectionConfig {
            enabled_methods: methods.iter().copied().collect::<BTreeSet<_>>(),
            ensemble_min_votes: min_votes,
            ..Default::default()
        }
    }

    fn outlier_series() -> MetricSeries {
        let mut values: Vec<f64> = (0..95).map(|i| 50.0 + (i % 10) as f64).collect();
        values.extend([220.0, -120.0]);
        MetricSeries::from_values("steps", Utc::now(), Duration::hours(1), &values)
    }

    #[test]
    fn test_combined_anomaly_shape() {
        let config = config_with(&[DetectionMethod::Zscore, DetectionMethod::Iqr], 2);
        let ensemble = EnsembleDetector::from_config(&config);
        let anomalies = ensemble.detect(&outlier_series()).unwrap();

        assert!(!anomalies.is_empty());
        for anomaly in &anomalies {
            assert_eq!(anomaly.method, DetectionMethod::Ensemble);
            assert!(anomaly.context.contains_key("method_votes"));
            assert!(anomaly.context.contains_key("agreement_level"));
            // 両手法が合意しているので信頼度は1.0
            assert_eq!(anomaly.confidence, 1.0);
        }
    }

    #[test]
    fn test_min_votes_monotonicity() {
        let series = outlier_series();
        let mut previous_len = usize::MAX;
        for min_votes in 1..=3 {
            let config = config_with(
                &[
                    DetectionMethod::Zscore,
                    DetectionMethod::ModifiedZscore,
                    DetectionMethod::Iqr,
                ],
                min_votes,
            );
            let anomalies = EnsembleDetector::from_config(&config).detect(&series).unwrap();
            assert!(
                anomalies.len() <= previous_len,
                "raising min_votes must never grow the result set"
            );
            previous_len = anomalies.len();
        }
    }

    #[test]
    fn test_constant_series_empty_everywhere() {
        let series =
            MetricSeries::from_values("sleep", Utc::now(), Duration::hours(1), &[7.5; 100]);
        let config = config_with(
            &[
                DetectionMethod::Zscore,
                DetectionMethod::ModifiedZscore,
                DetectionMethod::Iqr,
                DetectionMethod::IsolationForest,
                DetectionMethod::Lof,
            ],
            1,
        );
        let anomalies = EnsembleDetector::from_config(&config).detect(&series).unwrap();
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_failing_detector_does_not_abort_siblings() {
        // 13点ではSTL（2周期=14点必要）は失敗するが、Z-スコアは動く
        let mut values = vec![50.0; 12];
        values.push(500.0);
        let series = MetricSeries::from_values("steps", Utc::now(), Duration::days(1), &values);

        let config = config_with(&[DetectionMethod::Zscore, DetectionMethod::Stl], 1);
        let anomalies = EnsembleDetector::from_config(&config).detect(&series).unwrap();
        assert!(!anomalies.is_empty());
    }

    #[test]
    fn test_insufficient_input_is_an_error() {
        let series = MetricSeries::from_values("steps", Utc::now(), Duration::hours(1), &[1.0, 2.0]);
        let config = config_with(&[DetectionMethod::Zscore], 1);
        assert!(matches!(
            EnsembleDetector::from_config(&config).detect(&series),
            Err(Error::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_severity_is_group_max() {
        let config = config_with(&[DetectionMethod::Zscore, DetectionMethod::Iqr], 2);
        let ensemble = EnsembleDetector::from_config(&config);
        let anomalies = ensemble.detect(&outlier_series()).unwrap();

        for anomaly in &anomalies {
            let methods = anomaly.context["methods"].as_object().unwrap();
            let member_max = methods
                .values()
                .map(|v| {
                    let score = v["score"].as_f64().unwrap();
                    let threshold = v["threshold"].as_f64().unwrap();
                    Severity::from_ratio(score / threshold)
                })
                .max()
                .unwrap();
            assert_eq!(anomaly.severity, member_max);
        }
    }

    #[test]
    fn test_frame_dispatch_runs_univariate_per_column() {
        let timestamps: Vec<_> = (0..60).map(|i| Utc::now() + Duration::hours(i)).collect();
        let mut frame = MetricFrame::new(timestamps);
        let mut hr: Vec<f64> = (0..60).map(|i| 60.0 + (i % 7) as f64).collect();
        hr[30] = 240.0;
        let steps: Vec<f64> = (0..60).map(|i| 4000.0 + (i % 13) as f64 * 10.0).collect();
        frame.insert_column("heart_rate", hr).unwrap();
        frame.insert_column("steps", steps).unwrap();

        let config = config_with(&[DetectionMethod::Zscore, DetectionMethod::Iqr], 2);
        let anomalies = EnsembleDetector::from_config(&config)
            .detect_frame(&frame)
            .unwrap();
        assert!(anomalies.iter().any(|a| a.metric == "heart_rate"));
        assert!(anomalies.iter().all(|a| a.metric != "steps"));
    }
}
