//! End-to-end detection scenarios
//!
//! 検知エンジン全体の結合シナリオテスト。既知の外れ値を注入した系列、
//! 定数系列、フィードバック学習、季節分解、ハイブリッド劣化モードを
//! システム境界から検証する。

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use vitalwatch_rs::detectors::{Detector, IqrDetector, StlDetector, ZScoreDetector};
use vitalwatch_rs::feedback::{FeedbackProcessor, FeedbackType};
use vitalwatch_rs::{
    Anomaly, AnomalyDetectionSystem, DetectionConfig, DetectionMethod, EnsembleDetector,
    MetricSeries, MetricValue,
};

fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-05-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// 平均50・ばらつき約10の決定的な擬似正規系列に既知の外れ値を注入する
fn series_with_known_outliers() -> (MetricSeries, Vec<usize>) {
    let mut values: Vec<f64> = (0..95)
        .map(|i| {
            let i = i as f64;
            50.0 + 10.0 * (i * 0.7).sin() + 4.0 * (i * 1.3).cos()
        })
        .collect();

    let outliers = [150.0, 200.0, 0.0, -50.0, 300.0];
    let positions = vec![10, 30, 50, 70, 90];
    for (&position, &outlier) in positions.iter().zip(outliers.iter()) {
        values[position] = outlier;
    }

    (
        MetricSeries::from_values("heart_rate", base_time(), Duration::hours(1), &values),
        positions,
    )
}

fn timestamps_of(anomalies: &[Anomaly]) -> HashSet<DateTime<Utc>> {
    anomalies.iter().map(|a| a.timestamp).collect()
}

#[test]
fn scenario_injected_outliers_zscore_and_iqr_agree() {
    let (series, positions) = series_with_known_outliers();
    let at = |i: usize| base_time() + Duration::hours(i as i64);

    // Z-スコア（しきい値3.0）は200と300を必ず検知する
    let zscore_flags = timestamps_of(&ZScoreDetector::new(3.0).detect(&series).unwrap());
    assert!(zscore_flags.contains(&at(positions[1])), "200 must be flagged");
    assert!(zscore_flags.contains(&at(positions[4])), "300 must be flagged");

    // IQR（倍率1.5）も同様
    let iqr_flags = timestamps_of(&IqrDetector::new(1.5).detect(&series).unwrap());
    assert!(iqr_flags.contains(&at(positions[1])));
    assert!(iqr_flags.contains(&at(positions[4])));

    // min_votes=2のアンサンブルは両者が合意した位置と正確に一致する
    let config = DetectionConfig {
        enabled_methods: [DetectionMethod::Zscore, DetectionMethod::Iqr]
            .into_iter()
            .collect::<BTreeSet<_>>(),
        ensemble_min_votes: 2,
        ..Default::default()
    };
    let ensemble_flags = timestamps_of(
        &EnsembleDetector::from_config(&config)
            .detect(&series)
            .unwrap(),
    );
    let intersection: HashSet<_> = zscore_flags.intersection(&iqr_flags).copied().collect();
    assert_eq!(ensemble_flags, intersection);
}

#[tokio::test]
async fn scenario_constant_series_is_empty_everywhere() {
    let series =
        MetricSeries::from_values("steps", base_time(), Duration::hours(1), &[8000.0; 100]);

    // 個々の統計検知器はすべて空
    assert!(ZScoreDetector::new(3.0).detect(&series).unwrap().is_empty());
    assert!(IqrDetector::new(1.5).detect(&series).unwrap().is_empty());

    // アンサンブルも空、呼び出しチェーンのどこにも例外はない
    let config = DetectionConfig::default();
    let ensemble = EnsembleDetector::from_config(&config);
    assert!(ensemble.detect(&series).unwrap().is_empty());

    let system = AnomalyDetectionSystem::new(config).unwrap();
    assert!(system.detect_anomalies(&series).await.is_empty());
}

#[tokio::test]
async fn scenario_false_positive_feedback_raises_threshold() {
    let config = Arc::new(RwLock::new(DetectionConfig::default()));
    let original_threshold = config.read().await.zscore_threshold;
    let processor = FeedbackProcessor::new(config);

    // しきい値ぎりぎりで検知された異常
    let borderline = Anomaly::new(
        base_time(),
        "hr",
        MetricValue::Scalar(182.0),
        3.2,
        DetectionMethod::Zscore,
        original_threshold,
        0.55,
    );

    // 最初のフィルタは素通し（個人しきい値が未登録）
    let passed = processor.filter_anomalies(vec![borderline.clone()]).await;
    assert_eq!(passed.len(), 1);

    for _ in 0..5 {
        processor
            .process_feedback(&borderline, FeedbackType::FalsePositive, None, None)
            .await
            .unwrap();
    }

    let personal = processor
        .personal_threshold("hr", DetectionMethod::Zscore)
        .await
        .unwrap();
    assert_eq!(personal.false_positives, 5);
    assert!(
        original_threshold * personal.multiplier > original_threshold,
        "adjusted threshold must strictly exceed the original"
    );

    // 以前は通っていた境界異常がフィルタで落ちる
    let filtered = processor.filter_anomalies(vec![borderline]).await;
    assert!(filtered.is_empty());
}

#[test]
fn scenario_stl_separates_residual_spike_from_seasonal_peaks() {
    // 週次の季節振幅15、既知位置に残差スパイク40を注入した60点の系列
    let spike_index = 30;
    let values: Vec<f64> = (0..60)
        .map(|i| {
            let phase = (i % 7) as f64 / 7.0 * std::f64::consts::TAU;
            let noise = ((i * 37) % 11) as f64 / 10.0 - 0.5;
            let spike = if i == spike_index { 40.0 } else { 0.0 };
            100.0 + 15.0 * phase.sin() + noise + spike
        })
        .collect();
    let series = MetricSeries::from_values("steps", base_time(), Duration::days(1), &values);

    let anomalies = StlDetector::new(7, 1.5).detect(&series).unwrap();
    let flagged = timestamps_of(&anomalies);

    let spike_ts = base_time() + Duration::days(spike_index as i64);
    assert!(flagged.contains(&spike_ts), "residual spike must be flagged");

    // スパイクの移動平均ウィンドウ外にある通常の季節ピークは検知されない
    for i in 0..60usize {
        let is_seasonal_peak = i % 7 == 2;
        let near_spike = (i as i64 - spike_index as i64).abs() <= 3;
        if is_seasonal_peak && !near_spike {
            let ts = base_time() + Duration::days(i as i64);
            assert!(
                !flagged.contains(&ts),
                "ordinary seasonal peak at {} must not be flagged",
                i
            );
        }
    }
}

#[tokio::test]
async fn scenario_hybrid_degrades_to_statistical_only() {
    let values: Vec<f64> = (0..63)
        .map(|i| {
            let phase = (i % 7) as f64 / 7.0 * std::f64::consts::TAU;
            let noise = ((i * 29) % 13) as f64 / 10.0 - 0.6;
            let spike = if i == 40 { 35.0 } else { 0.0 };
            90.0 + 10.0 * phase.sin() + noise + spike
        })
        .collect();
    let series = MetricSeries::from_values("sleep_minutes", base_time(), Duration::days(1), &values);

    let statistical = StlDetector::new(7, 1.5).detect(&series).unwrap();
    assert!(!statistical.is_empty());

    // MLを組み込んでも学習していなければ統計単独と同一の結果になる
    #[cfg(feature = "ml")]
    let hybrid = vitalwatch_rs::HybridTemporalDetector::new(7, 1.5)
        .with_ml(vitalwatch_rs::detectors::LstmDetector::new(24));
    #[cfg(not(feature = "ml"))]
    let hybrid = vitalwatch_rs::HybridTemporalDetector::new(7, 1.5);

    let result = hybrid.detect(&series).unwrap();
    assert_eq!(result.len(), statistical.len());
    for (merged, stat) in result.iter().zip(statistical.iter()) {
        assert_eq!(merged.timestamp, stat.timestamp);
        assert_eq!(merged.score, stat.score);
        assert_eq!(
            merged.context["detection_agreement"],
            serde_json::json!("Statistical only")
        );
    }
}

#[tokio::test]
async fn scenario_full_pipeline_with_notification_sink() {
    use async_trait::async_trait;
    use std::sync::Mutex;
    use vitalwatch_rs::source::NotificationSink;

    #[derive(Default)]
    struct CapturingSink {
        captured: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for CapturingSink {
        async fn notify(&self, anomaly: &Anomaly) {
            self.captured.lock().unwrap().push(anomaly.feedback_key());
        }
    }

    let sink = Arc::new(CapturingSink::default());
    let system = AnomalyDetectionSystem::new(DetectionConfig::default())
        .unwrap()
        .with_notification_sink(sink.clone());

    let (series, _) = series_with_known_outliers();
    let anomalies = system.detect_anomalies(&series).await;
    assert!(!anomalies.is_empty());

    // フィルタを通過した異常はすべて通知側へ渡る
    let captured = sink.captured.lock().unwrap();
    assert_eq!(captured.len(), anomalies.len());

    drop(captured);

    // 履歴には1回分のバッチサマリが残る
    let history = system.detection_history(10).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].total_points, 95);
}
