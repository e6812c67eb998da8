//! Adaptive Feedback Processor
//!
//! ユーザーの真陽性・偽陽性フィードバックを取り込み、(メトリクス, 手法)
//! ごとの個人しきい値倍率を学習する。偽陽性の繰り返しには漸増する補正、
//! 真陽性には緩やかな非対称の緩和を適用し、初期のノイズで振動しないよう
//! 収束させる。`filter_anomalies`は同一パス内で調整済みしきい値を
//! 再評価するため、フィードバックは次回の検知を待たず即座に効く。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DetectionConfig;
use crate::error::Result;
use crate::storage::{FeedbackLog, ThresholdStore};
use crate::types::{Anomaly, DetectionMethod};

/// フィードバック種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    /// 誤検知（感度を下げる）
    FalsePositive,
    /// 正しい検知（感度をわずかに上げる）
    TruePositive,
    /// 明示的な感度調整要求
    AdjustSensitivity,
}

/// (メトリクス, 手法)ごとの個人適応状態
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalThreshold {
    /// メトリクス名
    pub metric: String,
    /// 検知手法
    pub method: DetectionMethod,
    /// しきい値倍率（常に正、初期値1.0）
    pub multiplier: f64,
    /// 偽陽性の累計
    pub false_positives: u32,
    /// 真陽性の累計
    pub true_positives: u32,
    /// 最終更新時刻
    pub last_updated: DateTime<Utc>,
}

impl PersonalThreshold {
    /// 初回フィードバック時に作成される初期状態
    pub fn new(metric: impl Into<String>, method: DetectionMethod) -> Self {
        Self {
            metric: metric.into(),
            method,
            multiplier: 1.0,
            false_positives: 0,
            true_positives: 0,
            last_updated: Utc::now(),
        }
    }

    /// 受け取ったフィードバックの総数
    pub fn feedback_count(&self) -> u32 {
        self.false_positives + self.true_positives
    }
}

/// フィードバックイベント（追記専用、作成後は不変）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFeedback {
    /// イベントID
    pub id: Uuid,
    /// 対象異常の安定キー（timestamp + metric + method）
    pub anomaly_key: String,
    /// メトリクス名
    pub metric: String,
    /// 検知手法
    pub method: DetectionMethod,
    /// フィードバック種別
    pub feedback_type: FeedbackType,
    /// 受領時刻
    pub timestamp: DateTime<Utc>,
    /// 任意コメント
    pub comment: Option<String>,
    /// 明示的なしきい値上書き（倍率機構をバイパスする）
    pub suggested_threshold: Option<f64>,
}

/// 適応フィードバックプロセッサ
pub struct FeedbackProcessor {
    /// グローバル検知設定（次回の検知器生成に反映される）
    config: Arc<RwLock<DetectionConfig>>,
    /// 個人しきい値の状態。このプロセッサのメソッド経由でのみ読み書きする
    thresholds: Arc<RwLock<HashMap<(String, DetectionMethod), PersonalThreshold>>>,
    /// 永続ストア（任意）
    store: Option<Arc<dyn ThresholdStore>>,
    /// フィードバック追記ログ（任意）
    log: Option<Arc<dyn FeedbackLog>>,
}

impl FeedbackProcessor {
    /// 新しいプロセッサを作成
    pub fn new(config: Arc<RwLock<DetectionConfig>>) -> Self {
        Self {
            config,
            thresholds: Arc::new(RwLock::new(HashMap::new())),
            store: None,
            log: None,
        }
    }

    /// 個人しきい値の永続ストアを設定
    pub fn with_store(mut self, store: Arc<dyn ThresholdStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// フィードバックログを設定
    pub fn with_log(mut self, log: Arc<dyn FeedbackLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// ストアから個人しきい値を復元する
    pub async fn hydrate(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let loaded = store.load_all().await?;
        let count = loaded.len();
        let mut thresholds = self.thresholds.write().await;
        for threshold in loaded {
            thresholds.insert(
                (threshold.metric.clone(), threshold.method),
                threshold,
            );
        }
        info!("Hydrated {} personal thresholds from store", count);
        Ok(count)
    }

    /// フィードバックを処理し、個人しきい値とグローバル設定を調整する
    pub async fn process_feedback(
        &self,
        anomaly: &Anomaly,
        feedback_type: FeedbackType,
        comment: Option<String>,
        suggested_threshold: Option<f64>,
    ) -> Result<UserFeedback> {
        let feedback = UserFeedback {
            id: Uuid::new_v4(),
            anomaly_key: anomaly.feedback_key(),
            metric: anomaly.metric.clone(),
            method: anomaly.method,
            feedback_type,
            timestamp: Utc::now(),
            comment,
            suggested_threshold,
        };

        let learning_rate = self.config.read().await.feedback_learning_rate;
        let key = (anomaly.metric.clone(), anomaly.method);

        let updated = {
            let mut thresholds = self.thresholds.write().await;
            let entry = thresholds
                .entry(key)
                .or_insert_with(|| PersonalThreshold::new(&anomaly.metric, anomaly.method));

            match feedback_type {
                FeedbackType::FalsePositive => {
                    entry.false_positives += 1;
                    // 偽陽性が繰り返されるほど補正を強める
                    let step = 1.0
                        + learning_rate * (1.0 + entry.false_positives as f64 / 10.0);
                    entry.multiplier *= step;
                }
                FeedbackType::TruePositive => {
                    entry.true_positives += 1;
                    // 真陽性側は過補正しないよう緩やかに下げる
                    entry.multiplier *= 1.0 - learning_rate * 0.5;
                }
                FeedbackType::AdjustSensitivity => {}
            }
            entry.last_updated = feedback.timestamp;
            debug!(
                "Personal threshold for ({}, {}): multiplier={:.4}, fp={}, tp={}",
                entry.metric, entry.method, entry.multiplier, entry.false_positives,
                entry.true_positives
            );
            entry.clone()
        };

        // 明示的なしきい値指定は倍率機構をバイパスして直接上書きする
        if let Some(threshold) = suggested_threshold {
            let mut config = self.config.write().await;
            config.set_method_threshold(anomaly.method, threshold)?;
            info!(
                "Explicit threshold override for {}: {}",
                anomaly.method, threshold
            );
        }

        self.adjust_global_config(&updated, feedback_type).await;
        self.persist(&updated, &feedback).await;

        Ok(feedback)
    }

    /// 十分なフィードバックが蓄積したらグローバル設定も追従させる
    async fn adjust_global_config(&self, state: &PersonalThreshold, feedback_type: FeedbackType) {
        let mut config = self.config.write().await;
        if !config.adaptive_thresholds {
            return;
        }
        if (state.feedback_count() as usize) < config.min_feedback_for_adjustment {
            return;
        }

        match state.method {
            DetectionMethod::Zscore
            | DetectionMethod::ModifiedZscore
            | DetectionMethod::Iqr
            | DetectionMethod::Stl => {
                let current = config.method_threshold(state.method).unwrap_or(1.0);
                let adjusted = match feedback_type {
                    FeedbackType::FalsePositive => current * 1.10,
                    FeedbackType::TruePositive => current * 0.95,
                    FeedbackType::AdjustSensitivity => return,
                };
                if config.set_method_threshold(state.method, adjusted).is_ok() {
                    debug!(
                        "Global threshold for {} adjusted to {:.4}",
                        state.method, adjusted
                    );
                }
            }
            DetectionMethod::IsolationForest | DetectionMethod::Lof => {
                // 汚染率は逆向きに動かす（偽陽性 → 異常割合を下げる）
                let adjusted = match feedback_type {
                    FeedbackType::FalsePositive => config.contamination * 0.9,
                    FeedbackType::TruePositive => config.contamination * 1.05,
                    FeedbackType::AdjustSensitivity => return,
                };
                config.contamination = adjusted.clamp(0.001, 0.5);
                debug!("Global contamination adjusted to {:.4}", config.contamination);
            }
            _ => {}
        }
    }

    /// 永続化。失敗は警告に留め、フィードバック処理自体は成功させる
    async fn persist(&self, state: &PersonalThreshold, feedback: &UserFeedback) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put(state).await {
                warn!("Failed to persist personal threshold: {}", e);
            }
        }
        if let Some(log) = &self.log {
            if let Err(e) = log.append(feedback).await {
                warn!("Failed to append feedback log: {}", e);
            }
        }
    }

    /// 個人しきい値で異常を再評価し、通らないものを落とす。
    /// 登録がない(メトリクス, 手法)はそのまま通過する
    pub async fn filter_anomalies(&self, anomalies: Vec<Anomaly>) -> Vec<Anomaly> {
        let thresholds = self.thresholds.read().await;
        let before = anomalies.len();

        let filtered: Vec<Anomaly> = anomalies
            .into_iter()
            .filter_map(|mut anomaly| {
                let key = (anomaly.metric.clone(), anomaly.method);
                match thresholds.get(&key) {
                    None => Some(anomaly),
                    Some(personal) => {
                        let adjusted = anomaly.threshold * personal.multiplier;
                        if anomaly.score.abs() > adjusted {
                            anomaly
                                .context
                                .insert("adjusted_threshold".to_string(), json!(adjusted));
                            anomaly.context.insert(
                                "personal_multiplier".to_string(),
                                json!(personal.multiplier),
                            );
                            Some(anomaly)
                        } else {
                            None
                        }
                    }
                }
            })
            .collect();

        if filtered.len() < before {
            debug!(
                "Personal thresholds filtered {} of {} anomalies",
                before - filtered.len(),
                before
            );
        }
        filtered
    }

    /// 個人しきい値を取得
    pub async fn personal_threshold(
        &self,
        metric: &str,
        method: DetectionMethod,
    ) -> Option<PersonalThreshold> {
        self.thresholds
            .read()
            .await
            .get(&(metric.to_string(), method))
            .cloned()
    }

    /// 個人しきい値を明示的にリセット
    pub async fn reset(&self, metric: &str, method: DetectionMethod) {
        self.thresholds
            .write()
            .await
            .remove(&(metric.to_string(), method));
        info!("Reset personal threshold for ({}, {})", metric, method);
    }
}
