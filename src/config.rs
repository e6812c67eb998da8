//! Detection Configuration
//!
//! 検知エンジンの設定。1回の検知実行中は不変として扱い、
//! フィードバックによる調整は次回実行の検知器生成に反映される。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::types::DetectionMethod;

/// 異常検知設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// 有効な検知手法
    pub enabled_methods: BTreeSet<DetectionMethod>,
    /// Z-スコアしきい値
    pub zscore_threshold: f64,
    /// 修正Z-スコアしきい値
    pub modified_zscore_threshold: f64,
    /// IQR倍率
    pub iqr_multiplier: f64,
    /// 汚染率（異常点の期待割合、密度・分離ベース手法用）
    pub contamination: f64,
    /// Isolation Forestのツリー数
    pub isolation_trees: usize,
    /// LOFの近傍数
    pub lof_neighbors: usize,
    /// 季節分解の周期（デフォルトは週次）
    pub stl_period: usize,
    /// オートエンコーダのウィンドウ長
    pub lstm_window: usize,
    /// 学習誤差の何パーセンタイルを運用しきい値にするか
    pub lstm_threshold_percentile: f64,
    /// アンサンブル成立に必要な最小投票数
    pub ensemble_min_votes: usize,
    /// スコア合成を信頼度で重み付けするか
    pub ensemble_weight_by_confidence: bool,
    /// フィードバックによるしきい値適応を有効にするか
    pub adaptive_thresholds: bool,
    /// フィードバック学習率
    pub feedback_learning_rate: f64,
    /// グローバル調整に必要な最小フィードバック数
    pub min_feedback_for_adjustment: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let enabled_methods = [
            DetectionMethod::Zscore,
            DetectionMethod::ModifiedZscore,
            DetectionMethod::Iqr,
            DetectionMethod::IsolationForest,
            DetectionMethod::Lof,
        ]
        .into_iter()
        .collect();

        Self {
            enabled_methods,
            zscore_threshold: 3.0,
            modified_zscore_threshold: 3.5,
            iqr_multiplier: 1.5,
            contamination: 0.01,
            isolation_trees: 100,
            lof_neighbors: 20,
            stl_period: 7,
            lstm_window: 24,
            lstm_threshold_percentile: 95.0,
            ensemble_min_votes: 2,
            ensemble_weight_by_confidence: true,
            adaptive_thresholds: true,
            feedback_learning_rate: 0.1,
            min_feedback_for_adjustment: 3,
        }
    }
}

impl DetectionConfig {
    /// 設定を検証する。検知時ではなく構築・更新時に呼び出す
    pub fn validate(&self) -> Result<()> {
        if self.enabled_methods.is_empty() {
            return Err(Error::InvalidConfig(
                "enabled_methods must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("zscore_threshold", self.zscore_threshold),
            ("modified_zscore_threshold", self.modified_zscore_threshold),
            ("iqr_multiplier", self.iqr_multiplier),
        ] {
            if value <= 0.0 || !value.is_finite() {
                return Err(Error::InvalidConfig(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if self.contamination <= 0.0 || self.contamination > 0.5 {
            return Err(Error::InvalidConfig(format!(
                "contamination must be in (0, 0.5], got {}",
                self.contamination
            )));
        }
        if self.ensemble_min_votes == 0 {
            return Err(Error::InvalidConfig(
                "ensemble_min_votes must be at least 1".to_string(),
            ));
        }
        if self.feedback_learning_rate <= 0.0 || self.feedback_learning_rate >= 1.0 {
            return Err(Error::InvalidConfig(format!(
                "feedback_learning_rate must be in (0, 1), got {}",
                self.feedback_learning_rate
            )));
        }
        if self.stl_period < 2 {
            return Err(Error::InvalidConfig(
                "stl_period must be at least 2".to_string(),
            ));
        }
        if self.lstm_window < 2 {
            return Err(Error::InvalidConfig(
                "lstm_window must be at least 2".to_string(),
            ));
        }
        if self.lstm_threshold_percentile <= 0.0 || self.lstm_threshold_percentile >= 100.0 {
            return Err(Error::InvalidConfig(format!(
                "lstm_threshold_percentile must be in (0, 100), got {}",
                self.lstm_threshold_percentile
            )));
        }
        Ok(())
    }

    /// 手法のグローバルしきい値を取得
    pub fn method_threshold(&self, method: DetectionMethod) -> Option<f64> {
        match method {
            DetectionMethod::Zscore => Some(self.zscore_threshold),
            DetectionMethod::ModifiedZscore => Some(self.modified_zscore_threshold),
            DetectionMethod::Iqr | DetectionMethod::Stl => Some(self.iqr_multiplier),
            DetectionMethod::IsolationForest | DetectionMethod::Lof => Some(self.contamination),
            _ => None,
        }
    }

    /// 手法のグローバルしきい値を上書き（明示的なユーザー指定用）
    pub fn set_method_threshold(&mut self, method: DetectionMethod, value: f64) -> Result<()> {
        if value <= 0.0 || !value.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "threshold for {} must be positive, got {}",
                method, value
            )));
        }
        match method {
            DetectionMethod::Zscore => self.zscore_threshold = value,
            DetectionMethod::ModifiedZscore => self.modified_zscore_threshold = value,
            DetectionMethod::Iqr | DetectionMethod::Stl => self.iqr_multiplier = value,
            DetectionMethod::IsolationForest | DetectionMethod::Lof => {
                self.contamination = value.min(0.5)
            }
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "method {} has no adjustable threshold",
                    method
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(DetectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_methods_rejected() {
        let config = DetectionConfig {
            enabled_methods: BTreeSet::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_positive_threshold_rejected() {
        let config = DetectionConfig {
            zscore_threshold: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DetectionConfig {
            iqr_multiplier: -1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_contamination_range() {
        let config = DetectionConfig {
            contamination: 0.7,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_method_threshold() {
        let mut config = DetectionConfig::default();
        config
            .set_method_threshold(DetectionMethod::Zscore, 2.5)
            .unwrap();
        assert_eq!(config.zscore_threshold, 2.5);
        assert!(config
            .set_method_threshold(DetectionMethod::Ensemble, 1.0)
            .is_err());
    }
}
