//! Anomaly Detectors
//!
//! 単一の検知戦略を実装する検知器群。各検知器は`Detector`（単変量）と
//! `MultivariateDetector`（多変量）のトレイトを通じてアンサンブルに
//! 差し替え可能な形で組み込まれる。
//!
//! ## 検知手法
//!
//! - **Z-スコア / 修正Z-スコア**: 平均・標準偏差、中央値・MADによる偏差検知
//! - **IQR**: 四分位範囲のフェンスによる外れ値検知
//! - **Isolation Forest**: ランダム分離木のパス長による多変量検知
//! - **LOF**: 局所密度比による多変量検知
//! - **STL**: 季節トレンド分解の残差に対するIQR検知
//! - **オートエンコーダ**（`ml`フィーチャ）: ウィンドウ再構成誤差による時系列検知
//!
//! 全検知器共通の失敗セマンティクス: 有効点数が最小要件未満の場合は
//! `Error::InsufficientData`。分散がゼロの退化した分布はエラーではなく
//! 空の結果を返す。

pub mod iqr;
pub mod isolation_forest;
pub mod lof;
pub mod stats;
pub mod stl;
pub mod zscore;

#[cfg(feature = "ml")]
pub mod autoencoder;

use crate::error::{Error, Result};
use crate::series::{MetricFrame, MetricSeries};
use crate::types::{Anomaly, DetectionMethod};

pub use iqr::IqrDetector;
pub use isolation_forest::IsolationForestDetector;
pub use lof::LofDetector;
pub use stl::StlDetector;
pub use zscore::{ModifiedZScoreDetector, ZScoreDetector};

#[cfg(feature = "ml")]
pub use autoencoder::{LstmDetector, TrainingReport};

/// 全検知器共通の最小有効点数
pub const MIN_SERIES_POINTS: usize = 3;

/// シーケンスモデル（深層学習相当）の利用可否。
/// 起動時に一度だけ解決されるケイパビリティフラグであり、
/// 呼び出し側は例外処理ではなくこのフラグで分岐する。
#[derive(Debug, Clone, Copy)]
pub struct MlCapability;

impl MlCapability {
    /// シーケンスモデルが利用可能かどうか
    pub const fn available() -> bool {
        cfg!(feature = "ml")
    }
}

/// 単変量検知器の共通インターフェース
pub trait Detector: Send + Sync {
    /// この検知器の手法タグ
    fn method(&self) -> DetectionMethod;

    /// 必要な最小有効点数
    fn min_points(&self) -> usize {
        MIN_SERIES_POINTS
    }

    /// 時系列から異常を検知
    fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>>;
}

/// 多変量検知器の共通インターフェース
pub trait MultivariateDetector: Send + Sync {
    /// この検知器の手法タグ
    fn method(&self) -> DetectionMethod;

    /// テーブル全体から異常を検知
    fn detect_frame(&self, frame: &MetricFrame) -> Result<Vec<Anomaly>>;
}

/// 最小点数の前提条件を検証し、有効値を返す
pub(crate) fn require_points(series: &MetricSeries, required: usize) -> Result<Vec<f64>> {
    let values = series.values();
    if values.len() < required {
        return Err(Error::insufficient(required, values.len()));
    }
    Ok(values)
}
