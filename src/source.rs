//! External Collaborator Contracts
//!
//! 検知コアが消費・公開する外部協調者の契約。データの生成方法
//! （ファイル、データベース、ストリーミングローダ）や通知の整形・
//! レート制限・配送はすべてコアの関心の外にある。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::series::MetricFrame;
use crate::types::Anomaly;

/// 健康データソースの契約
#[async_trait]
pub trait HealthDataSource: Send + Sync {
    /// 全メトリクスのテーブルを取得
    async fn frame(&self) -> Result<MetricFrame>;

    /// データの期間（データがなければNone）
    async fn date_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)>;

    /// 利用可能なメトリクス名の一覧
    async fn available_metrics(&self) -> Vec<String>;
}

/// 通知シンクの契約。コアの義務は整形済みのAnomalyを渡すところまで
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// フィルタ済みの異常を通知系へ引き渡す
    async fn notify(&self, anomaly: &Anomaly);
}
