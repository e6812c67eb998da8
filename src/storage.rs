//! Feedback Persistence
//!
//! 個人しきい値とフィードバックイベントの永続化契約。
//! (メトリクス, 手法)キーのget/putと追記ログのappendを満たす
//! ストアであれば何でもよく、スキーマは実装の詳細とする。
//! テスト用のインメモリ実装と、フラットファイルのJSON実装を提供する。

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::feedback::{PersonalThreshold, UserFeedback};
use crate::types::DetectionMethod;

/// 個人しきい値ストアの契約
#[async_trait]
pub trait ThresholdStore: Send + Sync {
    /// 保存済みの個人しきい値を全件読み出す
    async fn load_all(&self) -> Result<Vec<PersonalThreshold>>;

    /// 個人しきい値を保存する
    async fn put(&self, threshold: &PersonalThreshold) -> Result<()>;
}

/// フィードバック追記ログの契約
#[async_trait]
pub trait FeedbackLog: Send + Sync {
    /// フィードバックイベントを追記する
    async fn append(&self, feedback: &UserFeedback) -> Result<()>;
}

/// インメモリストア（テスト・一時利用向け）
#[derive(Default)]
pub struct MemoryStore {
    thresholds: RwLock<HashMap<(String, DetectionMethod), PersonalThreshold>>,
    feedback: RwLock<Vec<UserFeedback>>,
}

impl MemoryStore {
    /// 新しいインメモリストアを作成
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 記録されたフィードバック件数
    pub async fn feedback_count(&self) -> usize {
        self.feedback.read().await.len()
    }
}

#[async_trait]
impl ThresholdStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<PersonalThreshold>> {
        Ok(self.thresholds.read().await.values().cloned().collect())
    }

    async fn put(&self, threshold: &PersonalThreshold) -> Result<()> {
        self.thresholds.write().await.insert(
            (threshold.metric.clone(), threshold.method),
            threshold.clone(),
        );
        Ok(())
    }
}

#[async_trait]
impl FeedbackLog for MemoryStore {
    async fn append(&self, feedback: &UserFeedback) -> Result<()> {
        self.feedback.write().await.push(feedback.clone());
        Ok(())
    }
}

/// フラットファイルのJSONストア。
/// しきい値は1ファイルのJSON、フィードバックはJSON Linesで追記する
pub struct JsonFileStore {
    thresholds_path: PathBuf,
    feedback_path: PathBuf,
    /// read-modify-writeの直列化用
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// ディレクトリを確保してストアを開く
    pub fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Arc::new(Self {
            thresholds_path: dir.join("personal_thresholds.json"),
            feedback_path: dir.join("feedback.jsonl"),
            write_lock: Mutex::new(()),
        }))
    }

    async fn read_thresholds(&self) -> Result<Vec<PersonalThreshold>> {
        match tokio::fs::read_to_string(&self.thresholds_path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl ThresholdStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<PersonalThreshold>> {
        self.read_thresholds().await
    }

    async fn put(&self, threshold: &PersonalThreshold) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_thresholds().await?;
        match all
            .iter_mut()
            .find(|t| t.metric == threshold.metric && t.method == threshold.method)
        {
            Some(existing) => *existing = threshold.clone(),
            None => all.push(threshold.clone()),
        }
        let json = serde_json::to_string_pretty(&all)?;
        tokio::fs::write(&self.thresholds_path, json).await?;
        debug!(
            "Persisted personal threshold for ({}, {})",
            threshold.metric, threshold.method
        );
        Ok(())
    }
}

#[async_trait]
impl FeedbackLog for JsonFileStore {
    async fn append(&self, feedback: &UserFeedback) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut line = serde_json::to_string(feedback)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.feedback_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::FeedbackType;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_threshold(metric: &str) -> PersonalThreshold {
        let mut threshold = PersonalThreshold::new(metric, DetectionMethod::Zscore);
        threshold.multiplier = 1.25;
        threshold.false_positives = 2;
        threshold
    }

    fn sample_feedback() -> UserFeedback {
        UserFeedback {
            id: Uuid::new_v4(),
            anomaly_key: "2025-06-01T00:00:00+00:00:heart_rate:zscore".to_string(),
            metric: "heart_rate".to_string(),
            method: DetectionMethod::Zscore,
            feedback_type: FeedbackType::FalsePositive,
            timestamp: Utc::now(),
            comment: None,
            suggested_threshold: None,
        }
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.put(&sample_threshold("heart_rate")).await.unwrap();
        store.put(&sample_threshold("steps")).await.unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);

        store.append(&sample_feedback()).await.unwrap();
        assert_eq!(store.feedback_count().await, 1);
    }

    #[tokio::test]
    async fn test_json_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();

        // 空の状態からの読み出しは空リスト
        assert!(store.load_all().await.unwrap().is_empty());

        store.put(&sample_threshold("heart_rate")).await.unwrap();
        let mut updated = sample_threshold("heart_rate");
        updated.multiplier = 2.0;
        store.put(&updated).await.unwrap();

        // 同一キーは上書きされる
        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].multiplier, 2.0);

        store.append(&sample_feedback()).await.unwrap();
        store.append(&sample_feedback()).await.unwrap();
        let log = std::fs::read_to_string(dir.path().join("feedback.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 2);
    }
}
