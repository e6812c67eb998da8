//! Realtime Detection Worker
//!
//! 固定の周期でデータソースをポーリングし、検知結果をスレッドセーフな
//! キューへ積むバックグラウンドワーカー。協調的な停止フラグを各周回で
//! 確認し、1周回の失敗はログと短いバックオフで隔離する。不正なデータ
//! 点ひとつでポーリングループが死ぬことはない。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::source::HealthDataSource;
use crate::system::AnomalyDetectionSystem;
use crate::types::DetectionResult;

/// リアルタイムモード設定
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// 検知周期
    pub cadence: Duration,
    /// 結果キューの容量
    pub channel_capacity: usize,
    /// 周回失敗時のバックオフ
    pub error_backoff: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_millis(100),
            channel_capacity: 64,
            error_backoff: Duration::from_millis(500),
        }
    }
}

/// リアルタイム検知ワーカーのハンドル
pub struct RealtimeDetector {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RealtimeDetector {
    /// ワーカーを起動し、結果を受け取るレシーバを返す
    pub fn start(
        system: Arc<AnomalyDetectionSystem>,
        source: Arc<dyn HealthDataSource>,
        config: RealtimeConfig,
    ) -> (Self, mpsc::Receiver<DetectionResult>) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = tokio::spawn(async move {
            info!("Realtime detection worker started ({:?} cadence)", config.cadence);
            let mut ticker = interval(config.cadence);

            loop {
                ticker.tick().await;
                if stop_flag.load(Ordering::Relaxed) {
                    break;
                }

                let frame = match source.frame().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        // 1周回の失敗はループを殺さない
                        warn!("Realtime source read failed: {}", e);
                        tokio::time::sleep(config.error_backoff).await;
                        continue;
                    }
                };

                let result = system.detect_frame_result(&frame).await;
                match tx.try_send(result) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Realtime result queue full, dropping batch");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Realtime result queue closed, stopping worker");
                        break;
                    }
                }
            }
            info!("Realtime detection worker stopped");
        });

        (Self { stop, handle }, rx)
    }

    /// 協調的に停止を要求する
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// 停止を要求し、ワーカーの終了を待つ
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.handle.await;
    }
}
