//! Sequence Autoencoder Detector
//!
//! LSTMエンコーダ＋線形リードアウトによるウィンドウ再構成検知器。
//! 学習系列のスライディングウィンドウを再構成するよう学習し、
//! 再構成誤差（MSE）を異常スコアとして使う。学習誤差のパーセンタイルが
//! 運用しきい値になる。学習前にdetect()を呼ぶと`ModelNotTrained`。
//!
//! 勾配はウィンドウ単位のBPTTで計算し、グローバルノルムでクリップする。
//! 学習はエポック数とバッチサイズで明示的に上限が決まる。

use ndarray::{Array1, Array2, Axis};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::{debug, info};

use super::{stats, Detector};
use crate::error::{Error, Result};
use crate::series::MetricSeries;
use crate::types::{Anomaly, DetectionMethod, MetricValue};

/// 勾配クリッピングのグローバルノルム上限
const GRAD_CLIP_NORM: f64 = 5.0;

/// LSTMゲートのパラメータ一式
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LstmParams {
    /// 入力重み（ゲート順: i, f, o, g）
    wx: [Array1<f64>; 4],
    /// 再帰重み
    wh: [Array2<f64>; 4],
    /// バイアス
    b: [Array1<f64>; 4],
    /// 線形リードアウト（ウィンドウ長 × 隠れ次元）
    decoder_w: Array2<f64>,
    /// リードアウトのバイアス
    decoder_b: Array1<f64>,
}

/// 学習済みモデル（重み＋スケーラ＋運用しきい値）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrainedModel {
    params: LstmParams,
    scaler_mean: f64,
    scaler_std: f64,
    threshold: f64,
    window: usize,
    hidden: usize,
}

/// 学習結果のレポート
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    /// 学習に使ったウィンドウ数
    pub windows: usize,
    /// 最終エポックの平均損失
    pub final_loss: f64,
    /// 決定した運用しきい値
    pub threshold: f64,
}

/// 1ウィンドウ分の順伝播キャッシュ
struct StepCache {
    x: f64,
    h_prev: Array1<f64>,
    c_prev: Array1<f64>,
    gates: [Array1<f64>; 4],
    c: Array1<f64>,
}

/// 勾配アキュムレータ
struct Gradients {
    wx: [Array1<f64>; 4],
    wh: [Array2<f64>; 4],
    b: [Array1<f64>; 4],
    decoder_w: Array2<f64>,
    decoder_b: Array1<f64>,
}

impl Gradients {
    fn zeros(window: usize, hidden: usize) -> Self {
        Self {
            wx: std::array::from_fn(|_| Array1::zeros(hidden)),
            wh: std::array::from_fn(|_| Array2::zeros((hidden, hidden))),
            b: std::array::from_fn(|_| Array1::zeros(hidden)),
            decoder_w: Array2::zeros((window, hidden)),
            decoder_b: Array1::zeros(window),
        }
    }

    fn global_norm(&self) -> f64 {
        let mut sum = 0.0;
        for g in &self.wx {
            sum += g.iter().map(|v| v * v).sum::<f64>();
        }
        for g in &self.wh {
            sum += g.iter().map(|v| v * v).sum::<f64>();
        }
        for g in &self.b {
            sum += g.iter().map(|v| v * v).sum::<f64>();
        }
        sum += self.decoder_w.iter().map(|v| v * v).sum::<f64>();
        sum += self.decoder_b.iter().map(|v| v * v).sum::<f64>();
        sum.sqrt()
    }

    fn scale(&mut self, factor: f64) {
        for g in self.wx.iter_mut() {
            g.mapv_inplace(|v| v * factor);
        }
        for g in self.wh.iter_mut() {
            g.mapv_inplace(|v| v * factor);
        }
        for g in self.b.iter_mut() {
            g.mapv_inplace(|v| v * factor);
        }
        self.decoder_w.mapv_inplace(|v| v * factor);
        self.decoder_b.mapv_inplace(|v| v * factor);
    }
}

/// LSTMオートエンコーダ検知器
#[derive(Debug, Clone)]
pub struct LstmDetector {
    window: usize,
    hidden: usize,
    epochs: usize,
    batch_size: usize,
    learning_rate: f64,
    threshold_percentile: f64,
    seed: u64,
    model: Option<TrainedModel>,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// 一様乱数ベクタ
fn uniform_array1(len: usize, rng: &mut StdRng) -> Array1<f64> {
    Array1::from_iter((0..len).map(|_| rng.gen_range(-0.08..0.08)))
}

/// 一様乱数行列
fn uniform_array2(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-0.08..0.08))
}

impl LstmParams {
    /// 小さな一様乱数で初期化。忘却ゲートのバイアスは+1
    fn init(window: usize, hidden: usize, rng: &mut StdRng) -> Self {
        let wx = std::array::from_fn(|_| uniform_array1(hidden, rng));
        let wh = std::array::from_fn(|_| uniform_array2(hidden, hidden, rng));
        let mut b: [Array1<f64>; 4] = std::array::from_fn(|_| Array1::zeros(hidden));
        b[1].fill(1.0);
        let decoder_w = uniform_array2(window, hidden, rng);
        let decoder_b = uniform_array1(window, rng);
        Self {
            wx,
            wh,
            b,
            decoder_w,
            decoder_b,
        }
    }

    /// ウィンドウを順伝播し、再構成と各ステップのキャッシュを返す
    fn forward(&self, window: &[f64]) -> (Array1<f64>, Vec<StepCache>, Array1<f64>) {
        let hidden = self.b[0].len();
        let mut h = Array1::zeros(hidden);
        let mut c: Array1<f64> = Array1::zeros(hidden);
        let mut caches = Vec::with_capacity(window.len());

        for &x in window {
            let h_prev = h.clone();
            let c_prev = c.clone();

            let mut gates: [Array1<f64>; 4] = std::array::from_fn(|k| {
                &self.wx[k] * x + &self.wh[k].dot(&h_prev) + &self.b[k]
            });
            for k in 0..3 {
                gates[k].mapv_inplace(sigmoid);
            }
            gates[3].mapv_inplace(f64::tanh);

            c = &gates[1] * &c_prev + &gates[0] * &gates[3];
            let tanh_c = c.mapv(f64::tanh);
            h = &gates[2] * &tanh_c;

            caches.push(StepCache {
                x,
                h_prev,
                c_prev,
                gates,
                c: c.clone(),
            });
        }

        let reconstruction = self.decoder_w.dot(&h) + &self.decoder_b;
        (reconstruction, caches, h)
    }

    /// 再構成誤差（MSE）のみを計算
    fn reconstruction_error(&self, window: &[f64]) -> f64 {
        let (reconstruction, _, _) = self.forward(window);
        let n = window.len() as f64;
        window
            .iter()
            .zip(reconstruction.iter())
            .map(|(x, y)| (x - y).powi(2))
            .sum::<f64>()
            / n
    }

    /// 1ウィンドウのBPTT。勾配をアキュムレータへ加算し、損失を返す
    fn backward(&self, window: &[f64], grads: &mut Gradients) -> f64 {
        let (reconstruction, caches, h_final) = self.forward(window);
        let n = window.len() as f64;
        let target = Array1::from_iter(window.iter().copied());

        let diff = &reconstruction - &target;
        let loss = diff.iter().map(|v| v * v).sum::<f64>() / n;

        // 線形リードアウトの勾配
        let dy = diff.mapv(|v| 2.0 * v / n);
        grads.decoder_w = &grads.decoder_w
            + &dy
                .clone()
                .insert_axis(Axis(1))
                .dot(&h_final.clone().insert_axis(Axis(0)));
        grads.decoder_b = &grads.decoder_b + &dy;

        // 最終ステップの隠れ状態に対する勾配
        let mut dh = self.decoder_w.t().dot(&dy);
        let mut dc_next: Array1<f64> = Array1::zeros(dh.len());

        for cache in caches.iter().rev() {
            let [i_gate, f_gate, o_gate, g_gate] = &cache.gates;
            let tanh_c = cache.c.mapv(f64::tanh);

            let d_o = &dh * &tanh_c;
            let dc = &dc_next + &(&dh * o_gate * &tanh_c.mapv(|v| 1.0 - v * v));
            let d_i = &dc * g_gate;
            let d_g = &dc * i_gate;
            let d_f = &dc * &cache.c_prev;
            dc_next = &dc * f_gate;

            let da = [
                &d_i * i_gate * &i_gate.mapv(|v| 1.0 - v),
                &d_f * f_gate * &f_gate.mapv(|v| 1.0 - v),
                &d_o * o_gate * &o_gate.mapv(|v| 1.0 - v),
                &d_g * &g_gate.mapv(|v| 1.0 - v * v),
            ];

            let mut dh_prev: Array1<f64> = Array1::zeros(dh.len());
            for k in 0..4 {
                grads.wx[k] = &grads.wx[k] + &da[k].mapv(|v| v * cache.x);
                grads.wh[k] = &grads.wh[k]
                    + &da[k]
                        .clone()
                        .insert_axis(Axis(1))
                        .dot(&cache.h_prev.clone().insert_axis(Axis(0)));
                grads.b[k] = &grads.b[k] + &da[k];
                dh_prev = dh_prev + self.wh[k].t().dot(&da[k]);
            }
            dh = dh_prev;
        }

        loss
    }

    /// SGD更新
    fn apply(&mut self, grads: &Gradients, learning_rate: f64) {
        for k in 0..4 {
            self.wx[k] = &self.wx[k] - &grads.wx[k].mapv(|v| v * learning_rate);
            self.wh[k] = &self.wh[k] - &grads.wh[k].mapv(|v| v * learning_rate);
            self.b[k] = &self.b[k] - &grads.b[k].mapv(|v| v * learning_rate);
        }
        self.decoder_w = &self.decoder_w - &grads.decoder_w.mapv(|v| v * learning_rate);
        self.decoder_b = &self.decoder_b - &grads.decoder_b.mapv(|v| v * learning_rate);
    }
}

impl LstmDetector {
    /// 新しい検知器を作成（未学習状態）
    pub fn new(window: usize) -> Self {
        Self {
            window,
            hidden: 16,
            epochs: 30,
            batch_size: 16,
            learning_rate: 0.01,
            threshold_percentile: 95.0,
            seed: 42,
            model: None,
        }
    }

    /// 学習エポック数を設定
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// バッチサイズを設定
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// しきい値パーセンタイルを設定
    pub fn with_threshold_percentile(mut self, percentile: f64) -> Self {
        self.threshold_percentile = percentile;
        self
    }

    /// 乱数シードを設定
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 学習済みかどうか
    pub fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    /// 運用しきい値（未学習ならNone）
    pub fn threshold(&self) -> Option<f64> {
        self.model.as_ref().map(|m| m.threshold)
    }

    /// スライディングウィンドウを構築
    fn build_windows(values: &[f64], window: usize) -> Vec<Vec<f64>> {
        if values.len() < window {
            return Vec::new();
        }
        (0..=values.len() - window)
            .map(|start| values[start..start + window].to_vec())
            .collect()
    }

    /// 学習系列からモデルを学習し、運用しきい値を決定する
    pub fn train(&mut self, series: &MetricSeries) -> Result<TrainingReport> {
        let values = series.values();
        let required = self.window * 2;
        if values.len() < required {
            return Err(Error::insufficient(required, values.len()));
        }

        let scaler_mean = stats::mean(&values);
        let scaler_std = stats::std_dev(&values).max(1e-6);
        let scaled: Vec<f64> = values
            .iter()
            .map(|v| (v - scaler_mean) / scaler_std)
            .collect();

        let windows = Self::build_windows(&scaled, self.window);
        info!(
            "Training sequence autoencoder on {} windows ({} epochs, batch {})",
            windows.len(),
            self.epochs,
            self.batch_size
        );

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut params = LstmParams::init(self.window, self.hidden, &mut rng);
        let mut order: Vec<usize> = (0..windows.len()).collect();
        let mut final_loss = 0.0;

        for epoch in 0..self.epochs {
            order.shuffle(&mut rng);
            let mut epoch_loss = 0.0;
            for batch in order.chunks(self.batch_size) {
                let mut grads = Gradients::zeros(self.window, self.hidden);
                for &idx in batch {
                    epoch_loss += params.backward(&windows[idx], &mut grads);
                }
                grads.scale(1.0 / batch.len() as f64);
                let norm = grads.global_norm();
                if norm > GRAD_CLIP_NORM {
                    grads.scale(GRAD_CLIP_NORM / norm);
                }
                params.apply(&grads, self.learning_rate);
            }
            final_loss = epoch_loss / windows.len() as f64;
            if epoch % 10 == 0 {
                debug!("Epoch {}: avg loss {:.6}", epoch, final_loss);
            }
        }

        // 学習誤差の分布から運用しきい値を決める
        let errors: Vec<f64> = windows
            .iter()
            .map(|w| params.reconstruction_error(w))
            .collect();
        let threshold = stats::quantile(&errors, self.threshold_percentile / 100.0).max(1e-9);

        info!(
            "Autoencoder training finished: loss={:.6}, threshold={:.6}",
            final_loss, threshold
        );

        self.model = Some(TrainedModel {
            params,
            scaler_mean,
            scaler_std,
            threshold,
            window: self.window,
            hidden: self.hidden,
        });

        Ok(TrainingReport {
            windows: windows.len(),
            final_loss,
            threshold,
        })
    }

    /// 学習済みモデルを保存（重み＋スケーラ＋しきい値）
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let model = self.model.as_ref().ok_or(Error::ModelNotTrained)?;
        let json = serde_json::to_string(model)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// 保存済みモデルを読み込む
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let json = std::fs::read_to_string(path)?;
        let model: TrainedModel = serde_json::from_str(&json)?;
        self.window = model.window;
        self.hidden = model.hidden;
        self.model = Some(model);
        Ok(())
    }
}

impl Detector for LstmDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Lstm
    }

    fn min_points(&self) -> usize {
        self.window
    }

    fn detect(&self, series: &MetricSeries) -> Result<Vec<Anomaly>> {
        let model = self.model.as_ref().ok_or(Error::ModelNotTrained)?;

        let points: Vec<_> = series.valid_points().collect();
        if points.len() < model.window {
            return Err(Error::insufficient(model.window, points.len()));
        }

        let scaled: Vec<f64> = points
            .iter()
            .map(|p| (p.value - model.scaler_mean) / model.scaler_std)
            .collect();

        let mut anomalies = Vec::new();
        for start in 0..=scaled.len() - model.window {
            let window = &scaled[start..start + model.window];
            let error = model.params.reconstruction_error(window);
            if error <= model.threshold {
                continue;
            }

            // ウィンドウ終端の観測点に帰属させる
            let end_point = points[start + model.window - 1];
            let confidence = (error / (2.0 * model.threshold)).min(1.0);
            let anomaly = Anomaly::new(
                end_point.timestamp,
                series.metric.clone(),
                MetricValue::Scalar(end_point.value),
                error,
                DetectionMethod::Lstm,
                model.threshold,
                confidence,
            )
            .with_context("window", json!(model.window))
            .with_context("reconstruction_error", json!(error))
            .with_context("window_start", json!(points[start].timestamp.to_rfc3339()));
            anomalies.push(anomaly);
        }
        Ok(anomalies)
    }
}
