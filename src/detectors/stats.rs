//! Statistical Helpers
//!
//! 検知器が共有する基礎統計量。順序統計量はstatrsに委譲する。

use statrs::statistics::{Data, OrderStatistics};

/// 平均値
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// 母標準偏差
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// 中央値
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    Data::new(values.to_vec()).median()
}

/// 中央絶対偏差（MAD）
pub fn mad(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations)
}

/// 第1・第3四分位数
pub fn quartiles(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mut data = Data::new(values.to_vec());
    (data.lower_quartile(), data.upper_quartile())
}

/// 分位点（tauは0.0-1.0）
pub fn quantile(values: &[f64], tau: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    Data::new(values.to_vec()).quantile(tau.clamp(0.0, 1.0))
}

/// 値の系列内パーセンタイル順位（0-100）
pub fn percentile_rank(values: &[f64], x: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let below = values.iter().filter(|&&v| v <= x).count();
    below as f64 / values.len() as f64 * 100.0
}

/// 最小二乗法による傾き。分散がない場合はNone
pub fn linear_slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, &y) in values.iter().enumerate() {
        let x_diff = i as f64 - x_mean;
        numerator += x_diff * (y - y_mean);
        denominator += x_diff * x_diff;
    }

    if denominator.abs() < f64::EPSILON {
        return None;
    }
    Some(numerator / denominator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_std() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&values) - 5.0).abs() < 1e-12);
        assert!((std_dev(&values) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_median_and_mad() {
        let values = [1.0, 1.0, 2.0, 2.0, 4.0, 6.0, 9.0];
        assert!((median(&values) - 2.0).abs() < 1e-12);
        // 偏差は [1, 1, 0, 0, 2, 4, 7] で中央値は1
        assert!((mad(&values) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_constant_series_has_zero_spread() {
        let values = [5.0; 20];
        assert_eq!(std_dev(&values), 0.0);
        assert_eq!(mad(&values), 0.0);
        let (q1, q3) = quartiles(&values);
        assert_eq!(q3 - q1, 0.0);
    }

    #[test]
    fn test_percentile_rank() {
        let values: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert!((percentile_rank(&values, 50.0) - 50.0).abs() < 1e-9);
        assert_eq!(percentile_rank(&values, 1000.0), 100.0);
    }

    #[test]
    fn test_linear_slope() {
        let increasing = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((linear_slope(&increasing).unwrap() - 1.0).abs() < 1e-12);

        let flat = [3.0, 3.0, 3.0];
        assert!((linear_slope(&flat).unwrap()).abs() < 1e-12);
        assert!(linear_slope(&[1.0]).is_none());
    }
}
