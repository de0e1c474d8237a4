use ndarray::Array2;

use super::sequence::interp_linear;
use super::{TactileInterpolator, TactileSequence, MATRIX_HEIGHT, MATRIX_WIDTH};
use crate::utility::Utility;

/// 参考值的采样时长（秒）和步长
const REFERENCE_DURATION: f64 = 3.0;
const REFERENCE_STEP: f64 = 0.1;
/// 参考值取采样的百分位
const REFERENCE_PERCENTILE: f64 = 99.0;

/// 逐单元线性插值的触觉读数。
///
/// 归一化为 `(|v| - ref) / (hi - ref)`，负值截为 0；
/// `ref` 是序列开头（和结尾）静止段读数的 99 百分位，`hi` 是全序列最大幅值。
#[derive(Debug, Clone)]
pub struct LinearTactileInterpolator {
    times: Vec<f64>,
    /// [行][列] -> 各帧读数
    inphase: Vec<Vec<f64>>,
    quadrature: Vec<Vec<f64>>,
    hi: f64,
    reference: Array2<f64>,
}

impl LinearTactileInterpolator {
    pub fn new(sequence: &TactileSequence, start: f64, end: Option<f64>) -> Self {
        let column = |data: &ndarray::Array3<f64>, r: usize, c: usize| -> Vec<f64> {
            (0..sequence.len()).map(|i| data[[i, r, c]]).collect()
        };
        let mut inphase = Vec::with_capacity(MATRIX_HEIGHT * MATRIX_WIDTH);
        let mut quadrature = Vec::with_capacity(MATRIX_HEIGHT * MATRIX_WIDTH);
        for r in 0..MATRIX_HEIGHT {
            for c in 0..MATRIX_WIDTH {
                inphase.push(column(&sequence.inphase, r, c));
                quadrature.push(column(&sequence.quadrature, r, c));
            }
        }
        let hi = sequence
            .inphase
            .iter()
            .zip(sequence.quadrature.iter())
            .map(|(a, b)| a.hypot(*b))
            .filter(|v| !v.is_nan())
            .fold(0.0, f64::max);

        let mut interpolator = Self {
            times: sequence.times.clone(),
            inphase,
            quadrature,
            hi,
            reference: Array2::zeros((MATRIX_HEIGHT, MATRIX_WIDTH)),
        };

        let steps = (REFERENCE_DURATION / REFERENCE_STEP).round() as usize;
        let mut samples = Vec::new();
        for i in 0..steps {
            let dt = i as f64 * REFERENCE_STEP;
            samples.push(interpolator.interpolate_raw(start + dt));
            if let Some(end) = end {
                samples.push(interpolator.interpolate_raw(end - dt));
            }
        }
        interpolator.reference = Array2::from_shape_fn((MATRIX_HEIGHT, MATRIX_WIDTH), |(r, c)| {
            let values: Vec<f64> = samples.iter().map(|m| m[[r, c]]).collect();
            Utility::percentile(&values, REFERENCE_PERCENTILE).unwrap_or_default()
        });
        interpolator
    }

    pub fn hi(&self) -> f64 {
        self.hi
    }

    pub fn reference(&self) -> &Array2<f64> {
        &self.reference
    }

    /// 未归一化的幅值，超过序列末尾时取末帧
    pub fn interpolate_raw(&self, time: f64) -> Array2<f64> {
        let time = match self.times.last() {
            Some(&last) if time > last => last,
            _ => time,
        };
        Array2::from_shape_fn((MATRIX_HEIGHT, MATRIX_WIDTH), |(r, c)| {
            let i = r * MATRIX_WIDTH + c;
            let a = interp_linear(&self.times, &self.inphase[i], time);
            let b = interp_linear(&self.times, &self.quadrature[i], time);
            a.hypot(b)
        })
    }
}

impl TactileInterpolator for LinearTactileInterpolator {
    fn interpolate(&self, time: f64) -> Array2<f64> {
        let raw = self.interpolate_raw(time);
        let mut out = Array2::zeros(raw.raw_dim());
        for ((r, c), v) in raw.indexed_iter() {
            let reference = self.reference[[r, c]];
            let range = self.hi - reference;
            if range > 0.0 {
                out[[r, c]] = ((v - reference) / range).max(0.0);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array3;

    /// 前 3 秒静止（幅值 1），之后 (0, 0) 单元升到 5
    fn sequence() -> TactileSequence {
        let times: Vec<f64> = (0..=50).map(|i| i as f64 * 0.1).collect();
        let n = times.len();
        let mut inphase = Array3::from_elem((n, MATRIX_HEIGHT, MATRIX_WIDTH), 1.0);
        for (i, &t) in times.iter().enumerate() {
            if t > 3.45 {
                inphase[[i, 0, 0]] = 5.0;
            }
        }
        TactileSequence::new(times, inphase, Array3::zeros((n, MATRIX_HEIGHT, MATRIX_WIDTH)))
    }

    #[test]
    fn normalization_uses_rest_reference() {
        let interp = LinearTactileInterpolator::new(&sequence(), 0.0, None);
        assert_relative_eq!(interp.hi(), 5.0);
        assert_relative_eq!(interp.reference()[[0, 0]], 1.0);

        let rest = interp.interpolate(1.0);
        assert!(rest.iter().all(|&v| v == 0.0));
        let pressed = interp.interpolate(4.0);
        assert_relative_eq!(pressed[[0, 0]], 1.0);
        assert_eq!(pressed[[1, 1]], 0.0);
    }

    #[test]
    fn raw_values_clamp_past_end() {
        let interp = LinearTactileInterpolator::new(&sequence(), 0.0, None);
        assert_relative_eq!(interp.interpolate_raw(100.0)[[0, 0]], 5.0);
        assert_relative_eq!(interp.interpolate_raw(3.45)[[0, 0]], 3.0, epsilon = 1e-9);
    }

    #[test]
    fn magnitude_combines_both_components() {
        let times = vec![0.0, 1.0];
        let inphase = Array3::from_elem((2, MATRIX_HEIGHT, MATRIX_WIDTH), 3.0);
        let quadrature = Array3::from_elem((2, MATRIX_HEIGHT, MATRIX_WIDTH), 4.0);
        let interp = LinearTactileInterpolator::new(&TactileSequence::new(times, inphase, quadrature), 0.0, None);
        assert_relative_eq!(interp.interpolate_raw(0.5)[[2, 3]], 5.0);
    }
}
