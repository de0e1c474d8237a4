use std::path::Path;

use anyhow::Context;
use ndarray::{s, Array1, Array3, ArrayView1};

use super::{MATRIX_HEIGHT, MATRIX_WIDTH};

/// 平滑窗口长度
const WINDOW_LENGTH: usize = 25;
/// Kaiser 窗形状参数
const WINDOW_BETA: f64 = 3.0;

/// 触觉阻抗矩阵序列，无效采样为 NaN。
///
/// 复数读数拆成同相、正交两个分量存放，形状均为 (帧, 行, 列)。
#[derive(Debug, Clone, PartialEq)]
pub struct TactileSequence {
    pub times: Vec<f64>,
    pub inphase: Array3<f64>,
    pub quadrature: Array3<f64>,
}

fn parse_field(field: &str) -> anyhow::Result<f64> {
    let field = field.trim();
    if field.is_empty() {
        return Ok(f64::NAN);
    }
    field
        .parse::<f64>()
        .with_context(|| format!("invalid tactile value {:?}", field))
}

impl TactileSequence {
    pub fn new(times: Vec<f64>, inphase: Array3<f64>, quadrature: Array3<f64>) -> Self {
        Self {
            times,
            inphase,
            quadrature,
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// 读 CSV：首行为表头，每行 `time`、按行优先的 256 个同相分量、256 个正交分量。
    /// 空字段或 `nan` 视为无效采样。
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let cells = MATRIX_WIDTH * MATRIX_HEIGHT;
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mut times = Vec::new();
        let mut inphase = Vec::new();
        let mut quadrature = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("failed to read {}", path.display()))?;
            anyhow::ensure!(
                record.len() == 1 + 2 * cells,
                "{}: row {} has {} columns, expected {}",
                path.display(),
                line + 1,
                record.len(),
                1 + 2 * cells
            );
            times.push(parse_field(&record[0])?);
            for i in 0..cells {
                inphase.push(parse_field(&record[1 + i])?);
                quadrature.push(parse_field(&record[1 + cells + i])?);
            }
        }
        let shape = (times.len(), MATRIX_HEIGHT, MATRIX_WIDTH);
        let sequence = Self::new(
            times,
            Array3::from_shape_vec(shape, inphase)?,
            Array3::from_shape_vec(shape, quadrature)?,
        );
        log::info!("loaded {} tactile frames from {}", sequence.len(), path.display());
        Ok(sequence)
    }

    /// 逐单元补全无效采样（线性插值，两端外推），再用 Kaiser 窗平滑
    pub fn process(&mut self) -> &mut Self {
        log::info!("tactile interpolate");
        for series in [&mut self.inphase, &mut self.quadrature] {
            for r in 0..MATRIX_HEIGHT {
                for c in 0..MATRIX_WIDTH {
                    let filled = fill_invalid(&self.times, series.slice(s![.., r, c]));
                    series.slice_mut(s![.., r, c]).assign(&filled);
                }
            }
        }

        log::info!("tactile filter");
        let window = kaiser_window(WINDOW_LENGTH, WINDOW_BETA);
        for series in [&mut self.inphase, &mut self.quadrature] {
            for r in 0..MATRIX_HEIGHT {
                for c in 0..MATRIX_WIDTH {
                    let smoothed = smooth(series.slice(s![.., r, c]), &window);
                    series.slice_mut(s![.., r, c]).assign(&smoothed);
                }
            }
        }
        self
    }
}

/// 在 (xs, ys) 的折线上取 x 处的值，超出范围时沿首尾线段外推
pub fn interp_linear(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    match xs.len() {
        0 => f64::NAN,
        1 => ys[0],
        n => {
            let i = xs.partition_point(|&v| v <= x).clamp(1, n - 1);
            let (x0, x1, y0, y1) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
            if x1 == x0 {
                y1
            } else {
                y0 + (y1 - y0) * (x - x0) / (x1 - x0)
            }
        }
    }
}

fn fill_invalid(times: &[f64], values: ArrayView1<f64>) -> Array1<f64> {
    let (xs, ys): (Vec<f64>, Vec<f64>) = times
        .iter()
        .zip(values.iter())
        .filter(|(_, v)| !v.is_nan())
        .map(|(&t, &v)| (t, v))
        .unzip();
    if xs.len() == times.len() {
        return values.to_owned();
    }
    times.iter().map(|&t| interp_linear(&xs, &ys, t)).collect()
}

/// 零阶修正贝塞尔函数 I0，级数展开
fn bessel_i0(x: f64) -> f64 {
    let half = x / 2.0;
    let mut term = 1.0;
    let mut sum = 1.0;
    for k in 1..50 {
        term *= (half / k as f64).powi(2);
        sum += term;
        if term < sum * 1e-17 {
            break;
        }
    }
    sum
}

/// 归一化到和为 1 的 Kaiser 窗
pub fn kaiser_window(length: usize, beta: f64) -> Vec<f64> {
    if length == 1 {
        return vec![1.0];
    }
    let denom = bessel_i0(beta);
    let m = (length - 1) as f64;
    let window: Vec<f64> = (0..length)
        .map(|n| {
            let r = 2.0 * n as f64 / m - 1.0;
            bessel_i0(beta * (1.0 - r * r).max(0.0).sqrt()) / denom
        })
        .collect();
    let total: f64 = window.iter().sum();
    window.into_iter().map(|w| w / total).collect()
}

/// 以首尾值延拓边界后做居中卷积
fn smooth(values: ArrayView1<f64>, window: &[f64]) -> Array1<f64> {
    let n = values.len() as isize;
    if n == 0 {
        return values.to_owned();
    }
    let half = (window.len() / 2) as isize;
    (0..n)
        .map(|i| {
            window
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let j = (i + k as isize - half).clamp(0, n - 1);
                    w * values[j as usize]
                })
                .sum()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    #[test]
    fn kaiser_window_is_symmetric_and_normalized() {
        let w = kaiser_window(WINDOW_LENGTH, WINDOW_BETA);
        assert_eq!(w.len(), 25);
        assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        for i in 0..w.len() {
            assert_relative_eq!(w[i], w[w.len() - 1 - i], epsilon = 1e-15);
        }
        assert!(w[12] > w[0]);
        // numpy.kaiser(25, 3) 端点为 1 / I0(3)
        assert_relative_eq!(w[0] / w[12], 1.0 / bessel_i0(3.0), epsilon = 1e-12);
        assert_relative_eq!(bessel_i0(3.0), 4.880792585865024, epsilon = 1e-12);
    }

    #[test]
    fn interpolation_extrapolates_ends() {
        let xs = [0.0, 1.0, 2.0];
        let ys = [0.0, 2.0, 3.0];
        assert_relative_eq!(interp_linear(&xs, &ys, 0.5), 1.0);
        assert_relative_eq!(interp_linear(&xs, &ys, 3.0), 4.0);
        assert_relative_eq!(interp_linear(&xs, &ys, -1.0), -2.0);
        assert_relative_eq!(interp_linear(&[1.0], &[5.0], 7.0), 5.0);
    }

    #[test]
    fn process_fills_gaps_and_keeps_constants() {
        let n = 40;
        let times: Vec<f64> = (0..n).map(|i| i as f64 * 0.01).collect();
        let mut inphase = Array3::from_elem((n, MATRIX_HEIGHT, MATRIX_WIDTH), 2.0);
        let quadrature = Array3::zeros((n, MATRIX_HEIGHT, MATRIX_WIDTH));
        inphase[[5, 3, 4]] = f64::NAN;
        inphase[[0, 0, 0]] = f64::NAN;
        let mut sequence = TactileSequence::new(times, inphase, quadrature);
        sequence.process();
        assert!(sequence.inphase.iter().all(|v| v.is_finite()));
        for v in sequence.inphase.iter() {
            assert_relative_eq!(*v, 2.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn load_reads_rows_and_invalid_fields() {
        let cells = MATRIX_WIDTH * MATRIX_HEIGHT;
        let path = std::env::temp_dir().join(format!("glovewise-tactile-{}.csv", std::process::id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            let header: Vec<String> = std::iter::once("time".to_string())
                .chain((0..2 * cells).map(|i| format!("c{}", i)))
                .collect();
            writeln!(file, "{}", header.join(",")).unwrap();
            for t in 0..3 {
                let mut row = vec![format!("{}", t as f64 * 0.5)];
                row.extend((0..cells).map(|i| if t == 1 && i == 0 { String::new() } else { format!("{}", i) }));
                row.extend((0..cells).map(|_| "0.5".to_string()));
                writeln!(file, "{}", row.join(",")).unwrap();
            }
        }
        let sequence = TactileSequence::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(sequence.times, vec![0.0, 0.5, 1.0]);
        assert!(sequence.inphase[[1, 0, 0]].is_nan());
        assert_eq!(sequence.inphase[[2, 1, 3]], (MATRIX_WIDTH + 3) as f64);
        assert_eq!(sequence.quadrature[[0, 15, 15]], 0.5);
    }
}
