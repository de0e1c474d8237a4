//! 触觉信号
//!
//! 手套阻抗矩阵的读取、补全平滑、按时间插值和归一化，以及传感单元在手套上的排布。
//! 轨迹优化只通过 [`TactileInterpolator`] 和 [`TactileLayout`] 使用这里的数据。

mod interpolator;
mod layout;
mod sequence;

pub use interpolator::LinearTactileInterpolator;
pub use layout::{Cell, TactileLayout};
pub use sequence::{kaiser_window, TactileSequence};

use ndarray::Array2;

/// 阻抗矩阵尺寸
pub const MATRIX_WIDTH: usize = 16;
pub const MATRIX_HEIGHT: usize = 16;

pub trait TactileInterpolator {
    /// 时刻 `time` 的归一化传感矩阵，形状 (行, 列)
    fn interpolate(&self, time: f64) -> Array2<f64>;
}
