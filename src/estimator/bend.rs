use nalgebra::DMatrix;

use crate::error::{Error, Result};

/// 触觉弯曲特征：本体感知单元读数经 PCA 降维后整体标准化，形状 (帧, 分量)
#[derive(Debug, Clone, PartialEq)]
pub struct BendFeatures {
    data: DMatrix<f64>,
}

impl BendFeatures {
    /// `readings` 每行一帧。分量数不超过帧数和单元数。
    pub fn new(readings: &DMatrix<f64>, components: usize) -> Result<Self> {
        let mut data = principal_components(readings, components)?;
        if data.is_empty() {
            return Ok(Self { data });
        }
        // 所有元素共用一个均值和标准差
        let mean = data.mean();
        data.add_scalar_mut(-mean);
        let std = (data.norm_squared() / data.len() as f64).sqrt();
        if std > 0.0 {
            data /= std;
        }
        Ok(Self { data })
    }

    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn frames(&self) -> usize {
        self.data.nrows()
    }

    pub fn components(&self) -> usize {
        self.data.ncols()
    }
}

/// 去中心后投影到方差最大的 `components` 个主方向上
fn principal_components(readings: &DMatrix<f64>, components: usize) -> Result<DMatrix<f64>> {
    let (rows, cols) = readings.shape();
    let components = components.min(rows).min(cols);
    if components == 0 {
        return Ok(DMatrix::zeros(rows, 0));
    }
    let mut centered = readings.clone();
    for mut column in centered.column_iter_mut() {
        let mean = column.mean();
        column.add_scalar_mut(-mean);
    }

    let svd = centered.clone().svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::NumericalFailure("pca: svd did not produce V^T".to_string()))?;
    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));

    let mut scores = DMatrix::zeros(rows, components);
    for (k, &i) in order.iter().take(components).enumerate() {
        let direction = v_t.row(i).transpose();
        scores.set_column(k, &(&centered * direction));
    }
    Ok(scores)
}
