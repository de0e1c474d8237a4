use ndarray::Array2;

use super::{MATRIX_HEIGHT, MATRIX_WIDTH};

/// 手套上各传感单元的排布。
///
/// 每格两个十六进制数字：第一个是矩阵列，第二个是矩阵行；`--` 表示没有传感单元。
const LAYOUT_TABLE: &str = "
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
-- -- a2 b2 c2 -- d2 e2 f2 -- a7 b7 c7 -- d7 e7 f7 -- -- --
-- -- a3 b3 c3 -- d4 e4 f4 -- a8 b8 c8 -- d8 e8 f8 -- -- --
-- -- a4 b4 c4 -- d3 e3 f3 -- a9 b9 c9 -- d9 e9 f9 -- -- --
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
-- -- b0 b1 c1 -- e0 e1 f1 -- b5 b6 c6 -- e5 e6 f6 -- -- --
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
-- -- a1 a0 c0 -- d1 d0 f0 -- a6 a5 c5 -- d6 d5 f5 -- -- --
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
-- -- -- -- -- -- 0c 0b 0a 0f -- -- -- -- 72 82 92 -- -- --
-- -- -- -- -- -- 1c 1b 1a 1f -- -- -- -- 71 81 91 -- -- --
-- -- -- -- -- -- 2c 2b 2a 2f -- -- -- -- 70 80 90 -- -- --
-- -- -- -- -- -- 3c 3b 3a 3f 3e 3d -- -- -- -- -- -- -- --
-- -- -- -- -- -- 4c 4b 4a 4f 4e 4d -- -- 84 83 93 -- -- --
-- -- -- -- -- -- 5c 5b 5a 5f 5e 5d -- -- -- -- -- -- -- --
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
-- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- -- --
";

/// 传感矩阵中的一个单元 (列, 行)
pub type Cell = (usize, usize);

#[derive(Debug, Clone, PartialEq)]
pub struct TactileLayout {
    /// 手套排布，每格对应一个矩阵单元或为空
    layout: Vec<Vec<Option<Cell>>>,
    /// 不属于任何有效传感区域的单元，按列优先
    proprioceptive_cells: Vec<Cell>,
}

impl Default for TactileLayout {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_cell(text: &str) -> Option<Cell> {
    let mut digits = text.chars().filter_map(|c| c.to_digit(16));
    let col = digits.next()? as usize;
    let row = digits.next()? as usize;
    Some((col, row))
}

impl TactileLayout {
    pub fn new() -> Self {
        let layout: Vec<Vec<Option<Cell>>> = LAYOUT_TABLE
            .trim()
            .lines()
            .map(|row| row.split_whitespace().map(parse_cell).collect())
            .collect();
        let active: Vec<Cell> = layout.iter().flatten().flatten().copied().collect();
        let proprioceptive_cells = (0..MATRIX_WIDTH)
            .flat_map(|col| (0..MATRIX_HEIGHT).map(move |row| (col, row)))
            .filter(|cell| !active.contains(cell))
            .collect();
        Self {
            layout,
            proprioceptive_cells,
        }
    }

    pub fn rows(&self) -> usize {
        self.layout.len()
    }

    pub fn cols(&self) -> usize {
        self.layout.first().map_or(0, |r| r.len())
    }

    pub fn active_cells(&self) -> impl Iterator<Item = Cell> + '_ {
        self.layout.iter().flatten().flatten().copied()
    }

    pub fn num_active_cells(&self) -> usize {
        self.active_cells().count()
    }

    pub fn proprioceptive_cells(&self) -> &[Cell] {
        &self.proprioceptive_cells
    }

    /// 有效单元的读数，按排布表的行优先顺序
    pub fn serialize_active_cells(&self, matrix: &Array2<f64>) -> Vec<f64> {
        self.active_cells().map(|(col, row)| matrix[[row, col]]).collect()
    }

    pub fn serialize_proprioceptive_cells(&self, matrix: &Array2<f64>) -> Vec<f64> {
        self.proprioceptive_cells
            .iter()
            .map(|&(col, row)| matrix[[row, col]])
            .collect()
    }

    /// `serialize_active_cells` 的逆：把读数放回排布表的位置，其余为 0
    pub fn deserialize_active_cells(&self, data: &[f64]) -> Array2<f64> {
        let mut out = Array2::zeros((self.rows(), self.cols()));
        let mut values = data.iter();
        for (r, row) in self.layout.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if cell.is_some() {
                    if let Some(&v) = values.next() {
                        out[[r, c]] = v;
                    }
                }
            }
        }
        out
    }

    /// 传感矩阵重排成手套排布
    pub fn map_matrix(&self, matrix: &Array2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros((self.rows(), self.cols()));
        for (r, row) in self.layout.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                if let Some((col, row)) = *cell {
                    out[[r, c]] = matrix[[row, col]];
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Array2<f64> {
        Array2::from_shape_fn((MATRIX_HEIGHT, MATRIX_WIDTH), |(r, c)| (r * MATRIX_WIDTH + c) as f64)
    }

    #[test]
    fn table_shape() {
        let layout = TactileLayout::new();
        assert_eq!(layout.rows(), 20);
        assert_eq!(layout.cols(), 20);
        assert_eq!(layout.num_active_cells(), 102);
        assert_eq!(
            layout.proprioceptive_cells().len(),
            MATRIX_WIDTH * MATRIX_HEIGHT - 102
        );
    }

    #[test]
    fn cells_are_column_then_row() {
        let layout = TactileLayout::new();
        // 第一个有效单元是 "a2"：第 10 列第 2 行
        assert_eq!(layout.active_cells().next(), Some((10, 2)));
        let m = ramp();
        assert_eq!(layout.serialize_active_cells(&m)[0], (2 * MATRIX_WIDTH + 10) as f64);
        assert_eq!(layout.map_matrix(&m)[[3, 2]], (2 * MATRIX_WIDTH + 10) as f64);
        // (0, 0) 不在排布表里
        assert_eq!(layout.proprioceptive_cells()[0], (0, 0));
    }

    #[test]
    fn active_cells_round_trip_through_layout() {
        let layout = TactileLayout::new();
        let m = ramp();
        let data = layout.serialize_active_cells(&m);
        assert_eq!(layout.deserialize_active_cells(&data), layout.map_matrix(&m));
    }
}
