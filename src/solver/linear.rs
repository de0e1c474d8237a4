//! 阻尼正规方程 (JᵀJ + λI)δ = b 的线性求解

use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};

/// 共轭梯度的最大迭代次数
const CG_MAX_ITERATIONS: usize = 500;
/// 共轭梯度的相对收敛阈值
const CG_TOLERANCE: f64 = 1e-10;

/// 一个目标的雅可比块，行优先存放 rows × columns.len()
#[derive(Debug, Clone, Default)]
pub struct JacobianBlock {
    pub columns: Vec<usize>,
    pub rows: usize,
    pub values: Vec<f64>,
}

impl JacobianBlock {
    #[inline]
    fn get(&self, row: usize, col: usize) -> f64 {
        self.values[row * self.columns.len() + col]
    }
}

/// 稀疏雅可比 + Tikhonov 阻尼，JᵀJ 不显式组装
pub struct NormalEquations<'a> {
    pub size: usize,
    pub blocks: &'a [JacobianBlock],
    pub damping: f64,
}

impl<'a> NormalEquations<'a> {
    /// (JᵀJ + λI) v
    pub fn apply(&self, v: &DVector<f64>) -> DVector<f64> {
        let mut out = v * self.damping;
        let mut jv = Vec::new();
        for block in self.blocks {
            jv.clear();
            jv.resize(block.rows, 0.0);
            for (r, value) in jv.iter_mut().enumerate() {
                *value = block
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(c, &col)| block.get(r, c) * v[col])
                    .sum();
            }
            for (c, &col) in block.columns.iter().enumerate() {
                out[col] += (0..block.rows).map(|r| block.get(r, c) * jv[r]).sum::<f64>();
            }
        }
        out
    }

    pub fn diagonal(&self) -> DVector<f64> {
        let mut diag = DVector::from_element(self.size, self.damping);
        for block in self.blocks {
            for (c, &col) in block.columns.iter().enumerate() {
                diag[col] += (0..block.rows).map(|r| block.get(r, c).powi(2)).sum::<f64>();
            }
        }
        diag
    }

    pub fn dense(&self) -> DMatrix<f64> {
        let mut h = DMatrix::identity(self.size, self.size) * self.damping;
        for block in self.blocks {
            for (a, &ca) in block.columns.iter().enumerate() {
                for (b, &cb) in block.columns.iter().enumerate() {
                    h[(ca, cb)] += (0..block.rows)
                        .map(|r| block.get(r, a) * block.get(r, b))
                        .sum::<f64>();
                }
            }
        }
        h
    }
}

pub trait LinearSolver {
    fn solve(&self, system: &NormalEquations, rhs: &DVector<f64>) -> Result<DVector<f64>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinearSolverKind {
    /// 小规模问题（单帧 IK）
    #[default]
    DenseCholesky,
    /// 大规模稀疏问题（整条轨迹）
    ConjugateGradient,
}

impl LinearSolverKind {
    pub fn solver(&self) -> Box<dyn LinearSolver + Send + Sync> {
        match self {
            LinearSolverKind::DenseCholesky => Box::new(DenseCholesky),
            LinearSolverKind::ConjugateGradient => Box::new(ConjugateGradient::default()),
        }
    }
}

pub struct DenseCholesky;

impl LinearSolver for DenseCholesky {
    fn solve(&self, system: &NormalEquations, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        let chol = system
            .dense()
            .cholesky()
            .ok_or_else(|| Error::NumericalFailure("normal matrix is not positive definite".to_string()))?;
        Ok(chol.solve(rhs))
    }
}

/// Jacobi 预条件共轭梯度
pub struct ConjugateGradient {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self {
            max_iterations: CG_MAX_ITERATIONS,
            tolerance: CG_TOLERANCE,
        }
    }
}

impl LinearSolver for ConjugateGradient {
    fn solve(&self, system: &NormalEquations, rhs: &DVector<f64>) -> Result<DVector<f64>> {
        let n = rhs.len();
        let inv_diag = system.diagonal().map(|d| if d > 0.0 { 1.0 / d } else { 1.0 });

        let mut x = DVector::zeros(n);
        let mut r = rhs.clone();
        let b_norm = rhs.norm();
        if b_norm == 0.0 {
            return Ok(x);
        }
        let mut z = r.component_mul(&inv_diag);
        let mut p = z.clone();
        let mut rz = r.dot(&z);

        for _ in 0..self.max_iterations {
            let ap = system.apply(&p);
            let p_ap = p.dot(&ap);
            if p_ap.abs() < 1e-300 {
                break;
            }
            let alpha = rz / p_ap;
            x.axpy(alpha, &p, 1.0);
            r.axpy(-alpha, &ap, 1.0);
            if r.norm() <= self.tolerance * b_norm {
                break;
            }
            z = r.component_mul(&inv_diag);
            let rz_new = r.dot(&z);
            let beta = rz_new / rz;
            rz = rz_new;
            p = &z + &p * beta;
        }
        if x.iter().all(|v| v.is_finite()) {
            Ok(x)
        } else {
            Err(Error::NumericalFailure("conjugate gradient diverged".to_string()))
        }
    }
}
