//! 稀疏非线性最小二乘
//!
//! 使用方式：
//! 1. 在 [`Program`] 中声明变量块和目标（残差函数 + 依赖的标量下标）。
//! 2. [`SparseLeastSquaresSolver::compile`] 之后，每次迭代 `gather -> step -> scatter`。
//!
//! 雅可比由每个目标在其稀疏支撑上做中心差分得到，步长由阻尼高斯牛顿给出：
//! (JᵀJ + λI)δ = −Jᵀr。

mod linear;

pub use linear::{
    ConjugateGradient, DenseCholesky, JacobianBlock, LinearSolver, LinearSolverKind,
    NormalEquations,
};

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Range;
use std::time::Instant;

use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{Error, Result};

/// 中心差分步长
const DIFFERENCE_STEP: f64 = 1e-6;

pub type ResidualFn<'a> = Box<dyn Fn(&[f64], &mut [f64]) + Send + Sync + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableBlock<K> {
    pub key: K,
    pub offset: usize,
    pub dim: usize,
}

impl<K> VariableBlock<K> {
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.dim
    }
}

pub struct Goal<'a> {
    /// 残差依赖的参数下标，已排序去重
    pub support: Vec<usize>,
    pub dim: usize,
    residual: ResidualFn<'a>,
}

impl<'a> Goal<'a> {
    #[inline]
    pub fn evaluate(&self, x: &[f64], out: &mut [f64]) {
        (self.residual)(x, out)
    }
}

/// 优化问题：变量 + 目标
pub struct Program<'a, K> {
    variables: Vec<VariableBlock<K>>,
    index: HashMap<K, usize>,
    goals: Vec<Goal<'a>>,
    size: usize,
}

impl<'a, K> Default for Program<'a, K> {
    fn default() -> Self {
        Self {
            variables: Vec::new(),
            index: HashMap::new(),
            goals: Vec::new(),
            size: 0,
        }
    }
}

impl<'a, K> Program<'a, K>
where
    K: Clone + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明一个 `dim` 维变量，返回其在参数向量中的区间
    pub fn declare_variable(&mut self, key: K, dim: usize) -> Result<Range<usize>> {
        if self.index.contains_key(&key) {
            return Err(Error::DuplicateVariable(format!("{:?}", key)));
        }
        let block = VariableBlock {
            key: key.clone(),
            offset: self.size,
            dim,
        };
        let range = block.range();
        self.size += dim;
        self.index.insert(key, self.variables.len());
        self.variables.push(block);
        Ok(range)
    }

    pub fn variable(&self, key: &K) -> Option<Range<usize>> {
        self.index.get(key).map(|&i| self.variables[i].range())
    }

    pub fn variables(&self) -> &[VariableBlock<K>] {
        &self.variables
    }

    /// 声明一个目标，`residual(x, out)` 从完整参数向量 x 计算 `dim` 个残差，且只依赖 `support`
    pub fn declare_goal<F>(&mut self, mut support: Vec<usize>, dim: usize, residual: F)
    where
        F: Fn(&[f64], &mut [f64]) + Send + Sync + 'a,
    {
        support.sort_unstable();
        support.dedup();
        self.goals.push(Goal {
            support,
            dim,
            residual: Box::new(residual),
        });
    }

    pub fn goals(&self) -> &[Goal<'a>] {
        &self.goals
    }

    pub fn variable_count(&self) -> usize {
        self.size
    }

    pub fn residual_count(&self) -> usize {
        self.goals.iter().map(|g| g.dim).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    /// 步长小于该值时 `solve` 提前结束；0 表示跑满迭代次数
    pub tolerance: f64,
    /// `solve` 的总时长上限（秒），不大于 0 表示不限
    pub timeout: f64,
    pub max_iterations: usize,
    /// Tikhonov 正则 λ
    pub regularization: f64,
    pub step_scaling: f64,
    pub linear_solver: LinearSolverKind,
    pub multi_threading: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance: 0.0,
            timeout: crate::config::SOLVER_TIMEOUT,
            max_iterations: crate::config::IK_MAX_ITERATIONS,
            regularization: crate::config::SOLVER_REGULARIZATION,
            step_scaling: 1.0,
            linear_solver: LinearSolverKind::DenseCholesky,
            multi_threading: false,
        }
    }
}

pub struct SparseLeastSquaresSolver<'a, K> {
    program: Program<'a, K>,
    options: SolverOptions,
    linear_solver: Box<dyn LinearSolver + Send + Sync>,
    x: Vec<f64>,
    loss: f64,
}

impl<'a, K> SparseLeastSquaresSolver<'a, K>
where
    K: Clone + Eq + Hash + Debug,
{
    pub fn compile(program: Program<'a, K>, options: SolverOptions) -> Self {
        log::debug!(
            "compiled program: {} variables, {} goals, {} residuals",
            program.variable_count(),
            program.goals.len(),
            program.residual_count()
        );
        Self {
            x: vec![0.0; program.variable_count()],
            linear_solver: options.linear_solver.solver(),
            program,
            options,
            loss: 0.0,
        }
    }

    pub fn program(&self) -> &Program<'a, K> {
        &self.program
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn parameters(&self) -> &[f64] {
        &self.x
    }

    /// 上一次 `step` 时（更新前）的残差平方和
    pub fn loss(&self) -> f64 {
        self.loss
    }

    /// 从外部状态读入变量
    pub fn gather<R>(&mut self, mut read: R)
    where
        R: FnMut(&K, &mut [f64]),
    {
        for block in &self.program.variables {
            read(&block.key, &mut self.x[block.range()]);
        }
    }

    /// 把变量写回外部状态
    pub fn scatter<W>(&self, mut write: W)
    where
        W: FnMut(&K, &[f64]),
    {
        for block in &self.program.variables {
            write(&block.key, &self.x[block.range()]);
        }
    }

    /// 当前参数下的残差平方和
    pub fn evaluate_loss(&self) -> f64 {
        let mut out = Vec::new();
        self.program
            .goals
            .iter()
            .map(|goal| {
                out.clear();
                out.resize(goal.dim, 0.0);
                goal.evaluate(&self.x, &mut out);
                out.iter().map(|r| r * r).sum::<f64>()
            })
            .sum()
    }

    /// 单个目标的残差和雅可比块
    fn linearize_goal(goal: &Goal, scratch: &mut [f64]) -> (Vec<f64>, JacobianBlock) {
        let mut residual = vec![0.0; goal.dim];
        goal.evaluate(scratch, &mut residual);

        let cols = goal.support.len();
        let mut values = vec![0.0; goal.dim * cols];
        let mut plus = vec![0.0; goal.dim];
        let mut minus = vec![0.0; goal.dim];
        for (c, &index) in goal.support.iter().enumerate() {
            let original = scratch[index];
            let h = DIFFERENCE_STEP * original.abs().max(1.0);
            scratch[index] = original + h;
            goal.evaluate(scratch, &mut plus);
            scratch[index] = original - h;
            goal.evaluate(scratch, &mut minus);
            scratch[index] = original;
            for r in 0..goal.dim {
                values[r * cols + c] = (plus[r] - minus[r]) / (2.0 * h);
            }
        }
        (
            residual,
            JacobianBlock {
                columns: goal.support.clone(),
                rows: goal.dim,
                values,
            },
        )
    }

    fn linearize(&self) -> Vec<(Vec<f64>, JacobianBlock)> {
        let x = &self.x;
        if self.options.multi_threading {
            self.program
                .goals
                .par_iter()
                .map_init(|| x.clone(), |scratch, goal| Self::linearize_goal(goal, scratch))
                .collect()
        } else {
            let mut scratch = x.clone();
            self.program
                .goals
                .iter()
                .map(|goal| Self::linearize_goal(goal, &mut scratch))
                .collect()
        }
    }

    /// 一次阻尼高斯牛顿迭代，返回步长 |δ|
    pub fn step(&mut self) -> Result<f64> {
        let n = self.x.len();
        if n == 0 {
            self.loss = self.evaluate_loss();
            return Ok(0.0);
        }
        let linearized = self.linearize();

        let mut gradient = DVector::<f64>::zeros(n);
        let mut loss = 0.0;
        let mut blocks = Vec::with_capacity(linearized.len());
        for (residual, block) in linearized {
            loss += residual.iter().map(|r| r * r).sum::<f64>();
            for (c, &col) in block.columns.iter().enumerate() {
                gradient[col] += (0..block.rows)
                    .map(|r| block.values[r * block.columns.len() + c] * residual[r])
                    .sum::<f64>();
            }
            blocks.push(block);
        }
        self.loss = loss;

        let system = NormalEquations {
            size: n,
            blocks: &blocks,
            damping: self.options.regularization,
        };
        let delta = self.linear_solver.solve(&system, &(-gradient))? * self.options.step_scaling;
        for (x, d) in self.x.iter_mut().zip(delta.iter()) {
            *x += d;
        }
        Ok(delta.norm())
    }

    /// gather → 迭代到上限（或步长小于 tolerance / 超时）→ scatter，返回最终损失
    pub fn solve<R, W>(&mut self, read: R, write: W) -> Result<f64>
    where
        R: FnMut(&K, &mut [f64]),
        W: FnMut(&K, &[f64]),
    {
        self.gather(read);
        let start = Instant::now();
        for i in 0..self.options.max_iterations {
            let step = self.step()?;
            log::debug!("solver step {} size {:.3e} loss {:.6e}", i, step, self.loss);
            if step < self.options.tolerance {
                break;
            }
            if self.options.timeout > 0.0 && start.elapsed().as_secs_f64() > self.options.timeout {
                log::warn!("solver timeout after {} iterations", i + 1);
                break;
            }
        }
        self.scatter(write);
        Ok(self.evaluate_loss())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Key {
        A,
        B,
    }

    #[test]
    fn duplicate_variables_are_rejected() {
        let mut program: Program<Key> = Program::new();
        assert_eq!(program.declare_variable(Key::A, 2).unwrap(), 0..2);
        assert_eq!(program.declare_variable(Key::B, 3).unwrap(), 2..5);
        assert!(matches!(program.declare_variable(Key::A, 1), Err(Error::DuplicateVariable(_))));
        assert_eq!(program.variable(&Key::B), Some(2..5));
    }

    /// Rosenbrock 的最小二乘形式
    fn rosenbrock(options: SolverOptions) -> (Vec<f64>, f64) {
        let mut program: Program<Key> = Program::new();
        let a = program.declare_variable(Key::A, 2).unwrap();
        let (i, j) = (a.start, a.start + 1);
        program.declare_goal(vec![i], 1, move |x, out| out[0] = 1.0 - x[i]);
        program.declare_goal(vec![i, j], 1, move |x, out| out[0] = 10.0 * (x[j] - x[i] * x[i]));

        let mut solver = SparseLeastSquaresSolver::compile(program, options);
        let initial = [-1.2, 1.0];
        let mut state = Vec::new();
        let loss = solver
            .solve(
                |_, dst| dst.copy_from_slice(&initial),
                |_, src| state = src.to_vec(),
            )
            .unwrap();
        (state, loss)
    }

    #[test]
    fn gauss_newton_finds_minimum() {
        let options = SolverOptions {
            max_iterations: 100,
            regularization: 1e-9,
            ..Default::default()
        };
        let (state, loss) = rosenbrock(options);
        assert_relative_eq!(state[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(state[1], 1.0, epsilon = 1e-6);
        assert!(loss < 1e-12);
    }

    #[test]
    fn conjugate_gradient_and_threads_agree() {
        let options = SolverOptions {
            max_iterations: 100,
            regularization: 1e-9,
            linear_solver: LinearSolverKind::ConjugateGradient,
            multi_threading: true,
            ..Default::default()
        };
        let (state, _) = rosenbrock(options);
        assert_relative_eq!(state[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(state[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn zero_tolerance_runs_every_iteration() {
        let mut program: Program<Key> = Program::new();
        let a = program.declare_variable(Key::A, 1).unwrap().start;
        program.declare_goal(vec![a], 1, move |x, out| out[0] = x[a] - 3.0);
        let mut solver = SparseLeastSquaresSolver::compile(
            program,
            SolverOptions {
                max_iterations: 7,
                ..Default::default()
            },
        );
        let mut value = 0.0;
        let mut gathers = 0;
        solver.gather(|_, dst| {
            gathers += 1;
            dst[0] = value;
        });
        let mut steps = 0;
        for _ in 0..solver.options().max_iterations {
            solver.step().unwrap();
            steps += 1;
        }
        solver.scatter(|_, src| value = src[0]);
        assert_eq!(gathers, 1);
        assert_eq!(steps, 7);
        // 每步收缩 λ/(1+λ)
        assert_relative_eq!(value, 3.0, epsilon = 1e-6);
    }
}
