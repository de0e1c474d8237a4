use nalgebra::{Isometry3, Point3, Vector3};

use super::{free_joint_states, read_joint, write_joint, JointLayout, JointRegularization};
use crate::config::{MotionConfig, REST_FRACTION};
use crate::error::{Error, Result};
use crate::kinematics::{JointKind, JointStates, KinematicModel};
use crate::solver::{LinearSolverKind, Program, SolverOptions, SparseLeastSquaresSolver};
use crate::utility::Utility;

/// 手的单帧逆运动学
#[derive(Debug, Clone)]
pub struct HandIk {
    model: KinematicModel,
    end_effectors: Vec<usize>,
    offsets: Vec<Vector3<f64>>,
    weights: Vec<f64>,
    /// 静止姿态，构造时计算一次
    rest_states: JointStates,
    rest_positions: Vec<Point3<f64>>,
    iterations: usize,
    solver_regularization: f64,
    timeout: f64,
    regularization: JointRegularization,
}

impl HandIk {
    /// `offsets`、`weights` 缺省时分别为零偏移和单位权重
    pub fn new(
        model: KinematicModel,
        end_effectors: Vec<usize>,
        offsets: Option<Vec<Vector3<f64>>>,
        weights: Option<Vec<f64>>,
        config: &MotionConfig,
    ) -> Self {
        let count = end_effectors.len();
        let offsets = offsets.unwrap_or_else(|| vec![Vector3::zeros(); count]);
        let weights = weights.unwrap_or_else(|| vec![1.0; count]);
        let rest_states = Self::find_joint_rest_states(&model);
        let rest_positions = end_effectors
            .iter()
            .zip(offsets.iter())
            .map(|(&link, offset)| model.link_point(&rest_states, link, offset))
            .collect();
        Self {
            model,
            end_effectors,
            offsets,
            weights,
            rest_states,
            rest_positions,
            iterations: config.ik_iterations,
            solver_regularization: config.solver_regularization,
            timeout: config.timeout,
            regularization: JointRegularization {
                damping: config.joint_damping,
                limit_penalty: config.joint_limit_penalty,
            },
        }
    }

    /// 独立转动关节取 lower + 0.25 * (upper - lower)，再刷新 mimic 关节
    pub fn find_joint_rest_states(model: &KinematicModel) -> JointStates {
        let mut states = model.default_states();
        for (i, joint) in model.joints().iter().enumerate() {
            if let JointKind::Hinge {
                mimic: None,
                limits: Some(limits),
                ..
            } = joint.kind
            {
                states.set_position(i, limits.lower + REST_FRACTION * (limits.upper - limits.lower));
            }
        }
        model.update_mimic_joints(&mut states);
        states
    }

    pub fn model(&self) -> &KinematicModel {
        &self.model
    }

    pub fn end_effectors(&self) -> &[usize] {
        &self.end_effectors
    }

    pub fn offsets(&self) -> &[Vector3<f64>] {
        &self.offsets
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn rest_states(&self) -> &JointStates {
        &self.rest_states
    }

    pub fn rest_positions(&self) -> &[Point3<f64>] {
        &self.rest_positions
    }

    pub fn regularization(&self) -> JointRegularization {
        self.regularization
    }

    pub fn end_effector_positions(&self, states: &JointStates) -> Vec<Point3<f64>> {
        let links = self.model.forward_kinematics(states);
        self.end_effectors
            .iter()
            .zip(self.offsets.iter())
            .map(|(&link, offset)| links.link_pose(link) * Point3::from(*offset))
            .collect()
    }

    /// 把 `states` 的关节声明为变量，阻尼以静止姿态为参考
    pub fn free_joint_states<'a, K, F>(
        &self,
        program: &mut Program<'a, K>,
        states: &mut JointStates,
        free_floating: bool,
        key: F,
    ) -> Result<JointLayout>
    where
        K: Clone + Eq + std::hash::Hash + std::fmt::Debug,
        F: Fn(usize) -> K,
    {
        free_joint_states(
            program,
            &self.model,
            states,
            &self.rest_states,
            self.regularization,
            free_floating,
            key,
        )
    }

    /// 求解一帧。
    ///
    /// 目标点按末端执行器顺序给出。根位姿由静止姿态末端位置到目标的刚体配准初始化，
    /// `optimize` 为真时再在配准系里联合优化根的局部位姿和转动关节，
    /// 最终根位姿为配准位姿与局部位姿的复合。返回的关节状态是独立的副本。
    pub fn solve(&self, goal_positions: &[Point3<f64>], optimize: bool) -> Result<JointStates> {
        if goal_positions.len() != self.end_effectors.len() {
            return Err(Error::GoalCountMismatch {
                expected: self.end_effectors.len(),
                actual: goal_positions.len(),
            });
        }
        let floating = self.model.floating_joints();
        if floating.len() != 1 {
            return Err(Error::FloatingJointCount(floating.len()));
        }
        let floating = floating[0];

        let start_pose = Utility::superimposition(&self.rest_positions, goal_positions);
        let start_pose_inv = start_pose.inverse();
        let local_goals: Vec<Point3<f64>> = goal_positions.iter().map(|p| start_pose_inv * p).collect();

        let mut states = self.rest_states.clone();

        if optimize {
            self.refine(&mut states, &local_goals)?;
        }

        let root = states.pose(floating).copied().unwrap_or_else(Isometry3::identity);
        states.set_pose(floating, start_pose * root);
        Ok(states)
    }

    /// 在配准后的局部系里同时优化根的局部位姿（不加正则）和转动关节
    fn refine(&self, states: &mut JointStates, local_goals: &[Point3<f64>]) -> Result<()> {
        let model = &self.model;
        let mut program: Program<usize> = Program::new();
        let layout = self.free_joint_states(&mut program, states, true, |j| j)?;

        for (i, &link) in self.end_effectors.iter().enumerate() {
            let support = layout.link_support(model, link);
            let goal = local_goals[i];
            let offset = self.offsets[i];
            let weight = self.weights[i];
            let template = states.clone();
            let layout = layout.clone();
            program.declare_goal(support, 3, move |x, out| {
                let current = layout.states(model, x, &template);
                let point = model.link_point(&current, link, &offset);
                let err = (goal - point) * weight;
                out.copy_from_slice(err.as_slice());
            });
        }

        let options = SolverOptions {
            tolerance: 0.0,
            timeout: self.timeout,
            max_iterations: self.iterations,
            regularization: self.solver_regularization,
            step_scaling: 1.0,
            linear_solver: LinearSolverKind::DenseCholesky,
            multi_threading: false,
        };
        let mut solver = SparseLeastSquaresSolver::compile(program, options);
        let initial = states.clone();
        solver.solve(
            |&joint, dst| read_joint(model, &initial, joint, dst),
            |&joint, src| write_joint(model, states, joint, src),
        )?;
        model.update_mimic_joints(states);
        Ok(())
    }
}
