//! 轨迹批量优化
//!
//! 所有帧的关节一起优化：重投影、连杆与关节的平滑、关节限位，
//! 有触觉输入时关节角由共享的线性回归给出。

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{DMatrix, Isometry3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::bend::BendFeatures;
use super::{EvaluationMetrics, JointFrame, JointTrajectory, MotionSolver, TactileInput};
use crate::camera::{CameraModel, CameraTrait, MultiCameraModel};
use crate::config::TACTILE_INIT_SCALE;
use crate::dataset::DatasetTrait;
use crate::error::{Error, Result};
use crate::global_types::{CameraProjectionMap, Pixel, Timestamp};
use crate::kinematics::{JointStates, KinematicModel};
use crate::pose_estimator::{limit_residuals, read_joint, write_joint, JointLayout, POSE_PARAMETERS};
use crate::solver::{LinearSolverKind, Program, SolverOptions, SparseLeastSquaresSolver};
use crate::utility::Utility;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VariableKey {
    Joint { frame: usize, joint: usize },
    /// 触觉回归矩阵 (分量 × 关节)，行优先
    BendWeights,
    /// 触觉回归的逐关节偏置
    JointBias,
}

/// 目标的用途：训练时声明为残差，评估时只计算指标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Evaluate,
}

/// hinge 位置 = 特征 · W + bias
#[derive(Debug, Clone)]
struct BendRegression {
    features: DMatrix<f64>,
    /// 回归的每一列对应的独立转动关节
    columns: Vec<usize>,
    column_of: Vec<Option<usize>>,
    weights_offset: usize,
    bias_offset: usize,
}

impl BendRegression {
    fn position(&self, frame: usize, column: usize, x: &[f64]) -> f64 {
        let width = self.columns.len();
        (0..self.features.ncols()).fold(x[self.bias_offset + column], |p, k| {
            p + self.features[(frame, k)] * x[self.weights_offset + k * width + column]
        })
    }

    fn support(&self, column: usize) -> impl Iterator<Item = usize> + '_ {
        let width = self.columns.len();
        (0..self.features.ncols())
            .map(move |k| self.weights_offset + k * width + column)
            .chain(std::iter::once(self.bias_offset + column))
    }
}

/// 参数向量到各帧关节状态的映射
#[derive(Debug, Clone)]
struct Parameterization<'a> {
    model: &'a KinematicModel,
    template: JointStates,
    layouts: Vec<JointLayout>,
    regression: Option<BendRegression>,
}

impl<'a> Parameterization<'a> {
    fn frame_states(&self, frame: usize, x: &[f64]) -> JointStates {
        let mut states = self.layouts[frame].states(self.model, x, &self.template);
        self.derive_hinges(frame, x, &mut states);
        states
    }

    /// 触觉模式下由回归重新计算 hinge 位置并刷新 mimic 关节
    fn derive_hinges(&self, frame: usize, x: &[f64], states: &mut JointStates) {
        if let Some(regression) = &self.regression {
            for (column, &joint) in regression.columns.iter().enumerate() {
                states.set_position(joint, regression.position(frame, column, x));
            }
            self.model.update_mimic_joints(states);
        }
    }

    fn hinge_position(&self, frame: usize, joint: usize, x: &[f64]) -> f64 {
        match &self.regression {
            Some(regression) => match regression.column_of[joint] {
                Some(column) => regression.position(frame, column, x),
                None => self.template.position(joint).unwrap_or_default(),
            },
            None => self.layouts[frame].offsets[joint]
                .map(|offset| x[offset])
                .unwrap_or_default(),
        }
    }

    fn hinge_support(&self, frame: usize, joint: usize) -> Vec<usize> {
        match &self.regression {
            Some(regression) => regression.column_of[joint]
                .map(|column| regression.support(column).collect())
                .unwrap_or_default(),
            None => self.layouts[frame].offsets[joint].into_iter().collect(),
        }
    }

    fn link_support(&self, frame: usize, link: usize) -> Vec<usize> {
        let mut support = self.layouts[frame].link_support(self.model, link);
        if let Some(regression) = &self.regression {
            for joint in self.model.link_dependencies(link) {
                if let Some(column) = regression.column_of[joint] {
                    support.extend(regression.support(column));
                }
            }
        }
        support
    }
}

/// 一个关键点在一帧中的所有相机观测
struct ProjectionTerm<'c, 's> {
    frame: usize,
    binding: usize,
    observations: Vec<(&'c CameraModel, Pixel)>,
    projections: &'s CameraProjectionMap,
}

/// 帧间连杆的 6 维速度：缩放后的平移差 + 姿态残差
fn pose_velocity(a: &Isometry3<f64>, b: &Isometry3<f64>, translation_scale: f64) -> [Vector3<f64>; 2] {
    [
        (b.translation.vector - a.translation.vector) * translation_scale,
        Utility::orientation_residual(&a.rotation, &b.rotation),
    ]
}

pub(super) struct TrajectoryOptimizer<'a> {
    solver: &'a MotionSolver,
    solve_multicam: &'a MultiCameraModel,
    test_multicam: &'a MultiCameraModel,
    times: Vec<f64>,
    frame_index: HashMap<Timestamp, usize>,
    states: Vec<JointStates>,
    bend_weights: Vec<f64>,
    joint_bias: Vec<f64>,
}

impl<'a> TrajectoryOptimizer<'a> {
    pub(super) fn new(
        solver: &'a MotionSolver,
        solve_multicam: &'a MultiCameraModel,
        test_multicam: &'a MultiCameraModel,
        trajectory: &JointTrajectory,
    ) -> Result<Self> {
        if trajectory.frames.is_empty() {
            return Err(Error::EmptyTrajectory);
        }
        let times: Vec<f64> = trajectory.frames.iter().map(|f| f.time).collect();
        let frame_index = times
            .iter()
            .enumerate()
            .map(|(i, &t)| (Timestamp::from_sec(t), i))
            .collect();
        // 每帧独立的关节状态副本
        let states = trajectory
            .frames
            .iter()
            .map(|f| {
                let mut states = solver.model().default_states();
                states.deserialize(&f.states.serialize())?;
                Ok(states)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            solver,
            solve_multicam,
            test_multicam,
            times,
            frame_index,
            states,
            bend_weights: Vec::new(),
            joint_bias: Vec::new(),
        })
    }

    fn model(&self) -> &'a KinematicModel {
        self.solver.model()
    }

    /// 观测帧里能和轨迹帧对上的关键点观测。
    ///
    /// 评估模式只取指尖类连杆、去掉序列首尾 `evaluation_margin` 秒，并只用留出相机。
    fn projection_terms<'c, 's, D: DatasetTrait>(
        &self,
        mode: Mode,
        multicam: &'c MultiCameraModel,
        sequence: &'s D,
    ) -> Vec<ProjectionTerm<'c, 's>> {
        let frames = sequence.frames();
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return Vec::new();
        };
        let margin = self.solver.config().evaluation_margin;
        let mut terms = Vec::new();
        for observation_frame in frames {
            let Some(&frame) = self.frame_index.get(&Timestamp::from_sec(observation_frame.time)) else {
                continue;
            };
            let inside = observation_frame.time > first.time + margin && observation_frame.time < last.time - margin;
            for (binding, b) in self.solver.mapping().bindings().iter().enumerate() {
                if mode == Mode::Evaluate && !(inside && b.link.contains("tip")) {
                    continue;
                }
                let Some(projections) = observation_frame.observations(b.keypoint) else {
                    continue;
                };
                let observations: Vec<(&CameraModel, Pixel)> = projections
                    .iter()
                    .filter_map(|(name, pixel)| multicam.camera(name).map(|c| (c, *pixel)))
                    .collect();
                terms.push(ProjectionTerm {
                    frame,
                    binding,
                    observations,
                    projections,
                });
            }
        }
        terms
    }

    /// 留出相机上的平均逐维像素误差和平均距离误差，不影响梯度
    fn evaluate<D: DatasetTrait>(&self, iteration: usize, sequence: &D) -> EvaluationMetrics {
        let model = self.model();
        let bindings = self.solver.mapping().bindings();
        let mut pixel_sum = 0.0;
        let mut pixel_count = 0usize;
        let mut distance_sum = 0.0;
        let mut distance_count = 0usize;
        for term in self.projection_terms(Mode::Evaluate, self.test_multicam, sequence) {
            let binding = &bindings[term.binding];
            let point = model.link_point(&self.states[term.frame], binding.link_index, &binding.offset);
            for (camera, observed) in &term.observations {
                let estimated = camera.project_point(&point);
                pixel_sum += (observed.x - estimated.x).abs() + (observed.y - estimated.y).abs();
                pixel_count += 2;
            }
            let (sum, count) = self.test_multicam.dimensional_errors(term.projections, &point);
            distance_sum += sum;
            distance_count += count;
        }
        let metrics = EvaluationMetrics {
            iteration,
            reprojection_error: pixel_sum / pixel_count as f64,
            dimensional_error: distance_sum / distance_count as f64,
        };
        log::info!(
            "evaluation {}: reprojection error {:.4} px, dimensional error {:.6} m",
            iteration,
            metrics.reprojection_error,
            metrics.dimensional_error
        );
        metrics
    }

    /// 声明变量。有触觉特征时只有根位姿逐帧独立，转动关节来自共享回归。
    fn declare_variables(
        &mut self,
        program: &mut Program<'a, VariableKey>,
        features: Option<BendFeatures>,
    ) -> Result<Parameterization<'a>> {
        let solver: &'a MotionSolver = self.solver;
        let model = solver.model();
        let ik = solver.ik();
        let mut layouts = Vec::with_capacity(self.states.len());

        let Some(features) = features else {
            for (frame, states) in self.states.iter_mut().enumerate() {
                layouts.push(ik.free_joint_states(program, states, true, |joint| VariableKey::Joint {
                    frame,
                    joint,
                })?);
            }
            return Ok(Parameterization {
                model,
                template: model.default_states(),
                layouts,
                regression: None,
            });
        };

        for frame in 0..self.states.len() {
            let mut layout = JointLayout::new(model.joint_count());
            for joint in model.floating_joints() {
                let range = program.declare_variable(VariableKey::Joint { frame, joint }, POSE_PARAMETERS)?;
                layout.offsets[joint] = Some(range.start);
            }
            layouts.push(layout);
        }

        let columns = model.independent_hinges();
        let mut column_of = vec![None; model.joint_count()];
        for (column, &joint) in columns.iter().enumerate() {
            column_of[joint] = Some(column);
        }
        let width = columns.len();
        let components = features.components();

        let mut rng = StdRng::seed_from_u64(solver.config().tactile_seed);
        self.bend_weights = (0..components * width)
            .map(|_| rng.gen_range(-1.0..1.0) * TACTILE_INIT_SCALE)
            .collect();
        // 偏置从初始轨迹的平均关节角开始
        self.joint_bias = columns
            .iter()
            .map(|&joint| {
                let sum: f64 = self.states.iter().filter_map(|s| s.position(joint)).sum();
                sum / self.states.len() as f64
            })
            .collect();

        let weights_offset = program.declare_variable(VariableKey::BendWeights, components * width)?.start;
        let bias_offset = program.declare_variable(VariableKey::JointBias, width)?.start;
        log::info!(
            "tactile coupling: {} components -> {} joints",
            components,
            width
        );

        Ok(Parameterization {
            model,
            template: model.default_states(),
            layouts,
            regression: Some(BendRegression {
                features: features.data().clone(),
                columns,
                column_of,
                weights_offset,
                bias_offset,
            }),
        })
    }

    /// 触觉模式下的关节限位（直接模式下由 `free_joint_states` 声明）
    fn declare_limit_goals(&self, program: &mut Program<'a, VariableKey>, params: &Arc<Parameterization<'a>>) {
        let Some(regression) = &params.regression else {
            return;
        };
        let penalty = self.solver.config().joint_limit_penalty;
        for frame in 0..self.states.len() {
            for (column, &joint) in regression.columns.iter().enumerate() {
                let Some(limits) = self.model().joint(joint).limits() else {
                    continue;
                };
                let params = Arc::clone(params);
                program.declare_goal(regression.support(column).collect(), 2, move |x, out| {
                    let regression = match &params.regression {
                        Some(r) => r,
                        None => return,
                    };
                    let position = regression.position(frame, column, x);
                    out.copy_from_slice(&limit_residuals(position, limits.lower, limits.upper, penalty));
                });
            }
        }
    }

    fn declare_reprojection_goals<D: DatasetTrait>(
        &self,
        program: &mut Program<'a, VariableKey>,
        params: &Arc<Parameterization<'a>>,
        sequence: &D,
    ) -> usize {
        let model = self.model();
        let scale = self.solver.config().reprojection_scale;
        let mut count = 0;
        for term in self.projection_terms(Mode::Train, self.solve_multicam, sequence) {
            if term.observations.is_empty() {
                continue;
            }
            let binding = &self.solver.mapping().bindings()[term.binding];
            let (frame, link, offset) = (term.frame, binding.link_index, binding.offset);
            let factor = scale * binding.weight;
            let observations = term.observations;
            let params = Arc::clone(params);
            count += observations.len();
            program.declare_goal(params.link_support(frame, link), 2 * observations.len(), move |x, out| {
                let states = params.frame_states(frame, x);
                let point = model.link_point(&states, link, &offset);
                for (i, (camera, observed)) in observations.iter().enumerate() {
                    let estimated = camera.project_point(&point);
                    out[2 * i] = (observed.x - estimated.x) * factor;
                    out[2 * i + 1] = (observed.y - estimated.y) * factor;
                }
            });
        }
        count
    }

    /// 连杆速度的二阶、三阶差分，从第 4 帧开始
    fn declare_link_smoothness_goals(&self, program: &mut Program<'a, VariableKey>, params: &Arc<Parameterization<'a>>) {
        let model = self.model();
        let config = self.solver.config();
        let translation_scale = config.velocity_translation_scale;
        let with_acceleration = config.link_acceleration_weight > 0.0;
        for frame in 3..self.states.len() {
            for binding in self.solver.mapping().bindings() {
                let link = binding.link_index;
                let jerk_weight = binding.weight * config.link_jerk_weight * config.regularization;
                let acceleration_weight = binding.weight * config.link_acceleration_weight * config.regularization;
                let support: Vec<usize> = (frame - 3..=frame)
                    .flat_map(|f| params.link_support(f, link))
                    .collect();
                let params = Arc::clone(params);
                let dim = if with_acceleration { 12 } else { 6 };
                program.declare_goal(support, dim, move |x, out| {
                    let poses: Vec<Isometry3<f64>> = (frame - 3..=frame)
                        .map(|f| model.link_pose(&params.frame_states(f, x), link))
                        .collect();
                    let v: Vec<[Vector3<f64>; 2]> = poses
                        .windows(2)
                        .map(|w| pose_velocity(&w[0], &w[1], translation_scale))
                        .collect();
                    for part in 0..2 {
                        let a1 = v[1][part] - v[0][part];
                        let a2 = v[2][part] - v[1][part];
                        let jerk = (a2 - a1) * jerk_weight;
                        out[part * 3..part * 3 + 3].copy_from_slice(jerk.as_slice());
                        if with_acceleration {
                            let acceleration = a2 * acceleration_weight;
                            out[6 + part * 3..6 + part * 3 + 3].copy_from_slice(acceleration.as_slice());
                        }
                    }
                });
            }
        }
    }

    /// 每个独立转动关节角的三阶差分
    fn declare_joint_smoothness_goals(&self, program: &mut Program<'a, VariableKey>, params: &Arc<Parameterization<'a>>) {
        let regularization = self.solver.config().regularization;
        for joint in self.model().independent_hinges() {
            for frame in 3..self.states.len() {
                let support: Vec<usize> = (frame - 3..=frame)
                    .flat_map(|f| params.hinge_support(f, joint))
                    .collect();
                if support.is_empty() {
                    continue;
                }
                let params = Arc::clone(params);
                program.declare_goal(support, 1, move |x, out| {
                    let p: Vec<f64> = (frame - 3..=frame)
                        .map(|f| params.hinge_position(f, joint, x))
                        .collect();
                    out[0] = (p[3] - 3.0 * p[2] + 3.0 * p[1] - p[0]) * regularization;
                });
            }
        }
    }

    fn read(&self, key: &VariableKey, dst: &mut [f64]) {
        match *key {
            VariableKey::Joint { frame, joint } => read_joint(self.model(), &self.states[frame], joint, dst),
            VariableKey::BendWeights => dst.copy_from_slice(&self.bend_weights),
            VariableKey::JointBias => dst.copy_from_slice(&self.joint_bias),
        }
    }

    fn write(&mut self, key: &VariableKey, src: &[f64]) {
        match *key {
            VariableKey::Joint { frame, joint } => write_joint(self.model(), &mut self.states[frame], joint, src),
            VariableKey::BendWeights => self.bend_weights.copy_from_slice(src),
            VariableKey::JointBias => self.joint_bias.copy_from_slice(src),
        }
    }

    /// 从求解器参数刷新各帧状态中的派生量
    fn refresh_states(&mut self, params: &Parameterization, x: &[f64]) {
        let model = self.model();
        for (frame, states) in self.states.iter_mut().enumerate() {
            params.derive_hinges(frame, x, states);
            model.update_mimic_joints(states);
        }
    }

    pub(super) fn run<D: DatasetTrait>(
        mut self,
        sequence: &D,
        tactile: Option<TactileInput>,
    ) -> Result<(JointTrajectory, Vec<EvaluationMetrics>)> {
        let config = self.solver.config().clone();

        let features = match tactile {
            Some(input) => Some(self.bend_features(input)?),
            None => None,
        };

        let mut program = Program::new();
        let params = Arc::new(self.declare_variables(&mut program, features)?);
        self.declare_limit_goals(&mut program, &params);
        let observations = self.declare_reprojection_goals(&mut program, &params, sequence);
        self.declare_link_smoothness_goals(&mut program, &params);
        self.declare_joint_smoothness_goals(&mut program, &params);
        log::info!(
            "trajectory program: {} frames, {} camera observations, {} variables, {} goals",
            self.states.len(),
            observations,
            program.variable_count(),
            program.goals().len()
        );

        let options = SolverOptions {
            tolerance: 0.0,
            timeout: config.timeout,
            max_iterations: config.iterations,
            regularization: config.solver_regularization,
            step_scaling: 1.0,
            linear_solver: LinearSolverKind::ConjugateGradient,
            multi_threading: config.multi_threading,
        };
        let mut solver = SparseLeastSquaresSolver::compile(program, options);

        solver.gather(|key, dst| self.read(key, dst));
        self.refresh_states(&params, solver.parameters());

        let mut metrics = vec![self.evaluate(0, sequence)];
        for i in 0..config.iterations {
            solver.gather(|key, dst| self.read(key, dst));
            let step = solver.step()?;
            solver.scatter(|key, src| self.write(key, src));
            self.refresh_states(&params, solver.parameters());
            log::info!("step {} size {:.6e} loss {:.6e}", i, step, solver.loss());

            if config.evaluation_interval > 0 && (i + 1) % config.evaluation_interval == 0 {
                metrics.push(self.evaluate(i + 1, sequence));
            }
        }
        metrics.push(self.evaluate(config.iterations, sequence));

        let model = self.model();
        let frames = self
            .times
            .iter()
            .zip(self.states)
            .map(|(&time, mut states)| {
                model.update_mimic_joints(&mut states);
                JointFrame { time, states }
            })
            .collect();
        Ok((JointTrajectory { frames }, metrics))
    }

    /// 每帧的本体感知单元读数 -> PCA 特征
    fn bend_features(&self, input: TactileInput) -> Result<BendFeatures> {
        let rows: Vec<Vec<f64>> = self
            .times
            .iter()
            .map(|&t| input.layout.serialize_proprioceptive_cells(&input.interpolator.interpolate(t)))
            .collect();
        let cols = rows.first().map_or(0, |r| r.len());
        let readings = DMatrix::from_fn(rows.len(), cols, |r, c| rows[r][c]);
        BendFeatures::new(&readings, self.solver.config().tactile_components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::tests::{scene, Scene};

    #[test]
    fn regression_positions_combine_features_and_bias() {
        let regression = BendRegression {
            features: DMatrix::from_row_slice(2, 2, &[1.0, 2.0, -1.0, 0.5]),
            columns: vec![3, 5, 7],
            column_of: vec![None, None, None, Some(0), None, Some(1), None, Some(2)],
            weights_offset: 0,
            bias_offset: 6,
        };
        // W = [[1, 2, 3], [4, 5, 6]], bias = [0.1, 0.2, 0.3]
        let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.1, 0.2, 0.3];
        assert!((regression.position(0, 1, &x) - (2.0 + 10.0 + 0.2)).abs() < 1e-12);
        assert!((regression.position(1, 2, &x) - (-3.0 + 3.0 + 0.3)).abs() < 1e-12);
        assert_eq!(regression.support(1).collect::<Vec<_>>(), vec![1, 4, 7]);
    }

    #[test]
    fn evaluation_terms_skip_margins_and_non_tips() {
        let Scene {
            solver,
            multicam,
            sequence,
            ..
        } = scene(31, None);
        let trajectory = solver.compute_arm_trajectory(&multicam, &sequence).unwrap();
        let optimizer = TrajectoryOptimizer::new(&solver, &multicam, &multicam, &trajectory).unwrap();
        let train = optimizer.projection_terms(Mode::Train, &multicam, &sequence);
        let evaluate = optimizer.projection_terms(Mode::Evaluate, &multicam, &sequence);
        assert_eq!(train.len(), 31 * 21);
        // t 在 (1, 2) 之间的 9 帧，每帧 5 个指尖
        assert_eq!(evaluate.len(), 9 * 5);
        let bindings = solver.mapping().bindings();
        assert!(evaluate.iter().all(|t| bindings[t.binding].link.contains("tip")));
    }
}
