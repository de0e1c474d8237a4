//! 运动估计
//!
//! 1. `compute_arm_trajectory`：逐帧三角化关键点，单帧 IK 得到初始轨迹；
//! 2. `optimize_joint_trajectory`：整条轨迹批量优化，周期性在留出相机上评估。
mod bend;
mod trajectory;

pub use bend::BendFeatures;
pub use trajectory::{Mode, VariableKey};

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::camera::MultiCameraModel;
use crate::config::MotionConfig;
use crate::dataset::{DatasetTrait, ObservationFrame};
use crate::error::{Error, Result};
use crate::kinematics::{JointStates, KinematicModel};
use crate::mapping::KeypointMapping;
use crate::pose_estimator::HandIk;
use crate::skin::GloveSkin;
use crate::tactile::{TactileInterpolator, TactileLayout};
use trajectory::TrajectoryOptimizer;

#[derive(Debug, Clone, PartialEq)]
pub struct JointFrame {
    pub time: f64,
    pub states: JointStates,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointTrajectory {
    pub frames: Vec<JointFrame>,
}

impl JointTrajectory {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// 一次留出评估：逐维平均像素误差、平均距离误差（米）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub iteration: usize,
    pub reprojection_error: f64,
    pub dimensional_error: f64,
}

/// 触觉耦合的输入
#[derive(Clone, Copy)]
pub struct TactileInput<'t> {
    pub interpolator: &'t dyn TactileInterpolator,
    pub layout: &'t TactileLayout,
}

pub struct MotionSolver {
    mapping: KeypointMapping,
    ik: HandIk,
    config: MotionConfig,
}

impl MotionSolver {
    pub fn new(model: KinematicModel, skin: Option<&GloveSkin>, config: MotionConfig) -> Result<Self> {
        let mapping = KeypointMapping::new(&model, skin)?;
        let end_effectors = mapping.bindings().iter().map(|b| b.link_index).collect();
        let ik = HandIk::new(
            model,
            end_effectors,
            Some(mapping.offsets()),
            Some(mapping.weights()),
            &config,
        );
        Ok(Self { mapping, ik, config })
    }

    pub fn mapping(&self) -> &KeypointMapping {
        &self.mapping
    }

    pub fn ik(&self) -> &HandIk {
        &self.ik
    }

    pub fn model(&self) -> &KinematicModel {
        self.ik.model()
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    /// 按映射顺序三角化一帧的全部关键点，有任何一个失败则返回 None
    pub fn triangulate_frame(&self, multicam: &MultiCameraModel, frame: &ObservationFrame) -> Option<Vec<Point3<f64>>> {
        self.mapping
            .bindings()
            .iter()
            .map(|b| frame.observations(b.keypoint).and_then(|obs| multicam.triangulate(obs)))
            .collect()
    }

    /// 初始轨迹：关键点全部三角化成功的帧做单帧 IK，其余帧直接丢弃
    pub fn compute_arm_trajectory<D: DatasetTrait>(
        &self,
        multicam: &MultiCameraModel,
        sequence: &D,
    ) -> Result<JointTrajectory> {
        let mut trajectory = JointTrajectory::default();
        for frame in sequence.frames() {
            let Some(goals) = self.triangulate_frame(multicam, frame) else {
                log::debug!("frame {:.4}: incomplete triangulation, dropped", frame.time);
                continue;
            };
            match self.ik.solve(&goals, true) {
                Ok(states) => trajectory.frames.push(JointFrame {
                    time: frame.time,
                    states,
                }),
                Err(Error::NumericalFailure(msg)) => {
                    log::debug!("frame {:.4}: ik failed ({}), dropped", frame.time, msg);
                }
                Err(e) => return Err(e),
            }
        }
        log::info!(
            "bootstrap: {} of {} frames solved",
            trajectory.len(),
            sequence.frames().len()
        );
        Ok(trajectory)
    }

    /// 整条轨迹批量优化，返回新轨迹和评估记录（优化前、每隔若干步、优化后）
    pub fn optimize_joint_trajectory<D: DatasetTrait>(
        &self,
        solve_multicam: &MultiCameraModel,
        test_multicam: &MultiCameraModel,
        trajectory: &JointTrajectory,
        sequence: &D,
        tactile: Option<TactileInput>,
    ) -> Result<(JointTrajectory, Vec<EvaluationMetrics>)> {
        TrajectoryOptimizer::new(self, solve_multicam, test_multicam, trajectory)?.run(sequence, tactile)
    }

    /// 各关键点在世界系下的位置，按映射顺序
    pub fn compute_keypoint_positions(&self, states: &JointStates) -> Vec<Point3<f64>> {
        let model = self.model();
        self.mapping
            .bindings()
            .iter()
            .map(|b| model.link_point(states, b.link_index, &b.offset))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::camera::{test_camera, CameraTrait};
    use crate::dataset::ObservationSequence;
    use crate::global_types::CameraProjectionMap;
    use crate::kinematics::hand::default_hand;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Vector3};
    use ndarray::Array2;
    use std::collections::BTreeMap;

    pub(crate) struct Scene {
        pub solver: MotionSolver,
        pub multicam: MultiCameraModel,
        pub sequence: ObservationSequence,
        pub truth: Vec<JointStates>,
    }

    /// 手以静止姿态匀速平移，三个相机无噪声观测，帧间隔 0.1 秒
    pub(crate) fn scene(frame_count: usize, config: Option<MotionConfig>) -> Scene {
        scene_with(frame_count, config, |solver, _| solver.ik().rest_states().clone())
    }

    /// `pose` 给出每个时刻的关节状态（根位姿随后被覆盖为匀速平移）
    pub(crate) fn scene_with<F>(frame_count: usize, config: Option<MotionConfig>, pose: F) -> Scene
    where
        F: Fn(&MotionSolver, f64) -> JointStates,
    {
        let solver = MotionSolver::new(default_hand().unwrap(), None, config.unwrap_or_default()).unwrap();
        let multicam = MultiCameraModel::new(vec![
            test_camera("cam0", Vector3::new(-0.1, 0.0, 0.0)),
            test_camera("cam1", Vector3::new(0.1, 0.0, 0.0)),
            test_camera("cam2", Vector3::new(0.0, 0.1, 0.0)),
        ])
        .unwrap();

        let mut frames = Vec::new();
        let mut truth = Vec::new();
        for i in 0..frame_count {
            let time = i as f64 * 0.1;
            let mut states = pose(&solver, time);
            states.set_pose(
                0,
                Isometry3::new(Vector3::new(0.01 * time, -0.05, 0.5), Vector3::new(0.2, 0.0, 0.1)),
            );
            let mut keypoints = BTreeMap::new();
            for (binding, point) in solver.mapping().bindings().iter().zip(solver.compute_keypoint_positions(&states)) {
                let projections: CameraProjectionMap = multicam
                    .cameras()
                    .iter()
                    .map(|c| (c.name().to_string(), c.project_point(&point)))
                    .collect();
                keypoints.insert(binding.keypoint, projections);
            }
            frames.push(ObservationFrame { time, keypoints });
            truth.push(states);
        }
        Scene {
            solver,
            multicam,
            sequence: ObservationSequence::new(frames),
            truth,
        }
    }

    fn quick_config() -> MotionConfig {
        MotionConfig {
            iterations: 2,
            evaluation_interval: 1,
            ..Default::default()
        }
    }

    #[test]
    fn bootstrap_recovers_each_frame() {
        let scene = scene(6, None);
        let trajectory = scene.solver.compute_arm_trajectory(&scene.multicam, &scene.sequence).unwrap();
        assert_eq!(trajectory.len(), 6);
        for (frame, truth) in trajectory.frames.iter().zip(scene.truth.iter()) {
            let found = scene.solver.compute_keypoint_positions(&frame.states);
            let expected = scene.solver.compute_keypoint_positions(truth);
            for (f, e) in found.iter().zip(expected.iter()) {
                assert_relative_eq!(f, e, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn bootstrap_drops_incomplete_frames() {
        let mut scene = scene(5, None);
        // 第 2 帧的指尖只剩一个相机，第 4 帧是补出来的空帧
        let tip = scene.sequence.frames[2].keypoints.get_mut(&8).unwrap();
        tip.retain(|name, _| name == "cam0");
        scene.sequence.frames[4] = ObservationFrame::placeholder(0.4);
        let trajectory = scene.solver.compute_arm_trajectory(&scene.multicam, &scene.sequence).unwrap();
        let times: Vec<f64> = trajectory.frames.iter().map(|f| f.time).collect();
        let frames = &scene.sequence.frames;
        assert_eq!(times, vec![frames[0].time, frames[1].time, frames[3].time]);
    }

    #[test]
    fn empty_trajectory_is_fatal() {
        let scene = scene(3, None);
        let result = scene.solver.optimize_joint_trajectory(
            &scene.multicam,
            &scene.multicam,
            &JointTrajectory::default(),
            &scene.sequence,
            None,
        );
        assert!(matches!(result, Err(Error::EmptyTrajectory)));
    }

    #[test]
    fn refinement_keeps_exact_trajectory() {
        let scene = scene(31, Some(quick_config()));
        let trajectory = scene.solver.compute_arm_trajectory(&scene.multicam, &scene.sequence).unwrap();
        let (refined, metrics) = scene
            .solver
            .optimize_joint_trajectory(&scene.multicam, &scene.multicam, &trajectory, &scene.sequence, None)
            .unwrap();

        assert_eq!(refined.len(), trajectory.len());
        // 优化前、每一步、优化后
        assert_eq!(metrics.len(), 1 + 2 + 1);
        assert_eq!(metrics.iter().map(|m| m.iteration).collect::<Vec<_>>(), vec![0, 1, 2, 2]);
        for m in &metrics {
            assert!(m.reprojection_error < 1e-3, "{:?}", m);
            assert!(m.dimensional_error < 1e-5, "{:?}", m);
        }
        for (a, b) in refined.frames.iter().zip(trajectory.frames.iter()) {
            assert_eq!(a.time, b.time);
        }
    }

    fn joint_jerk(trajectory: &JointTrajectory, joint: usize) -> f64 {
        let p: Vec<f64> = trajectory
            .frames
            .iter()
            .map(|f| f.states.position(joint).unwrap_or_default())
            .collect();
        p.windows(4).map(|w| (w[3] - 3.0 * w[2] + 3.0 * w[1] - w[0]).powi(2)).sum()
    }

    #[test]
    fn refinement_recovers_perturbed_bootstrap() {
        let config = MotionConfig {
            iterations: 12,
            evaluation_interval: 4,
            ..Default::default()
        };
        // 手指随时间缓慢弯曲
        let scene = scene_with(30, Some(config), |solver, time| {
            let model = solver.model();
            let mut states = solver.ik().rest_states().clone();
            for (i, joint) in model.independent_hinges().into_iter().enumerate() {
                let p = states.position(joint).unwrap_or_default();
                states.set_position(joint, p + 0.15 * (1.5 * time + i as f64).sin());
            }
            model.update_mimic_joints(&mut states);
            states
        });
        let mut trajectory = scene.solver.compute_arm_trajectory(&scene.multicam, &scene.sequence).unwrap();
        assert_eq!(trajectory.len(), 30);

        // 初始轨迹加上逐帧交替的抖动
        let model = scene.solver.model();
        for (i, frame) in trajectory.frames.iter_mut().enumerate() {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            for joint in model.independent_hinges() {
                let p = frame.states.position(joint).unwrap_or_default();
                frame.states.set_position(joint, p + 0.08 * sign);
            }
            model.update_mimic_joints(&mut frame.states);
        }

        let (refined, metrics) = scene
            .solver
            .optimize_joint_trajectory(&scene.multicam, &scene.multicam, &trajectory, &scene.sequence, None)
            .unwrap();
        assert_eq!(metrics.iter().map(|m| m.iteration).collect::<Vec<_>>(), vec![0, 4, 8, 12, 12]);
        let (first, last) = (metrics[0], metrics[metrics.len() - 1]);
        assert!(last.reprojection_error < 0.5 * first.reprojection_error, "{:?}", metrics);
        assert!(last.dimensional_error < 0.5 * first.dimensional_error, "{:?}", metrics);

        let flex = model.joint_index("mflex").unwrap();
        assert!(joint_jerk(&refined, flex) < 0.1 * joint_jerk(&trajectory, flex));
    }

    /// 随时间缓慢变化的假触觉信号
    struct WavingGlove;

    impl TactileInterpolator for WavingGlove {
        fn interpolate(&self, time: f64) -> Array2<f64> {
            Array2::from_shape_fn((16, 16), |(r, c)| ((r + 2 * c) as f64 * 0.1 + time).sin().abs())
        }
    }

    #[test]
    fn tactile_coupling_derives_hinges_from_regression() {
        let config = MotionConfig {
            iterations: 1,
            evaluation_interval: 10,
            ..Default::default()
        };
        let scene = scene(8, Some(config));
        let trajectory = scene.solver.compute_arm_trajectory(&scene.multicam, &scene.sequence).unwrap();
        let layout = TactileLayout::new();
        let input = TactileInput {
            interpolator: &WavingGlove,
            layout: &layout,
        };
        let (refined, metrics) = scene
            .solver
            .optimize_joint_trajectory(&scene.multicam, &scene.multicam, &trajectory, &scene.sequence, Some(input))
            .unwrap();
        assert_eq!(refined.len(), 8);
        assert_eq!(metrics.len(), 2);

        let model = scene.solver.model();
        for frame in &refined.frames {
            for joint in model.independent_hinges() {
                let p = frame.states.position(joint).unwrap();
                assert!(p.is_finite());
                let limits = model.joint(joint).limits().unwrap();
                assert!(p > limits.lower - 0.2 && p < limits.upper + 0.2);
            }
            // mimic 关节跟随源关节
            let source = model.joint_index("fdistal").unwrap();
            let mimic = model.joint_index("ffdistal").unwrap();
            assert_eq!(frame.states.position(source), frame.states.position(mimic));
        }
    }
}
