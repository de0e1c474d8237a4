//! 单帧姿态估计
//!
//! 由三角化得到的关键点位置求解手的关节状态：先用刚体配准初始化根位姿，再优化各转动关节。

mod ik;

pub use ik::HandIk;

use std::fmt::Debug;
use std::hash::Hash;

use nalgebra::Isometry3;

use crate::error::Result;
use crate::kinematics::{JointKind, JointStates, KinematicModel};
use crate::solver::Program;
use crate::utility::Utility;

/// 浮动关节在参数向量里占 6 维：平移 + 轴角
pub const POSE_PARAMETERS: usize = 6;

/// 关节到参数向量的映射：每个关节在参数向量中的起始下标（不是变量则为 None）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JointLayout {
    pub offsets: Vec<Option<usize>>,
}

impl JointLayout {
    pub fn new(joint_count: usize) -> Self {
        Self {
            offsets: vec![None; joint_count],
        }
    }

    /// 影响 `link` 的参数下标
    pub fn link_support(&self, model: &KinematicModel, link: usize) -> Vec<usize> {
        let mut support = Vec::new();
        for joint in model.link_dependencies(link) {
            if let Some(offset) = self.offsets[joint] {
                let dim = parameter_dim(model, joint);
                support.extend(offset..offset + dim);
            }
        }
        support
    }

    /// 在 `template` 的基础上用参数向量覆盖变量关节，再刷新 mimic 关节
    pub fn states(&self, model: &KinematicModel, x: &[f64], template: &JointStates) -> JointStates {
        let mut states = template.clone();
        self.write_states(model, x, &mut states);
        states
    }

    pub fn write_states(&self, model: &KinematicModel, x: &[f64], states: &mut JointStates) {
        for (joint, offset) in self.offsets.iter().enumerate() {
            if let Some(offset) = *offset {
                match model.joint(joint).kind {
                    JointKind::Floating => {
                        states.set_pose(joint, Utility::pose_from_params(&x[offset..offset + POSE_PARAMETERS]))
                    }
                    JointKind::Hinge { .. } => states.set_position(joint, x[offset]),
                    JointKind::Fixed => {}
                }
            }
        }
        model.update_mimic_joints(states);
    }
}

pub fn parameter_dim(model: &KinematicModel, joint: usize) -> usize {
    match model.joint(joint).kind {
        JointKind::Floating => POSE_PARAMETERS,
        JointKind::Hinge { .. } => 1,
        JointKind::Fixed => 0,
    }
}

/// 关节状态读入参数
pub fn read_joint(model: &KinematicModel, states: &JointStates, joint: usize, dst: &mut [f64]) {
    match model.joint(joint).kind {
        JointKind::Floating => {
            let pose = states.pose(joint).copied().unwrap_or_else(Isometry3::identity);
            Utility::pose_to_params(&pose, dst);
        }
        JointKind::Hinge { .. } => dst[0] = states.position(joint).unwrap_or_default(),
        JointKind::Fixed => {}
    }
}

/// 参数写回关节状态
pub fn write_joint(model: &KinematicModel, states: &mut JointStates, joint: usize, src: &[f64]) {
    match model.joint(joint).kind {
        JointKind::Floating => states.set_pose(joint, Utility::pose_from_params(src)),
        JointKind::Hinge { .. } => states.set_position(joint, src[0]),
        JointKind::Fixed => {}
    }
}

/// 关节阻尼和限位惩罚的系数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointRegularization {
    pub damping: f64,
    pub limit_penalty: f64,
}

/// 单侧限位惩罚 relu(lower - p), relu(p - upper)
#[inline]
pub fn limit_residuals(position: f64, lower: f64, upper: f64, penalty: f64) -> [f64; 2] {
    [
        penalty * (lower - position).max(0.0),
        penalty * (position - upper).max(0.0),
    ]
}

/// 把关节声明成优化变量。
///
/// 每个非 mimic 转动关节一个标量变量，带向 `rest` 回拉的阻尼和单侧限位惩罚；
/// `free_floating` 为真时浮动关节的位姿也作为变量（不加正则）。
/// 声明后刷新 `states` 的 mimic 关节，返回各关节的参数位置。
pub fn free_joint_states<'a, K, F>(
    program: &mut Program<'a, K>,
    model: &KinematicModel,
    states: &mut JointStates,
    rest: &JointStates,
    regularization: JointRegularization,
    free_floating: bool,
    key: F,
) -> Result<JointLayout>
where
    K: Clone + Eq + Hash + Debug,
    F: Fn(usize) -> K,
{
    let mut layout = JointLayout::new(model.joint_count());
    for (index, joint) in model.joints().iter().enumerate() {
        match joint.kind {
            JointKind::Hinge { mimic: None, limits, .. } => {
                let offset = program.declare_variable(key(index), 1)?.start;
                layout.offsets[index] = Some(offset);

                let rest_position = rest.position(index).unwrap_or_default();
                let damping = regularization.damping;
                program.declare_goal(vec![offset], 1, move |x, out| {
                    out[0] = (x[offset] - rest_position) * damping;
                });
                if let Some(limits) = limits {
                    let penalty = regularization.limit_penalty;
                    program.declare_goal(vec![offset], 2, move |x, out| {
                        out.copy_from_slice(&limit_residuals(x[offset], limits.lower, limits.upper, penalty));
                    });
                }
            }
            JointKind::Floating if free_floating => {
                let range = program.declare_variable(key(index), POSE_PARAMETERS)?;
                layout.offsets[index] = Some(range.start);
            }
            _ => {}
        }
    }
    model.update_mimic_joints(states);
    Ok(layout)
}
