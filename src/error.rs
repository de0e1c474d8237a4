//! 错误类型
//!
//! 配置类错误一律致命，不做重试；"无结果"的情况（例如少于两个相机的三角化）用 `Option` 表达。

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// 目标点数量与末端执行器数量不一致
    #[error("wrong number of goal positions: expected {expected}, got {actual}")]
    GoalCountMismatch { expected: usize, actual: usize },

    /// 模型必须有且只有一个浮动关节
    #[error("model should have exactly one floating joint, currently has {0}")]
    FloatingJointCount(usize),

    #[error("unknown keypoint {0}")]
    UnknownKeypoint(u32),

    #[error("unknown link {0}")]
    UnknownLink(String),

    #[error("unknown joint {0}")]
    UnknownJoint(String),

    #[error("duplicate camera name {0}")]
    DuplicateCamera(String),

    #[error("variable {0} declared twice")]
    DuplicateVariable(String),

    /// 批量优化的前置条件：初始轨迹不能为空
    #[error("bootstrapped trajectory is empty")]
    EmptyTrajectory,

    #[error("incompatible camera resolutions")]
    IncompatibleResolutions,

    #[error("incompatible calibration objects")]
    IncompatibleCalibrationTargets,

    #[error("no calibration data")]
    EmptyCalibration,

    #[error("invalid kinematic model: {0}")]
    InvalidModel(String),

    #[error("numerical failure: {0}")]
    NumericalFailure(String),
}

pub type Result<T> = std::result::Result<T, Error>;
