use serde::{Deserialize, Serialize};

/// 是否允许求解器在组装雅可比矩阵时使用多线程
pub const MULTIPLE_THREAD: bool = true;

/// 单帧 IK 的迭代次数
pub const IK_MAX_ITERATIONS: usize = 20;
/// 轨迹批量优化的迭代次数
pub const TRAJECTORY_ITERATIONS: usize = 50;
/// 每隔多少次迭代做一次留出评估
pub const EVALUATION_INTERVAL: usize = 10;
/// 求解器超时（秒）
pub const SOLVER_TIMEOUT: f64 = 10.0;
/// Tikhonov 正则
pub const SOLVER_REGULARIZATION: f64 = 0.001;

/// 重投影残差的全局缩放
pub const REPROJECTION_SCALE: f64 = 0.0002;
/// 平滑项的全局系数
pub const SMOOTHNESS_REGULARIZATION: f64 = 1.0;
/// 连杆速度中平移部分的缩放
pub const VELOCITY_TRANSLATION_SCALE: f64 = 10.0;
/// 连杆 jerk 权重
pub const LINK_JERK_WEIGHT: f64 = 0.5;
/// 连杆加速度权重，默认关闭
pub const LINK_ACCELERATION_WEIGHT: f64 = 0.0;

/// 关节向静止值回拉的阻尼
pub const JOINT_DAMPING: f64 = 0.005;
/// 越过关节限位的惩罚
pub const JOINT_LIMIT_PENALTY: f64 = 1.0;
/// 静止姿态在关节行程中的比例
pub const REST_FRACTION: f64 = 0.25;

/// 触觉特征 PCA 维数
pub const TACTILE_COMPONENTS: usize = 8;
/// 触觉回归矩阵初始化幅度
pub const TACTILE_INIT_SCALE: f64 = 0.0001;
pub const TACTILE_SEED: u64 = 0;

/// 间隔超过中位数的多少倍视为缺帧
pub const GAP_FACTOR: f64 = 1.5;
/// 评估时去掉序列首尾的时长（秒）
pub const EVALUATION_MARGIN: f64 = 1.0;
/// 序列开头固定丢弃的帧数
pub const INITIAL_FRAME_TRIM: usize = 3;

/// 指尖类关键点和白名单关键点的权重
pub const TIP_WEIGHT: f64 = 1.0;
pub const DEFAULT_WEIGHT: f64 = 0.2;

/// 运动求解的可调参数，默认值取自上面的常量
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub ik_iterations: usize,
    pub iterations: usize,
    pub evaluation_interval: usize,
    pub timeout: f64,
    pub solver_regularization: f64,
    pub reprojection_scale: f64,
    pub regularization: f64,
    pub velocity_translation_scale: f64,
    pub link_jerk_weight: f64,
    pub link_acceleration_weight: f64,
    pub joint_damping: f64,
    pub joint_limit_penalty: f64,
    pub tactile_components: usize,
    pub tactile_seed: u64,
    pub evaluation_margin: f64,
    pub multi_threading: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            ik_iterations: IK_MAX_ITERATIONS,
            iterations: TRAJECTORY_ITERATIONS,
            evaluation_interval: EVALUATION_INTERVAL,
            timeout: SOLVER_TIMEOUT,
            solver_regularization: SOLVER_REGULARIZATION,
            reprojection_scale: REPROJECTION_SCALE,
            regularization: SMOOTHNESS_REGULARIZATION,
            velocity_translation_scale: VELOCITY_TRANSLATION_SCALE,
            link_jerk_weight: LINK_JERK_WEIGHT,
            link_acceleration_weight: LINK_ACCELERATION_WEIGHT,
            joint_damping: JOINT_DAMPING,
            joint_limit_penalty: JOINT_LIMIT_PENALTY,
            tactile_components: TACTILE_COMPONENTS,
            tactile_seed: TACTILE_SEED,
            evaluation_margin: EVALUATION_MARGIN,
            multi_threading: MULTIPLE_THREAD,
        }
    }
}

#[test]
fn partial_config_keeps_defaults() {
    let config: MotionConfig = serde_json::from_str(r#"{"iterations": 5}"#).unwrap();
    assert_eq!(config.iterations, 5);
    assert_eq!(config.ik_iterations, IK_MAX_ITERATIONS);
    assert_eq!(config.tactile_components, TACTILE_COMPONENTS);
}
