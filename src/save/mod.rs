//! 结果导出
//!
//! 轨迹记录按扩展名写成 YAML / JSON，评估记录写成 CSV。
mod trajectory;

pub use trajectory::{TrajectoryFrameRecord, TrajectoryRecord};

use std::path::Path;

use anyhow::Context;

use crate::estimator::{EvaluationMetrics, JointTrajectory, MotionSolver};

/// 导出关节轨迹，附带每帧的关键点位置
pub fn save_trajectory(path: &Path, solver: &MotionSolver, trajectory: &JointTrajectory) -> anyhow::Result<()> {
    let record = TrajectoryRecord::new(solver, trajectory);
    crate::dataset::write_record(path, &record)
        .with_context(|| format!("failed to save trajectory to {}", path.display()))
}

/// 每条评估一行：iteration, reprojection_error, dimensional_error
pub fn save_metrics(path: &Path, metrics: &[EvaluationMetrics]) -> anyhow::Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("failed to create {}", path.display()))?;
    for m in metrics {
        writer.serialize(m)?;
    }
    writer.flush()?;
    log::info!("wrote {} evaluation rows to {}", metrics.len(), path.display());
    Ok(())
}
