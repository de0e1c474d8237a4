use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::estimator::{JointTrajectory, MotionSolver};
use crate::global_cast::Point3Record;
use crate::global_types::KeypointId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryFrameRecord {
    pub time: f64,
    /// 按 `keypoints` 顺序的世界系位置
    pub points: Vec<Point3Record>,
    /// 变量名 -> 值，浮动关节按 x, y, z, qx, qy, qz, qw 展开
    pub joints: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub keypoints: Vec<KeypointId>,
    pub links: Vec<String>,
    pub connections: Vec<(KeypointId, KeypointId)>,
    pub frames: Vec<TrajectoryFrameRecord>,
}

impl TrajectoryRecord {
    pub fn new(solver: &MotionSolver, trajectory: &JointTrajectory) -> Self {
        let mapping = solver.mapping();
        let frames = trajectory
            .frames
            .iter()
            .map(|frame| {
                let points = solver
                    .compute_keypoint_positions(&frame.states)
                    .into_iter()
                    .map(Point3Record::from)
                    .collect();
                let joints = frame
                    .states
                    .variable_names(solver.model())
                    .into_iter()
                    .zip(frame.states.serialize())
                    .collect();
                TrajectoryFrameRecord {
                    time: frame.time,
                    points,
                    joints,
                }
            })
            .collect();
        Self {
            keypoints: mapping.keypoints(),
            links: mapping.robot_links().into_iter().map(String::from).collect(),
            connections: mapping.connections(),
            frames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MotionConfig;
    use crate::estimator::JointFrame;
    use crate::kinematics::hand::default_hand;

    #[test]
    fn record_lists_points_and_named_joints() {
        let solver = MotionSolver::new(default_hand().unwrap(), None, MotionConfig::default()).unwrap();
        let mut states = solver.ik().rest_states().clone();
        let flex = solver.model().joint_index("fflex").unwrap();
        states.set_position(flex, 0.7);
        let trajectory = JointTrajectory {
            frames: vec![JointFrame { time: 1.25, states }],
        };

        let record = TrajectoryRecord::new(&solver, &trajectory);
        assert_eq!(record.keypoints.len(), solver.mapping().len());
        assert_eq!(record.links.len(), solver.mapping().len());
        assert_eq!(record.frames.len(), 1);
        let frame = &record.frames[0];
        assert_eq!(frame.time, 1.25);
        assert_eq!(frame.points.len(), record.keypoints.len());
        assert_eq!(frame.joints["fflex"], 0.7);
        assert!(frame.joints.contains_key(&format!("{}.qw", solver.model().joint(0).name)));
        assert!(frame.joints.contains_key("ffdistal"));
    }

    #[test]
    fn yaml_output_reads_back() {
        let solver = MotionSolver::new(default_hand().unwrap(), None, MotionConfig::default()).unwrap();
        let trajectory = JointTrajectory {
            frames: vec![JointFrame {
                time: 0.5,
                states: solver.ik().rest_states().clone(),
            }],
        };
        let record = TrajectoryRecord::new(&solver, &trajectory);
        let text = serde_yaml::to_string(&record).unwrap();
        let back: TrajectoryRecord = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.keypoints, record.keypoints);
        assert_eq!(back.frames[0].joints.len(), record.frames[0].joints.len());
    }
}
