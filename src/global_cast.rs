//! 全局类型转换
//!
//! 文件记录（serde）与 nalgebra 类型之间的相互转换

use nalgebra::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3Record {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Point3<f64>> for Point3Record {
    fn from(p: Point3<f64>) -> Self {
        Self {
            x: p.x,
            y: p.y,
            z: p.z,
        }
    }
}

impl From<Point3Record> for Point3<f64> {
    fn from(p: Point3Record) -> Self {
        Point3::new(p.x, p.y, p.z)
    }
}

impl From<Vector3<f64>> for Point3Record {
    fn from(v: Vector3<f64>) -> Self {
        Point3::from(v).into()
    }
}

/// 四元数按 (x, y, z, w) 存储
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuaternionRecord {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for QuaternionRecord {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }
}

impl From<UnitQuaternion<f64>> for QuaternionRecord {
    fn from(q: UnitQuaternion<f64>) -> Self {
        Self {
            x: q.i,
            y: q.j,
            z: q.k,
            w: q.w,
        }
    }
}

impl From<QuaternionRecord> for UnitQuaternion<f64> {
    /// 非单位四元数会被归一化；已经是单位长度的按原值保留，保证往返无损
    fn from(q: QuaternionRecord) -> Self {
        let q = Quaternion::new(q.w, q.x, q.y, q.z);
        if (q.norm() - 1.0).abs() < 1e-9 {
            UnitQuaternion::new_unchecked(q)
        } else {
            UnitQuaternion::from_quaternion(q)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseRecord {
    pub position: Point3Record,
    pub orientation: QuaternionRecord,
}

impl From<Isometry3<f64>> for PoseRecord {
    fn from(pose: Isometry3<f64>) -> Self {
        Self {
            position: pose.translation.vector.into(),
            orientation: pose.rotation.into(),
        }
    }
}

impl From<PoseRecord> for Isometry3<f64> {
    fn from(pose: PoseRecord) -> Self {
        let p: Point3<f64> = pose.position.into();
        Isometry3::from_parts(Translation3::from(p.coords), pose.orientation.into())
    }
}

#[test]
fn test_pose_record() {
    let pose = Isometry3::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.0, 0.5, 0.0));
    let record = PoseRecord::from(pose);
    let back: Isometry3<f64> = record.into();
    assert!((back.translation.vector - pose.translation.vector).norm() < 1e-12);
    assert!(back.rotation.angle_to(&pose.rotation) < 1e-12);
}
