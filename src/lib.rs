//! 手套动作捕捉
//!
//! 多相机关键点三角化、单帧逆运动学、带平滑项和触觉耦合的整条轨迹优化。
pub mod camera;
pub mod config;
pub mod dataset;
pub mod error;
pub mod estimator;
pub mod global_cast;
pub mod global_types;
pub mod kinematics;
pub mod mapping;
pub mod pose_estimator;
pub mod save;
pub mod skin;
pub mod solver;
pub mod tactile;
pub mod utility;

pub use error::{Error, Result};
