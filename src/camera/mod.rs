//! 相机模型
//!
//! - [`CameraModel`]：针孔 + Brown-Conrady 畸变（3 径向 + 2 切向），位姿为相机在世界系下的刚体变换。
//! - [`MultiCameraModel`]：按名字索引的多相机集合，负责多视角三角化和误差度量。
//! - [`CameraCalibrationData`]：标定采集文件的合并。

mod calibration;
mod multi_camera;
mod pinhole_camera;

pub use calibration::{CalibrationObservation, CalibrationTarget, CameraCalibrationData, Marker};
pub use multi_camera::{MultiCameraModel, MultiCameraRecord};
pub use pinhole_camera::{
    CameraModel, CameraRecord, DistortionRecord, IntrinsicsRecord, PinholeParameters,
    ProjectionRecord, ResolutionRecord,
};

#[cfg(test)]
pub(crate) use pinhole_camera::tests::test_camera;

use nalgebra::{Point3, Vector3};

use crate::global_types::Pixel;

/// 相机的trait
pub trait CameraTrait {
    /// 世界坐标点投影到像素
    fn project_point(&self, point: &Point3<f64>) -> Pixel;
    /// liftProjective：像素去畸变后得到相机坐标系下的射线 [x, y, 1]
    fn ray_direction(&self, pixel: &Pixel) -> Vector3<f64>;
}

/// 相机参数的trait
pub trait CameraParametersTrait: Sized {
    type Record;
    fn pack(&self) -> Self::Record;
    fn unpack(record: &Self::Record) -> Self;
}
