use cam_geom::Pixels;
use nalgebra::{Isometry3, Point3, RowVector2, Vector3, Vector5};
use opencv_ros_camera::{Distortion, RosOpenCvIntrinsics, TermCriteria, UndistortedPixels};
use serde::{Deserialize, Serialize};

use super::{CameraParametersTrait, CameraTrait};
use crate::global_cast::PoseRecord;
use crate::global_types::Pixel;

/// 去畸变迭代次数
const UNDISTORT_ITERATIONS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PinholeParameters {
    pub camera_name: String,
    // size
    pub image_width: u32,
    pub image_height: u32,
    // intrinsic
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    // distortion
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

impl PinholeParameters {
    /// 内参与 (k1, k2, p1, p2, k3) 畸变，按 OpenCV 约定
    pub fn intrinsics(&self) -> RosOpenCvIntrinsics<f64> {
        let distortion = Distortion::from_opencv_vec(Vector5::new(self.k1, self.k2, self.p1, self.p2, self.k3));
        RosOpenCvIntrinsics::from_params_with_distortion(self.fx, 0.0, self.fy, self.cx, self.cy, distortion)
    }

    /// 归一化坐标加畸变，返回像素
    pub fn distort(&self, x1: f64, y1: f64) -> Pixel {
        let undistorted = UndistortedPixels {
            data: RowVector2::new(self.fx * x1 + self.cx, self.fy * y1 + self.cy),
        };
        let distorted = self.intrinsics().distort(&undistorted);
        Pixel::new(distorted.data[(0, 0)], distorted.data[(0, 1)])
    }

    /// 像素去畸变到归一化坐标，同 cv::undistortPoints
    pub fn undistort(&self, u: f64, v: f64) -> (f64, f64) {
        let distorted = Pixels::new(RowVector2::new(u, v));
        let undistorted = self
            .intrinsics()
            .undistort_ext(&distorted, TermCriteria::MaxIter(UNDISTORT_ITERATIONS));
        (
            (undistorted.data[(0, 0)] - self.cx) / self.fx,
            (undistorted.data[(0, 1)] - self.cy) / self.fy,
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraModel {
    pub parameters: PinholeParameters,
    /// 相机坐标系在世界系下的位姿
    pub pose: Isometry3<f64>,
}

impl Default for CameraModel {
    fn default() -> Self {
        Self {
            parameters: PinholeParameters {
                image_width: 1,
                image_height: 1,
                fx: 1.0,
                fy: 1.0,
                ..Default::default()
            },
            pose: Isometry3::identity(),
        }
    }
}

impl CameraModel {
    pub fn new(parameters: PinholeParameters, pose: Isometry3<f64>) -> Self {
        Self { parameters, pose }
    }

    pub fn name(&self) -> &str {
        &self.parameters.camera_name
    }

    pub fn position(&self) -> Point3<f64> {
        Point3::from(self.pose.translation.vector)
    }

    pub fn project_points(&self, points: &[Point3<f64>]) -> Vec<Pixel> {
        points.iter().map(|p| self.project_point(p)).collect()
    }

    /// 观测射线在世界系下的两个约束平面法向量。
    ///
    /// 射线分别与相机的 X、Y 轴叉乘后归一化，每个法向量 n 给出一个线性约束 n·p = n·c。
    pub fn plane_normals(&self, pixel: &Pixel) -> [Vector3<f64>; 2] {
        let rot = self.pose.rotation;
        let ray = rot * self.ray_direction(pixel);
        let side = rot * Vector3::x();
        let up = rot * Vector3::y();
        [side.cross(&ray).normalize(), up.cross(&ray).normalize()]
    }

    /// computeUV：批量计算约束平面法向量
    pub fn compute_uv(&self, pixels: &[Pixel]) -> (Vec<Vector3<f64>>, Vec<Vector3<f64>>) {
        pixels
            .iter()
            .map(|p| {
                let [u, v] = self.plane_normals(p);
                (u, v)
            })
            .unzip()
    }
}

impl CameraTrait for CameraModel {
    fn project_point(&self, point: &Point3<f64>) -> Pixel {
        let pc = self.pose.inverse_transform_point(point);
        self.parameters.distort(pc.x / pc.z, pc.y / pc.z)
    }

    fn ray_direction(&self, pixel: &Pixel) -> Vector3<f64> {
        let (x, y) = self.parameters.undistort(pixel.x, pixel.y);
        Vector3::new(x, y, 1.0)
    }
}

/* 标定记录 */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub cx: f64,
    pub cy: f64,
    pub fx: f64,
    pub fy: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DistortionRecord {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsRecord {
    pub projection: ProjectionRecord,
    pub distortion: DistortionRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraRecord {
    pub name: String,
    pub resolution: ResolutionRecord,
    pub intrinsics: IntrinsicsRecord,
    pub pose: PoseRecord,
}

impl CameraParametersTrait for CameraModel {
    type Record = CameraRecord;

    fn pack(&self) -> CameraRecord {
        let p = &self.parameters;
        CameraRecord {
            name: p.camera_name.clone(),
            resolution: ResolutionRecord {
                width: p.image_width,
                height: p.image_height,
            },
            intrinsics: IntrinsicsRecord {
                projection: ProjectionRecord {
                    cx: p.cx,
                    cy: p.cy,
                    fx: p.fx,
                    fy: p.fy,
                },
                distortion: DistortionRecord {
                    k1: p.k1,
                    k2: p.k2,
                    k3: p.k3,
                    p1: p.p1,
                    p2: p.p2,
                },
            },
            pose: self.pose.into(),
        }
    }

    fn unpack(record: &CameraRecord) -> Self {
        let projection = &record.intrinsics.projection;
        let distortion = &record.intrinsics.distortion;
        Self {
            parameters: PinholeParameters {
                camera_name: record.name.clone(),
                image_width: record.resolution.width,
                image_height: record.resolution.height,
                fx: projection.fx,
                fy: projection.fy,
                cx: projection.cx,
                cy: projection.cy,
                k1: distortion.k1,
                k2: distortion.k2,
                k3: distortion.k3,
                p1: distortion.p1,
                p2: distortion.p2,
            },
            pose: record.pose.into(),
        }
    }
}
