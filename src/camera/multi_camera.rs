use std::collections::HashMap;
use std::path::Path;

use nalgebra::{DMatrix, DVector, Point3};
use serde::{Deserialize, Serialize};

use super::{CameraModel, CameraParametersTrait, CameraRecord, CameraTrait};
use crate::dataset::{read_record, write_record};
use crate::error::{Error, Result};
use crate::global_types::{CameraProjectionMap, Pixel};

/// 标定文件的顶层结构 `{camera_calibration: [...]}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiCameraRecord {
    pub camera_calibration: Vec<CameraRecord>,
}

/// 多相机模型：有序相机列表 + 名字索引
#[derive(Debug, Clone, Default)]
pub struct MultiCameraModel {
    cameras: Vec<CameraModel>,
    camera_map: HashMap<String, usize>,
}

impl MultiCameraModel {
    pub fn new(cameras: Vec<CameraModel>) -> Result<Self> {
        let mut model = Self {
            cameras,
            camera_map: HashMap::new(),
        };
        model.build_camera_map()?;
        Ok(model)
    }

    /// 相机列表变化后重建索引，名字必须唯一
    fn build_camera_map(&mut self) -> Result<()> {
        self.camera_map.clear();
        for (i, camera) in self.cameras.iter().enumerate() {
            if self.camera_map.insert(camera.name().to_string(), i).is_some() {
                return Err(Error::DuplicateCamera(camera.name().to_string()));
            }
        }
        Ok(())
    }

    pub fn cameras(&self) -> &[CameraModel] {
        &self.cameras
    }

    pub fn camera(&self, name: &str) -> Option<&CameraModel> {
        self.camera_map.get(name).map(|&i| &self.cameras[i])
    }

    pub fn camera_names(&self) -> Vec<&str> {
        self.cameras.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    pub fn push(&mut self, camera: CameraModel) -> Result<()> {
        self.cameras.push(camera);
        if let Err(e) = self.build_camera_map() {
            self.cameras.pop();
            self.build_camera_map()?;
            return Err(e);
        }
        Ok(())
    }

    /// 只保留给定名字的相机（保持原有顺序），未知名字被忽略
    pub fn subset(&self, names: &[&str]) -> Self {
        let cameras: Vec<CameraModel> = self
            .cameras
            .iter()
            .filter(|c| names.contains(&c.name()))
            .cloned()
            .collect();
        let camera_map = cameras
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name().to_string(), i))
            .collect();
        Self {
            cameras,
            camera_map,
        }
    }

    pub fn pack(&self) -> MultiCameraRecord {
        MultiCameraRecord {
            camera_calibration: self.cameras.iter().map(|c| c.pack()).collect(),
        }
    }

    pub fn unpack(record: &MultiCameraRecord) -> Result<Self> {
        Self::new(
            record
                .camera_calibration
                .iter()
                .map(CameraModel::unpack)
                .collect(),
        )
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let record: MultiCameraRecord = read_record(path)?;
        let model = Self::unpack(&record)?;
        log::info!("loaded cameras {:?} from {}", model.camera_names(), path.display());
        Ok(model)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        write_record(path, &self.pack())
    }

    /// 观测中属于本模型的相机
    fn observing<'a>(
        &'a self,
        observations: &'a CameraProjectionMap,
    ) -> impl Iterator<Item = (&'a CameraModel, &'a Pixel)> + 'a {
        observations
            .iter()
            .filter_map(|(name, pixel)| self.camera(name).map(|c| (c, pixel)))
    }

    /// 多视角三角化。
    ///
    /// 每个观测相机贡献两个平面约束 n·p = n·c，堆叠后用最小二乘求解；
    /// 少于两个已注册相机时返回 None。
    pub fn triangulate(&self, observations: &CameraProjectionMap) -> Option<Point3<f64>> {
        let views: Vec<_> = self.observing(observations).collect();
        if views.len() < 2 {
            return None;
        }
        let mut a = DMatrix::<f64>::zeros(views.len() * 2, 3);
        let mut b = DVector::<f64>::zeros(views.len() * 2);
        for (i, (camera, pixel)) in views.iter().enumerate() {
            let c = camera.position().coords;
            for (j, n) in camera.plane_normals(pixel).iter().enumerate() {
                let row = i * 2 + j;
                a.set_row(row, &n.transpose());
                b[row] = n.dot(&c);
            }
        }
        let solution = a.svd(true, true).solve(&b, 1e-12).ok()?;
        let p = Point3::new(solution[0], solution[1], solution[2]);
        if p.coords.iter().all(|v| v.is_finite()) {
            Some(p)
        } else {
            None
        }
    }

    /// 每个观测相机的像素重投影误差
    pub fn reprojection_errors(&self, observations: &CameraProjectionMap, point: &Point3<f64>) -> Vec<f64> {
        self.observing(observations)
            .map(|(camera, pixel)| (camera.project_point(point) - pixel).norm())
            .collect()
    }

    /// 点到每个观测相机两个约束平面的距离，返回 (总和, 个数)
    pub fn dimensional_errors(&self, observations: &CameraProjectionMap, point: &Point3<f64>) -> (f64, usize) {
        let mut sum = 0.0;
        let mut count = 0;
        for (camera, pixel) in self.observing(observations) {
            let d = point - camera.position();
            for n in camera.plane_normals(pixel) {
                sum += n.dot(&d).abs();
                count += 1;
            }
        }
        (sum, count)
    }
}
