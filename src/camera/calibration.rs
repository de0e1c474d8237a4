//! 相机标定采集数据
//!
//! 多个采集文件合并：分辨率和标定物必须一致，否则直接失败，不做部分合并。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use nalgebra::Point3;
use serde::{Deserialize, Serialize};

use crate::dataset::read_record;
use crate::error::{Error, Result};
use crate::global_cast::Point3Record;
use crate::global_types::Timestamp;

use super::ResolutionRecord;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub name: String,
    pub position: Point3Record,
}

/// 标定物
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTarget {
    pub markers: Vec<Marker>,
    /// 其余字段原样保留，参与一致性比较
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCamera {
    pub name: String,
    pub resolution: ResolutionRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationObservation {
    pub time: f64,
    pub camera: String,
    #[serde(flatten)]
    pub data: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationCapture {
    pub cameras: Vec<CalibrationCamera>,
    pub observations: Vec<CalibrationObservation>,
    pub object: CalibrationTarget,
}

/// 采集文件的顶层结构 `{calibration_data: {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub calibration_data: CalibrationCapture,
}

/// 一帧：时间 + 按相机分组的观测
pub type CalibrationFrame = (f64, BTreeMap<String, Vec<CalibrationObservation>>);

#[derive(Debug, Clone, Default)]
pub struct CameraCalibrationData {
    pub target: CalibrationTarget,
    pub resolution: ResolutionRecord,
    /// 排序后的相机名
    pub camera_names: Vec<String>,
    pub observations: Vec<CalibrationFrame>,
    pub markers: Vec<Marker>,
}

/// 按键分组，保持键第一次出现的顺序
fn group_by_time(observations: Vec<CalibrationObservation>) -> Vec<(f64, Vec<CalibrationObservation>)> {
    let mut index: HashMap<Timestamp, usize> = HashMap::new();
    let mut groups: Vec<(f64, Vec<CalibrationObservation>)> = Vec::new();
    for obs in observations {
        let key = Timestamp::from_sec(obs.time);
        match index.get(&key) {
            Some(&i) => groups[i].1.push(obs),
            None => {
                index.insert(key, groups.len());
                groups.push((obs.time, vec![obs]));
            }
        }
    }
    groups
}

impl CameraCalibrationData {
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> anyhow::Result<Self> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let file: CalibrationFile = read_record(path.as_ref())?;
            files.push(file);
        }
        let data = Self::merge(files)?;
        log::info!(
            "calibration data: {} cameras, {} frames, {} markers",
            data.camera_names.len(),
            data.observations.len(),
            data.markers.len()
        );
        Ok(data)
    }

    pub fn merge(files: Vec<CalibrationFile>) -> Result<Self> {
        let mut target: Option<CalibrationTarget> = None;
        let mut resolution: Option<ResolutionRecord> = None;
        let mut camera_names = BTreeSet::new();
        let mut frames = Vec::new();

        for file in files {
            let data = file.calibration_data;
            for cam in &data.cameras {
                if resolution.is_some_and(|r| r != cam.resolution) {
                    return Err(Error::IncompatibleResolutions);
                }
                resolution = Some(cam.resolution);
                camera_names.insert(cam.name.clone());
            }

            frames.extend(group_by_time(data.observations));

            match &target {
                Some(t) if *t != data.object => return Err(Error::IncompatibleCalibrationTargets),
                Some(_) => {}
                None => target = Some(data.object),
            }
        }

        let target = target.ok_or(Error::EmptyCalibration)?;
        let observations = frames
            .into_iter()
            .map(|(time, obs)| {
                let mut by_camera: BTreeMap<String, Vec<CalibrationObservation>> = BTreeMap::new();
                for o in obs {
                    by_camera.entry(o.camera.clone()).or_default().push(o);
                }
                (time, by_camera)
            })
            .collect();

        Ok(Self {
            markers: target.markers.clone(),
            target,
            resolution: resolution.unwrap_or_default(),
            camera_names: camera_names.into_iter().collect(),
            observations,
        })
    }

    pub fn marker_names(&self) -> Vec<&str> {
        self.markers.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn marker_position(&self, name: &str) -> Option<Point3<f64>> {
        self.markers
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.position.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(width: u32, cameras: &[&str], marker_x: f64) -> CalibrationFile {
        let text = format!(
            r#"
calibration_data:
  cameras: [{cams}]
  observations:
    - {{time: 0.5, camera: {first}, marker: a}}
    - {{time: 0.5, camera: {first}, marker: b}}
    - {{time: 0.25, camera: {first}, marker: a}}
  object:
    markers:
      - {{name: a, position: {{x: {marker_x}, y: 0.0, z: 0.0}}}}
      - {{name: b, position: {{x: 0.0, y: 1.0, z: 0.0}}}}
"#,
            cams = cameras
                .iter()
                .map(|c| format!("{{name: {c}, resolution: {{width: {width}, height: 480}}}}"))
                .collect::<Vec<_>>()
                .join(", "),
            first = cameras[0],
        );
        serde_yaml::from_str(&text).unwrap()
    }

    #[test]
    fn merge_groups_by_time_then_camera() {
        let data = CameraCalibrationData::merge(vec![
            capture(640, &["cam1", "cam0"], 0.0),
            capture(640, &["cam2"], 0.0),
        ])
        .unwrap();
        assert_eq!(data.camera_names, vec!["cam0", "cam1", "cam2"]);
        assert_eq!(data.observations.len(), 4);
        assert_eq!(data.observations[0].0, 0.5);
        assert_eq!(data.observations[0].1["cam1"].len(), 2);
        assert_eq!(data.observations[1].0, 0.25);
        assert_eq!(data.resolution.width, 640);
        assert_eq!(data.marker_names(), vec!["a", "b"]);
        assert_eq!(data.marker_position("b"), Some(Point3::new(0.0, 1.0, 0.0)));
    }

    #[test]
    fn merge_rejects_mismatched_resolution() {
        let result = CameraCalibrationData::merge(vec![
            capture(640, &["cam0"], 0.0),
            capture(800, &["cam1"], 0.0),
        ]);
        assert!(matches!(result, Err(Error::IncompatibleResolutions)));
    }

    #[test]
    fn merge_rejects_mismatched_target() {
        let result = CameraCalibrationData::merge(vec![
            capture(640, &["cam0"], 0.0),
            capture(640, &["cam1"], 0.1),
        ]);
        assert!(matches!(result, Err(Error::IncompatibleCalibrationTargets)));
    }

    #[test]
    fn merge_of_nothing_is_an_error() {
        let result = CameraCalibrationData::merge(Vec::new());
        assert!(matches!(result, Err(Error::EmptyCalibration)));
    }
}
