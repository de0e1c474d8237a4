//! 关键点到运动学连杆的映射
//!
//! 每个关键点绑定一个连杆，附带连杆坐标系下的偏移和拟合权重。
//! 偏移取蒙皮骨骼的加权中心，只保留连杆局部 X、Z 分量。

use nalgebra::Vector3;

use crate::config::{DEFAULT_WEIGHT, TIP_WEIGHT};
use crate::error::{Error, Result};
use crate::global_types::KeypointId;
use crate::kinematics::KinematicModel;
use crate::skin::GloveSkin;

/// (关键点, 连杆, 偏移来源骨骼, 标签)
const KEYPOINT_TABLE: [(KeypointId, &str, Option<&str>, &str); 21] = [
    (0, "hand_ffpalm", None, "palm"),
    (4, "hand_thtip", Some("hand_thmiddle"), "thtip"),
    (3, "hand_thdistal", Some("hand_thmiddle"), "thdistal"),
    (2, "hand_thmiddle", Some("hand_thmiddle"), "thmiddle"),
    (1, "hand_thproximal", None, "thproximal"),
    (8, "hand_fftip", Some("hand_ffmiddle"), "fftip"),
    (7, "hand_ffdistal", Some("hand_ffmiddle"), "ffdistal"),
    (6, "hand_ffmiddle", Some("hand_ffmiddle"), "ffmiddle"),
    (5, "hand_ffproximal", Some("hand_ffmiddle"), "ffproximal"),
    (12, "hand_mftip", Some("hand_mfmiddle"), "mftip"),
    (11, "hand_mfdistal", Some("hand_mfmiddle"), "mfdistal"),
    (10, "hand_mfmiddle", Some("hand_mfmiddle"), "mfmiddle"),
    (9, "hand_mfproximal", Some("hand_mfmiddle"), "mfproximal"),
    (16, "hand_rftip", Some("hand_rfmiddle"), "rftip"),
    (15, "hand_rfdistal", Some("hand_rfmiddle"), "rfdistal"),
    (14, "hand_rfmiddle", Some("hand_rfmiddle"), "rfmiddle"),
    (13, "hand_rfproximal", Some("hand_rfmiddle"), "rfproximal"),
    (20, "hand_lftip", Some("hand_lfmiddle"), "lftip"),
    (19, "hand_lfdistal", Some("hand_lfmiddle"), "lfdistal"),
    (18, "hand_lfmiddle", Some("hand_lfmiddle"), "lfmiddle"),
    (17, "hand_lfproximal", Some("hand_lfmiddle"), "lfproximal"),
];

/// 每根手指从近端到指尖
const CHAINS: [[KeypointId; 4]; 5] = [
    [1, 2, 3, 4],
    [5, 6, 7, 8],
    [9, 10, 11, 12],
    [13, 14, 15, 16],
    [17, 18, 19, 20],
];

/// 拇指的这两节也按指尖权重拟合
const WEIGHTED_THUMB_LINKS: [&str; 2] = ["hand_thdistal", "hand_thmiddle"];

#[derive(Debug, Clone, PartialEq)]
pub struct KeypointBinding {
    pub keypoint: KeypointId,
    pub link: String,
    pub link_index: usize,
    pub offset: Vector3<f64>,
    pub weight: f64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeypointMapping {
    bindings: Vec<KeypointBinding>,
    chains: Vec<Vec<KeypointId>>,
}

pub fn link_weight(link: &str) -> f64 {
    if link.ends_with("tip") || WEIGHTED_THUMB_LINKS.contains(&link) {
        TIP_WEIGHT
    } else {
        DEFAULT_WEIGHT
    }
}

fn bone_offset(skin: Option<&GloveSkin>, bone: Option<&str>) -> Vector3<f64> {
    let Some(bone) = bone else {
        return Vector3::zeros();
    };
    match skin.and_then(|s| s.bone_center(bone)) {
        Some(center) => Vector3::new(center.x, 0.0, center.z),
        None => {
            log::warn!("no skin data for bone {}, using zero offset", bone);
            Vector3::zeros()
        }
    }
}

impl KeypointMapping {
    pub fn new(model: &KinematicModel, skin: Option<&GloveSkin>) -> Result<Self> {
        let bindings = KEYPOINT_TABLE
            .iter()
            .map(|&(keypoint, link, bone, label)| {
                Ok(KeypointBinding {
                    keypoint,
                    link: link.to_string(),
                    link_index: model.link_index(link)?,
                    offset: bone_offset(skin, bone),
                    weight: link_weight(link),
                    label: label.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            bindings,
            chains: CHAINS.iter().map(|c| c.to_vec()).collect(),
        })
    }

    pub fn bindings(&self) -> &[KeypointBinding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn keypoints(&self) -> Vec<KeypointId> {
        self.bindings.iter().map(|b| b.keypoint).collect()
    }

    pub fn links(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.link.as_str()).collect()
    }

    pub fn offsets(&self) -> Vec<Vector3<f64>> {
        self.bindings.iter().map(|b| b.offset).collect()
    }

    pub fn weights(&self) -> Vec<f64> {
        self.bindings.iter().map(|b| b.weight).collect()
    }

    pub fn robot_links(&self) -> Vec<&str> {
        self.bindings.iter().map(|b| b.label.as_str()).collect()
    }

    pub fn chains(&self) -> &[Vec<KeypointId>] {
        &self.chains
    }

    /// 每条链上相邻的关键点对
    pub fn connections(&self) -> Vec<(KeypointId, KeypointId)> {
        self.chains
            .iter()
            .flat_map(|c| c.windows(2).map(|w| (w[0], w[1])))
            .collect()
    }

    pub fn index_of(&self, keypoint: KeypointId) -> Result<usize> {
        self.bindings
            .iter()
            .position(|b| b.keypoint == keypoint)
            .ok_or(Error::UnknownKeypoint(keypoint))
    }

    pub fn keypoint_to_link(&self, keypoint: KeypointId) -> Result<&str> {
        Ok(self.bindings[self.index_of(keypoint)?].link.as_str())
    }
}
