//! 运动学模型
//!
//! 连杆和关节都按下标寻址。关节按父在前、子在后的顺序存放，正运动学只需一次前向遍历。
//! 关节类型用带标签的枚举区分：转动（可带 mimic）、浮动（6 自由度根）、固定。

pub mod hand;

use std::collections::HashMap;
use std::path::Path;

use nalgebra::{Isometry3, Point3, Unit, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::dataset::read_record;
use crate::error::{Error, Result};
use crate::global_cast::PoseRecord;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointLimits {
    pub lower: f64,
    pub upper: f64,
}

/// position = multiplier * source + offset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mimic {
    pub joint: usize,
    pub multiplier: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JointKind {
    Hinge {
        axis: Unit<Vector3<f64>>,
        limits: Option<JointLimits>,
        mimic: Option<Mimic>,
    },
    Floating,
    Fixed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Joint {
    pub name: String,
    pub kind: JointKind,
    pub parent: usize,
    pub child: usize,
    /// 关节坐标系相对父连杆
    pub origin: Isometry3<f64>,
}

impl Joint {
    pub fn is_mimic(&self) -> bool {
        matches!(self.kind, JointKind::Hinge { mimic: Some(_), .. })
    }

    /// 非 mimic 的转动关节
    pub fn is_independent_hinge(&self) -> bool {
        matches!(self.kind, JointKind::Hinge { mimic: None, .. })
    }

    pub fn is_floating(&self) -> bool {
        matches!(self.kind, JointKind::Floating)
    }

    pub fn limits(&self) -> Option<JointLimits> {
        match self.kind {
            JointKind::Hinge { limits, .. } => limits,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    /// 把该连杆连到父连杆的关节
    pub joint: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JointState {
    Hinge { position: f64 },
    Floating { pose: Isometry3<f64> },
    Fixed,
}

impl JointState {
    pub fn position(&self) -> Option<f64> {
        match self {
            JointState::Hinge { position } => Some(*position),
            _ => None,
        }
    }

    pub fn pose(&self) -> Option<&Isometry3<f64>> {
        match self {
            JointState::Floating { pose } => Some(pose),
            _ => None,
        }
    }
}

/// 每个关节一个状态，顺序与模型一致
#[derive(Debug, Clone, PartialEq)]
pub struct JointStates {
    pub states: Vec<JointState>,
}

impl JointStates {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn joint_state(&self, joint: usize) -> &JointState {
        &self.states[joint]
    }

    pub fn position(&self, joint: usize) -> Option<f64> {
        self.states[joint].position()
    }

    pub fn set_position(&mut self, joint: usize, value: f64) {
        if let JointState::Hinge { position } = &mut self.states[joint] {
            *position = value;
        }
    }

    pub fn pose(&self, joint: usize) -> Option<&Isometry3<f64>> {
        self.states[joint].pose()
    }

    pub fn set_pose(&mut self, joint: usize, value: Isometry3<f64>) {
        if let JointState::Floating { pose } = &mut self.states[joint] {
            *pose = value;
        }
    }

    /// 展平：转动关节 1 个数，浮动关节 7 个数 (x, y, z, qx, qy, qz, qw)，固定关节不占位
    pub fn serialize(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for state in &self.states {
            match state {
                JointState::Hinge { position } => out.push(*position),
                JointState::Floating { pose } => {
                    let t = pose.translation.vector;
                    let q = pose.rotation;
                    out.extend_from_slice(&[t.x, t.y, t.z, q.i, q.j, q.k, q.w]);
                }
                JointState::Fixed => {}
            }
        }
        out
    }

    /// 与 `serialize` 逐项对应的变量名，浮动关节展开为 `name.x` .. `name.qw`
    pub fn variable_names(&self, model: &KinematicModel) -> Vec<String> {
        let mut out = Vec::new();
        for (state, joint) in self.states.iter().zip(model.joints()) {
            match state {
                JointState::Hinge { .. } => out.push(joint.name.clone()),
                JointState::Floating { .. } => {
                    for suffix in ["x", "y", "z", "qx", "qy", "qz", "qw"] {
                        out.push(format!("{}.{}", joint.name, suffix));
                    }
                }
                JointState::Fixed => {}
            }
        }
        out
    }

    pub fn deserialize(&mut self, data: &[f64]) -> Result<()> {
        let expected: usize = self
            .states
            .iter()
            .map(|s| match s {
                JointState::Hinge { .. } => 1,
                JointState::Floating { .. } => 7,
                JointState::Fixed => 0,
            })
            .sum();
        if data.len() != expected {
            return Err(Error::InvalidModel(format!(
                "serialized joint states have {} values, expected {}",
                data.len(),
                expected
            )));
        }
        let mut it = data.iter().copied();
        let mut next = || it.next().unwrap_or_default();
        for state in &mut self.states {
            match state {
                JointState::Hinge { position } => *position = next(),
                JointState::Floating { pose } => {
                    let t = Vector3::new(next(), next(), next());
                    let (qx, qy, qz, qw) = (next(), next(), next(), next());
                    let q = nalgebra::Quaternion::new(qw, qx, qy, qz);
                    *pose = Isometry3::from_parts(t.into(), UnitQuaternion::from_quaternion(q));
                }
                JointState::Fixed => {}
            }
        }
        Ok(())
    }
}

/// 正运动学结果：每个连杆在世界系下的位姿
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStates {
    pub poses: Vec<Isometry3<f64>>,
}

impl LinkStates {
    pub fn link_pose(&self, link: usize) -> &Isometry3<f64> {
        &self.poses[link]
    }
}

#[derive(Debug, Clone, Default)]
pub struct KinematicModel {
    links: Vec<Link>,
    joints: Vec<Joint>,
    link_map: HashMap<String, usize>,
    joint_map: HashMap<String, usize>,
    /// 根到每个连杆经过的关节
    chains: Vec<Vec<usize>>,
}

impl KinematicModel {
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn joints(&self) -> &[Joint] {
        &self.joints
    }

    pub fn joint(&self, index: usize) -> &Joint {
        &self.joints[index]
    }

    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    pub fn link_index(&self, name: &str) -> Result<usize> {
        self.link_map
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownLink(name.to_string()))
    }

    pub fn joint_index(&self, name: &str) -> Result<usize> {
        self.joint_map
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownJoint(name.to_string()))
    }

    pub fn floating_joints(&self) -> Vec<usize> {
        (0..self.joints.len())
            .filter(|&i| self.joints[i].is_floating())
            .collect()
    }

    pub fn independent_hinges(&self) -> Vec<usize> {
        (0..self.joints.len())
            .filter(|&i| self.joints[i].is_independent_hinge())
            .collect()
    }

    /// 全零状态：转动关节 0，浮动关节单位位姿
    pub fn default_states(&self) -> JointStates {
        JointStates {
            states: self
                .joints
                .iter()
                .map(|j| match j.kind {
                    JointKind::Hinge { .. } => JointState::Hinge { position: 0.0 },
                    JointKind::Floating => JointState::Floating {
                        pose: Isometry3::identity(),
                    },
                    JointKind::Fixed => JointState::Fixed,
                })
                .collect(),
        }
    }

    #[inline]
    fn joint_motion(&self, joint: &Joint, state: &JointState) -> Isometry3<f64> {
        match (&joint.kind, state) {
            (JointKind::Hinge { axis, .. }, JointState::Hinge { position }) => {
                joint.origin * UnitQuaternion::from_axis_angle(axis, *position)
            }
            (JointKind::Floating, JointState::Floating { pose }) => joint.origin * pose,
            _ => joint.origin,
        }
    }

    pub fn forward_kinematics(&self, states: &JointStates) -> LinkStates {
        let mut poses = vec![Isometry3::identity(); self.links.len()];
        for (joint, state) in self.joints.iter().zip(states.states.iter()) {
            poses[joint.child] = poses[joint.parent] * self.joint_motion(joint, state);
        }
        LinkStates { poses }
    }

    /// 只沿根到 `link` 的关节链计算位姿
    pub fn link_pose(&self, states: &JointStates, link: usize) -> Isometry3<f64> {
        self.chains[link]
            .iter()
            .fold(Isometry3::identity(), |pose, &j| {
                pose * self.joint_motion(&self.joints[j], &states.states[j])
            })
    }

    pub fn link_point(&self, states: &JointStates, link: usize, offset: &Vector3<f64>) -> Point3<f64> {
        self.link_pose(states, link) * Point3::from(*offset)
    }

    pub fn update_mimic_joints(&self, states: &mut JointStates) {
        for (i, joint) in self.joints.iter().enumerate() {
            if let JointKind::Hinge {
                mimic: Some(mimic), ..
            } = joint.kind
            {
                if let Some(source) = states.position(mimic.joint) {
                    states.set_position(i, mimic.multiplier * source + mimic.offset);
                }
            }
        }
    }

    /// 影响 `link` 位姿的独立关节（mimic 关节解析为其源关节），按模型顺序
    pub fn link_dependencies(&self, link: usize) -> Vec<usize> {
        let mut deps: Vec<usize> = self.chains[link]
            .iter()
            .filter_map(|&j| match self.joints[j].kind {
                JointKind::Hinge { mimic: Some(m), .. } => Some(m.joint),
                JointKind::Hinge { mimic: None, .. } | JointKind::Floating => Some(j),
                JointKind::Fixed => None,
            })
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    pub fn from_record(record: &ModelRecord) -> Result<Self> {
        let mut links: Vec<Link> = record
            .links
            .iter()
            .map(|name| Link {
                name: name.clone(),
                parent: None,
                children: Vec::new(),
                joint: None,
            })
            .collect();
        let mut link_map = HashMap::new();
        for (i, link) in links.iter().enumerate() {
            if link_map.insert(link.name.clone(), i).is_some() {
                return Err(Error::InvalidModel(format!("duplicate link {}", link.name)));
            }
        }
        let lookup = |name: &str| -> Result<usize> {
            link_map
                .get(name)
                .copied()
                .ok_or_else(|| Error::UnknownLink(name.to_string()))
        };

        // 连杆树
        for (j, joint) in record.joints.iter().enumerate() {
            let parent = lookup(&joint.parent)?;
            let child = lookup(&joint.child)?;
            if links[child].joint.is_some() {
                return Err(Error::InvalidModel(format!("link {} has two parent joints", joint.child)));
            }
            links[child].parent = Some(parent);
            links[child].joint = Some(j);
            links[parent].children.push(child);
        }

        // 按子连杆深度排序，保证父关节在前
        let mut depth = vec![0usize; links.len()];
        for (i, d) in depth.iter_mut().enumerate() {
            let mut link = i;
            let mut steps = 0;
            while let Some(parent) = links[link].parent {
                link = parent;
                steps += 1;
                if steps > links.len() {
                    return Err(Error::InvalidModel(format!("cycle through link {}", links[i].name)));
                }
            }
            *d = steps;
        }
        let mut order: Vec<usize> = (0..record.joints.len()).collect();
        order.sort_by_key(|&j| depth[link_map[&record.joints[j].child]]);

        let mut joint_map = HashMap::new();
        for (new_index, &j) in order.iter().enumerate() {
            let name = &record.joints[j].name;
            if joint_map.insert(name.clone(), new_index).is_some() {
                return Err(Error::InvalidModel(format!("duplicate joint {name}")));
            }
        }

        let mut joints = Vec::with_capacity(order.len());
        for &j in &order {
            let r = &record.joints[j];
            let kind = match &r.kind {
                JointKindRecord::Hinge { axis, limits, mimic } => {
                    let mimic = match mimic {
                        Some(m) => Some(Mimic {
                            joint: joint_map
                                .get(&m.joint)
                                .copied()
                                .ok_or_else(|| Error::UnknownJoint(m.joint.clone()))?,
                            multiplier: m.multiplier,
                            offset: m.offset,
                        }),
                        None => None,
                    };
                    JointKind::Hinge {
                        axis: Unit::new_normalize(Vector3::from(*axis)),
                        limits: *limits,
                        mimic,
                    }
                }
                JointKindRecord::Floating => JointKind::Floating,
                JointKindRecord::Fixed => JointKind::Fixed,
            };
            joints.push(Joint {
                name: r.name.clone(),
                kind,
                parent: lookup(&r.parent)?,
                child: lookup(&r.child)?,
                origin: r.origin.into(),
            });
        }
        for (i, joint) in joints.iter().enumerate() {
            links[joint.child].joint = Some(i);
        }
        // mimic 的源必须是独立转动关节
        for joint in &joints {
            if let JointKind::Hinge { mimic: Some(m), .. } = joint.kind {
                if !joints[m.joint].is_independent_hinge() {
                    return Err(Error::InvalidModel(format!(
                        "mimic joint {} must follow an independent hinge",
                        joint.name
                    )));
                }
            }
        }

        let chains = (0..links.len())
            .map(|i| {
                let mut chain = Vec::new();
                let mut link = i;
                while let Some(j) = links[link].joint {
                    chain.push(j);
                    link = joints[j].parent;
                }
                chain.reverse();
                chain
            })
            .collect();

        Ok(Self {
            links,
            joints,
            link_map,
            joint_map,
            chains,
        })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let record: ModelRecord = read_record(path)?;
        let model = Self::from_record(&record)?;
        log::info!(
            "kinematic model {}: {} links, {} joints",
            path.display(),
            model.links.len(),
            model.joints.len()
        );
        Ok(model)
    }
}

/* 模型描述文件 */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MimicRecord {
    pub joint: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JointKindRecord {
    Hinge {
        axis: [f64; 3],
        #[serde(default)]
        limits: Option<JointLimits>,
        #[serde(default)]
        mimic: Option<MimicRecord>,
    },
    Floating,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointRecord {
    pub name: String,
    pub parent: String,
    pub child: String,
    #[serde(default)]
    pub origin: PoseRecord,
    #[serde(flatten)]
    pub kind: JointKindRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub links: Vec<String>,
    pub joints: Vec<JointRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const ARM: &str = r#"
links: [world, base, upper, lower, tip]
joints:
  - {name: tip_fixed, type: fixed, parent: lower, child: tip, origin: {position: {x: 0.0, y: 0.1, z: 0.0}}}
  - {name: elbow, type: hinge, parent: upper, child: lower, axis: [0, 0, 1], origin: {position: {x: 0.0, y: 0.2, z: 0.0}}, mimic: {joint: shoulder, multiplier: 0.5}}
  - {name: root, type: floating, parent: world, child: base}
  - {name: shoulder, type: hinge, parent: base, child: upper, axis: [0, 0, 1], limits: {lower: -1.0, upper: 1.0}}
"#;

    fn arm() -> KinematicModel {
        let record: ModelRecord = serde_yaml::from_str(ARM).unwrap();
        KinematicModel::from_record(&record).unwrap()
    }

    #[test]
    fn joints_are_sorted_parent_first() {
        let model = arm();
        let names: Vec<&str> = model.joints().iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["root", "shoulder", "elbow", "tip_fixed"]);
        assert_eq!(model.floating_joints(), vec![0]);
        assert_eq!(model.independent_hinges(), vec![1]);
        assert!(model.joint(2).is_mimic());
    }

    #[test]
    fn forward_kinematics_follows_chain() {
        let model = arm();
        let mut states = model.default_states();
        states.set_position(1, std::f64::consts::FRAC_PI_2);
        model.update_mimic_joints(&mut states);
        assert_relative_eq!(states.position(2).unwrap(), std::f64::consts::FRAC_PI_4);

        let base = Isometry3::translation(1.0, 0.0, 0.0);
        states.set_pose(0, base);
        let links = model.forward_kinematics(&states);
        let tip = model.link_index("tip").unwrap();
        // shoulder 转 90°，elbow 再转 45°
        let c = std::f64::consts::FRAC_1_SQRT_2;
        let expected = Point3::new(1.0 - 0.2 - 0.1 * c, -0.1 * c, 0.0);
        assert_relative_eq!(links.link_pose(tip) * Point3::origin(), expected, epsilon = 1e-12);
        assert_relative_eq!(model.link_pose(&states, tip), *links.link_pose(tip), epsilon = 1e-12);
    }

    #[test]
    fn dependencies_resolve_mimic_sources() {
        let model = arm();
        let tip = model.link_index("tip").unwrap();
        assert_eq!(model.link_dependencies(tip), vec![0, 1]);
        assert_eq!(model.link_dependencies(model.link_index("world").unwrap()), Vec::<usize>::new());
    }

    #[test]
    fn serialize_round_trip() {
        let model = arm();
        let mut states = model.default_states();
        states.set_pose(0, Isometry3::new(Vector3::new(0.1, 0.2, 0.3), Vector3::new(0.0, 0.4, 0.0)));
        states.set_position(1, 0.3);
        model.update_mimic_joints(&mut states);
        let data = states.serialize();
        assert_eq!(data.len(), 7 + 1 + 1);
        let mut back = model.default_states();
        back.deserialize(&data).unwrap();
        assert_relative_eq!(*back.pose(0).unwrap(), *states.pose(0).unwrap(), epsilon = 1e-12);
        assert_eq!(back.position(2), states.position(2));
        assert!(back.deserialize(&data[1..]).is_err());
    }

    #[test]
    fn variable_names_follow_serialized_layout() {
        let model = arm();
        let states = model.default_states();
        let names = states.variable_names(&model);
        assert_eq!(names.len(), states.serialize().len());
        assert_eq!(names[0], "root.x");
        assert_eq!(names[6], "root.qw");
        assert_eq!(&names[7..], &["shoulder".to_string(), "elbow".to_string()]);
    }

    #[test]
    fn unknown_names_are_errors() {
        let mut record: ModelRecord = serde_yaml::from_str(ARM).unwrap();
        record.joints[0].parent = "nowhere".to_string();
        assert!(matches!(KinematicModel::from_record(&record), Err(Error::UnknownLink(_))));
        let model = arm();
        assert!(matches!(model.joint_index("wrist"), Err(Error::UnknownJoint(_))));
    }
}
