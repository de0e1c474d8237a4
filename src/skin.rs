//! 蒙皮数据
//!
//! 场景节点存成扁平数组，父子关系用下标表示。每个网格按骨骼记录绑定矩阵、受影响的顶点和混合权重。

use std::collections::HashMap;
use std::path::Path;

use nalgebra::{Matrix4, Point3, Vector4};
use serde::{Deserialize, Serialize};

use crate::dataset::read_record;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub name: String,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoneBinding {
    pub name: String,
    /// 网格坐标 -> 骨骼坐标
    pub binding: Matrix4<f64>,
    pub vertices: Vec<Point3<f64>>,
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkinMesh {
    pub node: usize,
    pub bones: Vec<BoneBinding>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GloveSkin {
    pub nodes: Vec<SceneNode>,
    pub meshes: Vec<SkinMesh>,
}

impl GloveSkin {
    pub fn from_record(record: &SkinRecord) -> Result<Self> {
        let index: HashMap<&str, usize> = record
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();
        let lookup = |name: &str| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| Error::UnknownLink(name.to_string()))
        };

        let mut nodes: Vec<SceneNode> = record
            .nodes
            .iter()
            .map(|n| SceneNode {
                name: n.name.clone(),
                parent: None,
                children: Vec::new(),
            })
            .collect();
        for (i, n) in record.nodes.iter().enumerate() {
            if let Some(parent) = &n.parent {
                let p = lookup(parent)?;
                nodes[i].parent = Some(p);
                nodes[p].children.push(i);
            }
        }

        let mut meshes = Vec::with_capacity(record.meshes.len());
        for mesh in &record.meshes {
            let bones = mesh
                .bones
                .iter()
                .map(|b| {
                    if b.vertices.len() != b.weights.len() {
                        return Err(Error::InvalidModel(format!(
                            "bone {} has {} vertices but {} weights",
                            b.name,
                            b.vertices.len(),
                            b.weights.len()
                        )));
                    }
                    Ok(BoneBinding {
                        name: b.name.clone(),
                        binding: Matrix4::from_row_slice(&b.binding),
                        vertices: b.vertices.iter().map(|v| Point3::from(*v)).collect(),
                        weights: b.weights.clone(),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            meshes.push(SkinMesh {
                node: lookup(&mesh.node)?,
                bones,
            });
        }
        Ok(Self { nodes, meshes })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let record: SkinRecord = read_record(path)?;
        let skin = Self::from_record(&record)?;
        log::info!(
            "skin {}: {} nodes, {} meshes",
            path.display(),
            skin.nodes.len(),
            skin.meshes.len()
        );
        log::debug!("skin nodes: {:?}", skin.node_names());
        Ok(skin)
    }

    /// 深度优先的节点名
    pub fn node_names(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].parent.is_none())
            .rev()
            .collect();
        while let Some(i) = stack.pop() {
            out.push(self.nodes[i].name.as_str());
            stack.extend(self.nodes[i].children.iter().rev());
        }
        out
    }

    /// 骨骼绑定顶点在骨骼坐标系下的加权中心，没有绑定数据时返回 None
    pub fn bone_center(&self, bone: &str) -> Option<Point3<f64>> {
        let mut sum = Vector4::zeros();
        let mut div = 0.0;
        for binding in self.meshes.iter().flat_map(|m| m.bones.iter()) {
            if binding.name != bone {
                continue;
            }
            for (v, w) in binding.vertices.iter().zip(binding.weights.iter()) {
                sum += binding.binding * v.to_homogeneous() * *w;
                div += *w;
            }
        }
        if div > 0.0 {
            Some(Point3::from(sum.xyz() / div))
        } else {
            None
        }
    }
}

/* 文件记录 */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneNodeRecord {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoneRecord {
    pub name: String,
    /// 4x4 行优先
    pub binding: [f64; 16],
    pub vertices: Vec<[f64; 3]>,
    pub weights: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkinMeshRecord {
    pub node: String,
    pub bones: Vec<BoneRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SkinRecord {
    pub nodes: Vec<SceneNodeRecord>,
    #[serde(default)]
    pub meshes: Vec<SkinMeshRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SKIN: &str = r#"
nodes:
  - {name: world}
  - {name: hand, parent: world}
  - {name: mesh, parent: hand}
  - {name: hand_ffmiddle, parent: hand}
meshes:
  - node: mesh
    bones:
      - name: hand_ffmiddle
        binding: [1, 0, 0, 0.5,  0, 1, 0, 0,  0, 0, 1, 0,  0, 0, 0, 1]
        vertices: [[0, 0, 0], [1, 2, 3]]
        weights: [1.0, 3.0]
"#;

    #[test]
    fn bone_center_is_weighted_in_bone_frame() {
        let record: SkinRecord = serde_yaml::from_str(SKIN).unwrap();
        let skin = GloveSkin::from_record(&record).unwrap();
        let center = skin.bone_center("hand_ffmiddle").unwrap();
        // (0.5,0,0)*1 + (1.5,2,3)*3 / 4
        assert_relative_eq!(center, Point3::new(1.25, 1.5, 2.25), epsilon = 1e-12);
        assert!(skin.bone_center("hand_mfmiddle").is_none());
    }

    #[test]
    fn nodes_are_index_linked() {
        let record: SkinRecord = serde_yaml::from_str(SKIN).unwrap();
        let skin = GloveSkin::from_record(&record).unwrap();
        assert_eq!(skin.nodes[1].children, vec![2, 3]);
        assert_eq!(skin.nodes[3].parent, Some(1));
        assert_eq!(skin.meshes[0].node, 2);
        assert_eq!(skin.node_names(), vec!["world", "hand", "mesh", "hand_ffmiddle"]);
    }

    #[test]
    fn mismatched_weights_are_rejected() {
        let mut record: SkinRecord = serde_yaml::from_str(SKIN).unwrap();
        record.meshes[0].bones[0].weights.pop();
        assert!(GloveSkin::from_record(&record).is_err());
    }
}
