//! 内置的五指手套模型
//!
//! 命名和关节限位与手套网格导出的 URDF 一致：
//! 拇指 `tabduct, tproximal, tmiddle, tdistal`；
//! 其余四指 `{f,m,r,l}abduct, {f,m,r,l}flex, {f,m,r,l}distal`，末节 `{ff,mf,rf,lf}distal` 为 mimic。

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use super::{JointKindRecord, JointLimits, JointRecord, KinematicModel, MimicRecord, ModelRecord};
use crate::error::Result;

/// (前缀, 掌骨位置 x, 各节长度)
const FINGERS: [(&str, f64, [f64; 4]); 4] = [
    ("ff", 0.030, [0.045, 0.027, 0.020, 0.012]),
    ("mf", 0.010, [0.050, 0.030, 0.022, 0.012]),
    ("rf", -0.010, [0.047, 0.028, 0.021, 0.012]),
    ("lf", -0.030, [0.038, 0.022, 0.018, 0.011]),
];
const PALM_LENGTH: f64 = 0.09;
const THUMB_LENGTHS: [f64; 4] = [0.040, 0.035, 0.030, 0.015];

const ABDUCT_LIMITS: JointLimits = JointLimits { lower: -0.5, upper: 0.5 };
const THUMB_ABDUCT_LIMITS: JointLimits = JointLimits { lower: -1.0, upper: 1.3 };
const FLEX_LIMITS: JointLimits = JointLimits { lower: -0.2, upper: 1.3 };
const THUMB_LIMITS: JointLimits = JointLimits { lower: -1.0, upper: 1.0 };

fn fixed(name: &str, parent: &str, child: &str, origin: Isometry3<f64>) -> JointRecord {
    JointRecord {
        name: name.to_string(),
        parent: parent.to_string(),
        child: child.to_string(),
        origin: origin.into(),
        kind: JointKindRecord::Fixed,
    }
}

fn hinge(
    name: &str,
    parent: &str,
    child: &str,
    offset: f64,
    axis: [f64; 3],
    limits: JointLimits,
    mimic: Option<&str>,
) -> JointRecord {
    JointRecord {
        name: name.to_string(),
        parent: parent.to_string(),
        child: child.to_string(),
        origin: Isometry3::translation(0.0, offset, 0.0).into(),
        kind: JointKindRecord::Hinge {
            axis,
            limits: Some(limits),
            mimic: mimic.map(|joint| MimicRecord {
                joint: joint.to_string(),
                multiplier: 1.0,
                offset: 0.0,
            }),
        },
    }
}

pub fn default_hand_record() -> ModelRecord {
    let mut links = vec!["world".to_string(), "hand_palm".to_string()];
    let mut joints = vec![JointRecord {
        name: "palm".to_string(),
        parent: "world".to_string(),
        child: "hand_palm".to_string(),
        origin: Default::default(),
        kind: JointKindRecord::Floating,
    }];

    for (prefix, x, lengths) in FINGERS {
        let f = &prefix[0..1];
        let palm = format!("hand_{prefix}palm");
        let abduct = format!("{palm}_a");
        let proximal = format!("hand_{prefix}proximal");
        let middle = format!("hand_{prefix}middle");
        let distal = format!("hand_{prefix}distal");
        let tip = format!("hand_{prefix}tip");
        links.extend([&palm, &abduct, &proximal, &middle, &distal, &tip].map(|s| s.to_string()));

        joints.push(fixed(
            &format!("{prefix}palm"),
            "hand_palm",
            &palm,
            Isometry3::translation(x, 0.0, 0.0),
        ));
        joints.push(hinge(&format!("{f}abduct"), &palm, &abduct, PALM_LENGTH, [0.0, 0.0, 1.0], ABDUCT_LIMITS, None));
        joints.push(hinge(&format!("{f}flex"), &abduct, &proximal, 0.0, [-1.0, 0.0, 0.0], FLEX_LIMITS, None));
        joints.push(hinge(&format!("{f}distal"), &proximal, &middle, lengths[0], [-1.0, 0.0, 0.0], FLEX_LIMITS, None));
        let source = format!("{f}distal");
        joints.push(hinge(
            &format!("{prefix}distal"),
            &middle,
            &distal,
            lengths[1],
            [-1.0, 0.0, 0.0],
            FLEX_LIMITS,
            Some(&source),
        ));
        joints.push(fixed(
            &format!("{prefix}tip"),
            &distal,
            &tip,
            Isometry3::translation(0.0, lengths[2] + lengths[3], 0.0),
        ));
    }

    // 拇指从掌根斜向外伸出
    links.extend(
        [
            "hand_thbase",
            "hand_thbase_a",
            "hand_thproximal",
            "hand_thmiddle",
            "hand_thdistal",
            "hand_thtip",
        ]
        .map(|s| s.to_string()),
    );
    let thumb_base = Isometry3::from_parts(
        Translation3::new(0.035, 0.02, -0.01),
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), -std::f64::consts::FRAC_PI_4),
    );
    joints.push(fixed("thbase", "hand_palm", "hand_thbase", thumb_base));
    let thumb_axis = Vector3::new(0.0, 0.6, 0.8);
    joints.push(hinge(
        "tabduct",
        "hand_thbase",
        "hand_thbase_a",
        0.0,
        [thumb_axis.x, thumb_axis.y, thumb_axis.z],
        THUMB_ABDUCT_LIMITS,
        None,
    ));
    joints.push(hinge("tproximal", "hand_thbase_a", "hand_thproximal", 0.0, [1.0, 0.0, 0.0], THUMB_LIMITS, None));
    joints.push(hinge("tmiddle", "hand_thproximal", "hand_thmiddle", THUMB_LENGTHS[0], [-1.0, 0.0, 0.0], FLEX_LIMITS, None));
    joints.push(hinge("tdistal", "hand_thmiddle", "hand_thdistal", THUMB_LENGTHS[1], [-1.0, 0.0, 0.0], THUMB_LIMITS, None));
    joints.push(fixed(
        "ttip",
        "hand_thdistal",
        "hand_thtip",
        Isometry3::translation(0.0, THUMB_LENGTHS[2] + THUMB_LENGTHS[3], 0.0),
    ));

    ModelRecord { links, joints }
}

pub fn default_hand() -> Result<KinematicModel> {
    KinematicModel::from_record(&default_hand_record())
}
