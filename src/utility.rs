use nalgebra::{Isometry3, Matrix3, Point3, Rotation3, Translation3, UnitQuaternion, Vector3};

pub struct Utility {}

impl Utility {
    /// 刚体配准（Kabsch，无缩放、无镜像），返回把 `source` 映射到 `target` 的位姿。
    ///
    /// 点数不一致或为空时返回单位位姿。
    pub fn superimposition(source: &[Point3<f64>], target: &[Point3<f64>]) -> Isometry3<f64> {
        if source.len() != target.len() || source.is_empty() {
            return Isometry3::identity();
        }
        let n = source.len() as f64;
        let mut c_s = Vector3::zeros();
        let mut c_t = Vector3::zeros();
        for (ps, pt) in source.iter().zip(target.iter()) {
            c_s += ps.coords;
            c_t += pt.coords;
        }
        c_s /= n;
        c_t /= n;

        let mut h = Matrix3::zeros();
        for (ps, pt) in source.iter().zip(target.iter()) {
            h += (pt.coords - c_t) * (ps.coords - c_s).transpose();
        }

        let svd = h.svd(true, true);
        let (u, v_t) = match (svd.u, svd.v_t) {
            (Some(u), Some(v_t)) => (u, v_t),
            _ => return Isometry3::translation(c_t.x - c_s.x, c_t.y - c_s.y, c_t.z - c_s.z),
        };
        let mut r = u * v_t;
        if r.determinant() < 0.0 {
            let mut u_fix = u;
            u_fix.column_mut(2).neg_mut();
            r = u_fix * v_t;
        }

        let t = c_t - r * c_s;
        let rot = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
        Isometry3::from_parts(Translation3::from(t), rot)
    }

    /// 两个姿态之间的旋转残差（轴角向量），a 的局部坐标系下
    #[inline]
    pub fn orientation_residual(a: &UnitQuaternion<f64>, b: &UnitQuaternion<f64>) -> Vector3<f64> {
        (a.inverse() * b).scaled_axis()
    }

    /// 位姿 -> [tx, ty, tz, rx, ry, rz]
    #[inline]
    pub fn pose_to_params(pose: &Isometry3<f64>, out: &mut [f64]) {
        let t = pose.translation.vector;
        let r = pose.rotation.scaled_axis();
        out[..3].copy_from_slice(t.as_slice());
        out[3..6].copy_from_slice(r.as_slice());
    }

    #[inline]
    pub fn pose_from_params(params: &[f64]) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(params[0], params[1], params[2]),
            UnitQuaternion::from_scaled_axis(Vector3::new(params[3], params[4], params[5])),
        )
    }

    /// 中位数，偶数个元素时取中间两个的平均值
    pub fn median(values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) * 0.5)
        } else {
            Some(sorted[mid])
        }
    }

    /// 百分位数，相邻元素之间线性插值，`q` 取 0..=100
    pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::Utility;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Point3, Vector3};

    #[test]
    fn superimposition_recovers_rigid_motion() {
        let source = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(0.1, 0.0, 0.0),
            Point3::new(0.0, 0.2, 0.0),
            Point3::new(0.0, 0.0, 0.3),
            Point3::new(0.05, 0.07, -0.02),
        ];
        let pose = Isometry3::new(Vector3::new(0.3, -0.1, 0.5), Vector3::new(0.2, -0.4, 1.1));
        let target: Vec<_> = source.iter().map(|p| pose * p).collect();

        let found = Utility::superimposition(&source, &target);
        for (s, t) in source.iter().zip(target.iter()) {
            assert_relative_eq!(found * s, *t, epsilon = 1e-9);
        }
    }

    #[test]
    fn superimposition_never_reflects() {
        // 镜像点集：最优的刚体变换仍必须是正交旋转
        let source = vec![
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(0.0, 0.0, 0.0),
        ];
        let target: Vec<_> = source.iter().map(|p| Point3::new(-p.x, p.y, p.z)).collect();
        let found = Utility::superimposition(&source, &target);
        let r = found.rotation.to_rotation_matrix();
        assert_relative_eq!(r.matrix().determinant(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn pose_params_round_trip() {
        let pose = Isometry3::new(Vector3::new(1.0, 2.0, 3.0), Vector3::new(0.1, -0.2, 0.3));
        let mut params = [0.0; 6];
        Utility::pose_to_params(&pose, &mut params);
        let back = Utility::pose_from_params(&params);
        assert_relative_eq!(back, pose, epsilon = 1e-12);
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(Utility::median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(Utility::median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(Utility::median(&[]), None);
    }

    #[test]
    fn percentile_interpolates() {
        let values = [4.0, 0.0, 1.0, 2.0, 3.0];
        assert_eq!(Utility::percentile(&values, 0.0), Some(0.0));
        assert_eq!(Utility::percentile(&values, 100.0), Some(4.0));
        assert_relative_eq!(Utility::percentile(&values, 99.0).unwrap(), 3.96, epsilon = 1e-12);
        assert_eq!(Utility::percentile(&values, 50.0), Utility::median(&values));
    }
}
