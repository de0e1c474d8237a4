use std::collections::BTreeMap;

/// 关键点编号
pub type KeypointId = u32;

/// 像素坐标 (u, v)
pub type Pixel = nalgebra::Point2<f64>;

/// 相机名 -> 像素观测
pub type CameraProjectionMap = BTreeMap<String, Pixel>;

/// 以秒为单位的时间戳，可作为 map 的键。
///
/// 轨迹帧的时间直接拷贝自观测帧，因此按位比较即可匹配。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_sec(t: f64) -> Self {
        // -0.0 和 0.0 视为同一时刻
        let t = if t == 0.0 { 0.0 } else { t };
        Self(t.to_bits())
    }
    pub fn as_sec(&self) -> f64 {
        f64::from_bits(self.0)
    }
    /// dt
    pub fn duration_since(&self, other: &Timestamp) -> f64 {
        self.as_sec() - other.as_sec()
    }
}

impl From<f64> for Timestamp {
    fn from(t: f64) -> Self {
        Self::from_sec(t)
    }
}

#[test]
fn test_timestamp() {
    let t1 = Timestamp::from_sec(1.5);
    let t2 = Timestamp::from_sec(2.0);
    assert_eq!(t2.duration_since(&t1), 0.5);
    assert_eq!(Timestamp::from_sec(-0.0), Timestamp::from_sec(0.0));
    assert_eq!(Timestamp::from(1.5), t1);
}
