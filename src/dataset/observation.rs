use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{read_record, DatasetTrait};
use crate::config::GAP_FACTOR;
use crate::global_types::{CameraProjectionMap, KeypointId, Pixel};
use crate::utility::Utility;

/* 文件记录 */

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandRecord {
    /// keypoint -> camera -> [u, v]
    pub keypoints: BTreeMap<KeypointId, BTreeMap<String, [f64; 2]>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub time: f64,
    pub hand: HandRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationSequenceRecord {
    pub detections: Vec<DetectionRecord>,
}

/// 一帧观测
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationFrame {
    pub time: f64,
    pub keypoints: BTreeMap<KeypointId, CameraProjectionMap>,
}

impl ObservationFrame {
    /// 补帧用的空占位帧
    pub fn placeholder(time: f64) -> Self {
        Self {
            time,
            keypoints: BTreeMap::new(),
        }
    }

    /// 所有关键点都没有任何相机观测
    pub fn is_empty(&self) -> bool {
        self.keypoints.values().all(|m| m.is_empty())
    }

    pub fn observations(&self, keypoint: KeypointId) -> Option<&CameraProjectionMap> {
        self.keypoints.get(&keypoint)
    }
}

impl From<DetectionRecord> for ObservationFrame {
    fn from(record: DetectionRecord) -> Self {
        let keypoints = record
            .hand
            .keypoints
            .into_iter()
            .map(|(id, cams)| {
                let map = cams
                    .into_iter()
                    .map(|(cam, [u, v])| (cam, Pixel::new(u, v)))
                    .collect();
                (id, map)
            })
            .collect();
        Self {
            time: record.time,
            keypoints,
        }
    }
}

/// 观测序列，帧按时间严格递增
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObservationSequence {
    pub frames: Vec<ObservationFrame>,
}

impl ObservationSequence {
    pub fn new(frames: Vec<ObservationFrame>) -> Self {
        Self { frames }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let record: ObservationSequenceRecord = read_record(path)?;
        let sequence = Self::from(record);
        log::info!("loaded {} observation frames", sequence.frames.len());
        Ok(sequence)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// 相邻帧时间差的中位数
    pub fn median_interval(&self) -> Option<f64> {
        let deltas: Vec<f64> = self
            .frames
            .windows(2)
            .map(|w| w[1].time - w[0].time)
            .collect();
        Utility::median(&deltas)
    }

    /// 补帧：间隔超过中位数 1.5 倍的地方按中位数间隔插入空帧，原有帧不变
    pub fn fill_gaps(&mut self) {
        let dt = match self.median_interval() {
            Some(dt) if dt > 0.0 && dt.is_finite() => dt,
            _ => return,
        };
        let mut frames: Vec<ObservationFrame> = Vec::with_capacity(self.frames.len());
        let mut inserted = 0usize;
        for frame in self.frames.drain(..) {
            while let Some(last) = frames.last() {
                if frame.time - last.time <= dt * GAP_FACTOR {
                    break;
                }
                let t = last.time + dt;
                frames.push(ObservationFrame::placeholder(t));
                inserted += 1;
            }
            frames.push(frame);
        }
        self.frames = frames;
        log::info!("fill_gaps: dt {:.4}, {} frames inserted", dt, inserted);
    }

    /// 去掉首尾的空帧
    pub fn trim_empty(&mut self) {
        let first = self.frames.iter().position(|f| !f.is_empty());
        let last = self.frames.iter().rposition(|f| !f.is_empty());
        match (first, last) {
            (Some(first), Some(last)) => {
                self.frames.truncate(last + 1);
                self.frames.drain(..first);
            }
            _ => self.frames.clear(),
        }
    }

    /// 丢弃开头固定数量的帧
    pub fn drop_leading(&mut self, count: usize) {
        let count = count.min(self.frames.len());
        self.frames.drain(..count);
    }
}

impl From<ObservationSequenceRecord> for ObservationSequence {
    fn from(record: ObservationSequenceRecord) -> Self {
        Self::new(record.detections.into_iter().map(Into::into).collect())
    }
}

impl DatasetTrait for ObservationSequence {
    fn frames(&self) -> &[ObservationFrame] {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed_frame(time: f64) -> ObservationFrame {
        let mut cams = CameraProjectionMap::new();
        cams.insert("cam0".to_string(), Pixel::new(time, 2.0 * time));
        let mut keypoints = BTreeMap::new();
        keypoints.insert(4, cams);
        ObservationFrame { time, keypoints }
    }

    #[test]
    fn fill_gaps_inserts_missing_frames() {
        let mut sequence =
            ObservationSequence::new([0.0, 1.0, 2.0, 5.0, 6.0].map(observed_frame).to_vec());
        let original = sequence.clone();
        sequence.fill_gaps();

        let times: Vec<f64> = sequence.frames.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(sequence.frames[3].is_empty());
        assert!(sequence.frames[4].is_empty());
        assert!(sequence.frames[3].keypoints.is_empty());
        for frame in &original.frames {
            assert!(sequence.frames.contains(frame));
        }
    }

    #[test]
    fn fill_gaps_keeps_regular_sequence() {
        let mut sequence =
            ObservationSequence::new([0.0, 0.1, 0.2, 0.3].map(observed_frame).to_vec());
        let original = sequence.clone();
        sequence.fill_gaps();
        assert_eq!(sequence, original);
    }

    #[test]
    fn fill_gaps_ignores_degenerate_sequences() {
        let mut single = ObservationSequence::new(vec![observed_frame(1.0)]);
        single.fill_gaps();
        assert_eq!(single.len(), 1);

        let mut repeated = ObservationSequence::new([1.0, 1.0, 1.0, 3.0].map(observed_frame).to_vec());
        repeated.fill_gaps();
        assert_eq!(repeated.len(), 4);
    }

    #[test]
    fn empty_frames_are_trimmed_from_both_ends() {
        let mut sequence = ObservationSequence::new(vec![
            ObservationFrame::placeholder(0.0),
            observed_frame(1.0),
            ObservationFrame::placeholder(2.0),
            observed_frame(3.0),
            ObservationFrame::placeholder(4.0),
        ]);
        sequence.trim_empty();
        let times: Vec<f64> = sequence.frames.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);

        sequence.drop_leading(2);
        assert_eq!(sequence.frames[0].time, 3.0);
        sequence.drop_leading(10);
        assert!(sequence.is_empty());
    }

    #[test]
    fn frame_with_only_empty_maps_is_empty() {
        let mut frame = ObservationFrame::placeholder(0.0);
        frame.keypoints.insert(1, CameraProjectionMap::new());
        assert!(frame.is_empty());
        assert!(!observed_frame(0.0).is_empty());
    }

    #[test]
    fn parses_detection_record() {
        let text = r#"
detections:
  - time: 0.5
    hand:
      keypoints:
        4: {cam0: [10.0, 20.0], cam1: [11.0, 21.0]}
        8: {}
"#;
        let record: ObservationSequenceRecord = serde_yaml::from_str(text).unwrap();
        let sequence = ObservationSequence::from(record);
        let frame = &sequence.frames()[0];
        assert_eq!(frame.time, 0.5);
        assert_eq!(frame.observations(4).unwrap()["cam1"], Pixel::new(11.0, 21.0));
        assert!(frame.observations(8).unwrap().is_empty());
    }
}
