//! 数据集处理
//!
//! 观测序列、标定等记录文件的读写；按扩展名选择 YAML（`.yaml`/`.yml`）或 JSON。
mod observation;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use observation::{
    DetectionRecord, HandRecord, ObservationFrame, ObservationSequence, ObservationSequenceRecord,
};

pub trait DatasetTrait {
    /// 按时间排序的观测帧
    fn frames(&self) -> &[ObservationFrame];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Yaml,
    Json,
}

impl RecordFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => RecordFormat::Json,
            _ => RecordFormat::Yaml,
        }
    }
}

pub fn read_record<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let record = match RecordFormat::from_path(path) {
        RecordFormat::Json => serde_json::from_reader(reader)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        RecordFormat::Yaml => serde_yaml::from_reader(reader)
            .with_context(|| format!("failed to parse {}", path.display()))?,
    };
    Ok(record)
}

pub fn write_record<T: Serialize>(path: &Path, record: &T) -> anyhow::Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let writer = BufWriter::new(file);
    match RecordFormat::from_path(path) {
        RecordFormat::Json => serde_json::to_writer_pretty(writer, record)?,
        RecordFormat::Yaml => serde_yaml::to_writer(writer, record)?,
    }
    log::info!("wrote {}", path.display());
    Ok(())
}
