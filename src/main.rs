use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use glovewise_rs::camera::MultiCameraModel;
use glovewise_rs::config::{MotionConfig, INITIAL_FRAME_TRIM};
use glovewise_rs::dataset::{read_record, ObservationSequence};
use glovewise_rs::estimator::{MotionSolver, TactileInput};
use glovewise_rs::kinematics::{hand, KinematicModel};
use glovewise_rs::save;
use glovewise_rs::skin::GloveSkin;
use glovewise_rs::tactile::{LinearTactileInterpolator, TactileLayout, TactileSequence};

/// 由多相机关键点检测（可选触觉信号）重建手套关节轨迹
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// 关键点检测序列 (YAML / JSON)
    #[arg(long)]
    detections: PathBuf,
    /// 参与求解的相机标定
    #[arg(long)]
    calibration: PathBuf,
    /// 留出评估的相机标定，缺省时与求解相机相同
    #[arg(long)]
    test_calibration: Option<PathBuf>,
    /// 运动学模型描述，缺省使用内置手模型
    #[arg(long)]
    model: Option<PathBuf>,
    /// 手套蒙皮，用于关键点相对连杆的偏移
    #[arg(long)]
    skin: Option<PathBuf>,
    /// 触觉序列 CSV
    #[arg(long)]
    tactile: Option<PathBuf>,
    /// 输出的轨迹记录
    #[arg(long, short)]
    output: PathBuf,
    /// 评估记录 CSV
    #[arg(long)]
    metrics: Option<PathBuf>,
    /// 求解参数 (YAML / JSON)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_nanos()
        .parse_default_env()
        .init();

    let args = Args::parse();
    log::info!("args: {:?}", args);

    let config: MotionConfig = match &args.config {
        Some(path) => read_record(path)?,
        None => MotionConfig::default(),
    };
    let model = match &args.model {
        Some(path) => KinematicModel::load(path)?,
        None => hand::default_hand()?,
    };
    let skin = args.skin.as_deref().map(GloveSkin::load).transpose()?;
    let solver = MotionSolver::new(model, skin.as_ref(), config)?;

    let solve_cameras = MultiCameraModel::load(&args.calibration)?;
    let test_cameras = match &args.test_calibration {
        Some(path) => MultiCameraModel::load(path)?,
        None => solve_cameras.clone(),
    };

    let mut sequence = ObservationSequence::load(&args.detections)?;
    sequence.trim_empty();
    sequence.drop_leading(INITIAL_FRAME_TRIM);
    sequence.fill_gaps();
    anyhow::ensure!(
        !sequence.is_empty(),
        "no observations left in {}",
        args.detections.display()
    );
    log::info!("observation sequence: {} frames", sequence.frames.len());

    let layout = TactileLayout::new();
    let interpolator = match &args.tactile {
        Some(path) => {
            let mut tactile = TactileSequence::load(path)?;
            tactile.process();
            let start = sequence.frames.first().map(|f| f.time).unwrap_or_default();
            let end = sequence.frames.last().map(|f| f.time);
            Some(LinearTactileInterpolator::new(&tactile, start, end))
        }
        None => None,
    };
    let tactile = interpolator.as_ref().map(|interpolator| TactileInput {
        interpolator,
        layout: &layout,
    });

    let trajectory = solver
        .compute_arm_trajectory(&solve_cameras, &sequence)
        .context("bootstrap failed")?;
    let (trajectory, metrics) = solver
        .optimize_joint_trajectory(&solve_cameras, &test_cameras, &trajectory, &sequence, tactile)
        .context("trajectory optimization failed")?;
    if let Some(last) = metrics.last() {
        log::info!(
            "final: reprojection {:.4} px, dimensional {:.6} m",
            last.reprojection_error,
            last.dimensional_error
        );
    }

    save::save_trajectory(&args.output, &solver, &trajectory)?;
    if let Some(path) = &args.metrics {
        save::save_metrics(path, &metrics)?;
    }
    Ok(())
}
