use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use killing_fusion::export::{dump_volume, save_mesh};
use killing_fusion::synthetic::MovingSphere;
use killing_fusion::{FusionConfig, IterationDiscipline, KillingFusion};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Discipline {
    Sync,
    Async,
}

/// Fuses a synthetic moving-sphere depth sequence into one canonical model.
#[derive(Debug, Parser)]
#[command(name = "killing-fusion", version)]
struct Cli {
    /// JSON configuration; defaults apply to anything it leaves out.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of frames in the synthetic sequence.
    #[arg(short, long, default_value_t = 10)]
    frames: usize,

    /// Directory for meshes, the final volume and the frame reports.
    #[arg(short, long, default_value = "output")]
    out: PathBuf,

    /// Overrides the configured iteration discipline.
    #[arg(long, value_enum)]
    discipline: Option<Discipline>,

    /// Also write every registered displacement field to `<out>/fields`.
    #[arg(long)]
    dump_fields: bool,

    /// Skip writing per-frame meshes.
    #[arg(long)]
    no_meshes: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FusionConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => FusionConfig::default(),
    };
    if let Some(discipline) = cli.discipline {
        config.registration.discipline = match discipline {
            Discipline::Sync => IterationDiscipline::Synchronous,
            Discipline::Async => IterationDiscipline::Asynchronous,
        };
    }

    fs::create_dir_all(&cli.out)
        .with_context(|| format!("failed to create {}", cli.out.display()))?;
    if cli.dump_fields {
        let dir = cli.out.join("fields");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        config.field_output_dir = Some(dir);
    }

    let source = MovingSphere {
        frames: cli.frames,
        ..MovingSphere::default()
    };
    let mut fusion = KillingFusion::new(source, config).context("invalid fusion setup")?;

    let pb = ProgressBar::new(fusion.remaining_frames() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("Fusing frames: [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );

    let mut reports = Vec::new();
    while let Some(output) = fusion
        .process_next_frame()
        .with_context(|| format!("frame {} failed", fusion.next_frame_index()))?
    {
        if !cli.no_meshes {
            let frame = output.report.frame;
            write_mesh(&cli.out, "input", frame, &output.meshes.input)?;
            write_mesh(&cli.out, "registered", frame, &output.meshes.registered)?;
            write_mesh(&cli.out, "canonical", frame, &output.meshes.canonical)?;
        }
        reports.push(output.report);
        pb.inc(1);
    }
    pb.finish_with_message("fusion complete");

    let report_path = cli.out.join("reports.json");
    fs::write(&report_path, serde_json::to_string_pretty(&reports)?)
        .with_context(|| format!("failed to write {}", report_path.display()))?;

    if let Some(canonical) = fusion.canonical() {
        let volume_path = cli.out.join("canonical.bin");
        dump_volume(canonical, &volume_path)
            .with_context(|| format!("failed to write {}", volume_path.display()))?;
        info!(
            path = %volume_path.display(),
            observed = canonical.observed_count(),
            "final canonical volume written"
        );
    }

    Ok(())
}

fn write_mesh(
    dir: &Path,
    name: &str,
    frame: usize,
    mesh: &killing_fusion::MeshData,
) -> Result<()> {
    let path = dir.join(format!("{}_{:03}.off", name, frame));
    save_mesh(mesh, &path).with_context(|| format!("failed to write {}", path.display()))
}

/// `RUST_LOG` selects the level (default `info`); set
/// `KILLING_FUSION_LOG_FORMAT=json` for newline-delimited JSON logs.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("KILLING_FUSION_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }
}
