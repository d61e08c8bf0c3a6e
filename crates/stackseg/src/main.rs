//! stackseg: segment every TIFF stack in a folder, slice by slice.
//!
//! Follows the BIAFLOWS folder convention: images are read from
//! `--infolder`, label images with the same file names are written to
//! `--outfolder`, and object-count metrics are computed against
//! `--gtfolder` when it is given.
//!
//! # Usage
//!
//! ```text
//! stackseg --infolder in/ --outfolder out/ [--gtfolder gt/] [OPTIONS]
//! stackseg --infolder in/ --outfolder out/ --parameters job.json
//! ```

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use stackseg_io::command::MicroSamMode;
use stackseg_io::{
    BackendConfig, FailurePolicy, JobParameters, LocalPlatform, LogReporter, MicroSamConfig,
    RunSummary, StarDistConfig,
};
use stackseg_pipeline::{
    Axes, OutputLayout, PipelineConfig, ScaleFilter, Selection, ThresholdSegmenter,
};
use tracing_subscriber::EnvFilter;

/// Slice-wise 2D instance segmentation of N-D microscopy stacks.
///
/// Each selected (time point, focal plane, channel) plane of every input
/// image is segmented independently and the labels are reassembled into
/// an OME-TIFF volume.
#[derive(Parser)]
#[command(name = "stackseg", version)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Folder containing the input TIFF images.
    #[arg(long)]
    infolder: PathBuf,

    /// Folder receiving the label images, manifest and metrics.
    #[arg(long)]
    outfolder: PathBuf,

    /// Folder with ground-truth label images named like the inputs.
    #[arg(long)]
    gtfolder: Option<PathBuf>,

    /// Scratch folder (defaults to the system temp directory).
    #[arg(long)]
    tmpfolder: Option<PathBuf>,

    /// Job parameters as a JSON file.
    ///
    /// When provided, all other job parameter flags are ignored.
    #[arg(long, conflicts_with = "parameters_json")]
    parameters: Option<PathBuf>,

    /// Job parameters as a JSON string.
    ///
    /// When provided, all other job parameter flags are ignored.
    #[arg(long)]
    parameters_json: Option<String>,

    /// Segmentation backend.
    #[arg(long, value_enum, default_value_t = BackendKind::Stardist)]
    backend: BackendKind,

    /// Channels to segment: "all", an index, a list ("0,2") or a range ("1-3").
    ///
    /// An empty or malformed value selects channel 0.
    #[arg(long, default_value = "all")]
    channels: String,

    /// Focal planes to segment.
    #[arg(long, default_value = "all")]
    z_slices: Selection,

    /// Time points to segment.
    #[arg(long, default_value = "all")]
    time_points: Selection,

    /// Axis order of the inputs (e.g. "TZCYX"), overriding file metadata.
    #[arg(long)]
    axes: Option<Axes>,

    /// Downscale factor in (0, 1] applied before inference.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_SCALE_FACTOR)]
    scale_factor: f64,

    /// Resampling filter for downscaling.
    #[arg(long, value_enum, default_value_t = Filter::Triangle)]
    scale_filter: Filter,

    /// Skip percentile normalization before inference.
    #[arg(long)]
    no_normalize: bool,

    /// Lower normalization percentile.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_NORM_LOW)]
    norm_low: f32,

    /// Upper normalization percentile.
    #[arg(long, default_value_t = PipelineConfig::DEFAULT_NORM_HIGH)]
    norm_high: f32,

    /// Keep unselected positions as background in the output.
    #[arg(long)]
    full_layout: bool,

    /// StarDist probability threshold.
    #[arg(long, default_value_t = 0.5)]
    prob_thresh: f32,

    /// StarDist non-maximum suppression threshold.
    #[arg(long, default_value_t = 0.4)]
    nms_thresh: f32,

    /// micro-sam model type.
    #[arg(long, default_value = "vit_b_lm")]
    model_type: String,

    /// micro-sam segmentation mode.
    #[arg(long, value_enum, default_value_t = Mode::Amg)]
    mode: Mode,

    /// micro-sam tile shape, height then width.
    #[arg(long, num_args = 2, value_names = ["H", "W"])]
    tile_shape: Option<Vec<usize>>,

    /// micro-sam tile halo, height then width.
    #[arg(long, num_args = 2, value_names = ["H", "W"], requires = "tile_shape")]
    halo: Option<Vec<usize>>,

    /// Continue with the next image when one fails.
    #[arg(long)]
    skip_failed: bool,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Print per-slice diagnostics for every segmented image.
    #[arg(long)]
    report: bool,

    /// Log at debug level (overridden by `RUST_LOG`).
    #[arg(short, long)]
    verbose: bool,
}

/// Backend selection.
#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// StarDist 2D pretrained models.
    Stardist,
    /// micro-sam automatic segmentation.
    MicroSam,
    /// Built-in Otsu threshold, no model required.
    Threshold,
}

/// micro-sam mode selection.
#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Automatic mask generation.
    Amg,
    /// Automatic instance segmentation.
    Ais,
}

/// Downscale filter selection.
#[derive(Clone, Copy, ValueEnum)]
enum Filter {
    /// Nearest-neighbor.
    Nearest,
    /// Bilinear.
    Triangle,
    /// Bicubic Catmull-Rom.
    CatmullRom,
    /// Gaussian.
    Gaussian,
    /// Lanczos with 3 lobes.
    Lanczos3,
}

fn pair(values: Option<&Vec<usize>>) -> Option<[usize; 2]> {
    values.and_then(|v| <[usize; 2]>::try_from(v.as_slice()).ok())
}

/// Build [`JobParameters`] from CLI arguments.
///
/// A parameter file or JSON string takes precedence over the individual
/// flags.
fn parameters_from_cli(cli: &Cli) -> Result<JobParameters, String> {
    if let Some(ref path) = cli.parameters {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Error reading {}: {e}", path.display()))?;
        return serde_json::from_str(&text)
            .map_err(|e| format!("Error parsing {}: {e}", path.display()));
    }
    if let Some(ref json) = cli.parameters_json {
        return serde_json::from_str(json)
            .map_err(|e| format!("Error parsing --parameters-json: {e}"));
    }

    let backend = match cli.backend {
        BackendKind::Stardist => BackendConfig::Stardist(StarDistConfig {
            prob_thresh: cli.prob_thresh,
            nms_thresh: cli.nms_thresh,
            ..StarDistConfig::default()
        }),
        BackendKind::MicroSam => BackendConfig::MicroSam(MicroSamConfig {
            model_type: cli.model_type.clone(),
            mode: match cli.mode {
                Mode::Amg => MicroSamMode::Amg,
                Mode::Ais => MicroSamMode::Ais,
            },
            tile_shape: pair(cli.tile_shape.as_ref()),
            halo: pair(cli.halo.as_ref()),
            ..MicroSamConfig::default()
        }),
        BackendKind::Threshold => BackendConfig::Threshold(ThresholdSegmenter::default()),
    };

    Ok(JobParameters {
        pipeline: PipelineConfig {
            channels: Selection::channels_or_first(&cli.channels),
            z_slices: cli.z_slices.clone(),
            time_points: cli.time_points.clone(),
            scale_factor: cli.scale_factor,
            scale_filter: match cli.scale_filter {
                Filter::Nearest => ScaleFilter::Nearest,
                Filter::Triangle => ScaleFilter::Triangle,
                Filter::CatmullRom => ScaleFilter::CatmullRom,
                Filter::Gaussian => ScaleFilter::Gaussian,
                Filter::Lanczos3 => ScaleFilter::Lanczos3,
            },
            normalize: !cli.no_normalize,
            norm_low: cli.norm_low,
            norm_high: cli.norm_high,
            layout: if cli.full_layout {
                OutputLayout::Full
            } else {
                OutputLayout::Compact
            },
        },
        axes: cli.axes.clone(),
        backend,
        on_error: if cli.skip_failed {
            FailurePolicy::Skip
        } else {
            FailurePolicy::Abort
        },
    })
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_summary(summary: &RunSummary, report: bool) {
    for outcome in &summary.outcomes {
        match (&outcome.output, &outcome.error) {
            (Some(output), _) => println!(
                "{}: {} objects -> {}",
                outcome.name,
                outcome.object_count,
                output.display(),
            ),
            (None, Some(error)) => println!("{}: skipped ({error})", outcome.name),
            (None, None) => println!("{}: skipped", outcome.name),
        }
        if report && let Some(diagnostics) = &outcome.diagnostics {
            println!("{}", diagnostics.report());
        }
    }
    println!(
        "{} segmented, {} skipped",
        summary.segmented(),
        summary.skipped(),
    );
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let params = match parameters_from_cli(&cli) {
        Ok(p) => p,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let tmp_dir = cli
        .tmpfolder
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("stackseg"));
    let platform = LocalPlatform::new(
        cli.infolder.clone(),
        cli.gtfolder.clone(),
        cli.outfolder.clone(),
        tmp_dir,
    );
    let mut backend = params.build_backend();
    let mut reporter = LogReporter::default();

    let summary = match stackseg_io::run(&params, &platform, backend.as_mut(), &mut reporter) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Job failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing summary: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_summary(&summary, cli.report);
    }

    ExitCode::SUCCESS
}
