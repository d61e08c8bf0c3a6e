//! The job workflow: stage inputs, segment every image, publish results.
//!
//! ```text
//! prepare_data -> for each image:
//!                   read_volume -> segment_volume -> write_labels
//!              -> upload_data -> upload_metrics
//! ```
//!
//! Images are processed one at a time. Each gets its own scratch
//! directory under the staged tmp dir, removed when the image is done
//! whether it succeeded or not.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use stackseg_pipeline::diagnostics::{Clock, VolumeDiagnostics};
use stackseg_pipeline::{
    Axes, Modality, PipelineConfig, PipelineError, Segmenter, ThresholdSegmenter, Volume,
    segment_volume_with_progress,
};
use tracing::{debug, info, warn};

use crate::command::{
    CommandSegmenter, CommandTemplate, MicroSamConfig, ModelChoice, StarDistConfig,
};
use crate::error::{IoError, WorkflowError};
use crate::job::{JobReporter, JobStatus, JobUpdate, progress};
use crate::platform::{Platform, StagedData, StagedImage};
use crate::reader::read_volume;
use crate::writer::write_labels;

/// [`Clock`] implementation backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// What to do when one image fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark the job failed and stop.
    #[default]
    Abort,
    /// Record the failure and continue with the next image.
    Skip,
}

/// A segmenter the workflow can point at a per-image scratch directory.
pub trait Backend: Segmenter {
    /// Called before each image with that image's scratch directory.
    fn use_scratch(&mut self, _dir: &Path) {}
}

impl Backend for ThresholdSegmenter {}

impl Backend for CommandSegmenter {
    fn use_scratch(&mut self, dir: &Path) {
        self.set_scratch(dir);
    }
}

/// Which segmentation backend to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// `stardist-predict2d`.
    Stardist(StarDistConfig),
    /// `micro_sam.automatic_segmentation`.
    MicroSam(MicroSamConfig),
    /// An arbitrary command template.
    Command {
        /// Program and arguments.
        template: CommandTemplate,
        /// Value of `{model}`.
        #[serde(default)]
        models: ModelChoice,
    },
    /// Built-in Otsu threshold with connected components.
    Threshold(ThresholdSegmenter),
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Stardist(StarDistConfig::default())
    }
}

impl BackendConfig {
    /// Construct the backend for a job using `pipeline`.
    #[must_use]
    pub fn build(&self, pipeline: &PipelineConfig) -> Box<dyn Backend> {
        match self {
            Self::Stardist(config) => Box::new(config.segmenter(pipeline)),
            Self::MicroSam(config) => Box::new(config.segmenter()),
            Self::Command { template, models } => Box::new(CommandSegmenter::new(
                "command",
                template.clone(),
                models.clone(),
            )),
            Self::Threshold(segmenter) => Box::new(*segmenter),
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            Self::Stardist(config) => {
                for (name, value) in [
                    ("prob_thresh", config.prob_thresh),
                    ("nms_thresh", config.nms_thresh),
                ] {
                    if !(0.0..=1.0).contains(&value) {
                        return Err(format!("{name} must be in [0, 1], got {value}"));
                    }
                }
                Ok(())
            }
            Self::MicroSam(config) => {
                if config.batch_size == 0 {
                    return Err("batch_size must be at least 1".to_owned());
                }
                if config.halo.is_some() && config.tile_shape.is_none() {
                    return Err("halo requires tile_shape".to_owned());
                }
                Ok(())
            }
            Self::Command { template, .. } => {
                if template.program.trim().is_empty() {
                    return Err("command program is empty".to_owned());
                }
                Ok(())
            }
            Self::Threshold(_) => Ok(()),
        }
    }
}

/// All parameters of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParameters {
    /// Slicing and pre-processing.
    #[serde(flatten)]
    pub pipeline: PipelineConfig,
    /// Axis order to use instead of file metadata.
    pub axes: Option<Axes>,
    /// Segmentation backend.
    pub backend: BackendConfig,
    /// Reaction to a failing image.
    pub on_error: FailurePolicy,
}

impl JobParameters {
    /// Check every parameter before any image is touched.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::InvalidParameters`] describing the first
    /// problem found.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        self.pipeline
            .validate()
            .map_err(|e| WorkflowError::InvalidParameters(e.to_string()))?;
        self.backend
            .validate()
            .map_err(WorkflowError::InvalidParameters)
    }

    /// Construct the configured backend.
    #[must_use]
    pub fn build_backend(&self) -> Box<dyn Backend> {
        self.backend.build(&self.pipeline)
    }
}

/// Result of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Labels were written.
    Segmented,
    /// The image failed and was skipped.
    Skipped,
}

/// What happened to one input image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageOutcome {
    /// Input file name.
    pub name: String,
    /// Input path.
    pub input: PathBuf,
    /// Label image path, when written.
    pub output: Option<PathBuf>,
    /// Whether labels were produced.
    pub status: OutcomeStatus,
    /// Failure message for skipped images.
    pub error: Option<String>,
    /// Axis order of the label image.
    pub axes: Option<String>,
    /// Detected modality.
    pub modality: Option<Modality>,
    /// Objects in the written labels, counted per `YX` plane
    /// (see [`LabelVolume::object_count`](stackseg_pipeline::LabelVolume::object_count)).
    pub object_count: usize,
    /// Per-slice diagnostics.
    pub diagnostics: Option<VolumeDiagnostics>,
}

impl ImageOutcome {
    fn skipped(image: &StagedImage, error: &WorkflowError) -> Self {
        Self {
            name: image.name.clone(),
            input: image.path.clone(),
            output: None,
            status: OutcomeStatus::Skipped,
            error: Some(error.to_string()),
            axes: None,
            modality: None,
            object_count: 0,
            diagnostics: None,
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// One entry per input image, in processing order.
    pub outcomes: Vec<ImageOutcome>,
}

impl RunSummary {
    /// Images whose labels were written.
    #[must_use]
    pub fn segmented(&self) -> usize {
        self.count(OutcomeStatus::Segmented)
    }

    /// Images skipped after a failure.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(OutcomeStatus::Skipped)
    }

    fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Forwards updates and remembers the last progress value.
struct Tracked<'a> {
    inner: &'a mut dyn JobReporter,
    progress: u8,
}

impl JobReporter for Tracked<'_> {
    fn update(&mut self, update: JobUpdate) {
        self.progress = update.progress;
        self.inner.update(update);
    }
}

/// Run a job end to end.
///
/// On error the reporter receives a final [`JobStatus::Failed`] update
/// before the error is returned.
///
/// # Errors
///
/// Returns [`WorkflowError`] for invalid parameters, staging and upload
/// failures, and image failures under [`FailurePolicy::Abort`].
pub fn run(
    params: &JobParameters,
    platform: &dyn Platform,
    backend: &mut dyn Backend,
    reporter: &mut dyn JobReporter,
) -> Result<RunSummary, WorkflowError> {
    let mut tracked = Tracked {
        inner: reporter,
        progress: progress::INIT,
    };
    tracked.update(JobUpdate::running(progress::INIT, "Initialization..."));

    let result = run_job(params, platform, backend, &mut tracked);
    if let Err(e) = &result {
        let progress = tracked.progress;
        tracked.update(JobUpdate {
            status: JobStatus::Failed,
            progress,
            comment: e.to_string(),
        });
    }
    result
}

fn run_job(
    params: &JobParameters,
    platform: &dyn Platform,
    backend: &mut dyn Backend,
    reporter: &mut dyn JobReporter,
) -> Result<RunSummary, WorkflowError> {
    params.validate()?;
    let staged = platform.prepare_data()?;

    reporter.update(JobUpdate::running(
        progress::LAUNCH,
        format!("Launching workflow on {} images...", staged.inputs.len()),
    ));
    reporter.update(JobUpdate::running(
        progress::PROCESSING,
        format!(
            "Processing with backend {}, channels {}, z_slices {}, time_points {}",
            backend.name(),
            params.pipeline.channels,
            params.pipeline.z_slices,
            params.pipeline.time_points,
        ),
    ));

    let mut outcomes = Vec::with_capacity(staged.inputs.len());
    for image in &staged.inputs {
        match process_image(image, params, &staged, backend, reporter) {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => match params.on_error {
                FailurePolicy::Abort => return Err(e),
                FailurePolicy::Skip => {
                    warn!(image = %image.name, error = %e, "skipping image");
                    reporter.update(JobUpdate::running(
                        progress::PROCESSING,
                        format!("Skipped {}: {e}", image.name),
                    ));
                    outcomes.push(ImageOutcome::skipped(image, &e));
                }
            },
        }
    }

    reporter.update(JobUpdate::running(
        progress::UPLOAD_START,
        "Publishing label images...",
    ));
    platform.upload_data(&staged, &outcomes, reporter)?;

    reporter.update(JobUpdate::running(
        progress::UPLOAD_END,
        "Computing and uploading metrics...",
    ));
    platform.upload_metrics(&staged, &outcomes)?;

    reporter.update(JobUpdate {
        status: JobStatus::Terminated,
        progress: progress::DONE,
        comment: "Finished.".to_owned(),
    });
    Ok(RunSummary { outcomes })
}

fn process_image(
    image: &StagedImage,
    params: &JobParameters,
    staged: &StagedData,
    backend: &mut dyn Backend,
    reporter: &mut dyn JobReporter,
) -> Result<ImageOutcome, WorkflowError> {
    let scratch = tempfile::Builder::new()
        .prefix("stackseg-")
        .tempdir_in(&staged.tmp_dir)
        .map_err(|source| WorkflowError::Staging {
            path: staged.tmp_dir.clone(),
            source,
        })?;
    backend.use_scratch(scratch.path());

    let image_error = |source: IoError| WorkflowError::Image {
        name: image.name.clone(),
        source,
    };
    let pipeline_error = |source: PipelineError| WorkflowError::Pipeline {
        name: image.name.clone(),
        source,
    };

    let raw = read_volume(&image.path, params.axes.as_ref()).map_err(image_error)?;
    reporter.update(JobUpdate::running(
        progress::PROCESSING,
        format!(
            "{}: shape {:?}, axes {}",
            image.name,
            raw.data.shape(),
            raw.axes
        ),
    ));

    let input_axes = raw.axes.clone();
    let volume = Volume::new(raw.data, raw.axes).map_err(|e| pipeline_error(e.into()))?;
    let (labels, diagnostics) = segment_volume_with_progress(
        &volume,
        &params.pipeline,
        backend,
        &StdClock,
        |p| {
            debug!(image = %image.name, done = p.done, total = p.total, "slice done");
        },
    )
    .map_err(pipeline_error)?;

    let object_count = labels.object_count();
    let output = staged.out_dir.join(&image.name);
    let written =
        write_labels(&output, &labels, &input_axes, &image.name).map_err(image_error)?;
    reporter.update(JobUpdate::running(
        progress::PROCESSING,
        format!(
            "{}: {} objects, maximum label {}, labels {:?} as {}",
            image.name,
            object_count,
            labels.max_label(),
            labels.shape(),
            written.axes
        ),
    ));

    if let Err(e) = scratch.close() {
        warn!(image = %image.name, error = %e, "failed to remove scratch directory");
    }
    info!(image = %image.name, output = %output.display(), "segmented image");

    Ok(ImageOutcome {
        name: image.name.clone(),
        input: image.path.clone(),
        output: Some(output),
        status: OutcomeStatus::Segmented,
        error: None,
        axes: Some(written.axes.to_string()),
        modality: Some(volume.modality()),
        object_count,
        diagnostics: Some(diagnostics),
    })
}
