//! Where input images come from and where results go.
//!
//! [`Platform`] abstracts the three hand-off points of a job: staging
//! inputs, publishing label images, and publishing metrics.
//! [`LocalPlatform`] implements them on plain directories.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::Serialize;
use stackseg_pipeline::LabelVolume;
use tracing::{info, warn};

use crate::command::is_tiff;
use crate::error::{IoError, WorkflowError};
use crate::job::{JobReporter, JobUpdate, progress};
use crate::reader::read_volume;
use crate::workflow::{ImageOutcome, OutcomeStatus};

/// One input image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedImage {
    /// Location of the input file.
    pub path: PathBuf,
    /// File name, also used for the output.
    pub name: String,
    /// Matching ground-truth file, if any.
    pub ground_truth: Option<PathBuf>,
}

/// Inputs and directories of a job.
#[derive(Debug, Clone)]
pub struct StagedData {
    /// Images to process, sorted by name.
    pub inputs: Vec<StagedImage>,
    /// Input directory.
    pub in_dir: PathBuf,
    /// Ground-truth directory, if any.
    pub gt_dir: Option<PathBuf>,
    /// Output directory.
    pub out_dir: PathBuf,
    /// Scratch directory.
    pub tmp_dir: PathBuf,
}

/// Hand-off points between a workflow and its hosting platform.
pub trait Platform {
    /// Discover input images and prepare output and scratch directories.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Staging`] when a directory is missing or
    /// cannot be created.
    fn prepare_data(&self) -> Result<StagedData, WorkflowError>;

    /// Publish the label images listed in `outcomes`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Upload`] when publishing fails.
    fn upload_data(
        &self,
        staged: &StagedData,
        outcomes: &[ImageOutcome],
        reporter: &mut dyn JobReporter,
    ) -> Result<(), WorkflowError>;

    /// Compute and publish metrics for the run.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Upload`] when publishing fails.
    fn upload_metrics(
        &self,
        staged: &StagedData,
        outcomes: &[ImageOutcome],
    ) -> Result<(), WorkflowError>;
}

/// A platform backed by local directories.
#[derive(Debug, Clone)]
pub struct LocalPlatform {
    in_dir: PathBuf,
    gt_dir: Option<PathBuf>,
    out_dir: PathBuf,
    tmp_dir: PathBuf,
}

/// File written by [`LocalPlatform::upload_data`].
pub const MANIFEST_FILE: &str = "manifest.json";

/// File written by [`LocalPlatform::upload_metrics`].
pub const METRICS_FILE: &str = "metrics.json";

impl LocalPlatform {
    /// A platform reading `in_dir` and writing to `out_dir`.
    #[must_use]
    pub fn new(
        in_dir: impl Into<PathBuf>,
        gt_dir: Option<PathBuf>,
        out_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            in_dir: in_dir.into(),
            gt_dir,
            out_dir: out_dir.into(),
            tmp_dir: tmp_dir.into(),
        }
    }
}

fn staging(path: &Path) -> impl FnOnce(std::io::Error) -> WorkflowError + '_ {
    move |source| WorkflowError::Staging {
        path: path.to_path_buf(),
        source,
    }
}

fn upload(path: &Path) -> impl FnOnce(std::io::Error) -> WorkflowError + '_ {
    move |source| WorkflowError::Upload {
        path: path.to_path_buf(),
        source,
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), WorkflowError> {
    let file = File::create(path).map_err(upload(path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), value)
        .map_err(|e| upload(path)(std::io::Error::other(e)))
}

impl Platform for LocalPlatform {
    fn prepare_data(&self) -> Result<StagedData, WorkflowError> {
        let mut inputs = Vec::new();
        for entry in fs::read_dir(&self.in_dir).map_err(staging(&self.in_dir))? {
            let path = entry.map_err(staging(&self.in_dir))?.path();
            if !path.is_file() || !is_tiff(&path) {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            let ground_truth = self
                .gt_dir
                .as_ref()
                .map(|dir| dir.join(&name))
                .filter(|gt| gt.is_file());
            inputs.push(StagedImage {
                path,
                name,
                ground_truth,
            });
        }
        inputs.sort_by(|a, b| a.name.cmp(&b.name));

        fs::create_dir_all(&self.out_dir).map_err(staging(&self.out_dir))?;
        fs::create_dir_all(&self.tmp_dir).map_err(staging(&self.tmp_dir))?;

        info!(
            inputs = inputs.len(),
            in_dir = %self.in_dir.display(),
            "staged input images"
        );
        Ok(StagedData {
            inputs,
            in_dir: self.in_dir.clone(),
            gt_dir: self.gt_dir.clone(),
            out_dir: self.out_dir.clone(),
            tmp_dir: self.tmp_dir.clone(),
        })
    }

    fn upload_data(
        &self,
        staged: &StagedData,
        outcomes: &[ImageOutcome],
        reporter: &mut dyn JobReporter,
    ) -> Result<(), WorkflowError> {
        #[derive(Serialize)]
        struct Manifest<'a> {
            images: &'a [ImageOutcome],
        }

        let total = outcomes.len();
        for (done, outcome) in outcomes.iter().enumerate() {
            if let Some(output) = &outcome.output
                && !output.is_file()
            {
                return Err(upload(output)(std::io::Error::from(
                    std::io::ErrorKind::NotFound,
                )));
            }
            reporter.update(JobUpdate::running(
                progress::between(progress::UPLOAD_START, progress::UPLOAD_END, done + 1, total),
                format!("Published labels for {}", outcome.name),
            ));
        }
        write_json(
            &staged.out_dir.join(MANIFEST_FILE),
            &Manifest { images: outcomes },
        )
    }

    fn upload_metrics(
        &self,
        staged: &StagedData,
        outcomes: &[ImageOutcome],
    ) -> Result<(), WorkflowError> {
        let images: Vec<ImageMetrics> = outcomes
            .iter()
            .map(|outcome| {
                let ground_truth = staged
                    .inputs
                    .iter()
                    .find(|input| input.name == outcome.name)
                    .and_then(|input| input.ground_truth.as_deref())
                    .and_then(count_ground_truth);
                let predicted =
                    (outcome.status == OutcomeStatus::Segmented).then_some(outcome.object_count);
                ImageMetrics {
                    name: outcome.name.clone(),
                    predicted_objects: predicted,
                    ground_truth_objects: ground_truth,
                }
            })
            .collect();
        write_json(&staged.out_dir.join(METRICS_FILE), &Metrics { images })
    }
}

/// Per-image object counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageMetrics {
    /// Image file name.
    pub name: String,
    /// Objects in the predicted labels; `None` for skipped images.
    pub predicted_objects: Option<usize>,
    /// Objects in the ground truth, if one was available.
    pub ground_truth_objects: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Metrics {
    images: Vec<ImageMetrics>,
}

/// Objects in a ground-truth image, counted per `YX` plane like the
/// predictions.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count_ground_truth(path: &Path) -> Option<usize> {
    let counted = read_volume(path, None).and_then(|image| {
        let labels = image
            .axes
            .normalize(image.data.mapv(|v| if v > 0.0 { v as u32 } else { 0 }))
            .map_err(|e| IoError::axes(path, e))?;
        Ok(LabelVolume::from_canonical(labels).object_count())
    });
    match counted {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable ground truth");
            None
        }
    }
}
