//! stackseg-io: TIFF I/O, model command backends, and the job workflow.
//!
//! Reads N-D TIFF and OME-TIFF stacks into arrays, writes label volumes
//! back as OME-TIFF, runs external segmentation models one slice at a
//! time, and drives a whole job from staged inputs to published
//! metrics.

pub mod command;
pub mod error;
pub mod job;
pub mod ome;
pub mod platform;
pub mod reader;
pub mod workflow;
pub mod writer;

pub use command::{CommandSegmenter, CommandTemplate, MicroSamConfig, ModelChoice, StarDistConfig};
pub use error::{IoError, WorkflowError};
pub use job::{JobReporter, JobStatus, JobUpdate, LogReporter};
pub use platform::{LocalPlatform, Platform, StagedData, StagedImage};
pub use reader::{RawImage, read_label_plane, read_volume};
pub use workflow::{
    Backend, BackendConfig, FailurePolicy, ImageOutcome, JobParameters, OutcomeStatus, RunSummary,
    StdClock, run,
};
pub use writer::{WrittenLabels, write_labels, write_slice};
