//! Error types for file I/O and the job workflow.

use std::path::PathBuf;

use stackseg_pipeline::{AxisError, PipelineError};

/// Errors reading or writing image files.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    /// Filesystem error.
    #[error("I/O error on {}: {source}", path.display())]
    File {
        /// File being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TIFF codec rejected the file.
    #[error("TIFF error in {}: {source}", path.display())]
    Tiff {
        /// File being decoded or encoded.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: tiff::TiffError,
    },

    /// The file uses a pixel layout this crate does not handle.
    #[error("unsupported image layout in {}: {detail}", path.display())]
    Unsupported {
        /// Offending file.
        path: PathBuf,
        /// What was found.
        detail: String,
    },

    /// Pages of a multi-page file differ in size or sample layout.
    #[error("page {page} of {} differs from the first page", path.display())]
    InconsistentPages {
        /// Offending file.
        path: PathBuf,
        /// Zero-based page index.
        page: usize,
    },

    /// The axis metadata does not account for every page.
    #[error("{} has {pages} pages but its axes {axes} describe {expected}", path.display())]
    PageCount {
        /// Offending file.
        path: PathBuf,
        /// Pages in the file.
        pages: usize,
        /// Axis string in use.
        axes: String,
        /// Pages the axes call for.
        expected: usize,
    },

    /// The axes do not fit the data.
    #[error("axis error in {}: {source}", path.display())]
    Axes {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: AxisError,
    },
}

impl IoError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn tiff(path: impl Into<PathBuf>, source: tiff::TiffError) -> Self {
        Self::Tiff {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn axes(path: impl Into<PathBuf>, source: AxisError) -> Self {
        Self::Axes {
            path: path.into(),
            source,
        }
    }
}

/// Errors that end a workflow run.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Job parameters are invalid.
    #[error("invalid job parameters: {0}")]
    InvalidParameters(String),

    /// Input, output or scratch directories could not be prepared.
    #[error("failed to prepare {}: {source}", path.display())]
    Staging {
        /// Directory or file involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Results or metrics could not be written.
    #[error("failed to publish {}: {source}", path.display())]
    Upload {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An image could not be read or written.
    #[error("image {name}: {source}")]
    Image {
        /// Image file name.
        name: String,
        /// Underlying error.
        #[source]
        source: IoError,
    },

    /// Segmenting an image failed.
    #[error("image {name}: {source}")]
    Pipeline {
        /// Image file name.
        name: String,
        /// Underlying error.
        #[source]
        source: PipelineError,
    },
}
