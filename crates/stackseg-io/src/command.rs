//! Segmentation backends that run an external model command per slice.
//!
//! Each slice is written to `input.tif` in a scratch directory, the
//! command is run to completion, and the label image it leaves behind is
//! read back. Command lines are templates with these placeholders:
//!
//! | placeholder | value |
//! |-------------|-------|
//! | `{input}` | path of the slice TIFF |
//! | `{output}` | expected path of the label TIFF |
//! | `{output_dir}` | directory holding `{output}` |
//! | `{output_name}` | file name of `{output}` |
//! | `{embeddings}` | per-slice embedding cache path |
//! | `{model}` | model for the slice's modality |

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use stackseg_pipeline::{LabelPlane, PipelineConfig, SegmentError, Segmenter, Slice, SliceIndex};
use tracing::{debug, warn};

use crate::reader::read_label_plane;
use crate::writer::write_slice;

const INPUT_NAME: &str = "input.tif";
const OUTPUT_NAME: &str = "labels.tif";
const STDERR_TAIL_LINES: usize = 20;

/// A program and its argument templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    /// Executable name or path.
    pub program: String,
    /// Arguments, each possibly containing placeholders.
    pub args: Vec<String>,
}

/// Values substituted into a [`CommandTemplate`].
#[derive(Debug, Clone)]
pub struct Placeholders<'a> {
    /// `{input}`.
    pub input: &'a Path,
    /// `{output}`.
    pub output: &'a Path,
    /// `{embeddings}`.
    pub embeddings: &'a Path,
    /// `{model}`.
    pub model: &'a str,
}

impl CommandTemplate {
    /// Substitute placeholders into every argument.
    #[must_use]
    pub fn render(&self, values: &Placeholders<'_>) -> Vec<String> {
        let output_dir = values.output.parent().unwrap_or_else(|| Path::new("."));
        let output_name = values
            .output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &values.input.to_string_lossy())
                    .replace("{output_dir}", &output_dir.to_string_lossy())
                    .replace("{output_name}", &output_name)
                    .replace("{output}", &values.output.to_string_lossy())
                    .replace("{embeddings}", &values.embeddings.to_string_lossy())
                    .replace("{model}", values.model)
            })
            .collect()
    }

    /// Whether any argument asks for the embedding cache.
    #[must_use]
    pub fn uses_embeddings(&self) -> bool {
        self.args.iter().any(|a| a.contains("{embeddings}"))
    }
}

/// Which model to pass as `{model}` for each modality.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelChoice {
    /// Model for one-sample slices.
    pub grayscale: String,
    /// Model for three-sample color slices.
    pub color: String,
}

impl ModelChoice {
    /// The same model for both modalities.
    #[must_use]
    pub fn single(model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            grayscale: model.clone(),
            color: model,
        }
    }

    fn for_slice(&self, slice: &Slice) -> &str {
        if slice.samples() >= 3 {
            &self.color
        } else {
            &self.grayscale
        }
    }
}

/// micro-sam automatic segmentation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicroSamMode {
    /// Automatic mask generation.
    #[default]
    Amg,
    /// Automatic instance segmentation (decoder-based).
    Ais,
}

impl MicroSamMode {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Amg => "amg",
            Self::Ais => "ais",
        }
    }
}

/// Parameters for `micro_sam.automatic_segmentation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroSamConfig {
    /// Executable.
    pub program: String,
    /// SAM model type, e.g. `vit_b_lm`.
    pub model_type: String,
    /// Segmentation mode.
    pub mode: MicroSamMode,
    /// Tile shape `[height, width]` for tiled prediction.
    pub tile_shape: Option<[usize; 2]>,
    /// Overlap `[height, width]` between tiles.
    pub halo: Option<[usize; 2]>,
    /// Tiles embedded per batch.
    pub batch_size: usize,
}

impl Default for MicroSamConfig {
    fn default() -> Self {
        Self {
            program: "micro_sam.automatic_segmentation".to_owned(),
            model_type: "vit_b_lm".to_owned(),
            mode: MicroSamMode::default(),
            tile_shape: None,
            halo: None,
            batch_size: 1,
        }
    }
}

impl MicroSamConfig {
    /// Command template for this configuration.
    #[must_use]
    pub fn template(&self) -> CommandTemplate {
        let mut args: Vec<String> = [
            "-i",
            "{input}",
            "-o",
            "{output}",
            "-e",
            "{embeddings}",
            "-m",
            "{model}",
            "--mode",
            self.mode.as_str(),
        ]
        .into_iter()
        .map(str::to_owned)
        .collect();
        if let Some([h, w]) = self.tile_shape {
            let [halo_h, halo_w] = self.halo.unwrap_or([0, 0]);
            args.extend([
                "--tile_shape".to_owned(),
                h.to_string(),
                w.to_string(),
                "--halo".to_owned(),
                halo_h.to_string(),
                halo_w.to_string(),
            ]);
        }
        args.extend(["--batch_size".to_owned(), self.batch_size.to_string()]);
        CommandTemplate {
            program: self.program.clone(),
            args,
        }
    }

    /// Build the segmenter.
    #[must_use]
    pub fn segmenter(&self) -> CommandSegmenter {
        CommandSegmenter::new(
            "micro_sam",
            self.template(),
            ModelChoice::single(&self.model_type),
        )
    }
}

/// Parameters for `stardist-predict2d`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarDistConfig {
    /// Executable.
    pub program: String,
    /// Model for fluorescence (grayscale) slices.
    pub fluo_model: String,
    /// Model for H&E (color) slices.
    pub he_model: String,
    /// Object probability threshold.
    pub prob_thresh: f32,
    /// Non-maximum suppression overlap threshold.
    pub nms_thresh: f32,
}

impl Default for StarDistConfig {
    fn default() -> Self {
        Self {
            program: "stardist-predict2d".to_owned(),
            fluo_model: "2D_versatile_fluo".to_owned(),
            he_model: "2D_versatile_he".to_owned(),
            prob_thresh: 0.5,
            nms_thresh: 0.4,
        }
    }
}

impl StarDistConfig {
    /// Percentiles `stardist-predict2d` should normalize with: the job's
    /// own percentiles, or the full range when normalization is off.
    #[must_use]
    pub const fn percentiles(pipeline: &PipelineConfig) -> [f32; 2] {
        if pipeline.normalize {
            [pipeline.norm_low, pipeline.norm_high]
        } else {
            [0.0, 100.0]
        }
    }

    /// Command template normalizing with `percentiles`.
    #[must_use]
    pub fn template(&self, percentiles: [f32; 2]) -> CommandTemplate {
        let [low, high] = percentiles;
        let args = [
            "-i".to_owned(),
            "{input}".to_owned(),
            "-o".to_owned(),
            "{output_dir}".to_owned(),
            "-m".to_owned(),
            "{model}".to_owned(),
            "--prob_thresh".to_owned(),
            self.prob_thresh.to_string(),
            "--nms_thresh".to_owned(),
            self.nms_thresh.to_string(),
            "--pnorm".to_owned(),
            low.to_string(),
            high.to_string(),
            "--outname".to_owned(),
            "{output_name}".to_owned(),
        ];
        CommandTemplate {
            program: self.program.clone(),
            args: args.to_vec(),
        }
    }

    /// Build the segmenter. `stardist-predict2d` normalizes every input
    /// itself, so it receives raw slices and the job's percentiles.
    #[must_use]
    pub fn segmenter(&self, pipeline: &PipelineConfig) -> CommandSegmenter {
        let mut segmenter = CommandSegmenter::new(
            "stardist",
            self.template(Self::percentiles(pipeline)),
            ModelChoice {
                grayscale: self.fluo_model.clone(),
                color: self.he_model.clone(),
            },
        );
        segmenter.normalizes_input = true;
        segmenter
    }
}

/// Embedding cache paths, one per slice.
#[derive(Debug, Default)]
struct EmbeddingCache {
    paths: HashMap<SliceIndex, PathBuf>,
}

impl EmbeddingCache {
    /// Path for `index` and whether it was handed out before.
    fn path_for(&mut self, root: &Path, index: SliceIndex) -> (PathBuf, bool) {
        if let Some(path) = self.paths.get(&index) {
            return (path.clone(), true);
        }
        let path = root
            .join("embeddings")
            .join(format!("t{}_z{}_c{}.zarr", index.t, index.z, index.c));
        self.paths.insert(index, path.clone());
        (path, false)
    }
}

/// A [`Segmenter`] that shells out to a model command.
#[derive(Debug)]
pub struct CommandSegmenter {
    name: String,
    template: CommandTemplate,
    models: ModelChoice,
    scratch: PathBuf,
    embeddings: EmbeddingCache,
    normalizes_input: bool,
}

impl CommandSegmenter {
    /// A segmenter using the system temp directory until
    /// [`set_scratch`](Self::set_scratch) is called.
    #[must_use]
    pub fn new(name: impl Into<String>, template: CommandTemplate, models: ModelChoice) -> Self {
        Self {
            name: name.into(),
            template,
            models,
            scratch: std::env::temp_dir(),
            embeddings: EmbeddingCache::default(),
            normalizes_input: false,
        }
    }

    /// Point the segmenter at a new scratch directory, forgetting cached
    /// embeddings from the previous one.
    pub fn set_scratch(&mut self, dir: &Path) {
        self.scratch = dir.to_path_buf();
        self.embeddings = EmbeddingCache::default();
    }

    /// The command template.
    #[must_use]
    pub const fn template(&self) -> &CommandTemplate {
        &self.template
    }

    fn run(&self, args: &[String]) -> Result<(), SegmentError> {
        debug!(program = %self.template.program, ?args, "running model command");
        let output = Command::new(&self.template.program)
            .args(args)
            .output()
            .map_err(|source| SegmentError::Spawn {
                program: self.template.program.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(SegmentError::CommandFailed {
            program: self.template.program.clone(),
            status: output.status.to_string(),
            stderr: tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_LINES),
        })
    }
}

impl Segmenter for CommandSegmenter {
    fn name(&self) -> &str {
        &self.name
    }

    fn normalizes_input(&self) -> bool {
        self.normalizes_input
    }

    fn segment(&mut self, slice: &Slice, index: SliceIndex) -> Result<LabelPlane, SegmentError> {
        let input = self.scratch.join(INPUT_NAME);
        let output_dir = self.scratch.join("output");
        let output = output_dir.join(OUTPUT_NAME);
        fs::create_dir_all(&output_dir)?;
        remove_if_present(&output);

        write_slice(&input, slice).map_err(|e| SegmentError::Backend(e.to_string()))?;

        let (embeddings, reused) = self.embeddings.path_for(&self.scratch, index);
        if self.template.uses_embeddings() {
            if let Some(parent) = embeddings.parent() {
                fs::create_dir_all(parent)?;
            }
            debug!(%index, reused, path = %embeddings.display(), "embedding cache");
        }

        let args = self.template.render(&Placeholders {
            input: &input,
            output: &output,
            embeddings: &embeddings,
            model: self.models.for_slice(slice),
        });
        let result = self.run(&args).and_then(|()| collect_output(&output, &output_dir));

        remove_if_present(&input);
        remove_if_present(&output);
        result
    }
}

/// Read the label image the command produced. Falls back to the only
/// TIFF in `dir` for commands that pick their own output names.
fn collect_output(expected: &Path, dir: &Path) -> Result<LabelPlane, SegmentError> {
    let path = if expected.is_file() {
        expected.to_path_buf()
    } else {
        let mut found: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| is_tiff(p))
            .collect();
        found.sort();
        match found.as_slice() {
            [only] => {
                warn!(
                    expected = %expected.display(),
                    found = %only.display(),
                    "model wrote its output under another name"
                );
                only.clone()
            }
            _ => return Err(SegmentError::MissingOutput(expected.to_path_buf())),
        }
    };
    let labels =
        read_label_plane(&path).map_err(|e| SegmentError::UnexpectedOutput(e.to_string()));
    if path != expected {
        remove_if_present(&path);
    }
    labels
}

pub(crate) fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
}

fn remove_if_present(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to remove scratch file");
    }
}

/// Last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
