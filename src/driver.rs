//! Batch driver: one atlas, many subjects, one output array.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use ndarray::{s, Array3};
use serde_json::json;

use crate::atlas::AtlasProvider;
use crate::cache::DiskCache;
use crate::error::{SubjectError, SubjectErrorKind};
use crate::extractor::SignalExtractor;
use crate::geometry::Interpolation;
use crate::npy;
use crate::subject::{SubjectLayout, SubjectProcessor};

/// Value of every output entry belonging to a subject that failed.
pub const FILL_VALUE: f32 = f32::NAN;

/// What the driver does when a subject fails. Skipped subjects keep `FILL_VALUE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Skip every failing subject.
    #[default]
    Skip,
    /// Skip subjects without a volume file; abort on any other failure.
    SkipMissing,
    /// Abort the whole run on the first subject failure.
    Abort,
}

impl FailurePolicy {
    pub fn should_abort(&self, kind: SubjectErrorKind) -> bool {
        match self {
            FailurePolicy::Skip => false,
            FailurePolicy::SkipMissing => kind != SubjectErrorKind::FileNotFound,
            FailurePolicy::Abort => true,
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(FailurePolicy::Skip),
            "skip-missing" => Ok(FailurePolicy::SkipMissing),
            "abort" => Ok(FailurePolicy::Abort),
            other => Err(format!(
                "unknown failure policy '{}' (expected 'skip', 'skip-missing' or 'abort')",
                other
            )),
        }
    }
}

/// Everything a run needs; there is no process-wide state.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub subjects_dir: PathBuf,
    pub output: PathBuf,
    pub n_rois: usize,
    pub layout: SubjectLayout,
    pub interpolation: Interpolation,
    pub standardize: bool,
    pub cache_dir: Option<PathBuf>,
    pub failure_policy: FailurePolicy,
    pub manifest: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(subjects_dir: P, output: Q, n_rois: usize) -> Self {
        PipelineConfig {
            subjects_dir: subjects_dir.into(),
            output: output.into(),
            n_rois,
            layout: SubjectLayout::default(),
            interpolation: Interpolation::default(),
            standardize: true,
            cache_dir: None,
            failure_policy: FailurePolicy::default(),
            manifest: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedSubject {
    pub index: usize,
    pub id: String,
    pub kind: SubjectErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output: PathBuf,
    pub subject_ids: Vec<String>,
    pub processed: usize,
    pub skipped: Vec<SkippedSubject>,
}

/// Immediate subdirectories of `root`, sorted by name.
pub fn list_subjects(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut subjects: Vec<(String, PathBuf)> = fs::read_dir(root)
        .with_context(|| format!("Failed to read subjects directory {}", root.display()))?
        .filter_map(|entry| readable_entry(root, entry))
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_string_lossy().into_owned();
            Some((name, path))
        })
        .collect();
    subjects.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(subjects)
}

fn readable_entry<T>(root: &Path, entry: std::io::Result<T>) -> Option<T> {
    match entry {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(
                "Ignoring unreadable entry in subjects directory {}: {}",
                root.display(),
                e
            );
            None
        }
    }
}

pub fn run<P: AtlasProvider + ?Sized>(config: &PipelineConfig, provider: &P) -> Result<RunSummary> {
    let started = Instant::now();
    if config.n_rois == 0 {
        return Err(anyhow!("Number of ROIs must be > 0."));
    }

    // --- 1. Atlas and extractor (fatal on failure) ---
    let atlas = provider
        .fetch(config.n_rois)
        .with_context(|| format!("Failed to fetch atlas with {} ROIs", config.n_rois))?;
    if atlas.n_rois() != config.n_rois {
        return Err(anyhow!(
            "Atlas provides {} regions but {} were requested",
            atlas.n_rois(),
            config.n_rois
        ));
    }
    info!("Creating extractor...");
    let builder = SignalExtractor::builder(&atlas).standardize(config.standardize);
    let extractor = match &config.cache_dir {
        Some(dir) => {
            info!("Caching extracted time series under {}", dir.display());
            builder.cache(DiskCache::new(dir)).build()
        }
        None => builder.build(),
    };
    info!(
        "Extractor ready: {} regions, standardize={}",
        extractor.n_regions(),
        extractor.standardizes()
    );
    debug!("Atlas grid {:?} with affine {}", atlas.grid().shape, atlas.affine());
    let processor = SubjectProcessor::new(&atlas, &extractor)
        .layout(config.layout.clone())
        .interpolation(config.interpolation);

    // --- 2. Subjects ---
    let subjects = list_subjects(&config.subjects_dir)?;
    if subjects.is_empty() {
        warn!(
            "No subject directories found in {}; the output will have an empty subject axis.",
            config.subjects_dir.display()
        );
    } else {
        info!(
            "Found {} subject(s). Processing order (first 5): {:?}",
            subjects.len(),
            subjects.iter().take(5).map(|(id, _)| id).collect::<Vec<_>>()
        );
    }

    // --- 3. Output array ---
    let n = config.n_rois;
    let mut all_matrices = Array3::<f32>::from_elem((n, n, subjects.len()), FILL_VALUE);

    // --- 4. Per-subject processing ---
    let pb_style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} subjects ({percent}%) ETA: {eta}")
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    let pb = ProgressBar::new(subjects.len() as u64).with_style(pb_style);

    let mut processed = 0usize;
    let mut skipped: Vec<SkippedSubject> = Vec::new();
    for (i, (subject_id, subject_path)) in subjects.iter().enumerate() {
        info!("Processing subject: {}", subject_path.display());
        match processor.process(subject_path) {
            Ok(matrix) => {
                all_matrices
                    .slice_mut(s![.., .., i])
                    .assign(&matrix.mapv(|v| v as f32));
                processed += 1;
            }
            Err(e) => {
                let kind = e.kind();
                if config.failure_policy.should_abort(kind) {
                    pb.abandon();
                    return Err(anyhow::Error::new(e).context(format!(
                        "Subject {} failed ({}); aborting run",
                        subject_id, kind
                    )));
                }
                error!("Skipping subject {} due to {} error: {}", subject_id, kind, e);
                skipped.push(skipped_entry(i, subject_id, &e));
            }
        }
        pb.inc(1);
    }
    pb.finish_with_message("Subject processing complete.");

    // --- 5. Persist ---
    if let Some(parent) = config.output.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory {}", parent.display())
            })?;
            info!("Created output directory: {}", parent.display());
        }
    }
    npy::write_npy(&config.output, &all_matrices)?;

    let summary = RunSummary {
        output: config.output.clone(),
        subject_ids: subjects.into_iter().map(|(id, _)| id).collect(),
        processed,
        skipped,
    };
    if let Some(manifest) = &config.manifest {
        write_manifest(manifest, config, &summary)?;
    }

    if !summary.skipped.is_empty() {
        warn!(
            "{} of {} subject(s) were skipped; their slices are NaN.",
            summary.skipped.len(),
            summary.subject_ids.len()
        );
    }
    info!(
        "Saved connectivity matrices to: {} ({} processed, {} skipped) in {:.2?}",
        summary.output.display(),
        summary.processed,
        summary.skipped.len(),
        started.elapsed()
    );
    Ok(summary)
}

fn skipped_entry(index: usize, id: &str, e: &SubjectError) -> SkippedSubject {
    SkippedSubject {
        index,
        id: id.to_string(),
        kind: e.kind(),
        message: e.to_string(),
    }
}

fn write_manifest(path: &Path, config: &PipelineConfig, summary: &RunSummary) -> Result<()> {
    let subjects: Vec<_> = summary
        .subject_ids
        .iter()
        .enumerate()
        .map(|(i, id)| match summary.skipped.iter().find(|s| s.index == i) {
            Some(s) => json!({
                "index": i,
                "id": id,
                "status": "skipped",
                "error_kind": s.kind.as_str(),
                "error": s.message,
            }),
            None => json!({ "index": i, "id": id, "status": "ok" }),
        })
        .collect();
    let manifest = json!({
        "output": summary.output.display().to_string(),
        "shape": [config.n_rois, config.n_rois, summary.subject_ids.len()],
        "dtype": "float32",
        "fill_value": "NaN",
        "subjects": subjects,
    });
    let text = serde_json::to_string_pretty(&manifest)?;
    fs::write(path, text).with_context(|| format!("Failed to write manifest {}", path.display()))?;
    debug!("Wrote manifest to {}", path.display());
    Ok(())
}
