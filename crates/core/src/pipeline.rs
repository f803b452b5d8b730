//! Pipeline orchestrator: extract → repair → content stages → structure
//! updates → repackage → validate → clean up.
//!
//! Only extraction, output directory creation and repackaging can abort a
//! run. Every other step logs its own per-asset failures and the pipeline
//! moves on.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::archive;
use crate::config::OptimizeOptions;
use crate::error::OptimizeError;
use crate::locate;
use crate::markup::repair::{self, RepairReport};
use crate::progress::{emit_progress, ProgressHandler};
use crate::stages::{self, StageContext, StageReport};
use crate::structure::{self, StructureReport};
use crate::validate::{self, ValidationOutcome};

/// Number of content stages run in the `Transforming` state.
pub const STAGE_COUNT: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Extracting,
    Repairing,
    /// 1-based content stage index.
    Transforming(u8),
    StructureUpdating,
    Repackaging,
    Validating,
    CleaningUp,
    Done,
    Failed,
}

impl PipelineState {
    pub const TOTAL_STEPS: u64 = STAGE_COUNT as u64 + 7;

    /// 1-based position in the pipeline. `Failed` has no position and reports 0.
    pub fn step(self) -> u64 {
        let stages = u64::from(STAGE_COUNT);
        match self {
            Self::Extracting => 1,
            Self::Repairing => 2,
            Self::Transforming(n) => 2 + u64::from(n.clamp(1, STAGE_COUNT)),
            Self::StructureUpdating => stages + 3,
            Self::Repackaging => stages + 4,
            Self::Validating => stages + 5,
            Self::CleaningUp => stages + 6,
            Self::Done => stages + 7,
            Self::Failed => 0,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extracting => write!(f, "Extracting"),
            Self::Repairing => write!(f, "Repairing markup"),
            Self::Transforming(n) => write!(f, "Transforming ({n}/{STAGE_COUNT})"),
            Self::StructureUpdating => write!(f, "Updating structure"),
            Self::Repackaging => write!(f, "Repackaging"),
            Self::Validating => write!(f, "Validating"),
            Self::CleaningUp => write!(f, "Cleaning up"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Original vs. optimized file size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizeReport {
    pub original_bytes: u64,
    pub optimized_bytes: u64,
    /// Negative when the output grew.
    pub bytes_saved: i64,
    /// Rounded to two decimals.
    pub reduction_percent: f64,
}

impl SizeReport {
    pub fn new(original_bytes: u64, optimized_bytes: u64) -> Self {
        let bytes_saved = original_bytes as i64 - optimized_bytes as i64;
        let reduction_percent = if original_bytes == 0 {
            0.0
        } else {
            let raw = bytes_saved as f64 / original_bytes as f64 * 100.0;
            (raw * 100.0).round() / 100.0
        };
        Self {
            original_bytes,
            optimized_bytes,
            bytes_saved,
            reduction_percent,
        }
    }
}

impl fmt::Display for SizeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.bytes_saved < 0 { "-" } else { "" };
        writeln!(f, "File Size Comparison:")?;
        writeln!(f, "   Original: {}", format_file_size(self.original_bytes))?;
        writeln!(f, "   Optimized: {}", format_file_size(self.optimized_bytes))?;
        write!(
            f,
            "   Reduction: {:.2}% ({}{} saved)",
            self.reduction_percent,
            sign,
            format_file_size(self.bytes_saved.unsigned_abs())
        )
    }
}

/// Human-readable size in binary units with two decimals: `1536` → `"1.50 KiB"`.
pub fn format_file_size(bytes: u64) -> String {
    let adjusted = byte_unit::Byte::from_u64(bytes).get_appropriate_unit(byte_unit::UnitType::Binary);
    format!("{adjusted:.2}")
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizeReport {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Retained working directory; `None` once cleaned up.
    pub work_dir: Option<PathBuf>,
    pub size: SizeReport,
    pub repair: RepairReport,
    pub stages: Vec<StageReport>,
    pub structure: StructureReport,
    pub validation: ValidationOutcome,
}

impl OptimizeReport {
    /// The checker's rejection as an error, so callers can propagate its status.
    pub fn check_validation(&self) -> Result<(), OptimizeError> {
        match self.validation {
            ValidationOutcome::Failed { code } => Err(OptimizeError::ValidationFailed { code }),
            _ => Ok(()),
        }
    }
}

/// Run the whole pipeline. A fatal error moves the run to `Failed` and is
/// returned; the working directory is then kept for inspection.
pub fn optimize(
    opts: &OptimizeOptions,
    progress: Option<&dyn ProgressHandler>,
) -> Result<OptimizeReport, OptimizeError> {
    let result = run(opts, progress);
    if let Err(ref e) = result {
        tracing::error!("Optimization failed: {}", e);
        emit_progress(progress, PipelineState::Failed, Some(e.to_string().as_str()));
    }
    result
}

fn run(opts: &OptimizeOptions, progress: Option<&dyn ProgressHandler>) -> Result<OptimizeReport, OptimizeError> {
    let work_dir = opts.work_dir();

    emit_progress(progress, PipelineState::Extracting, None);
    if !opts.input.is_file() {
        return Err(OptimizeError::InputNotFound(opts.input.clone()));
    }
    // Read before packaging, which may overwrite the input in place.
    let original_bytes = std::fs::metadata(&opts.input)?.len();
    if let Some(parent) = opts.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| OptimizeError::OutputDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    archive::extract(&opts.input, &work_dir, &opts.security)?;
    tracing::info!("Extracted {} to {}", opts.input.display(), work_dir.display());

    let content_root = locate::get_content_path(&work_dir);
    tracing::debug!("Content root: {}", content_root.display());

    emit_progress(progress, PipelineState::Repairing, None);
    let repair = repair::repair_tree(&content_root);

    let ctx = StageContext {
        epub_dir: &work_dir,
        content_root: &content_root,
        options: opts,
    };
    let mut stage_reports = Vec::with_capacity(usize::from(STAGE_COUNT));
    for (index, stage) in stages::content_stages().iter().enumerate() {
        let state = PipelineState::Transforming(index as u8 + 1);
        emit_progress(progress, state, Some(stage.name()));
        stage_reports.push(stages::run_stage(stage.as_ref(), &ctx));
    }

    emit_progress(progress, PipelineState::StructureUpdating, None);
    let structure = structure::update_structure(&work_dir, &opts.cover);

    emit_progress(progress, PipelineState::Repackaging, None);
    archive::compress(&opts.output, &work_dir)?;
    tracing::info!("Created optimized EPUB: {}", opts.output.display());

    emit_progress(progress, PipelineState::Validating, None);
    let validation = validate::validate_epub(&opts.output, &opts.validate)?;

    emit_progress(progress, PipelineState::CleaningUp, None);
    let retained = clean_up(&work_dir, opts.clean);

    let size = SizeReport::new(original_bytes, std::fs::metadata(&opts.output)?.len());
    emit_progress(progress, PipelineState::Done, None);

    Ok(OptimizeReport {
        input: opts.input.clone(),
        output: opts.output.clone(),
        work_dir: retained,
        size,
        repair,
        stages: stage_reports,
        structure,
        validation,
    })
}

/// Remove the working directory when asked to. Returns it if it remains.
fn clean_up(work_dir: &Path, clean: bool) -> Option<PathBuf> {
    if !clean {
        tracing::info!("Kept temporary directory {} for inspection", work_dir.display());
        return Some(work_dir.to_path_buf());
    }
    match std::fs::remove_dir_all(work_dir) {
        Ok(()) => {
            tracing::info!("Removed temporary directory {}", work_dir.display());
            None
        }
        Err(e) => {
            tracing::warn!("Could not remove {}: {}", work_dir.display(), e);
            Some(work_dir.to_path_buf())
        }
    }
}
