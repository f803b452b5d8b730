//! Content transform stages.
//!
//! Each stage walks the content root and mutates assets in place. Stages are
//! independent of each other except through the files they leave behind, so
//! they run strictly in the order returned by [`content_stages`]. A failure on
//! one asset is logged and recorded in the [`StageReport`]; it never aborts the
//! stage or the pipeline.

pub mod downscale;
pub mod entities;
pub mod fonts;
pub mod images;
pub mod js;
pub mod lazy_load;
pub mod minify;
pub mod png_to_jpeg;
pub mod recompress;
pub mod svg;

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::OptimizeOptions;
use crate::error::StageError;

/// Everything a stage may look at. Read-only for the duration of a run.
pub struct StageContext<'a> {
    /// Root of the extracted package (holds `META-INF`).
    pub epub_dir: &'a Path,
    /// Content root (`OPS`, `OEBPS`, a custom directory, or the package root).
    pub content_root: &'a Path,
    pub options: &'a OptimizeOptions,
}

/// A content transform. Implementations must be idempotent.
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &StageContext<'_>) -> StageReport;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    pub stage: &'static str,
    /// Assets that were rewritten.
    pub changed: usize,
    /// Assets looked at and deliberately left alone.
    pub skipped: usize,
    pub failed: Vec<(PathBuf, String)>,
    /// Bytes saved across changed assets. Negative if a stage grew its output.
    pub bytes_saved: i64,
}

impl StageReport {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            ..Self::default()
        }
    }

    pub fn record_change(&mut self, before: u64, after: u64) {
        self.changed += 1;
        self.bytes_saved += before as i64 - after as i64;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn record_failure(&mut self, path: &Path, err: &StageError) {
        tracing::warn!("{}: skipping {}: {}", self.stage, path.display(), err);
        self.failed.push((path.to_path_buf(), err.to_string()));
    }

    fn log_summary(&self) {
        tracing::info!(
            "{}: {} changed, {} skipped, {} failed, {} bytes saved",
            self.stage,
            self.changed,
            self.skipped,
            self.failed.len(),
            self.bytes_saved
        );
    }
}

/// The content stages in execution order.
pub fn content_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(entities::DecodeEntities),
        Box::new(minify::MinifyMarkup),
        Box::new(js::MinifyScripts),
        Box::new(png_to_jpeg::PngToJpeg),
        Box::new(svg::OptimizeSvg),
        Box::new(downscale::Downscale),
        Box::new(recompress::Recompress),
        Box::new(lazy_load::LazyLoadImages),
        Box::new(fonts::SubsetFonts),
    ]
}

/// Run one stage and log its summary.
pub fn run_stage(stage: &dyn Stage, ctx: &StageContext<'_>) -> StageReport {
    tracing::info!("Running stage: {}", stage.name());
    let report = stage.run(ctx);
    report.log_summary();
    report
}

pub(crate) fn stage_failure(stage: &'static str, path: &Path, detail: impl ToString) -> StageError {
    StageError::Failed {
        stage,
        path: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::config::AppConfig;

    pub fn options() -> OptimizeOptions {
        OptimizeOptions::new("in.epub", "out.epub", &AppConfig::default())
    }

    pub fn context<'a>(root: &'a Path, options: &'a OptimizeOptions) -> StageContext<'a> {
        StageContext {
            epub_dir: root,
            content_root: root,
            options,
        }
    }
}
