//! Stage 7: re-encode raster images at the configured quality.
//!
//! JPEGs are re-encoded at `jpeg_quality`, PNGs losslessly at a compression
//! level derived from the PNG quality pair, WebP losslessly. GIFs pass through
//! and AVIF is left alone (no encoder in the image stack). Files under
//! `recompress_min_bytes` are skipped, and a result replaces the original only
//! when strictly smaller.

use std::path::Path;

use crate::config::ImageOptions;
use crate::error::StageError;
use crate::fsutil;

use super::images::{self, RasterFormat, RASTER_EXTENSIONS};
use super::{Stage, StageContext, StageReport};

pub struct Recompress;

impl Stage for Recompress {
    fn name(&self) -> &'static str {
        "recompress-images"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let mut report = StageReport::new(self.name());
        for path in fsutil::files_with_extensions(ctx.content_root, RASTER_EXTENSIONS) {
            match recompress_file(&path, &ctx.options.images) {
                Ok(Some((before, after))) => report.record_change(before, after),
                Ok(None) => report.record_skip(),
                Err(e) => report.record_failure(&path, &e),
            }
        }
        report
    }
}

pub fn recompress_file(path: &Path, opts: &ImageOptions) -> Result<Option<(u64, u64)>, StageError> {
    let before = fsutil::file_size(path);
    if before < opts.recompress_min_bytes {
        tracing::debug!("Skipping small image: {}", path.display());
        return Ok(None);
    }
    let Some(format) = RasterFormat::from_path(path) else {
        return Ok(None);
    };
    match format {
        RasterFormat::Gif => return Ok(None),
        RasterFormat::Avif => {
            tracing::info!("Leaving AVIF image as is: {}", path.display());
            return Ok(None);
        }
        _ => {}
    }

    let img = image::open(path)?;
    let Some(encoded) = images::encode(&img, format, opts) else {
        return Ok(None);
    };
    let encoded = encoded?;
    let after = encoded.len() as u64;
    if after >= before {
        tracing::debug!("Keeping {}: re-encoding would not reduce size", path.display());
        return Ok(None);
    }

    fsutil::replace_file(path, &encoded)?;
    tracing::info!(
        "Optimized {}: {:.1}% smaller",
        path.display(),
        (before - after) as f64 * 100.0 / before as f64
    );
    Ok(Some((before, after)))
}
