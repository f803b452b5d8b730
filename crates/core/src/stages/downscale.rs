//! Stage 6: shrink raster images larger than the maximum dimension.
//!
//! Static GIFs are resized like any other raster; animated GIFs are left alone.

use std::path::Path;

use image::imageops::FilterType;

use crate::config::ImageOptions;
use crate::error::StageError;
use crate::fsutil;

use super::images::{self, RasterFormat};
use super::{Stage, StageContext, StageReport};

pub struct Downscale;

impl Stage for Downscale {
    fn name(&self) -> &'static str {
        "downscale-images"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let mut report = StageReport::new(self.name());
        let files = fsutil::files_with_extensions(ctx.content_root, &["jpg", "jpeg", "png", "gif", "webp"]);
        if files.is_empty() {
            tracing::info!("No images found for downscaling");
            return report;
        }

        for path in files {
            let before = fsutil::file_size(&path);
            match downscale_file(&path, &ctx.options.images) {
                Ok(true) => report.record_change(before, fsutil::file_size(&path)),
                Ok(false) => report.record_skip(),
                Err(e) => report.record_failure(&path, &e),
            }
        }
        report
    }
}

/// Resize `path` in place to fit within `max_dimension` on both axes,
/// preserving aspect ratio. Returns false if the image already fits.
pub fn downscale_file(path: &Path, opts: &ImageOptions) -> Result<bool, StageError> {
    let max = opts.max_dimension;
    let (width, height) = image::image_dimensions(path)?;
    if width <= max && height <= max {
        return Ok(false);
    }
    let Some(format) = RasterFormat::from_path(path) else {
        return Ok(false);
    };
    if format == RasterFormat::Gif && images::is_animated_gif(path)? {
        tracing::debug!("Leaving animated GIF {} at full size", path.display());
        return Ok(false);
    }

    let img = image::open(path)?;
    let resized = img.resize(max, max, FilterType::Lanczos3);
    let encoded = match format {
        RasterFormat::Gif => images::encode_gif(&resized),
        _ => match images::encode(&resized, format, opts) {
            Some(encoded) => encoded,
            None => return Ok(false),
        },
    };
    fsutil::replace_file(path, &encoded?)?;

    tracing::info!(
        "Downscaled {}: {}x{} -> {}x{}",
        path.display(),
        width,
        height,
        resized.width(),
        resized.height()
    );
    Ok(true)
}
