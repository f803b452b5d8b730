//! Raster encoding shared by the image stages.

use std::path::Path;

use image::codecs::gif::{GifDecoder, GifEncoder};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{AnimationDecoder, DynamicImage, ImageResult};

use crate::config::ImageOptions;

pub const RASTER_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "avif"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Avif,
}

impl RasterFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            _ => None,
        }
    }
}

/// Encode as baseline JPEG. Alpha is dropped; callers check for it first.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))?;
    Ok(buf)
}

/// Lossless PNG; lower quality fractions buy more compression effort.
pub fn encode_png(img: &DynamicImage, min_quality: f32) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut buf, png_compression(min_quality), PngFilter::Adaptive);
    img.write_with_encoder(encoder)?;
    Ok(buf)
}

pub fn png_compression(min_quality: f32) -> CompressionType {
    if min_quality <= 0.8 {
        CompressionType::Best
    } else {
        CompressionType::Default
    }
}

/// Lossless WebP. The codec only takes 8-bit RGB(A).
pub fn encode_webp_lossless(img: &DynamicImage) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    let normalized = if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    };
    normalized.write_with_encoder(WebPEncoder::new_lossless(&mut buf))?;
    Ok(buf)
}

/// Single-frame GIF; the palette is rebuilt from the RGBA pixels.
pub fn encode_gif(img: &DynamicImage) -> ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgba8(img.to_rgba8()).write_with_encoder(GifEncoder::new(&mut buf))?;
    Ok(buf)
}

pub fn is_animated_gif(path: &Path) -> ImageResult<bool> {
    let file = std::io::BufReader::new(std::fs::File::open(path)?);
    let frames = GifDecoder::new(file)?.into_frames().take(2).count();
    Ok(frames > 1)
}

/// Re-encode `img` in `format` with the configured settings. `None` for
/// formats that pass through untouched.
pub fn encode(
    img: &DynamicImage,
    format: RasterFormat,
    opts: &ImageOptions,
) -> Option<ImageResult<Vec<u8>>> {
    match format {
        RasterFormat::Jpeg => Some(encode_jpeg(img, opts.jpeg_quality())),
        RasterFormat::Png => Some(encode_png(img, opts.png_min_quality())),
        RasterFormat::Webp => Some(encode_webp_lossless(img)),
        RasterFormat::Gif | RasterFormat::Avif => None,
    }
}
