//! Stage 4: convert large opaque PNGs to JPEG.
//!
//! A PNG is converted only when it is at least `png_convert_min_bytes`, has no
//! alpha channel, and the JPEG comes out strictly smaller. Every reference is
//! rewritten before the PNG is removed: manifest `href`/`media-type`, `img[src]`
//! and SVG `image` hrefs in content documents, and `url()` references in
//! stylesheets. All rewrites are prepared in memory first; if any referencing
//! document cannot be parsed the conversion is abandoned and nothing changes.

use std::path::{Path, PathBuf};

use crate::error::StageError;
use crate::fsutil;
use crate::locate;
use crate::markup::{self, Document, ParseMode};

use super::images::encode_jpeg;
use super::{stage_failure, Stage, StageContext, StageReport};

const STAGE: &str = "png-to-jpeg";

pub struct PngToJpeg;

impl Stage for PngToJpeg {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let mut report = StageReport::new(self.name());
        let pngs = fsutil::files_with_extensions(ctx.content_root, &["png"]);
        if pngs.is_empty() {
            tracing::info!("No PNG files found");
            return report;
        }

        for png in pngs {
            match convert_png(ctx, &png) {
                Ok(Some((before, after))) => report.record_change(before, after),
                Ok(None) => report.record_skip(),
                Err(e) => report.record_failure(&png, &e),
            }
        }
        report
    }
}

/// Pending writes for one conversion.
enum Rewrite {
    Markup(PathBuf, Document),
    Text(PathBuf, String),
}

fn convert_png(ctx: &StageContext<'_>, png: &Path) -> Result<Option<(u64, u64)>, StageError> {
    let opts = &ctx.options.images;
    let before = fsutil::file_size(png);
    if before < opts.png_convert_min_bytes {
        tracing::debug!("Skipping small PNG: {} ({} bytes)", png.display(), before);
        return Ok(None);
    }

    let img = image::open(png)?;
    if img.color().has_alpha() {
        tracing::info!("Skipping PNG with transparency: {}", png.display());
        return Ok(None);
    }

    let jpeg = png.with_extension("jpg");
    if jpeg.exists() {
        tracing::warn!(
            "Skipping {}: {} already exists",
            png.display(),
            jpeg.display()
        );
        return Ok(None);
    }

    let bytes = encode_jpeg(&img, opts.jpeg_quality())?;
    let after = bytes.len() as u64;
    if after >= before {
        tracing::info!(
            "Keeping PNG {}: JPEG conversion would not reduce size",
            png.display()
        );
        return Ok(None);
    }

    let opf = locate::get_opf_path(ctx.epub_dir)?;
    let rewrites = plan_rewrites(ctx.content_root, &opf, png)?;

    fsutil::replace_file(&jpeg, &bytes)?;
    let rewritten = rewrites.len();
    for rewrite in rewrites {
        match rewrite {
            Rewrite::Markup(path, doc) => markup::write_document(&path, &doc)?,
            Rewrite::Text(path, text) => fsutil::replace_file(&path, text.as_bytes())?,
        }
    }
    std::fs::remove_file(png)?;

    tracing::info!(
        "Converted {}: {} -> {} bytes ({}% smaller), {} files updated",
        png.display(),
        before,
        after,
        (before - after) * 100 / before,
        rewritten
    );
    Ok(Some((before, after)))
}

fn plan_rewrites(content_root: &Path, opf: &Path, png: &Path) -> Result<Vec<Rewrite>, StageError> {
    let mut rewrites = Vec::new();

    let mut package = markup::read_document(opf, ParseMode::Xml)?;
    if rewrite_manifest(&mut package, parent_dir(opf), png) {
        rewrites.push(Rewrite::Markup(opf.to_path_buf(), package));
    } else {
        tracing::debug!("{} is not listed in the manifest", png.display());
    }

    let Some(file_name) = png.file_name().and_then(|n| n.to_str()) else {
        return Ok(rewrites);
    };

    for doc_path in fsutil::content_documents(content_root) {
        let source = std::fs::read_to_string(&doc_path)?;
        if !mentions(&source, file_name) {
            continue;
        }
        let mut doc = Document::parse(&source, ParseMode::Xhtml).map_err(|e| {
            stage_failure(
                STAGE,
                png,
                format!("cannot update references in {}: {e}", doc_path.display()),
            )
        })?;
        if rewrite_image_refs(&mut doc, parent_dir(&doc_path), png) {
            rewrites.push(Rewrite::Markup(doc_path, doc));
        }
    }

    for css_path in fsutil::files_with_extensions(content_root, &["css"]) {
        let source = std::fs::read_to_string(&css_path)?;
        if !mentions(&source, file_name) {
            continue;
        }
        if let Some(updated) = rewrite_css_urls(&source, parent_dir(&css_path), png) {
            rewrites.push(Rewrite::Text(css_path, updated));
        }
    }

    Ok(rewrites)
}

/// Cheap pre-filter: whether `source` names `file_name`, literally or percent-encoded.
fn mentions(source: &str, file_name: &str) -> bool {
    source.contains(file_name) || percent_encoding::percent_decode_str(source).decode_utf8_lossy().contains(file_name)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or(Path::new(""))
}

fn rewrite_manifest(package: &mut Document, base: &Path, png: &Path) -> bool {
    let mut changed = false;
    for item in package.elements_by_name("item") {
        let Some(href) = package.attr(item, "href") else {
            continue;
        };
        if locate::resolve_href(base, href) != png {
            continue;
        }
        let new_href = with_jpg_extension(href);
        package.set_attr(item, "href", new_href);
        package.set_attr(item, "media-type", "image/jpeg");
        changed = true;
    }
    changed
}

fn rewrite_image_refs(doc: &mut Document, base: &Path, png: &Path) -> bool {
    let mut changed = false;
    let targets = doc
        .elements_by_name("img")
        .into_iter()
        .map(|id| (id, "src"))
        .chain(
            doc.elements_by_name("image")
                .into_iter()
                .flat_map(|id| [(id, "href"), (id, "xlink:href")]),
        )
        .collect::<Vec<_>>();

    for (id, attr) in targets {
        let Some(value) = doc.attr(id, attr) else {
            continue;
        };
        if is_external(value) || locate::resolve_href(base, value) != png {
            continue;
        }
        let new_value = with_jpg_extension(value);
        doc.set_attr(id, attr, new_value);
        changed = true;
    }
    changed
}

/// Rewrite `url(...)` references to `png` in a stylesheet.
fn rewrite_css_urls(css: &str, base: &Path, png: &Path) -> Option<String> {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    let mut changed = false;

    while let Some(start) = rest.find("url(") {
        let (head, tail) = rest.split_at(start + 4);
        out.push_str(head);
        let Some(end) = tail.find(')') else {
            rest = tail;
            break;
        };
        let raw = &tail[..end];
        let url = raw.trim().trim_matches(|c| c == '"' || c == '\'');
        if !is_external(url) && locate::resolve_href(base, url) == png {
            out.push_str(&raw.replacen(url, &with_jpg_extension(url), 1));
            changed = true;
        } else {
            out.push_str(raw);
        }
        rest = &tail[end..];
    }
    out.push_str(rest);

    changed.then_some(out)
}

fn is_external(href: &str) -> bool {
    href.contains("://") || href.starts_with("data:")
}

/// `images/a.png#x` → `images/a.jpg#x`.
pub fn with_jpg_extension(href: &str) -> String {
    let split = href.find(['#', '?']).unwrap_or(href.len());
    let (path, suffix) = href.split_at(split);
    match path.rfind('.') {
        Some(dot) if !path[dot..].contains('/') => format!("{}.jpg{}", &path[..dot], suffix),
        _ => href.to_string(),
    }
}
