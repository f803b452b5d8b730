//! Stage 8: add `loading="lazy"` to every `<img>` that lacks a loading hint.

use std::path::Path;

use crate::error::StageError;
use crate::fsutil;
use crate::markup::{self, Document, ParseMode};

use super::{Stage, StageContext, StageReport};

pub struct LazyLoadImages;

impl Stage for LazyLoadImages {
    fn name(&self) -> &'static str {
        "lazy-load-images"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let mut report = StageReport::new(self.name());
        for path in fsutil::content_documents(ctx.content_root) {
            let before = fsutil::file_size(&path);
            match add_lazy_loading_file(&path) {
                Ok(0) => report.record_skip(),
                Ok(n) => {
                    tracing::debug!("Added loading=\"lazy\" to {} images in {}", n, path.display());
                    report.record_change(before, fsutil::file_size(&path));
                }
                Err(e) => report.record_failure(&path, &e),
            }
        }
        report
    }
}

/// Returns how many `<img>` elements were updated.
pub fn add_lazy_loading(doc: &mut Document) -> usize {
    let mut updated = 0;
    for img in doc.elements_by_name("img") {
        if doc.attr(img, "loading").is_none() {
            doc.set_attr(img, "loading", "lazy");
            updated += 1;
        }
    }
    updated
}

fn add_lazy_loading_file(path: &Path) -> Result<usize, StageError> {
    let source = std::fs::read_to_string(path)?;
    if !source.contains("<img") {
        return Ok(0);
    }
    let mut doc = Document::parse(&source, ParseMode::Xhtml)?;
    let updated = add_lazy_loading(&mut doc);
    if updated > 0 {
        markup::write_document(path, &doc)?;
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn only_missing_hints_are_added() {
        let mut doc = Document::parse_xhtml(
            r#"<p><img src="a.jpg"/><img src="b.jpg" loading="eager"/></p>"#,
        )
        .unwrap();
        assert_eq!(add_lazy_loading(&mut doc), 1);
        assert_eq!(
            doc.serialize(),
            r#"<p><img src="a.jpg" loading="lazy"/><img src="b.jpg" loading="eager"/></p>"#
        );
        assert_eq!(add_lazy_loading(&mut doc), 0);
    }
}
