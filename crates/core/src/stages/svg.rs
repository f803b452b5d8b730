//! Stage 5: lossless SVG cleanup.
//!
//! Removes comments, the doctype, `<metadata>`, editor-private elements and
//! attributes (Inkscape, Sodipodi, Sketch, Serif) and
//! insignificant whitespace, and shortens `#rrggbb` colours. Passes repeat
//! until the output stops shrinking; the file is rewritten only if the result
//! is strictly smaller.

use std::path::Path;

use crate::error::StageError;
use crate::fsutil;
use crate::markup::{Document, NodeKind, ParseMode};

use super::{Stage, StageContext, StageReport};

const MAX_PASSES: usize = 10;

const EDITOR_PREFIXES: &[&str] = &["inkscape", "sodipodi", "sketch", "serif"];

const EDITOR_NAMESPACES: &[&str] = &[
    "http://www.inkscape.org/namespaces/inkscape",
    "http://sodipodi.sourceforge.net/DTD/sodipodi-0.dtd",
    "http://www.bohemiancoding.com/sketch/ns",
    "http://www.serif.com/",
];

/// Attributes holding a single colour value.
const COLOR_ATTRS: &[&str] = &["fill", "stroke", "stop-color", "flood-color", "lighting-color", "color"];

/// Elements whose text content is rendered or parsed.
const TEXT_ELEMENTS: &[&str] = &["text", "tspan", "textPath", "style", "script", "title", "desc"];

pub struct OptimizeSvg;

impl Stage for OptimizeSvg {
    fn name(&self) -> &'static str {
        "optimize-svg"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let mut report = StageReport::new(self.name());
        let files = fsutil::files_with_extensions(ctx.content_root, &["svg"]);
        if files.is_empty() {
            tracing::info!("No SVG files found");
            return report;
        }

        for path in files {
            match optimize_svg_file(&path) {
                Ok(Some((before, after))) => report.record_change(before, after),
                Ok(None) => report.record_skip(),
                Err(e) => report.record_failure(&path, &e),
            }
        }
        report
    }
}

fn optimize_svg_file(path: &Path) -> Result<Option<(u64, u64)>, StageError> {
    let original = std::fs::read_to_string(path)?;
    let optimized = optimize_svg(&original)?;

    if optimized.len() >= original.len() {
        tracing::debug!("No optimization for {}", path.display());
        return Ok(None);
    }
    fsutil::replace_file(path, optimized.as_bytes())?;
    tracing::info!(
        "Optimized {}: {} -> {} bytes",
        path.display(),
        original.len(),
        optimized.len()
    );
    Ok(Some((original.len() as u64, optimized.len() as u64)))
}

/// Run cleanup passes until the serialized size stops decreasing.
pub fn optimize_svg(source: &str) -> Result<String, StageError> {
    let mut best = source.to_string();
    for _ in 0..MAX_PASSES {
        let mut doc = Document::parse(&best, ParseMode::Xml)?;
        clean_pass(&mut doc);
        let next = doc.serialize();
        if next.len() >= best.len() {
            break;
        }
        best = next;
    }
    Ok(best)
}

fn clean_pass(doc: &mut Document) {
    for id in doc.descendants(doc.root()) {
        match doc.kind(id) {
            NodeKind::Comment(_) | NodeKind::Doctype(_) => doc.detach(id),
            NodeKind::Element(el) if el.is("metadata") || is_editor_name(&el.name) => doc.detach(id),
            NodeKind::Text(t) if t.trim().is_empty() && !inside_text_element(doc, id) => {
                doc.detach(id)
            }
            _ => {}
        }
    }

    for id in doc.descendants(doc.root()) {
        let Some(el) = doc.element_mut(id) else {
            continue;
        };
        el.attrs.retain(|(key, value)| {
            if is_editor_name(key) {
                return false;
            }
            let declared_prefix = key.strip_prefix("xmlns:");
            !(declared_prefix.is_some_and(|p| EDITOR_PREFIXES.contains(&p))
                && EDITOR_NAMESPACES.contains(&value.as_str()))
        });
        for (key, value) in el.attrs.iter_mut() {
            if COLOR_ATTRS.contains(&key.as_str()) {
                if let Some(short) = shorten_hex_color(value) {
                    *value = short;
                }
            }
        }
    }

    // Empty groups carry nothing once their children are gone.
    for id in doc.elements_by_name("g") {
        let bare = doc.children(id).is_empty()
            && doc.element(id).is_some_and(|el| el.attrs.is_empty());
        if bare {
            doc.detach(id);
        }
    }
}

fn is_editor_name(name: &str) -> bool {
    name.split_once(':')
        .is_some_and(|(prefix, _)| prefix != "xmlns" && EDITOR_PREFIXES.contains(&prefix))
}

fn inside_text_element(doc: &Document, id: usize) -> bool {
    let mut current = doc.parent(id);
    while let Some(node) = current {
        if doc
            .element(node)
            .is_some_and(|el| TEXT_ELEMENTS.iter().any(|t| el.is(t)))
        {
            return true;
        }
        current = doc.parent(node);
    }
    false
}

/// `#aabbcc` → `#abc`.
fn shorten_hex_color(value: &str) -> Option<String> {
    let hex = value.strip_prefix('#')?;
    let bytes = hex.as_bytes();
    if bytes.len() != 6 || !bytes.iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    if bytes[0] == bytes[1] && bytes[2] == bytes[3] && bytes[4] == bytes[5] {
        let short = [bytes[0], bytes[2], bytes[4]];
        Some(format!("#{}", String::from_utf8_lossy(&short).to_ascii_lowercase()))
    } else {
        None
    }
}
