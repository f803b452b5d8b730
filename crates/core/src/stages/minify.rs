//! Stage 2: markup and stylesheet minification.
//!
//! Content documents are minified on the parsed tree rather than as text, so
//! the output stays well-formed: comments go, whitespace runs collapse to a
//! single space, inter-element whitespace inside structural containers is
//! dropped, and embedded `<style>`/`<script>` bodies are handed to the CSS and
//! JS minifiers. Preformatted content is never touched. Standalone `.css`
//! files are minified too and kept only when smaller.

use std::path::Path;

use crate::config::HtmlMinifyOptions;
use crate::error::StageError;
use crate::fsutil;
use crate::markup::{self, Document, NodeId, NodeKind, ParseMode};

use super::{stage_failure, Stage, StageContext, StageReport};

const STAGE: &str = "minify-markup";

/// Containers whose whitespace-only text children carry no meaning.
const STRUCTURAL: &[&str] = &[
    "html", "head", "body", "ul", "ol", "dl", "table", "thead", "tbody", "tfoot", "tr", "colgroup",
    "nav", "select", "svg",
];

const PREFORMATTED: &[&str] = &["pre", "textarea", "listing", "plaintext"];

pub struct MinifyMarkup;

impl Stage for MinifyMarkup {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let opts = &ctx.options.html;
        let mut report = StageReport::new(self.name());

        for path in fsutil::content_documents(ctx.content_root) {
            let before = fsutil::file_size(&path);
            match minify_document_file(&path, opts) {
                Ok(Some(after)) => report.record_change(before, after),
                Ok(None) => report.record_skip(),
                Err(e) => report.record_failure(&path, &e),
            }
        }

        if opts.minify_css {
            for path in fsutil::files_with_extensions(ctx.content_root, &["css"]) {
                let before = fsutil::file_size(&path);
                match minify_css_file(&path) {
                    Ok(Some(after)) => report.record_change(before, after),
                    Ok(None) => report.record_skip(),
                    Err(e) => report.record_failure(&path, &e),
                }
            }
        }
        report
    }
}

/// Minify one content document. Returns the new size if the file was rewritten.
fn minify_document_file(path: &Path, opts: &HtmlMinifyOptions) -> Result<Option<u64>, StageError> {
    let original = std::fs::read_to_string(path)?;
    let mut doc = Document::parse(&original, ParseMode::Xhtml).map_err(StageError::from)?;
    minify_document(&mut doc, opts);
    let minified = doc.serialize();

    if minified.len() >= original.len() {
        return Ok(None);
    }
    markup::write_document(path, &doc)?;
    Ok(Some(minified.len() as u64))
}

fn minify_css_file(path: &Path) -> Result<Option<u64>, StageError> {
    let original = std::fs::read_to_string(path)?;
    if original.trim().is_empty() {
        return Ok(None);
    }
    let minified = minify_css(&original).map_err(|e| stage_failure(STAGE, path, e))?;
    if minified.len() >= original.len() {
        return Ok(None);
    }
    fsutil::replace_file(path, minified.as_bytes())?;
    tracing::debug!(
        "Minified {}: {} -> {} bytes",
        path.display(),
        original.len(),
        minified.len()
    );
    Ok(Some(minified.len() as u64))
}

pub fn minify_css(source: &str) -> Result<String, String> {
    minifier::css::minify(source)
        .map(|m| m.to_string())
        .map_err(|e| e.to_string())
}

pub fn minify_js(source: &str) -> String {
    minifier::js::minify(source).to_string()
}

/// Apply the configured minifications to a parsed document.
pub fn minify_document(doc: &mut Document, opts: &HtmlMinifyOptions) {
    if opts.remove_comments {
        for id in doc.descendants(doc.root()) {
            if matches!(doc.kind(id), NodeKind::Comment(_)) {
                doc.detach(id);
            }
        }
        doc.merge_adjacent_text();
    }

    for id in doc.descendants(doc.root()) {
        let Some(parent) = doc.parent(id) else {
            continue;
        };
        let parent_name = doc
            .element(parent)
            .map(|el| el.local_name().to_ascii_lowercase())
            .unwrap_or_default();

        match parent_name.as_str() {
            "script" => minify_embedded(doc, id, |s| {
                if opts.minify_js {
                    minify_js(s)
                } else {
                    s.trim().to_string()
                }
            }),
            "style" => minify_embedded(doc, id, |s| {
                if opts.minify_css {
                    minify_css(s).unwrap_or_else(|e| {
                        tracing::debug!("Leaving <style> block as is: {}", e);
                        collapse_whitespace(s).trim().to_string()
                    })
                } else {
                    collapse_whitespace(s).trim().to_string()
                }
            }),
            _ if opts.collapse_whitespace => collapse_text(doc, id, parent, &parent_name),
            _ => {}
        }
    }

    if opts.minify_css {
        for id in doc.descendants(doc.root()) {
            if let Some(el) = doc.element_mut(id) {
                if let Some((_, style)) = el.attrs.iter_mut().find(|(k, _)| k == "style") {
                    *style = minify_style_attribute(style);
                }
            }
        }
    }
}

fn minify_embedded(doc: &mut Document, id: NodeId, f: impl Fn(&str) -> String) {
    match doc.kind_mut(id) {
        NodeKind::Text(t) | NodeKind::CData(t) => *t = f(t),
        _ => return,
    }
    if matches!(doc.kind(id), NodeKind::Text(t) if t.is_empty()) {
        doc.detach(id);
    }
}

fn collapse_text(doc: &mut Document, id: NodeId, parent: NodeId, parent_name: &str) {
    let NodeKind::Text(text) = doc.kind(id) else {
        return;
    };
    if in_preformatted(doc, id) {
        return;
    }
    if text.trim_matches(is_html_whitespace).is_empty()
        && STRUCTURAL.contains(&parent_name)
    {
        doc.detach(id);
        return;
    }

    let mut collapsed = collapse_whitespace(text);
    if parent_name == "body" {
        let siblings = doc.children(parent);
        if siblings.first() == Some(&id) {
            collapsed = collapsed.trim_start().to_string();
        }
        if siblings.last() == Some(&id) {
            collapsed = collapsed.trim_end().to_string();
        }
    }

    if collapsed.is_empty() {
        doc.detach(id);
    } else if let NodeKind::Text(t) = doc.kind_mut(id) {
        *t = collapsed;
    }
}

fn in_preformatted(doc: &Document, id: NodeId) -> bool {
    let mut current = doc.parent(id);
    while let Some(node) = current {
        if doc
            .element(node)
            .is_some_and(|el| PREFORMATTED.iter().any(|p| el.is(p)))
        {
            return true;
        }
        current = doc.parent(node);
    }
    false
}

fn is_html_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0c')
}

/// Collapse runs of HTML whitespace to a single space. Non-breaking spaces
/// are content and stay.
pub fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_ws = false;
    for c in s.chars() {
        if is_html_whitespace(c) {
            if !in_ws {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(c);
            in_ws = false;
        }
    }
    out
}

/// Minify a `style` attribute by running its declarations through the CSS
/// minifier inside a throwaway rule. Falls back to the original value.
fn minify_style_attribute(style: &str) -> String {
    let wrapped = format!("x{{{style}}}");
    let minified = match minify_css(&wrapped) {
        Ok(css) => css,
        Err(e) => {
            tracing::debug!("Keeping style attribute as is: {}", e);
            return style.to_string();
        }
    };
    match minified
        .trim()
        .strip_prefix("x{")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(body) => {
            let body = body.trim().trim_end_matches(';');
            if body.len() < style.len() {
                body.to_string()
            } else {
                style.to_string()
            }
        }
        None => style.to_string(),
    }
}
