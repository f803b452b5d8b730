//! Well-formedness repair for content documents.
//!
//! Runs once over every XHTML file before the content stages. Each document
//! is parsed tolerantly, stripped of elements that are not allowed in EPUB
//! content (scripts, stray `<meta>`, bare text under `<html>`/`<body>`),
//! entity-canonicalized and written back as well-formed XML. A document that
//! cannot be parsed at all is left exactly as it was.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::MarkupError;
use crate::markup::{canonicalize_entities, write_document, Document, NodeKind, ParseMode};

/// What a single repair pass changed in one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairActions {
    pub scripts_removed: usize,
    pub stray_meta_removed: usize,
    pub stray_text_removed: usize,
    pub entities_canonicalized: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub repaired: Vec<PathBuf>,
    pub unchanged: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Apply the in-tree repairs to a parsed document.
pub fn repair_document(doc: &mut Document) -> RepairActions {
    let mut actions = RepairActions::default();

    for script in doc.elements_by_name("script") {
        doc.detach(script);
        actions.scripts_removed += 1;
    }

    for meta in doc.elements_by_name("meta") {
        let under_head = doc.parent(meta).is_some_and(|p| doc.is_element(p, "head"));
        if !under_head {
            doc.detach(meta);
            actions.stray_meta_removed += 1;
        }
    }

    let mut containers = doc.elements_by_name("html");
    containers.extend(doc.elements_by_name("body"));
    for container in containers {
        let stray: Vec<_> = doc
            .children(container)
            .iter()
            .copied()
            .filter(|&c| matches!(doc.kind(c), NodeKind::Text(t) if !t.trim().is_empty()))
            .collect();
        for text in stray {
            if let NodeKind::Text(t) = doc.kind(text) {
                tracing::debug!("Removing stray text: {:?}", t.trim());
            }
            doc.detach(text);
            actions.stray_text_removed += 1;
        }
    }

    actions.entities_canonicalized = canonicalize_entities(doc);
    actions
}

/// Repair one file in place. Returns true if the file was rewritten.
pub fn repair_file(path: &Path) -> Result<bool, MarkupError> {
    let original = std::fs::read_to_string(path)?;
    let mut doc = Document::parse(&original, ParseMode::Xhtml)?;
    let actions = repair_document(&mut doc);

    let repaired = doc.serialize();
    if repaired == original {
        return Ok(false);
    }
    tracing::debug!("Repaired {}: {:?}", path.display(), actions);
    write_document(path, &doc)?;
    Ok(true)
}

/// Repair every content document under `content_root`. Per-file failures are
/// logged and recorded; the file is left untouched.
pub fn repair_tree(content_root: &Path) -> RepairReport {
    let mut report = RepairReport::default();
    for path in crate::fsutil::content_documents(content_root) {
        match repair_file(&path) {
            Ok(true) => report.repaired.push(path),
            Ok(false) => report.unchanged += 1,
            Err(e) => {
                tracing::warn!("Skipping markup repair for {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }
    tracing::info!(
        "Markup repair: {} repaired, {} unchanged, {} failed",
        report.repaired.len(),
        report.unchanged,
        report.failed.len()
    );
    report
}

/// Whether the file on disk is well-formed XML as written.
pub fn is_well_formed(path: &Path) -> bool {
    std::fs::read_to_string(path).is_ok_and(|xml| strict_parse(&xml))
}

/// Strict well-formedness check: end names must match.
pub fn strict_parse(xml: &str) -> bool {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().check_end_names = true;
    let mut depth: i64 = 0;
    loop {
        match reader.read_event() {
            Ok(quick_xml::events::Event::Start(_)) => depth += 1,
            Ok(quick_xml::events::Event::End(_)) => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => return depth == 0,
            Ok(_) => {}
            Err(_) => return false,
        }
    }
}
