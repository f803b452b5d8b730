//! Markup handling shared by the repair engine and the content stages.

pub mod dom;
pub mod repair;

use std::borrow::Cow;
use std::path::Path;

pub use dom::{Document, Element, NodeId, NodeKind, ParseMode};

use crate::error::MarkupError;

pub fn read_document(path: &Path, mode: ParseMode) -> Result<Document, MarkupError> {
    let bytes = std::fs::read(path)?;
    let text = String::from_utf8(bytes)?;
    Document::parse(&text, mode)
}

pub fn write_document(path: &Path, doc: &Document) -> Result<(), MarkupError> {
    crate::fsutil::replace_file(path, doc.serialize().as_bytes())?;
    Ok(())
}

/// Canonical form of a decoded string: residual entity escaping removed
/// (`&amp;amp;` becomes `&`) and the result in Unicode NFC.
pub fn canonical_text(s: &str) -> Cow<'_, str> {
    use unicode_normalization::UnicodeNormalization;

    let mut current: Cow<'_, str> = Cow::Borrowed(s);
    // Each effective pass consumes at least one entity, so `len` passes suffice.
    for _ in 0..=s.len() {
        if !current.contains('&') {
            break;
        }
        let decoded = html_escape::decode_html_entities(&current).into_owned();
        if decoded == current.as_ref() {
            break;
        }
        current = Cow::Owned(decoded);
    }

    if unicode_normalization::is_nfc(&current) {
        current
    } else {
        Cow::Owned(current.nfc().collect())
    }
}

/// Canonicalize every text node and attribute value. Returns true if anything changed.
pub fn canonicalize_entities(doc: &mut Document) -> bool {
    let mut changed = false;
    for id in doc.descendants(doc.root()) {
        match doc.kind_mut(id) {
            NodeKind::Text(text) => {
                if let Cow::Owned(canon) = canonical_text(text) {
                    if canon != *text {
                        *text = canon;
                        changed = true;
                    }
                }
            }
            NodeKind::Element(el) => {
                for (_, value) in el.attrs.iter_mut() {
                    if let Cow::Owned(canon) = canonical_text(value) {
                        if canon != *value {
                            *value = canon;
                            changed = true;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn double_escaped_ampersand_collapses() {
        let mut doc = Document::parse_xhtml("<p title=\"a&amp;amp;b\">Tom &amp;amp; Jerry</p>").unwrap();
        assert!(canonicalize_entities(&mut doc));
        assert_eq!(doc.serialize(), "<p title=\"a&amp;b\">Tom &amp; Jerry</p>");
    }

    #[test]
    fn escaped_named_entity_becomes_character() {
        let mut doc = Document::parse_xhtml("<p>caf&amp;eacute; &amp;#169;</p>").unwrap();
        canonicalize_entities(&mut doc);
        assert_eq!(doc.serialize(), "<p>caf\u{e9} \u{a9}</p>");
    }

    #[test]
    fn decomposed_text_is_composed() {
        assert_eq!(canonical_text("e\u{301}"), "\u{e9}");
    }

    #[test]
    fn clean_document_is_unchanged() {
        let mut doc = Document::parse_xhtml("<p>plain &amp; simple</p>").unwrap();
        assert!(!canonicalize_entities(&mut doc));
    }

    proptest! {
        #[test]
        fn canonical_text_is_stable(s in "[a-z &;#0-9]{0,40}") {
            let once = canonical_text(&s).into_owned();
            let twice = canonical_text(&once).into_owned();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn canonicalized_documents_reparse(s in "[a-zA-Z &;<>]{0,40}") {
            let src = format!("<p>{}</p>", html_escape::encode_text(&s));
            let mut doc = Document::parse_xhtml(&src).unwrap();
            canonicalize_entities(&mut doc);
            let out = doc.serialize();
            prop_assert!(Document::parse_xml(&out).is_ok());
        }
    }
}
