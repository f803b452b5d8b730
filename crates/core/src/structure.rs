//! Structure updaters: package and navigation fixups applied after the
//! content stages, once every file is in its final state.
//!
//! Each updater detects its own already-applied state, so running them twice
//! leaves the second run a no-op.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::CoverOptions;
use crate::error::StageError;
use crate::locate::{self, ManifestItem};
use crate::markup::{self, Document, NodeId, ParseMode};

const COVER_ID: &str = "cover";
const COVER_IMAGE_ID: &str = "cover-image";
const COVER_NAV_POINT_ID: &str = "navpoint-cover";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome", content = "detail")]
pub enum UpdateOutcome {
    Applied,
    AlreadyApplied,
    /// The target element or file does not exist.
    NotApplicable,
    Disabled,
    Failed(String),
}

impl UpdateOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StructureReport {
    pub cover_linear: UpdateOutcome,
    pub cover_image_property: UpdateOutcome,
    pub nav_cover_entry: UpdateOutcome,
    pub ncx_cover_entry: UpdateOutcome,
}

impl StructureReport {
    fn all(outcome: UpdateOutcome) -> Self {
        Self {
            cover_linear: outcome.clone(),
            cover_image_property: outcome.clone(),
            nav_cover_entry: outcome.clone(),
            ncx_cover_entry: outcome,
        }
    }
}

/// Run every enabled updater against the extracted package at `epub_dir`.
/// Failures are logged and reported, never propagated.
pub fn update_structure(epub_dir: &Path, opts: &CoverOptions) -> StructureReport {
    let opf_path = match locate::get_opf_path(epub_dir) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Skipping structure updates: {}", e);
            return StructureReport::all(UpdateOutcome::Failed(e.to_string()));
        }
    };

    let (cover_linear, cover_image_property) = match update_package(&opf_path, opts) {
        Ok(outcomes) => outcomes,
        Err(e) => {
            tracing::warn!("Could not update {}: {}", opf_path.display(), e);
            let failed = UpdateOutcome::Failed(e.to_string());
            (failed.clone(), failed)
        }
    };

    let (nav_cover_entry, ncx_cover_entry) = if opts.inject_toc_entry {
        update_toc(epub_dir, &opf_path, opts.cover_label())
    } else {
        (UpdateOutcome::Disabled, UpdateOutcome::Disabled)
    };

    let report = StructureReport {
        cover_linear,
        cover_image_property,
        nav_cover_entry,
        ncx_cover_entry,
    };
    tracing::info!(
        "Structure updates: linear={:?}, cover-image={:?}, nav={:?}, ncx={:?}",
        report.cover_linear,
        report.cover_image_property,
        report.nav_cover_entry,
        report.ncx_cover_entry
    );
    report
}

fn update_package(opf_path: &Path, opts: &CoverOptions) -> Result<(UpdateOutcome, UpdateOutcome), StageError> {
    let mut package = markup::read_document(opf_path, ParseMode::Xml)?;
    let linear = if opts.fix_linear {
        fix_cover_linear(&mut package)
    } else {
        UpdateOutcome::Disabled
    };
    let property = if opts.fix_cover_image_property {
        fix_cover_image_property(&mut package)
    } else {
        UpdateOutcome::Disabled
    };
    if linear.changed() || property.changed() {
        markup::write_document(opf_path, &package)?;
    }
    Ok((linear, property))
}

/// Mark the spine `itemref idref="cover"` as `linear="yes"`.
pub fn fix_cover_linear(package: &mut Document) -> UpdateOutcome {
    let itemref = package
        .elements_by_name("itemref")
        .into_iter()
        .find(|&id| package.attr(id, "idref") == Some(COVER_ID));
    let Some(itemref) = itemref else {
        tracing::warn!("No spine itemref with idref=\"{}\"", COVER_ID);
        return UpdateOutcome::NotApplicable;
    };
    if package.attr(itemref, "linear") == Some("yes") {
        return UpdateOutcome::AlreadyApplied;
    }
    package.set_attr(itemref, "linear", "yes");
    UpdateOutcome::Applied
}

/// Add the `cover-image` property to the manifest item `id="cover-image"`,
/// keeping any other properties it already declares.
pub fn fix_cover_image_property(package: &mut Document) -> UpdateOutcome {
    let Some(item) = manifest_item_by_id(package, COVER_IMAGE_ID) else {
        tracing::warn!("No manifest item with id=\"{}\"", COVER_IMAGE_ID);
        return UpdateOutcome::NotApplicable;
    };
    let existing = package.attr(item, "properties").unwrap_or("").trim().to_string();
    if existing.split_whitespace().any(|p| p == "cover-image") {
        return UpdateOutcome::AlreadyApplied;
    }
    let properties = if existing.is_empty() {
        "cover-image".to_string()
    } else {
        format!("{existing} cover-image")
    };
    package.set_attr(item, "properties", properties);
    UpdateOutcome::Applied
}

fn manifest_item_by_id(package: &Document, id: &str) -> Option<NodeId> {
    package
        .elements_by_name("item")
        .into_iter()
        .find(|&item| package.attr(item, "id") == Some(id))
}

/// The cover document: manifest item `id="cover"`, else an XHTML item named `cover.*`.
fn cover_document(opf_path: &Path) -> Result<Option<PathBuf>, StageError> {
    let items = locate::read_manifest(opf_path)?;
    let is_cover_file = |item: &&ManifestItem| {
        item.media_type == "application/xhtml+xml"
            && locate::href_to_relative_path(&item.href)
                .file_stem()
                .is_some_and(|stem| stem == "cover")
    };
    let item = items
        .iter()
        .find(|i| i.id == COVER_ID)
        .or_else(|| items.iter().find(is_cover_file));
    let base = opf_path.parent().unwrap_or(Path::new(""));
    Ok(item.map(|i| locate::resolve_href(base, &i.href)))
}

fn update_toc(epub_dir: &Path, opf_path: &Path, label: &str) -> (UpdateOutcome, UpdateOutcome) {
    let failed = |e: &dyn std::fmt::Display| {
        tracing::warn!("Skipping TOC cover entry: {}", e);
        let outcome = UpdateOutcome::Failed(e.to_string());
        (outcome.clone(), outcome)
    };

    let cover = match cover_document(opf_path) {
        Ok(Some(cover)) => cover,
        Ok(None) => {
            tracing::warn!("No cover document in the manifest; TOC left unchanged");
            return (UpdateOutcome::NotApplicable, UpdateOutcome::NotApplicable);
        }
        Err(e) => return failed(&e),
    };
    let toc = match locate::get_toc_files(epub_dir) {
        Ok(toc) => toc,
        Err(e) => return failed(&e),
    };
    if toc.is_empty() {
        tracing::warn!("No navigation document or NCX found; TOC left unchanged");
    }

    let nav = match toc.nav {
        Some(path) => apply_toc_update(&path, ParseMode::Xhtml, |doc, dir| {
            inject_nav_cover(doc, dir, &cover, label)
        }),
        None => UpdateOutcome::NotApplicable,
    };
    let ncx = match toc.ncx {
        Some(path) => apply_toc_update(&path, ParseMode::Xml, |doc, dir| {
            inject_ncx_cover(doc, dir, &cover, label)
        }),
        None => UpdateOutcome::NotApplicable,
    };
    (nav, ncx)
}

fn apply_toc_update(
    path: &Path,
    mode: ParseMode,
    update: impl FnOnce(&mut Document, &Path) -> UpdateOutcome,
) -> UpdateOutcome {
    let result = markup::read_document(path, mode).and_then(|mut doc| {
        let outcome = update(&mut doc, path.parent().unwrap_or(Path::new("")));
        if outcome.changed() {
            markup::write_document(path, &doc)?;
            tracing::info!("Added cover entry to {}", path.display());
        }
        Ok(outcome)
    });
    result.unwrap_or_else(|e| {
        tracing::warn!("Could not update {}: {}", path.display(), e);
        UpdateOutcome::Failed(e.to_string())
    })
}

fn links_to(doc_dir: &Path, href: Option<&str>, cover: &Path) -> bool {
    href.is_some_and(|h| locate::resolve_href(doc_dir, h) == cover)
}

/// Prepend a cover link to the `nav[epub:type~=toc] > ol` list.
pub fn inject_nav_cover(nav: &mut Document, nav_dir: &Path, cover: &Path, label: &str) -> UpdateOutcome {
    let toc_nav = nav.elements_by_name("nav").into_iter().find(|&id| {
        nav.attr(id, "epub:type")
            .is_some_and(|t| t.split_whitespace().any(|t| t == "toc"))
    });
    let Some(toc_nav) = toc_nav else {
        tracing::warn!("No nav[epub:type=toc] in navigation document");
        return UpdateOutcome::NotApplicable;
    };

    let already_linked = nav
        .descendants(toc_nav)
        .into_iter()
        .filter(|&id| nav.is_element(id, "a"))
        .any(|a| links_to(nav_dir, nav.attr(a, "href"), cover));
    if already_linked {
        return UpdateOutcome::AlreadyApplied;
    }

    let Some(&list) = nav.child_elements(toc_nav, "ol").first() else {
        tracing::warn!("TOC nav has no <ol> list");
        return UpdateOutcome::NotApplicable;
    };

    let href = locate::relative_href(nav_dir, cover);
    let li = nav.create_element("li", &[]);
    let a = nav.create_element("a", &[("href", href.as_str())]);
    let text = nav.create_text(label);
    nav.append_child(a, text);
    nav.append_child(li, a);
    nav.prepend_child(list, li);
    UpdateOutcome::Applied
}

/// Prepend a cover `navPoint` to the NCX `navMap` and shift every existing
/// `playOrder` (page list and nav lists included) up by one so the sequence
/// stays contiguous from 1.
pub fn inject_ncx_cover(ncx: &mut Document, ncx_dir: &Path, cover: &Path, label: &str) -> UpdateOutcome {
    let Some(nav_map) = ncx.first_element("navMap") else {
        tracing::warn!("NCX has no navMap");
        return UpdateOutcome::NotApplicable;
    };

    let nav_points = ncx.elements_by_name("navPoint");
    let already_linked = nav_points.iter().any(|&point| {
        ncx.child_elements(point, "content")
            .first()
            .is_some_and(|&content| links_to(ncx_dir, ncx.attr(content, "src"), cover))
    });
    if already_linked {
        return UpdateOutcome::AlreadyApplied;
    }

    // navPoint, pageTarget and navTarget share one reading order.
    let ordered: Vec<NodeId> = ncx
        .descendants(ncx.root())
        .into_iter()
        .filter(|&id| ncx.attr(id, "playOrder").is_some() || ncx.is_element(id, "navPoint"))
        .collect();
    for id in ordered {
        let order = ncx
            .attr(id, "playOrder")
            .and_then(|o| o.trim().parse::<u32>().ok())
            .unwrap_or(1);
        ncx.set_attr(id, "playOrder", (order + 1).to_string());
    }

    let src = locate::relative_href(ncx_dir, cover);
    let point = ncx.create_element("navPoint", &[("id", COVER_NAV_POINT_ID), ("playOrder", "1")]);
    let nav_label = ncx.create_element("navLabel", &[]);
    let text = ncx.create_element("text", &[]);
    let label_text = ncx.create_text(label);
    let content = ncx.create_element("content", &[("src", src.as_str())]);
    ncx.append_child(text, label_text);
    ncx.append_child(nav_label, text);
    ncx.append_child(point, nav_label);
    ncx.append_child(point, content);
    ncx.prepend_child(nav_map, point);
    UpdateOutcome::Applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
<manifest>
<item id="cover" href="cover.xhtml" media-type="application/xhtml+xml"/>
<item id="cover-image" href="images/cover.jpg" media-type="image/jpeg"/>
<item id="nav" href="nav/toc.xhtml" media-type="application/xhtml+xml" properties="nav"/>
<item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
<item id="ch1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
</manifest>
<spine toc="ncx"><itemref idref="cover" linear="no"/><itemref idref="ch1"/></spine>
</package>"#;

    const NAV: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops"><head><title>TOC</title></head><body><nav epub:type="toc"><ol><li><a href="../text/ch1.xhtml">One</a></li></ol></nav></body></html>"#;

    const NCX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1"><navMap><navPoint id="n1" playOrder="1"><navLabel><text>One</text></navLabel><content src="text/ch1.xhtml"/></navPoint><navPoint id="n2" playOrder="2"><navLabel><text>Two</text></navLabel><content src="text/ch1.xhtml#two"/></navPoint></navMap></ncx>"#;

    fn package_tree(root: &Path) {
        let files = [
            ("META-INF/container.xml", r#"<?xml version="1.0"?><container xmlns="urn:oasis:names:tc:opendocument:xmlns:container" version="1.0"><rootfiles><rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/></rootfiles></container>"#),
            ("OEBPS/content.opf", OPF),
            ("OEBPS/nav/toc.xhtml", NAV),
            ("OEBPS/toc.ncx", NCX),
            ("OEBPS/cover.xhtml", "<html><body><img src=\"images/cover.jpg\"/></body></html>"),
            ("OEBPS/text/ch1.xhtml", "<html><body><p>One</p></body></html>"),
        ];
        for (rel, content) in files {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
    }

    fn snapshot(root: &Path) -> Vec<String> {
        ["OEBPS/content.opf", "OEBPS/nav/toc.xhtml", "OEBPS/toc.ncx"]
            .iter()
            .map(|rel| std::fs::read_to_string(root.join(rel)).unwrap())
            .collect()
    }

    #[test]
    fn updaters_apply_then_become_no_ops() {
        let dir = tempfile::tempdir().unwrap();
        package_tree(dir.path());
        let opts = CoverOptions::default();

        let first = update_structure(dir.path(), &opts);
        assert_eq!(first.cover_linear, UpdateOutcome::Applied);
        assert_eq!(first.cover_image_property, UpdateOutcome::Applied);
        assert_eq!(first.nav_cover_entry, UpdateOutcome::Applied);
        assert_eq!(first.ncx_cover_entry, UpdateOutcome::Applied);
        let after_first = snapshot(dir.path());

        let second = update_structure(dir.path(), &opts);
        assert_eq!(second.cover_linear, UpdateOutcome::AlreadyApplied);
        assert_eq!(second.cover_image_property, UpdateOutcome::AlreadyApplied);
        assert_eq!(second.nav_cover_entry, UpdateOutcome::AlreadyApplied);
        assert_eq!(second.ncx_cover_entry, UpdateOutcome::AlreadyApplied);
        assert_eq!(snapshot(dir.path()), after_first);

        let opf = &after_first[0];
        assert!(opf.contains(r#"<itemref idref="cover" linear="yes"/>"#));
        assert!(opf.contains(r#"id="cover-image" href="images/cover.jpg" media-type="image/jpeg" properties="cover-image""#));
        assert!(after_first[1].contains(r#"<ol><li><a href="../cover.xhtml">Cover</a></li><li>"#));
        assert!(after_first[2].contains(
            r#"<navMap><navPoint id="navpoint-cover" playOrder="1"><navLabel><text>Cover</text></navLabel><content src="cover.xhtml"/></navPoint><navPoint id="n1" playOrder="2">"#
        ));
        assert!(after_first[2].contains(r#"<navPoint id="n2" playOrder="3">"#));
    }

    #[test]
    fn label_follows_language() {
        let dir = tempfile::tempdir().unwrap();
        package_tree(dir.path());
        let opts = CoverOptions {
            lang: "fr".to_string(),
            ..CoverOptions::default()
        };
        update_structure(dir.path(), &opts);
        assert!(snapshot(dir.path())[1].contains(">Couverture</a>"));
    }

    #[test]
    fn missing_targets_are_not_applicable() {
        let mut pkg = Document::parse_xml(
            r#"<package><manifest><item id="c" href="c.jpg" media-type="image/jpeg" properties="svg"/></manifest><spine><itemref idref="ch1"/></spine></package>"#,
        )
        .unwrap();
        let before = pkg.serialize();
        assert_eq!(fix_cover_linear(&mut pkg), UpdateOutcome::NotApplicable);
        assert_eq!(fix_cover_image_property(&mut pkg), UpdateOutcome::NotApplicable);
        assert_eq!(pkg.serialize(), before);
    }

    #[test]
    fn existing_properties_are_kept() {
        let mut pkg = Document::parse_xml(
            r#"<package><manifest><item id="cover-image" href="c.svg" media-type="image/svg+xml" properties="svg"/></manifest></package>"#,
        )
        .unwrap();
        assert_eq!(fix_cover_image_property(&mut pkg), UpdateOutcome::Applied);
        assert!(pkg.serialize().contains(r#"properties="svg cover-image""#));
    }

    #[test]
    fn missing_package_is_reported_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let report = update_structure(dir.path(), &CoverOptions::default());
        assert!(matches!(report.cover_linear, UpdateOutcome::Failed(_)));
        assert!(matches!(report.ncx_cover_entry, UpdateOutcome::Failed(_)));
    }

    fn ncx_with(points: usize, pages: usize) -> String {
        let mut map = String::new();
        for i in 1..=points {
            map.push_str(&format!(
                r#"<navPoint id="n{i}" playOrder="{i}"><navLabel><text>Ch {i}</text></navLabel><content src="ch{i}.xhtml"/></navPoint>"#
            ));
        }
        let mut page_list = String::new();
        for p in 1..=pages {
            let order = points + p;
            page_list.push_str(&format!(
                r#"<pageTarget id="p{p}" type="normal" value="{p}" playOrder="{order}"><navLabel><text>{p}</text></navLabel><content src="ch1.xhtml#p{p}"/></pageTarget>"#
            ));
        }
        format!(r#"<ncx><navMap>{map}</navMap><pageList>{page_list}</pageList></ncx>"#)
    }

    proptest! {
        #[test]
        fn play_order_stays_contiguous(points in 0usize..20, pages in 0usize..10) {
            let mut ncx = Document::parse_xml(&ncx_with(points, pages)).unwrap();
            let dir = Path::new("/book/OEBPS");
            let cover = dir.join("cover.xhtml");

            prop_assert_eq!(inject_ncx_cover(&mut ncx, dir, &cover, "Cover"), UpdateOutcome::Applied);
            let orders: Vec<u32> = ncx
                .descendants(ncx.root())
                .into_iter()
                .filter_map(|id| ncx.attr(id, "playOrder"))
                .map(|order| order.parse().unwrap())
                .collect();
            let expected: Vec<u32> = (1..=(points + pages) as u32 + 1).collect();
            prop_assert_eq!(orders, expected);

            let once = ncx.serialize();
            prop_assert_eq!(inject_ncx_cover(&mut ncx, dir, &cover, "Cover"), UpdateOutcome::AlreadyApplied);
            prop_assert_eq!(ncx.serialize(), once);
        }
    }
}
