//! Structural locator: finds the package document, the content root and the
//! navigation files of an extracted EPUB, whatever its directory layout.

use std::path::{Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use serde::Serialize;

use crate::error::LocateError;

pub const CONTAINER_PATH: &str = "META-INF/container.xml";
pub const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";

/// Conventional content directories, in order of preference.
const CONVENTIONAL_CONTENT_DIRS: &[&str] = &["OPS", "OEBPS"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

impl ManifestItem {
    pub fn has_property(&self, name: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|p| p.split_whitespace().any(|token| token == name))
    }
}

/// Navigation files that exist on disk. Either may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TocFiles {
    /// EPUB 3 navigation document.
    pub nav: Option<PathBuf>,
    /// EPUB 2 NCX.
    pub ncx: Option<PathBuf>,
}

impl TocFiles {
    pub fn is_empty(&self) -> bool {
        self.nav.is_none() && self.ncx.is_none()
    }
}

/// Absolute path of the package document named by `META-INF/container.xml`.
pub fn get_opf_path(epub_dir: &Path) -> Result<PathBuf, LocateError> {
    let container = epub_dir.join(CONTAINER_PATH);
    if !container.is_file() {
        return Err(LocateError::ContainerNotFound(container));
    }
    let content = std::fs::read_to_string(&container)?;

    let full_path = find_rootfile(&content).map_err(|detail| LocateError::Malformed {
        path: container.clone(),
        detail,
    })?;
    let Some(full_path) = full_path.filter(|p| !p.trim().is_empty()) else {
        return Err(LocateError::OpfReferenceMissing(container));
    };

    let opf = epub_dir.join(href_to_relative_path(&full_path));
    if !opf.is_file() {
        return Err(LocateError::OpfFileMissing(opf));
    }
    Ok(opf)
}

fn find_rootfile(container: &str) -> Result<Option<String>, String> {
    let mut reader = XmlReader::from_str(container);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                if e.local_name().as_ref() == b"rootfile" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.local_name().as_ref() == b"full-path" {
                        return Ok(Some(String::from_utf8_lossy(&attr.value).to_string()));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("Failed to parse container.xml: {e}")),
            _ => {}
        }
        buf.clear();
    }
    Ok(None)
}

/// Name of the content root relative to `epub_dir`: `OPS`, then `OEBPS`, then
/// the directory holding the package document, then `""` for the package root.
pub fn get_content_dir(epub_dir: &Path) -> String {
    for dir in CONVENTIONAL_CONTENT_DIRS {
        if epub_dir.join(dir).is_dir() {
            return dir.to_string();
        }
    }

    match get_opf_path(epub_dir) {
        Ok(opf) => opf
            .parent()
            .and_then(|parent| crate::fsutil::relative_slash_path(parent, epub_dir))
            .unwrap_or_default(),
        Err(e) => {
            tracing::debug!("No package document for content dir lookup: {}", e);
            String::new()
        }
    }
}

/// Absolute content root.
pub fn get_content_path(epub_dir: &Path) -> PathBuf {
    let dir = get_content_dir(epub_dir);
    if dir.is_empty() {
        epub_dir.to_path_buf()
    } else {
        epub_dir.join(dir)
    }
}

/// Locate the EPUB 3 nav document and EPUB 2 NCX through the manifest.
/// Manifest entries pointing at missing files count as absent.
pub fn get_toc_files(epub_dir: &Path) -> Result<TocFiles, LocateError> {
    let opf = get_opf_path(epub_dir)?;
    let items = read_manifest(&opf)?;
    let base = opf.parent().unwrap_or(epub_dir);

    let existing = |item: Option<&ManifestItem>| -> Option<PathBuf> {
        let item = item?;
        let path = resolve_href(base, &item.href);
        if path.is_file() {
            Some(path)
        } else {
            tracing::warn!(
                "Manifest item '{}' points to missing file {}",
                item.id,
                path.display()
            );
            None
        }
    };

    Ok(TocFiles {
        nav: existing(items.iter().find(|i| i.has_property("nav"))),
        ncx: existing(items.iter().find(|i| i.media_type == NCX_MEDIA_TYPE)),
    })
}

/// Parse the `<manifest>` items of a package document.
pub fn read_manifest(opf_path: &Path) -> Result<Vec<ManifestItem>, LocateError> {
    let content = std::fs::read_to_string(opf_path)?;
    parse_manifest(&content).map_err(|detail| LocateError::Malformed {
        path: opf_path.to_path_buf(),
        detail,
    })
}

fn parse_manifest(content: &str) -> Result<Vec<ManifestItem>, String> {
    let mut reader = XmlReader::from_str(content);
    let mut buf = Vec::new();
    let mut items = Vec::new();
    let mut in_manifest = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"manifest" => {
                in_manifest = true;
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"manifest" => {
                in_manifest = false;
            }
            Ok(Event::Empty(ref e)) | Ok(Event::Start(ref e))
                if in_manifest && e.local_name().as_ref() == b"item" =>
            {
                let mut id = String::new();
                let mut href = String::new();
                let mut media_type = String::new();
                let mut properties = None;
                for attr in e.attributes().flatten() {
                    let value = attr
                        .unescape_value()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).to_string());
                    match attr.key.local_name().as_ref() {
                        b"id" => id = value,
                        b"href" => href = value,
                        b"media-type" => media_type = value,
                        b"properties" => properties = Some(value),
                        _ => {}
                    }
                }
                if !href.is_empty() {
                    items.push(ManifestItem {
                        id,
                        href,
                        media_type,
                        properties,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(format!("Failed to parse package document: {e}")),
            _ => {}
        }
        buf.clear();
    }
    Ok(items)
}

/// Resolve a manifest or markup href against the directory it is relative to.
pub fn resolve_href(base: &Path, href: &str) -> PathBuf {
    push_href(base.to_path_buf(), href)
}

/// Strip fragment and query and turn a URL path into a relative file path.
pub fn href_to_relative_path(href: &str) -> PathBuf {
    push_href(PathBuf::new(), href)
}

/// Forward-slash href from `from_dir` to `target`, climbing with `..` as needed.
pub fn relative_href(from_dir: &Path, target: &Path) -> String {
    let from: Vec<_> = from_dir.components().collect();
    let to: Vec<_> = target.components().collect();
    let common = from.iter().zip(&to).take_while(|(a, b)| a == b).count();

    let mut parts = vec!["..".to_string(); from.len() - common];
    parts.extend(
        to[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.join("/")
}

fn push_href(mut out: PathBuf, href: &str) -> PathBuf {
    let path = href.split(['#', '?']).next().unwrap_or(href);
    for part in path.split('/') {
        let part = percent_encoding::percent_decode_str(part).decode_utf8_lossy();
        match part.as_ref() {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
