//! Stage 9: subset embedded fonts to the characters the book uses.
//!
//! TrueType (`glyf`) fonts keep their glyph ids, `cmap` and metrics; glyphs
//! that nothing can reach are emptied in place and `glyf`/`loca` are rebuilt.
//! A glyph is retained when it is `.notdef`, when any code point mapping to it
//! is used in the text or lies in the base coverage range, when no code point
//! maps to it at all (it may be reached through layout substitutions), or when
//! a retained composite glyph refers to it.
//!
//! CFF-flavoured OpenType, WOFF, WOFF2 and fonts listed in
//! `META-INF/encryption.xml` are never rewritten. The stage logs an estimated
//! saving for them instead.

use std::collections::{BTreeSet, HashSet};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use owned_ttf_parser::{Face, GlyphId};
use scraper::{Html, Selector};

use crate::error::StageError;
use crate::fsutil;
use crate::locate;
use crate::markup::{self, ParseMode};

use super::{stage_failure, Stage, StageContext, StageReport};

const STAGE: &str = "subset-fonts";

const FONT_EXTENSIONS: &[&str] = &["ttf", "otf", "woff", "woff2"];

/// Code points retained in every font regardless of use (through Latin Extended-B).
const BASE_COVERAGE: RangeInclusive<u32> = 0x0000..=0x024F;

/// Fraction of a font assumed removable when it cannot be subset.
const ESTIMATED_SAVING: f64 = 0.6;

const CHECKSUM_MAGIC: u32 = 0xB1B0_AFBA;

// Composite glyph component flags.
const ARG_1_AND_2_ARE_WORDS: u16 = 0x0001;
const WE_HAVE_A_SCALE: u16 = 0x0008;
const MORE_COMPONENTS: u16 = 0x0020;
const WE_HAVE_AN_X_AND_Y_SCALE: u16 = 0x0040;
const WE_HAVE_A_TWO_BY_TWO: u16 = 0x0080;

pub struct SubsetFonts;

impl Stage for SubsetFonts {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let mut report = StageReport::new(self.name());
        let fonts = fsutil::files_with_extensions(ctx.content_root, FONT_EXTENSIONS);
        if fonts.is_empty() {
            tracing::info!("No fonts found");
            return report;
        }

        let used = used_characters(ctx.content_root);
        tracing::info!("Found {} unique characters in content documents", used.len());
        let obfuscated = obfuscated_resources(ctx.epub_dir);

        for path in fonts {
            if obfuscated.contains(&path) {
                log_estimate(&path, fsutil::file_size(&path), "obfuscated");
                report.record_skip();
                continue;
            }
            match subset_font_file(&path, &used) {
                Ok(Some((before, after))) => report.record_change(before, after),
                Ok(None) => report.record_skip(),
                Err(e) => report.record_failure(&path, &e),
            }
        }
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FontFlavor {
    TrueType,
    Cff,
    Woff,
    Woff2,
    Unknown,
}

impl FontFlavor {
    fn sniff(data: &[u8]) -> Self {
        match data.get(..4) {
            Some(&[0, 1, 0, 0]) | Some(b"true") => Self::TrueType,
            Some(b"OTTO") => Self::Cff,
            Some(b"wOFF") => Self::Woff,
            Some(b"wOF2") => Self::Woff2,
            _ => Self::Unknown,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::TrueType => "TrueType",
            Self::Cff => "CFF outlines",
            Self::Woff => "WOFF",
            Self::Woff2 => "WOFF2",
            Self::Unknown => "unrecognized format",
        }
    }
}

fn log_estimate(path: &Path, size: u64, reason: &str) {
    tracing::info!(
        "Cannot subset {} ({}); leaving it untouched, estimated saving {} bytes",
        path.display(),
        reason,
        (size as f64 * ESTIMATED_SAVING) as u64
    );
}

/// Every non-control character appearing in the body text of a content document.
pub fn used_characters(content_root: &Path) -> BTreeSet<char> {
    let body = Selector::parse("body").ok();
    let mut chars = BTreeSet::new();
    for path in fsutil::content_documents(content_root) {
        let source = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Could not read {}: {}", path.display(), e);
                continue;
            }
        };
        let html = Html::parse_document(&source);
        let text: String = match body.as_ref().and_then(|sel| html.select(sel).next()) {
            Some(el) => el.text().collect(),
            None => html.root_element().text().collect(),
        };
        chars.extend(text.chars().filter(|c| !c.is_control()));
    }
    chars
}

/// Resources named by `CipherReference` in `META-INF/encryption.xml`.
fn obfuscated_resources(epub_dir: &Path) -> HashSet<PathBuf> {
    let path = epub_dir.join("META-INF").join("encryption.xml");
    if !path.is_file() {
        return HashSet::new();
    }
    match markup::read_document(&path, ParseMode::Xml) {
        Ok(doc) => doc
            .elements_by_name("CipherReference")
            .into_iter()
            .filter_map(|id| doc.attr(id, "URI"))
            .map(|uri| locate::resolve_href(epub_dir, uri))
            .collect(),
        Err(e) => {
            tracing::warn!("Could not read {}: {}", path.display(), e);
            HashSet::new()
        }
    }
}

fn subset_font_file(path: &Path, used: &BTreeSet<char>) -> Result<Option<(u64, u64)>, StageError> {
    let data = std::fs::read(path)?;
    let before = data.len() as u64;
    let flavor = FontFlavor::sniff(&data);
    if flavor != FontFlavor::TrueType {
        log_estimate(path, before, flavor.label());
        return Ok(None);
    }

    let Some(subset) = subset_truetype(&data, used).map_err(|e| stage_failure(STAGE, path, e))? else {
        log_estimate(path, before, "no glyf table");
        return Ok(None);
    };
    let after = subset.len() as u64;
    if after >= before {
        tracing::debug!("No glyphs to drop in {}", path.display());
        return Ok(None);
    }

    fsutil::replace_file(path, &subset)?;
    tracing::info!("Subset {}: {} -> {} bytes", path.display(), before, after);
    Ok(Some((before, after)))
}

/// Returns `None` when the font has no `glyf` outlines to subset.
pub fn subset_truetype(data: &[u8], used: &BTreeSet<char>) -> Result<Option<Vec<u8>>, String> {
    let face = Face::parse(data, 0).map_err(|e| format!("invalid font: {e}"))?;
    let tables = table_records(data)?;
    let find = |tag: &[u8; 4]| tables.iter().find(|t| &t.tag == tag).map(|t| t.data);

    let (Some(glyf), Some(loca), Some(head), Some(maxp)) =
        (find(b"glyf"), find(b"loca"), find(b"head"), find(b"maxp"))
    else {
        return Ok(None);
    };

    let num_glyphs = read_u16(maxp, 4).ok_or("truncated maxp table")? as usize;
    let long_loca = read_u16(head, 50).ok_or("truncated head table")? != 0;
    let offsets = parse_loca(loca, glyf.len(), num_glyphs, long_loca)?;

    let mut keep = retained_glyphs(&face, used, num_glyphs);
    close_over_components(glyf, &offsets, &mut keep);
    let dropped = keep.iter().filter(|k| !**k).count();
    tracing::debug!("Keeping {} of {} glyphs", num_glyphs - dropped, num_glyphs);

    let (new_glyf, new_loca, long) = rebuild_glyf(glyf, &offsets, &keep);
    let mut new_head = head.to_vec();
    new_head[8..12].copy_from_slice(&[0; 4]);
    new_head[50..52].copy_from_slice(&u16::from(long).to_be_bytes());

    let version = read_u32(data, 0).ok_or("truncated font header")?;
    let mut rebuilt = Vec::with_capacity(tables.len());
    for table in &tables {
        let bytes = match &table.tag {
            b"DSIG" => continue,
            b"glyf" => new_glyf.clone(),
            b"loca" => new_loca.clone(),
            b"head" => new_head.clone(),
            _ => table.data.to_vec(),
        };
        rebuilt.push((table.tag, bytes));
    }
    Ok(Some(assemble(version, rebuilt)))
}

fn retained_glyphs(face: &Face<'_>, used: &BTreeSet<char>, num_glyphs: usize) -> Vec<bool> {
    let mut keep = vec![false; num_glyphs];
    let mut mapped = vec![false; num_glyphs];
    if let Some(slot) = keep.first_mut() {
        *slot = true;
    }

    if let Some(cmap) = face.tables().cmap {
        for subtable in cmap.subtables {
            if !subtable.is_unicode() {
                continue;
            }
            subtable.codepoints(|cp| {
                let Some(GlyphId(gid)) = subtable.glyph_index(cp) else {
                    return;
                };
                let gid = usize::from(gid);
                if gid >= num_glyphs {
                    return;
                }
                mapped[gid] = true;
                let in_use = BASE_COVERAGE.contains(&cp)
                    || char::from_u32(cp).is_some_and(|c| used.contains(&c));
                if in_use {
                    keep[gid] = true;
                }
            });
        }
    }

    for (slot, was_mapped) in keep.iter_mut().zip(&mapped) {
        if !was_mapped {
            *slot = true;
        }
    }
    keep
}

fn close_over_components(glyf: &[u8], offsets: &[usize], keep: &mut [bool]) {
    let mut pending: Vec<usize> = (0..keep.len()).filter(|&g| keep[g]).collect();
    while let Some(gid) = pending.pop() {
        for component in composite_components(&glyf[offsets[gid]..offsets[gid + 1]]) {
            if component < keep.len() && !keep[component] {
                keep[component] = true;
                pending.push(component);
            }
        }
    }
}

/// Glyph ids referenced by a composite glyph; empty for simple glyphs.
fn composite_components(glyph: &[u8]) -> Vec<usize> {
    let mut components = Vec::new();
    if read_u16(glyph, 0).map_or(true, |contours| (contours as i16) >= 0) {
        return components;
    }

    let mut pos = 10;
    while let (Some(flags), Some(index)) = (read_u16(glyph, pos), read_u16(glyph, pos + 2)) {
        components.push(usize::from(index));
        pos += 4;
        pos += if flags & ARG_1_AND_2_ARE_WORDS != 0 { 4 } else { 2 };
        if flags & WE_HAVE_A_SCALE != 0 {
            pos += 2;
        } else if flags & WE_HAVE_AN_X_AND_Y_SCALE != 0 {
            pos += 4;
        } else if flags & WE_HAVE_A_TWO_BY_TWO != 0 {
            pos += 8;
        }
        if flags & MORE_COMPONENTS == 0 {
            break;
        }
    }
    components
}

fn parse_loca(loca: &[u8], glyf_len: usize, num_glyphs: usize, long: bool) -> Result<Vec<usize>, String> {
    let offsets = (0..=num_glyphs)
        .map(|i| {
            if long {
                read_u32(loca, i * 4).map(|v| v as usize)
            } else {
                read_u16(loca, i * 2).map(|v| usize::from(v) * 2)
            }
        })
        .collect::<Option<Vec<_>>>()
        .ok_or("truncated loca table")?;

    let ordered = offsets.windows(2).all(|w| w[0] <= w[1]);
    if !ordered || offsets.last().is_some_and(|&end| end > glyf_len) {
        return Err("loca offsets out of range".to_string());
    }
    Ok(offsets)
}

/// Returns the new `glyf` and `loca` tables and whether `loca` needs the long format.
fn rebuild_glyf(glyf: &[u8], offsets: &[usize], keep: &[bool]) -> (Vec<u8>, Vec<u8>, bool) {
    let mut data = Vec::with_capacity(glyf.len());
    let mut new_offsets = Vec::with_capacity(offsets.len());
    for (gid, &kept) in keep.iter().enumerate() {
        new_offsets.push(data.len());
        if kept {
            data.extend_from_slice(&glyf[offsets[gid]..offsets[gid + 1]]);
            if data.len() % 2 != 0 {
                data.push(0);
            }
        }
    }
    new_offsets.push(data.len());

    let long = data.len() / 2 > usize::from(u16::MAX);
    let mut loca = Vec::with_capacity(new_offsets.len() * if long { 4 } else { 2 });
    for offset in new_offsets {
        if long {
            loca.extend_from_slice(&(offset as u32).to_be_bytes());
        } else {
            loca.extend_from_slice(&((offset / 2) as u16).to_be_bytes());
        }
    }
    (data, loca, long)
}

struct TableRecord<'a> {
    tag: [u8; 4],
    data: &'a [u8],
}

fn table_records(data: &[u8]) -> Result<Vec<TableRecord<'_>>, String> {
    let count = read_u16(data, 4).ok_or("truncated font header")?;
    (0..usize::from(count))
        .map(|i| -> Result<TableRecord<'_>, String> {
            let base = 12 + i * 16;
            let tag: [u8; 4] = data
                .get(base..base + 4)
                .and_then(|t| t.try_into().ok())
                .ok_or("truncated table directory")?;
            let offset = read_u32(data, base + 8).ok_or("truncated table directory")? as usize;
            let length = read_u32(data, base + 12).ok_or("truncated table directory")? as usize;
            let table = data.get(offset..offset + length).ok_or_else(|| {
                format!("table {} out of range", String::from_utf8_lossy(&tag))
            })?;
            Ok(TableRecord { tag, data: table })
        })
        .collect()
}

/// Lay out an sfnt file: sorted directory, 4-byte aligned tables, fresh
/// checksums and `head.checkSumAdjustment`.
fn assemble(version: u32, mut tables: Vec<([u8; 4], Vec<u8>)>) -> Vec<u8> {
    tables.sort_by(|a, b| a.0.cmp(&b.0));
    let count = tables.len() as u16;
    let entry_selector = if count == 0 { 0 } else { 15 - count.leading_zeros() as u16 };
    let search_range = (1u16 << entry_selector) * 16;
    let range_shift = count * 16 - search_range.min(count * 16);

    let mut out = Vec::new();
    out.extend_from_slice(&version.to_be_bytes());
    for field in [count, search_range, entry_selector, range_shift] {
        out.extend_from_slice(&field.to_be_bytes());
    }

    let directory_len = 12 + 16 * tables.len();
    let mut body = Vec::new();
    let mut head_offset = None;
    for (tag, bytes) in &tables {
        let offset = directory_len + body.len();
        if tag == b"head" {
            head_offset = Some(offset);
        }
        out.extend_from_slice(tag);
        out.extend_from_slice(&checksum(bytes).to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        body.extend_from_slice(bytes);
        body.resize(body.len().next_multiple_of(4), 0);
    }
    out.extend_from_slice(&body);

    if let Some(offset) = head_offset {
        let adjustment = CHECKSUM_MAGIC.wrapping_sub(checksum(&out));
        out[offset + 8..offset + 12].copy_from_slice(&adjustment.to_be_bytes());
    }
    out
}

fn checksum(bytes: &[u8]) -> u32 {
    bytes.chunks(4).fold(0u32, |sum, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        sum.wrapping_add(u32::from_be_bytes(word))
    })
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
