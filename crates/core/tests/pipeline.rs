//! End-to-end behaviour of the optimizer on small generated books.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use epub_optimizer_core::archive;
use epub_optimizer_core::config::{AppConfig, OptimizeOptions};
use epub_optimizer_core::locate;
use epub_optimizer_core::markup::repair;
use epub_optimizer_core::pipeline::{optimize, PipelineState};
use epub_optimizer_core::security::SecurityLimits;
use epub_optimizer_core::stages::png_to_jpeg::PngToJpeg;
use epub_optimizer_core::stages::{Stage, StageContext};
use epub_optimizer_core::structure::UpdateOutcome;
use epub_optimizer_core::validate::ValidationOutcome;
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use pretty_assertions::assert_eq;

fn container(opf: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="{opf}" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#
    )
}

/// Write a stored (uncompressed) EPUB with `mimetype` first.
fn write_epub(path: &Path, files: &[(&str, Vec<u8>)]) {
    let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
    let stored: zip::write::FileOptions<'_, ()> =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();
    for (name, data) in files {
        zip.start_file(*name, stored).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

fn read_entry(epub: &Path, name: &str) -> String {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(epub).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut out = String::new();
    entry.read_to_string(&mut out).unwrap();
    out
}

fn assert_mimetype_first(epub: &Path) {
    let mut archive = zip::ZipArchive::new(std::fs::File::open(epub).unwrap()).unwrap();
    let mut first = archive.by_index(0).unwrap();
    assert_eq!(first.name(), "mimetype");
    assert_eq!(first.compression(), zip::CompressionMethod::Stored);
    let mut content = String::new();
    first.read_to_string(&mut content).unwrap();
    assert_eq!(content, "application/epub+zip");
}

fn noise(width: u32, height: u32) -> RgbImage {
    let mut state: u32 = 0x9E37_79B9;
    RgbImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        Rgb([r, g, b])
    })
}

fn png_bytes(img: RgbImage) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn options(input: &Path, output: &Path) -> OptimizeOptions {
    let mut opts = OptimizeOptions::new(input, output, &AppConfig::default());
    opts.validate.enabled = false;
    opts
}

const CHAPTER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>One</title></head>
<body>
  <!-- editor note -->
  <h1>Chapter <span>One</h1>
  <p>Café   and    tea.</p>
  <p><img src="images/dot.png" alt="dot"/></p>
</body>
</html>"#;

#[test]
fn minimal_book_round_trips_smaller() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.epub");
    let output = dir.path().join("out/book.epub");
    let opf = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="dot" href="images/dot.png" media-type="image/png"/>
  </manifest>
  <spine><itemref idref="ch1"/></spine>
</package>"#;
    write_epub(
        &input,
        &[
            ("META-INF/container.xml", container("OEBPS/content.opf").into_bytes()),
            ("OEBPS/content.opf", opf.as_bytes().to_vec()),
            ("OEBPS/ch1.xhtml", CHAPTER.as_bytes().to_vec()),
            ("OEBPS/images/dot.png", png_bytes(noise(8, 8))),
        ],
    );

    let report = optimize(&options(&input, &output), None).unwrap();

    assert!(output.is_file());
    assert_mimetype_first(&output);
    assert!(report.size.optimized_bytes <= report.size.original_bytes);
    assert_eq!(report.validation, ValidationOutcome::Skipped { reason: "validation disabled".to_string() });
    assert_eq!(report.stages.len(), 9);
    assert!(report.stages.iter().all(|s| s.failed.is_empty()));
    assert!(report.work_dir.as_deref().is_some_and(Path::is_dir));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["validation"]["status"], "skipped");
    assert_eq!(json["stages"][0]["stage"], "decode-entities");

    let chapter = read_entry(&output, "OEBPS/ch1.xhtml");
    assert!(repair::strict_parse(&chapter), "not well-formed: {chapter}");
    assert!(!chapter.contains("editor note"));
    assert!(chapter.contains("Café and tea."));
    assert!(chapter.contains(r#"loading="lazy""#));
    assert!(chapter.contains("images/dot.png"));
}

#[test]
fn in_place_run_reports_the_original_size() {
    let dir = tempfile::tempdir().unwrap();
    let book = dir.path().join("book.epub");
    let opf = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest><item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/></manifest>
  <spine><itemref idref="ch1"/></spine>
</package>"#;
    let chapter = format!(
        "<html><head><title>T</title></head><body>{}</body></html>",
        "<p>The same sentence, over and over.</p>\n".repeat(200)
    );
    write_epub(
        &book,
        &[
            ("META-INF/container.xml", container("OEBPS/content.opf").into_bytes()),
            ("OEBPS/content.opf", opf.as_bytes().to_vec()),
            ("OEBPS/ch1.xhtml", chapter.into_bytes()),
        ],
    );
    let before = std::fs::metadata(&book).unwrap().len();

    let report = optimize(&options(&book, &book), None).unwrap();

    let after = std::fs::metadata(&book).unwrap().len();
    assert!(after < before);
    assert_eq!(report.size.original_bytes, before);
    assert_eq!(report.size.optimized_bytes, after);
    assert!(report.size.bytes_saved > 0);
}

#[test]
fn custom_content_dir_gets_cover_entries() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("novel.epub");
    let output = dir.path().join("novel-small.epub");
    let opf = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <manifest>
    <item id="cover" href="cover.xhtml" media-type="application/xhtml+xml"/>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine toc="ncx"><itemref idref="cover"/><itemref idref="ch1"/></spine>
</package>"#;
    let nav = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops"><head><title>Contents</title></head>
<body><nav epub:type="toc"><ol><li><a href="ch1.xhtml">One</a></li></ol></nav></body></html>"#;
    let ncx = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1"><navMap>
<navPoint id="p1" playOrder="1"><navLabel><text>One</text></navLabel><content src="ch1.xhtml"/></navPoint>
</navMap></ncx>"#;
    write_epub(
        &input,
        &[
            ("META-INF/container.xml", container("EPUB/package.opf").into_bytes()),
            ("EPUB/package.opf", opf.as_bytes().to_vec()),
            ("EPUB/nav.xhtml", nav.as_bytes().to_vec()),
            ("EPUB/toc.ncx", ncx.as_bytes().to_vec()),
            ("EPUB/cover.xhtml", b"<html><body><p>Cover</p></body></html>".to_vec()),
            ("EPUB/ch1.xhtml", CHAPTER.replace("<p><img src=\"images/dot.png\" alt=\"dot\"/></p>", "").into_bytes()),
        ],
    );
    let mut opts = options(&input, &output);
    opts.clean = true;

    let report = optimize(&opts, None).unwrap();
    assert!(report.work_dir.is_none());
    assert!(!opts.work_dir().exists());
    assert_eq!(report.structure.cover_linear, UpdateOutcome::Applied);
    assert_eq!(report.structure.nav_cover_entry, UpdateOutcome::Applied);
    assert_eq!(report.structure.ncx_cover_entry, UpdateOutcome::Applied);
    assert_eq!(report.structure.cover_image_property, UpdateOutcome::NotApplicable);

    assert!(read_entry(&output, "EPUB/package.opf").contains(r#"<itemref idref="cover" linear="yes"/>"#));
    assert!(read_entry(&output, "EPUB/nav.xhtml").contains(r#"<ol><li><a href="cover.xhtml">Cover</a></li>"#));
    let ncx_out = read_entry(&output, "EPUB/toc.ncx");
    assert!(ncx_out.contains(r#"<navPoint id="navpoint-cover" playOrder="1">"#));
    assert!(ncx_out.contains(r#"<navPoint id="p1" playOrder="2">"#));
}

#[test]
fn progress_walks_every_state_in_order() {
    use epub_optimizer_core::progress::{ProgressEvent, ProgressHandler};
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<ProgressEvent>>);
    impl ProgressHandler for Recorder {
        fn on_progress(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.epub");
    write_epub(
        &input,
        &[
            ("META-INF/container.xml", container("content.opf").into_bytes()),
            ("content.opf", br#"<package><manifest/><spine/></package>"#.to_vec()),
        ],
    );
    let recorder = Recorder(Mutex::new(Vec::new()));
    optimize(&options(&input, &dir.path().join("out.epub")), Some(&recorder)).unwrap();

    let events = recorder.0.into_inner().unwrap();
    let steps: Vec<u64> = events.iter().map(|e| e.step).collect();
    assert_eq!(steps, (1..=PipelineState::TOTAL_STEPS).collect::<Vec<_>>());
    assert_eq!(events.last().map(|e| e.state), Some(PipelineState::Done));
    assert_eq!(events[3].state, PipelineState::Transforming(2));
    assert_eq!(events[3].message.as_deref(), Some("minify-markup"));
}

#[test]
fn extract_then_compress_puts_mimetype_first() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.epub");
    // Deliberately place mimetype last and deflated in the source.
    {
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&input).unwrap());
        let deflated: zip::write::FileOptions<'_, ()> = zip::write::FileOptions::default();
        zip.start_file("OPS/a.xhtml", deflated).unwrap();
        zip.write_all(b"<html/>").unwrap();
        zip.start_file("mimetype", deflated).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.finish().unwrap();
    }

    let work = dir.path().join("work");
    archive::extract(&input, &work, &SecurityLimits::default()).unwrap();
    let output = dir.path().join("out.epub");
    assert!(archive::compress(&output, &work).unwrap());
    assert_mimetype_first(&output);
    assert_eq!(read_entry(&output, "OPS/a.xhtml"), "<html/>");
}

struct ConversionTree {
    _dir: tempfile::TempDir,
    root: PathBuf,
    content: PathBuf,
}

fn conversion_tree() -> ConversionTree {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("book");
    let content = root.join("OEBPS");
    std::fs::create_dir_all(content.join("images")).unwrap();
    std::fs::create_dir_all(content.join("text")).unwrap();
    std::fs::create_dir_all(root.join("META-INF")).unwrap();
    std::fs::write(root.join(locate::CONTAINER_PATH), container("OEBPS/content.opf")).unwrap();
    std::fs::write(
        content.join("content.opf"),
        r#"<package xmlns="http://www.idpf.org/2007/opf"><manifest>
<item id="big" href="images/big.png" media-type="image/png"/>
<item id="small" href="images/small.png" media-type="image/png"/>
<item id="alpha" href="images/alpha.png" media-type="image/png"/>
<item id="ch" href="text/ch.xhtml" media-type="application/xhtml+xml"/>
</manifest></package>"#,
    )
    .unwrap();
    std::fs::write(
        content.join("text/ch.xhtml"),
        r#"<html><body><img src="../images/big.png"/><img src="../images/small.png"/><img src="../images/alpha.png"/></body></html>"#,
    )
    .unwrap();

    std::fs::write(content.join("images/big.png"), png_bytes(noise(300, 300))).unwrap();
    std::fs::write(content.join("images/small.png"), png_bytes(noise(16, 16))).unwrap();
    let rgb = noise(300, 300);
    RgbaImage::from_fn(300, 300, |x, y| {
        let p = rgb.get_pixel(x, y);
        Rgba([p[0], p[1], p[2], 200])
    })
    .save(content.join("images/alpha.png"))
    .unwrap();

    ConversionTree {
        _dir: dir,
        root,
        content,
    }
}

#[test]
fn png_conversion_rewrites_every_reference() {
    let tree = conversion_tree();
    let images = tree.content.join("images");
    assert!(std::fs::metadata(images.join("big.png")).unwrap().len() >= 200 * 1024);
    assert!(std::fs::metadata(images.join("alpha.png")).unwrap().len() >= 200 * 1024);
    let small_before = std::fs::read(images.join("small.png")).unwrap();
    let alpha_before = std::fs::read(images.join("alpha.png")).unwrap();

    let opts = OptimizeOptions::new("in.epub", "out.epub", &AppConfig::default());
    let ctx = StageContext {
        epub_dir: &tree.root,
        content_root: &tree.content,
        options: &opts,
    };
    let report = PngToJpeg.run(&ctx);
    assert_eq!(report.changed, 1);
    assert!(report.failed.is_empty());

    assert!(!images.join("big.png").exists());
    assert!(images.join("big.jpg").is_file());
    assert_eq!(std::fs::read(images.join("small.png")).unwrap(), small_before);
    assert_eq!(std::fs::read(images.join("alpha.png")).unwrap(), alpha_before);

    let items = locate::read_manifest(&tree.content.join("content.opf")).unwrap();
    let big = items.iter().find(|i| i.id == "big").unwrap();
    assert_eq!((big.href.as_str(), big.media_type.as_str()), ("images/big.jpg", "image/jpeg"));
    let alpha = items.iter().find(|i| i.id == "alpha").unwrap();
    assert_eq!(alpha.media_type, "image/png");

    let chapter = std::fs::read_to_string(tree.content.join("text/ch.xhtml")).unwrap();
    assert!(chapter.contains(r#"src="../images/big.jpg""#));
    assert!(!chapter.contains("big.png"));
    assert!(chapter.contains("small.png"));
    assert!(chapter.contains("alpha.png"));
}

#[test]
fn unclosed_span_in_heading_is_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ch.xhtml");
    std::fs::write(
        &path,
        r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>T</title></head><body><h1>Part <span>One</h1><p>Body text</p></body></html>"#,
    )
    .unwrap();
    assert!(!repair::is_well_formed(&path));

    assert!(repair::repair_file(&path).unwrap());
    assert!(repair::is_well_formed(&path));
    let repaired = std::fs::read_to_string(&path).unwrap();
    assert!(repaired.contains("Part "));
    assert!(repaired.contains("One"));
    assert!(repaired.contains("Body text"));
}
