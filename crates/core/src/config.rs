//! Optimizer configuration.
//!
//! [`AppConfig`] is the persisted form, read from
//! `~/.config/epub-optimizer/config.toml`. [`OptimizeOptions`] is the explicit
//! per-run configuration built from it (plus input/output paths) once at
//! pipeline start and passed by reference into every stage.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::security::SecurityLimits;

/// Maximum width/height of raster images. Not independently configurable.
pub const MAX_IMAGE_DIMENSION: u32 = 1600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Remove the working directory after a successful run.
    pub clean: bool,
    pub images: ImageOptions,
    pub html: HtmlMinifyOptions,
    pub cover: CoverOptions,
    pub validate: ValidatorOptions,
    pub security: SecurityLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    /// JPEG quality, 0-100.
    pub jpeg_quality: u8,
    /// PNG quality as a `[min, max]` fraction pair, 0-1.
    pub png_quality: [f32; 2],
    /// PNGs smaller than this are never converted to JPEG.
    pub png_convert_min_bytes: u64,
    /// Images smaller than this are never recompressed.
    pub recompress_min_bytes: u64,
    #[serde(skip)]
    pub max_dimension: u32,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 70,
            png_quality: [0.6, 0.8],
            png_convert_min_bytes: 200 * 1024,
            recompress_min_bytes: 10 * 1024,
            max_dimension: MAX_IMAGE_DIMENSION,
        }
    }
}

impl ImageOptions {
    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality.clamp(1, 100)
    }

    /// Lower bound of the PNG quality pair, clamped to 0-1.
    pub fn png_min_quality(&self) -> f32 {
        self.png_quality[0].clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtmlMinifyOptions {
    pub collapse_whitespace: bool,
    pub remove_comments: bool,
    pub minify_css: bool,
    pub minify_js: bool,
}

impl Default for HtmlMinifyOptions {
    fn default() -> Self {
        Self {
            collapse_whitespace: true,
            remove_comments: true,
            minify_css: true,
            minify_js: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverOptions {
    /// Language used for the injected cover label.
    pub lang: String,
    /// Fallback when `lang` has no label.
    pub default_lang: String,
    /// Language code → cover label.
    pub labels: BTreeMap<String, String>,
    pub fix_linear: bool,
    pub fix_cover_image_property: bool,
    pub inject_toc_entry: bool,
}

impl Default for CoverOptions {
    fn default() -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("en".to_string(), "Cover".to_string());
        labels.insert("fr".to_string(), "Couverture".to_string());
        Self {
            lang: "en".to_string(),
            default_lang: "en".to_string(),
            labels,
            fix_linear: true,
            fix_cover_image_property: true,
            inject_toc_entry: true,
        }
    }
}

impl CoverOptions {
    /// Localized cover label for `lang`, falling back to `default_lang`.
    pub fn cover_label(&self) -> &str {
        self.labels
            .get(&self.lang)
            .or_else(|| self.labels.get(&self.default_lang))
            .map(String::as_str)
            .unwrap_or("Cover")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorOptions {
    pub enabled: bool,
    /// Path to `epubcheck.jar`.
    pub epubcheck_path: PathBuf,
    /// Java launcher used to run the checker.
    pub java: String,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            epubcheck_path: PathBuf::from("epubcheck/epubcheck.jar"),
            java: "java".to_string(),
        }
    }
}

/// Everything one pipeline run needs. Read-only once the run starts.
#[derive(Debug, Clone)]
pub struct OptimizeOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Working directory; derived from the input name when `None`.
    pub work_dir: Option<PathBuf>,
    pub clean: bool,
    pub images: ImageOptions,
    pub html: HtmlMinifyOptions,
    pub cover: CoverOptions,
    pub validate: ValidatorOptions,
    pub security: SecurityLimits,
}

impl OptimizeOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>, cfg: &AppConfig) -> Self {
        let mut images = cfg.images.clone();
        images.max_dimension = MAX_IMAGE_DIMENSION;
        Self {
            input: input.into(),
            output: output.into(),
            work_dir: None,
            clean: cfg.clean,
            images,
            html: cfg.html.clone(),
            cover: cfg.cover.clone(),
            validate: cfg.validate.clone(),
            security: cfg.security.clone(),
        }
    }

    /// The working directory for this run. Defaults to `<input-stem>_epub_work`
    /// next to the output file so runs on different inputs never collide.
    pub fn work_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.work_dir {
            return dir.clone();
        }
        let stem = self
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("book");
        let parent = self
            .output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        parent.join(format!("{stem}_epub_work"))
    }
}

/// Load config from the default path (`~/.config/epub-optimizer/config.toml`).
pub fn load_config() -> AppConfig {
    match config_path() {
        Some(path) => load_config_from(&path),
        None => AppConfig::default(),
    }
}

/// Load config from an explicit path. Missing or invalid files yield defaults.
pub fn load_config_from(path: &Path) -> AppConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return AppConfig::default(),
    };

    match toml::from_str::<AppConfig>(&content) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Ignoring invalid config {}: {}", path.display(), e);
            AppConfig::default()
        }
    }
}

/// Return the default config file path (for init and show).
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|mut p| {
        p.push("epub-optimizer");
        p.push("config.toml");
        p
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.images.jpeg_quality, 70);
        assert_eq!(cfg.images.png_quality, [0.6, 0.8]);
        assert_eq!(cfg.images.max_dimension, 1600);
        assert!(!cfg.clean);
    }

    #[test]
    fn cover_label_known_and_fallback() {
        let mut cover = CoverOptions::default();
        assert_eq!(cover.cover_label(), "Cover");
        cover.lang = "fr".to_string();
        assert_eq!(cover.cover_label(), "Couverture");
        cover.lang = "xx".to_string();
        assert_eq!(cover.cover_label(), "Cover");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
clean = true

[images]
jpeg_quality = 85

[cover]
lang = "fr"
"#,
        )
        .unwrap();
        assert!(cfg.clean);
        assert_eq!(cfg.images.jpeg_quality, 85);
        assert_eq!(cfg.images.png_quality, [0.6, 0.8]);
        assert_eq!(cfg.cover.cover_label(), "Couverture");
        assert!(cfg.html.collapse_whitespace);
    }

    #[test]
    fn max_dimension_is_fixed() {
        let mut cfg = AppConfig::default();
        cfg.images.max_dimension = 10;
        let opts = OptimizeOptions::new("in.epub", "out.epub", &cfg);
        assert_eq!(opts.images.max_dimension, MAX_IMAGE_DIMENSION);
    }

    #[test]
    fn work_dir_derived_from_input_stem() {
        let opts = OptimizeOptions::new("books/novel.epub", "dist/novel_opt.epub", &AppConfig::default());
        assert_eq!(opts.work_dir(), PathBuf::from("dist/novel_epub_work"));

        let bare = OptimizeOptions::new("novel.epub", "out.epub", &AppConfig::default());
        assert_eq!(bare.work_dir(), PathBuf::from("./novel_epub_work"));
    }

    #[test]
    fn missing_config_file_gives_defaults() {
        let cfg = load_config_from(Path::new("/nonexistent/epub-optimizer.toml"));
        assert_eq!(cfg.images.jpeg_quality, 70);
    }
}
