//! Stage 3: minify standalone JavaScript assets.

use std::path::Path;

use crate::error::StageError;
use crate::fsutil;

use super::minify::minify_js;
use super::{Stage, StageContext, StageReport};

pub struct MinifyScripts;

impl Stage for MinifyScripts {
    fn name(&self) -> &'static str {
        "minify-scripts"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let mut report = StageReport::new(self.name());
        if !ctx.options.html.minify_js {
            tracing::info!("JavaScript minification disabled");
            return report;
        }

        for path in fsutil::files_with_extensions(ctx.content_root, &["js", "mjs"]) {
            match minify_script_file(&path) {
                Ok(Some((before, after))) => report.record_change(before, after),
                Ok(None) => report.record_skip(),
                Err(e) => report.record_failure(&path, &e),
            }
        }
        report
    }
}

fn minify_script_file(path: &Path) -> Result<Option<(u64, u64)>, StageError> {
    let original = std::fs::read_to_string(path)?;
    if original.trim().is_empty() {
        tracing::info!("Skipping empty file: {}", path.display());
        return Ok(None);
    }

    let minified = minify_js(&original);
    let (before, after) = (original.len() as u64, minified.len() as u64);
    if minified.trim().is_empty() || after >= before {
        tracing::debug!("No reduction for {}", path.display());
        return Ok(None);
    }

    fsutil::replace_file(path, minified.as_bytes())?;
    tracing::info!(
        "Minified {}: {} bytes -> {} bytes ({}% smaller)",
        path.display(),
        before,
        after,
        (before - after) * 100 / before
    );
    Ok(Some((before, after)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testutil;
    use pretty_assertions::assert_eq;

    #[test]
    fn minifies_and_skips_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("js")).unwrap();
        let source = "// greeting\nfunction greet(name) {\n    var message = 'Hello, ' + name;\n    return message;\n}\n";
        std::fs::write(dir.path().join("js/app.js"), source).unwrap();
        std::fs::write(dir.path().join("js/empty.js"), "  \n").unwrap();

        let opts = testutil::options();
        let report = MinifyScripts.run(&testutil::context(dir.path(), &opts));
        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped, 1);

        let minified = std::fs::read_to_string(dir.path().join("js/app.js")).unwrap();
        assert!(minified.len() < source.len());
        assert!(!minified.contains("// greeting"));
        assert_eq!(std::fs::read_to_string(dir.path().join("js/empty.js")).unwrap(), "  \n");
    }
}
