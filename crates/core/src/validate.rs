//! External conformance check of the packaged output.
//!
//! The checker is `epubcheck`, run as `<java> -jar <epubcheck_path> <output>`.
//! Its verdict is its exit status; its rules are its own business.

use std::path::Path;
use std::process::Command;

use serde::Serialize;

use crate::config::ValidatorOptions;
use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum ValidationOutcome {
    Passed,
    /// The checker ran and rejected the file.
    Failed { code: i32 },
    Skipped { reason: String },
}

/// Run the checker against `epub`. A disabled checker or a missing jar is a
/// logged skip; a launcher that cannot be started is an error.
pub fn validate_epub(epub: &Path, opts: &ValidatorOptions) -> Result<ValidationOutcome, ValidationError> {
    if !opts.enabled {
        return Ok(skipped("validation disabled"));
    }
    if !opts.epubcheck_path.is_file() {
        tracing::warn!(
            "epubcheck not found at {}; skipping validation",
            opts.epubcheck_path.display()
        );
        return Ok(skipped("epubcheck jar not found"));
    }

    tracing::info!("Validating EPUB: {}", epub.display());
    let output = Command::new(&opts.java)
        .arg("-jar")
        .arg(&opts.epubcheck_path)
        .arg(epub)
        .output()
        .map_err(|source| ValidationError::Launch {
            command: opts.java.clone(),
            source,
        })?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        tracing::info!("epubcheck: {}", line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        tracing::warn!("epubcheck: {}", line);
    }

    if output.status.success() {
        tracing::info!("EPUB validation passed");
        Ok(ValidationOutcome::Passed)
    } else {
        // Killed by a signal: no code, report a generic failure.
        let code = output.status.code().unwrap_or(1);
        tracing::error!("EPUB validation failed with exit code {}", code);
        Ok(ValidationOutcome::Failed { code })
    }
}

fn skipped(reason: &str) -> ValidationOutcome {
    ValidationOutcome::Skipped {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn disabled_checker_is_skipped() {
        let opts = ValidatorOptions {
            enabled: false,
            ..ValidatorOptions::default()
        };
        assert!(matches!(
            validate_epub(Path::new("book.epub"), &opts).unwrap(),
            ValidationOutcome::Skipped { .. }
        ));
    }

    #[test]
    fn missing_jar_is_skipped() {
        let opts = ValidatorOptions {
            epubcheck_path: PathBuf::from("/nonexistent/epubcheck.jar"),
            ..ValidatorOptions::default()
        };
        assert_eq!(
            validate_epub(Path::new("book.epub"), &opts).unwrap(),
            skipped("epubcheck jar not found")
        );
    }

    #[test]
    fn unlaunchable_java_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("epubcheck.jar");
        std::fs::write(&jar, b"").unwrap();
        let opts = ValidatorOptions {
            enabled: true,
            epubcheck_path: jar,
            java: dir.path().join("no-such-java").display().to_string(),
        };
        assert!(matches!(
            validate_epub(Path::new("book.epub"), &opts),
            Err(ValidationError::Launch { .. })
        ));
    }

    #[cfg(unix)]
    fn fake_java(dir: &Path, exit_code: i32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join(format!("java-{exit_code}"));
        std::fs::write(&script, format!("#!/bin/sh\necho \"checked $3\"\nexit {exit_code}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.display().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_is_the_verdict() {
        let dir = tempfile::tempdir().unwrap();
        let jar = dir.path().join("epubcheck.jar");
        std::fs::write(&jar, b"").unwrap();

        let launchers = [
            (fake_java(dir.path(), 0), ValidationOutcome::Passed),
            (fake_java(dir.path(), 3), ValidationOutcome::Failed { code: 3 }),
        ];
        for (java, expected) in launchers {
            let opts = ValidatorOptions {
                enabled: true,
                epubcheck_path: jar.clone(),
                java,
            };
            assert_eq!(validate_epub(Path::new("book.epub"), &opts).unwrap(), expected);
        }
    }
}
