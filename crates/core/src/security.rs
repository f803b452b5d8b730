//! Archive hardening applied during extraction: zip-slip guards and size limits.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SecurityError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityLimits {
    /// Most entries an input archive may hold.
    pub max_file_count: u64,
    /// Ceiling on the inflated size of all entries together.
    pub max_total_size_bytes: u64,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_file_count: 10_000,
            max_total_size_bytes: 1 << 30,
        }
    }
}

/// Turn an archive entry name into a path relative to the extraction root.
///
/// Absolute names, drive prefixes and any `..` segment are rejected, with
/// either separator. `.` segments and empty segments are dropped.
pub fn safe_entry_path(entry_name: &str) -> Result<PathBuf, SecurityError> {
    let reject = || SecurityError::PathTraversal {
        path: entry_name.to_string(),
    };

    let unified = entry_name.replace('\\', "/");
    if unified.starts_with('/') || unified.as_bytes().get(1) == Some(&b':') {
        return Err(reject());
    }

    let mut relative = PathBuf::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(reject()),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(reject());
    }
    Ok(relative)
}

pub fn check_file_count(count: u64, limits: &SecurityLimits) -> Result<(), SecurityError> {
    if count > limits.max_file_count {
        return Err(SecurityError::TooManyFiles {
            count,
            limit: limits.max_file_count,
        });
    }
    Ok(())
}

/// Called with the declared total before extraction and with the running
/// inflated total during it.
pub fn check_total_size(total_bytes: u64, limits: &SecurityLimits) -> Result<(), SecurityError> {
    const MB: u64 = 1024 * 1024;
    if total_bytes <= limits.max_total_size_bytes {
        return Ok(());
    }
    Err(SecurityError::OversizedArchive {
        size_mb: total_bytes / MB,
        limit_mb: limits.max_total_size_bytes / MB,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn package_entries_map_to_relative_paths() {
        assert_eq!(safe_entry_path("mimetype").unwrap(), PathBuf::from("mimetype"));
        assert_eq!(
            safe_entry_path("OEBPS/./images/cover.jpg").unwrap(),
            Path::new("OEBPS").join("images").join("cover.jpg")
        );
        assert_eq!(
            safe_entry_path("OPS\\text\\ch1.xhtml").unwrap(),
            Path::new("OPS").join("text").join("ch1.xhtml")
        );
        assert_eq!(safe_entry_path("META-INF/").unwrap(), PathBuf::from("META-INF"));
    }

    #[test]
    fn escaping_entries_are_rejected() {
        for name in [
            "../../../etc/passwd",
            "OPS/../../etc/shadow",
            "/etc/passwd",
            "\\Windows\\System32\\config",
            "OPS\\..\\..\\boot.ini",
            "C:\\Windows\\System32",
            "./",
        ] {
            assert!(
                matches!(safe_entry_path(name), Err(SecurityError::PathTraversal { .. })),
                "{name} accepted"
            );
        }
    }

    #[test]
    fn entry_count_limit_is_inclusive() {
        let limits = SecurityLimits::default();
        assert!(check_file_count(10_000, &limits).is_ok());
        assert!(check_file_count(10_001, &limits).is_err());
    }

    #[test]
    fn oversize_reports_megabytes() {
        let limits = SecurityLimits {
            max_total_size_bytes: 1024 * 1024,
            ..SecurityLimits::default()
        };
        assert!(check_total_size(1024 * 1024, &limits).is_ok());
        let err = check_total_size(3 * 1024 * 1024, &limits).unwrap_err();
        assert!(matches!(err, SecurityError::OversizedArchive { size_mb: 3, limit_mb: 1 }));
    }
}
