use std::path::PathBuf;

/// Top-level error type. Everything that can abort a pipeline run ends up here.
#[derive(Debug, thiserror::Error)]
pub enum OptimizeError {
    #[error("Input file not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("Could not create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Validator error: {0}")]
    Validation(#[from] ValidationError),

    /// The conformance checker ran and rejected the output. Not a processing defect.
    #[error("EPUB validation failed with exit code {code}")]
    ValidationFailed { code: i32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OptimizeError {
    /// Process exit code for this outcome. Validation failures propagate the
    /// checker's own status; everything else is a plain failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            OptimizeError::ValidationFailed { code } if *code != 0 => *code,
            _ => 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Path traversal detected in archive entry: {path}")]
    PathTraversal { path: String },

    #[error("Archive contains {count} files, exceeding limit of {limit}")]
    TooManyFiles { count: u64, limit: u64 },

    #[error("Archive expands to {size_mb}MB, exceeding limit of {limit_mb}MB")]
    OversizedArchive { size_mb: u64, limit_mb: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Failed to extract {}: {detail}", path.display())]
    Extraction { path: PathBuf, detail: String },

    #[error("Failed to compress {}: {detail}", path.display())]
    Compression { path: PathBuf, detail: String },

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error("Container file not found: {}", .0.display())]
    ContainerNotFound(PathBuf),

    #[error("No OPF path found in {}", .0.display())]
    OpfReferenceMissing(PathBuf),

    #[error("OPF file not found: {}", .0.display())]
    OpfFileMissing(PathBuf),

    #[error("Malformed {}: {detail}", path.display())]
    Malformed { path: PathBuf, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum MarkupError {
    #[error("Markup parse error at byte {position}: {detail}")]
    Parse { detail: String, position: u64 },

    #[error("Document is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A failure confined to one asset. Stages catch these, log them and move on.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{stage} failed for {}: {detail}", path.display())]
    Failed {
        stage: &'static str,
        path: PathBuf,
        detail: String,
    },

    #[error(transparent)]
    Markup(#[from] MarkupError),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Could not launch validator `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
