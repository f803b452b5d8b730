//! Stage 1: canonicalize character entities in every content document.

use std::path::Path;

use crate::error::StageError;
use crate::fsutil;
use crate::markup::{self, ParseMode};

use super::{Stage, StageContext, StageReport};

pub struct DecodeEntities;

impl Stage for DecodeEntities {
    fn name(&self) -> &'static str {
        "decode-entities"
    }

    fn run(&self, ctx: &StageContext<'_>) -> StageReport {
        let mut report = StageReport::new(self.name());
        for path in fsutil::content_documents(ctx.content_root) {
            let before = fsutil::file_size(&path);
            match decode_file(&path) {
                Ok(true) => report.record_change(before, fsutil::file_size(&path)),
                Ok(false) => report.record_skip(),
                Err(e) => report.record_failure(&path, &e),
            }
        }
        report
    }
}

fn decode_file(path: &Path) -> Result<bool, StageError> {
    let mut doc = markup::read_document(path, ParseMode::Xhtml)?;
    if !markup::canonicalize_entities(&mut doc) {
        return Ok(false);
    }
    markup::write_document(path, &doc)?;
    tracing::debug!("Canonicalized entities in {}", path.display());
    Ok(true)
}
