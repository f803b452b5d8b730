pub mod archive;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod locate;
pub mod markup;
pub mod pipeline;
pub mod progress;
pub mod security;
pub mod stages;
pub mod structure;
pub mod validate;

pub mod prelude {
    pub use crate::config::{AppConfig, OptimizeOptions};
    pub use crate::error::*;
    pub use crate::pipeline::{optimize, OptimizeReport, PipelineState, SizeReport};
    pub use crate::progress::{ProgressEvent, ProgressHandler};
}
