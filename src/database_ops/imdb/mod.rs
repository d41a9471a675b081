//! The IMDb flat-file update pipeline.

pub mod acquire;
pub mod archive;
pub mod catalog;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod records;
pub mod staging;

pub use acquire::{FileAcquirer, HttpAcquirer};
pub use archive::{Clock, FileArchiver, FixedClock, SystemClock};
pub use catalog::ImdbFileKind;
pub use error::{AcquisitionError, LoadError, MergeError, PipelineError};
pub use pipeline::{ArchivePolicy, PipelineSettings, RunReport, UpdatePipeline};
