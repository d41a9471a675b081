use super::catalog::ImdbFileKind;
use super::records::RecordError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure while fetching or decompressing one of the dataset files.
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("request for {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download of {url} interrupted (partial output at {})", path.display())]
    Interrupted {
        url: String,
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered with HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("{url} is not a valid gzip stream (partial output at {})", path.display())]
    Decompress {
        url: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed writing {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AcquisitionError {
    /// Local file the failed download may have left behind.
    pub fn partial_file(&self) -> Option<&Path> {
        match self {
            AcquisitionError::Interrupted { path, .. }
            | AcquisitionError::Decompress { path, .. }
            | AcquisitionError::Io { path, .. } => Some(path),
            AcquisitionError::Request { .. } | AcquisitionError::Status { .. } => None,
        }
    }
}

/// Failure while bulk-loading one decompressed file into its staging table.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file is empty (no header line)")]
    EmptyFile,
    #[error("malformed row at line {line}: {cause}")]
    MalformedRow {
        line: u64,
        #[source]
        cause: RecordError,
    },
    #[error("failed reading file")]
    Io(#[from] std::io::Error),
    #[error("database rejected staged rows")]
    Copy(#[source] tokio_postgres::Error),
}

/// Failure in one step of the staging-to-durable merge.
#[derive(Debug, Error)]
#[error("merge step `{step}` failed")]
pub struct MergeError {
    pub step: &'static str,
    #[source]
    pub source: tokio_postgres::Error,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to acquire {kind} file")]
    Acquisition {
        kind: ImdbFileKind,
        #[source]
        source: AcquisitionError,
    },
    #[error("failed to load {kind} file from {}", path.display())]
    Load {
        kind: ImdbFileKind,
        path: PathBuf,
        #[source]
        source: LoadError,
    },
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error("database error during {context}")]
    Database {
        context: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },
    #[error("another update run holds the pipeline lock")]
    AlreadyRunning,
    #[error("failed preparing {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    pub(crate) fn database(context: &'static str) -> impl FnOnce(tokio_postgres::Error) -> Self {
        move |source| PipelineError::Database { context, source }
    }
}
