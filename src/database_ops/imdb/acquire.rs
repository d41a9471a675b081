use super::catalog::ImdbFileKind;
use super::error::AcquisitionError;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzDecoder;
use futures::StreamExt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, instrument};

/// Compressed chunks buffered between the HTTP stream and the inflating writer.
const INFLATE_QUEUE_DEPTH: usize = 32;

/// Produces a decompressed local copy of one dataset file.
#[async_trait]
pub trait FileAcquirer: Send + Sync {
    async fn download(&self, kind: ImdbFileKind) -> Result<PathBuf, AcquisitionError>;
}

/// Streams the gzip dumps over HTTP and inflates them on the fly into
/// `download_dir`, so the compressed file never touches the disk.
pub struct HttpAcquirer {
    client: reqwest::Client,
    base_url: String,
    download_dir: PathBuf,
}

impl HttpAcquirer {
    pub fn new(
        base_url: impl Into<String>,
        download_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("imdbgraph-updater/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, base_url, download_dir))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            download_dir: download_dir.into(),
        }
    }
}

fn is_corrupt_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
    )
}

/// Inflates the chunks received on `chunks` into `dest` until the sender hangs up.
/// Runs on the blocking pool.
fn inflate_to_file(
    mut chunks: mpsc::Receiver<Bytes>,
    url: &str,
    dest: &Path,
) -> Result<(), AcquisitionError> {
    let file = File::create(dest).map_err(|source| AcquisitionError::Io {
        path: dest.to_path_buf(),
        source,
    })?;
    let mut decoder = GzDecoder::new(BufWriter::with_capacity(1 << 20, file));
    while let Some(chunk) = chunks.blocking_recv() {
        decoder
            .write_all(&chunk)
            .map_err(|e| inflate_error(url, dest, e))?;
    }
    let mut writer = decoder.finish().map_err(|e| inflate_error(url, dest, e))?;
    writer.flush().map_err(|source| AcquisitionError::Io {
        path: dest.to_path_buf(),
        source,
    })
}

fn inflate_error(url: &str, path: &Path, source: io::Error) -> AcquisitionError {
    if is_corrupt_stream(&source) {
        AcquisitionError::Decompress {
            url: url.to_string(),
            path: path.to_path_buf(),
            source,
        }
    } else {
        AcquisitionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl FileAcquirer for HttpAcquirer {
    #[instrument(skip(self), fields(kind = %kind))]
    async fn download(&self, kind: ImdbFileKind) -> Result<PathBuf, AcquisitionError> {
        let url = kind.download_url(&self.base_url);
        let dest = self.download_dir.join(kind.local_file_name());
        let started = Instant::now();

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| AcquisitionError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AcquisitionError::Status { url, status });
        }

        let (chunks, rx) = mpsc::channel::<Bytes>(INFLATE_QUEUE_DEPTH);
        let writer = {
            let url = url.clone();
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || inflate_to_file(rx, &url, &dest))
        };

        let mut compressed_bytes: u64 = 0;
        let mut interrupted = None;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => {
                    compressed_bytes += chunk.len() as u64;
                    // Closed only when the writer bailed out; its error wins below.
                    if chunks.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(source) => {
                    interrupted = Some(source);
                    break;
                }
            }
        }
        drop(chunks);

        let written = writer.await.map_err(|e| AcquisitionError::Io {
            path: dest.clone(),
            source: io::Error::other(e),
        })?;
        if let Some(source) = interrupted {
            return Err(AcquisitionError::Interrupted {
                url,
                path: dest,
                source,
            });
        }
        written?;

        info!(
            url = %url,
            dest = %dest.display(),
            compressed_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "downloaded file"
        );
        Ok(dest)
    }
}
