//! Bulk loading of a decompressed dataset file into its staging table.
//!
//! Lines are validated one at a time and forwarded to `COPY ... FROM STDIN` in
//! byte-bounded batches, so memory use does not depend on file size.

use super::catalog::ImdbFileKind;
use super::error::LoadError;
use super::records::{validate_header, validate_line, RecordError, NULL_FIELD};
use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_postgres::{CopyInSink, Transaction};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_BATCH_BYTES: usize = 4 * 1024 * 1024;

/// Creates the staging table for `kind` inside `tx` and copies every data row
/// of `path` into it. Returns the number of rows the server accepted.
#[instrument(skip(tx), fields(kind = %kind, path = %path.display()))]
pub async fn load(
    tx: &Transaction<'_>,
    kind: ImdbFileKind,
    path: &Path,
    batch_bytes: usize,
) -> Result<u64, LoadError> {
    let started = Instant::now();
    let file = tokio::fs::File::open(path).await?;
    let reader = BufReader::with_capacity(1 << 20, file);
    let mut batches = BatchReader::open(reader, kind, batch_bytes).await?;

    tx.batch_execute(kind.staging_ddl())
        .await
        .map_err(LoadError::Copy)?;

    let stmt = kind.copy_statement();
    let sink: CopyInSink<Bytes> = tx
        .copy_in(stmt.as_str())
        .await
        .map_err(LoadError::Copy)?;
    tokio::pin!(sink);

    let mut sent_batches = 0u64;
    // Returning early drops the sink unfinished, which aborts the COPY.
    while let Some(batch) = batches.next_batch().await? {
        sink.send(batch).await.map_err(LoadError::Copy)?;
        sent_batches += 1;
        if sent_batches % 64 == 0 {
            debug!(rows = batches.rows(), "copy progress");
        }
    }
    let copied = sink.as_mut().finish().await.map_err(LoadError::Copy)?;

    if copied != batches.rows() {
        warn!(
            copied,
            validated = batches.rows(),
            "server row count differs from validated lines"
        );
    }
    info!(
        table = kind.staging_table(),
        rows = copied,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "staged"
    );
    Ok(copied)
}

/// Reads a dataset file line by line, validates each row, and hands back
/// newline-terminated batches in the `COPY` text format.
pub(crate) struct BatchReader<R> {
    reader: R,
    kind: ImdbFileKind,
    batch_bytes: usize,
    line: Vec<u8>,
    buf: BytesMut,
    line_no: u64,
    rows: u64,
    eof: bool,
}

impl<R: AsyncBufRead + Unpin> BatchReader<R> {
    /// Consumes and checks the header line.
    pub(crate) async fn open(
        mut reader: R,
        kind: ImdbFileKind,
        batch_bytes: usize,
    ) -> Result<Self, LoadError> {
        let mut line = Vec::with_capacity(256);
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Err(LoadError::EmptyFile);
        }
        let header = as_text(trim_line_end(&line)).map_err(|cause| LoadError::MalformedRow {
            line: 1,
            cause,
        })?;
        validate_header(kind, header)
            .map_err(|cause| LoadError::MalformedRow { line: 1, cause })?;

        let batch_bytes = batch_bytes.max(1);
        Ok(Self {
            reader,
            kind,
            batch_bytes,
            line,
            buf: BytesMut::with_capacity(batch_bytes.min(DEFAULT_BATCH_BYTES) + 1024),
            line_no: 1,
            rows: 0,
            eof: false,
        })
    }

    /// Next batch of at least `batch_bytes` bytes, or the remainder at end of file.
    pub(crate) async fn next_batch(&mut self) -> Result<Option<Bytes>, LoadError> {
        while !self.eof {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                self.eof = true;
                break;
            }
            self.line_no += 1;

            let content = trim_line_end(&self.line);
            let line_no = self.line_no;
            as_text(content)
                .and_then(|text| validate_line(self.kind, text))
                .map_err(|cause| LoadError::MalformedRow {
                    line: line_no,
                    cause,
                })?;

            push_copy_row(&mut self.buf, content);
            self.rows += 1;

            if self.buf.len() >= self.batch_bytes {
                return Ok(Some(self.buf.split().freeze()));
            }
        }
        if self.buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.buf.split().freeze()))
        }
    }

    /// Data rows validated so far (header excluded).
    pub(crate) fn rows(&self) -> u64 {
        self.rows
    }
}

/// Appends one row in `COPY` text format. Backslashes in the dumps are
/// literal, so every one is doubled except in the `\N` null marker.
fn push_copy_row(buf: &mut BytesMut, line: &[u8]) {
    if memchr::memchr(b'\\', line).is_none() {
        buf.extend_from_slice(line);
    } else {
        for (i, field) in line.split(|&b| b == b'\t').enumerate() {
            if i > 0 {
                buf.put_u8(b'\t');
            }
            if field == NULL_FIELD.as_bytes() {
                buf.extend_from_slice(field);
                continue;
            }
            let mut rest = field;
            while let Some(pos) = memchr::memchr(b'\\', rest) {
                buf.extend_from_slice(&rest[..=pos]);
                buf.put_u8(b'\\');
                rest = &rest[pos + 1..];
            }
            buf.extend_from_slice(rest);
        }
    }
    buf.put_u8(b'\n');
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn as_text(bytes: &[u8]) -> Result<&str, RecordError> {
    std::str::from_utf8(bytes).map_err(|_| RecordError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATINGS: &str = "tconst\taverageRating\tnumVotes\n\
                           tt0000001\t5.7\t2100\n\
                           tt0000002\t5.6\t283\n\
                           tt0000003\t6.5\t2111\n";

    async fn collect(
        input: &[u8],
        kind: ImdbFileKind,
        batch_bytes: usize,
    ) -> Result<(Vec<Bytes>, u64), LoadError> {
        let mut reader = BatchReader::open(input, kind, batch_bytes).await?;
        let mut out = Vec::new();
        while let Some(b) = reader.next_batch().await? {
            out.push(b);
        }
        Ok((out, reader.rows()))
    }

    #[tokio::test]
    async fn header_is_skipped_and_rows_are_forwarded() {
        let (batches, rows) = collect(RATINGS.as_bytes(), ImdbFileKind::Ratings, 1 << 20)
            .await
            .unwrap();
        assert_eq!(rows, 3);
        assert_eq!(batches.len(), 1);
        assert_eq!(
            &batches[0][..],
            b"tt0000001\t5.7\t2100\ntt0000002\t5.6\t283\ntt0000003\t6.5\t2111\n"
        );
    }

    #[tokio::test]
    async fn batches_flush_at_byte_threshold() {
        let (batches, rows) = collect(RATINGS.as_bytes(), ImdbFileKind::Ratings, 10)
            .await
            .unwrap();
        assert_eq!(rows, 3);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.ends_with(b"\n")));
    }

    #[tokio::test]
    async fn missing_final_newline_and_crlf_are_normalized() {
        let input = b"tconst\taverageRating\tnumVotes\r\ntt0000001\t5.7\t2100\r\ntt0000002\t5.6\t283";
        let (batches, rows) = collect(input, ImdbFileKind::Ratings, 1 << 20).await.unwrap();
        assert_eq!(rows, 2);
        assert_eq!(&batches[0][..], b"tt0000001\t5.7\t2100\ntt0000002\t5.6\t283\n");
    }

    #[tokio::test]
    async fn empty_input_is_empty_file() {
        let err = collect(b"", ImdbFileKind::Titles, 1024).await.unwrap_err();
        assert!(matches!(err, LoadError::EmptyFile), "{err:?}");
    }

    #[tokio::test]
    async fn header_only_yields_no_batches() {
        let header = b"tconst\tparentTconst\tseasonNumber\tepisodeNumber\n";
        let (batches, rows) = collect(header, ImdbFileKind::Episodes, 1024).await.unwrap();
        assert!(batches.is_empty());
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn header_with_wrong_arity_is_line_one() {
        let err = collect(RATINGS.as_bytes(), ImdbFileKind::Episodes, 1024)
            .await
            .unwrap_err();
        match err {
            LoadError::MalformedRow { line, cause } => {
                assert_eq!(line, 1);
                assert_eq!(cause, RecordError::FieldCount { expected: 4, found: 3 });
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_row_reports_file_line_number() {
        let input = "tconst\tparentTconst\tseasonNumber\tepisodeNumber\n\
                     tt0041951\ttt0041038\t1\t9\n\
                     tt0042816\ttt0989125\t1\n";
        let err = collect(input.as_bytes(), ImdbFileKind::Episodes, 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::MalformedRow { line: 3, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn invalid_utf8_is_malformed() {
        let mut input = b"tconst\taverageRating\tnumVotes\ntt0000001\t5.7\t".to_vec();
        input.extend_from_slice(&[0xff, 0xfe, b'\n']);
        let err = collect(&input, ImdbFileKind::Ratings, 1024).await.unwrap_err();
        match err {
            LoadError::MalformedRow { line, cause } => {
                assert_eq!(line, 2);
                assert_eq!(cause, RecordError::InvalidUtf8);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn backslashes_are_escaped_for_copy() {
        let input = "tconst\ttitleType\tprimaryTitle\toriginalTitle\tisAdult\tstartYear\tendYear\truntimeMinutes\tgenres\n\
                     tt0000009\ttvSeries\tC:\\new\\Show\tTrailing\\\t0\t1999\t\\N\t\\N\t\\N\n";
        let (batches, rows) = collect(input.as_bytes(), ImdbFileKind::Titles, 1 << 20)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(
            std::str::from_utf8(&batches[0]).unwrap(),
            "tt0000009\ttvSeries\tC:\\\\new\\\\Show\tTrailing\\\\\t0\t1999\t\\N\t\\N\t\\N\n"
        );
    }
}
