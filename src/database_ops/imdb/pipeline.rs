//! End-to-end update run: acquire, stage, merge, commit.
//!
//! A session-level advisory lock is held for the whole run. The downloads
//! happen outside any transaction; staging and merging share one, so readers
//! see either the previous data set or the new one. On failure the
//! transaction is rolled back and the files implicated by the failing step
//! are moved into the archive for inspection; every other download is removed.

use super::acquire::FileAcquirer;
use super::archive::FileArchiver;
use super::catalog::ImdbFileKind;
use super::error::PipelineError;
use super::merge::{self, MergeSummary};
use super::staging::{self, DEFAULT_BATCH_BYTES};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tokio_postgres::{Client, Transaction};
use tracing::{error, info, instrument, warn};

/// Key for the session advisory lock; any two runs against one database contend on it.
pub const UPDATE_LOCK_KEY: i64 = 0x696d_6462_7570_6474;

/// Which files a failed run moves into the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchivePolicy {
    /// Only the file(s) the failing step points at.
    #[default]
    Implicated,
    /// Every file acquired during the run.
    All,
}

impl FromStr for ArchivePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "implicated" => Ok(ArchivePolicy::Implicated),
            "all" => Ok(ArchivePolicy::All),
            other => Err(format!(
                "unknown archive policy {other:?} (expected `implicated` or `all`)"
            )),
        }
    }
}

impl fmt::Display for ArchivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchivePolicy::Implicated => "implicated",
            ArchivePolicy::All => "all",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Acquiring,
    Staging,
    Merging,
    Committed,
    Archiving,
    Failed,
}

/// Outcome of a committed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_date: NaiveDate,
    pub staged_rows: BTreeMap<ImdbFileKind, u64>,
    pub shows_upserted: u64,
    pub episodes_upserted: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub download_dir: PathBuf,
    pub archive_policy: ArchivePolicy,
    pub parallel_downloads: bool,
    pub copy_batch_bytes: usize,
}

impl PipelineSettings {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            archive_policy: ArchivePolicy::default(),
            parallel_downloads: true,
            copy_batch_bytes: DEFAULT_BATCH_BYTES,
        }
    }
}

pub struct UpdatePipeline<A> {
    acquirer: A,
    archiver: FileArchiver,
    settings: PipelineSettings,
}

impl<A: FileAcquirer> UpdatePipeline<A> {
    pub fn new(acquirer: A, archiver: FileArchiver, settings: PipelineSettings) -> Self {
        Self {
            acquirer,
            archiver,
            settings,
        }
    }

    /// Replaces the durable tables' content with the latest dataset files.
    ///
    /// Fails with [`PipelineError::AlreadyRunning`] without side effects when
    /// another run holds the update lock on the same database.
    #[instrument(skip_all, fields(policy = %self.settings.archive_policy))]
    pub async fn update_database(&self, client: &mut Client) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let mut state = PipelineState::Idle;

        let dir = &self.settings.download_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| PipelineError::Io {
                path: dir.clone(),
                source,
            })?;

        let locked: bool = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&UPDATE_LOCK_KEY])
            .await
            .map_err(PipelineError::database("advisory lock"))?
            .get(0);
        if !locked {
            warn!("update lock held by another session");
            return Err(PipelineError::AlreadyRunning);
        }

        let mut acquired: Vec<(ImdbFileKind, PathBuf)> = Vec::with_capacity(3);
        let outcome = self.run(client, &mut state, &mut acquired).await;
        release_lock(client).await;

        let paths: Vec<PathBuf> = acquired.into_iter().map(|(_, p)| p).collect();
        match outcome {
            Ok(merged) => {
                transition(&mut state, PipelineState::Committed);
                remove_downloads(&paths).await;
                let report = RunReport {
                    run_date: self.archiver.today(),
                    staged_rows: merged.staged_rows,
                    shows_upserted: merged.summary.shows,
                    episodes_upserted: merged.summary.episodes,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                };
                info!(
                    shows = report.shows_upserted,
                    episodes = report.episodes_upserted,
                    elapsed_ms = report.elapsed_ms,
                    "update committed"
                );
                Ok(report)
            }
            Err(err) => {
                transition(&mut state, PipelineState::Archiving);
                let to_archive = files_to_archive(self.settings.archive_policy, &err, &paths);
                self.archive_files(to_archive).await;
                remove_downloads(&paths).await;
                transition(&mut state, PipelineState::Failed);
                error!(error = ?err, "update failed");
                Err(err)
            }
        }
    }

    /// Downloads outside any transaction, then stages and merges inside one.
    async fn run(
        &self,
        client: &mut Client,
        state: &mut PipelineState,
        acquired: &mut Vec<(ImdbFileKind, PathBuf)>,
    ) -> Result<Merged, PipelineError> {
        transition(state, PipelineState::Acquiring);
        self.acquire(acquired).await?;

        let tx = client
            .transaction()
            .await
            .map_err(PipelineError::database("begin"))?;
        match self.stage_and_merge(&tx, state, acquired).await {
            Ok(merged) => {
                tx.commit()
                    .await
                    .map_err(PipelineError::database("commit"))?;
                Ok(merged)
            }
            Err(err) => {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn stage_and_merge(
        &self,
        tx: &Transaction<'_>,
        state: &mut PipelineState,
        acquired: &[(ImdbFileKind, PathBuf)],
    ) -> Result<Merged, PipelineError> {
        transition(state, PipelineState::Staging);
        let mut staged_rows = BTreeMap::new();
        for (kind, path) in acquired {
            let rows = staging::load(tx, *kind, path, self.settings.copy_batch_bytes)
                .await
                .map_err(|source| PipelineError::Load {
                    kind: *kind,
                    path: path.clone(),
                    source,
                })?;
            staged_rows.insert(*kind, rows);
        }

        transition(state, PipelineState::Merging);
        let summary = merge::merge(tx).await?;
        Ok(Merged {
            staged_rows,
            summary,
        })
    }

    /// Downloads every kind, in catalog order. Successful downloads are
    /// recorded in `acquired` even when another one fails.
    async fn acquire(
        &self,
        acquired: &mut Vec<(ImdbFileKind, PathBuf)>,
    ) -> Result<(), PipelineError> {
        if self.settings.parallel_downloads {
            let results = futures::future::join_all(
                ImdbFileKind::ALL
                    .map(|kind| async move { (kind, self.acquirer.download(kind).await) }),
            )
            .await;
            let mut first_err = None;
            for (kind, result) in results {
                match result {
                    Ok(path) => acquired.push((kind, path)),
                    Err(source) => {
                        if let Some(partial) = source.partial_file() {
                            acquired.push((kind, partial.to_path_buf()));
                        }
                        if first_err.is_none() {
                            first_err = Some(PipelineError::Acquisition { kind, source });
                        } else {
                            warn!(kind = %kind, error = %source, "additional download failure");
                        }
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        } else {
            for kind in ImdbFileKind::ALL {
                match self.acquirer.download(kind).await {
                    Ok(path) => acquired.push((kind, path)),
                    Err(source) => {
                        if let Some(partial) = source.partial_file() {
                            acquired.push((kind, partial.to_path_buf()));
                        }
                        return Err(PipelineError::Acquisition { kind, source });
                    }
                }
            }
            Ok(())
        }
    }

    async fn archive_files(&self, files: Vec<PathBuf>) {
        let archiver = self.archiver.clone();
        let archived = tokio::task::spawn_blocking(move || {
            let present: Vec<&Path> = files
                .iter()
                .map(PathBuf::as_path)
                .filter(|p| p.exists())
                .collect();
            if present.is_empty() {
                return Ok(Vec::new());
            }
            archiver.archive(&present)
        })
        .await;
        // Never mask the pipeline error with an archive error.
        match archived {
            Ok(Ok(dests)) if dests.is_empty() => {}
            Ok(Ok(dests)) => info!(
                archived = dests.len(),
                capacity = self.archiver.capacity().get(),
                archive_dir = %self.archiver.dir().display(),
                "archived failing input"
            ),
            Ok(Err(e)) => error!(error = %e, "failed to archive input files"),
            Err(e) => error!(error = %e, "archive task panicked"),
        }
    }
}

async fn remove_downloads(files: &[PathBuf]) {
    for path in files {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove download"),
        }
    }
}

async fn release_lock(client: &Client) {
    match client
        .query_one("SELECT pg_advisory_unlock($1)", &[&UPDATE_LOCK_KEY])
        .await
    {
        Ok(row) => {
            let released: bool = row.get(0);
            if !released {
                warn!("update lock was not held at release");
            }
        }
        // A dead session has already dropped its locks.
        Err(e) => warn!(error = %e, "failed to release update lock"),
    }
}

struct Merged {
    staged_rows: BTreeMap<ImdbFileKind, u64>,
    summary: MergeSummary,
}

fn transition(state: &mut PipelineState, next: PipelineState) {
    info!(from = ?*state, to = ?next, "pipeline state");
    *state = next;
}

/// Files a failed run moves into the archive, given everything it acquired
/// (partial downloads included).
pub(crate) fn files_to_archive(
    policy: ArchivePolicy,
    err: &PipelineError,
    acquired: &[PathBuf],
) -> Vec<PathBuf> {
    let implicated: Vec<PathBuf> = match err {
        PipelineError::Acquisition { source, .. } => {
            source.partial_file().map(Path::to_path_buf).into_iter().collect()
        }
        PipelineError::Load { path, .. } => vec![path.clone()],
        PipelineError::Merge(_) => acquired.to_vec(),
        PipelineError::Database { .. } | PipelineError::AlreadyRunning | PipelineError::Io { .. } => {
            return Vec::new()
        }
    };
    match policy {
        ArchivePolicy::Implicated => implicated,
        ArchivePolicy::All => {
            let mut seen = BTreeSet::new();
            acquired
                .iter()
                .chain(implicated.iter())
                .filter(|p| seen.insert(p.as_path()))
                .cloned()
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::imdb::error::{AcquisitionError, LoadError, MergeError};

    fn acquired() -> Vec<PathBuf> {
        ImdbFileKind::ALL
            .iter()
            .map(|k| Path::new("/data").join(k.local_file_name()))
            .collect()
    }

    fn load_error(kind: ImdbFileKind) -> PipelineError {
        PipelineError::Load {
            kind,
            path: Path::new("/data").join(kind.local_file_name()),
            source: LoadError::EmptyFile,
        }
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("implicated".parse::<ArchivePolicy>(), Ok(ArchivePolicy::Implicated));
        assert_eq!(" ALL ".parse::<ArchivePolicy>(), Ok(ArchivePolicy::All));
        assert!("everything".parse::<ArchivePolicy>().is_err());
        assert_eq!(ArchivePolicy::default().to_string(), "implicated");
    }

    #[test]
    fn load_failure_implicates_only_failing_file() {
        let files = files_to_archive(
            ArchivePolicy::Implicated,
            &load_error(ImdbFileKind::Episodes),
            &acquired(),
        );
        assert_eq!(files, vec![PathBuf::from("/data/title.episode.tsv")]);
    }

    #[test]
    fn all_policy_archives_every_acquired_file_once() {
        let files = files_to_archive(
            ArchivePolicy::All,
            &load_error(ImdbFileKind::Ratings),
            &acquired(),
        );
        assert_eq!(files, acquired());
    }

    #[test]
    fn acquisition_failure_implicates_partial_file() {
        let partial = PathBuf::from("/data/title.basics.tsv");
        let err = PipelineError::Acquisition {
            kind: ImdbFileKind::Titles,
            source: AcquisitionError::Io {
                path: partial.clone(),
                source: std::io::Error::other("disk full"),
            },
        };
        assert_eq!(
            files_to_archive(ArchivePolicy::Implicated, &err, &[partial.clone()]),
            vec![partial]
        );
    }

    fn merge_error() -> PipelineError {
        let source = "port=not-a-port"
            .parse::<tokio_postgres::Config>()
            .unwrap_err();
        PipelineError::Merge(MergeError {
            step: "episodes",
            source,
        })
    }

    #[test]
    fn merge_failure_implicates_every_staged_file() {
        for policy in [ArchivePolicy::Implicated, ArchivePolicy::All] {
            assert_eq!(
                files_to_archive(policy, &merge_error(), &acquired()),
                acquired(),
                "{policy}"
            );
        }
    }

    #[test]
    fn lock_contention_archives_nothing() {
        assert!(
            files_to_archive(ArchivePolicy::All, &PipelineError::AlreadyRunning, &acquired())
                .is_empty()
        );
    }

    #[test]
    fn settings_default_to_implicated_parallel() {
        let settings = PipelineSettings::new("./data");
        assert_eq!(settings.archive_policy, ArchivePolicy::Implicated);
        assert!(settings.parallel_downloads);
        assert_eq!(settings.copy_batch_bytes, DEFAULT_BATCH_BYTES);
    }
}
