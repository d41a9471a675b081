//! Capacity-bounded audit directory for dataset files that failed to load.

use chrono::{NaiveDate, Utc};
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_ARCHIVE_CAPACITY: usize = 100;

/// Source of the date stamped onto archived file names.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Inserts `_<YYYY-MM-DD>` before the extension: `title.ratings.tsv` becomes
/// `title.ratings_2019-12-28.tsv`, and `file1` becomes `file1_2019-12-28`.
pub fn archive_file_name(file_name: &str, date: NaiveDate) -> String {
    let name_start = file_name.rfind(['/', '\\']).map_or(0, |i| i + 1);
    let ext_start = match file_name.rfind('.') {
        Some(dot) if dot >= name_start => dot,
        _ => file_name.len(),
    };
    format!(
        "{}_{}{}",
        &file_name[..ext_start],
        date.format("%Y-%m-%d"),
        &file_name[ext_start..]
    )
}

#[derive(Clone)]
pub struct FileArchiver {
    dir: PathBuf,
    capacity: NonZeroUsize,
    clock: Arc<dyn Clock>,
}

impl FileArchiver {
    pub fn new(dir: impl Into<PathBuf>, capacity: NonZeroUsize) -> Self {
        Self {
            dir: dir.into(),
            capacity,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Moves each file into the archive under its dated name, evicting the
    /// entry with the smallest name whenever the archive is already full.
    /// Returns the archived paths in input order.
    pub fn archive(&self, files: &[&Path]) -> io::Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir)?;
        let today = self.clock.today();

        let mut archived = Vec::with_capacity(files.len());
        for &src in files {
            let file_name = src
                .file_name()
                .and_then(|n| n.to_str())
                .filter(|n| !n.is_empty())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("cannot archive {}: no usable file name", src.display()),
                    )
                })?;
            let dest = self.dir.join(archive_file_name(file_name, today));

            if !dest.exists() {
                let mut entries = self.entries()?;
                entries.sort_unstable();
                let excess = (entries.len() + 1).saturating_sub(self.capacity.get());
                for name in entries.iter().take(excess) {
                    let oldest = self.dir.join(name);
                    fs::remove_file(&oldest)?;
                    info!(evicted = %oldest.display(), "archive full, evicted oldest entry");
                }
            }

            move_file(src, &dest)?;
            info!(src = %src.display(), dest = %dest.display(), "archived file");
            archived.push(dest);
        }
        Ok(archived)
    }

    /// Names of the regular files currently in the archive.
    fn entries(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => warn!(name = ?raw, "skipping non UTF-8 archive entry"),
            }
        }
        Ok(names)
    }
}

fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        // Rename fails across filesystems; fall back to copy + delete.
        Err(rename_err) => {
            fs::copy(src, dest).map_err(|_| rename_err)?;
            fs::remove_file(src)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2007, 12, 3).unwrap()
    }

    fn archiver(root: &Path, capacity: usize) -> FileArchiver {
        FileArchiver::new(root.join("archive"), NonZeroUsize::new(capacity).unwrap())
            .with_clock(FixedClock(sample_date()))
    }

    fn touch(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    fn archived_names(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root.join("archive"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn names_carry_date_before_extension() {
        let d = sample_date();
        assert_eq!(archive_file_name("file1", d), "file1_2007-12-03");
        assert_eq!(archive_file_name("file1.txt", d), "file1_2007-12-03.txt");
        assert_eq!(
            archive_file_name("title.basics.tsv", d),
            "title.basics_2007-12-03.tsv"
        );
        assert_eq!(archive_file_name("dir.d/file", d), "dir.d/file_2007-12-03");
        assert_eq!(archive_file_name(".env", d), "_2007-12-03.env");
    }

    #[test]
    fn empty_call_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let archived = archiver(tmp.path(), 1).archive(&[]).unwrap();
        assert!(archived.is_empty());
        assert!(archived_names(tmp.path()).is_empty());
    }

    #[test]
    fn capacity_one_keeps_latest_file() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = archiver(tmp.path(), 1);
        archiver.archive(&[]).unwrap();

        let files = ["file1", "file2", "file3"].map(|n| touch(tmp.path(), n));
        for f in &files {
            archiver.archive(&[f.as_path()]).unwrap();
        }

        assert_eq!(archived_names(tmp.path()), ["file3_2007-12-03"]);
        assert!(files.iter().all(|f| !f.exists()));
    }

    #[test]
    fn capacity_four_rolls_over_oldest_names() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = archiver(tmp.path(), 4);
        archiver.archive(&[]).unwrap();

        for pair in [["file1", "file2"], ["file3", "file4"], ["file5", "file6"]] {
            let [a, b] = pair.map(|n| touch(tmp.path(), n));
            archiver.archive(&[a.as_path(), b.as_path()]).unwrap();
        }

        assert_eq!(
            archived_names(tmp.path()),
            [
                "file3_2007-12-03",
                "file4_2007-12-03",
                "file5_2007-12-03",
                "file6_2007-12-03"
            ]
        );
    }

    #[test]
    fn never_exceeds_capacity() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = archiver(tmp.path(), 3);
        for i in 0..10 {
            let f = touch(tmp.path(), &format!("batch{i:02}.tsv"));
            archiver.archive(&[f.as_path()]).unwrap();
            assert!(archived_names(tmp.path()).len() <= 3);
        }
        assert_eq!(
            archived_names(tmp.path()),
            [
                "batch07_2007-12-03.tsv",
                "batch08_2007-12-03.tsv",
                "batch09_2007-12-03.tsv"
            ]
        );
    }

    #[test]
    fn lowered_capacity_trims_backlog() {
        let tmp = tempfile::tempdir().unwrap();
        for n in ["a", "b", "c"] {
            let f = touch(tmp.path(), n);
            archiver(tmp.path(), 4).archive(&[f.as_path()]).unwrap();
        }

        let d = touch(tmp.path(), "d");
        archiver(tmp.path(), 2).archive(&[d.as_path()]).unwrap();

        assert_eq!(
            archived_names(tmp.path()),
            ["c_2007-12-03", "d_2007-12-03"]
        );
    }

    #[test]
    fn same_day_rearchive_replaces_without_eviction() {
        let tmp = tempfile::tempdir().unwrap();
        let archiver = archiver(tmp.path(), 2);
        let a = touch(tmp.path(), "a.tsv");
        let b = touch(tmp.path(), "b.tsv");
        archiver.archive(&[a.as_path(), b.as_path()]).unwrap();

        let b_again = tmp.path().join("b.tsv");
        fs::write(&b_again, b"second").unwrap();
        let dests = archiver.archive(&[b_again.as_path()]).unwrap();

        assert_eq!(
            archived_names(tmp.path()),
            ["a_2007-12-03.tsv", "b_2007-12-03.tsv"]
        );
        assert_eq!(fs::read(&dests[0]).unwrap(), b"second");
    }

    #[test]
    fn missing_source_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ghost = tmp.path().join("ghost.tsv");
        let err = archiver(tmp.path(), 2).archive(&[ghost.as_path()]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
