//! Static description of the IMDb flat files the pipeline consumes.
//!
//! Format reference: <https://developer.imdb.com/non-commercial-datasets/>

use serde::Serialize;
use std::fmt;

/// Public host serving the daily dataset dumps.
pub const DEFAULT_BASE_URL: &str = "https://datasets.imdbws.com";

/// The three files a run needs. Order is the staging order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImdbFileKind {
    Titles,
    Episodes,
    Ratings,
}

impl ImdbFileKind {
    pub const ALL: [ImdbFileKind; 3] = [
        ImdbFileKind::Titles,
        ImdbFileKind::Episodes,
        ImdbFileKind::Ratings,
    ];

    /// File name as published upstream (gzip-compressed).
    pub const fn remote_file_name(self) -> &'static str {
        match self {
            ImdbFileKind::Titles => "title.basics.tsv.gz",
            ImdbFileKind::Episodes => "title.episode.tsv.gz",
            ImdbFileKind::Ratings => "title.ratings.tsv.gz",
        }
    }

    /// File name after decompression (remote name minus `.gz`).
    pub const fn local_file_name(self) -> &'static str {
        match self {
            ImdbFileKind::Titles => "title.basics.tsv",
            ImdbFileKind::Episodes => "title.episode.tsv",
            ImdbFileKind::Ratings => "title.ratings.tsv",
        }
    }

    pub const fn staging_table(self) -> &'static str {
        match self {
            ImdbFileKind::Titles => "temp_title",
            ImdbFileKind::Episodes => "temp_episode",
            ImdbFileKind::Ratings => "temp_ratings",
        }
    }

    /// Number of tab-separated columns in every line of the file, header included.
    pub const fn column_count(self) -> usize {
        match self {
            ImdbFileKind::Titles => 9,
            ImdbFileKind::Episodes => 4,
            ImdbFileKind::Ratings => 3,
        }
    }

    /// Transaction-scoped staging table. The column order matches the file.
    pub const fn staging_ddl(self) -> &'static str {
        match self {
            ImdbFileKind::Titles => {
                "CREATE TEMPORARY TABLE temp_title
                 (
                     imdb_id         TEXT PRIMARY KEY,
                     title_type      TEXT,
                     primary_title   TEXT,
                     original_title  TEXT,
                     is_adult        BOOLEAN,
                     start_year      CHAR(4),
                     end_year        CHAR(4),
                     runtime_minutes INT,
                     genres          TEXT
                 ) ON COMMIT DROP"
            }
            ImdbFileKind::Episodes => {
                "CREATE TEMPORARY TABLE temp_episode
                 (
                     episode_id  TEXT PRIMARY KEY,
                     show_id     TEXT,
                     season_num  INT,
                     episode_num INT
                 ) ON COMMIT DROP"
            }
            ImdbFileKind::Ratings => {
                "CREATE TEMPORARY TABLE temp_ratings
                 (
                     imdb_id     TEXT PRIMARY KEY,
                     imdb_rating DOUBLE PRECISION,
                     num_votes   INT
                 ) ON COMMIT DROP"
            }
        }
    }

    /// `COPY` statement feeding the staging table from the client in text format.
    pub fn copy_statement(self) -> String {
        format!(
            "COPY {} FROM STDIN WITH (FORMAT text, DELIMITER E'\\t', NULL '\\N')",
            self.staging_table()
        )
    }

    /// Download URL of this file under `base_url`.
    pub fn download_url(self, base_url: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.remote_file_name()
        )
    }
}

impl fmt::Display for ImdbFileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImdbFileKind::Titles => "titles",
            ImdbFileKind::Episodes => "episodes",
            ImdbFileKind::Ratings => "ratings",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_download_urls() {
        assert_eq!(
            ImdbFileKind::Titles.download_url(DEFAULT_BASE_URL),
            "https://datasets.imdbws.com/title.basics.tsv.gz"
        );
        assert_eq!(
            ImdbFileKind::Ratings.download_url("http://127.0.0.1:8080/"),
            "http://127.0.0.1:8080/title.ratings.tsv.gz"
        );
    }

    #[test]
    fn local_name_drops_gz_suffix() {
        for kind in ImdbFileKind::ALL {
            assert_eq!(
                format!("{}.gz", kind.local_file_name()),
                kind.remote_file_name()
            );
        }
    }

    #[test]
    fn one_staging_table_per_kind() {
        let mut tables: Vec<&str> = ImdbFileKind::ALL
            .iter()
            .map(|k| k.staging_table())
            .collect();
        tables.sort_unstable();
        tables.dedup();
        assert_eq!(tables.len(), 3);
        for kind in ImdbFileKind::ALL {
            assert!(kind.staging_ddl().contains(kind.staging_table()));
            assert!(kind.staging_ddl().ends_with("ON COMMIT DROP"));
            assert!(kind.copy_statement().starts_with(&format!("COPY {} ", kind.staging_table())));
        }
    }
}
