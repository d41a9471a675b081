//! Typed views over single lines of the IMDb TSV files.
//!
//! Parsing borrows from the line, so validating a multi-million row file does
//! not allocate per row. Each parser checks arity and the numeric columns the
//! staging tables type strictly; everything else is passed through untouched.

use super::catalog::ImdbFileKind;
use thiserror::Error;

/// Literal used by the dumps for a null or unknown value.
pub const NULL_FIELD: &str = "\\N";

/// Season/episode number stored in an [`EpisodeRecord`] when the dump has `\N`.
pub const UNKNOWN_NUMBER: i32 = -1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("expected {expected} tab-separated fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    #[error("required field `{field}` is empty or null")]
    MissingField { field: &'static str },
    #[error("field `{field}` must be {expected}, got {value:?}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleType {
    TvSeries,
    TvShort,
    TvSpecial,
    TvMiniSeries,
    TvEpisode,
    TvMovie,
    TvPilot,
    Movie,
    Short,
    Video,
    VideoGame,
    Other,
}

impl TitleType {
    /// Values of `titleType` that become rows of `imdb.show`.
    pub const SHOW_TYPES: [&'static str; 4] = ["tvSeries", "tvShort", "tvSpecial", "tvMiniSeries"];

    pub fn parse(raw: &str) -> Self {
        match raw {
            "tvSeries" => TitleType::TvSeries,
            "tvShort" => TitleType::TvShort,
            "tvSpecial" => TitleType::TvSpecial,
            "tvMiniSeries" => TitleType::TvMiniSeries,
            "tvEpisode" => TitleType::TvEpisode,
            "tvMovie" => TitleType::TvMovie,
            "tvPilot" => TitleType::TvPilot,
            "movie" => TitleType::Movie,
            "short" => TitleType::Short,
            "video" => TitleType::Video,
            "videoGame" => TitleType::VideoGame,
            _ => TitleType::Other,
        }
    }
}

/// A row of `title.basics.tsv`.
#[derive(Debug, Clone, PartialEq)]
pub struct TitleRecord<'a> {
    pub imdb_id: &'a str,
    pub title_type: TitleType,
    pub primary_title: Option<&'a str>,
    pub original_title: Option<&'a str>,
    pub is_adult: Option<bool>,
    pub start_year: Option<&'a str>,
    pub end_year: Option<&'a str>,
    pub runtime_minutes: Option<i32>,
    pub genres: Option<&'a str>,
}

impl<'a> TitleRecord<'a> {
    pub fn parse(line: &'a str) -> Result<Self, RecordError> {
        let [imdb_id, title_type, primary, original, adult, start, end, runtime, genres] =
            split_fields::<9>(line)?;
        Ok(TitleRecord {
            imdb_id: required("tconst", imdb_id)?,
            title_type: nullable(title_type).map_or(TitleType::Other, TitleType::parse),
            primary_title: nullable(primary),
            original_title: nullable(original),
            is_adult: nullable(adult).map(parse_flag).transpose()?,
            start_year: nullable(start).map(|y| parse_year("startYear", y)).transpose()?,
            end_year: nullable(end).map(|y| parse_year("endYear", y)).transpose()?,
            runtime_minutes: nullable(runtime)
                .map(|v| parse_int("runtimeMinutes", v))
                .transpose()?,
            genres: nullable(genres),
        })
    }
}

/// A row of `title.episode.tsv`.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeRecord<'a> {
    pub episode_id: &'a str,
    pub show_id: &'a str,
    /// [`UNKNOWN_NUMBER`] when the dump has `\N`.
    pub season_number: i32,
    /// [`UNKNOWN_NUMBER`] when the dump has `\N`.
    pub episode_number: i32,
}

impl<'a> EpisodeRecord<'a> {
    pub fn parse(line: &'a str) -> Result<Self, RecordError> {
        let [episode_id, show_id, season, episode] = split_fields::<4>(line)?;
        Ok(EpisodeRecord {
            episode_id: required("tconst", episode_id)?,
            show_id: required("parentTconst", show_id)?,
            season_number: nullable(season)
                .map(|v| parse_int("seasonNumber", v))
                .transpose()?
                .unwrap_or(UNKNOWN_NUMBER),
            episode_number: nullable(episode)
                .map(|v| parse_int("episodeNumber", v))
                .transpose()?
                .unwrap_or(UNKNOWN_NUMBER),
        })
    }
}

/// A row of `title.ratings.tsv`.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingRecord<'a> {
    pub imdb_id: &'a str,
    pub average_rating: f64,
    pub num_votes: i32,
}

impl<'a> RatingRecord<'a> {
    pub fn parse(line: &'a str) -> Result<Self, RecordError> {
        let [imdb_id, rating, votes] = split_fields::<3>(line)?;
        let average_rating: f64 = required("averageRating", rating)?
            .parse()
            .ok()
            .filter(|r: &f64| (0.0..=10.0).contains(r))
            .ok_or_else(|| invalid("averageRating", "a number between 0.0 and 10.0", rating))?;
        let num_votes = parse_int("numVotes", required("numVotes", votes)?)?;
        if num_votes < 0 {
            return Err(invalid("numVotes", "a non-negative integer", votes));
        }
        Ok(RatingRecord {
            imdb_id: required("tconst", imdb_id)?,
            average_rating,
            num_votes,
        })
    }
}

/// Validate one data line (without its line terminator) for `kind`.
pub fn validate_line(kind: ImdbFileKind, line: &str) -> Result<(), RecordError> {
    match kind {
        ImdbFileKind::Titles => TitleRecord::parse(line).map(|_| ()),
        ImdbFileKind::Episodes => EpisodeRecord::parse(line).map(|_| ()),
        ImdbFileKind::Ratings => RatingRecord::parse(line).map(|_| ()),
    }
}

/// Validate the header line; only its arity is checked since upstream column
/// names have changed spelling over the years.
pub fn validate_header(kind: ImdbFileKind, line: &str) -> Result<(), RecordError> {
    let found = count_fields(line);
    if found != kind.column_count() {
        return Err(RecordError::FieldCount {
            expected: kind.column_count(),
            found,
        });
    }
    Ok(())
}

fn count_fields(line: &str) -> usize {
    memchr::memchr_iter(b'\t', line.as_bytes()).count() + 1
}

fn split_fields<const N: usize>(line: &str) -> Result<[&str; N], RecordError> {
    let mut fields = [""; N];
    let mut found = 0usize;
    let mut start = 0usize;
    let bytes = line.as_bytes();
    for end in memchr::memchr_iter(b'\t', bytes).chain(std::iter::once(bytes.len())) {
        if found < N {
            fields[found] = &line[start..end];
        }
        found += 1;
        start = end + 1;
    }
    if found != N {
        return Err(RecordError::FieldCount { expected: N, found });
    }
    Ok(fields)
}

fn nullable(value: &str) -> Option<&str> {
    if value == NULL_FIELD {
        None
    } else {
        Some(value)
    }
}

fn required<'a>(field: &'static str, value: &'a str) -> Result<&'a str, RecordError> {
    match nullable(value) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(RecordError::MissingField { field }),
    }
}

fn invalid(field: &'static str, expected: &'static str, value: &str) -> RecordError {
    RecordError::InvalidField {
        field,
        expected,
        value: value.to_string(),
    }
}

fn parse_int(field: &'static str, value: &str) -> Result<i32, RecordError> {
    value
        .parse::<i32>()
        .map_err(|_| invalid(field, "an integer", value))
}

fn parse_flag(value: &str) -> Result<bool, RecordError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(invalid("isAdult", "0 or 1", other)),
    }
}

fn parse_year<'a>(field: &'static str, value: &'a str) -> Result<&'a str, RecordError> {
    if value.len() == 4 && value.bytes().all(|b| b.is_ascii_digit()) {
        Ok(value)
    } else {
        Err(invalid(field, "a 4-digit year", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_series_title() {
        let line = "tt0903747\ttvSeries\tBreaking Bad\tBreaking Bad\t0\t2008\t2013\t49\tCrime,Drama,Thriller";
        let title = TitleRecord::parse(line).unwrap();
        assert_eq!(title.imdb_id, "tt0903747");
        assert_eq!(title.title_type, TitleType::TvSeries);
        assert_eq!(title.primary_title, Some("Breaking Bad"));
        assert_eq!(title.is_adult, Some(false));
        assert_eq!(title.start_year, Some("2008"));
        assert_eq!(title.end_year, Some("2013"));
        assert_eq!(title.runtime_minutes, Some(49));
    }

    #[test]
    fn title_nulls_become_none() {
        let line = "tt0000001\tmovie\tCarmencita\tCarmencita\t0\t1894\t\\N\t\\N\t\\N";
        let title = TitleRecord::parse(line).unwrap();
        assert_eq!(title.title_type, TitleType::Movie);
        assert_eq!(title.end_year, None);
        assert_eq!(title.runtime_minutes, None);
        assert_eq!(title.genres, None);
    }

    #[test]
    fn rejects_non_numeric_runtime() {
        let line = "tt0000001\tmovie\tCarmencita\tCarmencita\t0\t1894\t\\N\tlong\tDocumentary";
        assert!(matches!(
            TitleRecord::parse(line),
            Err(RecordError::InvalidField { field: "runtimeMinutes", .. })
        ));
    }

    #[test]
    fn rejects_malformed_year() {
        let line = "tt0000001\tmovie\tCarmencita\tCarmencita\t0\t94\t\\N\t1\tDocumentary";
        assert!(matches!(
            TitleRecord::parse(line),
            Err(RecordError::InvalidField { field: "startYear", .. })
        ));
    }

    #[test]
    fn unknown_title_type_is_other() {
        assert_eq!(TitleType::parse("radioPlay"), TitleType::Other);
        assert_eq!(TitleType::parse("tvEpisode"), TitleType::TvEpisode);
        for raw in TitleType::SHOW_TYPES {
            assert_ne!(TitleType::parse(raw), TitleType::Other, "{raw} should be known");
        }
    }

    #[test]
    fn episode_sentinels_for_unknown_numbers() {
        let placed = EpisodeRecord::parse("tt0959621\ttt0903747\t1\t1").unwrap();
        assert_eq!((placed.season_number, placed.episode_number), (1, 1));

        let unknown = EpisodeRecord::parse("tt1234567\ttt0903747\t\\N\t\\N").unwrap();
        assert_eq!(unknown.season_number, UNKNOWN_NUMBER);
        assert_eq!(unknown.episode_number, UNKNOWN_NUMBER);

        let half = EpisodeRecord::parse("tt1234568\ttt0903747\t2\t\\N").unwrap();
        assert_eq!((half.season_number, half.episode_number), (2, UNKNOWN_NUMBER));
    }

    #[test]
    fn episode_missing_field_is_rejected() {
        assert_eq!(
            EpisodeRecord::parse("tt0959621\ttt0903747\t1"),
            Err(RecordError::FieldCount {
                expected: 4,
                found: 3
            })
        );
        assert_eq!(
            EpisodeRecord::parse("tt0959621\t\\N\t1\t1"),
            Err(RecordError::MissingField {
                field: "parentTconst"
            })
        );
    }

    #[test]
    fn parses_rating() {
        let rating = RatingRecord::parse("tt0903747\t9.5\t2212345").unwrap();
        assert_eq!(rating.imdb_id, "tt0903747");
        assert_eq!(rating.average_rating, 9.5);
        assert_eq!(rating.num_votes, 2_212_345);
    }

    #[test]
    fn rejects_corrupt_ratings() {
        assert!(RatingRecord::parse("tt0903747\tnine\t10").is_err());
        assert!(RatingRecord::parse("tt0903747\t11.0\t10").is_err());
        assert!(RatingRecord::parse("tt0903747\t7.0\t-3").is_err());
        assert!(RatingRecord::parse("tt0903747\t7.0\t10\textra").is_err());
    }

    #[test]
    fn header_arity_is_checked() {
        assert!(validate_header(ImdbFileKind::Ratings, "tconst\taverageRating\tnumVotes").is_ok());
        assert!(validate_header(ImdbFileKind::Episodes, "tconst\taverageRating\tnumVotes").is_err());
    }

    #[test]
    fn extra_fields_are_counted() {
        assert_eq!(
            validate_line(ImdbFileKind::Ratings, "a\t1.0\t2\t3\t4"),
            Err(RecordError::FieldCount {
                expected: 3,
                found: 5
            })
        );
    }
}
