use super::error::MergeError;
use super::records::TitleType;
use serde::Serialize;
use tokio_postgres::Transaction;
use tracing::{info, instrument};

/// Upserts every title whose type is in `$1`, with missing ratings coalesced to zero.
const UPSERT_SHOWS: &str = "
INSERT INTO imdb.show (imdb_id, primary_title, start_year, end_year, imdb_rating, num_votes)
SELECT t.imdb_id,
       t.primary_title,
       t.start_year,
       t.end_year,
       COALESCE(r.imdb_rating, 0.0),
       COALESCE(r.num_votes, 0)
FROM temp_title t
         LEFT JOIN temp_ratings r ON t.imdb_id = r.imdb_id
WHERE t.title_type = ANY ($1)
ON CONFLICT (imdb_id) DO UPDATE
    SET primary_title = EXCLUDED.primary_title,
        start_year    = EXCLUDED.start_year,
        end_year      = EXCLUDED.end_year,
        imdb_rating   = EXCLUDED.imdb_rating,
        num_votes     = EXCLUDED.num_votes";

/// Upserts episodes whose parent is a known show and whose position is known.
const UPSERT_EPISODES: &str = "
INSERT INTO imdb.episode (episode_id, show_id, episode_title, season_num, episode_num, imdb_rating, num_votes)
SELECT e.episode_id,
       e.show_id,
       t.primary_title,
       e.season_num,
       e.episode_num,
       COALESCE(r.imdb_rating, 0.0),
       COALESCE(r.num_votes, 0)
FROM temp_episode e
         LEFT JOIN temp_title t ON e.episode_id = t.imdb_id
         LEFT JOIN temp_ratings r ON e.episode_id = r.imdb_id
WHERE e.show_id IN (SELECT imdb_id FROM imdb.show)
  AND e.season_num >= 0
  AND e.episode_num >= 0
ON CONFLICT (episode_id) DO UPDATE
    SET show_id       = EXCLUDED.show_id,
        episode_title = EXCLUDED.episode_title,
        season_num    = EXCLUDED.season_num,
        episode_num   = EXCLUDED.episode_num,
        imdb_rating   = EXCLUDED.imdb_rating,
        num_votes     = EXCLUDED.num_votes";

const REFRESH_VALID_SHOWS: &str = "REFRESH MATERIALIZED VIEW imdb.valid_show";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub shows: u64,
    pub episodes: u64,
}

/// Moves staged rows into the durable tables. Shows go first so the episode
/// filter and foreign key see this run's shows.
#[instrument(skip(tx))]
pub async fn merge(tx: &Transaction<'_>) -> Result<MergeSummary, MergeError> {
    let shows = tx
        .execute(UPSERT_SHOWS, &[&TitleType::SHOW_TYPES.as_slice()])
        .await
        .map_err(|source| MergeError { step: "shows", source })?;
    info!(rows = shows, "upserted shows");

    let episodes = tx
        .execute(UPSERT_EPISODES, &[])
        .await
        .map_err(|source| MergeError {
            step: "episodes",
            source,
        })?;
    info!(rows = episodes, "upserted episodes");

    tx.batch_execute(REFRESH_VALID_SHOWS)
        .await
        .map_err(|source| MergeError {
            step: "valid_show",
            source,
        })?;

    Ok(MergeSummary { shows, episodes })
}
