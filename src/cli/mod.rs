pub mod db_counts;
pub mod migrate;
pub mod update;
