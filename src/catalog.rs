use std::path::Path;

use rusqlite::{Connection, OpenFlags, Row};
use tracing::warn;

use crate::errors::*;
use crate::manager::ManagerKind;

/// One `Episodes` row of a Sonarr catalog, with the columns the search
/// scheduler carries around.
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeRow {
    pub entry_id: i64,
    pub series_id: i64,
    pub season_number: i64,
    pub episode_number: i64,
    pub absolute_episode_number: Option<i64>,
    pub scene_absolute_episode_number: Option<i64>,
    pub title: Option<String>,
    pub air_date_utc: Option<String>,
    pub episode_file_id: i64,
    pub monitored: bool,
    pub last_search_time: Option<String>,
}

/// One `Movies` row of a Radarr catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct MovieRow {
    pub entry_id: i64,
    pub title: Option<String>,
    pub year: i64,
    pub tmdb_id: i64,
    pub monitored: bool,
    pub movie_file_id: i64,
}

/// Read-only view of the manager's own SQLite database.
pub struct CatalogReader {
    conn: Connection,
    kind: ManagerKind,
}

impl CatalogReader {
    pub fn open(path: &Path, kind: ManagerKind) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open catalog {}", path.display()))?;
        Ok(Self { conn, kind })
    }

    #[must_use]
    pub fn kind(&self) -> ManagerKind {
        self.kind
    }

    /// Episodes that aired within the given year and before `now_utc`
    /// (`YYYY-MM-DD HH:MM:SS`; the column's text encoding compares
    /// lexically).
    pub fn episodes_aired_in(&self, year: i32, now_utc: &str) -> Result<Vec<EpisodeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT Id, SeriesId, SeasonNumber, EpisodeNumber, AbsoluteEpisodeNumber, \
                    SceneAbsoluteEpisodeNumber, Title, AirDateUtc, EpisodeFileId, Monitored, \
                    LastSearchTime \
             FROM Episodes \
             WHERE AirDateUtc IS NOT NULL \
               AND AirDateUtc < ?1 \
               AND AirDateUtc > ?2 \
               AND AirDateUtc < ?3",
        )?;
        let lower = format!("{year}-01-01");
        let upper = format!("{year}-12-31");
        let rows = stmt.query_map((now_utc, &lower, &upper), episode_from_row)?;
        Ok(collect_rows(rows, "Episodes"))
    }

    /// Movies of the given year, most recently added first.
    pub fn movies_of_year(&self, year: i32) -> Result<Vec<MovieRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT Id, Title, Year, TmdbId, Monitored, MovieFileId \
             FROM Movies WHERE Year = ?1 ORDER BY Added DESC",
        )?;
        let rows = stmt.query_map([year], movie_from_row)?;
        Ok(collect_rows(rows, "Movies"))
    }

    /// Search commands the manager is still running. This feeds the global
    /// in-flight cap.
    pub fn active_search_commands(&self) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM Commands WHERE EndedAt IS NULL AND Name LIKE '%Search'",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn episode_from_row(row: &Row) -> rusqlite::Result<EpisodeRow> {
    Ok(EpisodeRow {
        entry_id: row.get(0)?,
        series_id: row.get(1)?,
        season_number: row.get(2)?,
        episode_number: row.get(3)?,
        absolute_episode_number: row.get(4)?,
        scene_absolute_episode_number: row.get(5)?,
        title: row.get(6)?,
        air_date_utc: row.get(7)?,
        episode_file_id: row.get(8)?,
        monitored: row.get(9)?,
        last_search_time: row.get(10)?,
    })
}

fn movie_from_row(row: &Row) -> rusqlite::Result<MovieRow> {
    Ok(MovieRow {
        entry_id: row.get(0)?,
        title: row.get(1)?,
        year: row.get(2)?,
        tmdb_id: row.get(3)?,
        monitored: row.get(4)?,
        movie_file_id: row.get(5)?,
    })
}

// A malformed catalog row is logged and skipped, never fatal to the loop.
fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    table: &str,
) -> Vec<T> {
    rows.filter_map(|row| match row {
        Ok(row) => Some(row),
        Err(err) => {
            warn!("skipping malformed {table} row: {err:#}");
            None
        }
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sonarr_fixture(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Episodes (
                 Id INTEGER PRIMARY KEY, SeriesId INTEGER, SeasonNumber INTEGER,
                 EpisodeNumber INTEGER, AbsoluteEpisodeNumber INTEGER,
                 SceneAbsoluteEpisodeNumber INTEGER, Title TEXT, AirDateUtc TEXT,
                 EpisodeFileId INTEGER, Monitored INTEGER, LastSearchTime TEXT);
             CREATE TABLE Commands (Id INTEGER PRIMARY KEY, Name TEXT, EndedAt TEXT);
             INSERT INTO Episodes VALUES
                 (1, 10, 1, 1, 1, NULL, 'Pilot', '2020-03-01 00:00:00Z', 0, 1, NULL),
                 (2, 10, 1, 2, 2, NULL, 'Two', '2020-09-01 00:00:00Z', 55, 1, NULL),
                 (3, 10, 1, 3, 3, NULL, 'Future', '2099-01-01 00:00:00Z', 0, 1, NULL),
                 (4, 10, 2, 1, 4, NULL, 'Other year', '2019-06-01 00:00:00Z', 0, 1, NULL);
             INSERT INTO Commands (Name, EndedAt) VALUES
                 ('EpisodeSearch', NULL),
                 ('MissingEpisodeSearch', NULL),
                 ('EpisodeSearch', '2020-01-01'),
                 ('RssSync', NULL);",
        )
        .unwrap();
    }

    #[test]
    fn episode_year_window_and_past_filter() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("sonarr.db");
        sonarr_fixture(&db);

        let catalog = CatalogReader::open(&db, ManagerKind::Sonarr).unwrap();
        let rows = catalog
            .episodes_aired_in(2020, "2026-01-01 00:00:00")
            .unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.entry_id).collect();
        assert_eq!(ids, [1, 2]);
        assert_eq!(rows[0].title.as_deref(), Some("Pilot"));
        assert!(rows[0].monitored);
    }

    #[test]
    fn counts_only_running_search_commands() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("sonarr.db");
        sonarr_fixture(&db);

        let catalog = CatalogReader::open(&db, ManagerKind::Sonarr).unwrap();
        assert_eq!(catalog.active_search_commands().unwrap(), 2);
    }

    #[test]
    fn movies_ordered_by_added_desc() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("radarr.db");
        let conn = Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE Movies (
                 Id INTEGER PRIMARY KEY, Title TEXT, Year INTEGER, TmdbId INTEGER,
                 Monitored INTEGER, MovieFileId INTEGER, Added TEXT);
             CREATE TABLE Commands (Id INTEGER PRIMARY KEY, Name TEXT, EndedAt TEXT);
             INSERT INTO Movies VALUES
                 (1, 'Old', 2011, 100, 1, 0, '2021-01-01'),
                 (2, 'New', 2011, 101, 1, 7, '2022-01-01'),
                 (3, 'Elsewhere', 2012, 102, 1, 0, '2022-06-01');",
        )
        .unwrap();
        drop(conn);

        let catalog = CatalogReader::open(&db, ManagerKind::Radarr).unwrap();
        let rows = catalog.movies_of_year(2011).unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.entry_id).collect();
        assert_eq!(ids, [2, 1]);
        assert_eq!(rows[0].movie_file_id, 7);
    }

    #[test]
    fn open_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("sonarr.db");
        sonarr_fixture(&db);

        let catalog = CatalogReader::open(&db, ManagerKind::Sonarr).unwrap();
        assert!(catalog
            .conn
            .execute("DELETE FROM Commands", [])
            .is_err());
    }
}
