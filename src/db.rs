use std::path::Path;

use rusqlite::Connection;
use tracing::debug;

use crate::catalog::{EpisodeRow, MovieRow};
use crate::errors::*;
use crate::manager::ManagerKind;

/// One catalog item on its way into the local `Files` table.
#[derive(Debug, Clone)]
pub enum StoreItem {
    Episode {
        row: EpisodeRow,
        series_title: Option<String>,
    },
    Movie(MovieRow),
}

impl StoreItem {
    #[must_use]
    pub fn entry_id(&self) -> i64 {
        match self {
            Self::Episode { row, .. } => row.entry_id,
            Self::Movie(row) => row.entry_id,
        }
    }

    #[must_use]
    pub fn file_id(&self) -> i64 {
        match self {
            Self::Episode { row, .. } => row.episode_file_id,
            Self::Movie(row) => row.movie_file_id,
        }
    }
}

/// A missing item eligible for a search command.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchCandidate {
    Episode {
        entry_id: i64,
        series_title: String,
        season_number: i64,
        episode_number: i64,
        title: String,
    },
    Movie {
        entry_id: i64,
        title: String,
        year: i64,
    },
}

impl SearchCandidate {
    #[must_use]
    pub fn entry_id(&self) -> i64 {
        match self {
            Self::Episode { entry_id, .. } | Self::Movie { entry_id, .. } => *entry_id,
        }
    }
}

impl std::fmt::Display for SearchCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Episode {
                series_title,
                season_number,
                episode_number,
                title,
                ..
            } => write!(f, "{series_title} - S{season_number:02}E{episode_number:03} - {title}"),
            Self::Movie { title, year, .. } => write!(f, "{title} ({year})"),
        }
    }
}

/// Per-group bookkeeping database: `Files` mirrors the catalog slice already
/// visited, `Queue` marks searches in flight.
pub struct SearchStore {
    conn: Connection,
    kind: ManagerKind,
}

impl SearchStore {
    pub fn open(path: &Path, kind: ManagerKind) -> Result<Self> {
        debug!("opening search store {}", path.display());
        let conn = Connection::open(path)
            .with_context(|| format!("open search store {}", path.display()))?;
        // journal_mode answers with the resulting mode, so it cannot go
        // through pragma_update.
        let _: String = conn.query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", 0)?;
        conn.pragma_update(None, "cache_size", -64000)?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        let mut store = Self { conn, kind };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&mut self) -> Result<()> {
        let files = match self.kind {
            ManagerKind::Sonarr => {
                "CREATE TABLE IF NOT EXISTS Files (
                     EntryId INTEGER PRIMARY KEY,
                     SeriesId INTEGER,
                     SeriesTitle TEXT,
                     SeasonNumber INTEGER,
                     EpisodeNumber INTEGER,
                     AbsoluteEpisodeNumber INTEGER,
                     SceneAbsoluteEpisodeNumber INTEGER,
                     Title TEXT,
                     AirDateUtc TEXT,
                     EpisodeFileId INTEGER,
                     Monitored INTEGER,
                     LastSearchTime TEXT,
                     Searched INTEGER NOT NULL DEFAULT 0)"
            }
            ManagerKind::Radarr => {
                "CREATE TABLE IF NOT EXISTS Files (
                     EntryId INTEGER PRIMARY KEY,
                     Title TEXT,
                     Year INTEGER,
                     TmdbId INTEGER,
                     Monitored INTEGER,
                     MovieFileId INTEGER,
                     Searched INTEGER NOT NULL DEFAULT 0)"
            }
        };
        self.conn.execute(files, [])?;
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS Queue (
                 EntryId INTEGER PRIMARY KEY,
                 Completed INTEGER NOT NULL DEFAULT 0)",
            [],
        )?;
        Ok(())
    }

    /// Upserts one catalog pass transactionally. An item that already has a
    /// media file also completes its pending-search row. `Searched` never
    /// goes back from 1 to 0.
    pub fn update_batch(&mut self, items: &[StoreItem]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for item in items {
            if item.file_id() != 0 {
                tx.execute(
                    "UPDATE Queue SET Completed = 1 WHERE EntryId = ?1",
                    [item.entry_id()],
                )?;
            }
            match item {
                StoreItem::Episode { row, series_title } => {
                    tx.execute(
                        "INSERT INTO Files (EntryId, SeriesId, SeriesTitle, SeasonNumber, \
                             EpisodeNumber, AbsoluteEpisodeNumber, SceneAbsoluteEpisodeNumber, \
                             Title, AirDateUtc, EpisodeFileId, Monitored, LastSearchTime, Searched) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0) \
                         ON CONFLICT(EntryId) DO UPDATE SET \
                             SeriesId = excluded.SeriesId, \
                             SeriesTitle = excluded.SeriesTitle, \
                             SeasonNumber = excluded.SeasonNumber, \
                             EpisodeNumber = excluded.EpisodeNumber, \
                             AbsoluteEpisodeNumber = excluded.AbsoluteEpisodeNumber, \
                             SceneAbsoluteEpisodeNumber = excluded.SceneAbsoluteEpisodeNumber, \
                             Title = excluded.Title, \
                             AirDateUtc = excluded.AirDateUtc, \
                             EpisodeFileId = excluded.EpisodeFileId, \
                             Monitored = excluded.Monitored, \
                             LastSearchTime = excluded.LastSearchTime, \
                             Searched = MAX(Files.Searched, excluded.Searched)",
                        (
                            row.entry_id,
                            row.series_id,
                            series_title,
                            row.season_number,
                            row.episode_number,
                            row.absolute_episode_number,
                            row.scene_absolute_episode_number,
                            &row.title,
                            &row.air_date_utc,
                            row.episode_file_id,
                            row.monitored,
                            &row.last_search_time,
                        ),
                    )?;
                }
                StoreItem::Movie(row) => {
                    tx.execute(
                        "INSERT INTO Files (EntryId, Title, Year, TmdbId, Monitored, \
                             MovieFileId, Searched) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                         ON CONFLICT(EntryId) DO UPDATE SET \
                             Title = excluded.Title, \
                             Year = excluded.Year, \
                             TmdbId = excluded.TmdbId, \
                             Monitored = excluded.Monitored, \
                             MovieFileId = excluded.MovieFileId, \
                             Searched = MAX(Files.Searched, excluded.Searched)",
                        (
                            row.entry_id,
                            &row.title,
                            row.year,
                            row.tmdb_id,
                            row.monitored,
                            row.movie_file_id,
                            i64::from(row.movie_file_id != 0),
                        ),
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Missing items of the current year, in search order.
    pub fn candidates(
        &self,
        year: i32,
        now_utc: &str,
        search_specials: bool,
    ) -> Result<Vec<SearchCandidate>> {
        match self.kind {
            ManagerKind::Sonarr => {
                let mut sql = String::from(
                    "SELECT EntryId, SeriesTitle, SeasonNumber, EpisodeNumber, Title \
                     FROM Files \
                     WHERE EpisodeFileId = 0 \
                       AND AirDateUtc IS NOT NULL \
                       AND AirDateUtc < ?1 \
                       AND AirDateUtc > ?2 \
                       AND AirDateUtc < ?3",
                );
                if !search_specials {
                    sql.push_str(" AND SeasonNumber != 0");
                }
                sql.push_str(" ORDER BY SeriesTitle, SeasonNumber, AirDateUtc DESC");
                let lower = format!("{year}-01-01");
                let upper = format!("{year}-12-31");
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map((now_utc, &lower, &upper), |row| {
                    Ok(SearchCandidate::Episode {
                        entry_id: row.get(0)?,
                        series_title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        season_number: row.get(2)?,
                        episode_number: row.get(3)?,
                        title: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<_>>()?)
            }
            ManagerKind::Radarr => {
                let mut stmt = self.conn.prepare(
                    "SELECT EntryId, Title, Year FROM Files \
                     WHERE MovieFileId = 0 AND Year = ?1 ORDER BY Title ASC",
                )?;
                let rows = stmt.query_map([year], |row| {
                    Ok(SearchCandidate::Movie {
                        entry_id: row.get(0)?,
                        title: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        year: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<rusqlite::Result<_>>()?)
            }
        }
    }

    /// Whether a search for the item has been issued and has not completed.
    pub fn is_pending(&self, entry_id: i64) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM Queue WHERE EntryId = ?1 AND Completed = 0")?;
        Ok(stmt.exists([entry_id])?)
    }

    pub fn enqueue(&mut self, entry_id: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO Queue (EntryId, Completed) VALUES (?1, 0)",
            [entry_id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    fn searched_flag(&self, entry_id: i64) -> bool {
        self.conn
            .query_row(
                "SELECT Searched FROM Files WHERE EntryId = ?1",
                [entry_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v != 0)
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn entry_ids(&self) -> Vec<i64> {
        let mut stmt = self
            .conn
            .prepare("SELECT EntryId FROM Files ORDER BY EntryId")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(Result::unwrap)
            .collect()
    }
}
