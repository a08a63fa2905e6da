use std::sync::Arc;
use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::catalog::CatalogReader;
use crate::config::ManagerConfig;
use crate::db::{SearchCandidate, SearchStore, StoreItem};
use crate::errors::*;
use crate::manager::{ArrCommand, ManagerApi, ManagerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    Queued,
    AlreadyQueued,
    /// The manager already runs `SearchLimit` search commands; retry later.
    Full,
}

#[must_use]
pub fn now_utc_string() -> String {
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| String::from("1970-01-01 00:00:00"))
}

/// Walks the manager's catalog one year window at a time and issues bounded
/// search commands for items that still miss their media file.
pub struct SearchScheduler {
    name: String,
    kind: ManagerKind,
    catalog: CatalogReader,
    store: SearchStore,
    api: Arc<dyn ManagerApi>,
    search_specials: bool,
    search_limit: i64,
    in_reverse: bool,
    current_year: i32,
    delta: i32,
}

impl SearchScheduler {
    pub fn new(
        name: &str,
        cfg: &ManagerConfig,
        catalog: CatalogReader,
        store: SearchStore,
        api: Arc<dyn ManagerApi>,
    ) -> Result<Self> {
        let start_year = cfg
            .start_year
            .with_context(|| format!("{name}: StartYear is required with SearchMissing"))?;
        let last_year = cfg
            .last_year
            .with_context(|| format!("{name}: LastYear is required with SearchMissing"))?;
        // Forward mode walks from StartYear down to 1900, reverse mode from
        // LastYear up to the present year.
        let (current_year, delta) = if cfg.search_in_reverse {
            (last_year, 1)
        } else {
            (start_year, -1)
        };
        Ok(Self {
            name: name.to_string(),
            kind: catalog.kind(),
            catalog,
            store,
            api,
            search_specials: cfg.also_search_specials,
            search_limit: cfg.search_limit,
            in_reverse: cfg.search_in_reverse,
            current_year,
            delta,
        })
    }

    #[must_use]
    pub fn current_year(&self) -> i32 {
        self.current_year
    }

    fn candidates(&self) -> Result<Vec<SearchCandidate>> {
        self.store
            .candidates(self.current_year, &now_utc_string(), self.search_specials)
    }

    /// Mirrors the current year window of the catalog into the local store.
    /// Ends with the short-circuit advance when the year has nothing left.
    pub fn db_update(&mut self) -> Result<()> {
        debug!("{}: updating database for {}", self.name, self.current_year);
        let items: Vec<StoreItem> = match self.kind {
            ManagerKind::Sonarr => self
                .catalog
                .episodes_aired_in(self.current_year, &now_utc_string())?
                .into_iter()
                .map(|row| {
                    let series_title = self
                        .api
                        .episode_detail(row.entry_id)
                        .ok()
                        .and_then(|detail| detail.series.title);
                    StoreItem::Episode { row, series_title }
                })
                .collect(),
            ManagerKind::Radarr => self
                .catalog
                .movies_of_year(self.current_year)?
                .into_iter()
                .map(StoreItem::Movie)
                .collect(),
        };
        self.store.update_batch(&items)?;
        self.update_current_year()?;
        Ok(())
    }

    fn update_current_year(&mut self) -> Result<()> {
        if self.candidates()?.is_empty() {
            self.current_year += self.delta;
        }
        Ok(())
    }

    pub fn maybe_do_search(&mut self, candidate: &SearchCandidate) -> Result<SearchOutcome> {
        let entry_id = candidate.entry_id();
        if self.store.is_pending(entry_id)? {
            debug!("{}: already in queue: {candidate}", self.name);
            return Ok(SearchOutcome::AlreadyQueued);
        }
        let active = self.catalog.active_search_commands()?;
        debug!("{}: {active} active search commands", self.name);
        if active >= self.search_limit {
            return Ok(SearchOutcome::Full);
        }
        self.store.enqueue(entry_id)?;
        let command = match candidate {
            SearchCandidate::Episode { .. } => ArrCommand::EpisodeSearch(vec![entry_id]),
            SearchCandidate::Movie { .. } => ArrCommand::MoviesSearch(vec![entry_id]),
        };
        self.api.post_command(&command)?;
        info!("{}: searching for {candidate}", self.name);
        Ok(SearchOutcome::Queued)
    }

    /// Advances past the finished year; on wrapping past the stopping year,
    /// resets to the original start. Returns whether it wrapped.
    pub fn advance_year(&mut self, stopping_year: i32, count_start: i32) -> bool {
        self.current_year += self.delta;
        let wrapped = if self.in_reverse {
            self.current_year > stopping_year
        } else {
            self.current_year < stopping_year
        };
        if wrapped {
            self.current_year = count_start;
        }
        wrapped
    }

    fn pass(&mut self, stopping_year: i32, count_start: i32) -> Result<()> {
        self.db_update()?;
        for candidate in self.candidates()? {
            while self.maybe_do_search(&candidate)? == SearchOutcome::Full {
                debug!("{}: command queue is full, retrying in 30s", self.name);
                std::thread::sleep(Duration::from_secs(30));
            }
        }
        if self.advance_year(stopping_year, count_start) {
            std::thread::sleep(Duration::from_secs(60));
        }
        Ok(())
    }

    /// The search worker. Exits only with the process.
    pub fn run(&mut self) {
        let stopping_year = if self.in_reverse {
            OffsetDateTime::now_utc().year()
        } else {
            1900
        };
        let count_start = self.current_year;
        loop {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.pass(stopping_year, count_start)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("{}: search pass failed: {err:#}", self.name),
                Err(_) => error!("{}: search pass panicked, continuing", self.name),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MockManager;
    use pretty_assertions::assert_eq;
    use rusqlite::Connection;
    use std::path::Path;

    fn radarr_catalog(path: &Path, movies: &[(i64, &str, i64, i64)], active_searches: i64) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE Movies (
                 Id INTEGER PRIMARY KEY, Title TEXT, Year INTEGER, TmdbId INTEGER,
                 Monitored INTEGER, MovieFileId INTEGER, Added TEXT);
             CREATE TABLE Commands (Id INTEGER PRIMARY KEY, Name TEXT, EndedAt TEXT);",
        )
        .unwrap();
        for (id, title, year, file_id) in movies {
            conn.execute(
                "INSERT INTO Movies VALUES (?1, ?2, ?3, ?4, 1, ?5, '2022-01-01')",
                (id, title, year, id * 10, file_id),
            )
            .unwrap();
        }
        for _ in 0..active_searches {
            conn.execute(
                "INSERT INTO Commands (Name, EndedAt) VALUES ('MoviesSearch', NULL)",
                [],
            )
            .unwrap();
        }
    }

    fn scheduler(
        dir: &Path,
        movies: &[(i64, &str, i64, i64)],
        active_searches: i64,
        cfg: ManagerConfig,
    ) -> (SearchScheduler, Arc<MockManager>) {
        let catalog_path = dir.join("radarr.db");
        radarr_catalog(&catalog_path, movies, active_searches);
        let catalog = CatalogReader::open(&catalog_path, ManagerKind::Radarr).unwrap();
        let store = SearchStore::open(&dir.join("local.db"), ManagerKind::Radarr).unwrap();
        let api = Arc::new(MockManager::new(ManagerKind::Radarr));
        let scheduler =
            SearchScheduler::new("radarr-movies", &cfg, catalog, store, api.clone()).unwrap();
        (scheduler, api)
    }

    fn search_cfg() -> ManagerConfig {
        ManagerConfig {
            search_missing: true,
            start_year: Some(2000),
            last_year: Some(2020),
            search_in_reverse: true,
            ..ManagerConfig::default()
        }
    }

    #[test]
    fn posts_searches_for_missing_items() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, api) = scheduler(
            dir.path(),
            &[(1, "Missing", 2020, 0), (2, "Present", 2020, 5)],
            0,
            search_cfg(),
        );

        scheduler.db_update().unwrap();
        let candidates = scheduler.candidates().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            scheduler.maybe_do_search(&candidates[0]).unwrap(),
            SearchOutcome::Queued
        );
        assert_eq!(
            api.commands.lock().unwrap().clone(),
            [ArrCommand::MoviesSearch(vec![1])]
        );
        // A second attempt sees the pending row.
        assert_eq!(
            scheduler.maybe_do_search(&candidates[0]).unwrap(),
            SearchOutcome::AlreadyQueued
        );
        assert_eq!(api.commands.lock().unwrap().len(), 1);
    }

    #[test]
    fn search_cap_blocks_every_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, api) = scheduler(
            dir.path(),
            &[
                (1, "A", 2020, 0),
                (2, "B", 2020, 0),
                (3, "C", 2020, 0),
            ],
            5,
            search_cfg(),
        );

        scheduler.db_update().unwrap();
        let candidates = scheduler.candidates().unwrap();
        assert_eq!(candidates.len(), 3);
        for candidate in &candidates {
            assert_eq!(
                scheduler.maybe_do_search(candidate).unwrap(),
                SearchOutcome::Full
            );
        }
        assert!(api.commands.lock().unwrap().is_empty());
        for candidate in &candidates {
            assert!(!scheduler.store.is_pending(candidate.entry_id()).unwrap());
        }
    }

    #[test]
    fn empty_year_advances_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _) = scheduler(dir.path(), &[], 0, search_cfg());
        assert_eq!(scheduler.current_year(), 2020);
        scheduler.db_update().unwrap();
        // Reverse mode counts upward.
        assert_eq!(scheduler.current_year(), 2021);
    }

    #[test]
    fn year_wraps_back_to_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let (mut scheduler, _) = scheduler(dir.path(), &[], 0, search_cfg());
        let stopping_year = 2026;
        let count_start = scheduler.current_year();

        let mut wraps = 0;
        for _ in 0..32 {
            scheduler.db_update().unwrap();
            if scheduler.advance_year(stopping_year, count_start) {
                wraps += 1;
                break;
            }
        }
        assert_eq!(wraps, 1);
        assert_eq!(scheduler.current_year(), 2020);
    }

    #[test]
    fn forward_mode_counts_down_from_start_year() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ManagerConfig {
            search_in_reverse: false,
            ..search_cfg()
        };
        let (mut scheduler, _) = scheduler(dir.path(), &[], 0, cfg);
        assert_eq!(scheduler.current_year(), 2000);
        scheduler.db_update().unwrap();
        assert_eq!(scheduler.current_year(), 1999);

        // Dropping below the stopping year resets to the start.
        scheduler.current_year = 1900;
        assert!(scheduler.advance_year(1900, 2000));
        assert_eq!(scheduler.current_year(), 2000);
    }

    #[test]
    fn missing_years_are_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = dir.path().join("radarr.db");
        radarr_catalog(&catalog_path, &[], 0);
        let catalog = CatalogReader::open(&catalog_path, ManagerKind::Radarr).unwrap();
        let store = SearchStore::open(&dir.path().join("local.db"), ManagerKind::Radarr).unwrap();
        let api = Arc::new(MockManager::new(ManagerKind::Radarr));
        let cfg = ManagerConfig {
            search_missing: true,
            ..ManagerConfig::default()
        };
        assert!(SearchScheduler::new("radarr-movies", &cfg, catalog, store, api).is_err());
    }
}
