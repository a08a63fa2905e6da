#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::wildcard_imports)]
#![allow(clippy::missing_errors_doc)]

pub mod catalog;
pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod expiring;
pub mod filter;
pub mod manager;
pub mod reconciler;
pub mod search;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use url::Url;

use catalog::CatalogReader;
use client::{QbitHttp, Torrent};
use config::Config;
use db::SearchStore;
use errors::*;
use filter::MediaProbe;
use manager::{ArrCommand, ManagerApi, ManagerHttp};
use reconciler::{PlaceholderReconciler, Reconciler};
use search::SearchScheduler;

/// Process-wide hash bookkeeping. `name_cache` only feeds log lines;
/// `category_cache` routes placeholder rechecks back to the original
/// category. Both tolerate stale reads.
#[derive(Debug, Default)]
pub struct SharedCaches {
    name_cache: Mutex<HashMap<String, String>>,
    category_cache: Mutex<HashMap<String, String>>,
}

impl SharedCaches {
    /// Torrents sitting in the recheck category keep their previously
    /// recorded category.
    pub fn record(&self, torrent: &Torrent, recheck_category: &str) {
        if torrent.category != recheck_category {
            self.category_cache
                .lock()
                .unwrap()
                .insert(torrent.hash.clone(), torrent.category.clone());
        }
        self.name_cache
            .lock()
            .unwrap()
            .insert(torrent.hash.clone(), torrent.name.clone());
    }

    #[must_use]
    pub fn name_of(&self, hash: &str) -> Option<String> {
        self.name_cache.lock().unwrap().get(hash).cloned()
    }

    #[must_use]
    pub fn category_of(&self, hash: &str) -> Option<String> {
        self.category_cache.lock().unwrap().get(hash).cloned()
    }

    pub fn forget(&self, hash: &str) {
        self.name_cache.lock().unwrap().remove(hash);
        self.category_cache.lock().unwrap().remove(hash);
    }
}

/// Queue rows to feed a re-search after a delete.
#[derive(Debug, Clone, PartialEq)]
pub enum Requeue {
    Episodes(Vec<i64>),
    Movie(i64),
}

/// The manager queue as of the owning reconciler's last tick.
#[derive(Debug, Default)]
pub struct QueueSnapshot {
    /// Upper-cased download id to queue id.
    ids: HashMap<String, i64>,
    requeue: HashMap<i64, Requeue>,
}

/// One manager's shared surface: its API plus the latest queue snapshot.
/// The owning reconciler refreshes the snapshot; the placeholder
/// reconcilers read it to re-dispatch hashes.
pub struct ManagerHandle {
    pub name: String,
    pub category: String,
    pub kind: manager::ManagerKind,
    pub api: Arc<dyn ManagerApi>,
    pub queue: Mutex<QueueSnapshot>,
}

impl ManagerHandle {
    pub fn refresh_queue(&self) -> Result<()> {
        let records = self.api.queue()?;
        let mut snapshot = QueueSnapshot::default();
        for record in &records {
            if let Some(ref download_id) = record.download_id {
                snapshot.ids.insert(download_id.to_uppercase(), record.id);
            }
            match self.kind {
                manager::ManagerKind::Sonarr => {
                    if let Some(ref episode) = record.episode {
                        match snapshot
                            .requeue
                            .entry(record.id)
                            .or_insert_with(|| Requeue::Episodes(Vec::new()))
                        {
                            Requeue::Episodes(ids) => ids.push(episode.id),
                            Requeue::Movie(_) => {}
                        }
                    }
                }
                manager::ManagerKind::Radarr => {
                    if let Some(movie_id) = record.movie_id {
                        snapshot.requeue.insert(record.id, Requeue::Movie(movie_id));
                    }
                }
            }
        }
        *self.queue.lock().unwrap() = snapshot;
        Ok(())
    }

    /// Resolves hashes to `(queue id, hash)` pairs through the snapshot.
    #[must_use]
    pub fn resolve(&self, hashes: &HashSet<String>) -> Vec<(i64, String)> {
        let queue = self.queue.lock().unwrap();
        let mut resolved: Vec<(i64, String)> = hashes
            .iter()
            .filter_map(|hash| queue.ids.get(hash).map(|&id| (id, hash.clone())))
            .collect();
        resolved.sort();
        resolved
    }

    #[must_use]
    pub fn requeue_for(&self, queue_id: i64) -> Option<Requeue> {
        self.queue.lock().unwrap().requeue.get(&queue_id).cloned()
    }

    /// Drops the queue entry and asks the manager to search for a
    /// replacement. Failures here are per-item: logged, never fatal.
    pub fn delete_and_research(&self, queue_id: i64, blocklist: bool) {
        if let Err(err) = self.api.delete_queue_entry(queue_id, true, blocklist) {
            debug!("queue delete {queue_id} failed: {err:#}");
        }
        let Some(requeue) = self.requeue_for(queue_id) else {
            return;
        };
        match requeue {
            Requeue::Episodes(ids) => {
                if ids.is_empty() {
                    return;
                }
                match self.api.episode_detail(ids[0]) {
                    Ok(detail) if detail.title.is_some() => info!(
                        "re-searching episode: {} ({}) | S{:02}E{:03} | {} | [tvdbId={}|id={}]",
                        detail.series.title.as_deref().unwrap_or(""),
                        detail.series.year,
                        detail.season_number,
                        detail.episode_number,
                        detail.title.as_deref().unwrap_or(""),
                        detail.series.tvdb_id,
                        ids[0],
                    ),
                    _ => info!("re-searching episodes: {ids:?}"),
                }
                if let Err(err) = self.api.post_command(&ArrCommand::EpisodeSearch(ids)) {
                    warn!("episode re-search failed: {err:#}");
                }
            }
            Requeue::Movie(id) => {
                match self.api.movie_detail(id) {
                    Ok(detail) if detail.title.is_some() => info!(
                        "re-searching movie: {} ({}) | [tmdbId={}|id={id}]",
                        detail.title.as_deref().unwrap_or(""),
                        detail.year,
                        detail.tmdb_id,
                    ),
                    _ => info!("re-searching movie: {id}"),
                }
                if let Err(err) = self.api.post_command(&ArrCommand::MoviesSearch(vec![id])) {
                    warn!("movie re-search failed: {err:#}");
                }
            }
        }
    }
}

/// Builds one reconciler (and possibly one search scheduler) per configured
/// manager plus the two placeholder reconcilers, then runs every worker on
/// its own thread.
pub struct Supervisor {
    config: Config,
    caches: Arc<SharedCaches>,
    probe: MediaProbe,
}

struct BuiltManager {
    reconciler: Reconciler<QbitHttp>,
    scheduler: Option<SearchScheduler>,
    name: String,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: Config) -> Self {
        let probe = MediaProbe::detect();
        if !probe.is_available() {
            tracing::error!(
                "ffprobe was not found in PATH, disabling all functionality dependent on it"
            );
        }
        Self {
            config,
            caches: Arc::new(SharedCaches::default()),
            probe,
        }
    }

    fn new_client(&self) -> Result<QbitHttp> {
        QbitHttp::new(
            self.config.qbit.host.clone(),
            self.config.qbit.credentials(),
        )
    }

    /// Builds one section's workers. Bails with [`SkipManager`] when the
    /// section opted out; every other error is a fatal configuration error.
    fn build_manager(
        &self,
        section: &config::ManagerSection,
        settings: &config::Settings,
        app_data: &std::path::Path,
        uris: &mut HashSet<Url>,
        categories: &mut HashSet<String>,
    ) -> Result<(Arc<ManagerHandle>, BuiltManager)> {
        if !section.config.managed {
            bail!(SkipManager);
        }
        let cfg = section.config.clone();
        if !uris.insert(cfg.uri.clone()) {
            bail!(
                "section '{}' manages '{}' which is already registered",
                section.name,
                cfg.uri
            );
        }
        let category = cfg.category_or(&section.name).to_string();
        if !categories.insert(category.clone()) {
            bail!("category '{category}' is claimed by more than one section");
        }

        let api: Arc<dyn ManagerApi> = Arc::new(ManagerHttp::new(
            section.kind,
            cfg.uri.clone(),
            &cfg.api_key,
        )?);
        let handle = Arc::new(ManagerHandle {
            name: section.name.clone(),
            category,
            kind: section.kind,
            api,
            queue: Mutex::new(QueueSnapshot::default()),
        });

        let mut search_missing = cfg.search_missing;
        if search_missing && !cfg.database_file.exists() {
            warn!(
                "{}: catalog file '{}' does not exist, disabling missing-item search",
                section.name,
                cfg.database_file.display()
            );
            search_missing = false;
        }
        let scheduler = if search_missing {
            let catalog = CatalogReader::open(&cfg.database_file, section.kind)?;
            let store = SearchStore::open(
                &app_data.join(format!("{}.db", section.name)),
                section.kind,
            )?;
            Some(SearchScheduler::new(
                &section.name,
                &cfg,
                catalog,
                store,
                handle.api.clone(),
            )?)
        } else {
            None
        };

        debug!(
            "{}: Category={}, URI={}, ImportMode={}, Research={}, SearchByYear={}",
            section.name, handle.category, cfg.uri, cfg.import_mode, cfg.research,
            cfg.search_by_year
        );
        let reconciler = Reconciler::new(
            &section.name,
            cfg,
            settings,
            self.new_client()?,
            handle.clone(),
            self.caches.clone(),
            self.probe,
        )?;
        Ok((
            handle,
            BuiltManager {
                reconciler,
                scheduler,
                name: section.name.clone(),
            },
        ))
    }

    pub fn run(self) -> Result<()> {
        let settings = self.config.settings.clone();
        let app_data = self.config.app_data_folder()?;
        let mut categories: HashSet<String> = HashSet::new();
        let mut uris: HashSet<Url> = HashSet::new();
        let mut handles: Vec<Arc<ManagerHandle>> = Vec::new();
        let mut built: Vec<BuiltManager> = Vec::new();

        for section in self.config.manager_sections()? {
            match self.build_manager(&section, &settings, &app_data, &mut uris, &mut categories)
            {
                Ok((handle, manager)) => {
                    handles.push(handle);
                    built.push(manager);
                }
                Err(err) if err.downcast_ref::<SkipManager>().is_some() => {
                    debug!("skipping section {}", section.name);
                }
                Err(err) => return Err(err),
            }
        }

        let mut workers = Vec::new();
        for group in built {
            let BuiltManager {
                mut reconciler,
                scheduler,
                name,
            } = group;
            let thread_settings = settings.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("{name}-torrents"))
                    .spawn(move || reconciler.run(&thread_settings))?,
            );
            if let Some(mut scheduler) = scheduler {
                workers.push(
                    std::thread::Builder::new()
                        .name(format!("{name}-search"))
                        .spawn(move || scheduler.run())?,
                );
            }
        }

        for category in [&settings.failed_category, &settings.recheck_category] {
            let mut placeholder = PlaceholderReconciler::new(
                category,
                &settings,
                self.new_client()?,
                self.caches.clone(),
                handles.clone(),
            );
            let thread_settings = settings.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("{category}-torrents"))
                    .spawn(move || placeholder.run(&thread_settings))?,
            );
        }

        info!("started {} workers", workers.len());
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                tracing::error!("worker {name} exited abnormally");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::test_torrent;
    use manager::{EpisodeRef, ManagerKind, MockManager, QueueRecord};
    use pretty_assertions::assert_eq;

    #[test]
    fn caches_record_and_forget() {
        let caches = SharedCaches::default();
        let torrent = test_torrent("abcd", "A Name", "tv", client::TorrentState::Downloading);
        caches.record(&torrent, "recheck");
        assert_eq!(caches.name_of("ABCD").as_deref(), Some("A Name"));
        assert_eq!(caches.category_of("ABCD").as_deref(), Some("tv"));

        // Seen in the recheck category: the original category survives.
        let moved = test_torrent("abcd", "A Name", "recheck", client::TorrentState::Downloading);
        caches.record(&moved, "recheck");
        assert_eq!(caches.category_of("ABCD").as_deref(), Some("tv"));

        caches.forget("ABCD");
        assert_eq!(caches.name_of("ABCD"), None);
        assert_eq!(caches.category_of("ABCD"), None);
    }

    #[test]
    fn queue_snapshot_aggregates_episodes_per_entry() {
        let manager = Arc::new(MockManager::new(ManagerKind::Sonarr));
        manager.push_queue_record(QueueRecord {
            id: 5,
            download_id: Some("aaaa".to_string()),
            episode: Some(EpisodeRef { id: 1 }),
            movie_id: None,
        });
        manager.push_queue_record(QueueRecord {
            id: 5,
            download_id: Some("aaaa".to_string()),
            episode: Some(EpisodeRef { id: 2 }),
            movie_id: None,
        });
        let handle = ManagerHandle {
            name: "sonarr-tv".to_string(),
            category: "tv".to_string(),
            kind: ManagerKind::Sonarr,
            api: manager,
            queue: Mutex::new(QueueSnapshot::default()),
        };
        handle.refresh_queue().unwrap();

        assert_eq!(handle.requeue_for(5), Some(Requeue::Episodes(vec![1, 2])));
        let hashes: HashSet<String> = ["AAAA".to_string(), "BBBB".to_string()].into();
        assert_eq!(handle.resolve(&hashes), [(5, "AAAA".to_string())]);
    }
}
