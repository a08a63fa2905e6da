use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::client::{Torrent, TorrentCli, TorrentState};
use crate::config::{ManagerConfig, Settings};
use crate::errors::*;
use crate::expiring::ExpiringSet;
use crate::filter::{ContentFilter, MediaProbe};
use crate::manager::ArrCommand;
use crate::{ManagerHandle, SharedCaches};

#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Named-command timer; fires on the first check and then once per interval.
#[derive(Debug)]
struct IntervalTimer {
    every: Duration,
    last: Option<Instant>,
}

impl IntervalTimer {
    fn from_minutes(minutes: u64) -> Option<Self> {
        (minutes > 0).then(|| Self {
            every: Duration::from_secs(minutes * 60),
            last: None,
        })
    }

    fn due(&mut self) -> bool {
        match self.last {
            Some(last) if last.elapsed() < self.every => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}

/// What the classifier decided for one torrent. Exactly one variant per
/// torrent per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Manually moved into the failed category.
    ForceDelete,
    /// Manually moved into the recheck category.
    ForceRecheck,
    Ignore,
    /// Nearly complete but dead for longer than the maximum ETA.
    DeleteStale,
    /// Client reports an errored torrent.
    Recheck,
    /// Finished and settled; hand over for import.
    PauseAndImport,
    /// Client lost the payload; delete without blocklisting the release.
    DeleteUnblocked,
    Resume,
    /// Stalled or fetching metadata; skip for a while, delete when old.
    Stalled { delete: bool },
    PauseSeeding,
    DeleteSlow,
    DeleteUnavailable,
    FilterFiles,
}

/// Drives one manager's category: classifies the torrent snapshot into
/// per-tick intents and flushes them in a fixed order.
pub struct Reconciler<C: TorrentCli> {
    name: String,
    category: String,
    completed_folder: PathBuf,
    recheck_category: String,
    failed_category: String,
    cfg: ManagerConfig,
    client: C,
    handle: Arc<ManagerHandle>,
    caches: Arc<SharedCaches>,
    filter: ContentFilter,
    probe: MediaProbe,

    pause: HashSet<String>,
    resume: HashSet<String>,
    recheck: HashSet<String>,
    delete: HashSet<String>,
    skip_blacklist: HashSet<String>,
    change_priority: HashMap<String, Vec<i64>>,
    import_torrents: Vec<Torrent>,

    sent_to_scan: HashSet<PathBuf>,
    sent_to_scan_hashes: HashSet<String>,
    files_probed: HashSet<PathBuf>,
    timed_ignore_cache: ExpiringSet,
    timed_skip: ExpiringSet,

    rss_sync: Option<IntervalTimer>,
    refresh_downloads: Option<IntervalTimer>,
    needs_cleanup: bool,
}

impl<C: TorrentCli> Reconciler<C> {
    pub fn new(
        name: &str,
        cfg: ManagerConfig,
        settings: &Settings,
        client: C,
        handle: Arc<ManagerHandle>,
        caches: Arc<SharedCaches>,
        probe: MediaProbe,
    ) -> Result<Self> {
        let category = handle.category.clone();
        let completed_folder = settings.completed_download_folder.join(&category);
        if !completed_folder.exists() {
            bail!(
                "{name}: completed folder '{}' does not exist",
                completed_folder.display()
            );
        }
        let filter = ContentFilter::new(
            &cfg.folder_exclusion_regex,
            &cfg.file_name_exclusion_regex,
            &cfg.file_extension_allowlist,
            cfg.case_sensitive_matches,
        )?;
        let ttl = u64::try_from(cfg.ignore_torrents_younger_than).unwrap_or(600);
        Ok(Self {
            name: name.to_string(),
            category,
            completed_folder,
            recheck_category: settings.recheck_category.clone(),
            failed_category: settings.failed_category.clone(),
            rss_sync: IntervalTimer::from_minutes(cfg.rss_sync_timer),
            refresh_downloads: IntervalTimer::from_minutes(cfg.refresh_downloads_timer),
            cfg,
            client,
            handle,
            caches,
            filter,
            probe,
            pause: HashSet::new(),
            resume: HashSet::new(),
            recheck: HashSet::new(),
            delete: HashSet::new(),
            skip_blacklist: HashSet::new(),
            change_priority: HashMap::new(),
            import_torrents: Vec::new(),
            sent_to_scan: HashSet::new(),
            sent_to_scan_hashes: HashSet::new(),
            files_probed: HashSet::new(),
            timed_ignore_cache: ExpiringSet::new(ttl),
            timed_skip: ExpiringSet::new(ttl),
            needs_cleanup: false,
        })
    }

    /// Health probe plus the periodic named commands.
    fn api_calls(&mut self) -> Result<()> {
        if !self.handle.api.is_alive() {
            bail!(NoConnection(format!(
                "{} did not respond on {}",
                self.name, self.cfg.uri
            )));
        }
        if self.rss_sync.as_mut().is_some_and(IntervalTimer::due) {
            self.handle.api.post_command(&ArrCommand::RssSync)?;
        }
        if self.refresh_downloads.as_mut().is_some_and(IntervalTimer::due) {
            self.handle
                .api
                .post_command(&ArrCommand::RefreshMonitoredDownloads)?;
        }
        Ok(())
    }

    fn clear_intents(&mut self) {
        self.pause.clear();
        self.resume.clear();
        self.recheck.clear();
        self.delete.clear();
        self.skip_blacklist.clear();
        self.change_priority.clear();
        self.import_torrents.clear();
    }

    /// One pass over a fresh snapshot. Transient manager outages surface as
    /// [`NoConnection`]; everything else is an ordinary error the worker
    /// logs.
    pub fn tick(&mut self) -> Result<()> {
        self.clear_intents();
        self.api_calls()?;
        self.handle.refresh_queue()?;
        let now = unix_now();
        let torrents = self.client.torrents_info(&self.category)?;
        for torrent in &torrents {
            self.caches.record(torrent, &self.recheck_category);
            let disposition = self.classify(torrent, now);
            self.accumulate(torrent, disposition);
        }
        self.flush()
    }

    /// The rule order is load bearing: the first match wins.
    pub fn classify(&mut self, torrent: &Torrent, now: i64) -> Disposition {
        if torrent.category == self.failed_category {
            return Disposition::ForceDelete;
        }
        if torrent.category == self.recheck_category {
            return Disposition::ForceRecheck;
        }
        if torrent.state.is_ignored() {
            return Disposition::Ignore;
        }
        if self.timed_ignore_cache.contains(&torrent.hash)
            || self.timed_skip.contains(&torrent.hash)
        {
            return Disposition::Ignore;
        }
        // Stalled at a high percentage: keep it while anything still moves
        // within the ETA window, drop it once it flatlines.
        if torrent.progress >= self.cfg.maximum_deletable_percentage
            && !torrent.state.is_complete()
        {
            if torrent.last_activity < now - self.cfg.maximum_eta {
                return Disposition::DeleteStale;
            }
            return Disposition::Ignore;
        }
        if self.sent_to_scan_hashes.contains(&torrent.hash) {
            return Disposition::Ignore;
        }
        if torrent.state == TorrentState::Error {
            return Disposition::Recheck;
        }
        if torrent.added_on > 0
            && torrent.amount_left == 0
            && torrent.state.is_complete()
            && !torrent.content_path.is_empty()
            && torrent.completion_on < now - 30
        {
            return Disposition::PauseAndImport;
        }
        if torrent.state == TorrentState::MissingFiles {
            return Disposition::DeleteUnblocked;
        }
        if torrent.state == TorrentState::PausedDownload && torrent.progress < 1.0 {
            return Disposition::Resume;
        }
        if matches!(
            torrent.state,
            TorrentState::MetadataDownload | TorrentState::StalledDownload
        ) {
            return Disposition::Stalled {
                delete: torrent.added_on < now - self.cfg.ignore_torrents_younger_than,
            };
        }
        if torrent.state.is_uploading()
            && torrent.seeding_time > 1
            && torrent.amount_left == 0
            && torrent.added_on > 0
            && !torrent.content_path.is_empty()
        {
            return Disposition::PauseSeeding;
        }
        if torrent.state != TorrentState::PausedDownload
            && torrent.state.is_downloading()
            && torrent.added_on < now - self.cfg.ignore_torrents_younger_than
            && torrent.eta > self.cfg.maximum_eta
        {
            return Disposition::DeleteSlow;
        }
        if torrent.state.is_downloading() {
            if torrent.added_on < now - self.cfg.ignore_torrents_younger_than
                && torrent.availability < 1.0
            {
                return Disposition::DeleteUnavailable;
            }
            return Disposition::FilterFiles;
        }
        Disposition::Ignore
    }

    fn accumulate(&mut self, torrent: &Torrent, disposition: Disposition) {
        let hash = torrent.hash.clone();
        match disposition {
            Disposition::Ignore => {}
            Disposition::ForceDelete => {
                info!(
                    "deleting manually failed torrent [progress {:.2}%]: {} ({hash})",
                    torrent.progress * 100.0,
                    torrent.name
                );
                self.delete.insert(hash);
            }
            Disposition::ForceRecheck => {
                info!(
                    "rechecking manually set torrent: {} ({hash})",
                    torrent.name
                );
                self.recheck.insert(hash);
            }
            Disposition::DeleteStale => {
                info!(
                    "deleting stale torrent [progress {:.2}%]: {} ({hash})",
                    torrent.progress * 100.0,
                    torrent.name
                );
                self.delete.insert(hash);
            }
            Disposition::Recheck => {
                info!("rechecking errored torrent: {} ({hash})", torrent.name);
                self.recheck.insert(hash);
            }
            Disposition::PauseAndImport => {
                info!(
                    "pausing completed torrent: {} ({hash}) | {:?}",
                    torrent.name, torrent.state
                );
                self.pause.insert(hash);
                self.import_torrents.push(torrent.clone());
            }
            Disposition::DeleteUnblocked => {
                info!(
                    "deleting torrent with missing files: {} ({hash})",
                    torrent.name
                );
                self.skip_blacklist.insert(hash);
            }
            Disposition::Resume => {
                self.resume.insert(hash);
            }
            Disposition::Stalled { delete } => {
                self.timed_skip.insert(&hash);
                if delete {
                    info!(
                        "deleting stalled torrent [progress {:.2}%]: {} ({hash})",
                        torrent.progress * 100.0,
                        torrent.name
                    );
                    self.delete.insert(hash);
                }
            }
            Disposition::PauseSeeding => {
                info!(
                    "pausing uploading torrent: {} ({hash}) | {:?}",
                    torrent.name, torrent.state
                );
                self.pause.insert(hash);
            }
            Disposition::DeleteSlow => {
                info!(
                    "deleting slow torrent [progress {:.2}%][eta {}s]: {} ({hash})",
                    torrent.progress * 100.0,
                    torrent.eta,
                    torrent.name
                );
                self.delete.insert(hash);
            }
            Disposition::DeleteUnavailable => {
                info!(
                    "deleting unavailable torrent [availability {:.2}%]: {} ({hash})",
                    torrent.availability * 100.0,
                    torrent.name
                );
                self.delete.insert(hash);
            }
            Disposition::FilterFiles => self.filter_files(torrent),
        }
    }

    /// Deprioritizes unwanted files; drops the torrent entirely when nothing
    /// is left to download.
    fn filter_files(&mut self, torrent: &Torrent) {
        let mut marked: Vec<i64> = Vec::new();
        let mut total = i64::try_from(torrent.files.len()).unwrap_or(i64::MAX);
        for file in &torrent.files {
            if file.priority == 0 {
                total -= 1;
                continue;
            }
            let path = Path::new(&file.name);
            let base = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !self.filter.extension_allowed(path) {
                debug!(
                    "removing file, extension not allowed: {} ({}) | {}",
                    torrent.name, torrent.hash, file.name
                );
                marked.push(file.id);
                total -= 1;
            } else if self.filter.folder_excluded(path) {
                debug!(
                    "removing file, parent folder excluded: {} ({}) | {}",
                    torrent.name, torrent.hash, file.name
                );
                marked.push(file.id);
                total -= 1;
            } else if self.filter.file_name_excluded(&base) {
                debug!(
                    "removing file, name excluded: {} ({}) | {}",
                    torrent.name, torrent.hash, file.name
                );
                marked.push(file.id);
                total -= 1;
            }
        }
        if total == 0 {
            info!(
                "deleting torrent, all files ignored: {} ({})",
                torrent.name, torrent.hash
            );
            self.delete.insert(torrent.hash.clone());
        } else if !marked.is_empty() && !self.change_priority.contains_key(&torrent.hash) {
            self.change_priority.insert(torrent.hash.clone(), marked);
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.process_paused()?;
        self.process_errored()?;
        self.process_file_priority()?;
        self.process_imports();
        self.process_failed()?;
        self.process_resume()?;
        self.folder_cleanup();
        Ok(())
    }

    fn process_paused(&mut self) -> Result<()> {
        if self.pause.is_empty() {
            return Ok(());
        }
        self.needs_cleanup = true;
        debug!("pausing {} completed torrents", self.pause.len());
        self.client.torrents_pause(&self.pause)?;
        self.pause.clear();
        Ok(())
    }

    fn process_errored(&mut self) -> Result<()> {
        if self.recheck.is_empty() {
            return Ok(());
        }
        self.needs_cleanup = true;
        let rechecking: Vec<String> = self.recheck.drain().collect();
        self.client.torrents_recheck(&rechecking)?;
        for hash in &rechecking {
            self.timed_ignore_cache.insert(hash);
        }
        Ok(())
    }

    fn process_file_priority(&mut self) -> Result<()> {
        for (hash, files) in std::mem::take(&mut self.change_priority) {
            self.needs_cleanup = true;
            match self.caches.name_of(&hash) {
                Some(name) => {
                    debug!("updating file priority on torrent: {name} ({hash})");
                    self.client.torrents_file_priority(&hash, &files, 0)?;
                }
                None => error!("torrent does not exist? {hash}"),
            }
        }
        Ok(())
    }

    fn process_imports(&mut self) {
        if self.import_torrents.is_empty() {
            return;
        }
        self.needs_cleanup = true;
        for torrent in std::mem::take(&mut self.import_torrents) {
            let path = PathBuf::from(&torrent.content_path);
            if !path.exists() {
                info!(
                    "deleting torrent with a missing payload: {} ({})",
                    torrent.name, torrent.hash
                );
                self.skip_blacklist.insert(torrent.hash.clone());
                continue;
            }
            if self.sent_to_scan.contains(&path)
                || self.sent_to_scan_hashes.contains(&torrent.hash)
            {
                continue;
            }
            let command = ArrCommand::DownloadedEpisodesScan {
                path: path.to_string_lossy().into_owned(),
                download_client_id: torrent.hash.to_uppercase(),
                import_mode: self.cfg.import_mode.clone(),
            };
            info!("requesting scan of {}", path.display());
            if let Err(err) = self.handle.api.post_command(&command) {
                warn!("scan command failed for {}: {err:#}", path.display());
                continue;
            }
            self.sent_to_scan_hashes.insert(torrent.hash);
            self.sent_to_scan.insert(path);
        }
    }

    fn process_failed(&mut self) -> Result<()> {
        let to_delete: HashSet<String> =
            self.delete.union(&self.skip_blacklist).cloned().collect();
        if !to_delete.is_empty() {
            self.needs_cleanup = true;
            for (queue_id, hash) in self.handle.resolve(&to_delete) {
                debug!(
                    "blocklisting: {} ({hash})",
                    self.caches.name_of(&hash).unwrap_or_else(|| "Deleted".to_string())
                );
                let blocklist = !self.skip_blacklist.contains(&hash);
                self.handle.delete_and_research(queue_id, blocklist);
            }
            self.client.torrents_delete(&to_delete, true)?;
            for hash in &to_delete {
                self.caches.forget(hash);
            }
        }
        self.delete.clear();
        self.skip_blacklist.clear();
        Ok(())
    }

    fn process_resume(&mut self) -> Result<()> {
        if self.resume.is_empty() {
            return Ok(());
        }
        self.needs_cleanup = true;
        self.client.torrents_resume(&self.resume)?;
        let resumed: Vec<String> = self.resume.drain().collect();
        for hash in &resumed {
            self.timed_ignore_cache.insert(hash);
        }
        Ok(())
    }

    fn file_is_probeable(&mut self, path: &Path) -> bool {
        if !self.probe.is_available() {
            return true;
        }
        if self.files_probed.contains(path) {
            return true;
        }
        if self.probe.file_is_probeable(path) {
            self.files_probed.insert(path.to_path_buf());
            return true;
        }
        false
    }

    /// Removes everything under the completed folder that is not an allowed,
    /// probeable media file, then prunes empty directories.
    fn folder_cleanup(&mut self) {
        if !self.cfg.auto_delete || !self.needs_cleanup {
            return;
        }
        debug!("folder cleanup: {}", self.completed_folder.display());
        for entry in WalkDir::new(&self.completed_folder)
            .min_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy();
            if name == "desktop.ini" || name == ".DS_Store" {
                continue;
            }
            if entry.file_type().is_dir() {
                continue;
            }
            if self.filter.extension_allowed(path) && self.file_is_probeable(path) {
                continue;
            }
            match std::fs::remove_file(path) {
                Ok(()) => debug!("file removed: {}", path.display()),
                Err(err) => debug!("failed to remove {}: {err}", path.display()),
            }
        }
        self.remove_empty_folders();
        self.needs_cleanup = false;
    }

    fn remove_empty_folders(&mut self) {
        for entry in WalkDir::new(&self.completed_folder)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            let path = entry.path();
            if entry.file_type().is_dir() && dir_is_empty(path) {
                debug!("removing empty folder: {}", path.display());
                if std::fs::remove_dir(path).is_ok() {
                    self.sent_to_scan.remove(path);
                }
            }
        }
        if dir_is_empty(&self.completed_folder) {
            self.sent_to_scan.clear();
            self.sent_to_scan_hashes.clear();
        }
    }

    /// The torrent worker. Exits only with the process.
    pub fn run(&mut self, settings: &Settings) {
        let loop_sleep = Duration::from_secs(settings.loop_sleep_timer);
        let no_net_sleep = Duration::from_secs(settings.no_internet_sleep_timer);
        loop {
            if !self.client.is_alive() {
                error!("failed to connect to the download client, sleeping for 300s");
                std::thread::sleep(Duration::from_secs(300));
                continue;
            }
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.tick()));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if err.downcast_ref::<NoConnection>().is_some() {
                        warn!("{err:#}, sleeping for {}s", no_net_sleep.as_secs());
                        std::thread::sleep(no_net_sleep);
                        continue;
                    }
                    error!("tick failed: {err:#}");
                }
                Err(_) => error!("tick panicked, continuing"),
            }
            std::thread::sleep(loop_sleep);
        }
    }
}

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Process-wide reconciler for one special category. Accepts only the two
/// manual rules and re-dispatches the resulting hashes to whichever manager
/// owns them.
pub struct PlaceholderReconciler<C: TorrentCli> {
    category: String,
    failed_category: String,
    recheck_category: String,
    client: C,
    caches: Arc<SharedCaches>,
    handles: Vec<Arc<ManagerHandle>>,
    delete: HashSet<String>,
    recheck: HashSet<String>,
    skip_blacklist: HashSet<String>,
    timed_ignore_cache: ExpiringSet,
}

impl<C: TorrentCli> PlaceholderReconciler<C> {
    #[must_use]
    pub fn new(
        category: &str,
        settings: &Settings,
        client: C,
        caches: Arc<SharedCaches>,
        handles: Vec<Arc<ManagerHandle>>,
    ) -> Self {
        Self {
            category: category.to_string(),
            failed_category: settings.failed_category.clone(),
            recheck_category: settings.recheck_category.clone(),
            client,
            caches,
            handles,
            delete: HashSet::new(),
            recheck: HashSet::new(),
            skip_blacklist: HashSet::new(),
            timed_ignore_cache: ExpiringSet::new(600),
        }
    }

    pub fn tick(&mut self) -> Result<()> {
        let torrents = self.client.torrents_info(&self.category)?;
        for torrent in &torrents {
            self.caches.record(torrent, &self.recheck_category);
            if torrent.category == self.failed_category {
                info!(
                    "deleting manually failed torrent: {} ({})",
                    torrent.name, torrent.hash
                );
                self.delete.insert(torrent.hash.clone());
            } else if torrent.category == self.recheck_category {
                info!(
                    "rechecking manually set torrent: {} ({})",
                    torrent.name, torrent.hash
                );
                self.recheck.insert(torrent.hash.clone());
            }
        }
        self.process_errored()?;
        self.process_failed()
    }

    /// Rechecks, then puts every hash back into the category it came from.
    fn process_errored(&mut self) -> Result<()> {
        if self.recheck.is_empty() {
            return Ok(());
        }
        let rechecking: Vec<String> = self.recheck.drain().collect();
        let mut by_category: HashMap<String, Vec<String>> = HashMap::new();
        for hash in &rechecking {
            if let Some(category) = self.caches.category_of(hash) {
                by_category.entry(category).or_default().push(hash.clone());
            }
        }
        self.client.torrents_recheck(&rechecking)?;
        for (category, hashes) in by_category {
            self.client.torrents_set_category(&hashes, &category)?;
        }
        for hash in &rechecking {
            self.timed_ignore_cache.insert(hash);
        }
        Ok(())
    }

    fn process_failed(&mut self) -> Result<()> {
        let to_delete: HashSet<String> =
            self.delete.union(&self.skip_blacklist).cloned().collect();
        if !to_delete.is_empty() {
            for handle in &self.handles {
                for (queue_id, hash) in handle.resolve(&to_delete) {
                    debug!(
                        "blocklisting: {} ({hash})",
                        self.caches.name_of(&hash).unwrap_or_else(|| "Deleted".to_string())
                    );
                    let blocklist = !self.skip_blacklist.contains(&hash);
                    handle.delete_and_research(queue_id, blocklist);
                }
            }
            self.client.torrents_delete(&to_delete, true)?;
            for hash in &to_delete {
                self.caches.forget(hash);
            }
        }
        self.delete.clear();
        self.skip_blacklist.clear();
        Ok(())
    }

    pub fn run(&mut self, settings: &Settings) {
        let loop_sleep = Duration::from_secs(settings.loop_sleep_timer);
        loop {
            if !self.client.is_alive() {
                error!("failed to connect to the download client, sleeping for 300s");
                std::thread::sleep(Duration::from_secs(300));
                continue;
            }
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.tick()));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("tick failed: {err:#}"),
                Err(_) => error!("tick panicked, continuing"),
            }
            std::thread::sleep(loop_sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{test_torrent, MockClient, TorrentFile};
    use crate::manager::{ArrCommand, EpisodeRef, ManagerKind, MockManager, QueueRecord};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct Fixture {
        reconciler: Reconciler<MockClient>,
        manager: Arc<MockManager>,
        caches: Arc<SharedCaches>,
        _dir: tempfile::TempDir,
    }

    fn fixture(torrents: Vec<Torrent>) -> Fixture {
        fixture_with(torrents, ManagerConfig {
            file_extension_allowlist: vec![".mkv".to_string(), ".mp4".to_string()],
            folder_exclusion_regex: vec!["sample".to_string()],
            file_name_exclusion_regex: vec![r"\.nfo".to_string()],
            rss_sync_timer: 0,
            refresh_downloads_timer: 0,
            ..ManagerConfig::default()
        })
    }

    fn fixture_with(torrents: Vec<Torrent>, cfg: ManagerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("tv")).unwrap();
        let settings = Settings {
            completed_download_folder: dir.path().to_path_buf(),
            ..Settings::default()
        };
        let manager = Arc::new(MockManager::new(ManagerKind::Sonarr));
        let handle = Arc::new(ManagerHandle {
            name: "sonarr-tv".to_string(),
            category: "tv".to_string(),
            kind: ManagerKind::Sonarr,
            api: manager.clone(),
            queue: Mutex::new(crate::QueueSnapshot::default()),
        });
        let caches = Arc::new(SharedCaches::default());
        let reconciler = Reconciler::new(
            "sonarr-tv",
            cfg,
            &settings,
            MockClient::with_torrents(torrents),
            handle,
            caches.clone(),
            MediaProbe::with_availability(false),
        )
        .unwrap();
        Fixture {
            reconciler,
            manager,
            caches,
            _dir: dir,
        }
    }

    fn queue_row(id: i64, download_id: &str, episode_id: i64) -> QueueRecord {
        QueueRecord {
            id,
            download_id: Some(download_id.to_string()),
            episode: Some(EpisodeRef { id: episode_id }),
            movie_id: None,
        }
    }

    #[test]
    fn stalled_torrent_is_deleted_and_blocklisted() {
        let now = unix_now();
        let mut torrent = test_torrent("abcd", "stalled", "tv", TorrentState::StalledDownload);
        torrent.added_on = now - 3600;
        torrent.progress = 0.1;
        let mut fx = fixture(vec![torrent]);
        fx.manager.push_queue_record(queue_row(11, "abcd", 42));

        fx.reconciler.tick().unwrap();

        assert_eq!(
            fx.manager.queue_deletes.lock().unwrap().clone(),
            [(11, true, true)]
        );
        assert_eq!(
            fx.reconciler.client.deleted,
            [("ABCD".to_string(), true)]
        );
        // The deletion re-searches the episode that was in the queue.
        assert!(fx
            .manager
            .commands
            .lock()
            .unwrap()
            .contains(&ArrCommand::EpisodeSearch(vec![42])));
    }

    #[test]
    fn completed_torrent_is_paused_and_scanned() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("x.mkv");
        std::fs::write(&payload, b"x").unwrap();

        let now = unix_now();
        let mut torrent = test_torrent("beef", "done", "tv", TorrentState::StalledUpload);
        torrent.progress = 1.0;
        torrent.amount_left = 0;
        torrent.added_on = now - 7200;
        torrent.completion_on = now - 60;
        torrent.content_path = payload.to_string_lossy().into_owned();
        let mut fx = fixture(vec![torrent]);

        fx.reconciler.tick().unwrap();

        assert_eq!(fx.reconciler.client.paused, ["BEEF"]);
        assert_eq!(
            fx.manager.commands.lock().unwrap().clone(),
            [ArrCommand::DownloadedEpisodesScan {
                path: payload.to_string_lossy().into_owned(),
                download_client_id: "BEEF".to_string(),
                import_mode: "Move".to_string(),
            }]
        );
        assert!(fx.reconciler.sent_to_scan_hashes.contains("BEEF"));
        assert!(fx.reconciler.sent_to_scan.contains(&payload));

        // The next tick skips the torrent entirely.
        fx.reconciler.tick().unwrap();
        assert_eq!(fx.manager.commands.lock().unwrap().len(), 1);
        assert_eq!(fx.reconciler.client.paused.len(), 1);
    }

    #[test]
    fn missing_files_soft_delete_does_not_blocklist() {
        let torrent = test_torrent("dead", "gone", "tv", TorrentState::MissingFiles);
        let mut fx = fixture(vec![torrent]);
        fx.manager.push_queue_record(queue_row(3, "dead", 9));

        fx.reconciler.tick().unwrap();

        assert_eq!(
            fx.manager.queue_deletes.lock().unwrap().clone(),
            [(3, true, false)]
        );
        assert_eq!(fx.reconciler.client.deleted, [("DEAD".to_string(), true)]);
        assert!(fx.reconciler.delete.is_empty());
        assert!(fx.reconciler.skip_blacklist.is_empty());
        assert!(fx.caches.name_of("DEAD").is_none());
    }

    #[test]
    fn file_priority_mask() {
        let now = unix_now();
        let mut torrent = test_torrent("f00d", "young", "tv", TorrentState::Downloading);
        torrent.added_on = now - 10;
        torrent.files = vec![
            TorrentFile {
                id: 0,
                name: "Release/Sample/clip.mkv".to_string(),
                priority: 1,
            },
            TorrentFile {
                id: 1,
                name: "Release/movie.mkv".to_string(),
                priority: 1,
            },
            TorrentFile {
                id: 2,
                name: "Release/notes.txt".to_string(),
                priority: 1,
            },
        ];
        let mut fx = fixture(vec![torrent]);

        fx.reconciler.tick().unwrap();

        assert_eq!(
            fx.reconciler.client.priority_calls,
            [("F00D".to_string(), vec![0, 2], 0)]
        );
        assert!(fx.reconciler.client.deleted.is_empty());
    }

    #[test]
    fn all_files_filtered_deletes_the_torrent() {
        let now = unix_now();
        let mut torrent = test_torrent("0ff0", "junk", "tv", TorrentState::Downloading);
        torrent.added_on = now - 10;
        torrent.files = vec![TorrentFile {
            id: 0,
            name: "Release/notes.txt".to_string(),
            priority: 1,
        }];
        let mut fx = fixture(vec![torrent]);

        fx.reconciler.tick().unwrap();

        assert_eq!(fx.reconciler.client.deleted, [("0FF0".to_string(), true)]);
        assert!(fx.reconciler.client.priority_calls.is_empty());
    }

    #[test]
    fn classifier_first_match_wins() {
        let now = unix_now();
        let mut fx = fixture(vec![]);

        // Failed category dominates everything, even an errored state.
        let mut torrent = test_torrent("aa", "x", "failed-imports", TorrentState::Error);
        assert_eq!(fx.reconciler.classify(&torrent, now), Disposition::ForceDelete);

        torrent.category = "recheck".to_string();
        assert_eq!(
            fx.reconciler.classify(&torrent, now),
            Disposition::ForceRecheck
        );

        torrent.category = "tv".to_string();
        torrent.state = TorrentState::CheckingResumeData;
        assert_eq!(fx.reconciler.classify(&torrent, now), Disposition::Ignore);

        torrent.state = TorrentState::Error;
        assert_eq!(fx.reconciler.classify(&torrent, now), Disposition::Recheck);
    }

    #[test]
    fn timed_ignore_cache_dominates_mutating_rules() {
        let now = unix_now();
        let mut fx = fixture(vec![]);
        let mut torrent = test_torrent("cafe", "x", "tv", TorrentState::Error);
        assert_eq!(fx.reconciler.classify(&torrent, now), Disposition::Recheck);

        fx.reconciler.timed_ignore_cache.insert("CAFE");
        for state in [
            TorrentState::Error,
            TorrentState::StalledDownload,
            TorrentState::MissingFiles,
            TorrentState::Downloading,
        ] {
            torrent.state = state;
            assert_eq!(fx.reconciler.classify(&torrent, now), Disposition::Ignore);
        }
    }

    #[test]
    fn high_percentage_stall_respects_activity_window() {
        let now = unix_now();
        let mut fx = fixture(vec![]);
        let mut torrent = test_torrent("b00c", "almost", "tv", TorrentState::StalledDownload);
        torrent.progress = 0.97;

        torrent.last_activity = now - 100;
        assert_eq!(fx.reconciler.classify(&torrent, now), Disposition::Ignore);

        torrent.last_activity = now - 86401;
        assert_eq!(
            fx.reconciler.classify(&torrent, now),
            Disposition::DeleteStale
        );
    }

    #[test]
    fn paused_download_resumes_and_enters_ignore_cache() {
        let mut torrent = test_torrent("feed", "paused", "tv", TorrentState::PausedDownload);
        torrent.progress = 0.5;
        let mut fx = fixture(vec![torrent]);

        fx.reconciler.tick().unwrap();

        assert_eq!(fx.reconciler.client.resumed, ["FEED"]);
        assert!(fx.reconciler.timed_ignore_cache.contains("FEED"));
    }

    #[test]
    fn manager_outage_aborts_the_tick() {
        let mut fx = fixture(vec![]);
        let manager = Arc::new(MockManager {
            alive: false,
            ..MockManager::new(ManagerKind::Sonarr)
        });
        fx.reconciler.handle = Arc::new(ManagerHandle {
            name: "sonarr-tv".to_string(),
            category: "tv".to_string(),
            kind: ManagerKind::Sonarr,
            api: manager,
            queue: Mutex::new(crate::QueueSnapshot::default()),
        });
        let err = fx.reconciler.tick().unwrap_err();
        assert!(err.downcast_ref::<NoConnection>().is_some());
    }

    #[test]
    fn folder_cleanup_removes_disallowed_files_and_empty_dirs() {
        let mut fx = fixture_with(
            vec![],
            ManagerConfig {
                file_extension_allowlist: vec![".mkv".to_string()],
                auto_delete: true,
                rss_sync_timer: 0,
                refresh_downloads_timer: 0,
                ..ManagerConfig::default()
            },
        );
        let folder = fx.reconciler.completed_folder.clone();
        std::fs::create_dir_all(folder.join("release")).unwrap();
        std::fs::write(folder.join("release/movie.mkv"), b"x").unwrap();
        std::fs::write(folder.join("release/junk.txt"), b"x").unwrap();
        std::fs::write(folder.join("release/desktop.ini"), b"x").unwrap();
        std::fs::create_dir_all(folder.join("empty")).unwrap();
        fx.reconciler.sent_to_scan.insert(folder.join("empty"));

        fx.reconciler.needs_cleanup = true;
        fx.reconciler.folder_cleanup();

        assert!(folder.join("release/movie.mkv").exists());
        assert!(!folder.join("release/junk.txt").exists());
        assert!(folder.join("release/desktop.ini").exists());
        assert!(!folder.join("empty").exists());
        assert!(!fx.reconciler.sent_to_scan.contains(&folder.join("empty")));
        assert!(!fx.reconciler.needs_cleanup);
    }

    fn movie_handle() -> (Arc<MockManager>, Arc<ManagerHandle>) {
        let manager = Arc::new(MockManager::new(ManagerKind::Radarr));
        let handle = Arc::new(ManagerHandle {
            name: "radarr-movies".to_string(),
            category: "movies".to_string(),
            kind: ManagerKind::Radarr,
            api: manager.clone(),
            queue: Mutex::new(crate::QueueSnapshot::default()),
        });
        (manager, handle)
    }

    #[test]
    fn placeholder_restores_category_after_recheck() {
        let settings = Settings::default();
        let caches = Arc::new(SharedCaches::default());
        // The owning reconciler saw the torrent in its own category earlier.
        caches.record(
            &test_torrent("abab", "manual", "movies", TorrentState::Uploading),
            &settings.recheck_category,
        );

        let torrent = test_torrent("abab", "manual", "recheck", TorrentState::PausedUpload);
        let (_, handle) = movie_handle();
        let mut placeholder = PlaceholderReconciler::new(
            "recheck",
            &settings,
            MockClient::with_torrents(vec![torrent]),
            caches,
            vec![handle],
        );

        placeholder.tick().unwrap();

        assert_eq!(placeholder.client.rechecked, ["ABAB"]);
        assert_eq!(
            placeholder.client.category_calls,
            [(vec!["ABAB".to_string()], "movies".to_string())]
        );
        assert!(placeholder.timed_ignore_cache.contains("ABAB"));
    }

    #[test]
    fn placeholder_delegates_failed_deletes_to_the_owning_manager() {
        let settings = Settings::default();
        let caches = Arc::new(SharedCaches::default());
        let (manager, handle) = movie_handle();
        manager.push_queue_record(QueueRecord {
            id: 21,
            download_id: Some("dddd".to_string()),
            episode: None,
            movie_id: Some(77),
        });
        handle.refresh_queue().unwrap();

        let torrent = test_torrent("dddd", "manual", "failed-imports", TorrentState::Downloading);
        let mut placeholder = PlaceholderReconciler::new(
            "failed-imports",
            &settings,
            MockClient::with_torrents(vec![torrent]),
            caches.clone(),
            vec![handle],
        );

        placeholder.tick().unwrap();

        assert_eq!(
            manager.queue_deletes.lock().unwrap().clone(),
            [(21, true, true)]
        );
        assert!(manager
            .commands
            .lock()
            .unwrap()
            .contains(&ArrCommand::MoviesSearch(vec![77])));
        assert_eq!(placeholder.client.deleted, [("DDDD".to_string(), true)]);
        assert!(caches.name_of("DDDD").is_none());
        assert!(placeholder.delete.is_empty());
    }
}
