use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::*;

/// qBittorrent wire states, see the WebUI API torrent list documentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TorrentState {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "missingFiles")]
    MissingFiles,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "pausedUP")]
    PausedUpload,
    #[serde(rename = "queuedUP")]
    QueuedUpload,
    #[serde(rename = "stalledUP")]
    StalledUpload,
    #[serde(rename = "checkingUP")]
    CheckingUpload,
    #[serde(rename = "forcedUP")]
    ForcedUpload,
    #[serde(rename = "allocating")]
    Allocating,
    #[serde(rename = "downloading")]
    Downloading,
    #[serde(rename = "metaDL")]
    MetadataDownload,
    #[serde(rename = "pausedDL")]
    PausedDownload,
    #[serde(rename = "queuedDL")]
    QueuedDownload,
    #[serde(rename = "stalledDL")]
    StalledDownload,
    #[serde(rename = "checkingDL")]
    CheckingDownload,
    #[serde(rename = "forcedDL")]
    ForcedDownload,
    #[serde(rename = "checkingResumeData")]
    CheckingResumeData,
    #[serde(rename = "moving")]
    Moving,
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl TorrentState {
    /// States the reconciler never touches.
    #[must_use]
    pub fn is_ignored(self) -> bool {
        matches!(
            self,
            Self::ForcedDownload
                | Self::ForcedUpload
                | Self::CheckingUpload
                | Self::CheckingDownload
                | Self::CheckingResumeData
                | Self::Allocating
                | Self::Moving
        )
    }

    #[must_use]
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            Self::Uploading | Self::StalledUpload | Self::PausedUpload | Self::QueuedUpload
        )
    }

    #[must_use]
    pub fn is_uploading(self) -> bool {
        matches!(
            self,
            Self::Uploading | Self::StalledUpload | Self::QueuedUpload
        )
    }

    #[must_use]
    pub fn is_downloading(self) -> bool {
        matches!(self, Self::Downloading | Self::PausedDownload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentFile {
    pub id: i64,
    pub name: String,
    pub priority: i64,
}

/// One torrent as seen at the start of a tick. Hashes are upper-cased by the
/// facade; everything else is carried verbatim from the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Torrent {
    pub hash: String,
    pub name: String,
    pub category: String,
    pub state: TorrentState,
    pub progress: f64,
    pub availability: f64,
    pub added_on: i64,
    pub completion_on: i64,
    pub last_activity: i64,
    pub eta: i64,
    pub seeding_time: i64,
    pub amount_left: i64,
    pub content_path: String,
    #[serde(default)]
    pub files: Vec<TorrentFile>,
}

pub trait TorrentCli {
    fn is_alive(&mut self) -> bool;

    /// Snapshot of the category, sorted by added-on ascending.
    fn torrents_info(&mut self, category: &str) -> Result<Vec<Torrent>>;

    fn torrents_pause(&mut self, hashes: &HashSet<String>) -> Result<()>;

    fn torrents_resume(&mut self, hashes: &HashSet<String>) -> Result<()>;

    fn torrents_recheck(&mut self, hashes: &[String]) -> Result<()>;

    fn torrents_delete(&mut self, hashes: &HashSet<String>, delete_files: bool) -> Result<()>;

    fn torrents_file_priority(&mut self, hash: &str, file_ids: &[i64], priority: i64)
        -> Result<()>;

    fn torrents_set_category(&mut self, hashes: &[String], category: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct InfoEntry {
    hash: String,
    name: String,
    #[serde(default)]
    category: String,
    state: TorrentState,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    availability: f64,
    #[serde(default)]
    added_on: i64,
    #[serde(default)]
    completion_on: i64,
    #[serde(default)]
    last_activity: i64,
    #[serde(default)]
    eta: i64,
    #[serde(default)]
    seeding_time: i64,
    #[serde(default)]
    amount_left: i64,
    #[serde(default)]
    content_path: String,
}

#[derive(Debug, Deserialize)]
struct FileEntry {
    #[serde(default)]
    index: i64,
    name: String,
    priority: i64,
}

/// WebUI v2 client. Authenticates with a cookie session and retries a call
/// once after a 403 by logging in again.
pub struct QbitHttp {
    base: Url,
    credentials: Option<(String, String)>,
    http: reqwest::blocking::Client,
}

impl QbitHttp {
    pub fn new(base: Url, credentials: Option<(String, String)>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .build()
            .context("http client")?;
        let mut client = Self {
            base,
            credentials,
            http,
        };
        // The daemon may start before the client is up; the 403 retry in
        // post_form re-authenticates later.
        if let Err(err) = client.login() {
            tracing::warn!("initial login failed: {err:#}");
        }
        Ok(client)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).context("endpoint url")
    }

    fn login(&mut self) -> Result<()> {
        let Some((ref user, ref pass)) = self.credentials else {
            return Ok(());
        };
        let res = self
            .http
            .post(self.endpoint("api/v2/auth/login")?)
            .form(&[("username", user.as_str()), ("password", pass.as_str())])
            .send()
            .context("login request")?;
        if !res.status().is_success() {
            bail!("login rejected with {}", res.status());
        }
        Ok(())
    }

    fn post_form(&mut self, path: &str, form: &[(&str, &str)]) -> Result<()> {
        let url = self.endpoint(path)?;
        let res = self.http.post(url.clone()).form(form).send()?;
        if res.status() == reqwest::StatusCode::FORBIDDEN {
            self.login()?;
            let res = self.http.post(url).form(form).send()?;
            if !res.status().is_success() {
                bail!("{} failed with {}", path, res.status());
            }
            return Ok(());
        }
        if !res.status().is_success() {
            bail!("{} failed with {}", path, res.status());
        }
        Ok(())
    }

    fn joined(hashes: impl IntoIterator<Item = impl AsRef<str>>) -> String {
        let mut out = String::new();
        for h in hashes {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(h.as_ref());
        }
        out
    }

    fn files_for(&mut self, hash: &str) -> Result<Vec<TorrentFile>> {
        let mut url = self.endpoint("api/v2/torrents/files")?;
        url.query_pairs_mut().append_pair("hash", hash);
        let entries: Vec<FileEntry> = self.http.get(url).send()?.error_for_status()?.json()?;
        Ok(entries
            .into_iter()
            .map(|f| TorrentFile {
                id: f.index,
                name: f.name,
                priority: f.priority,
            })
            .collect())
    }
}

impl TorrentCli for QbitHttp {
    fn is_alive(&mut self) -> bool {
        let Ok(url) = self.endpoint("api/v2/app/version") else {
            return false;
        };
        self.http
            .get(url)
            .timeout(Duration::from_secs(2))
            .send()
            .map(|res| res.status().is_success())
            .unwrap_or(false)
    }

    fn torrents_info(&mut self, category: &str) -> Result<Vec<Torrent>> {
        let mut url = self.endpoint("api/v2/torrents/info")?;
        url.query_pairs_mut()
            .append_pair("category", category)
            .append_pair("sort", "added_on");
        let entries: Vec<InfoEntry> = self.http.get(url).send()?.error_for_status()?.json()?;
        let mut torrents = Vec::with_capacity(entries.len());
        for entry in entries {
            let files = self.files_for(&entry.hash).unwrap_or_default();
            torrents.push(Torrent {
                hash: entry.hash.to_uppercase(),
                name: entry.name,
                category: entry.category,
                state: entry.state,
                progress: entry.progress,
                availability: entry.availability,
                added_on: entry.added_on,
                completion_on: entry.completion_on,
                last_activity: entry.last_activity,
                eta: entry.eta,
                seeding_time: entry.seeding_time,
                amount_left: entry.amount_left,
                content_path: entry.content_path,
                files,
            });
        }
        Ok(torrents)
    }

    fn torrents_pause(&mut self, hashes: &HashSet<String>) -> Result<()> {
        let joined = Self::joined(hashes);
        self.post_form("api/v2/torrents/pause", &[("hashes", &joined)])
    }

    fn torrents_resume(&mut self, hashes: &HashSet<String>) -> Result<()> {
        let joined = Self::joined(hashes);
        self.post_form("api/v2/torrents/resume", &[("hashes", &joined)])
    }

    fn torrents_recheck(&mut self, hashes: &[String]) -> Result<()> {
        let joined = Self::joined(hashes);
        self.post_form("api/v2/torrents/recheck", &[("hashes", &joined)])
    }

    fn torrents_delete(&mut self, hashes: &HashSet<String>, delete_files: bool) -> Result<()> {
        let joined = Self::joined(hashes);
        let delete = if delete_files { "true" } else { "false" };
        self.post_form(
            "api/v2/torrents/delete",
            &[("hashes", &joined), ("deleteFiles", delete)],
        )
    }

    fn torrents_file_priority(
        &mut self,
        hash: &str,
        file_ids: &[i64],
        priority: i64,
    ) -> Result<()> {
        let ids = Self::joined(file_ids.iter().map(ToString::to_string));
        let prio = priority.to_string();
        self.post_form(
            "api/v2/torrents/filePrio",
            &[("hash", hash), ("id", &ids), ("priority", &prio)],
        )
    }

    fn torrents_set_category(&mut self, hashes: &[String], category: &str) -> Result<()> {
        let joined = Self::joined(hashes);
        self.post_form(
            "api/v2/torrents/setCategory",
            &[("hashes", &joined), ("category", category)],
        )
    }
}

/// Records every mutating call for test assertions and serves canned
/// snapshots.
#[derive(Debug, Default)]
pub struct MockClient {
    pub torrents: Vec<Torrent>,
    pub alive: bool,
    pub fail_rpc: bool,
    pub paused: Vec<String>,
    pub resumed: Vec<String>,
    pub rechecked: Vec<String>,
    pub deleted: Vec<(String, bool)>,
    pub priority_calls: Vec<(String, Vec<i64>, i64)>,
    pub category_calls: Vec<(Vec<String>, String)>,
}

impl MockClient {
    #[must_use]
    pub fn with_torrents(torrents: Vec<Torrent>) -> Self {
        Self {
            torrents,
            alive: true,
            ..Self::default()
        }
    }
}

impl TorrentCli for MockClient {
    fn is_alive(&mut self) -> bool {
        self.alive
    }

    fn torrents_info(&mut self, category: &str) -> Result<Vec<Torrent>> {
        if self.fail_rpc {
            bail!("rpc request failed");
        }
        let mut torrents: Vec<Torrent> = self
            .torrents
            .iter()
            .filter(|t| t.category == category)
            .cloned()
            .collect();
        torrents.sort_by_key(|t| t.added_on);
        Ok(torrents)
    }

    fn torrents_pause(&mut self, hashes: &HashSet<String>) -> Result<()> {
        let mut sorted: Vec<String> = hashes.iter().cloned().collect();
        sorted.sort();
        self.paused.extend(sorted);
        Ok(())
    }

    fn torrents_resume(&mut self, hashes: &HashSet<String>) -> Result<()> {
        let mut sorted: Vec<String> = hashes.iter().cloned().collect();
        sorted.sort();
        self.resumed.extend(sorted);
        Ok(())
    }

    fn torrents_recheck(&mut self, hashes: &[String]) -> Result<()> {
        self.rechecked.extend_from_slice(hashes);
        Ok(())
    }

    fn torrents_delete(&mut self, hashes: &HashSet<String>, delete_files: bool) -> Result<()> {
        if self.fail_rpc {
            bail!("rpc request failed");
        }
        let mut sorted: Vec<String> = hashes.iter().cloned().collect();
        sorted.sort();
        self.deleted
            .extend(sorted.into_iter().map(|h| (h, delete_files)));
        Ok(())
    }

    fn torrents_file_priority(
        &mut self,
        hash: &str,
        file_ids: &[i64],
        priority: i64,
    ) -> Result<()> {
        self.priority_calls
            .push((hash.to_string(), file_ids.to_vec(), priority));
        Ok(())
    }

    fn torrents_set_category(&mut self, hashes: &[String], category: &str) -> Result<()> {
        self.category_calls
            .push((hashes.to_vec(), category.to_string()));
        Ok(())
    }
}

/// A plausible snapshot for tests.
#[must_use]
pub fn test_torrent(hash: &str, name: &str, category: &str, state: TorrentState) -> Torrent {
    Torrent {
        hash: hash.to_uppercase(),
        name: name.to_string(),
        category: category.to_string(),
        state,
        progress: 0.0,
        availability: 1.0,
        added_on: 1604022244,
        completion_on: 0,
        last_activity: 1604022244,
        eta: 3600,
        seeding_time: 0,
        amount_left: 1024,
        content_path: String::new(),
        files: Vec::new(),
    }
}
