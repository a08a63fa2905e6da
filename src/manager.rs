use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::errors::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerKind {
    Sonarr,
    Radarr,
}

/// A named command posted to `/api/v3/command`.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrCommand {
    RssSync,
    RefreshMonitoredDownloads,
    EpisodeSearch(Vec<i64>),
    MoviesSearch(Vec<i64>),
    DownloadedEpisodesScan {
        path: String,
        download_client_id: String,
        import_mode: String,
    },
}

impl ArrCommand {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RssSync => "RssSync",
            Self::RefreshMonitoredDownloads => "RefreshMonitoredDownloads",
            Self::EpisodeSearch(_) => "EpisodeSearch",
            Self::MoviesSearch(_) => "MoviesSearch",
            Self::DownloadedEpisodesScan { .. } => "DownloadedEpisodesScan",
        }
    }

    #[must_use]
    pub fn body(&self) -> serde_json::Value {
        match self {
            Self::RssSync | Self::RefreshMonitoredDownloads => json!({ "name": self.name() }),
            Self::EpisodeSearch(ids) => json!({ "name": self.name(), "episodeIds": ids }),
            Self::MoviesSearch(ids) => json!({ "name": self.name(), "movieIds": ids }),
            Self::DownloadedEpisodesScan {
                path,
                download_client_id,
                import_mode,
            } => json!({
                "name": self.name(),
                "path": path,
                "downloadClientId": download_client_id,
                "importMode": import_mode,
            }),
        }
    }
}

/// One row of the manager's download queue. Sonarr fills `episode`, Radarr
/// fills `movie_id`; both variants share the shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueRecord {
    pub id: i64,
    #[serde(rename = "downloadId", default)]
    pub download_id: Option<String>,
    #[serde(default)]
    pub episode: Option<EpisodeRef>,
    #[serde(rename = "movieId", default)]
    pub movie_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodeRef {
    pub id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesRef {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: i64,
    #[serde(rename = "tvdbId", default)]
    pub tvdb_id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpisodeDetail {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(rename = "seasonNumber", default)]
    pub season_number: i64,
    #[serde(rename = "episodeNumber", default)]
    pub episode_number: i64,
    #[serde(rename = "absoluteEpisodeNumber", default)]
    pub absolute_episode_number: i64,
    #[serde(default)]
    pub series: SeriesRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MovieDetail {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: i64,
    #[serde(rename = "tmdbId", default)]
    pub tmdb_id: i64,
}

pub trait ManagerApi: Send + Sync {
    fn kind(&self) -> ManagerKind;

    /// `GET /api/v3/system/status` with a short timeout.
    fn is_alive(&self) -> bool;

    fn queue(&self) -> Result<Vec<QueueRecord>>;

    fn post_command(&self, command: &ArrCommand) -> Result<()>;

    /// `DELETE /api/v3/queue/{id}`.
    fn delete_queue_entry(&self, id: i64, remove_from_client: bool, blocklist: bool) -> Result<()>;

    fn episode_detail(&self, id: i64) -> Result<EpisodeDetail>;

    fn movie_detail(&self, id: i64) -> Result<MovieDetail>;
}

#[derive(Debug, Deserialize)]
struct PagedQueue {
    #[serde(default)]
    records: Vec<QueueRecord>,
}

pub struct ManagerHttp {
    kind: ManagerKind,
    base: Url,
    http: reqwest::blocking::Client,
    // Separate client so the liveness probe fails fast.
    probe: reqwest::blocking::Client,
}

impl ManagerHttp {
    pub fn new(kind: ManagerKind, base: Url, api_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(api_key).context("api key header")?;
        value.set_sensitive(true);
        headers.insert("X-Api-Key", value);
        let http = reqwest::blocking::Client::builder()
            .default_headers(headers.clone())
            .build()
            .context("http client")?;
        let probe = reqwest::blocking::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(500))
            .build()
            .context("probe client")?;
        Ok(Self {
            kind,
            base,
            http,
            probe,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).context("endpoint url")
    }
}

impl ManagerApi for ManagerHttp {
    fn kind(&self) -> ManagerKind {
        self.kind
    }

    fn is_alive(&self) -> bool {
        let Ok(url) = self.endpoint("api/v3/system/status") else {
            return false;
        };
        match self.probe.get(url).send() {
            Ok(res) => res.status().is_success(),
            Err(err) => {
                tracing::warn!("could not connect to {}: {err:#}", self.base);
                false
            }
        }
    }

    fn queue(&self) -> Result<Vec<QueueRecord>> {
        match self.kind {
            ManagerKind::Sonarr => {
                let url = self.endpoint("api/v3/queue")?;
                Ok(self.http.get(url).send()?.error_for_status()?.json()?)
            }
            ManagerKind::Radarr => {
                let mut url = self.endpoint("api/v3/queue")?;
                url.query_pairs_mut().append_pair("pageSize", "10000");
                let page: PagedQueue = self.http.get(url).send()?.error_for_status()?.json()?;
                Ok(page.records)
            }
        }
    }

    fn post_command(&self, command: &ArrCommand) -> Result<()> {
        let url = self.endpoint("api/v3/command")?;
        self.http
            .post(url)
            .json(&command.body())
            .send()?
            .error_for_status()
            .with_context(|| format!("command {}", command.name()))?;
        Ok(())
    }

    fn delete_queue_entry(&self, id: i64, remove_from_client: bool, blocklist: bool) -> Result<()> {
        let mut url = self.endpoint(&format!("api/v3/queue/{id}"))?;
        url.query_pairs_mut()
            .append_pair("removeFromClient", bool_str(remove_from_client))
            .append_pair("blocklist", bool_str(blocklist));
        self.http.delete(url).send()?.error_for_status()?;
        Ok(())
    }

    fn episode_detail(&self, id: i64) -> Result<EpisodeDetail> {
        let url = self.endpoint(&format!("api/v3/episode/{id}"))?;
        Ok(self.http.get(url).send()?.error_for_status()?.json()?)
    }

    fn movie_detail(&self, id: i64) -> Result<MovieDetail> {
        let url = self.endpoint(&format!("api/v3/movie/{id}"))?;
        Ok(self.http.get(url).send()?.error_for_status()?.json()?)
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Shared with workers behind `Arc<dyn ManagerApi>`, so the recording fields
/// sit behind mutexes.
#[derive(Debug)]
pub struct MockManager {
    pub kind: ManagerKind,
    pub alive: bool,
    pub queue: Mutex<Vec<QueueRecord>>,
    pub commands: Mutex<Vec<ArrCommand>>,
    pub queue_deletes: Mutex<Vec<(i64, bool, bool)>>,
}

impl MockManager {
    #[must_use]
    pub fn new(kind: ManagerKind) -> Self {
        Self {
            kind,
            alive: true,
            queue: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            queue_deletes: Mutex::new(Vec::new()),
        }
    }

    pub fn push_queue_record(&self, record: QueueRecord) {
        self.queue.lock().unwrap().push(record);
    }
}

impl ManagerApi for MockManager {
    fn kind(&self) -> ManagerKind {
        self.kind
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn queue(&self) -> Result<Vec<QueueRecord>> {
        Ok(self.queue.lock().unwrap().clone())
    }

    fn post_command(&self, command: &ArrCommand) -> Result<()> {
        self.commands.lock().unwrap().push(command.clone());
        Ok(())
    }

    fn delete_queue_entry(&self, id: i64, remove_from_client: bool, blocklist: bool) -> Result<()> {
        self.queue_deletes
            .lock()
            .unwrap()
            .push((id, remove_from_client, blocklist));
        Ok(())
    }

    fn episode_detail(&self, id: i64) -> Result<EpisodeDetail> {
        Ok(EpisodeDetail {
            title: Some(format!("Episode {id}")),
            season_number: 1,
            episode_number: 1,
            absolute_episode_number: 1,
            series: SeriesRef {
                title: Some("Series".to_string()),
                year: 2020,
                tvdb_id: 1,
            },
        })
    }

    fn movie_detail(&self, id: i64) -> Result<MovieDetail> {
        Ok(MovieDetail {
            title: Some(format!("Movie {id}")),
            year: 2020,
            tmdb_id: id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_bodies() {
        let cmd = ArrCommand::EpisodeSearch(vec![4, 5]);
        assert_eq!(
            cmd.body(),
            json!({"name": "EpisodeSearch", "episodeIds": [4, 5]})
        );
        let cmd = ArrCommand::DownloadedEpisodesScan {
            path: "/c/tv/x.mkv".to_string(),
            download_client_id: "ABCD".to_string(),
            import_mode: "Move".to_string(),
        };
        assert_eq!(
            cmd.body(),
            json!({
                "name": "DownloadedEpisodesScan",
                "path": "/c/tv/x.mkv",
                "downloadClientId": "ABCD",
                "importMode": "Move",
            })
        );
        assert_eq!(ArrCommand::RssSync.body(), json!({"name": "RssSync"}));
    }

    #[test]
    fn queue_record_shapes() {
        // Sonarr rows nest the episode, Radarr rows carry movieId.
        let sonarr: QueueRecord = serde_json::from_str(
            r#"{"id": 7, "downloadId": "abcd", "episode": {"id": 42}}"#,
        )
        .unwrap();
        assert_eq!(sonarr.episode.unwrap().id, 42);
        assert_eq!(sonarr.download_id.as_deref(), Some("abcd"));

        let radarr: QueueRecord =
            serde_json::from_str(r#"{"id": 9, "downloadId": "ffff", "movieId": 3}"#).unwrap();
        assert_eq!(radarr.movie_id, Some(3));
        assert!(radarr.episode.is_none());

        let paged: PagedQueue =
            serde_json::from_str(r#"{"page": 1, "records": [{"id": 1}]}"#).unwrap();
        assert_eq!(paged.records.len(), 1);
    }
}
