use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use toml::Value;
use url::Url;

use crate::errors::*;
use crate::manager::ManagerKind;

pub fn option_explicit_none<'de, T, D>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(ref value) if value.to_lowercase() == "none" => None,
        value => Some(T::deserialize(value).map_err(serde::de::Error::custom)?),
    })
}

pub fn option_explicit_serialize<T, S>(
    val: &Option<T>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize,
{
    match val {
        None => str::serialize("none", serializer),
        Some(ref val) => T::serialize(val, serializer),
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    #[serde(rename = "CompletedDownloadFolder")]
    pub completed_download_folder: PathBuf,
    #[serde(rename = "AppDataFolder")]
    #[serde(serialize_with = "option_explicit_serialize")]
    #[serde(deserialize_with = "option_explicit_none")]
    pub app_data_folder: Option<PathBuf>,
    #[serde(rename = "FailedCategory")]
    pub failed_category: String,
    #[serde(rename = "RecheckCategory")]
    pub recheck_category: String,
    /// Seconds between reconciler ticks.
    #[serde(rename = "LoopSleepTimer")]
    pub loop_sleep_timer: u64,
    /// Seconds to back off when a service is unreachable.
    #[serde(rename = "NoInternetSleepTimer")]
    pub no_internet_sleep_timer: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            completed_download_folder: PathBuf::from("/completed_downloads"),
            app_data_folder: None,
            failed_category: "failed-imports".to_string(),
            recheck_category: "recheck".to_string(),
            loop_sleep_timer: 5,
            no_internet_sleep_timer: 15,
        }
    }
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct QbitConfig {
    #[serde(rename = "Host")]
    pub host: Url,
    #[serde(rename = "UserName")]
    #[serde(serialize_with = "option_explicit_serialize")]
    #[serde(deserialize_with = "option_explicit_none")]
    pub username: Option<String>,
    #[serde(rename = "Password")]
    #[serde(serialize_with = "option_explicit_serialize")]
    #[serde(deserialize_with = "option_explicit_none")]
    pub password: Option<String>,
}

impl Default for QbitConfig {
    fn default() -> Self {
        Self {
            host: Url::parse("http://localhost:8080").unwrap(),
            username: None,
            password: None,
        }
    }
}

impl QbitConfig {
    #[must_use]
    pub fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct ManagerConfig {
    #[serde(rename = "Managed")]
    pub managed: bool,
    #[serde(rename = "URI")]
    pub uri: Url,
    #[serde(rename = "APIKey")]
    pub api_key: String,
    /// Download-client category; the section name when absent.
    #[serde(rename = "Category")]
    #[serde(serialize_with = "option_explicit_serialize")]
    #[serde(deserialize_with = "option_explicit_none")]
    pub category: Option<String>,
    #[serde(rename = "DatabaseFile")]
    pub database_file: PathBuf,
    #[serde(rename = "Research")]
    pub research: bool,
    #[serde(rename = "importMode")]
    pub import_mode: String,
    /// Minutes; 0 disables.
    #[serde(rename = "RefreshDownloadsTimer")]
    pub refresh_downloads_timer: u64,
    /// Minutes; 0 disables.
    #[serde(rename = "RssSyncTimer")]
    pub rss_sync_timer: u64,
    #[serde(rename = "CaseSensitiveMatches")]
    pub case_sensitive_matches: bool,
    #[serde(rename = "FolderExclusionRegex")]
    pub folder_exclusion_regex: Vec<String>,
    #[serde(rename = "FileNameExclusionRegex")]
    pub file_name_exclusion_regex: Vec<String>,
    #[serde(rename = "FileExtensionAllowlist")]
    pub file_extension_allowlist: Vec<String>,
    #[serde(rename = "AutoDelete")]
    pub auto_delete: bool,
    #[serde(rename = "IgnoreTorrentsYoungerThan")]
    pub ignore_torrents_younger_than: i64,
    #[serde(rename = "MaximumETA")]
    pub maximum_eta: i64,
    #[serde(rename = "MaximumDeletablePercentage")]
    pub maximum_deletable_percentage: f64,
    #[serde(rename = "SearchMissing")]
    pub search_missing: bool,
    #[serde(rename = "AlsoSearchSpecials")]
    pub also_search_specials: bool,
    #[serde(rename = "SearchByYear")]
    pub search_by_year: bool,
    #[serde(rename = "SearchInReverse")]
    pub search_in_reverse: bool,
    #[serde(rename = "StartYear")]
    pub start_year: Option<i32>,
    #[serde(rename = "LastYear")]
    pub last_year: Option<i32>,
    #[serde(rename = "SearchLimit")]
    pub search_limit: i64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            managed: true,
            uri: Url::parse("http://localhost:8989").unwrap(),
            api_key: String::new(),
            category: None,
            database_file: PathBuf::new(),
            research: true,
            import_mode: "Move".to_string(),
            refresh_downloads_timer: 1,
            rss_sync_timer: 15,
            case_sensitive_matches: false,
            folder_exclusion_regex: Vec::new(),
            file_name_exclusion_regex: Vec::new(),
            file_extension_allowlist: Vec::new(),
            auto_delete: false,
            ignore_torrents_younger_than: 600,
            maximum_eta: 86400,
            maximum_deletable_percentage: 0.95,
            search_missing: false,
            also_search_specials: false,
            search_by_year: true,
            search_in_reverse: false,
            start_year: None,
            last_year: None,
            search_limit: 5,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn category_or<'a>(&'a self, section: &'a str) -> &'a str {
        self.category.as_deref().unwrap_or(section)
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSection {
    pub name: String,
    pub kind: ManagerKind,
    pub config: ManagerConfig,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "Settings")]
    pub settings: Settings,
    #[serde(rename = "qBit")]
    pub qbit: QbitConfig,
    /// Every other section; manager sections are picked out by name.
    #[serde(flatten)]
    pub sections: BTreeMap<String, Value>,
}

impl Config {
    pub fn load_path(path: impl AsRef<Path>) -> Result<Self> {
        confy::load_path(path).context("Config")
    }

    pub fn config_path() -> Result<PathBuf> {
        confy::get_configuration_file_path(env!("CARGO_PKG_NAME"), Some("config"))
            .context("config path")
    }

    /// Sections whose name starts with sonarr/radarr, case-insensitive.
    pub fn manager_sections(&self) -> Result<Vec<ManagerSection>> {
        let pattern = Regex::new("(?i)^(son|rad)arr").expect("static regex");
        let mut out = Vec::new();
        for (name, value) in &self.sections {
            let Some(caps) = pattern.captures(name) else {
                continue;
            };
            let kind = if caps[1].eq_ignore_ascii_case("son") {
                ManagerKind::Sonarr
            } else {
                ManagerKind::Radarr
            };
            let config: ManagerConfig = value
                .clone()
                .try_into()
                .with_context(|| format!("section {name}"))?;
            out.push(ManagerSection {
                name: name.clone(),
                kind,
                config,
            });
        }
        Ok(out)
    }

    /// Where the per-group search databases live.
    pub fn app_data_folder(&self) -> Result<PathBuf> {
        if let Some(ref folder) = self.settings.app_data_folder {
            std::fs::create_dir_all(folder)
                .with_context(|| format!("create app data folder {}", folder.display()))?;
            return Ok(folder.clone());
        }
        let xdg_dirs = xdg::BaseDirectories::with_prefix(env!("CARGO_PKG_NAME"))?;
        Ok(xdg_dirs.create_data_directory("")?)
    }
}
