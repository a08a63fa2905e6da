use std::path::Path;
use std::process::Command;

use regex::{Regex, RegexBuilder};

use crate::errors::*;

/// Content policy for the files inside a torrent and for completed-folder
/// cleanup: an extension allowlist plus two exclusion regex lists, compiled
/// once per reconciler.
#[derive(Debug)]
pub struct ContentFilter {
    folder_exclusion: Option<Regex>,
    file_name_exclusion: Option<Regex>,
    extension_allowlist: Vec<String>,
}

impl ContentFilter {
    pub fn new(
        folder_exclusion: &[String],
        file_name_exclusion: &[String],
        extension_allowlist: &[String],
        case_sensitive: bool,
    ) -> Result<Self> {
        Ok(Self {
            folder_exclusion: Self::compile(folder_exclusion, case_sensitive)?,
            file_name_exclusion: Self::compile(file_name_exclusion, case_sensitive)?,
            extension_allowlist: extension_allowlist.to_vec(),
        })
    }

    // An empty list never matches. Joining nothing would produce a regex
    // matching every name.
    fn compile(parts: &[String], case_sensitive: bool) -> Result<Option<Regex>> {
        if parts.is_empty() {
            return Ok(None);
        }
        let mut builder = RegexBuilder::new(&parts.join("|"));
        builder.dot_matches_new_line(true);
        if !case_sensitive {
            builder.case_insensitive(true);
        }
        Ok(Some(builder.build().context("regex build failed")?))
    }

    /// The allowlist entries carry their leading dot (".mkv").
    #[must_use]
    pub fn extension_allowed(&self, path: &Path) -> bool {
        match path.extension() {
            None => false,
            Some(ext) => {
                let suffix = format!(".{}", ext.to_string_lossy());
                self.extension_allowlist.iter().any(|e| *e == suffix)
            }
        }
    }

    /// Whether any ancestor directory name matches the folder exclusions.
    #[must_use]
    pub fn folder_excluded(&self, path: &Path) -> bool {
        let Some(ref re) = self.folder_exclusion else {
            return false;
        };
        path.ancestors().skip(1).any(|dir| {
            dir.file_name()
                .is_some_and(|name| re.is_match(&name.to_string_lossy()))
        })
    }

    #[must_use]
    pub fn file_name_excluded(&self, name: &str) -> bool {
        self.file_name_exclusion
            .as_ref()
            .is_some_and(|re| re.is_match(name))
    }
}

/// Gate on a media probe tool. When ffprobe is not on PATH every file counts
/// as probeable.
#[derive(Debug, Clone, Copy)]
pub struct MediaProbe {
    available: bool,
}

impl MediaProbe {
    #[must_use]
    pub fn detect() -> Self {
        Self {
            available: find_in_path("ffprobe"),
        }
    }

    #[must_use]
    pub fn with_availability(available: bool) -> Self {
        Self { available }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// A directory, empty probe output or a probe error all count as not
    /// probeable.
    #[must_use]
    pub fn file_is_probeable(&self, file: &Path) -> bool {
        if !self.available {
            return true;
        }
        if file.is_dir() {
            return false;
        }
        let output = Command::new("ffprobe")
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-show_format", "-show_streams", "-print_format", "json"])
            .arg(file)
            .output();
        match output {
            Ok(out) => out.status.success() && !out.stdout.is_empty(),
            Err(_) => false,
        }
    }
}

fn find_in_path(tool: &str) -> bool {
    use faccess::PathExt as _;
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(tool);
        candidate.is_file() && candidate.executable()
    })
}
