use crate::{
    error::{RepoFileParse, RepoFileRead, RepoFileSerialize, Result},
    file::write_atomically,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::{fs, io, path::Path};

/// A chart repository, as recorded in the repository registry file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Send the credentials along with chart downloads from other domains as well.
    #[serde(default, rename = "pass_credentials_all")]
    pub pass_credentials_all: bool,
}

impl RepoEntry {
    pub fn new<N: ToString, U: ToString>(name: N, url: U) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    /// This is a builder option to add basic-auth credentials.
    #[must_use]
    pub fn with_credentials<U: ToString, P: ToString>(mut self, username: U, password: P) -> Self {
        self.username = username.to_string();
        self.password = password.to_string();
        self
    }

    /// This is a builder option to pass the credentials to all chart download hosts.
    #[must_use]
    pub fn with_pass_credentials_all(mut self, pass_credentials_all: bool) -> Self {
        self.pass_credentials_all = pass_credentials_all;
        self
    }
}

/// The repository registry file, in the layout of Helm's repositories.yaml.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepoFile {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub generated: DateTime<Utc>,
    #[serde(default)]
    pub repositories: Vec<RepoEntry>,
}

impl Default for RepoFile {
    fn default() -> Self {
        Self {
            api_version: "v1".to_string(),
            generated: Utc::now(),
            repositories: Vec::new(),
        }
    }
}

impl RepoFile {
    /// Read the registry at 'path'. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let buf = match fs::read(path) {
            Ok(buf) => buf,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(error) => return Err(error).context(RepoFileRead { path }),
        };
        serde_yaml::from_slice(buf.as_slice()).context(RepoFileParse { path })
    }

    /// The entry named 'name', if there is one.
    pub fn get(&self, name: &str) -> Option<&RepoEntry> {
        self.repositories.iter().find(|entry| entry.name == name)
    }

    /// Add 'entry', replacing any entry of the same name. Returns true if one was replaced.
    pub fn update(&mut self, entry: RepoEntry) -> bool {
        match self.repositories.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => {
                *existing = entry;
                true
            }
            None => {
                self.repositories.push(entry);
                false
            }
        }
    }

    /// Replace the registry at 'path' with this one.
    pub fn write(&self, path: &Path) -> Result<()> {
        let buf = serde_yaml::to_string(self).context(RepoFileSerialize { path })?;
        write_atomically(path, buf.as_bytes())
    }
}
