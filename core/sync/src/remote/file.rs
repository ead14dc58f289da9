//! Remote backed by JSON files in a local directory.
//!
//! The directory holds `steps.json` (an array of [`StepRecord`]) and
//! `news.json` (an array of [`NewsRecord`]). Posted registration tokens are
//! appended to `registrations.txt`.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use waypoint_common::{Error, Result};

use super::{NewsRecord, RemoteSource, StepRecord};

const STEPS_FILE: &str = "steps.json";
const NEWS_FILE: &str = "news.json";
const REGISTRATIONS_FILE: &str = "registrations.txt";

/// Remote reading fixtures from a directory.
pub struct FileRemote {
    root: PathBuf,
}

impl FileRemote {
    /// Create a remote rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let path = self.root.join(name);
        debug!("Reading {}", path.display());

        // An unreadable fixture plays the part of an unreachable endpoint.
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Network(format!("Failed to read {}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl RemoteSource for FileRemote {
    fn name(&self) -> &str {
        "file"
    }

    async fn fetch_steps(&self) -> Result<Vec<StepRecord>> {
        self.read_json(STEPS_FILE).await
    }

    async fn fetch_news(&self) -> Result<Vec<NewsRecord>> {
        self.read_json(NEWS_FILE).await
    }

    async fn post_registration_token(&self, token: &str) -> Result<()> {
        let path = self.root.join(REGISTRATIONS_FILE);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Network(format!("Failed to open {}: {}", path.display(), e)))?;

        file.write_all(format!("{}\n", token).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
