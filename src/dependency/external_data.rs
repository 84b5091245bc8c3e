use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Somewhere the raw bytes of a dependency can be obtained from.
pub trait ExternalData: fmt::Debug + Send + Sync {
    /// Writes the raw source bytes to `destination`, replacing any file there.
    fn download(&self, destination: &Path) -> Result<()>;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct WebData {
    pub url: String,
    pub timeout: Duration,
}

impl WebData {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }
}

impl ExternalData for WebData {
    fn download(&self, destination: &Path) -> Result<()> {
        debug!(url = self.url.as_str(), "Downloading dependency");
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let mut response = client
            .get(&self.url)
            .send()
            .with_context(|| format!("Request to {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("Request to {} returned an error status", self.url))?;
        let mut file = File::create(destination)
            .with_context(|| format!("Failed to create {}", destination.display()))?;
        response
            .copy_to(&mut file)
            .with_context(|| format!("Failed to stream {} to disk", self.url))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[derive(Debug, Clone)]
pub struct LocalData {
    pub path: PathBuf,
}

impl LocalData {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ExternalData for LocalData {
    fn download(&self, destination: &Path) -> Result<()> {
        fs::copy(&self.path, destination).with_context(|| {
            format!(
                "Failed to copy {} to {}",
                self.path.display(),
                destination.display()
            )
        })?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
