pub mod external_data;
pub mod transform;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::DependencyError;

pub use external_data::{ExternalData, LocalData, WebData};
pub use transform::{Decompressor, Unpacker};

const METADATA_SUFFIX: &str = "metadata";

#[derive(Debug, Clone)]
pub struct DependencySpec {
    pub source: Arc<dyn ExternalData>,
    pub decompressor: Option<Decompressor>,
    pub unpacker: Option<Unpacker>,
}

impl DependencySpec {
    pub fn new(source: impl ExternalData + 'static) -> Self {
        Self::from_shared(Arc::new(source))
    }

    pub fn from_shared(source: Arc<dyn ExternalData>) -> Self {
        Self {
            source,
            decompressor: None,
            unpacker: None,
        }
    }

    pub fn with_decompressor(mut self, decompressor: Decompressor) -> Self {
        self.decompressor = Some(decompressor);
        self
    }

    pub fn with_unpacker(mut self, unpacker: Unpacker) -> Self {
        self.unpacker = Some(unpacker);
        self
    }
}

/// Contents of the `<version>.metadata` sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub version: String,
    pub creation_time_millis: i64,
}

pub struct DependencyResolver {
    data_dir: PathBuf,
    dependencies: BTreeMap<String, DependencySpec>,
    required_versions: BTreeMap<String, String>,
    versions_used: Mutex<BTreeMap<String, String>>,
    fetch_lock: Mutex<()>,
}

impl DependencyResolver {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        dependencies: BTreeMap<String, DependencySpec>,
        required_versions: BTreeMap<String, String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            dependencies,
            required_versions,
            versions_used: Mutex::new(BTreeMap::new()),
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn dependency_keys(&self) -> impl Iterator<Item = &str> {
        self.dependencies.keys().map(String::as_str)
    }

    /// Returns the local path of `key`, fetching it only when no suitable
    /// version is already on disk.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, DependencyError> {
        let spec = self
            .dependencies
            .get(key)
            .ok_or_else(|| DependencyError::Unknown(key.to_string()))?;

        let version = if let Some(required) = self.required_versions.get(key) {
            if self.version_exists(key, required) {
                debug!(dependency = key, version = required.as_str(), "Using pinned version");
                required.clone()
            } else {
                let obtained = self.fetch(key, spec)?;
                if &obtained != required {
                    return Err(DependencyError::VersionMismatch {
                        key: key.to_string(),
                        required: required.clone(),
                        obtained,
                    });
                }
                obtained
            }
        } else if let Some(latest) = self.latest_local_version(key)? {
            debug!(dependency = key, version = latest.version.as_str(), "Using newest local version");
            latest.version
        } else {
            self.fetch(key, spec)?
        };

        self.versions_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), version.clone());
        Ok(self.materialized_path(key, &version, spec))
    }

    /// Fetches the current content of every declared dependency. Returns the
    /// version each one hashed to. Does not affect `versions_used`.
    pub fn update_all(&self) -> Result<BTreeMap<String, String>, DependencyError> {
        let mut versions = BTreeMap::new();
        for (key, spec) in &self.dependencies {
            let version = self.fetch(key, spec)?;
            info!(dependency = key.as_str(), version = version.as_str(), "Dependency refreshed");
            versions.insert(key.clone(), version);
        }
        Ok(versions)
    }

    /// Every dependency resolved so far and the version it resolved to.
    pub fn versions_used(&self) -> BTreeMap<String, String> {
        self.versions_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Materialized versions of `key`, oldest first.
    pub fn local_versions(&self, key: &str) -> Result<Vec<VersionMetadata>, DependencyError> {
        let key_dir = self.data_dir.join(key);
        if !key_dir.is_dir() {
            return Ok(Vec::new());
        }
        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(&key_dir.to_string_lossy()),
            METADATA_SUFFIX
        );
        let entries = glob::glob(&pattern).map_err(|err| DependencyError::Metadata {
            path: key_dir.clone(),
            reason: err.to_string(),
        })?;

        let mut versions = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| DependencyError::Io(err.into()))?;
            let metadata = read_metadata(&path)?;
            if key_dir.join(&metadata.version).is_dir() {
                versions.push(metadata);
            } else {
                warn!(path = %path.display(), "Ignoring metadata without a version directory");
            }
        }
        versions.sort_by_key(|meta| meta.creation_time_millis);
        Ok(versions)
    }

    fn latest_local_version(&self, key: &str) -> Result<Option<VersionMetadata>, DependencyError> {
        Ok(self.local_versions(key)?.pop())
    }

    fn version_exists(&self, key: &str, version: &str) -> bool {
        let key_dir = self.data_dir.join(key);
        key_dir.join(version).is_dir() && metadata_path(&key_dir, version).is_file()
    }

    fn materialized_path(&self, key: &str, version: &str, spec: &DependencySpec) -> PathBuf {
        let version_dir = self.data_dir.join(key).join(version);
        if spec.unpacker.is_some() {
            version_dir
        } else {
            version_dir.join(key)
        }
    }

    fn fetch(&self, key: &str, spec: &DependencySpec) -> Result<String, DependencyError> {
        let _guard = self.fetch_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let fetch_error = |reason: anyhow::Error| DependencyError::Fetch {
            key: key.to_string(),
            source_desc: spec.source.describe(),
            reason: format!("{reason:#}"),
        };

        let key_dir = self.data_dir.join(key);
        fs::create_dir_all(&key_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".fetch-")
            .tempdir_in(&key_dir)?;

        info!(dependency = key, source = %spec.source.describe(), "Fetching dependency");
        let raw = staging.path().join("raw");
        spec.source.download(&raw).map_err(fetch_error)?;

        let data = match spec.decompressor {
            Some(decompressor) => {
                let decompressed = staging.path().join("decompressed");
                decompressor
                    .decompress(&raw, &decompressed)
                    .map_err(fetch_error)?;
                decompressed
            }
            None => raw,
        };

        let version = sha256_file(&data)?;
        if self.version_exists(key, &version) {
            debug!(dependency = key, version = version.as_str(), "Version already materialized");
            return Ok(version);
        }

        let content = staging.path().join("content");
        fs::create_dir(&content)?;
        match spec.unpacker {
            Some(unpacker) => unpacker.unpack(&data, &content).map_err(fetch_error)?,
            None => fs::rename(&data, content.join(key))?,
        }

        let version_dir = key_dir.join(&version);
        if version_dir.exists() {
            // Left behind by an interrupted fetch: no sidecar was written.
            fs::remove_dir_all(&version_dir)?;
        }
        fs::rename(&content, &version_dir)?;
        write_metadata(
            &key_dir,
            &VersionMetadata {
                version: version.clone(),
                creation_time_millis: Utc::now().timestamp_millis(),
            },
        )?;
        info!(dependency = key, version = version.as_str(), "Dependency materialized");
        Ok(version)
    }
}

fn metadata_path(key_dir: &Path, version: &str) -> PathBuf {
    key_dir.join(format!("{version}.{METADATA_SUFFIX}"))
}

fn read_metadata(path: &Path) -> Result<VersionMetadata, DependencyError> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|err| DependencyError::Metadata {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn write_metadata(key_dir: &Path, metadata: &VersionMetadata) -> Result<(), DependencyError> {
    let target = metadata_path(key_dir, &metadata.version);
    let mut temp = tempfile::NamedTempFile::new_in(key_dir)?;
    serde_json::to_writer(&mut temp, metadata).map_err(|err| DependencyError::Metadata {
        path: target.clone(),
        reason: err.to_string(),
    })?;
    temp.flush()?;
    temp.persist(&target).map_err(|err| DependencyError::Io(err.error))?;
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String, DependencyError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
