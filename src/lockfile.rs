use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dependency::DependencyResolver;

/// The exact dependency versions a run used, so later runs can pin them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyLock {
    pub generated_at: DateTime<Utc>,
    pub versions: BTreeMap<String, String>,
}

impl DependencyLock {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read lockfile: {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse lockfile: {}", path.display()))
    }

    pub fn from_versions(versions: BTreeMap<String, String>) -> Self {
        Self {
            generated_at: Utc::now(),
            versions,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
        serde_yaml::to_writer(file, self)
            .with_context(|| format!("Failed to write lockfile: {}", path.display()))
    }
}

pub fn generate_lock(resolver: &DependencyResolver, path: &Path) -> Result<DependencyLock> {
    let keys: Vec<String> = resolver.dependency_keys().map(str::to_string).collect();
    for key in &keys {
        resolver
            .resolve(key)
            .with_context(|| format!("Failed to resolve dependency '{key}'"))?;
    }
    let lock = DependencyLock::from_versions(resolver.versions_used());
    lock.write(path)?;
    Ok(lock)
}
