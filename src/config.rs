use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::dependency::{
    Decompressor, DependencyResolver, DependencySpec, ExternalData, LocalData, Unpacker, WebData,
};
use crate::lockfile::DependencyLock;
use crate::pipeline::{DEFAULT_QUEUE_CAPACITY, PipelineConfig};
use crate::prompt_pipeline::RunOptions;
use crate::registry::{TargetParameters, TargetRegistry};
use crate::targets::{AnnotatorHandle, SutHandle};

/// Prefix marking a string parameter as a reference to a declared dependency.
/// The value is replaced by the dependency's local path before the target is
/// constructed.
pub const DEPENDENCY_REF_PREFIX: &str = "dependency:";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    pub version: u32,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub dependencies: BTreeMap<String, DependencyConfig>,
    #[serde(default)]
    pub required_versions: BTreeMap<String, String>,
    #[serde(default)]
    pub suts: Vec<TargetConfig>,
    #[serde(default)]
    pub annotators: Vec<TargetConfig>,
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DependencyConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    #[serde(default)]
    pub decompressor: Option<Decompressor>,
    #[serde(default)]
    pub unpacker: Option<Unpacker>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum SourceConfig {
    Web {
        url: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Local {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub uid: String,
    pub kind: String,
    #[serde(default)]
    pub params: Option<TargetParameters>,
}

impl TargetConfig {
    /// Dependency keys referenced from this target's parameters.
    pub fn dependency_refs(&self) -> Vec<&str> {
        self.params
            .iter()
            .flat_map(|params| params.values())
            .filter_map(|value| value.as_str()?.strip_prefix(DEPENDENCY_REF_PREFIX))
            .collect()
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: RunConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(config)
    }

    /// Pins every dependency the lock records, unless the config already
    /// names a required version for it.
    pub fn apply_lock(&mut self, lock: &DependencyLock) {
        for (key, version) in &lock.versions {
            if !self.dependencies.contains_key(key) {
                debug!(dependency = key.as_str(), "Lock entry has no matching dependency");
                continue;
            }
            self.required_versions
                .entry(key.clone())
                .or_insert_with(|| version.clone());
        }
    }

    pub fn build_resolver(&self) -> DependencyResolver {
        let dependencies = self
            .dependencies
            .iter()
            .map(|(key, dependency)| (key.clone(), dependency.to_spec()))
            .collect();
        DependencyResolver::new(
            self.data_dir.clone(),
            dependencies,
            self.required_versions.clone(),
        )
    }

    pub fn build_suts(
        &self,
        registry: &TargetRegistry,
        resolver: &DependencyResolver,
    ) -> Result<Vec<SutHandle>> {
        self.suts
            .iter()
            .map(|target| {
                let params = resolve_params(target, resolver)?;
                registry
                    .create_sut(&target.kind, &target.uid, params)
                    .with_context(|| format!("Failed to create SUT '{}'", target.uid))
            })
            .collect()
    }

    pub fn build_annotators(
        &self,
        registry: &TargetRegistry,
        resolver: &DependencyResolver,
    ) -> Result<Vec<AnnotatorHandle>> {
        self.annotators
            .iter()
            .map(|target| {
                let params = resolve_params(target, resolver)?;
                registry
                    .create_annotator(&target.kind, &target.uid, params)
                    .with_context(|| format!("Failed to create annotator '{}'", target.uid))
            })
            .collect()
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            cache_dir: self.cache_dir.clone(),
            workers: self.workers,
            pipeline: PipelineConfig {
                queue_capacity: self.queue_capacity,
                ..PipelineConfig::default()
            },
            ..RunOptions::default()
        }
    }
}

impl DependencyConfig {
    pub fn to_spec(&self) -> DependencySpec {
        let source: Arc<dyn ExternalData> = match &self.source {
            SourceConfig::Web { url, timeout_secs } => {
                let mut web = WebData::new(url.clone());
                if let Some(secs) = timeout_secs {
                    web.timeout = Duration::from_secs(*secs);
                }
                Arc::new(web)
            }
            SourceConfig::Local { path } => Arc::new(LocalData::new(path.clone())),
        };
        DependencySpec {
            source,
            decompressor: self.decompressor,
            unpacker: self.unpacker,
        }
    }
}

fn resolve_params(target: &TargetConfig, resolver: &DependencyResolver) -> Result<TargetParameters> {
    let mut params = target.params.clone().unwrap_or_default();
    for value in params.values_mut() {
        let Some(key) = value
            .as_str()
            .and_then(|text| text.strip_prefix(DEPENDENCY_REF_PREFIX))
        else {
            continue;
        };
        if key.is_empty() {
            bail!("Target '{}' has an empty dependency reference", target.uid);
        }
        let path = resolver.resolve(key).with_context(|| {
            format!("Failed to resolve dependency '{key}' for target '{}'", target.uid)
        })?;
        *value = Value::String(path.to_string_lossy().into_owned());
    }
    Ok(params)
}
