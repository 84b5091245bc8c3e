use std::collections::HashSet;

use anyhow::Result;
use serde::Serialize;

use crate::config::{RunConfig, SourceConfig, TargetConfig};
use crate::registry::TargetRegistry;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetKind {
    Sut,
    Annotator,
}

impl TargetKind {
    fn label(self) -> &'static str {
        match self {
            TargetKind::Sut => "SUT",
            TargetKind::Annotator => "Annotator",
        }
    }
}

/// Checks a config without fetching dependencies or calling any target.
pub fn validate_config(config: &RunConfig, registry: &TargetRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.version != 1 {
        report
            .errors
            .push(format!("Unsupported config version: {}", config.version));
    }

    if config.data_dir.as_os_str().is_empty() {
        report.errors.push("data_dir cannot be empty".into());
    }

    if config.queue_capacity == 0 {
        report
            .errors
            .push("queue_capacity must be at least 1".into());
    }

    if config.workers == Some(0) {
        report.errors.push("workers must be at least 1".into());
    }

    if config.suts.is_empty() && config.annotators.is_empty() {
        report
            .errors
            .push("At least one SUT or annotator is required".into());
    }

    if config.cache_dir.is_none() {
        report
            .warnings
            .push("No cache_dir configured; responses will not be cached".into());
    }

    report.merge(validate_dependencies(config));
    report.merge(validate_targets(config, &config.suts, TargetKind::Sut, registry));
    report.merge(validate_targets(
        config,
        &config.annotators,
        TargetKind::Annotator,
        registry,
    ));

    report
}

fn validate_dependencies(config: &RunConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    for (key, dependency) in &config.dependencies {
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            report.errors.push(format!(
                "Dependency key '{key}' must be a plain directory name"
            ));
        }
        match &dependency.source {
            SourceConfig::Web { url, .. } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    report.errors.push(format!(
                        "Dependency '{key}' url must start with http:// or https://"
                    ));
                }
            }
            SourceConfig::Local { path } => {
                if !path.is_file() {
                    report.warnings.push(format!(
                        "Dependency '{key}' source file {} does not exist yet",
                        path.display()
                    ));
                }
            }
        }
    }

    for (key, version) in &config.required_versions {
        if !config.dependencies.contains_key(key) {
            report.errors.push(format!(
                "required_versions names unknown dependency '{key}'"
            ));
        }
        if version.len() != 64 || !version.chars().all(|c| c.is_ascii_hexdigit()) {
            report.errors.push(format!(
                "Required version for '{key}' is not a SHA-256 hex digest: {version}"
            ));
        }
    }

    report
}

fn validate_targets(
    config: &RunConfig,
    targets: &[TargetConfig],
    kind: TargetKind,
    registry: &TargetRegistry,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();

    for (idx, target) in targets.iter().enumerate() {
        let label = format!("{} {} ('{}')", kind.label(), idx + 1, target.uid);
        if target.uid.trim().is_empty() {
            report.errors.push(format!("{label}: uid cannot be empty"));
        }
        if !seen.insert(target.uid.as_str()) {
            report
                .errors
                .push(format!("{label}: uid is used more than once"));
        }

        let refs = target.dependency_refs();
        for key in &refs {
            if !config.dependencies.contains_key(*key) {
                report
                    .errors
                    .push(format!("{label}: references unknown dependency '{key}'"));
            }
        }
        if !refs.is_empty() {
            report.warnings.push(format!(
                "{label}: not instantiated because it needs dependencies to be fetched"
            ));
            continue;
        }

        if let Err(err) = instantiate(target, kind, registry) {
            report.errors.push(format!("{label}: {err:#}"));
        }
    }

    report
}

fn instantiate(target: &TargetConfig, kind: TargetKind, registry: &TargetRegistry) -> Result<()> {
    let params = target.params.clone().unwrap_or_default();
    match kind {
        TargetKind::Sut => registry
            .create_sut(&target.kind, &target.uid, params)
            .map(drop),
        TargetKind::Annotator => registry
            .create_annotator(&target.kind, &target.uid, params)
            .map(drop),
    }
}
