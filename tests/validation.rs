use std::fs;
use std::path::Path;

use evalrig::builtin::default_registry;
use evalrig::cache::NoCache;
use evalrig::config::RunConfig;
use evalrig::lockfile::{DependencyLock, generate_lock};
use evalrig::records::{SutInteraction, SutResponse, TextPrompt};
use evalrig::validation::validate_config;
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::tempdir;

fn parse(yaml: &str) -> RunConfig {
    serde_yaml::from_str(yaml).unwrap()
}

const WORDS: &str = "# blocked terms\nbomb\n\nPoison\n";

/// Config with one local `words` dependency read by a keyword annotator.
fn local_config(root: &Path) -> RunConfig {
    let words = root.join("words.txt");
    if !words.exists() {
        fs::write(&words, WORDS).unwrap();
    }
    parse(&format!(
        r#"
version: 1
data_dir: {data}
cache_dir: {cache}
dependencies:
  words:
    source: local
    path: {words}
suts:
  - uid: fake1
    kind: echo
annotators:
  - uid: kw
    kind: keyword
    params:
      keywords_file: "dependency:words"
"#,
        data = root.join("data").display(),
        cache = root.join("cache").display(),
        words = words.display(),
    ))
}

fn interaction(text: &str) -> SutInteraction {
    SutInteraction {
        prompt: TextPrompt::new("1", "q"),
        sut_uid: "fake1".into(),
        response: SutResponse::new(text),
    }
}

#[test]
fn valid_config_passes_with_dependency_warning() {
    let temp = tempdir().unwrap();
    let config = local_config(temp.path());
    let report = validate_config(&config, &default_registry());

    assert!(report.is_ok(), "unexpected errors: {:?}", report.errors);
    assert!(
        report
            .warnings
            .iter()
            .any(|warning| warning.contains("not instantiated")),
        "{:?}",
        report.warnings
    );
}

#[test]
fn validation_collects_every_problem() {
    let config = parse(
        r#"
version: 2
data_dir: data
queue_capacity: 0
workers: 0
dependencies:
  nested/key:
    source: web
    url: ftp://example.com/list.txt
required_versions:
  ghost: not-a-digest
suts:
  - uid: dup
    kind: echo
  - uid: dup
    kind: echo
  - uid: broken
    kind: template
    params:
      template: "no placeholder"
annotators:
  - uid: wc
    kind: sentiment
  - uid: kw
    kind: keyword
    params:
      keywords_file: "dependency:missing"
"#,
    );
    let report = validate_config(&config, &default_registry());
    let errors = report.errors.join("\n");

    for expected in [
        "Unsupported config version: 2",
        "queue_capacity must be at least 1",
        "workers must be at least 1",
        "must be a plain directory name",
        "must start with http:// or https://",
        "unknown dependency 'ghost'",
        "not a SHA-256 hex digest",
        "uid is used more than once",
        "SUT 3 ('broken')",
        "Unknown annotator kind 'sentiment'",
        "references unknown dependency 'missing'",
    ] {
        assert!(errors.contains(expected), "missing '{expected}' in:\n{errors}");
    }
    assert!(
        report
            .warnings
            .iter()
            .any(|warning| warning.contains("No cache_dir"))
    );
}

#[test]
fn config_without_targets_is_rejected() {
    let config = parse("version: 1\ndata_dir: data\n");
    let report = validate_config(&config, &default_registry());
    assert!(
        report
            .errors
            .iter()
            .any(|error| error.contains("At least one SUT or annotator"))
    );
}

#[test]
fn dependency_reference_becomes_a_local_path() {
    let temp = tempdir().unwrap();
    let config = local_config(temp.path());
    let resolver = config.build_resolver();
    let annotators = config
        .build_annotators(&default_registry(), &resolver)
        .unwrap();

    let flagged = annotators[0]
        .annotate(&interaction("Add POISON slowly"), &NoCache)
        .unwrap();
    assert_eq!(flagged, json!({"is_safe": false, "matched": ["poison"]}));
    let clean = annotators[0]
        .annotate(&interaction("a quiet afternoon"), &NoCache)
        .unwrap();
    assert_eq!(clean, json!({"is_safe": true, "matched": []}));

    let expected = format!(
        "{:x}",
        Sha256::digest(WORDS.as_bytes())
    );
    assert_eq!(resolver.versions_used()["words"], expected);
}

#[test]
fn lockfile_pins_the_versions_of_a_later_run() {
    let temp = tempdir().unwrap();
    let config = local_config(temp.path());
    let lock_path = temp.path().join("evalrig.lock");

    let lock = generate_lock(&config.build_resolver(), &lock_path).unwrap();
    let loaded = DependencyLock::load(&lock_path).unwrap();
    assert_eq!(loaded.versions, lock.versions);
    assert_eq!(loaded.versions.len(), 1);

    fs::write(temp.path().join("words.txt"), "changed\n").unwrap();
    let mut pinned = local_config(temp.path());
    pinned.apply_lock(&loaded);
    let resolver = pinned.build_resolver();
    let path = resolver.resolve("words").unwrap();

    assert_eq!(fs::read_to_string(path).unwrap(), WORDS);
    assert_eq!(resolver.versions_used(), loaded.versions);
}
