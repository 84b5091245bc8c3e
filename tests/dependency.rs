use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use evalrig::dependency::{
    Decompressor, DependencyResolver, DependencySpec, ExternalData, LocalData, Unpacker,
    sha256_file,
};
use evalrig::error::DependencyError;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tempfile::tempdir;

/// In-memory source that counts how often it is downloaded.
#[derive(Debug, Default)]
struct CountingData {
    content: Mutex<Vec<u8>>,
    downloads: AtomicUsize,
}

impl CountingData {
    fn new(content: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            content: Mutex::new(content.to_vec()),
            downloads: AtomicUsize::new(0),
        })
    }

    fn set(&self, content: &[u8]) {
        *self.content.lock().unwrap() = content.to_vec();
    }

    fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

impl ExternalData for CountingData {
    fn download(&self, destination: &Path) -> anyhow::Result<()> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        fs::write(destination, &*self.content.lock().unwrap())?;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

fn resolver_for(
    data_dir: &Path,
    key: &str,
    spec: DependencySpec,
    required: &[(&str, &str)],
) -> DependencyResolver {
    DependencyResolver::new(
        data_dir,
        BTreeMap::from([(key.to_string(), spec)]),
        required
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[test]
fn repeated_resolve_fetches_once() {
    let temp = tempdir().unwrap();
    let source = CountingData::new(b"data-1");
    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(source.clone()),
        &[],
    );

    let first = resolver.resolve("d1").unwrap();
    let second = resolver.resolve("d1").unwrap();

    assert_eq!(first, second);
    assert_eq!(source.downloads(), 1);
    assert_eq!(fs::read(&first).unwrap(), b"data-1");
    assert_eq!(first.file_name().unwrap(), "d1");

    let version = sha256_hex(b"data-1");
    assert_eq!(first, temp.path().join("d1").join(&version).join("d1"));
    assert!(temp.path().join("d1").join(format!("{version}.metadata")).is_file());
    assert_eq!(
        resolver.versions_used(),
        BTreeMap::from([("d1".to_string(), version)])
    );
}

#[test]
fn same_content_from_different_sources_gets_same_version() {
    let temp_a = tempdir().unwrap();
    let temp_b = tempdir().unwrap();
    let a = resolver_for(
        temp_a.path(),
        "d1",
        DependencySpec::from_shared(CountingData::new(b"shared")),
        &[],
    );
    let file = temp_b.path().join("source.txt");
    fs::write(&file, b"shared").unwrap();
    let b = resolver_for(
        &temp_b.path().join("data"),
        "d1",
        DependencySpec::new(LocalData::new(&file)),
        &[],
    );

    a.resolve("d1").unwrap();
    b.resolve("d1").unwrap();
    assert_eq!(a.versions_used(), b.versions_used());
}

#[test]
fn pinned_version_on_disk_is_used_without_fetching() {
    let temp = tempdir().unwrap();
    let warmup = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(CountingData::new(b"v1")),
        &[],
    );
    let original = warmup.resolve("d1").unwrap();
    let version = sha256_hex(b"v1");

    let source = CountingData::new(b"v2");
    let pinned = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(source.clone()),
        &[("d1", version.as_str())],
    );
    assert_eq!(pinned.resolve("d1").unwrap(), original);
    assert_eq!(source.downloads(), 0);
}

#[test]
fn pinned_version_missing_on_disk_is_fetched_once() {
    let temp = tempdir().unwrap();
    let version = sha256_hex(b"v1");
    let source = CountingData::new(b"v1");
    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(source.clone()),
        &[("d1", version.as_str())],
    );

    resolver.resolve("d1").unwrap();
    resolver.resolve("d1").unwrap();
    assert_eq!(source.downloads(), 1);
}

#[test]
fn pinned_version_mismatch_is_an_error() {
    let temp = tempdir().unwrap();
    let required = sha256_hex(b"expected");
    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(CountingData::new(b"actual")),
        &[("d1", required.as_str())],
    );

    match resolver.resolve("d1").unwrap_err() {
        DependencyError::VersionMismatch {
            key,
            required: wanted,
            obtained,
        } => {
            assert_eq!(key, "d1");
            assert_eq!(wanted, required);
            assert_eq!(obtained, sha256_hex(b"actual"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(resolver.versions_used().is_empty());
}

#[test]
fn unknown_dependency_is_an_error() {
    let temp = tempdir().unwrap();
    let resolver = DependencyResolver::new(temp.path(), BTreeMap::new(), BTreeMap::new());
    assert!(matches!(
        resolver.resolve("missing"),
        Err(DependencyError::Unknown(key)) if key == "missing"
    ));
}

#[test]
fn newest_local_version_wins_without_a_pin() {
    let temp = tempdir().unwrap();
    let source = CountingData::new(b"old");
    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(source.clone()),
        &[],
    );
    resolver.update_all().unwrap();
    thread::sleep(Duration::from_millis(5));
    source.set(b"new");
    let refreshed = resolver.update_all().unwrap();

    assert_eq!(refreshed["d1"], sha256_hex(b"new"));
    assert!(resolver.versions_used().is_empty());
    let path = resolver.resolve("d1").unwrap();
    assert_eq!(fs::read(path).unwrap(), b"new");
    assert_eq!(source.downloads(), 2);
    assert_eq!(resolver.local_versions("d1").unwrap().len(), 2);
}

#[test]
fn refetching_identical_content_is_a_no_op() {
    let temp = tempdir().unwrap();
    let source = CountingData::new(b"stable");
    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(source.clone()),
        &[],
    );
    resolver.update_all().unwrap();
    let metadata = temp
        .path()
        .join("d1")
        .join(format!("{}.metadata", sha256_hex(b"stable")));
    let before = fs::read_to_string(&metadata).unwrap();

    resolver.update_all().unwrap();
    assert_eq!(fs::read_to_string(&metadata).unwrap(), before);
    assert_eq!(resolver.local_versions("d1").unwrap().len(), 1);
}

#[test]
fn version_directory_without_sidecar_is_ignored() {
    let temp = tempdir().unwrap();
    let stray = temp.path().join("d1").join(sha256_hex(b"stale"));
    fs::create_dir_all(&stray).unwrap();
    fs::write(stray.join("d1"), b"stale").unwrap();

    let source = CountingData::new(b"fresh");
    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(source.clone()),
        &[],
    );
    let path = resolver.resolve("d1").unwrap();
    assert_eq!(fs::read(path).unwrap(), b"fresh");
    assert_eq!(source.downloads(), 1);
}

#[test]
fn gzip_content_is_hashed_after_decompression() {
    let temp = tempdir().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(b"compressed payload").unwrap();
    let gz = encoder.finish().unwrap();

    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(CountingData::new(&gz)).with_decompressor(Decompressor::Gzip),
        &[],
    );
    let path = resolver.resolve("d1").unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"compressed payload");
    assert_eq!(sha256_file(&path).unwrap(), sha256_hex(b"compressed payload"));
    assert_eq!(resolver.versions_used()["d1"], sha256_hex(b"compressed payload"));
}

#[test]
fn zstd_content_is_decompressed() {
    let temp = tempdir().unwrap();
    let compressed = zstd::encode_all(&b"zstd payload"[..], 0).unwrap();
    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::from_shared(CountingData::new(&compressed))
            .with_decompressor(Decompressor::Zstd),
        &[],
    );
    let path = resolver.resolve("d1").unwrap();
    assert_eq!(fs::read(path).unwrap(), b"zstd payload");
}

#[test]
fn tar_archives_are_unpacked_into_the_version_directory() {
    let temp = tempdir().unwrap();
    let mut builder = tar::Builder::new(Vec::new());
    let body = b"hello from the archive";
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "nested/file.txt", &body[..])
        .unwrap();
    let archive = builder.into_inner().unwrap();

    let resolver = resolver_for(
        temp.path(),
        "bundle",
        DependencySpec::from_shared(CountingData::new(&archive)).with_unpacker(Unpacker::Tar),
        &[],
    );
    let dir = resolver.resolve("bundle").unwrap();

    assert!(dir.is_dir());
    assert_eq!(dir, temp.path().join("bundle").join(sha256_hex(&archive)));
    assert_eq!(
        fs::read(dir.join("nested").join("file.txt")).unwrap(),
        body
    );
}

#[test]
fn failed_download_reports_the_source() {
    let temp = tempdir().unwrap();
    let resolver = resolver_for(
        temp.path(),
        "d1",
        DependencySpec::new(LocalData::new(temp.path().join("absent.bin"))),
        &[],
    );
    match resolver.resolve("d1").unwrap_err() {
        DependencyError::Fetch { key, source_desc, .. } => {
            assert_eq!(key, "d1");
            assert!(source_desc.ends_with("absent.bin"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
