use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{info, info_span, warn};

use crate::cache::{Cache, open_scoped};
use crate::observability::MetricsCollector;
use crate::pipeline::{
    Pipe, Pipeline, PipelineConfig, PipelineProgress, PipelineReport, PendingAggregates, Sink,
    SinkSummary, Source,
};
use crate::records::{SutInteraction, SutResponse, TextPrompt};
use crate::targets::SutHandle;

pub const SUT_CACHE_SCOPE: &str = "suts";
const WORKERS_PER_TARGET: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cache_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub pipeline: PipelineConfig,
    pub metrics: MetricsCollector,
}

pub(crate) fn worker_count(requested: Option<usize>, targets: usize) -> usize {
    requested
        .unwrap_or(WORKERS_PER_TARGET * targets)
        .max(1)
}

/// Returns the position of each required column in `headers`, failing with
/// every missing column named.
pub(crate) fn require_columns<const N: usize>(
    headers: &csv::StringRecord,
    required: [&str; N],
    path: &Path,
) -> Result<[usize; N]> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|column| !headers.iter().any(|header| header == *column))
        .collect();
    if !missing.is_empty() {
        bail!(
            "{} is missing required column(s): {}",
            path.display(),
            missing.join(", ")
        );
    }
    let mut indices = [0; N];
    for (slot, column) in indices.iter_mut().zip(required) {
        *slot = headers
            .iter()
            .position(|header| header == column)
            .ok_or_else(|| anyhow!("column {column} vanished"))?;
    }
    Ok(indices)
}

pub(crate) fn field(record: &csv::StringRecord, index: usize) -> String {
    record.get(index).unwrap_or_default().to_string()
}

pub struct CsvPromptInput {
    path: PathBuf,
}

impl CsvPromptInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Source for CsvPromptInput {
    type Item = TextPrompt;

    fn name(&self) -> &str {
        "prompt-input"
    }

    fn items(&mut self) -> Result<Box<dyn Iterator<Item = Result<TextPrompt>> + '_>> {
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open prompt file: {}", self.path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed to read header of {}", self.path.display()))?
            .clone();
        let [uid, text] = require_columns(&headers, ["UID", "Text"], &self.path)?;
        let path = self.path.clone();
        let mut seen = HashSet::new();
        Ok(Box::new(reader.into_records().map(move |row| {
            let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
            let prompt = TextPrompt::new(field(&row, uid), field(&row, text));
            if !seen.insert(prompt.uid.clone()) {
                bail!("Duplicate UID '{}' in {}; row skipped", prompt.uid, path.display());
            }
            Ok(prompt)
        })))
    }
}

#[derive(Debug, Clone)]
pub struct SutAssignment {
    pub prompt: TextPrompt,
    pub sut_uid: String,
}

pub struct PromptSutAssigner {
    sut_uids: Vec<String>,
}

impl PromptSutAssigner {
    pub fn new(sut_uids: Vec<String>) -> Self {
        Self { sut_uids }
    }
}

impl Pipe for PromptSutAssigner {
    type Input = TextPrompt;
    type Output = SutAssignment;

    fn name(&self) -> &str {
        "prompt-sut-assigner"
    }

    fn handle_item(&self, prompt: &TextPrompt, emit: &mut dyn FnMut(SutAssignment)) -> Result<()> {
        for sut_uid in &self.sut_uids {
            emit(SutAssignment {
                prompt: prompt.clone(),
                sut_uid: sut_uid.clone(),
            });
        }
        Ok(())
    }
}

struct CachedSut {
    sut: SutHandle,
    cache: Arc<dyn Cache>,
}

pub struct PromptSutWorkers {
    suts: BTreeMap<String, CachedSut>,
    workers: usize,
    metrics: MetricsCollector,
}

impl PromptSutWorkers {
    pub fn new(suts: &[SutHandle], options: &RunOptions) -> Result<Self> {
        let mut opened = BTreeMap::new();
        for sut in suts {
            let cache = open_scoped(options.cache_dir.as_deref(), SUT_CACHE_SCOPE, sut.uid())
                .with_context(|| format!("Failed to open cache for SUT '{}'", sut.uid()))?;
            if opened
                .insert(
                    sut.uid().to_string(),
                    CachedSut {
                        sut: sut.clone(),
                        cache,
                    },
                )
                .is_some()
            {
                bail!("SUT uid '{}' is configured more than once", sut.uid());
            }
        }
        Ok(Self {
            workers: worker_count(options.workers, opened.len()),
            suts: opened,
            metrics: options.metrics.clone(),
        })
    }

    pub fn sut_uids(&self) -> Vec<String> {
        self.suts.keys().cloned().collect()
    }

    pub fn caches(&self) -> Vec<(String, Arc<dyn Cache>)> {
        self.suts
            .iter()
            .map(|(uid, entry)| (uid.clone(), Arc::clone(&entry.cache)))
            .collect()
    }
}

impl Pipe for PromptSutWorkers {
    type Input = SutAssignment;
    type Output = SutInteraction;

    fn name(&self) -> &str {
        "prompt-sut-workers"
    }

    fn thread_count(&self) -> usize {
        self.workers
    }

    fn handle_item(
        &self,
        item: &SutAssignment,
        emit: &mut dyn FnMut(SutInteraction),
    ) -> Result<()> {
        let entry = self
            .suts
            .get(&item.sut_uid)
            .ok_or_else(|| anyhow!("No SUT registered under uid '{}'", item.sut_uid))?;
        let mut timer = self.metrics.start_call(SUT_CACHE_SCOPE, &item.sut_uid);
        let response = entry
            .sut
            .complete(&item.prompt, entry.cache.as_ref())
            .inspect_err(|_| timer.mark_failed())?;
        emit(SutInteraction {
            prompt: item.prompt.clone(),
            sut_uid: item.sut_uid.clone(),
            response,
        });
        Ok(())
    }
}

/// Destination for prompts whose every SUT has answered.
pub trait PromptOutput: Send + 'static {
    fn open(&mut self, sut_uids: &[String]) -> Result<()>;

    fn write(&mut self, prompt: &TextPrompt, responses: &BTreeMap<String, SutResponse>)
    -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

pub struct CsvPromptOutput {
    path: PathBuf,
    sut_uids: Vec<String>,
    writer: Option<csv::Writer<File>>,
}

impl CsvPromptOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sut_uids: Vec::new(),
            writer: None,
        }
    }
}

impl PromptOutput for CsvPromptOutput {
    fn open(&mut self, sut_uids: &[String]) -> Result<()> {
        let mut writer = csv::Writer::from_path(&self.path)
            .with_context(|| format!("Failed to create output file: {}", self.path.display()))?;
        let mut header = vec!["UID", "Text"];
        header.extend(sut_uids.iter().map(String::as_str));
        writer.write_record(&header)?;
        self.sut_uids = sut_uids.to_vec();
        self.writer = Some(writer);
        Ok(())
    }

    fn write(
        &mut self,
        prompt: &TextPrompt,
        responses: &BTreeMap<String, SutResponse>,
    ) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not open", self.path.display()))?;
        let mut row = vec![prompt.uid.as_str(), prompt.text.as_str()];
        row.extend(self.sut_uids.iter().map(|uid| {
            responses
                .get(uid)
                .map(|response| response.text.as_str())
                .unwrap_or_default()
        }));
        writer
            .write_record(&row)
            .with_context(|| format!("Failed to write row to {}", self.path.display()))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .with_context(|| format!("Failed to flush {}", self.path.display()))?;
        }
        Ok(())
    }
}

pub struct PromptSink<O> {
    sut_uids: Vec<String>,
    pending: PendingAggregates<String, TextPrompt, SutResponse>,
    output: O,
    written: u64,
}

impl<O: PromptOutput> PromptSink<O> {
    pub fn new(sut_uids: Vec<String>, output: O) -> Self {
        Self {
            pending: PendingAggregates::new(sut_uids.len()),
            sut_uids,
            output,
            written: 0,
        }
    }
}

impl<O: PromptOutput> Sink for PromptSink<O> {
    type Item = SutInteraction;

    fn name(&self) -> &str {
        "prompt-sink"
    }

    fn open(&mut self) -> Result<()> {
        self.output.open(&self.sut_uids)
    }

    fn handle_item(&mut self, item: SutInteraction) -> Result<()> {
        let key = item.prompt.uid.clone();
        let merged = self
            .pending
            .merge(key, item.prompt, item.sut_uid, item.response);
        if let Some((prompt, responses)) = merged {
            self.output.write(&prompt, &responses)?;
            self.written += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<SinkSummary> {
        let incomplete = self.pending.drain_incomplete();
        for (uid, (_, responses)) in &incomplete {
            let missing: Vec<&str> = self
                .sut_uids
                .iter()
                .filter(|sut| !responses.contains_key(*sut))
                .map(String::as_str)
                .collect();
            warn!(
                prompt = uid.as_str(),
                missing = missing.join(",").as_str(),
                "Prompt incomplete; not written"
            );
        }
        self.output.close()?;
        Ok(SinkSummary {
            written: self.written,
            incomplete: incomplete.len() as u64,
        })
    }
}

/// Runs every prompt in `input` through every SUT and writes the results to
/// `output` as CSV.
pub fn run_prompts(
    input: &Path,
    output: &Path,
    suts: &[SutHandle],
    options: &RunOptions,
    on_progress: impl FnMut(PipelineProgress),
) -> Result<PipelineReport> {
    run_prompts_into(input, CsvPromptOutput::new(output), suts, options, on_progress)
}

pub fn run_prompts_into<O: PromptOutput>(
    input: &Path,
    output: O,
    suts: &[SutHandle],
    options: &RunOptions,
    on_progress: impl FnMut(PipelineProgress),
) -> Result<PipelineReport> {
    if suts.is_empty() {
        bail!("At least one SUT is required to run prompts");
    }
    let _span = info_span!("prompt_run", input = %input.display()).entered();
    let started = Instant::now();
    let workers = PromptSutWorkers::new(suts, options)?;
    let sut_uids = workers.sut_uids();
    let caches = workers.caches();
    info!(
        suts = sut_uids.len(),
        workers = workers.thread_count(),
        "Running prompts"
    );

    let report = Pipeline::builder(CsvPromptInput::new(input), options.pipeline.clone())
        .pipe(PromptSutAssigner::new(sut_uids.clone()))
        .pipe(workers)
        .sink(PromptSink::new(sut_uids, output))
        .run(on_progress)?;

    record_cache_stats(&options.metrics, SUT_CACHE_SCOPE, &caches);
    options.metrics.record_total_duration(started.elapsed());
    Ok(report)
}

pub(crate) fn record_cache_stats(
    metrics: &MetricsCollector,
    scope: &str,
    caches: &[(String, Arc<dyn Cache>)],
) {
    for (uid, cache) in caches {
        metrics.record_cache_stats(scope, uid, cache.stats());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_columns_are_all_named() {
        let headers = csv::StringRecord::from(vec!["Id", "Prompt"]);
        let err = require_columns(&headers, ["UID", "Text"], Path::new("in.csv")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "in.csv is missing required column(s): UID, Text"
        );
    }

    #[test]
    fn columns_resolve_regardless_of_order() {
        let headers = csv::StringRecord::from(vec!["Text", "extra", "UID"]);
        let [uid, text] = require_columns(&headers, ["UID", "Text"], Path::new("in.csv")).unwrap();
        assert_eq!((uid, text), (2, 0));
    }

    #[test]
    fn default_workers_scale_with_targets() {
        assert_eq!(worker_count(None, 3), 30);
        assert_eq!(worker_count(None, 0), 1);
        assert_eq!(worker_count(Some(4), 3), 4);
    }
}
