use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, info_span, warn};

use crate::cache::{Cache, open_scoped};
use crate::observability::MetricsCollector;
use crate::pipeline::{
    Pipe, Pipeline, PipelineProgress, PipelineReport, PendingAggregates, Sink, SinkSummary, Source,
};
use crate::prompt_pipeline::{
    CsvPromptInput, PromptSutAssigner, PromptSutWorkers, RunOptions, SUT_CACHE_SCOPE, field,
    record_cache_stats, require_columns, worker_count,
};
use crate::records::{SutInteraction, SutResponse, TextPrompt};
use crate::targets::{AnnotatorHandle, SutHandle};

pub const ANNOTATOR_CACHE_SCOPE: &str = "annotators";

pub struct CsvAnnotationInput {
    path: PathBuf,
}

impl CsvAnnotationInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Source for CsvAnnotationInput {
    type Item = SutInteraction;

    fn name(&self) -> &str {
        "annotation-input"
    }

    fn items(&mut self) -> Result<Box<dyn Iterator<Item = Result<SutInteraction>> + '_>> {
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open annotation input: {}", self.path.display()))?;
        let headers = reader
            .headers()
            .with_context(|| format!("Failed to read header of {}", self.path.display()))?
            .clone();
        let [uid, prompt, sut, response] =
            require_columns(&headers, ["UID", "Prompt", "SUT", "Response"], &self.path)?;
        let path = self.path.clone();
        let mut seen = HashSet::new();
        Ok(Box::new(reader.into_records().map(move |row| {
            let row = row.with_context(|| format!("Malformed row in {}", path.display()))?;
            let interaction = SutInteraction {
                prompt: TextPrompt::new(field(&row, uid), field(&row, prompt)),
                sut_uid: field(&row, sut),
                response: SutResponse::new(field(&row, response)),
            };
            if !seen.insert(interaction.key()) {
                bail!(
                    "Duplicate UID '{}' for SUT '{}' in {}; row skipped",
                    interaction.prompt.uid,
                    interaction.sut_uid,
                    path.display()
                );
            }
            Ok(interaction)
        })))
    }
}

#[derive(Debug, Clone)]
pub struct AnnotatorAssignment {
    pub interaction: SutInteraction,
    pub annotator_uid: String,
}

#[derive(Debug, Clone)]
pub struct AnnotatedInteraction {
    pub interaction: SutInteraction,
    pub annotator_uid: String,
    pub annotation: Value,
}

pub struct AnnotatorAssigner {
    annotator_uids: Vec<String>,
}

impl AnnotatorAssigner {
    pub fn new(annotator_uids: Vec<String>) -> Self {
        Self { annotator_uids }
    }
}

impl Pipe for AnnotatorAssigner {
    type Input = SutInteraction;
    type Output = AnnotatorAssignment;

    fn name(&self) -> &str {
        "annotator-assigner"
    }

    fn handle_item(
        &self,
        interaction: &SutInteraction,
        emit: &mut dyn FnMut(AnnotatorAssignment),
    ) -> Result<()> {
        for annotator_uid in &self.annotator_uids {
            emit(AnnotatorAssignment {
                interaction: interaction.clone(),
                annotator_uid: annotator_uid.clone(),
            });
        }
        Ok(())
    }
}

struct CachedAnnotator {
    annotator: AnnotatorHandle,
    cache: Arc<dyn Cache>,
}

pub struct AnnotatorWorkers {
    annotators: BTreeMap<String, CachedAnnotator>,
    workers: usize,
    metrics: MetricsCollector,
}

impl AnnotatorWorkers {
    pub fn new(annotators: &[AnnotatorHandle], options: &RunOptions) -> Result<Self> {
        let mut opened = BTreeMap::new();
        for annotator in annotators {
            let uid = annotator.uid();
            let cache = open_scoped(options.cache_dir.as_deref(), ANNOTATOR_CACHE_SCOPE, uid)
                .with_context(|| format!("Failed to open cache for annotator '{uid}'"))?;
            let previous = opened.insert(
                uid.to_string(),
                CachedAnnotator {
                    annotator: annotator.clone(),
                    cache,
                },
            );
            if previous.is_some() {
                bail!("Annotator uid '{uid}' is configured more than once");
            }
        }
        Ok(Self {
            workers: worker_count(options.workers, opened.len()),
            annotators: opened,
            metrics: options.metrics.clone(),
        })
    }

    pub fn annotator_uids(&self) -> Vec<String> {
        self.annotators.keys().cloned().collect()
    }

    pub fn caches(&self) -> Vec<(String, Arc<dyn Cache>)> {
        self.annotators
            .iter()
            .map(|(uid, entry)| (uid.clone(), Arc::clone(&entry.cache)))
            .collect()
    }
}

impl Pipe for AnnotatorWorkers {
    type Input = AnnotatorAssignment;
    type Output = AnnotatedInteraction;

    fn name(&self) -> &str {
        "annotator-workers"
    }

    fn thread_count(&self) -> usize {
        self.workers
    }

    fn handle_item(
        &self,
        item: &AnnotatorAssignment,
        emit: &mut dyn FnMut(AnnotatedInteraction),
    ) -> Result<()> {
        let entry = self
            .annotators
            .get(&item.annotator_uid)
            .ok_or_else(|| anyhow!("No annotator registered under uid '{}'", item.annotator_uid))?;
        let mut timer = self
            .metrics
            .start_call(ANNOTATOR_CACHE_SCOPE, &item.annotator_uid);
        let annotation = entry
            .annotator
            .annotate(&item.interaction, entry.cache.as_ref())
            .inspect_err(|_| timer.mark_failed())?;
        emit(AnnotatedInteraction {
            interaction: item.interaction.clone(),
            annotator_uid: item.annotator_uid.clone(),
            annotation,
        });
        Ok(())
    }
}

pub trait AnnotationOutput: Send + 'static {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn write(
        &mut self,
        interaction: &SutInteraction,
        annotations: &BTreeMap<String, Value>,
    ) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

#[derive(Serialize)]
struct AnnotationLine<'a> {
    #[serde(rename = "UID")]
    uid: &'a str,
    #[serde(rename = "Prompt")]
    prompt: &'a str,
    #[serde(rename = "SUT")]
    sut: &'a str,
    #[serde(rename = "Response")]
    response: &'a str,
    #[serde(rename = "Annotations")]
    annotations: &'a BTreeMap<String, Value>,
}

pub struct JsonlAnnotatorOutput {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlAnnotatorOutput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
        }
    }
}

impl AnnotationOutput for JsonlAnnotatorOutput {
    fn open(&mut self) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("Failed to create output file: {}", self.path.display()))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write(
        &mut self,
        interaction: &SutInteraction,
        annotations: &BTreeMap<String, Value>,
    ) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("{} is not open", self.path.display()))?;
        let line = AnnotationLine {
            uid: &interaction.prompt.uid,
            prompt: &interaction.prompt.text,
            sut: &interaction.sut_uid,
            response: &interaction.response.text,
            annotations,
        };
        serde_json::to_writer(&mut *writer, &line)
            .with_context(|| format!("Failed to write to {}", self.path.display()))?;
        writer.write_all(b"\n")?;
        Ok(())
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

pub struct AnnotatorSink<O> {
    annotator_uids: Vec<String>,
    pending: PendingAggregates<(String, String), SutInteraction, Value>,
    output: O,
    written: u64,
}

impl<O: AnnotationOutput> AnnotatorSink<O> {
    pub fn new(annotator_uids: Vec<String>, output: O) -> Self {
        Self {
            pending: PendingAggregates::new(annotator_uids.len()),
            annotator_uids,
            output,
            written: 0,
        }
    }
}

impl<O: AnnotationOutput> Sink for AnnotatorSink<O> {
    type Item = AnnotatedInteraction;

    fn name(&self) -> &str {
        "annotator-sink"
    }

    fn open(&mut self) -> Result<()> {
        self.output.open()
    }

    fn handle_item(&mut self, item: AnnotatedInteraction) -> Result<()> {
        let key = item.interaction.key();
        let merged = self
            .pending
            .merge(key, item.interaction, item.annotator_uid, item.annotation);
        if let Some((interaction, annotations)) = merged {
            self.output.write(&interaction, &annotations)?;
            self.written += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<SinkSummary> {
        let incomplete = self.pending.drain_incomplete();
        for ((prompt_uid, sut_uid), (_, annotations)) in &incomplete {
            let missing: Vec<&str> = self
                .annotator_uids
                .iter()
                .filter(|uid| !annotations.contains_key(*uid))
                .map(String::as_str)
                .collect();
            warn!(
                prompt = prompt_uid.as_str(),
                sut = sut_uid.as_str(),
                missing = missing.join(",").as_str(),
                "Interaction incomplete; not written"
            );
        }
        self.output.close()?;
        Ok(SinkSummary {
            written: self.written,
            incomplete: incomplete.len() as u64,
        })
    }
}

pub fn run_annotations(
    input: &Path,
    output: &Path,
    annotators: &[AnnotatorHandle],
    options: &RunOptions,
    on_progress: impl FnMut(PipelineProgress),
) -> Result<PipelineReport> {
    run_annotations_into(
        input,
        JsonlAnnotatorOutput::new(output),
        annotators,
        options,
        on_progress,
    )
}

pub fn run_annotations_into<O: AnnotationOutput>(
    input: &Path,
    output: O,
    annotators: &[AnnotatorHandle],
    options: &RunOptions,
    on_progress: impl FnMut(PipelineProgress),
) -> Result<PipelineReport> {
    if annotators.is_empty() {
        bail!("At least one annotator is required to run annotations");
    }
    let _span = info_span!("annotation_run", input = %input.display()).entered();
    let started = Instant::now();
    let workers = AnnotatorWorkers::new(annotators, options)?;
    let annotator_uids = workers.annotator_uids();
    let caches = workers.caches();
    info!(
        annotators = annotator_uids.len(),
        workers = workers.thread_count(),
        "Running annotations"
    );

    let report = Pipeline::builder(CsvAnnotationInput::new(input), options.pipeline.clone())
        .pipe(AnnotatorAssigner::new(annotator_uids.clone()))
        .pipe(workers)
        .sink(AnnotatorSink::new(annotator_uids, output))
        .run(on_progress)?;

    record_cache_stats(&options.metrics, ANNOTATOR_CACHE_SCOPE, &caches);
    options.metrics.record_total_duration(started.elapsed());
    Ok(report)
}

/// Prompts → SUTs → annotators in one pipeline. SUT responses flow straight
/// into the annotator assigner; only the annotated JSONL is written.
pub fn run_prompts_and_annotations(
    input: &Path,
    output: &Path,
    suts: &[SutHandle],
    annotators: &[AnnotatorHandle],
    options: &RunOptions,
    on_progress: impl FnMut(PipelineProgress),
) -> Result<PipelineReport> {
    run_prompts_and_annotations_into(
        input,
        JsonlAnnotatorOutput::new(output),
        suts,
        annotators,
        options,
        on_progress,
    )
}

pub fn run_prompts_and_annotations_into<O: AnnotationOutput>(
    input: &Path,
    output: O,
    suts: &[SutHandle],
    annotators: &[AnnotatorHandle],
    options: &RunOptions,
    on_progress: impl FnMut(PipelineProgress),
) -> Result<PipelineReport> {
    if suts.is_empty() || annotators.is_empty() {
        bail!("A chained run needs at least one SUT and one annotator");
    }
    let _span = info_span!("job_run", input = %input.display()).entered();
    let started = Instant::now();
    let sut_workers = PromptSutWorkers::new(suts, options)?;
    let annotator_workers = AnnotatorWorkers::new(annotators, options)?;
    let sut_uids = sut_workers.sut_uids();
    let annotator_uids = annotator_workers.annotator_uids();
    let sut_caches = sut_workers.caches();
    let annotator_caches = annotator_workers.caches();
    info!(
        suts = sut_uids.len(),
        annotators = annotator_uids.len(),
        "Running prompts with annotations"
    );

    let report = Pipeline::builder(CsvPromptInput::new(input), options.pipeline.clone())
        .pipe(PromptSutAssigner::new(sut_uids))
        .pipe(sut_workers)
        .pipe(AnnotatorAssigner::new(annotator_uids.clone()))
        .pipe(annotator_workers)
        .sink(AnnotatorSink::new(annotator_uids, output))
        .run(on_progress)?;

    record_cache_stats(&options.metrics, SUT_CACHE_SCOPE, &sut_caches);
    record_cache_stats(&options.metrics, ANNOTATOR_CACHE_SCOPE, &annotator_caches);
    options.metrics.record_total_duration(started.elapsed());
    Ok(report)
}
