use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, info_span};

use crate::cache::{Cache, NoCache};
use crate::records::{SutInteraction, SutResponse, TextPrompt};
use crate::targets::AnnotatorHandle;

pub const DEFAULT_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub id: String,
    pub prompt: TextPrompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResponse {
    pub job_id: String,
    pub response: SutResponse,
}

/// A SUT that answers a whole batch of prompts in one call. Responses may
/// come back in any order; they are matched to jobs by id.
pub trait BatchSut: Send + Sync {
    fn uid(&self) -> &str;

    fn evaluate_batch(&self, jobs: &[BatchJob]) -> Result<Vec<BatchResponse>>;
}

#[derive(Debug, Clone)]
pub struct TestItem {
    pub id: String,
    pub prompts: Vec<TextPrompt>,
}

pub trait Test {
    fn uid(&self) -> &str;

    fn measure_quality(
        &self,
        item: &TestItem,
        interactions: &[PromptInteraction],
    ) -> Result<BTreeMap<String, f64>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptInteraction {
    pub prompt: TextPrompt,
    pub response: SutResponse,
    pub annotations: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestItemRecord {
    pub item_id: String,
    pub interactions: Vec<PromptInteraction>,
    pub measurements: BTreeMap<String, f64>,
}

pub struct BatchTestRunner {
    batch_size: usize,
    annotators: Vec<(AnnotatorHandle, Arc<dyn Cache>)>,
}

impl Default for BatchTestRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchTestRunner {
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            annotators: Vec::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_annotator(self, annotator: AnnotatorHandle) -> Self {
        self.with_cached_annotator(annotator, Arc::new(NoCache))
    }

    pub fn with_cached_annotator(mut self, annotator: AnnotatorHandle, cache: Arc<dyn Cache>) -> Self {
        self.annotators.push((annotator, cache));
        self
    }

    pub fn run(
        &self,
        test: &dyn Test,
        items: &[TestItem],
        sut: &dyn BatchSut,
    ) -> Result<Vec<TestItemRecord>> {
        let _span = info_span!("batch_run", test = test.uid(), sut = sut.uid()).entered();
        let jobs = flatten_jobs(items);
        let responses = self.evaluate_all(&jobs, sut)?;

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let mut interactions = Vec::with_capacity(item.prompts.len());
            for (index, prompt) in item.prompts.iter().enumerate() {
                let id = job_id(&item.id, index);
                let response = responses
                    .get(&id)
                    .cloned()
                    .with_context(|| format!("SUT '{}' returned no response for job '{id}'", sut.uid()))?;
                let annotations = self.annotate(prompt, sut.uid(), &response)?;
                interactions.push(PromptInteraction {
                    prompt: prompt.clone(),
                    response,
                    annotations,
                });
            }
            let measurements = test
                .measure_quality(item, &interactions)
                .with_context(|| format!("Failed to measure test item '{}'", item.id))?;
            records.push(TestItemRecord {
                item_id: item.id.clone(),
                interactions,
                measurements,
            });
        }
        info!(items = records.len(), jobs = jobs.len(), "Batch run finished");
        Ok(records)
    }

    fn evaluate_all(
        &self,
        jobs: &[BatchJob],
        sut: &dyn BatchSut,
    ) -> Result<HashMap<String, SutResponse>> {
        let mut responses = HashMap::with_capacity(jobs.len());
        if jobs.is_empty() {
            return Ok(responses);
        }
        let batch_size = self.batch_size.min(jobs.len());
        for (chunk_index, chunk) in jobs.chunks(batch_size).enumerate() {
            let start = chunk_index * batch_size;
            let end = start + chunk.len();
            debug!(start, end, total = jobs.len(), "Submitting batch");
            let answers = sut.evaluate_batch(chunk).with_context(|| {
                format!(
                    "Batch of jobs {start}..{end} (of {}) failed for SUT '{}'",
                    jobs.len(),
                    sut.uid()
                )
            })?;
            for answer in answers {
                if !chunk.iter().any(|job| job.id == answer.job_id) {
                    bail!(
                        "SUT '{}' answered job '{}', which was not in batch {start}..{end}",
                        sut.uid(),
                        answer.job_id
                    );
                }
                responses.insert(answer.job_id, answer.response);
            }
        }
        Ok(responses)
    }

    fn annotate(
        &self,
        prompt: &TextPrompt,
        sut_uid: &str,
        response: &SutResponse,
    ) -> Result<BTreeMap<String, Value>> {
        let mut annotations = BTreeMap::new();
        if self.annotators.is_empty() {
            return Ok(annotations);
        }
        let interaction = SutInteraction {
            prompt: prompt.clone(),
            sut_uid: sut_uid.to_string(),
            response: response.clone(),
        };
        for (annotator, cache) in &self.annotators {
            let annotation = annotator.annotate(&interaction, cache.as_ref())?;
            annotations.insert(annotator.uid().to_string(), annotation);
        }
        Ok(annotations)
    }
}

pub fn job_id(item_id: &str, prompt_index: usize) -> String {
    format!("{item_id}-{prompt_index}")
}

fn flatten_jobs(items: &[TestItem]) -> Vec<BatchJob> {
    items
        .iter()
        .flat_map(|item| {
            item.prompts.iter().enumerate().map(|(index, prompt)| BatchJob {
                id: job_id(&item.id, index),
                prompt: prompt.clone(),
            })
        })
        .collect()
}
