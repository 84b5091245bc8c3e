//! Staged, thread-based pipeline execution.
//!
//! A pipeline is a [`Source`], any number of [`Pipe`]s and a [`Sink`]. Each
//! stage runs on its own thread(s) and consecutive stages are joined by a
//! [`BoundedQueue`], so a fast producer blocks instead of buffering without
//! limit. A pipe handler that fails (or panics) drops that one item; the rest
//! of the run carries on.

pub mod fan_in;
pub mod queue;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::error::PipelineError;

pub use fan_in::{Completed, PendingAggregates};
pub use queue::{BoundedQueue, QueueProbe};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// First stage: reads an external sequence exactly once.
pub trait Source: Send + 'static {
    type Item: Send + 'static;

    fn name(&self) -> &str;

    /// An `Err` here aborts the run; an `Err` item is logged and skipped.
    fn items(&mut self) -> Result<Box<dyn Iterator<Item = Result<Self::Item>> + '_>>;
}

/// Middle stage. Runs on `thread_count` threads sharing one input queue.
pub trait Pipe: Send + Sync + 'static {
    type Input: Send + fmt::Debug + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &str;

    fn thread_count(&self) -> usize {
        1
    }

    fn handle_item(&self, item: &Self::Input, emit: &mut dyn FnMut(Self::Output)) -> Result<()>;
}

/// Last stage. Single-threaded; `close` runs even when `open` failed.
pub trait Sink: Send + 'static {
    type Item: Send + 'static;

    fn name(&self) -> &str;

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn handle_item(&mut self, item: Self::Item) -> Result<()>;

    fn close(&mut self) -> Result<SinkSummary>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    pub written: u64,
    pub incomplete: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub debug: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            debug: false,
        }
    }
}

/// Running totals. Every field only ever grows during a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineProgress {
    pub read: u64,
    pub processed: u64,
    pub completed: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DroppedItem {
    pub stage: String,
    pub item: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub threads: usize,
    pub handled: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub name: String,
    pub capacity: usize,
    pub high_water_mark: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub progress: PipelineProgress,
    pub written: u64,
    pub incomplete: u64,
    pub stages: Vec<StageReport>,
    pub queues: Vec<QueueReport>,
    /// Populated in debug mode only.
    pub dropped_items: Vec<DroppedItem>,
    pub duration_ms: f64,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.progress.dropped == 0 && self.incomplete == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageKind {
    Source,
    Pipe,
    Sink,
}

#[derive(Default)]
struct StageCounters {
    handled: AtomicU64,
    dropped: AtomicU64,
}

struct StageEntry {
    name: String,
    kind: StageKind,
    threads: usize,
    counters: Arc<StageCounters>,
}

struct RunState {
    debug: bool,
    dropped_items: Mutex<Vec<DroppedItem>>,
    sink_summary: Mutex<SinkSummary>,
}

impl RunState {
    fn record_drop(
        &self,
        stage: &str,
        counters: &StageCounters,
        item: Option<String>,
        err: &anyhow::Error,
    ) {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        if self.debug {
            self.dropped_items
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(DroppedItem {
                    stage: stage.to_string(),
                    item,
                    error: format!("{err:#}"),
                });
        }
    }
}

struct StageThread {
    stage: String,
    handle: JoinHandle<Result<()>>,
}

type Launcher =
    Box<dyn FnOnce(&Arc<RunState>, &mut Vec<StageThread>) -> Result<(), PipelineError> + Send>;

pub struct Pipeline {
    config: PipelineConfig,
    launchers: Vec<Launcher>,
    stages: Vec<StageEntry>,
    queues: Vec<Arc<dyn QueueProbe>>,
}

pub struct PipelineBuilder<T> {
    config: PipelineConfig,
    launchers: Vec<Launcher>,
    stages: Vec<StageEntry>,
    queues: Vec<Arc<dyn QueueProbe>>,
    tail: Arc<BoundedQueue<T>>,
}

impl Pipeline {
    pub fn builder<S: Source>(source: S, config: PipelineConfig) -> PipelineBuilder<S::Item> {
        let name = source.name().to_string();
        let output = Arc::new(BoundedQueue::new(
            format!("{name} output"),
            config.queue_capacity,
        ));
        let counters = Arc::new(StageCounters::default());
        let stages = vec![StageEntry {
            name: name.clone(),
            kind: StageKind::Source,
            threads: 1,
            counters: Arc::clone(&counters),
        }];
        let queues: Vec<Arc<dyn QueueProbe>> = vec![output.clone() as Arc<dyn QueueProbe>];

        let launch_output = Arc::clone(&output);
        let launcher: Launcher = Box::new(move |state: &Arc<RunState>, threads: &mut Vec<StageThread>| {
            let state = Arc::clone(state);
            let stage = name.clone();
            threads.push(spawn_stage(name.clone(), &name, move || {
                run_source(source, &stage, &launch_output, &counters, &state)
            })?);
            Ok(())
        });

        PipelineBuilder {
            config,
            launchers: vec![launcher],
            stages,
            queues,
            tail: output,
        }
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name.as_str()).collect()
    }

    /// Runs every stage to completion. `on_progress` is polled on the calling
    /// thread every poll interval and once more after all stages have joined.
    pub fn run(
        self,
        mut on_progress: impl FnMut(PipelineProgress),
    ) -> Result<PipelineReport, PipelineError> {
        let Pipeline {
            config,
            launchers,
            stages,
            queues,
        } = self;
        let state = Arc::new(RunState {
            debug: config.debug,
            dropped_items: Mutex::new(Vec::new()),
            sink_summary: Mutex::new(SinkSummary::default()),
        });
        let started = Instant::now();
        info!(
            stages = stages.len(),
            queue_capacity = config.queue_capacity,
            "Starting pipeline"
        );

        let mut threads = Vec::new();
        let mut failure = None;
        for launch in launchers {
            if let Err(err) = launch(&state, &mut threads) {
                error!(error = %err, "Failed to start pipeline");
                for queue in &queues {
                    queue.close();
                }
                failure = Some(err);
                break;
            }
        }

        loop {
            on_progress(progress_of(&stages));
            if config.debug {
                for queue in &queues {
                    info!(
                        queue = queue.name(),
                        len = queue.len(),
                        capacity = queue.capacity(),
                        closed = queue.is_closed(),
                        "Queue occupancy"
                    );
                }
            }
            if threads.iter().all(|running| running.handle.is_finished()) {
                break;
            }
            thread::sleep(config.poll_interval);
        }

        for StageThread { stage, handle } in threads {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failure.get_or_insert(PipelineError::Stage {
                        stage,
                        message: format!("{err:#}"),
                    });
                }
                Err(_) => {
                    failure.get_or_insert(PipelineError::Panicked(stage));
                }
            }
        }

        let progress = progress_of(&stages);
        on_progress(progress);
        if let Some(err) = failure {
            return Err(err);
        }

        let summary = *state
            .sink_summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let dropped_items = std::mem::take(
            &mut *state
                .dropped_items
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let report = PipelineReport {
            progress,
            written: summary.written,
            incomplete: summary.incomplete,
            stages: stages
                .iter()
                .map(|stage| StageReport {
                    name: stage.name.clone(),
                    threads: stage.threads,
                    handled: stage.counters.handled.load(Ordering::Relaxed),
                    dropped: stage.counters.dropped.load(Ordering::Relaxed),
                })
                .collect(),
            queues: queues
                .iter()
                .map(|queue| QueueReport {
                    name: queue.name().to_string(),
                    capacity: queue.capacity(),
                    high_water_mark: queue.high_water_mark(),
                })
                .collect(),
            dropped_items,
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
        };

        for dropped in &report.dropped_items {
            warn!(
                stage = dropped.stage.as_str(),
                item = dropped.item.as_deref().unwrap_or("<unavailable>"),
                error = dropped.error.as_str(),
                "Dropped item"
            );
        }
        info!(
            read = progress.read,
            processed = progress.processed,
            completed = progress.completed,
            dropped = progress.dropped,
            written = report.written,
            incomplete = report.incomplete,
            duration_ms = report.duration_ms,
            "Pipeline finished"
        );
        Ok(report)
    }
}

impl<T: Send + 'static> PipelineBuilder<T> {
    pub fn pipe<P>(mut self, pipe: P) -> PipelineBuilder<P::Output>
    where
        P: Pipe<Input = T>,
    {
        let name = pipe.name().to_string();
        let thread_count = pipe.thread_count().max(1);
        let input = self.tail;
        let output = Arc::new(BoundedQueue::new(
            format!("{name} output"),
            self.config.queue_capacity,
        ));
        let counters = Arc::new(StageCounters::default());
        self.queues.push(output.clone());
        self.stages.push(StageEntry {
            name: name.clone(),
            kind: StageKind::Pipe,
            threads: thread_count,
            counters: Arc::clone(&counters),
        });

        let pipe = Arc::new(pipe);
        let launch_output = Arc::clone(&output);
        self.launchers.push(Box::new(move |state: &Arc<RunState>, threads: &mut Vec<StageThread>| {
            let remaining = Arc::new(AtomicUsize::new(thread_count));
            for index in 0..thread_count {
                let pipe = Arc::clone(&pipe);
                let worker_input = Arc::clone(&input);
                let output = Arc::clone(&launch_output);
                let counters = Arc::clone(&counters);
                let state = Arc::clone(state);
                let exit_count = Arc::clone(&remaining);
                let stage = name.clone();
                let spawned = spawn_stage(format!("{name}-{index}"), &name, move || {
                    let _exit = WorkerExit {
                        remaining: &*exit_count,
                        output: &*output,
                    };
                    let _span = info_span!("pipe", stage = stage.as_str(), worker = index).entered();
                    run_pipe_worker(&*pipe, &stage, &worker_input, &output, &counters, &state);
                    Ok(())
                });
                match spawned {
                    Ok(thread) => threads.push(thread),
                    Err(err) => {
                        input.close();
                        launch_output.close();
                        return Err(err);
                    }
                }
            }
            Ok(())
        }));

        PipelineBuilder {
            config: self.config,
            launchers: self.launchers,
            stages: self.stages,
            queues: self.queues,
            tail: output,
        }
    }

    pub fn sink<K>(mut self, sink: K) -> Pipeline
    where
        K: Sink<Item = T>,
    {
        let name = sink.name().to_string();
        let input = self.tail;
        let counters = Arc::new(StageCounters::default());
        self.stages.push(StageEntry {
            name: name.clone(),
            kind: StageKind::Sink,
            threads: 1,
            counters: Arc::clone(&counters),
        });

        self.launchers.push(Box::new(move |state: &Arc<RunState>, threads: &mut Vec<StageThread>| {
            let state = Arc::clone(state);
            let stage = name.clone();
            threads.push(spawn_stage(name.clone(), &name, move || {
                run_sink(sink, &stage, &input, &counters, &state)
            })?);
            Ok(())
        }));

        Pipeline {
            config: self.config,
            launchers: self.launchers,
            stages: self.stages,
            queues: self.queues,
        }
    }
}

/// Closes the shared output queue when the last worker of a pipe exits,
/// including on unwind.
struct WorkerExit<'a, T> {
    remaining: &'a AtomicUsize,
    output: &'a BoundedQueue<T>,
}

impl<T> Drop for WorkerExit<'_, T> {
    fn drop(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.output.close();
        }
    }
}

fn spawn_stage<F>(thread_name: String, stage: &str, body: F) -> Result<StageThread, PipelineError>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(thread_name)
        .spawn(body)
        .map_err(|source| PipelineError::Spawn {
            stage: stage.to_string(),
            source,
        })?;
    Ok(StageThread {
        stage: stage.to_string(),
        handle,
    })
}

fn run_source<S: Source>(
    mut source: S,
    stage: &str,
    output: &BoundedQueue<S::Item>,
    counters: &StageCounters,
    state: &RunState,
) -> Result<()> {
    let _span = info_span!("source", stage).entered();
    let result = feed_source(&mut source, stage, output, counters, state);
    output.close();
    match &result {
        Ok(()) => debug!("Source exhausted"),
        Err(err) => error!(error = %format!("{err:#}"), "Source failed"),
    }
    result
}

fn feed_source<S: Source>(
    source: &mut S,
    stage: &str,
    output: &BoundedQueue<S::Item>,
    counters: &StageCounters,
    state: &RunState,
) -> Result<()> {
    for item in source.items()? {
        match item {
            Ok(item) => {
                if output.put(item).is_err() {
                    warn!("Downstream closed; source stops reading");
                    break;
                }
                counters.handled.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "Skipping unreadable input item");
                state.record_drop(stage, counters, None, &err);
            }
        }
    }
    Ok(())
}

fn run_pipe_worker<P: Pipe>(
    pipe: &P,
    stage: &str,
    input: &BoundedQueue<P::Input>,
    output: &BoundedQueue<P::Output>,
    counters: &StageCounters,
    state: &RunState,
) {
    while let Some(item) = input.get() {
        let mut downstream_closed = false;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            pipe.handle_item(&item, &mut |produced| {
                if output.put(produced).is_err() {
                    downstream_closed = true;
                }
            })
        }));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("handler panicked: {}", panic_message(&*payload))),
        };

        match result {
            Ok(()) => {
                counters.handled.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                error!(item = ?item, error = %format!("{err:#}"), "Dropping item after handler failure");
                state.record_drop(stage, counters, Some(format!("{item:?}")), &err);
            }
        }

        if downstream_closed {
            warn!("Downstream closed; worker stops");
            input.close();
            break;
        }
    }
}

fn run_sink<K: Sink>(
    mut sink: K,
    stage: &str,
    input: &BoundedQueue<K::Item>,
    counters: &StageCounters,
    state: &RunState,
) -> Result<()> {
    let _span = info_span!("sink", stage).entered();
    let opened = sink.open();
    match &opened {
        Ok(()) => {
            while let Some(item) = input.get() {
                match sink.handle_item(item) {
                    Ok(()) => {
                        counters.handled.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        error!(error = %format!("{err:#}"), "Sink rejected item");
                        state.record_drop(stage, counters, None, &err);
                    }
                }
            }
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "Sink failed to open");
            input.close();
        }
    }

    let closed = sink.close();
    if let Ok(summary) = &closed {
        *state
            .sink_summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = *summary;
    }
    opened?;
    closed?;
    Ok(())
}

fn progress_of(stages: &[StageEntry]) -> PipelineProgress {
    let handled_by = |kind: StageKind| {
        stages
            .iter()
            .rev()
            .find(|stage| stage.kind == kind)
            .map(|stage| stage.counters.handled.load(Ordering::Relaxed))
    };
    let read = handled_by(StageKind::Source).unwrap_or_default();
    PipelineProgress {
        read,
        processed: handled_by(StageKind::Pipe).unwrap_or(read),
        completed: handled_by(StageKind::Sink).unwrap_or_default(),
        dropped: stages
            .iter()
            .map(|stage| stage.counters.dropped.load(Ordering::Relaxed))
            .sum(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub struct IterSource<I> {
    name: String,
    items: I,
}

impl<I> IterSource<I> {
    pub fn new<C>(name: impl Into<String>, items: C) -> Self
    where
        C: IntoIterator<IntoIter = I>,
    {
        Self {
            name: name.into(),
            items: items.into_iter(),
        }
    }
}

impl<I> Source for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    fn name(&self) -> &str {
        &self.name
    }

    fn items(&mut self) -> Result<Box<dyn Iterator<Item = Result<Self::Item>> + '_>> {
        Ok(Box::new(self.items.by_ref().map(Ok::<_, anyhow::Error>)))
    }
}
