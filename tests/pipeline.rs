use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use evalrig::error::PipelineError;
use evalrig::pipeline::{
    IterSource, PendingAggregates, Pipe, Pipeline, PipelineConfig, PipelineProgress, Sink,
    SinkSummary, Source,
};

const TARGETS: [&str; 3] = ["a", "b", "c"];

struct Assign {
    targets: Vec<String>,
}

impl Assign {
    fn new() -> Self {
        Self {
            targets: TARGETS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl Pipe for Assign {
    type Input = u32;
    type Output = (u32, String);

    fn name(&self) -> &str {
        "assign"
    }

    fn handle_item(&self, item: &u32, emit: &mut dyn FnMut((u32, String))) -> Result<()> {
        for target in &self.targets {
            emit((*item, target.clone()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Square {
    workers: usize,
    delay: Duration,
    fail_on: Option<(u32, &'static str)>,
    panic_on: Option<(u32, &'static str)>,
}

impl Pipe for Square {
    type Input = (u32, String);
    type Output = (u32, String, u64);

    fn name(&self) -> &str {
        "square"
    }

    fn thread_count(&self) -> usize {
        self.workers
    }

    fn handle_item(
        &self,
        (n, target): &(u32, String),
        emit: &mut dyn FnMut((u32, String, u64)),
    ) -> Result<()> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.fail_on == Some((*n, target.as_str())) {
            bail!("target {target} refused {n}");
        }
        if self.panic_on == Some((*n, target.as_str())) {
            panic!("worker blew up on {n}");
        }
        emit((*n, target.clone(), u64::from(*n) * u64::from(*n)));
        Ok(())
    }
}

type Rows = Arc<Mutex<Vec<(u32, BTreeMap<String, u64>)>>>;

struct Collect {
    pending: PendingAggregates<u32, u32, u64>,
    rows: Rows,
    written: u64,
}

impl Collect {
    fn new(rows: Rows) -> Self {
        Self {
            pending: PendingAggregates::new(TARGETS.len()),
            rows,
            written: 0,
        }
    }
}

impl Sink for Collect {
    type Item = (u32, String, u64);

    fn name(&self) -> &str {
        "collect"
    }

    fn handle_item(&mut self, (n, target, value): (u32, String, u64)) -> Result<()> {
        if let Some(row) = self.pending.merge(n, n, target, value) {
            self.rows.lock().unwrap().push(row);
            self.written += 1;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<SinkSummary> {
        Ok(SinkSummary {
            written: self.written,
            incomplete: self.pending.drain_incomplete().len() as u64,
        })
    }
}

fn config(capacity: usize) -> PipelineConfig {
    PipelineConfig {
        queue_capacity: capacity,
        poll_interval: Duration::from_millis(1),
        debug: false,
    }
}

fn sorted(rows: &Rows) -> Vec<(u32, BTreeMap<String, u64>)> {
    let mut rows = rows.lock().unwrap().clone();
    rows.sort_by_key(|(n, _)| *n);
    rows
}

#[test]
fn every_row_collects_one_result_per_target() {
    let rows = Rows::default();
    let report = Pipeline::builder(IterSource::new("numbers", 0..20u32), config(4))
        .pipe(Assign::new())
        .pipe(Square {
            workers: 4,
            ..Square::default()
        })
        .sink(Collect::new(rows.clone()))
        .run(|_| {})
        .unwrap();

    let rows = sorted(&rows);
    assert_eq!(rows.len(), 20);
    for (n, results) in rows {
        assert_eq!(results.len(), TARGETS.len());
        assert!(results.values().all(|v| *v == u64::from(n) * u64::from(n)));
    }
    assert!(report.is_clean());
    assert_eq!(report.written, 20);
    assert_eq!(report.progress.read, 20);
    assert_eq!(report.progress.processed, 60);
    assert_eq!(report.progress.completed, 60);
}

#[test]
fn failing_pair_leaves_its_row_unflushed() {
    let rows = Rows::default();
    let report = Pipeline::builder(IterSource::new("numbers", 0..10u32), config(8))
        .pipe(Assign::new())
        .pipe(Square {
            workers: 3,
            fail_on: Some((3, "b")),
            ..Square::default()
        })
        .sink(Collect::new(rows.clone()))
        .run(|_| {})
        .unwrap();

    let rows = sorted(&rows);
    assert_eq!(rows.len(), 9);
    assert!(rows.iter().all(|(n, _)| *n != 3));
    assert_eq!(report.progress.dropped, 1);
    assert_eq!(report.incomplete, 1);
    assert_eq!(report.written, 9);
    assert!(!report.is_clean());
    assert!(report.dropped_items.is_empty(), "diagnostics are debug-only");
}

#[test]
fn debug_mode_records_dropped_item_diagnostics() {
    let report = Pipeline::builder(
        IterSource::new("numbers", 0..5u32),
        PipelineConfig {
            debug: true,
            ..config(8)
        },
    )
    .pipe(Assign::new())
    .pipe(Square {
        workers: 2,
        fail_on: Some((3, "b")),
        ..Square::default()
    })
    .sink(Collect::new(Rows::default()))
    .run(|_| {})
    .unwrap();

    assert_eq!(report.dropped_items.len(), 1);
    let dropped = &report.dropped_items[0];
    assert_eq!(dropped.stage, "square");
    assert_eq!(dropped.item.as_deref(), Some("(3, \"b\")"));
    assert!(dropped.error.contains("target b refused 3"));
}

#[test]
fn queues_never_exceed_capacity_under_a_slow_worker() {
    let rows = Rows::default();
    let report = Pipeline::builder(IterSource::new("numbers", 0..30u32), config(2))
        .pipe(Assign::new())
        .pipe(Square {
            workers: 1,
            delay: Duration::from_millis(1),
            ..Square::default()
        })
        .sink(Collect::new(rows.clone()))
        .run(|_| {})
        .unwrap();

    assert_eq!(sorted(&rows).len(), 30);
    assert_eq!(report.queues.len(), 3);
    for queue in &report.queues {
        assert_eq!(queue.capacity, 2);
        assert!(
            queue.high_water_mark <= 2,
            "{} reached {}",
            queue.name,
            queue.high_water_mark
        );
    }
    assert!(report.queues.iter().any(|queue| queue.high_water_mark == 2));
}

#[test]
fn panicking_handler_drops_only_that_item() {
    let rows = Rows::default();
    let report = Pipeline::builder(IterSource::new("numbers", 0..6u32), config(4))
        .pipe(Assign::new())
        .pipe(Square {
            workers: 2,
            panic_on: Some((5, "c")),
            ..Square::default()
        })
        .sink(Collect::new(rows.clone()))
        .run(|_| {})
        .unwrap();

    assert_eq!(sorted(&rows).len(), 5);
    assert_eq!(report.progress.dropped, 1);
    assert_eq!(report.incomplete, 1);
}

#[test]
fn progress_is_monotone_and_final_snapshot_is_complete() {
    let snapshots = Arc::new(Mutex::new(Vec::<PipelineProgress>::new()));
    let recorder = snapshots.clone();
    Pipeline::builder(IterSource::new("numbers", 0..40u32), config(4))
        .pipe(Assign::new())
        .pipe(Square {
            workers: 2,
            delay: Duration::from_micros(200),
            ..Square::default()
        })
        .sink(Collect::new(Rows::default()))
        .run(move |progress| recorder.lock().unwrap().push(progress))
        .unwrap();

    let snapshots = snapshots.lock().unwrap();
    assert!(snapshots.len() >= 2);
    for pair in snapshots.windows(2) {
        assert!(pair[1].read >= pair[0].read);
        assert!(pair[1].processed >= pair[0].processed);
        assert!(pair[1].completed >= pair[0].completed);
        assert!(pair[1].dropped >= pair[0].dropped);
    }
    let last = snapshots.last().unwrap();
    assert_eq!(last.read, 40);
    assert_eq!(last.completed, 120);
}

struct RowsWithGaps;

impl Source for RowsWithGaps {
    type Item = u32;

    fn name(&self) -> &str {
        "gappy"
    }

    fn items(&mut self) -> Result<Box<dyn Iterator<Item = Result<u32>> + '_>> {
        Ok(Box::new((0..5u32).map(|n| {
            if n == 2 {
                Err(anyhow!("row {n} is malformed"))
            } else {
                Ok(n)
            }
        })))
    }
}

#[test]
fn unreadable_source_items_are_skipped() {
    let rows = Rows::default();
    let report = Pipeline::builder(RowsWithGaps, config(4))
        .pipe(Assign::new())
        .pipe(Square {
            workers: 1,
            ..Square::default()
        })
        .sink(Collect::new(rows.clone()))
        .run(|_| {})
        .unwrap();

    assert_eq!(report.progress.read, 4);
    assert_eq!(report.progress.dropped, 1);
    assert_eq!(sorted(&rows).len(), 4);
}

struct Unopenable;

impl Source for Unopenable {
    type Item = u32;

    fn name(&self) -> &str {
        "unopenable"
    }

    fn items(&mut self) -> Result<Box<dyn Iterator<Item = Result<u32>> + '_>> {
        Err(anyhow!("input file is missing"))
    }
}

#[test]
fn source_failure_fails_the_run() {
    let err = Pipeline::builder(Unopenable, config(4))
        .pipe(Assign::new())
        .pipe(Square {
            workers: 2,
            ..Square::default()
        })
        .sink(Collect::new(Rows::default()))
        .run(|_| {})
        .unwrap_err();

    match err {
        PipelineError::Stage { stage, message } => {
            assert_eq!(stage, "unopenable");
            assert!(message.contains("input file is missing"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

struct BrokenSink;

impl Sink for BrokenSink {
    type Item = (u32, String, u64);

    fn name(&self) -> &str {
        "broken"
    }

    fn open(&mut self) -> Result<()> {
        bail!("cannot create output")
    }

    fn handle_item(&mut self, _item: (u32, String, u64)) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<SinkSummary> {
        Ok(SinkSummary::default())
    }
}

#[test]
fn sink_open_failure_stops_upstream_and_fails_the_run() {
    let err = Pipeline::builder(IterSource::new("numbers", 0..1_000u32), config(2))
        .pipe(Assign::new())
        .pipe(Square {
            workers: 2,
            ..Square::default()
        })
        .sink(BrokenSink)
        .run(|_| {})
        .unwrap_err();

    assert!(matches!(err, PipelineError::Stage { ref stage, .. } if stage == "broken"));
}

#[test]
fn stage_names_follow_builder_order() {
    let pipeline = Pipeline::builder(IterSource::new("numbers", 0..1u32), config(1))
        .pipe(Assign::new())
        .pipe(Square::default())
        .sink(Collect::new(Rows::default()));
    assert_eq!(
        pipeline.stage_names(),
        ["numbers", "assign", "square", "collect"]
    );
}
