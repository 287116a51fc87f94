//! Adaptive concurrent acquisition worker pool.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use soundcat_adapters::{AcquisitionSession, SessionFactory, SourceError, SourceReader};
use soundcat_core::{Checkpoint, MatchOutcome, WorkItem};
use soundcat_match::{content_key, Assessment, CatalogIndex, Reconciler};
use soundcat_storage::CheckpointStore;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::flush::{FlushExecutor, FlushStats};
use crate::summary::RunSummary;
use crate::throttle::{CaptchaThrottle, ThrottleConfig, ThrottleTransition};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub base_delay: Duration,
    /// Fraction of the delay applied as random spread in both directions.
    pub jitter: f64,
    pub checkpoint_every: usize,
    pub flush_every: usize,
    /// Sleep between rechecks while a worker is outside the active range.
    pub idle_poll: Duration,
    pub dry_run: bool,
    pub throttle: ThrottleConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            base_delay: Duration::from_millis(2500),
            jitter: 0.3,
            checkpoint_every: 50,
            flush_every: 200,
            idle_poll: Duration::from_secs(1),
            dry_run: false,
            throttle: ThrottleConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolReport {
    pub summary: RunSummary,
    pub completed_ids: BTreeSet<String>,
    /// Every input item completed; the checkpoint was cleared.
    pub finished: bool,
}

/// Pool-level control state. Every "report outcome" step goes through this one lock.
struct Control {
    cursor: usize,
    completed: BTreeSet<String>,
    since_checkpoint: usize,
    buffer: Vec<MatchOutcome>,
    summary: RunSummary,
    throttle: CaptchaThrottle,
    checkpoint: Checkpoint,
    checkpoint_seq: u64,
}

impl Control {
    fn claim(&mut self, items: &[WorkItem]) -> Option<usize> {
        while self.cursor < items.len() {
            let idx = self.cursor;
            self.cursor += 1;
            if !self.completed.contains(&items[idx].id) {
                return Some(idx);
            }
        }
        None
    }

    fn drained(&self, items: &[WorkItem]) -> bool {
        items[self.cursor.min(items.len())..]
            .iter()
            .all(|i| self.completed.contains(&i.id))
    }

    fn take_checkpoint(&mut self, every: usize) -> Option<(u64, Checkpoint)> {
        if self.since_checkpoint < every {
            return None;
        }
        self.since_checkpoint = 0;
        self.checkpoint_seq += 1;
        self.checkpoint.completed_ids = self.completed.clone();
        self.checkpoint.last_updated = Utc::now();
        Some((self.checkpoint_seq, self.checkpoint.clone()))
    }

    fn apply_flush(&mut self, stats: &FlushStats) {
        self.summary.flushes += 1;
        self.summary.conflicts += stats.conflicts;
        self.summary.review_tasks += stats.review_tasks;
        self.summary.errors += stats.invalid_rows;
        self.summary.store_errors += stats.store_errors;
        for category in &stats.created_categories {
            self.summary.record_new_product(category);
        }
    }
}

/// Writes checkpoint snapshots in the order they were taken. A snapshot
/// older than the last one written is dropped.
struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    last_saved: Mutex<u64>,
}

impl CheckpointWriter {
    fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            last_saved: Mutex::new(0),
        }
    }

    async fn save(&self, seq: u64, checkpoint: &Checkpoint) {
        let mut last_saved = self.last_saved.lock().await;
        if seq <= *last_saved {
            debug!(phase = "checkpoint", seq, last = *last_saved, "stale snapshot skipped");
            return;
        }
        match self.store.save(checkpoint).await {
            Ok(()) => {
                *last_saved = seq;
                info!(
                    phase = "checkpoint",
                    completed = checkpoint.completed_ids.len(),
                    "checkpoint saved"
                );
            }
            Err(err) => warn!(phase = "checkpoint", error = %err, "checkpoint write failed"),
        }
    }
}

struct RunContext {
    config: PoolConfig,
    items: Vec<WorkItem>,
    deadline: Option<Instant>,
    readers: HashMap<String, Arc<dyn SourceReader>>,
    reconciler: Arc<Reconciler>,
    index: Arc<RwLock<CatalogIndex>>,
    flusher: Arc<FlushExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
    writer: CheckpointWriter,
    control: Mutex<Control>,
}

pub struct WorkerPool {
    config: PoolConfig,
    readers: HashMap<String, Arc<dyn SourceReader>>,
    sessions: Arc<dyn SessionFactory>,
    reconciler: Arc<Reconciler>,
    index: Arc<RwLock<CatalogIndex>>,
    flusher: Arc<FlushExecutor>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        readers: impl IntoIterator<Item = Arc<dyn SourceReader>>,
        sessions: Arc<dyn SessionFactory>,
        reconciler: Arc<Reconciler>,
        index: Arc<RwLock<CatalogIndex>>,
        flusher: Arc<FlushExecutor>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let readers = readers
            .into_iter()
            .map(|r| (r.source_id().to_string(), r))
            .collect();
        Self {
            config,
            readers,
            sessions,
            reconciler,
            index,
            flusher,
            checkpoints,
        }
    }

    pub fn index(&self) -> &Arc<RwLock<CatalogIndex>> {
        &self.index
    }

    /// Processes `items` in order, skipping `resume_ids`. A zero `deadline`
    /// runs until the queue is drained.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        resume_ids: BTreeSet<String>,
        deadline: Duration,
    ) -> Result<PoolReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let workers = self.config.workers.max(1);
        let span = info_span!("pool_run", %run_id, workers, items = items.len());

        async move {
            let mut summary = RunSummary::new(run_id, started_at, self.config.dry_run);
            summary.items_total = items.len();
            summary.items_resumed = items.iter().filter(|i| resume_ids.contains(&i.id)).count();
            info!(phase = "acquire", resumed = summary.items_resumed, "starting acquisition");

            let mut checkpoint = Checkpoint::new(started_at);
            checkpoint.completed_ids = resume_ids.clone();

            let mut sessions = Vec::with_capacity(workers);
            for worker in 0..workers {
                match self.sessions.open(worker).await {
                    Ok(session) => sessions.push(session),
                    Err(err) => {
                        close_all(sessions).await;
                        return Err(err.context(format!("opening session for worker {worker}")));
                    }
                }
            }

            let ctx = Arc::new(RunContext {
                config: self.config.clone(),
                items,
                deadline: (!deadline.is_zero()).then(|| Instant::now() + deadline),
                readers: self.readers.clone(),
                reconciler: self.reconciler.clone(),
                index: self.index.clone(),
                flusher: self.flusher.clone(),
                checkpoints: self.checkpoints.clone(),
                writer: CheckpointWriter::new(self.checkpoints.clone()),
                control: Mutex::new(Control {
                    cursor: 0,
                    completed: resume_ids,
                    since_checkpoint: 0,
                    buffer: Vec::new(),
                    summary,
                    throttle: CaptchaThrottle::new(
                        self.config.throttle,
                        workers,
                        self.config.base_delay,
                    ),
                    checkpoint,
                    checkpoint_seq: 0,
                }),
            });

            let mut handles = Vec::with_capacity(workers);
            for (ordinal, session) in sessions.into_iter().enumerate() {
                let ctx = ctx.clone();
                let span = info_span!("worker", ordinal);
                handles.push(tokio::spawn(worker_loop(ctx, ordinal, session).instrument(span)));
            }
            let mut returned = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.await {
                    Ok(session) => returned.push(session),
                    Err(err) => warn!(error = %err, "worker task failed"),
                }
            }
            close_all(returned).await;

            let remaining = std::mem::take(&mut ctx.control.lock().await.buffer);
            if !remaining.is_empty() {
                let stats = ctx.flusher.flush(remaining, &ctx.index).await;
                ctx.control.lock().await.apply_flush(&stats);
            }

            let mut control = ctx.control.lock().await;
            let finished = ctx.items.iter().all(|i| control.completed.contains(&i.id));
            if finished {
                if let Err(err) = ctx.checkpoints.clear().await {
                    warn!(phase = "checkpoint", error = %err, "clearing checkpoint failed");
                }
            } else {
                control.checkpoint.completed_ids = control.completed.clone();
                control.checkpoint.last_updated = Utc::now();
                if let Err(err) = ctx.checkpoints.save(&control.checkpoint).await {
                    warn!(phase = "checkpoint", error = %err, "saving final checkpoint failed");
                }
            }
            control.summary.finished_at = Some(Utc::now());
            let summary = control.summary.clone();
            info!(
                phase = "summary",
                completed = summary.items_completed,
                auto = summary.auto,
                pending = summary.pending,
                new_products = summary.new_products,
                skipped = summary.skipped,
                errors = summary.errors,
                antibot_events = summary.antibot_events,
                finished,
                "run complete"
            );
            Ok(PoolReport {
                summary,
                completed_ids: control.completed.clone(),
                finished,
            })
        }
        .instrument(span)
        .await
    }
}

async fn close_all(sessions: Vec<Box<dyn AcquisitionSession>>) {
    for mut session in sessions {
        let worker = session.worker();
        if let Err(err) = session.close().await {
            warn!(worker, error = %err, "closing session failed");
        }
    }
}

fn log_transition(transition: ThrottleTransition, window: usize) {
    match transition {
        ThrottleTransition::Reduced { workers, delay } => info!(
            phase = "throttle",
            workers,
            delay_ms = delay.as_millis() as u64,
            window,
            "anti-bot challenges rising; reducing concurrency"
        ),
        ThrottleTransition::Restored { workers, delay } => info!(
            phase = "throttle",
            workers,
            delay_ms = delay.as_millis() as u64,
            "challenge window quiet; restoring concurrency"
        ),
    }
}

fn jittered(base: Duration, jitter: f64) -> Duration {
    if base.is_zero() || jitter <= 0.0 {
        return base;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    base.mul_f64(factor.max(0.0))
}

enum ItemResult {
    Done(Vec<Assessment>),
    AntiBot,
    Failed,
}

async fn process_item(
    ctx: &RunContext,
    session: &mut dyn AcquisitionSession,
    item: &WorkItem,
) -> Result<Vec<Assessment>, SourceError> {
    let reader = ctx.readers.get(&item.source_id).ok_or_else(|| {
        SourceError::Anyhow(anyhow::anyhow!("no reader registered for {}", item.source_id))
    })?;
    let candidates = reader.search(session, item).await?;

    let mut seen = HashSet::new();
    let index = ctx.index.read().await;
    let now = Utc::now();
    Ok(candidates
        .iter()
        .filter(|c| seen.insert(content_key(&item.source_id, &c.title)))
        .map(|c| ctx.reconciler.assess(&index, item, c, now))
        .collect())
}

async fn worker_loop(
    ctx: Arc<RunContext>,
    ordinal: usize,
    mut session: Box<dyn AcquisitionSession>,
) -> Box<dyn AcquisitionSession> {
    loop {
        if ctx.deadline.is_some_and(|d| Instant::now() >= d) {
            debug!("deadline reached");
            break;
        }

        let (parked, delay, claimed) = {
            let mut control = ctx.control.lock().await;
            if let Some(t) = control.throttle.tick(std::time::Instant::now()) {
                log_transition(t, control.throttle.window_len());
            }
            let parked = ordinal >= control.throttle.active_workers();
            let delay = control.throttle.delay();
            let claimed = if parked {
                None
            } else {
                control.claim(&ctx.items)
            };
            if parked && control.drained(&ctx.items) {
                break;
            }
            (parked, delay, claimed)
        };

        if parked {
            tokio::time::sleep(ctx.config.idle_poll).await;
            continue;
        }
        let Some(idx) = claimed else {
            break;
        };
        let item = &ctx.items[idx];

        let result = match process_item(&ctx, session.as_mut(), item).await {
            Ok(assessments) => ItemResult::Done(assessments),
            Err(err) if err.is_anti_bot() => {
                debug!(item = %item.id, error = %err, "anti-bot challenge");
                ItemResult::AntiBot
            }
            Err(err) => {
                warn!(item = %item.id, source_id = %item.source_id, error = %err, "item failed");
                ItemResult::Failed
            }
        };

        let (checkpoint, to_flush) = {
            let mut control = ctx.control.lock().await;
            match result {
                ItemResult::Done(assessments) => {
                    let n = assessments.len();
                    for assessment in assessments {
                        let category = match &assessment {
                            Assessment::Assessed { outcome, .. } => outcome.category.clone(),
                            Assessment::Junk { .. } => item.category.clone(),
                        };
                        control.summary.record_assessment(&category, &assessment);
                        if let Assessment::Assessed { outcome, .. } = assessment {
                            control.buffer.push(outcome);
                        }
                    }
                    control.completed.insert(item.id.clone());
                    control.summary.items_completed += 1;
                    control.since_checkpoint += 1;
                    info!(phase = "acquire", item = %item.id, candidates = n, "item processed");
                }
                ItemResult::AntiBot => {
                    control.summary.antibot_events += 1;
                    if let Some(t) = control.throttle.record(std::time::Instant::now()) {
                        log_transition(t, control.throttle.window_len());
                    }
                }
                ItemResult::Failed => control.summary.errors += 1,
            }
            let checkpoint = control.take_checkpoint(ctx.config.checkpoint_every);
            let to_flush = (control.buffer.len() >= ctx.config.flush_every)
                .then(|| std::mem::take(&mut control.buffer));
            (checkpoint, to_flush)
        };

        if let Some((seq, checkpoint)) = checkpoint {
            ctx.writer.save(seq, &checkpoint).await;
        }
        if let Some(outcomes) = to_flush {
            let stats = ctx.flusher.flush(outcomes, &ctx.index).await;
            ctx.control.lock().await.apply_flush(&stats);
        }

        tokio::time::sleep(jittered(delay, ctx.config.jitter)).await;
    }
    session
}
