use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use soundcat_adapters::{reader_for_source, HttpSessionFactory, SessionFactory, SourceReader};
use soundcat_core::{MatchCandidate, ReviewPayload, ReviewTask, ReviewTaskType};
use soundcat_match::{
    audit_misclassified, CatalogIndex, DecisionPolicy, GuardRules, Misclassification,
    Reconciler, RuleTableGuards,
};
use soundcat_storage::{
    select_all_products, CatalogBatch, CatalogStore, CheckpointStore, FileCheckpointStore,
    ProductFilter,
};
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{SourceRegistry, SyncConfig};
use crate::flush::FlushExecutor;
use crate::pool::{PoolConfig, WorkerPool};
use crate::summary::{write_reports, RunSummary};

const PRODUCT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Continue from the saved checkpoint instead of starting over.
    pub resume: bool,
    pub limit: Option<usize>,
    pub only_source: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncRunReport {
    pub summary: RunSummary,
    pub reports_dir: PathBuf,
    pub finished: bool,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn CatalogStore>,
    sessions: Arc<dyn SessionFactory>,
    rules: GuardRules,
    policy: DecisionPolicy,
    pool: PoolConfig,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn CatalogStore>) -> Result<Self> {
        config.validate()?;
        let rules = GuardRules::from_workspace_root(&config.workspace_root)?;
        let policy = DecisionPolicy::default();
        policy.validate()?;
        let sessions = Arc::new(HttpSessionFactory::new(config.http_client()));
        let pool = PoolConfig {
            workers: config.workers,
            base_delay: config.base_delay,
            dry_run: config.dry_run,
            ..PoolConfig::default()
        };
        Ok(Self {
            config,
            store,
            sessions,
            rules,
            policy,
            pool,
        })
    }

    pub fn with_sessions(mut self, sessions: Arc<dyn SessionFactory>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    async fn load_index(&self) -> Result<CatalogIndex> {
        let products =
            select_all_products(self.store.as_ref(), &ProductFilter::default(), PRODUCT_PAGE_SIZE)
                .await
                .context("loading canonical products")?;
        Ok(CatalogIndex::build(products.iter().map(MatchCandidate::from)))
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<SyncRunReport> {
        let registry = SourceRegistry::load(&self.config.workspace_root)?;
        let mut readers: Vec<Arc<dyn SourceReader>> = Vec::new();
        for source in registry.enabled() {
            if options
                .only_source
                .as_deref()
                .is_some_and(|only| only != source.source_id)
            {
                continue;
            }
            let reader = reader_for_source(&source.source_id, &source.reader, &self.config.workspace_root)
                .with_context(|| format!("building reader for {}", source.source_id))?;
            readers.push(reader);
        }

        let mut items = registry.work_items(options.only_source.as_deref());
        if let Some(limit) = options.limit {
            items.truncate(limit);
        }

        let index = self.load_index().await?;
        info!(
            sources = readers.len(),
            items = items.len(),
            products = index.len(),
            "sync inputs loaded"
        );

        let checkpoints = Arc::new(FileCheckpointStore::new(self.config.checkpoint_path.clone()));
        let resume_ids = if options.resume {
            match checkpoints.load().await {
                Ok(Some(checkpoint)) => checkpoint.completed_ids,
                Ok(None) => BTreeSet::new(),
                Err(err) => {
                    warn!(phase = "checkpoint", error = %err, "unreadable checkpoint; starting over");
                    BTreeSet::new()
                }
            }
        } else {
            BTreeSet::new()
        };

        let reconciler = Reconciler::new(self.policy, &self.rules)
            .with_create_products(self.config.create_products);
        let pool = WorkerPool::new(
            self.pool.clone(),
            readers,
            self.sessions.clone(),
            Arc::new(reconciler),
            Arc::new(RwLock::new(index)),
            Arc::new(FlushExecutor::new(self.store.clone(), self.config.dry_run)),
            checkpoints,
        );
        let report = pool.run(items, resume_ids, self.config.deadline).await?;

        let reports_dir = write_reports(&self.config.reports_dir(), &report.summary).await?;
        info!(reports_dir = %reports_dir.display(), "reports written");
        Ok(SyncRunReport {
            summary: report.summary,
            reports_dir,
            finished: report.finished,
        })
    }

    /// Finds stored products whose name puts them in another category.
    /// With `emit_tasks` each finding becomes an open category-audit task.
    pub async fn audit(&self, emit_tasks: bool) -> Result<Vec<Misclassification>> {
        let products =
            select_all_products(self.store.as_ref(), &ProductFilter::default(), PRODUCT_PAGE_SIZE)
                .await
                .context("loading canonical products")?;
        let guards = RuleTableGuards::new(&self.rules);
        let findings = audit_misclassified(&products, &guards);
        info!(phase = "audit", products = products.len(), findings = findings.len(), "category audit complete");

        if emit_tasks && !findings.is_empty() {
            let tasks: Vec<ReviewTask> = findings
                .iter()
                .map(|f| {
                    ReviewTask::open(
                        ReviewTaskType::CategoryAudit,
                        f.product_id.clone(),
                        None,
                        ReviewPayload {
                            listing_title: f.name.clone(),
                            current_product_id: Some(f.product_id.clone()),
                            detected_category: Some(f.detected_category.clone()),
                            ..ReviewPayload::default()
                        },
                        format!(
                            "name suggests {} but recorded as {}",
                            f.detected_category, f.recorded_category
                        ),
                    )
                })
                .collect();
            if self.config.dry_run {
                info!(phase = "audit", tasks = tasks.len(), "dry run; tasks not written");
            } else {
                let written = self
                    .store
                    .upsert(CatalogBatch::ReviewTasks(tasks))
                    .await
                    .context("writing category audit tasks")?;
                info!(phase = "audit", written, "category audit tasks written");
            }
        }
        Ok(findings)
    }

    /// Registers the periodic refresh job; each trigger resumes from the checkpoint.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.refresh_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let options = RunOptions {
                    resume: true,
                    ..RunOptions::default()
                };
                match pipeline.run_once(&options).await {
                    Ok(report) => info!(
                        run_id = %report.summary.run_id,
                        finished = report.finished,
                        "scheduled refresh complete"
                    ),
                    Err(err) => error!(error = %err, "scheduled refresh failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}
