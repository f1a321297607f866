//! Ingestion run coordination: registry loading, fan-out fetch, and fan-in upsert.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use itrack_adapters::{
    adapter_for_source, AdapterContext, AdapterError, CsvFileAdapter, ListingTarget, Normalizer,
    RecordResult, SourceAdapter, SourceConfig,
};
use itrack_core::UpsertOutcome;
use itrack_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, Store};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod enrich;
pub mod identity;
pub mod lease;
pub mod reminders;
pub mod schedule;
pub mod upsert;

pub use enrich::{EnrichmentHook, NoopEnrichmentHook, YamlTagRules};
pub use identity::{identity_hash, IdentityPolicy, UrlLessIdentity};
pub use lease::{RunLease, INGESTION_LEASE};
pub use reminders::{
    send_deadline_reminders, LogReminderSender, ReminderDigest, ReminderSender, ReminderSummary,
};
pub use schedule::{build_scheduler, run_scheduler_until_shutdown};
pub use upsert::Upserter;

pub const CRATE_NAME: &str = "itrack-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    /// Reads `sources.yaml` under `root`. Relative CSV paths resolve against `root`.
    pub async fn load(root: &Path) -> Result<Self> {
        let path = root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let mut registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        for source in &mut registry.sources {
            if let Some(file) = source.path.as_mut() {
                if file.is_relative() {
                    *file = root.join(&*file);
                }
            }
        }
        Ok(registry)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Adapters for the enabled sources, plus failed summaries for those that have none.
    pub fn build_adapters(&self) -> (Vec<Box<dyn SourceAdapter>>, Vec<AdapterSummary>) {
        let mut adapters = Vec::new();
        let mut unavailable = Vec::new();
        for source in self.enabled() {
            match adapter_for_source(source) {
                Some(adapter) => adapters.push(adapter),
                None => {
                    let error = format!("no adapter for source kind {:?}", source.kind);
                    warn!(source_id = %source.source_id, %error, "source skipped");
                    unavailable.push(AdapterSummary {
                        source_id: source.source_id.clone(),
                        source_name: source.display_name.clone(),
                        status: AdapterStatus::FetchFailed { error },
                        target_failures: Vec::new(),
                        counts: IngestCounts::default(),
                    });
                }
            }
        }
        (adapters, unavailable)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_retries: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub reminder_cron: String,
    pub run_lease_secs: i64,
    pub url_less_identity: UrlLessIdentity,
    pub reminder_days_before: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            user_agent: "itrack-bot/0.1".to_string(),
            http_timeout_secs: 20,
            fetch_retries: 0,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            reminder_cron: "0 0 0 * * *".to_string(),
            run_lease_secs: 3600,
            url_less_identity: UrlLessIdentity::Merge,
            reminder_days_before: reminders::DEFAULT_REMINDER_DAYS_BEFORE,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, "ignoring unparseable setting");
                default
            }
        },
        Err(_) => default,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("ITRACK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            user_agent: std::env::var("ITRACK_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("ITRACK_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            fetch_retries: env_parse("ITRACK_FETCH_RETRIES", defaults.fetch_retries),
            scheduler_enabled: std::env::var("ITRACK_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            reminder_cron: std::env::var("REMINDER_CRON").unwrap_or(defaults.reminder_cron),
            run_lease_secs: env_parse("ITRACK_RUN_LEASE_SECS", defaults.run_lease_secs),
            url_less_identity: env_parse("ITRACK_URL_LESS_IDENTITY", defaults.url_less_identity),
            reminder_days_before: env_parse("REMINDER_DAYS_BEFORE", defaults.reminder_days_before),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestCounts {
    pub fetched: usize,
    pub rejected: usize,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errored: usize,
}

impl IngestCounts {
    pub fn record(&mut self, outcome: &UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created { .. } => self.created += 1,
            UpsertOutcome::Updated { .. } => self.updated += 1,
            UpsertOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn add(&mut self, other: &Self) {
        self.fetched += other.fetched;
        self.rejected += other.rejected;
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errored += other.errored;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdapterStatus {
    Succeeded,
    FetchFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterSummary {
    pub source_id: String,
    pub source_name: String,
    #[serde(flatten)]
    pub status: AdapterStatus,
    pub target_failures: Vec<TargetFailure>,
    pub counts: IngestCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    SkippedLeaseHeld,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub adapters: Vec<AdapterSummary>,
    pub totals: IngestCounts,
}

impl SyncRunSummary {
    fn skipped(now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            status: RunStatus::SkippedLeaseHeld,
            adapters: Vec::new(),
            totals: IngestCounts::default(),
        }
    }

    pub fn succeeded_adapters(&self) -> usize {
        self.adapters
            .iter()
            .filter(|a| a.status == AdapterStatus::Succeeded)
            .count()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    store: Arc<dyn Store>,
    upserter: Upserter<dyn Store>,
    normalizer: Normalizer,
    identity: IdentityPolicy,
    enrichment: Box<dyn EnrichmentHook>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn Store>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: StdDuration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.fetch_retries,
                ..BackoffPolicy::default()
            },
            ..Default::default()
        })?;
        Ok(Self {
            identity: IdentityPolicy::new(config.url_less_identity),
            upserter: Upserter::new(Arc::clone(&store)),
            config,
            http,
            store,
            normalizer: Normalizer::default(),
            enrichment: Box::<NoopEnrichmentHook>::default(),
        })
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// `None` when another run holds the ingestion lease.
    pub async fn acquire_lease(&self) -> Result<Option<RunLease>> {
        let ttl = Duration::seconds(self.config.run_lease_secs.max(1));
        RunLease::acquire(self.store.as_ref(), INGESTION_LEASE, ttl, Utc::now())
            .await
            .context("acquiring ingestion lease")
    }

    /// Runs every enabled source from `sources.yaml` unless another run is in flight.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let Some(lease) = self.acquire_lease().await? else {
            info!("ingestion lease held by another run; skipping");
            return Ok(SyncRunSummary::skipped(Utc::now()));
        };
        self.run_with_lease(lease).await
    }

    /// Runs the registry under an already-acquired lease and releases it afterwards.
    pub async fn run_with_lease(&self, lease: RunLease) -> Result<SyncRunSummary> {
        let result = match SourceRegistry::load(&self.config.workspace_root).await {
            Ok(registry) => {
                let (adapters, unavailable) = registry.build_adapters();
                Ok(self.execute(lease.run_id(), adapters, unavailable).await)
            }
            Err(err) => Err(err),
        };
        lease.release(self.store.as_ref()).await;
        result
    }

    /// One-off CSV import, guarded by the same lease as scheduled runs.
    pub async fn import_csv(&self, path: &Path) -> Result<SyncRunSummary> {
        let Some(lease) = self.acquire_lease().await? else {
            info!("ingestion lease held by another run; skipping import");
            return Ok(SyncRunSummary::skipped(Utc::now()));
        };
        let adapter = CsvFileAdapter::new("csv-import", "CSV", path);
        let summary = self
            .execute(lease.run_id(), vec![Box::new(adapter)], Vec::new())
            .await;
        lease.release(self.store.as_ref()).await;
        Ok(summary)
    }

    /// Fans out over `adapters` concurrently; failures stay inside each adapter's summary.
    pub async fn execute(
        &self,
        run_id: Uuid,
        adapters: Vec<Box<dyn SourceAdapter>>,
        unavailable: Vec<AdapterSummary>,
    ) -> SyncRunSummary {
        let started_at = Utc::now();
        let ctx = AdapterContext { run_id, started_at };
        info!(%run_id, adapters = adapters.len(), "ingestion run started");

        let mut summaries = join_all(
            adapters
                .iter()
                .map(|adapter| self.run_adapter(&ctx, adapter.as_ref())),
        )
        .await;
        summaries.extend(unavailable);

        let mut totals = IngestCounts::default();
        for summary in &summaries {
            totals.add(&summary.counts);
        }
        let finished_at = Utc::now();
        info!(
            %run_id,
            fetched = totals.fetched,
            rejected = totals.rejected,
            created = totals.created,
            updated = totals.updated,
            skipped = totals.skipped,
            errored = totals.errored,
            "ingestion run finished"
        );
        SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            status: RunStatus::Completed,
            adapters: summaries,
            totals,
        }
    }

    async fn run_adapter(&self, ctx: &AdapterContext, adapter: &dyn SourceAdapter) -> AdapterSummary {
        let span = info_span!("adapter", run_id = %ctx.run_id, source_id = adapter.source_id());
        async {
            let targets = adapter.listing_targets();
            let mut counts = IngestCounts::default();
            let mut target_failures = Vec::new();
            let mut pages = 0usize;

            for target in &targets {
                let records = match self.fetch_records(ctx, adapter, target).await {
                    Ok(records) => records,
                    Err(err) => {
                        warn!(target = %target.label, error = %err, "target failed");
                        target_failures.push(TargetFailure {
                            target: target.label.clone(),
                            error: err.to_string(),
                        });
                        continue;
                    }
                };
                pages += 1;
                for record in records {
                    self.ingest_record(adapter.source_name(), record, &mut counts)
                        .await;
                }
            }

            let status = if pages == 0 && !target_failures.is_empty() {
                let error = target_failures
                    .iter()
                    .map(|f| f.error.as_str())
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(%error, "adapter fetch failed");
                AdapterStatus::FetchFailed { error }
            } else {
                info!(
                    fetched = counts.fetched,
                    created = counts.created,
                    updated = counts.updated,
                    "adapter finished"
                );
                AdapterStatus::Succeeded
            };

            AdapterSummary {
                source_id: adapter.source_id().to_string(),
                source_name: adapter.source_name().to_string(),
                status,
                target_failures,
                counts,
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_records(
        &self,
        ctx: &AdapterContext,
        adapter: &dyn SourceAdapter,
        target: &ListingTarget,
    ) -> Result<Vec<RecordResult>, AdapterError> {
        let page = adapter.fetch_target(&self.http, ctx, target).await?;
        adapter.parse_listing(&page)
    }

    async fn ingest_record(&self, source_name: &str, record: RecordResult, counts: &mut IngestCounts) {
        counts.fetched += 1;
        let raw = match record {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "record failed to parse");
                counts.errored += 1;
                return;
            }
        };
        let mut draft = match self.normalizer.normalize(raw, source_name) {
            Ok(draft) => draft,
            Err(reason) => {
                debug!(reason = reason.as_str(), "record rejected");
                counts.rejected += 1;
                return;
            }
        };
        self.enrichment.apply(&mut draft);
        let identified = match self.identity.identify(draft) {
            Ok(identified) => identified,
            Err(_) => {
                debug!(reason = "content_only_identity", "record rejected");
                counts.rejected += 1;
                return;
            }
        };
        match self.upserter.upsert(&identified, Utc::now()).await {
            Ok(outcome) => counts.record(&outcome),
            Err(err) => {
                warn!(title = %identified.draft.title, error = %err, "upsert failed");
                counts.errored += 1;
            }
        }
    }
}

/// Builds a pipeline from the environment with the workspace tag rules, and runs it once.
pub async fn run_sync_once_from_env(store: Arc<dyn Store>) -> Result<SyncRunSummary> {
    let pipeline = pipeline_from_env(store)?;
    pipeline.run_once().await
}

/// Pipeline configured from the environment. Missing tag rules are logged, not fatal.
pub fn pipeline_from_env(store: Arc<dyn Store>) -> Result<SyncPipeline> {
    let config = SyncConfig::from_env();
    let enrichment: Box<dyn EnrichmentHook> =
        match YamlTagRules::from_workspace_root(&config.workspace_root) {
            Ok(rules) => Box::new(rules),
            Err(err) => {
                warn!(error = %err, "tag rules unavailable; enrichment disabled");
                Box::<NoopEnrichmentHook>::default()
            }
        };
    Ok(SyncPipeline::new(config, store)?.with_enrichment(enrichment))
}
