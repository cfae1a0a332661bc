//! Pipeline orchestration: read sites, locate the day's rows, alert, summarize per channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use adpulse_adapters::{
    select_period_tabs, FixtureSheetSource, GoogleSheetsSource, SheetSource, SheetsCredential,
    SiteConfig, SiteRegistry, SourceContext, SourceReader, TabRef,
};
use adpulse_core::{
    ColumnMapping, DeliveryGroupKey, DeliveryKind, NormalizedRecord, ReportingPeriod, RowLocator,
    TargetDate,
};
use adpulse_storage::{BackoffPolicy, DeliveryLedger, HttpClient, HttpClientConfig};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod aggregate;
pub mod alerts;
pub mod dispatch;

pub use aggregate::{finalize, fold, AggregateTotals, Summary, SummaryError};
pub use alerts::{AlertLevel, RoasLevel};
pub use dispatch::{
    DeliveryError, DeliveryResult, Dispatcher, MemoryNotifier, Notifier, SentMessage,
    WebhookNotifier,
};

pub const CRATE_NAME: &str = "adpulse-sync";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sites_file: PathBuf,
    pub ledger_file: PathBuf,
    pub fixtures_dir: Option<PathBuf>,
    pub utc_offset_hours: i32,
    pub site_delay_min: Duration,
    pub site_delay_max: Duration,
    pub schedule_cron: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub dry_run: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sites_file: PathBuf::from("./sites.yaml"),
            ledger_file: PathBuf::from("./data/processed_records.json"),
            fixtures_dir: None,
            utc_offset_hours: -3,
            site_delay_min: Duration::from_millis(3000),
            site_delay_max: Duration::from_millis(5000),
            schedule_cron: "0 10 */3 * * *".to_string(),
            http_timeout_secs: 20,
            user_agent: "adpulse/0.1".to_string(),
            dry_run: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| std::env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            sites_file: std::env::var("ADPULSE_SITES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.sites_file),
            ledger_file: std::env::var("ADPULSE_LEDGER_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.ledger_file),
            fixtures_dir: std::env::var("ADPULSE_FIXTURES_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            utc_offset_hours: std::env::var("ADPULSE_UTC_OFFSET_HOURS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.utc_offset_hours),
            site_delay_min: parsed("ADPULSE_SITE_DELAY_MIN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.site_delay_min),
            site_delay_max: parsed("ADPULSE_SITE_DELAY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.site_delay_max),
            schedule_cron: std::env::var("ADPULSE_SCHEDULE_CRON")
                .unwrap_or(defaults.schedule_cron),
            http_timeout_secs: parsed("ADPULSE_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("ADPULSE_USER_AGENT").unwrap_or(defaults.user_agent),
            dry_run: std::env::var("ADPULSE_DRY_RUN")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }

    /// Configured offset; out-of-range hours fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn local_now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.utc_offset())
    }

    pub fn local_today(&self) -> NaiveDate {
        self.local_now().date_naive()
    }
}

/// Which sites and which day a run covers. `None` means all sites, today.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub site: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub target_date: String,
    pub sites_processed: usize,
    pub sites_skipped: usize,
    pub sites_without_data: usize,
    pub channels_notified: usize,
    pub alerts_sent: usize,
    pub warnings_sent: usize,
    pub deliveries_failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub site: String,
    pub tabs_read: usize,
    pub groups_delivered: usize,
    pub groups_skipped: usize,
    pub deliveries_failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeaderCell {
    pub index: usize,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteInspection {
    pub site: SiteConfig,
    pub tab: TabRef,
    pub headers: Vec<HeaderCell>,
    pub configured: ColumnMapping,
    pub effective: ColumnMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    AlreadyDelivered,
    Delivered,
    Failed,
}

/// Target date and reporting period for a run. A date carrying a year picks
/// that year; a bare `DD/MM` later in the year than today refers to last year.
pub fn resolve_target(today: NaiveDate, date: Option<&str>) -> (TargetDate, ReportingPeriod) {
    let Some(raw) = date else {
        return (TargetDate::from_date(today), ReportingPeriod::from_date(today));
    };
    let target = TargetDate::parse(raw);
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let dated = ["%d/%m/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|pattern| NaiveDate::parse_from_str(&compact, pattern).ok());

    let period = match (dated, target.day_month()) {
        (Some(date), _) => ReportingPeriod::from_date(date),
        (None, Some(dm)) if (1..=12).contains(&dm.month) => {
            let year = if dm.month > today.month() {
                today.year() - 1
            } else {
                today.year()
            };
            ReportingPeriod::new(dm.month, year)
        }
        _ => ReportingPeriod::from_date(today),
    };
    (target, period)
}

fn pacing_delay(min: Duration, max: Duration) -> Duration {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    if hi.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(lo.as_millis() as u64..=hi.as_millis() as u64);
    Duration::from_millis(ms)
}

fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Latest record per day within one tab, in first-seen order. Rows whose date
/// cell is not a day/month are left out.
fn latest_per_date(records: &[NormalizedRecord]) -> Vec<(String, &NormalizedRecord)> {
    let mut latest: Vec<(String, &NormalizedRecord)> = Vec::new();
    for record in records {
        let Some(raw) = record.date.value.as_deref() else {
            continue;
        };
        let target = TargetDate::parse(raw);
        let usable = target
            .day_month()
            .is_some_and(|dm| (1..=31).contains(&dm.day) && (1..=12).contains(&dm.month));
        if !usable {
            debug!(raw, row = record.row_index, "row without a usable date");
            continue;
        }
        let label = target.label();
        match latest.iter_mut().find(|(l, _)| *l == label) {
            Some(slot) => slot.1 = record,
            None => latest.push((label, record)),
        }
    }
    latest
}

pub struct SyncPipeline {
    config: PipelineConfig,
    registry: SiteRegistry,
    source: Box<dyn SheetSource>,
    dispatcher: Dispatcher,
    ledger: DeliveryLedger,
    locator: RowLocator,
    read_policy: BackoffPolicy,
}

impl SyncPipeline {
    pub fn new(
        config: PipelineConfig,
        registry: SiteRegistry,
        source: Box<dyn SheetSource>,
        notifier: Arc<dyn Notifier>,
        ledger: DeliveryLedger,
    ) -> Self {
        let delivery_policy = BackoffPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.1,
        };
        Self {
            config,
            registry,
            source,
            dispatcher: Dispatcher::new(notifier, delivery_policy),
            ledger,
            locator: RowLocator::default(),
            read_policy: BackoffPolicy::default(),
        }
    }

    /// Registry, sheet source, notifier and ledger as configured.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let registry = SiteRegistry::load(&config.sites_file)
            .await
            .context("loading site registry")?;
        let http = HttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;

        let source: Box<dyn SheetSource> = match &config.fixtures_dir {
            Some(dir) => Box::new(FixtureSheetSource::new(dir)),
            None => Box::new(GoogleSheetsSource::new(
                http.clone(),
                SheetsCredential::from_env(),
            )?),
        };
        let notifier: Arc<dyn Notifier> = if config.dry_run {
            Arc::new(MemoryNotifier::new())
        } else {
            Arc::new(WebhookNotifier::new(http))
        };
        let ledger = DeliveryLedger::open(&config.ledger_file).await;
        info!(
            sites = registry.sites.len(),
            source = source.source_kind(),
            notifier = notifier.name(),
            ledger = %config.ledger_file.display(),
            "pipeline ready"
        );
        Ok(Self::new(config, registry, source, notifier, ledger))
    }

    pub fn with_policies(mut self, read: BackoffPolicy, delivery: BackoffPolicy) -> Self {
        self.read_policy = read;
        self.dispatcher = Dispatcher::new(self.dispatcher.notifier(), delivery);
        self
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    fn reader(&self) -> SourceReader<'_> {
        SourceReader::new(&*self.source, self.read_policy)
    }

    pub async fn run_once(&mut self, options: &RunOptions) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid, options: &RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let ctx = SourceContext::new(run_id);
        let (target, period) = resolve_target(self.config.local_today(), options.date.as_deref());
        info!(
            target_date = %target.label(),
            month = period.month_name(),
            year = period.year,
            "starting run"
        );

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            target_date: target.label(),
            sites_processed: 0,
            sites_skipped: 0,
            sites_without_data: 0,
            channels_notified: 0,
            alerts_sent: 0,
            warnings_sent: 0,
            deliveries_failed: 0,
        };

        let names: Vec<String> = match &options.site {
            Some(site) => vec![site.clone()],
            None => self
                .registry
                .list_site_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        };

        let mut channels: Vec<(String, Vec<SiteConfig>)> = Vec::new();
        for name in &names {
            let site = self.registry.get_site_config(name);
            let destination = match site.destination() {
                Ok(destination) => destination.to_string(),
                Err(err) => {
                    warn!(site = %name, error = %err, "skipping site");
                    summary.sites_skipped += 1;
                    continue;
                }
            };
            match channels.iter_mut().find(|(d, _)| *d == destination) {
                Some((_, sites)) => sites.push(site),
                None => channels.push((destination, vec![site])),
            }
        }

        for (destination, sites) in channels {
            let mut channel_totals = AggregateTotals::default();
            let mut processed = 0usize;
            for (idx, site) in sites.iter().enumerate() {
                if idx > 0 {
                    self.pace().await;
                }
                match self
                    .process_site(&ctx, site, &target, period, &mut summary)
                    .await
                {
                    Ok(totals) => {
                        channel_totals = channel_totals.merge(totals);
                        processed += 1;
                        summary.sites_processed += 1;
                    }
                    Err(err) => {
                        warn!(site = %site.name, error = %format!("{err:#}"), "site skipped this cycle");
                        summary.sites_skipped += 1;
                    }
                }
            }

            if processed == 0 {
                warn!(sites = sites.len(), "no site of this channel was read, summary not sent");
                continue;
            }
            let text = finalize(&channel_totals).render_or_fallback();
            if self.dispatcher.dispatch(&text, &destination).await.is_delivered() {
                summary.channels_notified += 1;
            } else {
                summary.deliveries_failed += 1;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            processed = summary.sites_processed,
            skipped = summary.sites_skipped,
            channels = summary.channels_notified,
            alerts = summary.alerts_sent,
            failed = summary.deliveries_failed,
            "run finished"
        );
        Ok(summary)
    }

    async fn process_site(
        &mut self,
        ctx: &SourceContext,
        site: &SiteConfig,
        target: &TargetDate,
        period: ReportingPeriod,
        summary: &mut RunSummary,
    ) -> Result<AggregateTotals> {
        let location = site.location()?;
        let grids = self
            .reader()
            .read_period(ctx, &location, &site.columns, period)
            .await
            .with_context(|| format!("reading sheet of {}", site.name))?;

        let mut totals = AggregateTotals::default();
        let mut sheet_roas = None;
        for grid in &grids {
            match self.locator.locate(&grid.records, target) {
                Some(record) => {
                    debug!(tab = %grid.tab.name, row = record.row_index, "row located");
                    totals = fold(totals, record);
                    sheet_roas = Some(record.roas_value());
                }
                None => debug!(tab = %grid.tab.name, "no row for target date"),
            }
        }

        let key = DeliveryGroupKey::new(
            site.name.clone(),
            format!("{}/{}", target.label(), period.year),
        );
        match sheet_roas {
            None => {
                summary.sites_without_data += 1;
                self.warn_missing_data(site, target, &key, summary).await;
            }
            Some(roas) => {
                let level = AlertLevel::evaluate(totals.margin_sum);
                info!(
                    site = %site.name,
                    investment = totals.investment,
                    margin = totals.margin_sum,
                    roas,
                    roas_level = RoasLevel::evaluate(roas).emoji(),
                    margin_level = level.emoji(),
                    "site totals"
                );
                if level.is_critical() {
                    self.raise_critical(site, totals.margin_sum, &key, summary)
                        .await;
                }
            }
        }
        Ok(totals)
    }

    async fn raise_critical(
        &mut self,
        site: &SiteConfig,
        margin: f64,
        key: &DeliveryGroupKey,
        summary: &mut RunSummary,
    ) {
        let destination = match self.registry.alert_destination() {
            Ok(destination) => destination.to_string(),
            Err(err) => {
                error!(site = %site.name, margin, error = %err, "critical margin not reported");
                return;
            }
        };
        let text = alerts::critical_alert_message(&site.display_name, margin);
        let record = payload(json!({
            "site": site.name,
            "date": key.date,
            "margin": margin,
            "kind": "critical_alert",
        }));
        match self
            .deliver_once(key, DeliveryKind::CriticalAlert, &destination, &text, record)
            .await
        {
            DeliveryOutcome::Delivered => summary.alerts_sent += 1,
            DeliveryOutcome::Failed => summary.deliveries_failed += 1,
            DeliveryOutcome::AlreadyDelivered => {}
        }
    }

    async fn warn_missing_data(
        &mut self,
        site: &SiteConfig,
        target: &TargetDate,
        key: &DeliveryGroupKey,
        summary: &mut RunSummary,
    ) {
        let destination = match self.registry.missing_data_destination() {
            Ok(destination) => destination.to_string(),
            Err(err) => {
                warn!(site = %site.name, error = %err, "missing data not reported");
                return;
            }
        };
        let text = alerts::missing_data_message(&site.display_name, &target.label());
        let record = payload(json!({
            "site": site.name,
            "date": key.date,
            "kind": "missing_data",
        }));
        match self
            .deliver_once(key, DeliveryKind::MissingData, &destination, &text, record)
            .await
        {
            DeliveryOutcome::Delivered => summary.warnings_sent += 1,
            DeliveryOutcome::Failed => summary.deliveries_failed += 1,
            DeliveryOutcome::AlreadyDelivered => {}
        }
    }

    /// Sends unless the ledger already holds `key`; records it only on success.
    async fn deliver_once(
        &mut self,
        key: &DeliveryGroupKey,
        kind: DeliveryKind,
        destination: &str,
        text: &str,
        record: Map<String, Value>,
    ) -> DeliveryOutcome {
        if self.ledger.is_delivered(key, kind) {
            debug!(group = %key.group_title(), id = %key.record_id(kind), "already delivered");
            return DeliveryOutcome::AlreadyDelivered;
        }
        if !self.dispatcher.dispatch(text, destination).await.is_delivered() {
            return DeliveryOutcome::Failed;
        }
        if let Err(err) = self.ledger.mark_delivered(key, kind, record).await {
            error!(error = %format!("{err:#}"), id = %key.record_id(kind), "delivery not recorded in ledger");
        }
        DeliveryOutcome::Delivered
    }

    async fn pace(&self) {
        let delay = pacing_delay(self.config.site_delay_min, self.config.site_delay_max);
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "pausing before next site");
            tokio::time::sleep(delay).await;
        }
    }

    /// Replays every tab of one site, one update per (site, tab, day) not yet delivered.
    pub async fn backfill(&mut self, site_name: &str) -> Result<BackfillSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("backfill", %run_id, site = site_name);
        self.backfill_inner(run_id, site_name).instrument(span).await
    }

    async fn backfill_inner(&mut self, run_id: Uuid, site_name: &str) -> Result<BackfillSummary> {
        let site = self.registry.get_site_config(site_name);
        let location = site.location()?;
        let destination = site.destination()?.to_string();
        let ctx = SourceContext::new(run_id);
        let grids = self
            .reader()
            .read_all(&ctx, &location, &site.columns)
            .await
            .with_context(|| format!("reading sheet of {}", site.name))?;

        let mut summary = BackfillSummary {
            run_id,
            site: site.name.clone(),
            tabs_read: grids.len(),
            groups_delivered: 0,
            groups_skipped: 0,
            deliveries_failed: 0,
        };

        for grid in &grids {
            for (date, record) in latest_per_date(&grid.records) {
                let key =
                    DeliveryGroupKey::in_tab(site.name.clone(), grid.tab.name.clone(), date.clone());
                let text = alerts::update_message(&site.display_name, &grid.tab.name, &date, record);
                let number = |field: &adpulse_core::Field<adpulse_core::CanonicalNumber>| {
                    field.value.as_ref().map(|n| n.source.clone())
                };
                let entry = payload(json!({
                    "site": site.name,
                    "date": date,
                    "row": record.row_index,
                    "investment": number(&record.investment),
                    "revenue": record.revenue.value.as_ref().map(|r| r.number.source.clone()),
                    "roas": number(&record.roas),
                    "margin": number(&record.margin),
                }));
                match self
                    .deliver_once(&key, DeliveryKind::Update, &destination, &text, entry)
                    .await
                {
                    DeliveryOutcome::Delivered => summary.groups_delivered += 1,
                    DeliveryOutcome::AlreadyDelivered => summary.groups_skipped += 1,
                    DeliveryOutcome::Failed => summary.deliveries_failed += 1,
                }
            }
        }

        info!(
            tabs = summary.tabs_read,
            delivered = summary.groups_delivered,
            skipped = summary.groups_skipped,
            failed = summary.deliveries_failed,
            "backfill finished"
        );
        Ok(summary)
    }

    /// Header cells of the site's period tab next to the configured column indices.
    pub async fn inspect(
        &self,
        site_id: u32,
        period: Option<ReportingPeriod>,
    ) -> Result<SiteInspection> {
        let site = self
            .registry
            .get_site_by_id(site_id)
            .ok_or_else(|| anyhow!("no site with id {site_id}"))?;
        let location = site.location()?;
        let ctx = SourceContext::new(Uuid::new_v4());
        let reader = self.reader();

        let tabs = reader.list_tabs(&ctx, &location).await?;
        let period = period.unwrap_or_else(|| ReportingPeriod::from_date(self.config.local_today()));
        let tab = select_period_tabs(&tabs, period)
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("{} has no tabs", site.name))?;
        let grid = reader.read_tab(&ctx, &location, &tab, &site.columns).await?;

        Ok(SiteInspection {
            headers: grid
                .header_indices()
                .into_iter()
                .map(|(index, label)| HeaderCell {
                    index,
                    label: label.to_string(),
                })
                .collect(),
            configured: site.columns,
            effective: grid.mapping,
            tab,
            site,
        })
    }

    pub async fn list_tabs(&self, site_name: &str) -> Result<Vec<TabRef>> {
        let site = self.registry.get_site_config(site_name);
        let location = site.location()?;
        let ctx = SourceContext::new(Uuid::new_v4());
        Ok(self.reader().list_tabs(&ctx, &location).await?)
    }
}

pub async fn run_once_with_config(config: PipelineConfig, options: &RunOptions) -> Result<RunSummary> {
    let mut pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once(options).await
}

pub async fn run_once_from_env(options: &RunOptions) -> Result<RunSummary> {
    run_once_with_config(PipelineConfig::from_env(), options).await
}

/// Cron job running a full pass per tick. Runs never overlap.
pub async fn build_scheduler(config: PipelineConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = Arc::new(Mutex::new(()));
    let cron = config.schedule_cron.clone();

    let job = Job::new_async(&cron, move |_uuid, _l| {
        let config = config.clone();
        let gate = gate.clone();
        Box::pin(async move {
            let _running = gate.lock().await;
            match run_once_with_config(config, &RunOptions::default()).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    processed = summary.sites_processed,
                    channels = summary.channels_notified,
                    "scheduled run complete"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
