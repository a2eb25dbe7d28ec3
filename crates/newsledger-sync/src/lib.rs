//! Per-source ledger runs: canonicalize, delta against the source master,
//! enrich, merge into the source master, then into the unified master.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use newsledger_core::CanonicalRecord;
use newsledger_mapping::{load_raw_batch, MappedBatch, Mapper, MappingTable, RawRecord};
use newsledger_storage::{BackoffPolicy, LockPolicy, MasterKeys, MasterStore, MergeReport};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsledger-sync";

pub const UNIFIED_MASTER_FILE: &str = "master_news.csv";

const DEFAULT_TITLE_SIMILARITY: f64 = 0.9;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub rss_url: Option<String>,
    /// Expanded raw batch for this source, relative to the workspace root.
    #[serde(default)]
    pub raw_input: Option<PathBuf>,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn find(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub mapping_path: PathBuf,
    pub sources_path: PathBuf,
    pub reports_dir: PathBuf,
    pub lock_retries: usize,
    pub lock_stale_secs: u64,
    pub json_mirror: bool,
    pub scheduler_enabled: bool,
    pub title_similarity: f64,
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

impl LedgerConfig {
    /// Defaults rooted at `root`: `data/`, `config/mapping.yaml`, `config/sources.yaml`, `reports/`.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join("data"),
            mapping_path: root.join("config").join("mapping.yaml"),
            sources_path: root.join("config").join("sources.yaml"),
            reports_dir: root.join("reports"),
            lock_retries: BackoffPolicy::default().max_retries,
            lock_stale_secs: LockPolicy::default().stale_after.as_secs(),
            json_mirror: false,
            scheduler_enabled: false,
            title_similarity: DEFAULT_TITLE_SIMILARITY,
            workspace_root: root,
        }
    }

    pub fn from_env() -> Self {
        let root = std::env::var("NEWSLEDGER_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let defaults = Self::for_root(root);
        let path_var = |name: &str, fallback: PathBuf| {
            std::env::var(name).map(PathBuf::from).unwrap_or(fallback)
        };
        Self {
            data_dir: path_var("NEWSLEDGER_DATA_DIR", defaults.data_dir.clone()),
            mapping_path: path_var("NEWSLEDGER_MAPPING", defaults.mapping_path.clone()),
            sources_path: path_var("NEWSLEDGER_SOURCES", defaults.sources_path.clone()),
            reports_dir: path_var("NEWSLEDGER_REPORTS_DIR", defaults.reports_dir.clone()),
            lock_retries: std::env::var("NEWSLEDGER_LOCK_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lock_retries),
            lock_stale_secs: std::env::var("NEWSLEDGER_LOCK_STALE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.lock_stale_secs),
            json_mirror: env_flag("NEWSLEDGER_JSON_MIRROR").unwrap_or(defaults.json_mirror),
            scheduler_enabled: env_flag("NEWSLEDGER_SCHEDULER_ENABLED")
                .unwrap_or(defaults.scheduler_enabled),
            ..defaults
        }
    }

    pub fn master_dir(&self) -> PathBuf {
        self.data_dir.join("master")
    }

    pub fn source_master_path(&self, source_id: &str) -> PathBuf {
        self.master_dir().join(format!("master_{source_id}.csv"))
    }

    pub fn unified_master_path(&self) -> PathBuf {
        self.master_dir().join(UNIFIED_MASTER_FILE)
    }

    pub fn raw_input_path(&self, source: &SourceConfig) -> PathBuf {
        match &source.raw_input {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.workspace_root.join(path),
            None => self
                .data_dir
                .join("raw")
                .join(&source.source_id)
                .join(format!("{}_items.csv", source.source_id)),
        }
    }

    pub fn lock_policy(&self) -> Result<LockPolicy> {
        let policy = LockPolicy {
            backoff: BackoffPolicy {
                max_retries: self.lock_retries,
                ..BackoffPolicy::default()
            },
            stale_after: Duration::from_secs(self.lock_stale_secs),
        };
        policy
            .validate()
            .context("NEWSLEDGER_LOCK_STALE_SECS must be at least 1")?;
        Ok(policy)
    }
}

/// Batch rows that share neither `id` nor `guid` with the source master.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub records: Vec<CanonicalRecord>,
    pub already_present: usize,
}

pub fn compute_delta(batch: Vec<CanonicalRecord>, master: &MasterKeys) -> Delta {
    let (present, records): (Vec<_>, Vec<_>) = batch
        .into_iter()
        .partition(|r| master.contains(r));
    Delta {
        records,
        already_present: present.len(),
    }
}

/// External enrichment boundary. Failures are soft: the caller keeps the input record.
pub trait EnrichmentHook: Send + Sync {
    fn enrich(&self, record: &CanonicalRecord) -> Result<CanonicalRecord>;
}

#[derive(Default)]
pub struct NoopEnrichment;

impl EnrichmentHook for NoopEnrichment {
    fn enrich(&self, record: &CanonicalRecord) -> Result<CanonicalRecord> {
        Ok(record.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TagRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<TagRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct TagRule {
    tag: String,
    contains_any: Vec<String>,
}

/// Fills an empty `tags` column from keyword rules over title and description.
pub struct KeywordTagEnrichment {
    rules: Vec<TagRule>,
}

impl KeywordTagEnrichment {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: TagRulesFile = serde_yaml::from_str(text)?;
        Ok(Self { rules: file.rules })
    }
}

impl EnrichmentHook for KeywordTagEnrichment {
    fn enrich(&self, record: &CanonicalRecord) -> Result<CanonicalRecord> {
        let mut enriched = record.clone();
        if enriched.tags.is_some() {
            return Ok(enriched);
        }
        let combined = format!(
            "{} {}",
            record.title(),
            record.description.as_deref().unwrap_or_default()
        )
        .to_lowercase();

        let mut tags: Vec<&str> = Vec::new();
        for rule in &self.rules {
            if rule
                .contains_any
                .iter()
                .any(|needle| combined.contains(&needle.to_lowercase()))
                && !tags.contains(&rule.tag.as_str())
            {
                tags.push(&rule.tag);
            }
        }
        if !tags.is_empty() {
            enriched.tags = Some(tags.join(";"));
        }
        Ok(enriched)
    }
}

/// Runs the hook over every record; returns the records and the soft-failure count.
pub fn apply_enrichment(
    hook: &dyn EnrichmentHook,
    records: Vec<CanonicalRecord>,
) -> (Vec<CanonicalRecord>, usize) {
    let mut failures = 0usize;
    let enriched = records
        .into_iter()
        .map(|record| match hook.enrich(&record) {
            Ok(out) if out.same_identity(&record) => out,
            Ok(_) => {
                warn!(id = record.id(), "enrichment changed record identity; keeping original");
                failures += 1;
                record
            }
            Err(err) => {
                warn!(id = record.id(), error = %err, "enrichment failed; keeping original");
                failures += 1;
                record
            }
        })
        .collect();
    (enriched, failures)
}

/// Same source and `pubDate`, different `id`, near-identical titles.
///
/// Identity is never recomputed, so a corrected headline lands as a second
/// article; these pairs are reported for an operator and never merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TitleCorrectionCandidate {
    pub source: String,
    pub pub_date: String,
    pub id_a: String,
    pub id_b: String,
    pub title_a: String,
    pub title_b: String,
    pub similarity: f64,
}

fn normalize_title(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn title_correction_candidates(
    records: &[CanonicalRecord],
    threshold: f64,
) -> Vec<TitleCorrectionCandidate> {
    let mut groups: BTreeMap<(&str, &str), Vec<&CanonicalRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry((record.source(), record.pub_date()))
            .or_default()
            .push(record);
    }

    let mut out = Vec::new();
    for ((source, pub_date), mut members) in groups {
        members.sort_by(|a, b| a.id().cmp(b.id()));
        for i in 0..members.len() {
            for j in (i + 1)..members.len() {
                let (a, b) = (members[i], members[j]);
                let similarity = jaro_winkler(&normalize_title(a.title()), &normalize_title(b.title()));
                if similarity >= threshold {
                    out.push(TitleCorrectionCandidate {
                        source: source.to_string(),
                        pub_date: pub_date.to_string(),
                        id_a: a.id().to_string(),
                        id_b: b.id().to_string(),
                        title_a: a.title().to_string(),
                        title_b: b.title().to_string(),
                        similarity,
                    });
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_rows: usize,
    pub skipped_rows: usize,
    pub malformed_timestamps: usize,
    pub unmappable_rows: usize,
    pub canonical_rows: usize,
    pub delta_rows: usize,
    pub already_present: usize,
    pub enrichment_failures: usize,
    pub source_master: MergeReport,
    pub unified_master: MergeReport,
    pub title_correction_candidates: Vec<TitleCorrectionCandidate>,
}

#[derive(Debug, Default)]
pub struct RunAllSummary {
    pub runs: Vec<SourceRunSummary>,
    pub failures: Vec<(String, anyhow::Error)>,
}

pub struct LedgerPipeline {
    config: LedgerConfig,
    mapper: Mapper,
    enrichment: Box<dyn EnrichmentHook>,
}

impl LedgerPipeline {
    pub fn new(config: LedgerConfig, mapper: Mapper) -> Self {
        Self {
            config,
            mapper,
            enrichment: Box::<NoopEnrichment>::default(),
        }
    }

    /// Loads the mapping table named by the config. A missing table is fatal.
    pub fn from_config(config: LedgerConfig) -> Result<Self> {
        let table = MappingTable::load(&config.mapping_path)?;
        Ok(Self::new(config, Mapper::new(table)))
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn source_master(&self, source_id: &str) -> Result<MasterStore> {
        Ok(MasterStore::new(self.config.source_master_path(source_id))
            .with_lock_policy(self.config.lock_policy()?)
            .with_json_mirror(self.config.json_mirror))
    }

    pub fn unified_master(&self) -> Result<MasterStore> {
        Ok(MasterStore::new(self.config.unified_master_path())
            .with_lock_policy(self.config.lock_policy()?)
            .with_json_mirror(self.config.json_mirror))
    }

    /// Maps the raw rows and diffs them against the source master without writing anything.
    pub async fn compute_source_delta(
        &self,
        source_id: &str,
        raw_rows: &[RawRecord],
    ) -> Result<(MappedBatch, Delta)> {
        let mut mapped = self
            .mapper
            .map_batch(raw_rows, source_id)
            .with_context(|| format!("canonicalizing batch for {source_id}"))?;
        for skipped in &mapped.skipped {
            warn!(source_id, row = skipped.row, reason = %skipped.reason, "skipping row");
        }

        let master = self.source_master(source_id)?;
        let master_keys = master
            .load_keys()
            .await
            .with_context(|| format!("reading {}", master.path().display()))?;
        let delta = compute_delta(std::mem::take(&mut mapped.records), &master_keys);
        info!(
            source_id,
            input_rows = mapped.input_rows,
            skipped = mapped.skipped_count(),
            delta_rows = delta.records.len(),
            already_present = delta.already_present,
            "delta computed"
        );
        Ok((mapped, delta))
    }

    pub async fn run_source(&self, source_id: &str, raw_rows: &[RawRecord]) -> Result<SourceRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("source_run", %run_id, source_id);
        self.run_source_inner(run_id, source_id, raw_rows)
            .instrument(span)
            .await
    }

    pub async fn run_source_from_path(&self, source_id: &str, input: &Path) -> Result<SourceRunSummary> {
        let raw_rows = load_raw_batch(input)?;
        self.run_source(source_id, &raw_rows).await
    }

    async fn run_source_inner(
        &self,
        run_id: Uuid,
        source_id: &str,
        raw_rows: &[RawRecord],
    ) -> Result<SourceRunSummary> {
        let started_at = Utc::now();
        let (mapped, delta) = self.compute_source_delta(source_id, raw_rows).await?;

        let unified = self.unified_master()?;
        // a corrupt unified master must abort before the source master is touched
        unified
            .load()
            .await
            .with_context(|| format!("reading {}", unified.path().display()))?;

        let canonical_rows = delta.records.len() + delta.already_present;
        let delta_rows = delta.records.len();

        let (enriched, enrichment_failures) = apply_enrichment(self.enrichment.as_ref(), delta.records);

        let master = self.source_master(source_id)?;
        let source_report = master
            .merge(enriched)
            .await
            .with_context(|| format!("merging into {}", master.path().display()))?;

        let unified_report = unified
            .merge_from_master(&master)
            .await
            .with_context(|| format!("merging {} into {}", master.path().display(), unified.path().display()))?;

        let candidates = title_correction_candidates(&master.load().await?, self.config.title_similarity);
        if !candidates.is_empty() {
            warn!(
                source_id,
                count = candidates.len(),
                "possible title corrections minted separate ids"
            );
        }

        Ok(SourceRunSummary {
            run_id,
            source_id: source_id.to_string(),
            started_at,
            finished_at: Utc::now(),
            input_rows: mapped.input_rows,
            skipped_rows: mapped.skipped_count(),
            malformed_timestamps: mapped.malformed_timestamps(),
            unmappable_rows: mapped.unmappable_rows(),
            canonical_rows,
            delta_rows,
            already_present: delta.already_present,
            enrichment_failures,
            source_master: source_report,
            unified_master: unified_report,
            title_correction_candidates: candidates,
        })
    }

    /// Runs every enabled source in turn; one source failing does not stop the others.
    pub async fn run_all(&self, registry: &SourceRegistry) -> RunAllSummary {
        let mut summary = RunAllSummary::default();
        for source in registry.enabled() {
            let input = self.config.raw_input_path(source);
            match self.run_source_from_path(&source.source_id, &input).await {
                Ok(run) => summary.runs.push(run),
                Err(err) => {
                    error!(source_id = %source.source_id, error = %format!("{err:#}"), "source run failed");
                    summary.failures.push((source.source_id.clone(), err));
                }
            }
        }
        summary
    }

    /// Writes `summary.json` and `run_brief.md` under `reports/<run_id>/`.
    pub async fn write_report(&self, summary: &SourceRunSummary) -> Result<PathBuf> {
        let report_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&report_dir)
            .await
            .with_context(|| format!("creating {}", report_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(report_dir.join("summary.json"), json)
            .await
            .context("writing summary.json")?;
        fs::write(report_dir.join("run_brief.md"), render_brief(summary))
            .await
            .context("writing run_brief.md")?;
        Ok(report_dir)
    }
}

/// Operator-facing run counts, then each master path with its final size.
pub fn render_run_lines(summary: &SourceRunSummary) -> Vec<String> {
    vec![
        format!(
            "{}: run_id={} input={} skipped={} delta={} new={} enrichment_failures={} title_candidates={}",
            summary.source_id,
            summary.run_id,
            summary.input_rows,
            summary.skipped_rows,
            summary.delta_rows,
            summary.source_master.new_rows,
            summary.enrichment_failures,
            summary.title_correction_candidates.len()
        ),
        format!(
            "{} rows={}",
            summary.source_master.path.display(),
            summary.source_master.final_rows
        ),
        format!(
            "{} rows={}",
            summary.unified_master.path.display(),
            summary.unified_master.final_rows
        ),
    ]
}

pub fn render_brief(summary: &SourceRunSummary) -> String {
    let mut lines = vec![
        format!("# Ledger run `{}`", summary.run_id),
        String::new(),
        format!("- Source: {}", summary.source_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Input rows: {}", summary.input_rows),
        format!(
            "- Skipped rows: {} (malformed timestamps: {}, unmappable: {})",
            summary.skipped_rows, summary.malformed_timestamps, summary.unmappable_rows
        ),
        format!("- New rows (delta): {}", summary.delta_rows),
        format!("- Enrichment failures: {}", summary.enrichment_failures),
        format!(
            "- Source master: `{}` ({} rows)",
            summary.source_master.path.display(),
            summary.source_master.final_rows
        ),
        format!(
            "- Unified master: `{}` ({} rows)",
            summary.unified_master.path.display(),
            summary.unified_master.final_rows
        ),
    ];
    if !summary.title_correction_candidates.is_empty() {
        lines.push(String::new());
        lines.push("## Possible title corrections".to_string());
        for c in &summary.title_correction_candidates {
            lines.push(format!(
                "- {} | {:?} vs {:?} ({:.3})",
                c.pub_date, c.title_a, c.title_b, c.similarity
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// One cron job per enabled source that has a `cron` entry; `None` when scheduling is off.
pub async fn build_scheduler(
    pipeline: Arc<LedgerPipeline>,
    registry: &SourceRegistry,
) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for source in registry.enabled() {
        let Some(cron) = source.cron.clone() else {
            continue;
        };
        let source_id = source.source_id.clone();
        let input = pipeline.config().raw_input_path(source);
        let job_pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&job_pipeline);
            let source_id = source_id.clone();
            let input = input.clone();
            Box::pin(async move {
                match pipeline.run_source_from_path(&source_id, &input).await {
                    Ok(summary) => {
                        if let Err(err) = pipeline.write_report(&summary).await {
                            warn!(source_id, error = %err, "writing run report failed");
                        }
                        info!(
                            source_id,
                            new_rows = summary.source_master.new_rows,
                            "scheduled run complete"
                        );
                    }
                    Err(err) => error!(source_id, error = %format!("{err:#}"), "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {} ({cron})", source.source_id))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
