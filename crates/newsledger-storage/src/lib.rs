//! Master ledger files: BOM-tolerant CSV codec, exclusive lock files and
//! atomic read-merge-replace.

use std::collections::{BTreeSet, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use newsledger_core::{dedup_and_order, normalize_header, CanonicalRecord, Column};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "newsledger-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("master {} is corrupt: {reason}", path.display())]
    CorruptMaster { path: PathBuf, reason: String },
    #[error("source master {} does not exist", path.display())]
    SourceMasterMissing { path: PathBuf },
    #[error("could not lock {} after {attempts} attempts", path.display())]
    LockContention { path: PathBuf, attempts: usize },
    #[error("lock {} was taken over before the write", path.display())]
    LockLost { path: PathBuf },
    #[error("invalid lock policy: {reason}")]
    InvalidLockPolicy { reason: String },
    #[error(
        "merge into {} does not account for every row: {input_rows} in, {output_rows} out, {collisions} collisions",
        path.display()
    )]
    InvariantViolation {
        path: PathBuf,
        input_rows: usize,
        output_rows: usize,
        collisions: usize,
    },
    #[error("encoding {}: {reason}", path.display())]
    Encode { path: PathBuf, reason: String },
    #[error("i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Contention is the only failure a later attempt can clear.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. } | Self::LockLost { .. })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Decodes master CSV bytes. Header cells may carry a byte-order mark.
pub fn decode_master(path: &Path, bytes: &[u8]) -> Result<Vec<CanonicalRecord>, StoreError> {
    let corrupt = |reason: String| StoreError::CorruptMaster {
        path: path.to_path_buf(),
        reason,
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| corrupt(format!("unreadable header: {e}")))?
        .iter()
        .map(|h| normalize_header(h).to_string())
        .collect();

    let position = |column: Column| headers.iter().position(|h| h == column.as_str());
    let (Some(id_at), Some(title_at), Some(date_at), Some(source_at)) = (
        position(Column::Id),
        position(Column::Title),
        position(Column::PubDate),
        position(Column::Source),
    ) else {
        return Err(corrupt(format!(
            "header {headers:?} lacks one of id, title, pubDate, source"
        )));
    };

    let mut records = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let row = idx + 1;
        let fields = result.map_err(|e| corrupt(format!("row {row}: {e}")))?;
        let cell = |at: usize| fields.get(at).unwrap_or_default();

        let id = cell(id_at).trim();
        if id.is_empty() {
            return Err(corrupt(format!("row {row} has an empty id")));
        }
        let mut record =
            CanonicalRecord::from_stored(id, cell(title_at), cell(date_at), cell(source_at));

        for (at, header) in headers.iter().enumerate() {
            let value = cell(at);
            match Column::parse(header) {
                Some(column) if column.is_identity() => {}
                Some(column) => record
                    .set_field(column, value)
                    .map_err(|e| corrupt(format!("row {row}: {e}")))?,
                None if header.is_empty() || value.trim().is_empty() => {}
                None => {
                    record.extra.insert(header.clone(), value.to_string());
                }
            }
        }
        records.push(record);
    }
    Ok(records)
}

/// Canonical columns in fixed order, then any extra columns in lexical order.
pub fn encode_master(path: &Path, records: &[CanonicalRecord]) -> Result<Vec<u8>, StoreError> {
    let encode = |e: csv::Error| StoreError::Encode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let extras: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.extra.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(
            Column::ALL
                .iter()
                .map(|c| c.as_str())
                .chain(extras.iter().copied()),
        )
        .map_err(encode)?;
    for record in records {
        writer
            .write_record(
                Column::ALL
                    .iter()
                    .map(|c| record.field(*c).unwrap_or_default())
                    .chain(
                        extras
                            .iter()
                            .map(|k| record.extra.get(*k).map(String::as_str).unwrap_or_default()),
                    ),
            )
            .map_err(encode)?;
    }
    writer.into_inner().map_err(|e| StoreError::Encode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::io(path, err)),
    }
}

/// Writes `bytes` to a temp file beside `path`, syncs it, then renames it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StoreError::io(parent, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "master".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StoreError::io(&temp_path, e))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(&temp_path, err));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::io(path, err));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 40,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub backoff: BackoffPolicy,
    /// Lock files older than this are assumed abandoned by a crashed run.
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            stale_after: Duration::from_secs(600),
        }
    }
}

impl LockPolicy {
    /// A zero staleness window would let every waiter break a live lock.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.stale_after.is_zero() {
            return Err(StoreError::InvalidLockPolicy {
                reason: "stale_after must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

pub fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    target.with_file_name(name)
}

/// Exclusive lock on one master, held as a `<master>.lock` file. Released on drop.
#[derive(Debug)]
pub struct MasterLock {
    path: PathBuf,
    token: String,
}

impl MasterLock {
    pub async fn acquire(target: &Path, policy: &LockPolicy) -> Result<Self, StoreError> {
        policy.validate()?;
        let lock_path = lock_path_for(target);
        if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let attempts = policy.backoff.max_retries + 1;
        for attempt in 0..attempts {
            match fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    let token = Uuid::new_v4().to_string();
                    let owner = format!(
                        "pid={} token={token} at={}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    let noted = async {
                        file.write_all(owner.as_bytes()).await?;
                        file.flush().await
                    }
                    .await;
                    drop(file);
                    if let Err(err) = noted {
                        let _ = fs::remove_file(&lock_path).await;
                        return Err(StoreError::io(&lock_path, err));
                    }
                    return Ok(Self {
                        path: lock_path,
                        token,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if break_stale_lock(&lock_path, policy.stale_after).await? {
                        continue;
                    }
                    if attempt + 1 < attempts {
                        tokio::time::sleep(policy.backoff.delay_for_attempt(attempt)).await;
                    }
                }
                Err(err) => return Err(StoreError::io(&lock_path, err)),
            }
        }

        Err(StoreError::LockContention {
            path: target.to_path_buf(),
            attempts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the lock file on disk still carries this holder's token.
    pub async fn is_held(&self) -> bool {
        fs::read_to_string(&self.path)
            .await
            .is_ok_and(|owner| owner_token(&owner) == Some(self.token.as_str()))
    }
}

impl Drop for MasterLock {
    fn drop(&mut self) {
        // a lock broken as stale may already belong to the next writer
        match std::fs::read_to_string(&self.path) {
            Ok(owner) if owner_token(&owner) == Some(self.token.as_str()) => {
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => warn!(lock = %self.path.display(), "master lock changed hands; leaving it"),
            Err(_) => {}
        }
    }
}

fn owner_token(owner: &str) -> Option<&str> {
    owner
        .split_whitespace()
        .find_map(|part| part.strip_prefix("token="))
}

async fn lock_age(path: &Path) -> Option<Duration> {
    let meta = fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Moves a stale lock aside under a unique name. Returns true when the lock
/// that was judged stale is gone; a live lock caught by the rename is linked back.
async fn break_stale_lock(lock_path: &Path, stale_after: Duration) -> Result<bool, StoreError> {
    if !lock_age(lock_path).await.is_some_and(|age| age >= stale_after) {
        return Ok(false);
    }
    let Ok(observed) = fs::read_to_string(lock_path).await else {
        return Ok(false);
    };

    let mut tombstone_name = lock_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tombstone_name.push(format!(".{}.stale", Uuid::new_v4()));
    let tombstone = lock_path.with_file_name(tombstone_name);
    match fs::rename(lock_path, &tombstone).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(StoreError::io(lock_path, err)),
    }

    let moved = fs::read_to_string(&tombstone).await.unwrap_or_default();
    let still_stale = lock_age(&tombstone).await.is_some_and(|age| age >= stale_after);
    if moved != observed || !still_stale {
        // hard_link refuses to replace a lock someone created in the meantime
        if let Err(err) = fs::hard_link(&tombstone, lock_path).await {
            warn!(lock = %lock_path.display(), error = %err, "could not restore live master lock");
        }
        let _ = fs::remove_file(&tombstone).await;
        return Ok(false);
    }

    warn!(lock = %lock_path.display(), "broke stale master lock");
    let _ = fs::remove_file(&tombstone).await;
    Ok(true)
}

/// The `id` and non-empty `guid` values already present in a master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterKeys {
    pub ids: HashSet<String>,
    pub guids: HashSet<String>,
}

impl MasterKeys {
    pub fn of(records: &[CanonicalRecord]) -> Self {
        let mut keys = Self::default();
        for record in records {
            keys.ids.insert(record.id().to_string());
            if let Some(guid) = record.guid_key() {
                keys.guids.insert(guid.to_string());
            }
        }
        keys
    }

    /// True when the record shares its `id` or its `guid` with a master row.
    pub fn contains(&self, record: &CanonicalRecord) -> bool {
        self.ids.contains(record.id())
            || record.guid_key().is_some_and(|guid| self.guids.contains(guid))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub path: PathBuf,
    pub existing_rows: usize,
    pub incoming_rows: usize,
    pub id_collisions: usize,
    pub guid_collisions: usize,
    /// Articles absent from the master before the merge; a guid fold onto an existing row is not new.
    pub new_rows: usize,
    pub final_rows: usize,
    pub written: bool,
    pub content_sha256: String,
}

/// One master file (per-source or unified).
#[derive(Debug, Clone)]
pub struct MasterStore {
    path: PathBuf,
    lock: LockPolicy,
    json_mirror: bool,
}

impl MasterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: LockPolicy::default(),
            json_mirror: false,
        }
    }

    pub fn with_lock_policy(mut self, lock: LockPolicy) -> Self {
        self.lock = lock;
        self
    }

    /// Also keep a `.json` copy of the rows next to the CSV.
    pub fn with_json_mirror(mut self, enabled: bool) -> Self {
        self.json_mirror = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn json_mirror_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    pub async fn exists(&self) -> Result<bool, StoreError> {
        fs::try_exists(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))
    }

    /// Current rows; a missing file is an empty master.
    pub async fn load(&self) -> Result<Vec<CanonicalRecord>, StoreError> {
        match read_optional(&self.path).await? {
            Some(bytes) => decode_master(&self.path, &bytes),
            None => Ok(Vec::new()),
        }
    }

    pub async fn load_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(MasterKeys::of(&self.load().await?).ids)
    }

    /// Both dedup keys of the current rows in one read.
    pub async fn load_keys(&self) -> Result<MasterKeys, StoreError> {
        Ok(MasterKeys::of(&self.load().await?))
    }

    /// Locks the master, folds `incoming` into the current rows through the
    /// dedup/ordering engine and atomically replaces the file.
    pub async fn merge(&self, incoming: Vec<CanonicalRecord>) -> Result<MergeReport, StoreError> {
        let span = info_span!("merge_master", path = %self.path.display());
        async {
            let mut retries = 0usize;
            loop {
                match self.merge_locked(&incoming).await {
                    Err(StoreError::LockLost { path }) if retries < self.lock.backoff.max_retries => {
                        warn!(lock = %path.display(), retries, "master lock taken over; redoing merge");
                        retries += 1;
                    }
                    other => return other,
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Unified variant: the incoming rows are another master's current content.
    pub async fn merge_from_master(&self, source: &MasterStore) -> Result<MergeReport, StoreError> {
        if !source.exists().await? {
            return Err(StoreError::SourceMasterMissing {
                path: source.path.clone(),
            });
        }
        let rows = source.load().await?;
        info!(
            source = %source.path.display(),
            rows = rows.len(),
            "merging source master"
        );
        self.merge(rows).await
    }

    async fn merge_locked(&self, incoming: &[CanonicalRecord]) -> Result<MergeReport, StoreError> {
        let lock = MasterLock::acquire(&self.path, &self.lock).await?;

        let current = read_optional(&self.path).await?;
        let existing = match &current {
            Some(bytes) => decode_master(&self.path, bytes)?,
            None => Vec::new(),
        };
        let existing_keys = MasterKeys::of(&existing);
        let existing_rows = existing.len();
        let incoming_rows = incoming.len();

        let outcome = dedup_and_order(existing.into_iter().chain(incoming.iter().cloned()));
        if !outcome.accounts_for_every_row() {
            return Err(StoreError::InvariantViolation {
                path: self.path.clone(),
                input_rows: outcome.input_rows,
                output_rows: outcome.records.len(),
                collisions: outcome.collisions(),
            });
        }

        let encoded = encode_master(&self.path, &outcome.records)?;
        let written = current.as_deref() != Some(encoded.as_slice());
        if written {
            if !lock.is_held().await {
                return Err(StoreError::LockLost {
                    path: lock.path().to_path_buf(),
                });
            }
            write_atomic(&self.path, &encoded).await?;
        }
        if self.json_mirror {
            self.write_json_mirror(&outcome.records).await?;
        }

        let report = MergeReport {
            path: self.path.clone(),
            existing_rows,
            incoming_rows,
            id_collisions: outcome.id_collisions,
            guid_collisions: outcome.guid_collisions,
            new_rows: outcome
                .records
                .iter()
                .filter(|r| !existing_keys.contains(r))
                .count(),
            final_rows: outcome.records.len(),
            written,
            content_sha256: sha256_hex(&encoded),
        };
        info!(
            existing_rows = report.existing_rows,
            incoming_rows = report.incoming_rows,
            new_rows = report.new_rows,
            final_rows = report.final_rows,
            written = report.written,
            "master merged"
        );
        Ok(report)
    }

    async fn write_json_mirror(&self, records: &[CanonicalRecord]) -> Result<(), StoreError> {
        let path = self.json_mirror_path();
        let bytes = serde_json::to_vec_pretty(records).map_err(|e| StoreError::Encode {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if read_optional(&path).await?.as_deref() == Some(bytes.as_slice()) {
            return Ok(());
        }
        write_atomic(&path, &bytes).await
    }
}
