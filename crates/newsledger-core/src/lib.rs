//! Canonical article model, identity hashing, publication-time normalization
//! and the dedup/ordering engine shared by every master merge.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub const CRATE_NAME: &str = "newsledger-core";

/// Output format of every normalized `pubDate`. The zero offset is a literal.
pub const CANONICAL_TIME_FORMAT: &str = "%a, %d %b %Y %H:%M:%S+0000";

const MAX_OFFSET_SECS: i32 = 14 * 3600;

const ZONED_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S%z",
    "%a, %d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M:%S %z",
    "%Y-%m-%d %H:%M:%S%z",
    "%Y-%m-%d %H:%M:%S%:z",
    "%Y-%m-%d %H:%M:%S %z",
    "%Y-%m-%dT%H:%M:%S%z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalError {
    #[error("malformed timestamp {value:?}")]
    MalformedTimestamp { value: String },
    #[error("invalid forced offset {value:?}")]
    InvalidOffset { value: String },
    #[error("no mapping entries for source {source_id:?}")]
    MissingMappingFile { source_id: String },
    #[error("row {row}: missing value for required column {column:?}")]
    UnmappableRecord { row: usize, column: String },
    #[error("column {column:?} is part of the record identity")]
    IdentityColumn { column: String },
    #[error("unknown canonical column {column:?}")]
    UnknownColumn { column: String },
}

impl CanonicalError {
    /// Errors that only invalidate the current row; the batch carries on.
    pub fn is_row_local(&self) -> bool {
        matches!(
            self,
            Self::MalformedTimestamp { .. } | Self::UnmappableRecord { .. }
        )
    }
}

/// Canonical master columns, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    Id,
    Guid,
    Title,
    Link,
    Description,
    PubDate,
    Source,
    Author,
    Category,
    Tags,
    Image,
    ImagePath,
    ArticleBody,
    Enhanced,
}

impl Column {
    pub const ALL: [Column; 14] = [
        Column::Id,
        Column::Guid,
        Column::Title,
        Column::Link,
        Column::Description,
        Column::PubDate,
        Column::Source,
        Column::Author,
        Column::Category,
        Column::Tags,
        Column::Image,
        Column::ImagePath,
        Column::ArticleBody,
        Column::Enhanced,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Guid => "guid",
            Column::Title => "title",
            Column::Link => "link",
            Column::Description => "description",
            Column::PubDate => "pubDate",
            Column::Source => "source",
            Column::Author => "author",
            Column::Category => "category",
            Column::Tags => "tags",
            Column::Image => "image",
            Column::ImagePath => "imagePath",
            Column::ArticleBody => "articleBody",
            Column::Enhanced => "enhanced",
        }
    }

    pub fn parse(name: &str) -> Option<Column> {
        let name = normalize_header(name);
        Column::ALL.into_iter().find(|c| c.as_str() == name)
    }

    pub fn is_identity(self) -> bool {
        matches!(
            self,
            Column::Id | Column::Title | Column::PubDate | Column::Source
        )
    }
}

/// Strips a UTF-8 byte-order mark and surrounding whitespace from a header cell.
pub fn normalize_header(name: &str) -> &str {
    name.trim_start_matches('\u{feff}').trim()
}

/// Lowercase hex SHA1 of `title|pubDate|source`.
pub fn identity_hash(title: &str, pub_date: &str, source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(title.as_bytes());
    hasher.update(b"|");
    hasher.update(pub_date.as_bytes());
    hasher.update(b"|");
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// One article in canonical shape.
///
/// Identity fields are private: `id` is computed once in [`CanonicalRecord::new`]
/// (or restored verbatim from a master with [`CanonicalRecord::from_stored`]) and
/// never recomputed afterwards. Everything else is optional and may be filled in
/// later by enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    id: String,
    pub guid: Option<String>,
    title: String,
    pub link: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: String,
    source: String,
    pub author: Option<String>,
    pub category: Option<String>,
    pub tags: Option<String>,
    #[serde(rename = "image")]
    pub image_url: Option<String>,
    #[serde(rename = "imagePath")]
    pub image_path: Option<String>,
    #[serde(rename = "articleBody")]
    pub body: Option<String>,
    pub enhanced: Option<String>,
    /// Non-canonical columns carried through from an existing master.
    #[serde(flatten, default)]
    pub extra: BTreeMap<String, String>,
}

impl CanonicalRecord {
    pub fn new(
        title: impl Into<String>,
        pub_date: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let pub_date = pub_date.into();
        let source = source.into();
        let id = identity_hash(&title, &pub_date, &source);
        Self::from_stored(id, title, pub_date, source)
    }

    pub fn from_stored(
        id: impl Into<String>,
        title: impl Into<String>,
        pub_date: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            guid: None,
            title: title.into(),
            link: None,
            description: None,
            pub_date: pub_date.into(),
            source: source.into(),
            author: None,
            category: None,
            tags: None,
            image_url: None,
            image_path: None,
            body: None,
            enhanced: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn pub_date(&self) -> &str {
        &self.pub_date
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Non-empty guid, used as the secondary dedup key.
    pub fn guid_key(&self) -> Option<&str> {
        self.guid.as_deref().map(str::trim).filter(|g| !g.is_empty())
    }

    pub fn field(&self, column: Column) -> Option<&str> {
        let value = match column {
            Column::Id => return Some(self.id.as_str()),
            Column::Title => return Some(self.title.as_str()),
            Column::PubDate => return Some(self.pub_date.as_str()),
            Column::Source => return Some(self.source.as_str()),
            Column::Guid => &self.guid,
            Column::Link => &self.link,
            Column::Description => &self.description,
            Column::Author => &self.author,
            Column::Category => &self.category,
            Column::Tags => &self.tags,
            Column::Image => &self.image_url,
            Column::ImagePath => &self.image_path,
            Column::ArticleBody => &self.body,
            Column::Enhanced => &self.enhanced,
        };
        value.as_deref()
    }

    /// Sets an optional column; empty values clear it.
    pub fn set_field(&mut self, column: Column, value: impl Into<String>) -> Result<(), CanonicalError> {
        let value = Some(value.into()).filter(|v| !v.trim().is_empty());
        let slot = match column {
            Column::Id | Column::Title | Column::PubDate | Column::Source => {
                return Err(CanonicalError::IdentityColumn {
                    column: column.as_str().to_string(),
                })
            }
            Column::Guid => &mut self.guid,
            Column::Link => &mut self.link,
            Column::Description => &mut self.description,
            Column::Author => &mut self.author,
            Column::Category => &mut self.category,
            Column::Tags => &mut self.tags,
            Column::Image => &mut self.image_url,
            Column::ImagePath => &mut self.image_path,
            Column::ArticleBody => &mut self.body,
            Column::Enhanced => &mut self.enhanced,
        };
        *slot = value;
        Ok(())
    }

    /// Count of non-empty non-identity values, extras included.
    pub fn populated_fields(&self) -> usize {
        let canonical = Column::ALL
            .into_iter()
            .filter(|c| !c.is_identity())
            .filter(|c| self.field(*c).is_some_and(|v| !v.trim().is_empty()))
            .count();
        canonical + self.extra.values().filter(|v| !v.trim().is_empty()).count()
    }

    pub fn is_enhanced(&self) -> bool {
        self.enhanced.as_deref().is_some_and(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("true") || v == "1" || v.eq_ignore_ascii_case("yes")
        })
    }

    pub fn same_identity(&self, other: &CanonicalRecord) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.pub_date == other.pub_date
            && self.source == other.source
    }

    pub fn published_at(&self) -> Option<DateTime<Utc>> {
        parse_pub_date(&self.pub_date, None).ok()
    }
}

/// Offset applied to naive timestamps from sources that omit or misreport their zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForcedOffset(FixedOffset);

impl ForcedOffset {
    /// Accepts `+3`, `-5`, `+3.5`, `+03:00` and `+0300`.
    pub fn parse(raw: &str) -> Result<Self, CanonicalError> {
        let invalid = || CanonicalError::InvalidOffset {
            value: raw.to_string(),
        };
        let trimmed = raw.trim();
        let (sign, digits) = match trimmed.as_bytes().first() {
            Some(b'+') => (1, &trimmed[1..]),
            Some(b'-') => (-1, &trimmed[1..]),
            Some(_) => (1, trimmed),
            None => return Err(invalid()),
        };
        if digits.is_empty() || digits.starts_with(['+', '-']) {
            return Err(invalid());
        }

        let seconds = if let Some((h, m)) = digits.split_once(':') {
            let h: i32 = h.parse().map_err(|_| invalid())?;
            let m: i32 = m.parse().map_err(|_| invalid())?;
            if !(0..60).contains(&m) {
                return Err(invalid());
            }
            h * 3600 + m * 60
        } else if digits.len() == 4 && digits.bytes().all(|b| b.is_ascii_digit()) {
            let h: i32 = digits[..2].parse().map_err(|_| invalid())?;
            let m: i32 = digits[2..].parse().map_err(|_| invalid())?;
            if m >= 60 {
                return Err(invalid());
            }
            h * 3600 + m * 60
        } else {
            let hours: f64 = digits.parse().map_err(|_| invalid())?;
            if !hours.is_finite() || hours.abs() > 14.0 {
                return Err(invalid());
            }
            (hours * 3600.0).round() as i32
        };

        if seconds > MAX_OFFSET_SECS {
            return Err(invalid());
        }
        FixedOffset::east_opt(sign * seconds)
            .map(Self)
            .ok_or_else(invalid)
    }

    pub fn from_hours(hours: i32) -> Option<Self> {
        if hours.abs() * 3600 > MAX_OFFSET_SECS {
            return None;
        }
        FixedOffset::east_opt(hours * 3600).map(Self)
    }

    pub fn as_fixed(&self) -> FixedOffset {
        self.0
    }
}

/// Parses a publication timestamp into an absolute instant.
///
/// Zoned inputs are converted directly and ignore `forced`. Naive inputs are
/// read as local time at `forced`, or as UTC when no offset is forced.
pub fn parse_pub_date(
    raw: &str,
    forced: Option<ForcedOffset>,
) -> Result<DateTime<Utc>, CanonicalError> {
    let value = raw.trim();
    let malformed = || CanonicalError::MalformedTimestamp {
        value: raw.to_string(),
    };
    if value.is_empty() {
        return Err(malformed());
    }

    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ZONED_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(value, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(malformed)?;

    match forced {
        Some(offset) => offset
            .0
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(malformed),
        None => Ok(Utc.from_utc_datetime(&naive)),
    }
}

pub fn format_pub_date(instant: DateTime<Utc>) -> String {
    instant.format(CANONICAL_TIME_FORMAT).to_string()
}

/// Normalizes any recognized timestamp to `Dow, DD Mon YYYY HH:MM:SS+0000`.
pub fn normalize_pub_date(raw: &str, forced: Option<ForcedOffset>) -> Result<String, CanonicalError> {
    parse_pub_date(raw, forced).map(format_pub_date)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOutcome {
    pub records: Vec<CanonicalRecord>,
    pub input_rows: usize,
    pub id_collisions: usize,
    pub guid_collisions: usize,
}

impl DedupOutcome {
    pub fn collisions(&self) -> usize {
        self.id_collisions + self.guid_collisions
    }

    /// Every input row is either in the output or was folded by a counted collision.
    pub fn accounts_for_every_row(&self) -> bool {
        self.input_rows == self.records.len() + self.collisions()
    }
}

struct Slot {
    record: CanonicalRecord,
    arrival: usize,
}

impl Slot {
    fn rank(&self) -> (bool, usize, usize) {
        (
            self.record.is_enhanced(),
            self.record.populated_fields(),
            self.arrival,
        )
    }

    /// Keeps whichever of the two is enhanced, more complete, or later.
    fn absorb(&mut self, other: Slot) {
        if other.rank() > self.rank() {
            *self = other;
        }
    }
}

fn find_root(parent: &mut [usize], mut idx: usize) -> usize {
    while parent[idx] != idx {
        parent[idx] = parent[parent[idx]];
        idx = parent[idx];
    }
    idx
}

/// Collapses records sharing an `id` (or a non-empty `guid`) into one and
/// orders the survivors newest first, ties by ascending `id`.
pub fn dedup_and_order(records: impl IntoIterator<Item = CanonicalRecord>) -> DedupOutcome {
    let mut slots: Vec<Option<Slot>> = Vec::new();
    let mut parent: Vec<usize> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut by_guid: HashMap<String, usize> = HashMap::new();
    let mut input_rows = 0usize;
    let mut id_collisions = 0usize;
    let mut guid_collisions = 0usize;

    for (arrival, record) in records.into_iter().enumerate() {
        input_rows += 1;
        let id_hit = by_id
            .get(record.id())
            .copied()
            .map(|s| find_root(&mut parent, s));
        let guid_hit = record
            .guid_key()
            .and_then(|g| by_guid.get(g).copied())
            .map(|s| find_root(&mut parent, s));

        let id_key = record.id().to_string();
        let guid_key = record.guid_key().map(str::to_string);
        let incoming = Slot { record, arrival };

        let target = match (id_hit, guid_hit) {
            (None, None) => {
                let idx = slots.len();
                slots.push(Some(incoming));
                parent.push(idx);
                idx
            }
            (Some(target), None) => {
                id_collisions += 1;
                absorb_into(&mut slots, target, incoming);
                target
            }
            (None, Some(target)) => {
                guid_collisions += 1;
                absorb_into(&mut slots, target, incoming);
                target
            }
            (Some(target), Some(other)) => {
                id_collisions += 1;
                absorb_into(&mut slots, target, incoming);
                if other != target {
                    guid_collisions += 1;
                    if let Some(folded) = slots[other].take() {
                        absorb_into(&mut slots, target, folded);
                    }
                    parent[other] = target;
                }
                target
            }
        };

        by_id.entry(id_key).or_insert(target);
        if let Some(guid) = guid_key {
            by_guid.entry(guid).or_insert(target);
        }
    }

    let mut keyed: Vec<(Option<DateTime<Utc>>, CanonicalRecord)> = slots
        .into_iter()
        .flatten()
        .map(|slot| (slot.record.published_at(), slot.record))
        .collect();
    keyed.sort_by(|a, b| publication_order(a.0, &a.1, b.0, &b.1));

    DedupOutcome {
        records: keyed.into_iter().map(|(_, record)| record).collect(),
        input_rows,
        id_collisions,
        guid_collisions,
    }
}

fn absorb_into(slots: &mut [Option<Slot>], target: usize, incoming: Slot) {
    let merged = match slots[target].take() {
        Some(mut existing) => {
            existing.absorb(incoming);
            existing
        }
        None => incoming,
    };
    slots[target] = Some(merged);
}

fn publication_order(
    a_at: Option<DateTime<Utc>>,
    a: &CanonicalRecord,
    b_at: Option<DateTime<Utc>>,
    b: &CanonicalRecord,
) -> Ordering {
    let by_time = match (a_at, b_at) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time.then_with(|| a.id().cmp(b.id()))
}

/// True when adjacent records are newest-first with ascending-`id` ties.
pub fn is_publication_ordered(records: &[CanonicalRecord]) -> bool {
    records.windows(2).all(|pair| {
        publication_order(
            pair[0].published_at(),
            &pair[0],
            pair[1].published_at(),
            &pair[1],
        ) == Ordering::Less
    })
}

/// True when no two records share an `id` or a non-empty `guid`.
pub fn has_unique_keys(records: &[CanonicalRecord]) -> bool {
    let mut ids = std::collections::HashSet::new();
    let mut guids = std::collections::HashSet::new();
    records.iter().all(|r| {
        ids.insert(r.id()) && r.guid_key().map(|g| guids.insert(g)).unwrap_or(true)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, pub_date: &str) -> CanonicalRecord {
        CanonicalRecord::new(title, pub_date, "ynet")
    }

    #[test]
    fn identity_hash_matches_known_digest() {
        let id = identity_hash("Headline A", "Mon, 15 Sep 2025 23:16:57+0000", "ynet");
        assert_eq!(id, "78f82805e1a9b5c9167bb67ff5ab6dad14bcb322");
        assert_eq!(
            id,
            identity_hash("Headline A", "Mon, 15 Sep 2025 23:16:57+0000", "ynet")
        );
        assert_eq!(id.len(), 40);
    }

    #[test]
    fn identity_changes_with_each_component() {
        let base = identity_hash("Headline A", "Mon, 15 Sep 2025 23:16:57+0000", "ynet");
        assert_ne!(
            base,
            identity_hash("Headline B", "Mon, 15 Sep 2025 23:16:57+0000", "ynet")
        );
        assert_ne!(
            base,
            identity_hash("Headline A", "Mon, 15 Sep 2025 23:16:58+0000", "ynet")
        );
        assert_ne!(
            base,
            identity_hash("Headline A", "Mon, 15 Sep 2025 23:16:57+0000", "hayom")
        );
    }

    #[test]
    fn zoned_timestamp_shifts_clock_to_utc() {
        let out = normalize_pub_date("Mon, 15 Sep 2025 23:16:57 +0300", None).expect("normalize");
        assert_eq!(out, "Mon, 15 Sep 2025 20:16:57+0000");
    }

    #[test]
    fn zoned_timestamp_ignores_forced_offset() {
        let forced = ForcedOffset::parse("+5").expect("offset");
        let out = normalize_pub_date("2025-09-15T23:16:57+03:00", Some(forced)).expect("normalize");
        assert_eq!(out, "Mon, 15 Sep 2025 20:16:57+0000");
    }

    #[test]
    fn naive_timestamp_uses_forced_offset_with_date_rollover() {
        let forced = ForcedOffset::parse("+3").expect("offset");
        let out = normalize_pub_date("2026-01-01 01:30:00", Some(forced)).expect("normalize");
        assert_eq!(out, "Wed, 31 Dec 2025 22:30:00+0000");
    }

    #[test]
    fn naive_timestamp_without_offset_is_utc() {
        let out = normalize_pub_date("15/09/2025 08:05", None).expect("normalize");
        assert_eq!(out, "Mon, 15 Sep 2025 08:05:00+0000");
    }

    #[test]
    fn canonical_output_is_a_fixed_point() {
        let once = normalize_pub_date("Tue, 16 Sep 2025 01:02:03 GMT", None).expect("first");
        let twice = normalize_pub_date(&once, None).expect("second");
        assert_eq!(once, "Tue, 16 Sep 2025 01:02:03+0000");
        assert_eq!(once, twice);
    }

    #[test]
    fn unparseable_timestamp_is_malformed() {
        let err = normalize_pub_date("yesterday-ish", None).unwrap_err();
        assert!(matches!(err, CanonicalError::MalformedTimestamp { .. }));
        assert!(err.is_row_local());
    }

    #[test]
    fn forced_offset_forms() {
        let three = FixedOffset::east_opt(3 * 3600).unwrap();
        for raw in ["+3", "3", "+03:00", "+0300"] {
            assert_eq!(ForcedOffset::parse(raw).expect(raw).as_fixed(), three, "{raw}");
        }
        assert_eq!(
            ForcedOffset::parse("+5.5").unwrap().as_fixed(),
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap()
        );
        assert_eq!(
            ForcedOffset::parse("-0500").unwrap().as_fixed(),
            FixedOffset::west_opt(5 * 3600).unwrap()
        );
        for bad in ["", "+", "abc", "+15", "+03:75", "+-3"] {
            assert!(ForcedOffset::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn identity_columns_cannot_be_overwritten() {
        let mut r = record("A", "Mon, 15 Sep 2025 23:16:57+0000");
        let err = r.set_field(Column::Title, "B").unwrap_err();
        assert!(matches!(err, CanonicalError::IdentityColumn { .. }));
        r.set_field(Column::Link, "https://example.test/a").unwrap();
        r.set_field(Column::Author, "   ").unwrap();
        assert_eq!(r.link.as_deref(), Some("https://example.test/a"));
        assert_eq!(r.author, None);
        assert_eq!(r.populated_fields(), 1);
    }

    #[test]
    fn bom_prefixed_header_parses_as_column() {
        assert_eq!(Column::parse("\u{feff}id"), Some(Column::Id));
        assert_eq!(Column::parse(" pubDate "), Some(Column::PubDate));
        assert_eq!(Column::parse("pubdate"), None);
    }

    #[test]
    fn orders_newest_first_by_instant_not_string() {
        let older = record("older", "Tue, 09 Sep 2025 10:00:00+0000");
        let newer = record("newer", "Wed, 10 Sep 2025 09:00:00+0000");
        let outcome = dedup_and_order(vec![older.clone(), newer.clone()]);
        assert_eq!(outcome.records, vec![newer, older]);
        assert!(is_publication_ordered(&outcome.records));
    }

    #[test]
    fn equal_instants_tie_break_by_id() {
        let a = record("first", "Mon, 15 Sep 2025 12:00:00+0000");
        let b = record("second", "Mon, 15 Sep 2025 12:00:00+0000");
        let forward = dedup_and_order(vec![a.clone(), b.clone()]);
        let backward = dedup_and_order(vec![b, a]);
        assert_eq!(forward.records, backward.records);
        assert!(forward.records[0].id() < forward.records[1].id());
    }

    #[test]
    fn more_complete_record_wins_regardless_of_arrival() {
        let bare = record("A", "Mon, 15 Sep 2025 12:00:00+0000");
        let mut rich = bare.clone();
        rich.link = Some("https://example.test/a".into());
        rich.image_path = Some("images/a.jpg".into());

        let outcome = dedup_and_order(vec![rich.clone(), bare.clone()]);
        assert_eq!(outcome.records, vec![rich.clone()]);
        assert_eq!(outcome.id_collisions, 1);

        let outcome = dedup_and_order(vec![bare, rich.clone()]);
        assert_eq!(outcome.records, vec![rich]);
    }

    #[test]
    fn enhanced_flag_outranks_field_count() {
        let mut many = record("A", "Mon, 15 Sep 2025 12:00:00+0000");
        many.link = Some("l".into());
        many.author = Some("x".into());
        many.category = Some("news".into());
        let mut enhanced = record("A", "Mon, 15 Sep 2025 12:00:00+0000");
        enhanced.enhanced = Some("True".into());

        let outcome = dedup_and_order(vec![enhanced.clone(), many]);
        assert_eq!(outcome.records, vec![enhanced]);
    }

    #[test]
    fn shared_guid_folds_different_ids() {
        let mut first = record("Headline", "Mon, 15 Sep 2025 12:00:00+0000");
        first.guid = Some("guid-1".into());
        let mut retitled = record("Headline!", "Mon, 15 Sep 2025 12:00:00+0000");
        retitled.guid = Some("guid-1".into());
        retitled.description = Some("more".into());
        let unrelated = record("Other", "Mon, 15 Sep 2025 11:00:00+0000");

        let outcome = dedup_and_order(vec![first, retitled.clone(), unrelated.clone()]);
        assert_eq!(outcome.records, vec![retitled, unrelated]);
        assert_eq!(outcome.guid_collisions, 1);
        assert_eq!(outcome.id_collisions, 0);
        assert!(outcome.accounts_for_every_row());
        assert!(has_unique_keys(&outcome.records));
    }

    #[test]
    fn id_and_guid_hits_on_different_groups_are_joined() {
        let mut a = record("A", "Mon, 15 Sep 2025 12:00:00+0000");
        a.guid = Some("g-a".into());
        let mut b = record("B", "Mon, 15 Sep 2025 11:00:00+0000");
        b.guid = Some("g-b".into());
        // same id as `a`, same guid as `b`
        let mut bridge = a.clone();
        bridge.guid = Some("g-b".into());

        let outcome = dedup_and_order(vec![a, b, bridge]);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.collisions(), 2);
        assert!(outcome.accounts_for_every_row());
    }

    #[test]
    fn unparseable_dates_sink_to_the_end() {
        let good = record("good", "Mon, 15 Sep 2025 12:00:00+0000");
        let bad = CanonicalRecord::from_stored("0000", "bad", "not a date", "ynet");
        let outcome = dedup_and_order(vec![bad.clone(), good.clone()]);
        assert_eq!(outcome.records, vec![good, bad]);
    }

    #[test]
    fn dedup_is_idempotent() {
        let rows = vec![
            record("a", "Mon, 15 Sep 2025 12:00:00+0000"),
            record("b", "Sun, 14 Sep 2025 12:00:00+0000"),
            record("a", "Mon, 15 Sep 2025 12:00:00+0000"),
        ];
        let once = dedup_and_order(rows);
        let twice = dedup_and_order(once.records.clone());
        assert_eq!(once.records, twice.records);
        assert_eq!(twice.collisions(), 0);
    }
}
