//! Declarative source-to-canonical field mapping and raw batch loading.
//!
//! The mapping table is data: each row names a source, a source column, the
//! canonical column it feeds and an optional transform tag. [`Mapper`] is a
//! generic interpreter over that table, so a new outlet only adds rows.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use newsledger_core::{
    normalize_header, normalize_pub_date, CanonicalError, CanonicalRecord, Column, ForcedOffset,
};
use scraper::Html;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "newsledger-mapping";

/// One expanded raw item: source column name to string value.
pub type RawRecord = BTreeMap<String, String>;

const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("unsupported mapping file version {0}")]
    UnsupportedVersion(u32),
    #[error("source {source_id:?}: unknown canonical column {column:?}")]
    UnknownColumn { source_id: String, column: String },
    #[error("source {source_id:?}: column {column:?} is derived, not mapped")]
    DerivedColumn { source_id: String, column: String },
    #[error("source {source_id:?}: invalid transform {tag:?}: {reason}")]
    BadTransform {
        source_id: String,
        tag: String,
        reason: String,
    },
    #[error("source {source_id:?}: no mapping row for required column {column:?}")]
    MissingIdentityColumn { source_id: String, column: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingFile {
    pub version: u32,
    #[serde(default)]
    pub mappings: Vec<MappingRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingRow {
    pub source: String,
    pub source_column: String,
    pub canonical_column: String,
    #[serde(default)]
    pub transform: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Trim,
    StripHtml,
    Lowercase,
    NormalizeTime(Option<ForcedOffset>),
}

impl Transform {
    /// Parses `trim`, `strip-html`, `lowercase`, `normalize-time` or `normalize-time:<offset>`.
    pub fn parse(tag: &str) -> std::result::Result<Self, String> {
        let tag = tag.trim();
        let (name, arg) = match tag.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (tag, None),
        };
        match (name, arg) {
            ("trim", None) => Ok(Self::Trim),
            ("strip-html", None) => Ok(Self::StripHtml),
            ("lowercase", None) => Ok(Self::Lowercase),
            ("normalize-time", None) => Ok(Self::NormalizeTime(None)),
            ("normalize-time", Some(offset)) => ForcedOffset::parse(offset)
                .map(|o| Self::NormalizeTime(Some(o)))
                .map_err(|e| e.to_string()),
            (_, Some(_)) => Err(format!("transform {name:?} takes no argument")),
            _ => Err(format!("unknown transform {name:?}")),
        }
    }

    pub fn apply(&self, value: &str) -> std::result::Result<String, CanonicalError> {
        match self {
            Self::Trim => Ok(value.trim().to_string()),
            Self::StripHtml => Ok(strip_html(value)),
            Self::Lowercase => Ok(value.trim().to_lowercase()),
            Self::NormalizeTime(offset) => normalize_pub_date(value, *offset),
        }
    }
}

/// Visible text of an HTML fragment with whitespace collapsed.
pub fn strip_html(value: &str) -> String {
    let fragment = Html::parse_fragment(value);
    fragment
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRule {
    pub source_column: String,
    pub target: Column,
    pub transform: Transform,
    pub required: bool,
}

impl ColumnRule {
    fn extract(&self, raw: &RawRecord) -> std::result::Result<Option<String>, CanonicalError> {
        let Some(value) = raw
            .get(&self.source_column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
        else {
            return Ok(None);
        };
        let value = self.transform.apply(value)?;
        Ok(Some(value).filter(|v| !v.is_empty()))
    }
}

/// Validated mapping rules, grouped by source in file order.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    by_source: BTreeMap<String, Vec<ColumnRule>>,
}

impl MappingTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading mapping table {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing mapping table {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: MappingFile = serde_yaml::from_str(text).context("decoding mapping yaml")?;
        Ok(Self::from_file(file)?)
    }

    pub fn from_file(file: MappingFile) -> std::result::Result<Self, MappingError> {
        if file.version != SUPPORTED_VERSION {
            return Err(MappingError::UnsupportedVersion(file.version));
        }

        let mut by_source: BTreeMap<String, Vec<ColumnRule>> = BTreeMap::new();
        for row in file.mappings {
            let source_id = row.source.trim().to_string();
            let target = Column::parse(&row.canonical_column).ok_or_else(|| {
                MappingError::UnknownColumn {
                    source_id: source_id.clone(),
                    column: row.canonical_column.clone(),
                }
            })?;
            if matches!(target, Column::Id | Column::Source) {
                return Err(MappingError::DerivedColumn {
                    source_id,
                    column: target.as_str().to_string(),
                });
            }

            let bad_transform = |tag: &str, reason: String| MappingError::BadTransform {
                source_id: source_id.clone(),
                tag: tag.to_string(),
                reason,
            };
            let transform = match row.transform.as_deref() {
                Some(tag) => Transform::parse(tag).map_err(|reason| bad_transform(tag, reason))?,
                None => Transform::Trim,
            };
            // pubDate is always normalized; other columns never are.
            let transform = match (target, transform) {
                (Column::PubDate, Transform::NormalizeTime(offset)) => Transform::NormalizeTime(offset),
                (Column::PubDate, Transform::Trim) => Transform::NormalizeTime(None),
                (Column::PubDate, _) => {
                    return Err(bad_transform(
                        row.transform.as_deref().unwrap_or_default(),
                        "pubDate only accepts normalize-time".to_string(),
                    ))
                }
                (_, Transform::NormalizeTime(_)) => {
                    return Err(bad_transform(
                        row.transform.as_deref().unwrap_or_default(),
                        "normalize-time only applies to pubDate".to_string(),
                    ))
                }
                (_, other) => other,
            };

            by_source.entry(source_id).or_default().push(ColumnRule {
                source_column: normalize_header(&row.source_column).to_string(),
                target,
                transform,
                required: row.required,
            });
        }

        for (source_id, rules) in &by_source {
            for column in [Column::Title, Column::PubDate] {
                if !rules.iter().any(|r| r.target == column) {
                    return Err(MappingError::MissingIdentityColumn {
                        source_id: source_id.clone(),
                        column: column.as_str().to_string(),
                    });
                }
            }
        }

        Ok(Self { by_source })
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.by_source.keys().map(String::as_str)
    }

    pub fn rules_for(&self, source_id: &str) -> std::result::Result<&[ColumnRule], CanonicalError> {
        self.by_source
            .get(source_id)
            .map(Vec::as_slice)
            .ok_or_else(|| CanonicalError::MissingMappingFile {
                source_id: source_id.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRow {
    pub row: usize,
    pub reason: CanonicalError,
}

#[derive(Debug, Clone, Default)]
pub struct MappedBatch {
    pub source_id: String,
    pub input_rows: usize,
    pub records: Vec<CanonicalRecord>,
    pub skipped: Vec<SkippedRow>,
}

impl MappedBatch {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn malformed_timestamps(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| matches!(s.reason, CanonicalError::MalformedTimestamp { .. }))
            .count()
    }

    pub fn unmappable_rows(&self) -> usize {
        self.skipped
            .iter()
            .filter(|s| matches!(s.reason, CanonicalError::UnmappableRecord { .. }))
            .count()
    }
}

/// Interprets a [`MappingTable`] over raw records. Performs no I/O.
#[derive(Debug, Clone)]
pub struct Mapper {
    table: MappingTable,
}

impl Mapper {
    pub fn new(table: MappingTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Maps one raw record; `row` is the 1-based data row used in errors.
    pub fn map_record(
        &self,
        raw: &RawRecord,
        source_id: &str,
        row: usize,
    ) -> std::result::Result<CanonicalRecord, CanonicalError> {
        let rules = self.table.rules_for(source_id)?;
        map_with_rules(rules, raw, source_id, row)
    }

    /// Maps a whole batch. A missing mapping aborts; row-local failures are
    /// collected in [`MappedBatch::skipped`].
    pub fn map_batch(
        &self,
        rows: &[RawRecord],
        source_id: &str,
    ) -> std::result::Result<MappedBatch, CanonicalError> {
        let rules = self.table.rules_for(source_id)?;
        let mut batch = MappedBatch {
            source_id: source_id.to_string(),
            input_rows: rows.len(),
            ..Default::default()
        };
        for (idx, raw) in rows.iter().enumerate() {
            let row = idx + 1;
            match map_with_rules(rules, raw, source_id, row) {
                Ok(record) => batch.records.push(record),
                Err(reason) if reason.is_row_local() => batch.skipped.push(SkippedRow { row, reason }),
                Err(reason) => return Err(reason),
            }
        }
        Ok(batch)
    }
}

fn map_with_rules(
    rules: &[ColumnRule],
    raw: &RawRecord,
    source_id: &str,
    row: usize,
) -> std::result::Result<CanonicalRecord, CanonicalError> {
    let mut values: BTreeMap<Column, String> = BTreeMap::new();
    let mut required = vec![Column::Title, Column::PubDate];

    for rule in rules {
        if rule.required && !required.contains(&rule.target) {
            required.push(rule.target);
        }
        // first present source column wins; later rows are fallbacks
        if values.contains_key(&rule.target) {
            continue;
        }
        if let Some(value) = rule.extract(raw)? {
            values.insert(rule.target, value);
        }
    }

    if let Some(missing) = required.iter().find(|c| !values.contains_key(c)) {
        return Err(CanonicalError::UnmappableRecord {
            row,
            column: missing.as_str().to_string(),
        });
    }

    let title = values.remove(&Column::Title).unwrap_or_default();
    let pub_date = values.remove(&Column::PubDate).unwrap_or_default();
    let mut record = CanonicalRecord::new(title, pub_date, source_id);
    for (column, value) in values {
        record.set_field(column, value)?;
    }
    Ok(record)
}

/// Loads an already-expanded raw batch from `.csv` or `.json`.
pub fn load_raw_batch(path: impl AsRef<Path>) -> Result<Vec<RawRecord>> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => read_csv_rows(path),
        "json" => {
            let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let value: JsonValue =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            json_rows(&value).with_context(|| format!("reading items from {}", path.display()))
        }
        other => anyhow::bail!("unsupported raw batch format {other:?} for {}", path.display()),
    }
}

fn read_csv_rows(path: &Path) -> Result<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(|h| normalize_header(h).to_string())
        .collect();

    let mut rows = Vec::new();
    for (idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("reading row {} of {}", idx + 1, path.display()))?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.clone(), v.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

fn json_rows(value: &JsonValue) -> Result<Vec<RawRecord>> {
    let items = match value {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => map
            .get("items")
            .and_then(JsonValue::as_array)
            .context("expected an array or an object with an \"items\" array")?,
        _ => anyhow::bail!("expected an array or an object with an \"items\" array"),
    };

    items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let object = item
                .as_object()
                .with_context(|| format!("item {} is not an object", idx + 1))?;
            Ok(object
                .iter()
                .filter_map(|(k, v)| json_scalar(v).map(|s| (normalize_header(k).to_string(), s)))
                .collect())
        })
        .collect()
}

fn json_scalar(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(_) | JsonValue::Number(_) => Some(value.to_string()),
        JsonValue::Array(_) | JsonValue::Object(_) => Some(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TABLE: &str = r#"
version: 1
mappings:
  - { source: ynet, source_column: title, canonical_column: title, transform: strip-html }
  - { source: ynet, source_column: pubDate, canonical_column: pubDate, transform: "normalize-time:+3" }
  - { source: ynet, source_column: guid, canonical_column: guid }
  - { source: ynet, source_column: link, canonical_column: link }
  - { source: ynet, source_column: enclosure_url, canonical_column: image }
  - { source: ynet, source_column: media_content_url, canonical_column: image }
  - { source: ynet, source_column: description, canonical_column: description, transform: strip-html }
"#;

    fn raw(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn mapper() -> Mapper {
        Mapper::new(MappingTable::from_yaml_str(TABLE).expect("table"))
    }

    #[test]
    fn maps_and_normalizes_a_record() {
        let record = mapper()
            .map_record(
                &raw(&[
                    ("title", "<b>Headline A</b>"),
                    ("pubDate", "2025-09-16 02:16:57"),
                    ("guid", "ynet-1"),
                    ("media_content_url", "https://img.example/a.jpg"),
                    ("description", "<p>Body &amp; more</p>"),
                ]),
                "ynet",
                1,
            )
            .expect("mapped");

        assert_eq!(record.title(), "Headline A");
        assert_eq!(record.pub_date(), "Mon, 15 Sep 2025 23:16:57+0000");
        assert_eq!(record.id(), "78f82805e1a9b5c9167bb67ff5ab6dad14bcb322");
        assert_eq!(record.source(), "ynet");
        assert_eq!(record.guid.as_deref(), Some("ynet-1"));
        assert_eq!(record.image_url.as_deref(), Some("https://img.example/a.jpg"));
        assert_eq!(record.description.as_deref(), Some("Body & more"));
        assert_eq!(record.link, None);
    }

    #[test]
    fn first_present_column_wins_for_a_target() {
        let record = mapper()
            .map_record(
                &raw(&[
                    ("title", "A"),
                    ("pubDate", "Mon, 15 Sep 2025 23:16:57 +0300"),
                    ("enclosure_url", "first.jpg"),
                    ("media_content_url", "second.jpg"),
                ]),
                "ynet",
                1,
            )
            .expect("mapped");
        assert_eq!(record.image_url.as_deref(), Some("first.jpg"));
        // explicit zone beats the table's forced offset
        assert_eq!(record.pub_date(), "Mon, 15 Sep 2025 20:16:57+0000");
    }

    #[test]
    fn unknown_source_is_fatal() {
        let err = mapper().map_batch(&[], "nowhere").unwrap_err();
        assert!(matches!(err, CanonicalError::MissingMappingFile { .. }));
        assert!(!err.is_row_local());
    }

    #[test]
    fn bad_rows_are_skipped_and_counted() {
        let rows = vec![
            raw(&[("title", "ok"), ("pubDate", "2025-09-15 10:00:00")]),
            raw(&[("pubDate", "2025-09-15 10:00:00")]),
            raw(&[("title", "bad time"), ("pubDate", "sometime")]),
            raw(&[("title", "   "), ("pubDate", "2025-09-15 10:00:00")]),
        ];
        let batch = mapper().map_batch(&rows, "ynet").expect("batch");
        assert_eq!(batch.input_rows, 4);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.skipped_count(), 3);
        assert_eq!(batch.malformed_timestamps(), 1);
        assert_eq!(batch.unmappable_rows(), 2);
        assert_eq!(
            batch.skipped[0],
            SkippedRow {
                row: 2,
                reason: CanonicalError::UnmappableRecord {
                    row: 2,
                    column: "title".into()
                }
            }
        );
    }

    #[test]
    fn required_flag_extends_required_columns() {
        let table = MappingTable::from_yaml_str(
            r#"
version: 1
mappings:
  - { source: hayom, source_column: t, canonical_column: title }
  - { source: hayom, source_column: d, canonical_column: pubDate }
  - { source: hayom, source_column: l, canonical_column: link, required: true }
"#,
        )
        .expect("table");
        let err = Mapper::new(table)
            .map_record(&raw(&[("t", "A"), ("d", "2025-09-15")]), "hayom", 7)
            .unwrap_err();
        assert_eq!(
            err,
            CanonicalError::UnmappableRecord {
                row: 7,
                column: "link".into()
            }
        );
    }

    #[test]
    fn table_validation_rejects_bad_rows() {
        let cases = [
            "version: 2\nmappings: []\n",
            "version: 1\nmappings:\n  - { source: a, source_column: x, canonical_column: nope }\n",
            "version: 1\nmappings:\n  - { source: a, source_column: x, canonical_column: id }\n",
            "version: 1\nmappings:\n  - { source: a, source_column: x, canonical_column: title, transform: shout }\n",
            "version: 1\nmappings:\n  - { source: a, source_column: x, canonical_column: title, transform: normalize-time }\n",
            "version: 1\nmappings:\n  - { source: a, source_column: x, canonical_column: title }\n",
        ];
        for yaml in cases {
            assert!(MappingTable::from_yaml_str(yaml).is_err(), "{yaml}");
        }
    }

    #[test]
    fn loads_csv_batch_with_bom_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("items.csv");
        fs::write(&path, "\u{feff}title,pubDate\nA,2025-09-15 10:00:00\n").expect("write");
        let rows = load_raw_batch(&path).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("title").map(String::as_str), Some("A"));
    }

    #[test]
    fn loads_json_items_and_stringifies_scalars() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("items.json");
        fs::write(
            &path,
            r#"{"items": [{"title": "A", "rank": 3, "guid": null, "media": {"url": "x"}}]}"#,
        )
        .expect("write");
        let rows = load_raw_batch(&path).expect("rows");
        assert_eq!(rows[0].get("rank").map(String::as_str), Some("3"));
        assert!(!rows[0].contains_key("guid"));
        assert_eq!(rows[0].get("media").map(String::as_str), Some(r#"{"url":"x"}"#));
    }

    #[test]
    fn strip_html_collapses_whitespace() {
        assert_eq!(strip_html("<p>One\n <i>two</i></p><br/>three"), "One two three");
    }
}
