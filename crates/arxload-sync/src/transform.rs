use std::path::{Path, PathBuf};

use arxload_core::{parse_categories, FailureRecord, PaperRecord, WriteOperation};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::SyncError;

const PARSE_PROGRESS_EVERY: u64 = 10_000;
const READ_BUFFER: usize = 1024 * 1024;

/// What a single corpus line turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    Blank,
    Malformed(String),
    MissingId,
    Operation(WriteOperation),
}

/// Fields are kept as loose JSON so one oddly typed value (a numeric title,
/// an author list) does not cost the whole record.
#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    title: Option<Value>,
    #[serde(default)]
    authors: Option<Value>,
    #[serde(rename = "abstract", default)]
    abstract_text: Option<Value>,
    #[serde(default)]
    categories: Option<Value>,
    #[serde(default)]
    update_date: Option<Value>,
}

fn id_text(value: Option<Value>) -> Option<String> {
    let id = match value? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.trim().is_empty()).then_some(id)
}

fn field_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Array(items) if items.iter().all(Value::is_string) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        other => Some(other.to_string()),
    }
}

fn category_codes(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => parse_categories(Some(&s)),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(code) if !code.trim().is_empty() => Some(code.trim().to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub fn parse_line(line: &str) -> LineOutcome {
    if line.trim().is_empty() {
        return LineOutcome::Blank;
    }
    let raw: RawRecord = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(err) => return LineOutcome::Malformed(err.to_string()),
    };
    let Some(id) = id_text(raw.id) else {
        return LineOutcome::MissingId;
    };
    LineOutcome::Operation(WriteOperation::upsert(PaperRecord {
        id,
        title: field_text(raw.title),
        authors: field_text(raw.authors),
        abstract_text: field_text(raw.abstract_text),
        categories: category_codes(raw.categories),
        update_date: field_text(raw.update_date),
    }))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub lines: u64,
    pub operations: u64,
    pub blank: u64,
    pub malformed: u64,
    pub missing_id: u64,
}

impl TransformStats {
    pub fn skipped(&self) -> u64 {
        self.blank + self.malformed + self.missing_id
    }
}

/// Anything that can feed the batch writer one operation at a time.
#[async_trait]
pub trait OperationSource: Send {
    /// `Ok(None)` once the source is exhausted. Errors are fatal for the run.
    async fn next_operation(&mut self) -> Result<Option<WriteOperation>, SyncError>;

    /// Entries the source could not turn into operations, for the dead-letter
    /// collection. Called by the writer after each batch.
    fn drain_rejected(&mut self) -> Vec<FailureRecord> {
        Vec::new()
    }
}

/// Forward-only line reader over the snapshot artifact.
pub struct RecordTransformer<R> {
    reader: R,
    origin: PathBuf,
    buf: Vec<u8>,
    stats: TransformStats,
}

impl RecordTransformer<BufReader<File>> {
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        let file = File::open(path).await.map_err(|source| SyncError::ArtifactIo {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::with_capacity(READ_BUFFER, file), path))
    }
}

impl<R: AsyncBufRead + Unpin + Send> RecordTransformer<R> {
    pub fn new(reader: R, origin: impl Into<PathBuf>) -> Self {
        Self {
            reader,
            origin: origin.into(),
            buf: Vec::new(),
            stats: TransformStats::default(),
        }
    }

    pub fn stats(&self) -> TransformStats {
        self.stats
    }

    /// Read the next line and classify it. `Ok(None)` at end of input.
    pub async fn next_outcome(&mut self) -> Result<Option<LineOutcome>, SyncError> {
        self.buf.clear();
        let read = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|source| SyncError::ArtifactIo {
                path: self.origin.clone(),
                source,
            })?;
        if read == 0 {
            return Ok(None);
        }

        self.stats.lines += 1;
        if self.stats.lines % PARSE_PROGRESS_EVERY == 0 {
            info!(
                lines = self.stats.lines,
                operations = self.stats.operations,
                skipped = self.stats.skipped(),
                "parse progress"
            );
        }

        let outcome = match std::str::from_utf8(&self.buf) {
            Ok(line) => parse_line(line),
            Err(err) => LineOutcome::Malformed(err.to_string()),
        };
        match &outcome {
            LineOutcome::Blank => self.stats.blank += 1,
            LineOutcome::Malformed(reason) => {
                debug!(line = self.stats.lines, %reason, "skipping malformed line");
                self.stats.malformed += 1;
            }
            LineOutcome::MissingId => self.stats.missing_id += 1,
            LineOutcome::Operation(_) => self.stats.operations += 1,
        }
        Ok(Some(outcome))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> OperationSource for RecordTransformer<R> {
    async fn next_operation(&mut self) -> Result<Option<WriteOperation>, SyncError> {
        while let Some(outcome) = self.next_outcome().await? {
            if let LineOutcome::Operation(op) = outcome {
                return Ok(Some(op));
            }
        }
        info!(
            lines = self.stats.lines,
            operations = self.stats.operations,
            blank = self.stats.blank,
            malformed = self.stats.malformed,
            missing_id = self.stats.missing_id,
            "artifact fully read"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operation(line: &str) -> WriteOperation {
        match parse_line(line) {
            LineOutcome::Operation(op) => op,
            other => panic!("expected operation, got {other:?}"),
        }
    }

    #[test]
    fn categories_are_split_on_whitespace_in_order() {
        let op = operation(r#"{"id":"0704.0001","categories":"cs.AI cs.LG  math.CO"}"#);
        assert_eq!(op.record().categories, vec!["cs.AI", "cs.LG", "math.CO"]);
    }

    #[test]
    fn absent_fields_stay_absent() {
        let op = operation(r#"{"id":"0704.0002","title":"Sparsity-certifying Graph Decompositions"}"#);
        let record = op.record();
        assert_eq!(op.natural_id(), "0704.0002");
        assert!(record.authors.is_none());
        assert!(record.abstract_text.is_none());
        assert!(record.categories.is_empty());

        let json = serde_json::to_value(record).expect("serialize");
        assert!(json.get("authors").is_none());
        assert_eq!(json["categories"], serde_json::json!([]));
    }

    #[test]
    fn bad_lines_are_classified_not_fatal() {
        assert_eq!(parse_line("   "), LineOutcome::Blank);
        assert!(matches!(parse_line("{not json"), LineOutcome::Malformed(_)));
        assert_eq!(parse_line(r#"{"title":"no id"}"#), LineOutcome::MissingId);
        assert_eq!(parse_line(r#"{"id":"","title":"empty id"}"#), LineOutcome::MissingId);
    }

    #[test]
    fn oddly_typed_fields_are_coerced_not_rejected() {
        let op = operation(
            r#"{"id":7040004,"title":1729,"authors":["C. Pan","S. Smith"],"categories":["math.CO"," "],"abstract":null}"#,
        );
        let record = op.record();
        assert_eq!(op.natural_id(), "7040004");
        assert_eq!(record.title.as_deref(), Some("1729"));
        assert_eq!(record.authors.as_deref(), Some("C. Pan, S. Smith"));
        assert!(record.abstract_text.is_none());
        assert_eq!(record.categories, vec!["math.CO"]);
    }

    #[test]
    fn non_scalar_id_counts_as_missing() {
        assert_eq!(parse_line(r#"{"id":{"n":1},"title":"t"}"#), LineOutcome::MissingId);
        assert_eq!(parse_line(r#"{"id":null}"#), LineOutcome::MissingId);
    }

    #[test]
    fn extra_fields_are_ignored() {
        let op = operation(
            r#"{"id":"0704.0003","submitter":"Hongjun Pan","versions":[{"version":"v1"}],"update_date":"2008-01-13"}"#,
        );
        assert_eq!(op.record().update_date.as_deref(), Some("2008-01-13"));
    }

    #[tokio::test]
    async fn stream_skips_and_counts_bad_lines() {
        let input = concat!(
            "{\"id\":\"a\",\"categories\":\"hep-ph\"}\n",
            "\n",
            "garbage\n",
            "{\"title\":\"orphan\"}\n",
            "{\"id\":\"b\"}"
        );
        let mut transformer = RecordTransformer::new(input.as_bytes(), "inline");

        let mut ids = Vec::new();
        while let Some(op) = transformer.next_operation().await.expect("read") {
            ids.push(op.natural_id().to_string());
        }

        assert_eq!(ids, vec!["a", "b"]);
        let stats = transformer.stats();
        assert_eq!(stats.lines, 5);
        assert_eq!(stats.operations, 2);
        assert_eq!((stats.blank, stats.malformed, stats.missing_id), (1, 1, 1));
    }

    #[tokio::test]
    async fn invalid_utf8_is_malformed_not_an_io_error() {
        let input: &[u8] = b"\xff\xfe\n{\"id\":\"ok\"}\n";
        let mut transformer = RecordTransformer::new(input, "inline");
        let first = transformer.next_outcome().await.expect("read");
        assert!(matches!(first, Some(LineOutcome::Malformed(_))));
        assert!(transformer.next_operation().await.expect("read").is_some());
    }
}
