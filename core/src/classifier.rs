//! Turns the executor's free-text stdout into typed events.
//!
//! Bytes are first reassembled into lines by [`LineFramer`] and only then
//! decoded, so neither a line nor a multi-byte character split across read
//! boundaries changes the outcome. Each complete line is classified by
//! [`LineClassifier`]: an optional structured JSON record first, then the
//! progress and result markers, then plain log text.

use std::io;

use futures::Stream;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::config::ClassifierConfig;

pub(crate) const READ_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedEvent {
    Status(String),
    Log(String),
    Error(String),
    Result(String),
}

impl ClassifiedEvent {
    /// Error-stream bytes are never parsed: each chunk maps to one event.
    pub fn from_error_chunk(chunk: &[u8]) -> Self {
        Self::Error(String::from_utf8_lossy(chunk).into_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerSet {
    progress: Vec<String>,
    result: String,
    structured_records: bool,
}

impl MarkerSet {
    pub fn new(
        progress: impl IntoIterator<Item = impl Into<String>>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            progress: progress
                .into_iter()
                .map(Into::into)
                .filter(|marker: &String| !marker.is_empty())
                .collect(),
            result: result.into(),
            structured_records: true,
        }
    }

    pub fn with_structured_records(mut self, enabled: bool) -> Self {
        self.structured_records = enabled;
        self
    }

    /// Classifies a single line without any stream context.
    pub fn classify(&self, line: &str) -> Option<ClassifiedEvent> {
        if line.trim().is_empty() {
            return None;
        }

        if self.structured_records
            && let Some(event) = parse_structured_record(line)
        {
            return Some(event);
        }

        if self.progress.iter().any(|marker| line.contains(marker.as_str())) {
            let status = self.strip_markers(line);
            if status.is_empty() {
                return None;
            }
            return Some(ClassifiedEvent::Status(status));
        }

        if !self.result.is_empty()
            && let Some((_, rest)) = line.split_once(self.result.as_str())
        {
            return Some(ClassifiedEvent::Result(rest.trim().to_string()));
        }

        Some(ClassifiedEvent::Log(line.to_string()))
    }

    fn strip_markers(&self, line: &str) -> String {
        let mut text = line.to_string();
        for marker in &self.progress {
            text = text.replace(marker.as_str(), "");
        }
        if !self.result.is_empty() {
            text = text.replace(self.result.as_str(), "");
        }
        text.trim().to_string()
    }
}

impl Default for MarkerSet {
    fn default() -> Self {
        ClassifierConfig::default().markers()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum RecordKind {
    Status,
    Log,
    Error,
    Result,
}

#[derive(Deserialize)]
struct StructuredRecord {
    kind: RecordKind,
    payload: String,
}

fn parse_structured_record(line: &str) -> Option<ClassifiedEvent> {
    if !line.trim_start().starts_with('{') {
        return None;
    }
    let record: StructuredRecord = serde_json::from_str(line.trim()).ok()?;
    Some(match record.kind {
        RecordKind::Status => ClassifiedEvent::Status(record.payload),
        RecordKind::Log => ClassifiedEvent::Log(record.payload),
        RecordKind::Error => ClassifiedEvent::Error(record.payload),
        RecordKind::Result => ClassifiedEvent::Result(record.payload),
    })
}

/// Longest line the framer buffers. Anything past it is dropped up to the
/// next newline and the line is emitted with [`TRUNCATION_MARKER`].
pub const MAX_LINE_BYTES: usize = 256 * 1024;
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Reassembles arbitrary byte chunks into `\n`-terminated lines.
#[derive(Debug)]
pub struct LineFramer {
    pending: Vec<u8>,
    max_line_bytes: usize,
    /// The pending line hit `max_line_bytes`; discard until its newline.
    truncated: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
            truncated: false,
        }
    }

    /// Returns every line completed by `chunk`, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|byte| *byte == b'\n') {
            let (head, tail) = rest.split_at(pos);
            if self.pending.is_empty() && head.len() <= self.max_line_bytes {
                lines.push(decode_line(head));
            } else {
                self.buffer(head);
                lines.push(self.take_line());
            }
            rest = &tail[1..];
        }
        self.buffer(rest);
        lines
    }

    /// Flushes the trailing partial line once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        Some(self.take_line())
    }

    fn buffer(&mut self, bytes: &[u8]) {
        if self.truncated {
            return;
        }
        let room = self.max_line_bytes.saturating_sub(self.pending.len());
        if bytes.len() <= room {
            self.pending.extend_from_slice(bytes);
        } else {
            self.pending.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        }
    }

    fn take_line(&mut self) -> String {
        let line = if self.truncated {
            let mut line = decode_line(utf8_prefix(&self.pending));
            line.push_str(TRUNCATION_MARKER);
            line
        } else {
            decode_line(&self.pending)
        };
        self.pending.clear();
        self.truncated = false;
        line
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Drops a multi-byte character cut off by truncation.
fn utf8_prefix(bytes: &[u8]) -> &[u8] {
    match std::str::from_utf8(bytes) {
        Err(err) if err.error_len().is_none() => &bytes[..err.valid_up_to()],
        _ => bytes,
    }
}

/// Stateful classifier for one mission's stdout.
///
/// Once a result line has been seen the mission is concluded: later lines are
/// kept as residual log instead of being emitted.
#[derive(Debug)]
pub struct LineClassifier {
    framer: LineFramer,
    markers: MarkerSet,
    concluded: bool,
    residual: Vec<String>,
}

impl LineClassifier {
    pub fn new(markers: MarkerSet) -> Self {
        Self {
            framer: LineFramer::new(),
            markers,
            concluded: false,
            residual: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<ClassifiedEvent> {
        let lines = self.framer.push(chunk);
        lines
            .into_iter()
            .filter_map(|line| self.classify_line(line))
            .collect()
    }

    pub fn finish(&mut self) -> Vec<ClassifiedEvent> {
        self.framer
            .finish()
            .and_then(|line| self.classify_line(line))
            .into_iter()
            .collect()
    }

    pub fn concluded(&self) -> bool {
        self.concluded
    }

    pub fn residual(&self) -> &[String] {
        &self.residual
    }

    fn classify_line(&mut self, line: String) -> Option<ClassifiedEvent> {
        if self.concluded {
            if !line.trim().is_empty() {
                self.residual.push(line);
            }
            return None;
        }
        let event = self.markers.classify(&line)?;
        if matches!(event, ClassifiedEvent::Result(_)) {
            self.concluded = true;
        }
        Some(event)
    }
}

/// Lazily classifies everything read from `reader`, flushing the trailing
/// partial line at EOF.
pub fn classify_stream<R>(
    mut reader: R,
    markers: MarkerSet,
) -> impl Stream<Item = io::Result<ClassifiedEvent>>
where
    R: AsyncRead + Unpin,
{
    async_stream::try_stream! {
        let mut classifier = LineClassifier::new(markers);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for event in classifier.push(&buf[..n]) {
                yield event;
            }
        }
        for event in classifier.finish() {
            yield event;
        }
        if !classifier.residual().is_empty() {
            debug!(
                lines = classifier.residual().len(),
                "executor kept writing after its result"
            );
        }
    }
}
