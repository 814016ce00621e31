//! Script output capture: the reader that pumps a process's merged output
//! stream into the coordination queue, the per-script raw log, and the
//! presentation helpers used to filter and highlight it.
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::{OnceLock, mpsc::Sender};
use std::thread::{self, JoinHandle};
use strum_macros::{AsRefStr, Display, EnumIter};
use tracing::{debug, warn};

use crate::registry::LaunchId;
use crate::supervisor::WorkerMessage;

/// Every output chunk received for a script since its last start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutputLog {
    lines: Vec<String>,
}

impl RawOutputLog {
    /// Appends a chunk as received.
    pub fn push(&mut self, chunk: impl Into<String>) {
        self.lines.push(chunk.into());
    }

    /// Drops every chunk.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Number of chunks held.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Chunks in arrival order.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Replays the log through a case-insensitive substring filter. A blank
    /// term matches everything.
    pub fn filter(&self, term: &str) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|line| matches_filter(line, term))
            .map(String::as_str)
            .collect()
    }
}

/// Case-insensitive substring match used by the output filter. A blank term
/// matches every line.
pub fn matches_filter(line: &str, term: &str) -> bool {
    let term = term.trim();
    term.is_empty() || line.to_lowercase().contains(&term.to_lowercase())
}

/// Highlight category of a keyword found in an output line.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, AsRefStr, Display, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LineTag {
    Error,
    Warning,
    Success,
    Info,
}

impl LineTag {
    /// Keywords for this tag, longest first so alternation prefers them.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            LineTag::Error => &["exception", "failed", "error", "fatal"],
            LineTag::Warning => &["warning", "warn"],
            LineTag::Success => &["completed", "finished", "success"],
            LineTag::Info => &["starting", "running", "info"],
        }
    }
}

/// A tagged byte range within a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaggedSpan {
    pub tag: LineTag,
    pub start: usize,
    pub end: usize,
}

fn keyword_patterns() -> &'static [(LineTag, Regex)] {
    static PATTERNS: OnceLock<Vec<(LineTag, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        use strum::IntoEnumIterator;

        LineTag::iter()
            .map(|tag| {
                let alternation = tag
                    .keywords()
                    .iter()
                    .map(|word| regex::escape(word))
                    .collect::<Vec<_>>()
                    .join("|");
                let pattern = RegexBuilder::new(&alternation)
                    .case_insensitive(true)
                    .build()
                    .expect("keyword alternation is a valid pattern");
                (tag, pattern)
            })
            .collect()
    })
}

/// Finds every keyword occurrence in `line`, case-insensitively, ordered by
/// position. Occurrences of different tags may overlap.
pub fn tag_keywords(line: &str) -> Vec<TaggedSpan> {
    let mut spans: Vec<TaggedSpan> = keyword_patterns()
        .iter()
        .flat_map(|(tag, pattern)| {
            pattern.find_iter(line).map(|found| TaggedSpan {
                tag: *tag,
                start: found.start(),
                end: found.end(),
            })
        })
        .collect();
    spans.sort_by_key(|span| (span.start, span.end));
    spans
}

/// Byte ranges of every case-insensitive occurrence of `term` in `line`.
pub fn search_matches(line: &str, term: &str) -> Vec<(usize, usize)> {
    let term = term.trim();
    if term.is_empty() {
        return Vec::new();
    }
    match RegexBuilder::new(&regex::escape(term))
        .case_insensitive(true)
        .build()
    {
        Ok(pattern) => pattern
            .find_iter(line)
            .map(|found| (found.start(), found.end()))
            .collect(),
        Err(err) => {
            debug!("Search term {term:?} not usable: {err}");
            Vec::new()
        }
    }
}

/// Background reader for one launch's merged output stream.
pub struct OutputPump;

impl OutputPump {
    /// Spawns the reader thread. Every newline-terminated chunk, plus any
    /// trailing unterminated remainder, is queued as it is read; the end of
    /// the stream is queued last.
    pub(crate) fn spawn<R>(
        name: &str,
        launch: LaunchId,
        stream: R,
        queue: Sender<WorkerMessage>,
    ) -> io::Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        let script = name.to_string();
        thread::Builder::new()
            .name(format!("output-{name}"))
            .spawn(move || pump(&script, launch, stream, &queue))
    }
}

pub(crate) fn pump<R: Read>(name: &str, launch: LaunchId, stream: R, queue: &Sender<WorkerMessage>) {
    let mut reader = BufReader::new(stream);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer) {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&buffer).into_owned();
                if queue.send(WorkerMessage::Output { launch, chunk }).is_err() {
                    debug!("Coordination queue closed; abandoning output of '{name}'");
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("Error reading output of '{name}': {err}");
                break;
            }
        }
    }

    debug!("Output stream of '{name}' closed");
    let _ = queue.send(WorkerMessage::StreamClosed { launch });
}
