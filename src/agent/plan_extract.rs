//! Plan artifact extraction from agent transcripts.
//!
//! Agents stream free-form text; the plan is recovered with a fixed
//! precedence: an explicit marker block, then the first bulleted list,
//! then the first numbered list, then a truncated prefix of the
//! transcript. The precedence is contract; the marker strings are
//! per-agent data.

/// Cap applied by the last-resort extraction.
const TRUNCATED_CHARS: usize = 500;

/// How a plan was recovered from the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanExtract {
    /// Text between a known begin marker and the matching end marker (or
    /// end of transcript).
    Marked {
        /// The begin marker that matched.
        prefix: String,
        /// The delimited plan body.
        body: String,
    },
    /// The first run of bulleted lines (`- ` or `* `).
    BulletList(Vec<String>),
    /// The first run of numbered lines (`1.`, `2)` …).
    NumberedList(Vec<String>),
    /// No structure found; the transcript's first 500 characters.
    Truncated(String),
}

impl PlanExtract {
    /// The plan text regardless of how it was recovered.
    #[must_use]
    pub fn plan_text(&self) -> String {
        match self {
            Self::Marked { body, .. } | Self::Truncated(body) => body.clone(),
            Self::BulletList(lines) | Self::NumberedList(lines) => lines.join("\n"),
        }
    }
}

/// A begin/end marker pair delimiting a plan block.
#[derive(Debug, Clone, Copy)]
pub struct PlanMarker {
    /// Line prefix that opens the block.
    pub begin: &'static str,
    /// Line prefix that closes it; an empty string means "until EOF".
    pub end: &'static str,
}

/// Extract a plan from `transcript`, trying `markers` in order.
#[must_use]
pub fn extract_plan(transcript: &str, markers: &[PlanMarker]) -> PlanExtract {
    for marker in markers {
        if let Some(body) = marked_block(transcript, marker) {
            return PlanExtract::Marked {
                prefix: marker.begin.to_owned(),
                body,
            };
        }
    }

    if let Some(lines) = list_run(transcript, is_bullet_line) {
        return PlanExtract::BulletList(lines);
    }
    if let Some(lines) = list_run(transcript, is_numbered_line) {
        return PlanExtract::NumberedList(lines);
    }

    PlanExtract::Truncated(transcript.chars().take(TRUNCATED_CHARS).collect())
}

fn marked_block(transcript: &str, marker: &PlanMarker) -> Option<String> {
    let start = transcript.find(marker.begin)?;
    let body_start = start + marker.begin.len();
    let rest = &transcript[body_start..];
    let body = if marker.end.is_empty() {
        rest
    } else {
        match rest.find(marker.end) {
            Some(end) => &rest[..end],
            None => rest,
        }
    };
    let body = body.trim();
    if body.is_empty() {
        None
    } else {
        Some(body.to_owned())
    }
}

fn list_run(transcript: &str, matches: fn(&str) -> bool) -> Option<Vec<String>> {
    let mut run: Vec<String> = Vec::new();
    for line in transcript.lines() {
        let trimmed = line.trim();
        if matches(trimmed) {
            run.push(trimmed.to_owned());
        } else if !run.is_empty() && !trimmed.is_empty() {
            // The first non-blank, non-matching line ends the run.
            break;
        }
    }
    if run.is_empty() {
        None
    } else {
        Some(run)
    }
}

fn is_bullet_line(line: &str) -> bool {
    line.starts_with("- ") || line.starts_with("* ")
}

fn is_numbered_line(line: &str) -> bool {
    let mut chars = line.chars();
    let mut saw_digit = false;
    for c in chars.by_ref() {
        if c.is_ascii_digit() {
            saw_digit = true;
        } else {
            return saw_digit && (c == '.' || c == ')');
        }
    }
    false
}
