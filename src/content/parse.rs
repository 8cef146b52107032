//! Splits model output into subject and body.
//!
//! Expected shape:
//!
//! ```text
//! Subject: <line>
//! Body:
//! <text>
//! ```
//!
//! Labels are case-insensitive and may be wrapped in markdown bold. A missing
//! `Body:` label is tolerated: the body is everything after the subject line.

use std::sync::LazyLock;

use regex::Regex;

use crate::contacts::model::Stage;
use crate::content::EmailContent;
use crate::error::GenerationError;

static LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[\s*#_]*(subject|body)[*_]*\s*:[*_]*(.*)$").unwrap()
});

/// Match `label:` at the start of a line, returning the rest of the line.
fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let caps = LABEL.captures(line)?;
    if !caps.get(1)?.as_str().eq_ignore_ascii_case(label) {
        return None;
    }
    Some(caps.get(2).map_or("", |m| m.as_str().trim()))
}

fn join_trimmed(lines: &[&str]) -> String {
    lines.join("\n").trim().to_string()
}

/// Parse `Subject:` / `Body:` output for `stage`.
pub fn parse_subject_body(text: &str, stage: Stage) -> Result<EmailContent, GenerationError> {
    let malformed = |reason: &str| GenerationError::Malformed {
        stage: stage.to_string(),
        reason: reason.to_string(),
    };

    let lines: Vec<&str> = text.trim().lines().collect();
    let (subject_idx, subject_rest) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| strip_label(line, "subject").map(|rest| (i, rest)))
        .ok_or_else(|| malformed("missing Subject: label"))?;

    let after_subject = &lines[subject_idx + 1..];
    let body_label = after_subject
        .iter()
        .enumerate()
        .find_map(|(i, line)| strip_label(line, "body").map(|rest| (i, rest)));

    let (subject, body) = match body_label {
        Some((body_idx, body_rest)) => {
            let subject = if subject_rest.is_empty() {
                join_trimmed(&after_subject[..body_idx])
            } else {
                subject_rest.to_string()
            };
            let mut body_lines = vec![body_rest];
            body_lines.extend_from_slice(&after_subject[body_idx + 1..]);
            (subject, join_trimmed(&body_lines))
        }
        None if !subject_rest.is_empty() => {
            (subject_rest.to_string(), join_trimmed(after_subject))
        }
        None => {
            // "Subject:" alone on its line: next non-empty line is the subject.
            let mut rest = after_subject.iter().skip_while(|l| l.trim().is_empty());
            let subject = rest.next().map(|l| l.trim().to_string()).unwrap_or_default();
            let remaining: Vec<&str> = rest.copied().collect();
            (subject, join_trimmed(&remaining))
        }
    };

    if subject.is_empty() {
        return Err(malformed("empty subject"));
    }
    if body.is_empty() {
        return Err(malformed("empty body"));
    }

    Ok(EmailContent { subject, body })
}
