//! Evidence reconciliation
//!
//! Detectors run independently and asynchronously; each one owns exactly
//! one line of an entity's composite explanation per reason type and can
//! update it idempotently. The stored message is a newline-joined sequence
//! of `[source] text` lines in first-seen order. Malformed input is
//! downgraded to a legacy line, never dropped.

use warden_common::db::models::{Reason, ReasonMap, ReasonType};

/// Prefix assigned to lines that predate source tagging or fail to parse
const LEGACY_PREFIX: &str = "Legacy";

/// Collapse a detector message to a single trimmed line so each
/// contribution occupies exactly one line of the composite.
fn normalize(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a stored message into ordered `(prefix, text)` pairs.
///
/// A non-empty line carrying a leading `[...]` bracket yields its bracket
/// content as the prefix. A line with an unterminated bracket, or none at
/// all, is reclassified under the legacy prefix with its text intact.
fn parse_lines(message: &str) -> Vec<(String, String)> {
    let mut lines = Vec::new();
    for raw in message.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            if let Some(close) = rest.find(']') {
                let prefix = rest[..close].to_string();
                let text = rest[close + 1..].trim_start().to_string();
                lines.push((prefix, text));
                continue;
            }
        }
        lines.push((LEGACY_PREFIX.to_string(), line.to_string()));
    }
    lines
}

fn render_lines(lines: &[(String, String)]) -> String {
    lines
        .iter()
        .map(|(prefix, text)| format!("[{}] {}", prefix, text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Merge one detector finding into the reasons map.
///
/// The source's existing line is replaced in place; a new source appends
/// at the end. Confidence never decreases and evidence accumulates as an
/// order-preserving deduplicated union.
pub fn merge(reasons: &mut ReasonMap, reason_type: ReasonType, incoming: &Reason, source_id: &str) {
    let normalized = normalize(&incoming.message);

    match reasons.get_mut(&reason_type) {
        None => {
            let mut evidence = Vec::new();
            for item in &incoming.evidence {
                if !evidence.contains(item) {
                    evidence.push(item.clone());
                }
            }
            reasons.insert(
                reason_type,
                Reason {
                    message: format!("[{}] {}", source_id, normalized),
                    confidence: incoming.confidence,
                    evidence,
                },
            );
        }
        Some(existing) => {
            let mut lines = parse_lines(&existing.message);
            match lines.iter_mut().find(|(prefix, _)| prefix == source_id) {
                Some((_, text)) => *text = normalized,
                None => lines.push((source_id.to_string(), normalized)),
            }
            existing.message = render_lines(&lines);
            existing.confidence = existing.confidence.max(incoming.confidence);
            for item in &incoming.evidence {
                if !existing.evidence.contains(item) {
                    existing.evidence.push(item.clone());
                }
            }
        }
    }
}
