//! splits streamed markdown into title, numbered locations and summary.
//!
//! the model is asked to separate every block with `---`:
//!
//! ```text
//! ## <title>
//! ---
//! ### 1. <location>
//! <details>
//! ---
//! **Summary:** <closing paragraph>
//! ```
//!
//! [`parse_document`] is a pure function that gets called on every growing prefix of the
//! response, so it never fails: incomplete blocks just produce fewer locations.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const SEPARATOR: &str = "---";

static HEADING_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s*").expect("static regex"));
static LOCATION_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^###\s*\d+\.\s*([^\n]+)").expect("static regex"));
static SUMMARY_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:#+\s*|\*{1,2}\s*)?summary\b\s*(?:\*{1,2})?\s*:?\s*(?:\*{1,2})?")
        .expect("static regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub title: String,
    pub content: String,
}

/// structured view of a (possibly partial) response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub title: String,
    pub locations: Vec<Location>,
    pub summary: String,
}

impl ParsedDocument {
    pub fn is_empty(&self) -> bool {
        self.title.is_empty() && self.locations.is_empty() && self.summary.is_empty()
    }
}

pub fn parse_document(text: &str) -> ParsedDocument {
    let segments: Vec<&str> = text
        .split(SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let Some(first) = segments.first() else {
        return ParsedDocument::default();
    };

    let title = if is_location_block(first) {
        String::new()
    } else {
        HEADING_MARKER.replace(first, "").trim().to_string()
    };

    let locations = segments
        .iter()
        .copied()
        .filter(|s| is_location_block(s))
        .filter_map(parse_location)
        .collect();

    let summary = match segments.last() {
        Some(last) if segments.len() > 1 && !is_location_block(last) => {
            SUMMARY_LABEL.replace(last, "").trim().to_string()
        }
        _ => String::new(),
    };

    ParsedDocument { title, locations, summary }
}

fn is_location_block(segment: &str) -> bool {
    segment.starts_with("###")
}

/// `None` unless both the heading text and the body survive stripping.
fn parse_location(segment: &str) -> Option<Location> {
    let caps = LOCATION_HEADING.captures(segment)?;
    let title = caps.get(1)?.as_str().trim();
    let heading_end = caps.get(0)?.end();

    let content = segment[heading_end..]
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if title.is_empty() || content.is_empty() {
        return None;
    }
    Some(Location { title: title.to_string(), content })
}
