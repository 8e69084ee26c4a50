//! Whitespace and newline canonicalization.
//!
//! Filing extracts and scraped press releases arrive with a mix of
//! Windows/Mac newlines, non-breaking spaces, and hard-wrapped lines.
//! [`normalize_text`] collapses all of that into paragraph text: blank-line
//! runs become a single `\n\n` break, single newlines inside a paragraph
//! become spaces, and space/tab/NBSP runs collapse to one space.

use once_cell::sync::Lazy;
use regex::Regex;

static PARAGRAPH_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n+").unwrap());
static SPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());

/// Collapse newline and whitespace variants into canonical paragraph text.
///
/// Pure function; the output contains paragraphs separated by exactly one
/// blank line, with no leading/trailing whitespace and no empty paragraphs.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = PARAGRAPH_BREAKS.replace_all(&text, "\n\n");

    let paragraphs: Vec<String> = text
        .split("\n\n")
        .map(|para| {
            let folded = para.replace('\n', " ");
            SPACE_RUNS.replace_all(&folded, " ").trim().to_string()
        })
        .filter(|para| !para.is_empty())
        .collect();

    paragraphs.join("\n\n")
}
