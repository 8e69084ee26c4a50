//! Document source input.
//!
//! Fetching and scraping live outside this tool; documents arrive as
//! JSON Lines, one [`SourceDocument`] per line.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

use crate::models::SourceDocument;

/// Read a JSONL file of source documents. Blank lines are skipped; a line
/// that fails to parse aborts the read with its line number.
pub fn read_documents(path: &Path) -> Result<Vec<SourceDocument>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open document file {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut documents = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: SourceDocument = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid document", path.display(), index + 1))?;
        documents.push(doc);
    }
    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_reads_documents_and_skips_blank_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docs.jsonl");
        let mut f = File::create(&path).unwrap();
        writeln!(
            f,
            r#"{{"text": "first filing", "meta": {{"source_id": "ACC-1", "timestamp": "2025-03-01", "form_type": "10-Q"}}}}"#
        )
        .unwrap();
        writeln!(f).unwrap();
        writeln!(
            f,
            r#"{{"text": "second filing", "meta": {{"source_id": "ACC-2", "timestamp": "2025-04-01"}}}}"#
        )
        .unwrap();

        let docs = read_documents(&path).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].meta.source_id, "ACC-1");
        assert_eq!(docs[0].meta.field("form_type"), Some("10-Q"));
        assert_eq!(docs[1].text, "second filing");
    }

    #[test]
    fn test_invalid_line_reports_its_number() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docs.jsonl");
        std::fs::write(&path, "{\"text\": \"ok\", \"meta\": {\"source_id\": \"A\", \"timestamp\": \"t\"}}\nnot json\n").unwrap();

        let err = read_documents(&path).unwrap_err();
        assert!(format!("{:#}", err).contains(":2"));
    }

    #[test]
    fn test_missing_file_errors() {
        assert!(read_documents(Path::new("/nonexistent/docs.jsonl")).is_err());
    }
}
