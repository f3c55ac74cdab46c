//! Prefix → identifier lookup table.
//!
//! The table is a two-column CSV: a prefix and the identifier files starting
//! with that prefix belong to. Prefixes are written the way the source system
//! names things (`ACME|2021/Q3`), while exported file names replace those
//! separators with `-`, so prefixes are normalized before matching.

use std::path::Path;

use crate::task::Task;
use crate::{RelayError, Result};

/// Characters that file names cannot carry and were replaced by `-`.
const SEPARATOR_CHARS: [char; 4] = ['|', '/', ':', '"'];

#[derive(Debug, Clone, Default)]
pub struct IdTable {
    // Sorted longest prefix first so the most specific entry wins.
    entries: Vec<(String, String)>,
}

impl IdTable {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|(line, reason)| RelayError::IdTable {
            path: path.to_path_buf(),
            line,
            reason,
        })
    }

    /// Parses CSV text. Errors carry the 1-based line number.
    pub fn parse(content: &str) -> std::result::Result<Self, (usize, String)> {
        let mut entries = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_record(line).map_err(|e| (idx + 1, e))?;
            if fields.len() < 2 {
                return Err((idx + 1, format!("expected 2 columns, found {}", fields.len())));
            }
            let prefix = normalize_prefix(fields[0].trim());
            let id = fields[1].trim().to_string();
            if prefix.is_empty() || id.is_empty() {
                return Err((idx + 1, "empty prefix or identifier".to_string()));
            }
            entries.push((prefix, id));
        }

        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifier for a file name, if any prefix matches it.
    pub fn lookup(&self, file_name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(prefix, _)| file_name.starts_with(prefix.as_str()))
            .map(|(_, id)| id.as_str())
    }

    /// Attaches `param=<identifier>` to every task whose file name matches.
    ///
    /// Returns `(classified, unmatched)`; unmatched tasks are left untouched.
    pub fn classify(&self, tasks: Vec<Task>, param: &str) -> (Vec<Task>, Vec<Task>) {
        let mut classified = Vec::with_capacity(tasks.len());
        let mut unmatched = Vec::new();

        for task in tasks {
            match self.lookup(&task.key().file_name()) {
                Some(id) => {
                    let id = id.to_string();
                    classified.push(task.with_query_param(param, id));
                }
                None => unmatched.push(task),
            }
        }

        (classified, unmatched)
    }
}

pub fn normalize_prefix(prefix: &str) -> String {
    prefix.replace(&SEPARATOR_CHARS[..], "-")
}

/// Splits one CSV line, honoring double-quoted fields with `""` escapes.
fn split_record(line: &str) -> std::result::Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(field);
    Ok(fields)
}
