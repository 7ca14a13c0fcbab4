use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One validated script line awaiting synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Stable key for the cache and history. Equal to the de-duplicated filename.
    pub id: String,
    /// Position in submission order, starting at 0.
    pub index: usize,
    /// 1-based line number in the raw script.
    pub line: usize,
    pub character: String,
    pub text: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("Line {line}: {reason} ({raw:?})")]
    MalformedLine {
        line: usize,
        raw: String,
        reason: String,
    },
}

#[derive(Debug, Default, Clone)]
pub struct ParsedScript {
    pub jobs: Vec<Job>,
    pub errors: Vec<ScriptError>,
}

impl ParsedScript {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parses `Character | Text | Filename` lines. Bad lines are collected as
/// errors and never stop later lines from being parsed.
pub fn parse_script(raw: &str) -> ParsedScript {
    let mut parsed = ParsedScript::default();
    let mut taken = HashSet::new();

    for (i, line) in raw.lines().enumerate() {
        let line_no = i + 1;
        if line.trim().is_empty() {
            continue;
        }

        let malformed = |reason: &str| ScriptError::MalformedLine {
            line: line_no,
            raw: line.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = line.split('|').map(str::trim).collect();
        if parts.len() != 3 {
            parsed.errors.push(malformed(&format!(
                "expected 3 fields separated by '|', found {}",
                parts.len()
            )));
            continue;
        }

        let (character, text, filename) = (parts[0], parts[1], parts[2]);
        if character.is_empty() {
            parsed.errors.push(malformed("empty character name"));
            continue;
        }
        if text.is_empty() {
            parsed.errors.push(malformed("empty text"));
            continue;
        }

        let base = sanitize_filename(filename);
        if base.is_empty() {
            parsed.errors.push(malformed("filename has no usable characters"));
            continue;
        }

        let unique = disambiguate(&base, &taken);
        taken.insert(unique.clone());

        parsed.jobs.push(Job {
            id: unique.clone(),
            index: parsed.jobs.len(),
            line: line_no,
            character: character.to_string(),
            text: text.to_string(),
            filename: unique,
        });
    }

    parsed
}

/// Keeps letters, digits, `-`, `_` and `.`; everything else becomes `_`.
/// A trailing `.wav` is dropped since exports add it back.
pub fn sanitize_filename(name: &str) -> String {
    let name = name.trim();
    let stem = match name.len().checked_sub(4) {
        Some(cut) if name.is_char_boundary(cut) && name[cut..].eq_ignore_ascii_case(".wav") => {
            &name[..cut]
        }
        _ => name,
    };

    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = sanitized.trim_start_matches('.').trim_end_matches('.');
    if trimmed.chars().all(|c| c == '_') {
        return String::new();
    }
    trimmed.to_string()
}

fn disambiguate(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
