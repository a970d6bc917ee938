//! Parsers turning a pulled body into raw feed entries.

use serde_json::Value;
use threatfeed_controller_k8s_api::threat_feed::{CsvFormat, ThreatFeedFormat};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("CSV header has no column named {0:?}")]
    MissingColumn(String),

    #[error("CSV record {record} has {found} fields, expected {expected}")]
    RecordSize {
        record: usize,
        expected: usize,
        found: usize,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid JSONPath {path:?}: {reason}")]
    JsonPath { path: String, reason: &'static str },
}

/// Extracts the entries from `body` in the given format. An unset format is
/// newline-delimited.
pub fn parse(format: &ThreatFeedFormat, body: &[u8]) -> Result<Vec<String>, ParseError> {
    if let Some(json) = &format.json {
        return parse_json(&json.path, body);
    }
    if let Some(csv) = &format.csv {
        return parse_csv(csv, body);
    }
    Ok(parse_newline_delimited(body))
}

/// Returns one entry per line, ignoring anything after a `#` and blank
/// lines.
pub fn parse_newline_delimited(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| {
            let entry = line.split('#').next().unwrap_or_default().trim();
            (!entry.is_empty()).then(|| entry.to_string())
        })
        .collect()
}

fn first_byte(s: Option<&str>, default: u8) -> u8 {
    s.and_then(|s| s.bytes().next()).unwrap_or(default)
}

pub fn parse_csv(format: &CsvFormat, body: &[u8]) -> Result<Vec<String>, ParseError> {
    let validate = !format.disable_record_size_validation;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(first_byte(format.column_delimiter.as_deref(), b','))
        .comment(Some(first_byte(format.comment_delimiter.as_deref(), b'#')))
        .has_headers(format.field_name.is_some())
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body);

    let column = match &format.field_name {
        Some(name) => reader
            .headers()?
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| ParseError::MissingColumn(name.clone()))?,
        None => format.field_num.unwrap_or(0) as usize,
    };

    let mut expected = match format.record_size {
        0 => None,
        n => Some(n as usize),
    };
    let mut entries = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        if validate {
            let expected = *expected.get_or_insert(record.len());
            if record.len() != expected {
                return Err(ParseError::RecordSize {
                    record: i + 1,
                    expected,
                    found: record.len(),
                });
            }
        }
        if let Some(entry) = record.get(column).filter(|e| !e.is_empty()) {
            entries.push(entry.to_string());
        }
    }
    Ok(entries)
}

pub fn parse_json(path: &str, body: &[u8]) -> Result<Vec<String>, ParseError> {
    let steps = compile_path(path)?;
    let doc = serde_json::from_slice::<Value>(body)?;

    let mut nodes = vec![&doc];
    for step in &steps {
        nodes = nodes
            .into_iter()
            .flat_map(|node| step.select(node))
            .collect();
    }

    let mut entries = Vec::new();
    for node in nodes {
        match node {
            Value::String(s) => entries.push(s.clone()),
            Value::Array(items) => {
                entries.extend(items.iter().filter_map(|i| i.as_str()).map(str::to_string))
            }
            _ => {}
        }
    }
    Ok(entries)
}

#[derive(Debug, PartialEq)]
enum Step {
    Field(String),
    Index(usize),
    Wildcard,
}

impl Step {
    fn select<'v>(&self, node: &'v Value) -> Vec<&'v Value> {
        match (self, node) {
            (Step::Field(name), Value::Object(map)) => map.get(name).into_iter().collect(),
            (Step::Index(i), Value::Array(items)) => items.get(*i).into_iter().collect(),
            (Step::Wildcard, Value::Array(items)) => items.iter().collect(),
            (Step::Wildcard, Value::Object(map)) => map.values().collect(),
            _ => Vec::new(),
        }
    }
}

/// Compiles a JSONPath in either Kubernetes (`{.items[*].ip}`) or `$`-rooted
/// (`$.items[*].ip`) notation.
fn compile_path(path: &str) -> Result<Vec<Step>, ParseError> {
    let err = |reason| ParseError::JsonPath {
        path: path.to_string(),
        reason,
    };

    let mut rest = path.trim();
    if let Some(inner) = rest.strip_prefix('{') {
        rest = inner.strip_suffix('}').ok_or_else(|| err("unterminated '{'"))?;
    }
    rest = rest.strip_prefix('$').unwrap_or(rest);

    let mut steps = Vec::new();
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix('.') {
            let end = tail.find(['.', '[']).unwrap_or(tail.len());
            let (name, tail) = tail.split_at(end);
            match name {
                "" if tail.is_empty() => {}
                "" => return Err(err("empty field name")),
                "*" => steps.push(Step::Wildcard),
                name => steps.push(Step::Field(name.to_string())),
            }
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix('[') {
            let end = tail.find(']').ok_or_else(|| err("unterminated '['"))?;
            let selector = tail[..end].trim();
            steps.push(match selector {
                "*" => Step::Wildcard,
                s if s.starts_with(['\'', '"']) => {
                    Step::Field(s.trim_matches(['\'', '"']).to_string())
                }
                s => Step::Index(s.parse().map_err(|_| err("invalid index"))?),
            });
            rest = &tail[end + 1..];
        } else {
            return Err(err("expected '.' or '['"));
        }
    }
    Ok(steps)
}
