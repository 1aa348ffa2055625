//! Time-partitioned index naming for the remote sink

use crate::errors::{Result, ShipperError};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};

pub const DEFAULT_INDEX_TEMPLATE: &str = "{application}-{environment}-{date:%Y-%m}";

const DEFAULT_DATE_FORMAT: &str = "%Y-%m";
const MAX_INDEX_NAME_BYTES: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Application,
    Environment,
    Date(String),
}

/// Parsed index template, e.g. `{application}-{environment}-{date:%Y-%m}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl IndexTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let close = rest[open..]
                .find('}')
                .map(|offset| open + offset)
                .ok_or_else(|| ShipperError::IndexTemplate(format!("unclosed placeholder in '{}'", template)))?;

            let placeholder = &rest[open + 1..close];
            segments.push(parse_placeholder(placeholder, template)?);
            rest = &rest[close + 1..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        if segments.is_empty() {
            return Err(ShipperError::IndexTemplate("template is empty".to_string()));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render and normalize the index name for one event.
    pub fn render(&self, application: &str, environment: &str, timestamp: DateTime<Utc>) -> String {
        let raw: String = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.clone(),
                Segment::Application => application.to_string(),
                Segment::Environment => environment.to_string(),
                Segment::Date(format) => timestamp.format(format).to_string(),
            })
            .collect();

        normalize_index_name(&raw)
    }
}

impl Default for IndexTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_INDEX_TEMPLATE.to_string(),
            segments: vec![
                Segment::Application,
                Segment::Literal("-".to_string()),
                Segment::Environment,
                Segment::Literal("-".to_string()),
                Segment::Date(DEFAULT_DATE_FORMAT.to_string()),
            ],
        }
    }
}

fn parse_placeholder(placeholder: &str, template: &str) -> Result<Segment> {
    let (name, format) = match placeholder.split_once(':') {
        Some((name, format)) => (name.trim(), Some(format)),
        None => (placeholder.trim(), None),
    };

    match (name, format) {
        ("application", None) => Ok(Segment::Application),
        ("environment", None) => Ok(Segment::Environment),
        ("date", None) => Ok(Segment::Date(DEFAULT_DATE_FORMAT.to_string())),
        ("date", Some(format)) => {
            if format.is_empty() || StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
                return Err(ShipperError::IndexTemplate(format!(
                    "invalid date format '{}' in '{}'",
                    format, template
                )));
            }
            Ok(Segment::Date(format.to_string()))
        }
        _ => Err(ShipperError::IndexTemplate(format!(
            "unknown placeholder '{{{}}}' in '{}'",
            placeholder, template
        ))),
    }
}

/// Lowercase and replace characters the backend refuses in index names.
pub fn normalize_index_name(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            '\\' | '/' | '*' | '?' | '"' | '<' | '>' | '|' | ',' | '#' | ':' | '.' => '-',
            c if c.is_whitespace() => '-',
            c => c,
        })
        .collect();

    let trimmed = mapped.trim_start_matches(['-', '_', '+']);
    if trimmed.is_empty() {
        return "logs".to_string();
    }

    let mut name = trimmed.to_string();
    if name.len() > MAX_INDEX_NAME_BYTES {
        let mut cut = MAX_INDEX_NAME_BYTES;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}
