//! Minimum level filtering with per-namespace overrides

use crate::event::LogLevel;

/// Decides whether an event enters the pipeline at all.
///
/// Overrides apply to a source context equal to the namespace or nested under
/// it (`Microsoft` covers `Microsoft.AspNetCore.Routing`); the longest
/// matching namespace wins.
#[derive(Debug, Clone)]
pub struct LevelFilter {
    minimum: LogLevel,
    overrides: Vec<(String, LogLevel)>,
}

impl LevelFilter {
    pub fn new(minimum: LogLevel, overrides: Vec<(String, LogLevel)>) -> Self {
        let mut overrides = overrides;
        overrides.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { minimum, overrides }
    }

    pub fn minimum_for(&self, source_context: Option<&str>) -> LogLevel {
        let Some(context) = source_context else {
            return self.minimum;
        };

        self.overrides
            .iter()
            .find(|(namespace, _)| {
                context == namespace
                    || (context.starts_with(namespace.as_str())
                        && context[namespace.len()..].starts_with('.'))
            })
            .map(|(_, level)| *level)
            .unwrap_or(self.minimum)
    }

    pub fn is_enabled(&self, level: LogLevel, source_context: Option<&str>) -> bool {
        level >= self.minimum_for(source_context)
    }
}

/// Parse `Namespace=Level,Other.Namespace=Level`.
pub fn parse_overrides(raw: &str) -> Result<Vec<(String, LogLevel)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (namespace, level) = entry
                .split_once('=')
                .ok_or_else(|| format!("level override '{}' is not Namespace=Level", entry))?;
            let level = LogLevel::parse(level)
                .ok_or_else(|| format!("unknown level '{}' in override '{}'", level.trim(), entry))?;
            Ok((namespace.trim().to_string(), level))
        })
        .collect()
}
