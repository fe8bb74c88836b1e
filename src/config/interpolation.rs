//! Environment variable interpolation over raw manifest trees.
//!
//! Runs after YAML parsing and before validation. The scan is a single
//! left-to-right pass per string:
//!
//! - `$$` produces a literal `$`
//! - `$NAME` and `${NAME}` substitute the variable's value
//! - `${NAME:-default}` falls back when the variable is unset or empty
//! - `${NAME-default}` falls back only when the variable is unset
//!
//! Default values are themselves interpolated, so `${A:-${B}}` works. An
//! unset variable without a default substitutes the empty string and logs a
//! warning. Any other `$` form is a manifest error.

use serde_yaml::Value;

use crate::error::{Error, Result};

/// Variable lookup backing interpolation. The service name is supplied so
/// lookups can specialise per service (the process-env and map lookups
/// ignore it).
pub trait EnvironmentLookup: Send + Sync {
    fn lookup(&self, name: &str, service: Option<&str>) -> Option<String>;
}

/// Lookup over the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvironmentLookup for ProcessEnv {
    fn lookup(&self, name: &str, _service: Option<&str>) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Map-backed lookup, used by tests and by the `.env` composite.
#[derive(Debug, Clone, Default)]
pub struct MapEnv(pub std::collections::HashMap<String, String>);

impl MapEnv {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        MapEnv(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl EnvironmentLookup for MapEnv {
    fn lookup(&self, name: &str, _service: Option<&str>) -> Option<String> {
        self.0.get(name).cloned()
    }
}

/// Chains lookups; the first one returning a value wins.
pub struct ChainedEnv(pub Vec<Box<dyn EnvironmentLookup>>);

impl EnvironmentLookup for ChainedEnv {
    fn lookup(&self, name: &str, service: Option<&str>) -> Option<String> {
        self.0.iter().find_map(|l| l.lookup(name, service))
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Interpolate every string scalar in the tree, recursing through
/// sequences and mapping values (mapping keys are left untouched).
pub fn interpolate_value(
    value: &mut Value,
    lookup: &dyn EnvironmentLookup,
    service: Option<&str>,
    path: &str,
) -> Result<()> {
    match value {
        Value::String(s) => {
            *s = interpolate_line(s, lookup, service).map_err(|reason| {
                Error::InvalidManifest(format!("{path}: invalid interpolation format: {reason}"))
            })?;
        }
        Value::Sequence(seq) => {
            for (i, item) in seq.iter_mut().enumerate() {
                interpolate_value(item, lookup, service, &format!("{path}[{i}]"))?;
            }
        }
        Value::Mapping(map) => {
            for (key, item) in map.iter_mut() {
                let segment = key.as_str().unwrap_or("?");
                interpolate_value(item, lookup, service, &format!("{path}.{segment}"))?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Interpolate a single string. Errors carry the human-readable reason; the
/// caller attaches the manifest path.
pub fn interpolate_line(
    line: &str,
    lookup: &dyn EnvironmentLookup,
    service: Option<&str>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(line.len());
    let chars: Vec<char> = line.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        if c != '$' {
            out.push(c);
            pos += 1;
            continue;
        }

        let Some(&next) = chars.get(pos + 1) else {
            return Err("line ends with a bare '$'".to_string());
        };

        match next {
            '$' => {
                out.push('$');
                pos += 2;
            }
            '{' => {
                let (replaced, consumed) =
                    parse_braced(&chars[pos + 2..], lookup, service).map_err(|e| {
                        format!("{e} in {line:?}")
                    })?;
                out.push_str(&replaced);
                pos += 2 + consumed;
            }
            c if is_name_start(c) => {
                let mut end = pos + 1;
                while end < chars.len() && is_name_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[pos + 1..end].iter().collect();
                out.push_str(&resolve(&name, None, false, lookup, service)?);
                pos = end;
            }
            _ => return Err(format!("unexpected character after '$' in {line:?}")),
        }
    }

    Ok(out)
}

/// Parse the inside of a `${...}` expression starting just past the brace.
/// Returns the substitution and the number of characters consumed,
/// including the closing brace.
fn parse_braced(
    chars: &[char],
    lookup: &dyn EnvironmentLookup,
    service: Option<&str>,
) -> std::result::Result<(String, usize), String> {
    let mut pos = 0;
    while pos < chars.len() && is_name_char(chars[pos]) {
        pos += 1;
    }
    let name: String = chars[..pos].iter().collect();
    if name.is_empty() || name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return Err("empty or malformed variable name in ${...}".to_string());
    }

    match chars.get(pos) {
        Some('}') => {
            let value = resolve(&name, None, false, lookup, service)?;
            Ok((value, pos + 1))
        }
        Some(':') if chars.get(pos + 1) == Some(&'-') => {
            let (default, end) = read_default(&chars[pos + 2..])?;
            let default = interpolate_line(&default, lookup, service)?;
            let value = resolve(&name, Some(&default), true, lookup, service)?;
            Ok((value, pos + 2 + end))
        }
        Some('-') => {
            let (default, end) = read_default(&chars[pos + 1..])?;
            let default = interpolate_line(&default, lookup, service)?;
            let value = resolve(&name, Some(&default), false, lookup, service)?;
            Ok((value, pos + 1 + end))
        }
        _ => Err(format!("unterminated or malformed ${{{name}...}}")),
    }
}

/// Read a default value up to the matching close brace, tracking nested
/// `${...}` so defaults may themselves contain substitutions. Returns the
/// raw default and the consumed length including the close brace.
fn read_default(chars: &[char]) -> std::result::Result<(String, usize), String> {
    let mut depth = 0usize;
    let mut out = String::new();
    let mut pos = 0;
    while pos < chars.len() {
        let c = chars[pos];
        match c {
            '$' if chars.get(pos + 1) == Some(&'{') => {
                depth += 1;
                out.push('$');
                out.push('{');
                pos += 2;
                continue;
            }
            '}' if depth > 0 => depth -= 1,
            '}' => return Ok((out, pos + 1)),
            _ => {}
        }
        out.push(c);
        pos += 1;
    }
    Err("unterminated default value in ${...}".to_string())
}

fn resolve(
    name: &str,
    default: Option<&str>,
    default_on_empty: bool,
    lookup: &dyn EnvironmentLookup,
    service: Option<&str>,
) -> std::result::Result<String, String> {
    match lookup.lookup(name, service) {
        Some(value) if value.is_empty() && default_on_empty => {
            Ok(default.unwrap_or_default().to_string())
        }
        Some(value) => Ok(value),
        None => match default {
            Some(default) => Ok(default.to_string()),
            None => {
                tracing::warn!(
                    variable = name,
                    "variable is not set, substituting an empty string"
                );
                Ok(String::new())
            }
        },
    }
}
