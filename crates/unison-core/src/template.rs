//! `${name}` placeholder substitution.
//!
//! A template that is exactly one placeholder keeps the type of the context
//! value it resolves to, so `"${port}"` against `{port: 502}` yields the
//! integer `502`. Placeholders embedded in a longer string are replaced by the
//! value's string form. Lists and maps are resolved element by element.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::value::Value;

/// Context a template is resolved against.
pub type Context = BTreeMap<String, Value>;

/// Resolve a template, leaving unknown placeholders as literal text.
pub fn resolve(template: &Value, context: &Context) -> Value {
    let mut missing = Vec::new();
    resolve_value(template, context, &mut missing)
}

/// Resolve a template, failing with every unresolved key when any is missing.
pub fn resolve_strict(template: &Value, context: &Context) -> Result<Value> {
    let mut missing = Vec::new();
    let resolved = resolve_value(template, context, &mut missing);
    if missing.is_empty() {
        return Ok(resolved);
    }
    missing.sort();
    missing.dedup();
    Err(Error::invalid(format!(
        "unresolved template keys: {}",
        missing.join(", ")
    )))
}

/// Resolve a plain string template.
pub fn resolve_str(template: &str, context: &Context) -> Value {
    let mut missing = Vec::new();
    resolve_string(template, context, &mut missing)
}

/// Names of every placeholder in a template, in order of appearance.
pub fn placeholders(template: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect(template, &mut names);
    names
}

/// True when the template contains at least one placeholder.
pub fn is_templated(template: &Value) -> bool {
    !placeholders(template).is_empty()
}

fn collect(template: &Value, names: &mut Vec<String>) {
    match template {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some((name, tail)) = next_placeholder(rest) {
                names.push(name.to_string());
                rest = tail;
            }
        }
        Value::List(items) => items.iter().for_each(|v| collect(v, names)),
        Value::Map(map) => map.values().for_each(|v| collect(v, names)),
        _ => {}
    }
}

fn resolve_value(template: &Value, context: &Context, missing: &mut Vec<String>) -> Value {
    match template {
        Value::String(s) => resolve_string(s, context, missing),
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|v| resolve_value(v, context, missing))
                .collect(),
        ),
        Value::Map(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, context, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(template: &str, context: &Context, missing: &mut Vec<String>) -> Value {
    if let Some(name) = whole_placeholder(template) {
        return match context.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.push(name.to_string());
                Value::String(template.to_string())
            }
        };
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after[..end].trim();
        match context.get(name) {
            Some(value) => out.push_str(&value.to_text()),
            None => {
                missing.push(name.to_string());
                out.push_str(&rest[start..start + end + 3]);
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Value::String(out)
}

/// Placeholder name when the template is a single `${name}` and nothing else.
fn whole_placeholder(template: &str) -> Option<&str> {
    let inner = template.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains('}') || inner.contains("${") {
        return None;
    }
    Some(inner.trim())
}

fn next_placeholder(s: &str) -> Option<(&str, &str)> {
    let start = s.find("${")?;
    let after = &s[start + 2..];
    let end = after.find('}')?;
    Some((after[..end].trim(), &after[end + 1..]))
}
