//! Structured payload extraction: RFC 6901 pointers and a small JSONPath subset.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::value::Value;

use super::Codec;

/// Parse a string payload holding a JSON object or array; leave anything else alone.
fn parse_document(raw: Value) -> Value {
    match raw {
        Value::String(s) => {
            let trimmed = s.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&s) {
                    return json.into();
                }
            }
            Value::String(s)
        }
        Value::Bytes(b) => match serde_json::from_slice::<serde_json::Value>(&b) {
            Ok(json) => json.into(),
            Err(_) => Value::Bytes(b),
        },
        other => other,
    }
}

/// RFC 6901 JSON pointer (`""` addresses the whole document).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPointer {
    pointer: String,
    tokens: Vec<String>,
}

impl JsonPointer {
    pub fn parse(pointer: &str) -> Result<Self> {
        if pointer.is_empty() {
            return Ok(Self {
                pointer: String::new(),
                tokens: Vec::new(),
            });
        }
        let Some(body) = pointer.strip_prefix('/') else {
            return Err(Error::invalid(format!(
                "json pointer must be empty or start with '/', got '{pointer}'"
            )));
        };
        let tokens = body
            .split('/')
            .map(|t| t.replace("~1", "/").replace("~0", "~"))
            .collect();
        Ok(Self {
            pointer: pointer.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pointer
    }

    /// Resolve the pointer against a document.
    pub fn get<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.tokens.iter().try_fold(document, |node, token| match node {
            Value::Map(map) => map.get(token),
            Value::List(items) => token.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

impl Codec for JsonPointer {
    fn decode(&self, raw: Value) -> Result<Value> {
        let document = parse_document(raw);
        self.get(&document)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("json pointer '{}'", self.pointer)))
    }

    /// Build the smallest document in which the pointer resolves to `value`.
    fn encode(&self, value: Value) -> Result<Value> {
        Ok(self.tokens.iter().rev().fold(value, |inner, token| {
            match token.parse::<usize>() {
                Ok(index) if index < 1024 => {
                    let mut items = vec![Value::Null; index];
                    items.push(inner);
                    Value::List(items)
                }
                _ => {
                    let mut map = BTreeMap::new();
                    map.insert(token.clone(), inner);
                    Value::Map(map)
                }
            }
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(i64),
}

/// JSONPath subset: `$`, `.key`, `['key']`, `[index]`, `[-index]`.
///
/// Encoding is passthrough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    expr: String,
    segments: Vec<PathSegment>,
}

impl JsonPath {
    pub fn parse(expr: &str) -> Result<Self> {
        let malformed = |why: &str| Error::invalid(format!("invalid json path '{expr}': {why}"));
        let Some(mut rest) = expr.trim().strip_prefix('$') else {
            return Err(malformed("must start with '$'"));
        };

        let mut segments = Vec::new();
        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after.find(|c| c == '.' || c == '[').unwrap_or(after.len());
                let key = &after[..end];
                if key.is_empty() {
                    return Err(malformed("empty key"));
                }
                segments.push(PathSegment::Key(key.to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(|| malformed("unclosed '['"))?;
                let inner = after[..end].trim();
                let quoted = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
                let segment = match quoted {
                    Some(key) => PathSegment::Key(key.to_string()),
                    None => PathSegment::Index(
                        inner
                            .parse()
                            .map_err(|_| malformed("bracket must hold an index or quoted key"))?,
                    ),
                };
                segments.push(segment);
                rest = &after[end + 1..];
            } else {
                return Err(malformed("expected '.' or '['"));
            }
        }

        Ok(Self {
            expr: expr.to_string(),
            segments,
        })
    }

    pub fn get<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(document, |node, segment| match (segment, node) {
                (PathSegment::Key(key), Value::Map(map)) => map.get(key),
                (PathSegment::Index(i), Value::List(items)) => {
                    let index = if *i < 0 { items.len() as i64 + i } else { *i };
                    usize::try_from(index).ok().and_then(|i| items.get(i))
                }
                _ => None,
            })
    }
}

impl Codec for JsonPath {
    fn decode(&self, raw: Value) -> Result<Value> {
        let document = parse_document(raw);
        self.get(&document)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("json path '{}'", self.expr)))
    }
}
